//! Reverse tunnel ports.
//!
//! Pull-mode backups forward the repository into the client over
//! `ssh -R`. Two concurrent jobs on the same host must not bind the same
//! remote port, so every running job leases its port from one pool. A lease
//! is returned when dropped.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// First port handed out
pub const TUNNEL_BASE_PORT: u16 = 40000;

/// Number of ports in the default pool
pub const TUNNEL_PORT_SPAN: u16 = 10000;

/// Pool of remote ports for reverse tunnels
#[derive(Debug, Clone)]
pub struct TunnelPorts {
    base: u16,
    span: u16,
    leased: Arc<Mutex<BTreeSet<u16>>>,
}

impl Default for TunnelPorts {
    fn default() -> Self {
        Self::new(TUNNEL_BASE_PORT, TUNNEL_PORT_SPAN)
    }
}

impl TunnelPorts {
    /// Pool of `span` ports starting at `base`
    #[must_use]
    pub fn new(base: u16, span: u16) -> Self {
        let span = span.clamp(1, u16::MAX - base.min(u16::MAX - 1));
        Self {
            base,
            span,
            leased: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Lease a free port, preferring the slot `hint` maps to
    ///
    /// Walks forward from the preferred slot and wraps around. Returns
    /// `None` when every port is leased.
    #[must_use]
    pub fn lease(&self, hint: u64) -> Option<TunnelLease> {
        let mut leased = self.leased.lock().unwrap_or_else(PoisonError::into_inner);
        let start = hint % u64::from(self.span);
        let port = (0..u64::from(self.span))
            .map(|step| self.port_at((start + step) % u64::from(self.span)))
            .find(|port| !leased.contains(port))?;
        leased.insert(port);
        Some(TunnelLease {
            port,
            leased: Arc::clone(&self.leased),
        })
    }

    /// Ports currently leased
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.leased.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn port_at(&self, slot: u64) -> u16 {
        // span is clamped so base + slot fits
        self.base.saturating_add(u16::try_from(slot).unwrap_or(u16::MAX))
    }
}

/// A leased tunnel port, released on drop
#[derive(Debug)]
pub struct TunnelLease {
    port: u16,
    leased: Arc<Mutex<BTreeSet<u16>>>,
}

impl TunnelLease {
    /// The leased port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_prefers_hint_slot() {
        let pool = TunnelPorts::default();
        let lease = pool.lease(42).unwrap();
        assert_eq!(lease.port(), 40042);
    }

    #[test]
    fn test_colliding_hints_get_distinct_ports() {
        let pool = TunnelPorts::default();
        let first = pool.lease(7).unwrap();
        let second = pool.lease(10007).unwrap();
        assert_eq!(first.port(), 40007);
        assert_eq!(second.port(), 40008);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_released_port_is_reused() {
        let pool = TunnelPorts::default();
        let first = pool.lease(5).unwrap();
        drop(first);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.lease(5).unwrap().port(), 40005);
    }

    #[test]
    fn test_exhausted_pool_wraps_then_refuses() {
        let pool = TunnelPorts::new(50000, 2);
        let a = pool.lease(1).unwrap();
        let b = pool.lease(1).unwrap();
        assert_eq!((a.port(), b.port()), (50001, 50000));
        assert!(pool.lease(0).is_none());
    }
}
