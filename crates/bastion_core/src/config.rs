//! Configuration records read by the core.
//!
//! Policies, clients and repositories are managed elsewhere; the scheduler
//! and executor only read them. Credentials are a typed record with named
//! optional fields plus an explicit overflow map.

use crate::id::{ClientId, PolicyId, RepositoryId};
use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a policy backs up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Files and directories on the client
    Filesystem,
    /// Virtual machine disks exported through the hypervisor
    Vm,
    /// Database dumps produced on the client
    Database,
}

/// Where borg runs relative to the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Client runs borg and pushes to the repository over ssh
    Push,
    /// Server pulls client data through a reverse tunnel
    Pull,
}

/// Retention counts for pruning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Hourly archives to keep
    #[serde(default)]
    pub keep_hourly: Option<u32>,
    /// Daily archives to keep
    #[serde(default)]
    pub keep_daily: Option<u32>,
    /// Weekly archives to keep
    #[serde(default)]
    pub keep_weekly: Option<u32>,
    /// Monthly archives to keep
    #[serde(default)]
    pub keep_monthly: Option<u32>,
    /// Yearly archives to keep
    #[serde(default)]
    pub keep_yearly: Option<u32>,
}

impl Retention {
    /// Whether any retention count is configured
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flags().next().is_some()
    }

    /// `(flag, count)` pairs for borg prune
    pub fn flags(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        [
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ]
        .into_iter()
        .filter_map(|(flag, count)| count.filter(|c| *c > 0).map(|c| (flag, c)))
    }
}

/// Backup policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy ID
    pub id: PolicyId,
    /// Display name
    pub name: String,
    /// What is backed up
    pub policy_type: PolicyType,
    /// Disabled policies expand to nothing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target repository
    pub repository_id: RepositoryId,
    /// Clients covered by the policy
    #[serde(default)]
    pub client_ids: Vec<ClientId>,
    /// Retention counts
    #[serde(default, flatten)]
    pub retention: Retention,
    /// Catalog each finished backup
    #[serde(default)]
    pub catalog_enabled: bool,
    /// Prune after each backup
    #[serde(default)]
    pub auto_prune: bool,
    /// Push or pull
    #[serde(default = "default_mode")]
    pub mode: BackupMode,
    /// Paths to back up
    #[serde(default)]
    pub paths: Vec<String>,
    /// Exclude patterns
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Borg compression spec
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Dump command for database policies
    #[serde(default)]
    pub dump_command: Option<String>,
    /// Hard timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> BackupMode {
    BackupMode::Push
}

fn default_compression() -> String {
    "lz4".to_string()
}

/// Credentials for a client or repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SSH private key (PEM)
    #[serde(default)]
    pub ssh_private_key: Option<Secret>,
    /// Passphrase unlocking `ssh_private_key`
    #[serde(default)]
    pub ssh_key_passphrase: Option<Secret>,
    /// SSH password
    #[serde(default)]
    pub ssh_password: Option<Secret>,
    /// Password for `sudo` on the client
    #[serde(default)]
    pub become_password: Option<Secret>,
    /// Borg repository passphrase
    #[serde(default)]
    pub repository_passphrase: Option<Secret>,
    /// Source-specific secrets (database passwords, hypervisor tokens)
    #[serde(default)]
    pub extra: BTreeMap<String, Secret>,
}

impl Credentials {
    /// Look up an overflow secret
    #[must_use]
    pub fn extra(&self, name: &str) -> Option<&Secret> {
        self.extra.get(name)
    }
}

/// A host that is backed up (or a hypervisor host)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Client ID
    pub id: ClientId,
    /// Hostname or address
    pub hostname: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH user
    #[serde(default = "default_ssh_user")]
    pub username: String,
    /// Disabled clients are skipped by policy expansion
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Client has been prepared (borg installed, keys exchanged)
    #[serde(default)]
    pub ready: bool,
    /// Hypervisor hosting this client (VM policies)
    #[serde(default)]
    pub hypervisor_id: Option<ClientId>,
    /// Remote working directory for the bootstrap script
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    /// Credentials
    #[serde(default)]
    pub credentials: Credentials,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_remote_dir() -> String {
    "/tmp/.bastion".to_string()
}

impl Client {
    /// `user@host`
    #[must_use]
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// A borg repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Repository ID
    pub id: RepositoryId,
    /// Display name
    pub name: String,
    /// Borg repository URL (`ssh://user@host:port/path` or local path)
    pub url: String,
    /// Repository has been initialized and verified
    #[serde(default)]
    pub ready: bool,
    /// Credentials (passphrase, ssh key for the repository host)
    #[serde(default)]
    pub credentials: Credentials,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_flags_skip_unset_and_zero() {
        let retention = Retention {
            keep_daily: Some(7),
            keep_weekly: Some(0),
            ..Retention::default()
        };
        let flags: Vec<_> = retention.flags().collect();
        assert_eq!(flags, vec![("--keep-daily", 7)]);
        assert!(retention.is_set());
        assert!(!Retention::default().is_set());
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: Policy = serde_json::from_str(
            r#"{"id": 1, "name": "nightly", "policy_type": "filesystem",
                "repository_id": 2, "keep_daily": 7}"#,
        )
        .unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.mode, BackupMode::Push);
        assert_eq!(policy.retention.keep_daily, Some(7));
        assert_eq!(policy.compression, "lz4");
    }

    #[test]
    fn test_client_credentials_overflow() {
        let client: Client = serde_json::from_str(
            r#"{"id": 3, "hostname": "db1",
                "credentials": {"ssh_password": "pw", "extra": {"pg_password": "x"}}}"#,
        )
        .unwrap();
        assert_eq!(client.ssh_target(), "root@db1");
        assert_eq!(client.credentials.extra("pg_password").unwrap().expose(), "x");
        assert!(client.credentials.ssh_private_key.is_none());
    }
}
