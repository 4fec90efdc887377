//! Line-offset continuity for a job's event stream.
//!
//! Sorted by `counter`, each event must start where the previous one ended:
//! `event[i].end_line == event[i + 1].start_line`.

use crate::event::Event;

/// Tracks the next expected offset of one job's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChain {
    next_line: u64,
    last_counter: Option<u64>,
    length: u64,
}

impl LineChain {
    /// Create a chain expecting the first event at line 0
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a chain expecting the first event at `line`
    #[must_use]
    pub fn starting_at(line: u64) -> Self {
        Self {
            next_line: line,
            last_counter: None,
            length: 0,
        }
    }

    /// Append the next event
    ///
    /// # Errors
    ///
    /// Returns error if the event does not continue the chain
    pub fn push(&mut self, event: &Event) -> Result<(), ChainError> {
        if let Some(last) = self.last_counter {
            if event.counter <= last {
                return Err(ChainError::OutOfOrder {
                    position: self.length,
                    previous: last,
                    counter: event.counter,
                });
            }
        }
        if event.start_line != self.next_line {
            return Err(ChainError::Gap {
                position: self.length,
                expected: self.next_line,
                actual: event.start_line,
            });
        }
        if event.end_line < event.start_line {
            return Err(ChainError::Inverted {
                position: self.length,
            });
        }
        self.next_line = event.end_line;
        self.last_counter = Some(event.counter);
        self.length += 1;
        Ok(())
    }

    /// Offset the next event must start at
    #[must_use]
    pub fn next_line(&self) -> u64 {
        self.next_line
    }

    /// Number of events accepted
    #[must_use]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Check if no event was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl Default for LineChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuity errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Offsets do not meet
    Gap {
        /// Index in counter order
        position: u64,
        /// Offset the event should start at
        expected: u64,
        /// Offset it starts at
        actual: u64,
    },
    /// Counter did not increase
    OutOfOrder {
        /// Index in counter order
        position: u64,
        /// Counter of the previous event
        previous: u64,
        /// Counter of this event
        counter: u64,
    },
    /// `end_line` before `start_line`
    Inverted {
        /// Index in counter order
        position: u64,
    },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gap {
                position,
                expected,
                actual,
            } => write!(
                f,
                "line gap at position {}: expected start {}, got {}",
                position, expected, actual
            ),
            Self::OutOfOrder {
                position,
                previous,
                counter,
            } => write!(
                f,
                "counter {} at position {} does not follow {}",
                counter, position, previous
            ),
            Self::Inverted { position } => {
                write!(f, "inverted line range at position {}", position)
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// Sort events by counter and check their offsets are contiguous
///
/// # Errors
///
/// Returns the first continuity violation
pub fn validate_contiguous(events: &[Event]) -> Result<(), ChainError> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by_key(|e| e.counter);
    let Some(first) = sorted.first() else {
        return Ok(());
    };
    let mut chain = LineChain::starting_at(first.start_line);
    for event in sorted {
        chain.push(event)?;
    }
    Ok(())
}
