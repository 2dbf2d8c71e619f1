//! Per-chunk delivery state machine and retry policy.
//!
//! Every chunk walks through:
//!
//!   Pending → Attempting(node, n) → Delivered
//!                    │
//!                    └─ failure → (backoff) → Attempting(next node, n+1)
//!                                         … → PermanentlyFailed
//!
//! Node selection is round-robin keyed by attempt number: attempt 0 goes to
//! node 0, attempt 1 to node 1, wrapping. Two backoff curves exist:
//!   transport failure:  attempt² × unit   (connect refused, I/O, deadline)
//!   rejection or RPC:   attempt  × unit   (receiver said no, bad response)
//!
//! The machine never sleeps or does I/O itself; the caller drives it.

use std::time::Duration;

/// Attempts per chunk before it is declared permanently failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// One backoff step.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempts`-th failure when the node was unreachable.
    pub fn transport_backoff(&self, failed_attempts: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(failed_attempts.saturating_mul(failed_attempts))
    }

    /// Delay after the `failed_attempts`-th failure when the node answered but refused.
    pub fn rejection_backoff(&self, failed_attempts: u32) -> Duration {
        self.backoff_unit.saturating_mul(failed_attempts)
    }
}

/// Result of one delivery attempt, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// Connection failure, I/O failure, or per-call deadline exceeded.
    TransportFailed(String),
    /// Delivered but refused, or any RPC-level error.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Attempting { node: usize, attempt: u32 },
    Delivered { attempts: u32 },
    PermanentlyFailed { attempts: u32, last_error: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered { .. } | DeliveryState::PermanentlyFailed { .. }
        )
    }
}

/// What the caller should do after reporting an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Delivered,
    /// Sleep for `backoff`, then call `begin_attempt` again.
    Retry { backoff: Duration },
    Exhausted,
}

/// Drives one chunk's delivery.
#[derive(Debug, Clone)]
pub struct DeliveryMachine {
    policy: RetryPolicy,
    node_count: usize,
    state: DeliveryState,
    attempts: u32,
    last_error: Option<String>,
}

impl DeliveryMachine {
    /// `node_count` must be non-zero; the dispatch engine rejects an empty
    /// node list before any machine is built.
    pub fn new(policy: RetryPolicy, node_count: usize) -> Self {
        debug_assert!(node_count > 0, "delivery machine needs at least one node");
        Self {
            policy,
            node_count: node_count.max(1),
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Move to `Attempting` and return the node index to try.
    ///
    /// Returns `None` once the machine is terminal.
    pub fn begin_attempt(&mut self) -> Option<usize> {
        match self.state {
            DeliveryState::Pending | DeliveryState::Attempting { .. } => {
                let node = self.attempts as usize % self.node_count;
                self.state = DeliveryState::Attempting {
                    node,
                    attempt: self.attempts,
                };
                Some(node)
            }
            DeliveryState::Delivered { .. } | DeliveryState::PermanentlyFailed { .. } => None,
        }
    }

    /// Record the outcome of the attempt started by `begin_attempt`.
    pub fn complete(&mut self, outcome: AttemptOutcome) -> Transition {
        let (error, heavy) = match outcome {
            AttemptOutcome::Delivered => {
                self.state = DeliveryState::Delivered {
                    attempts: self.attempts + 1,
                };
                return Transition::Delivered;
            }
            AttemptOutcome::TransportFailed(e) => (e, true),
            AttemptOutcome::Rejected(e) => (e, false),
        };

        self.attempts += 1;
        self.last_error = Some(error.clone());

        if self.attempts >= self.policy.max_attempts {
            self.state = DeliveryState::PermanentlyFailed {
                attempts: self.attempts,
                last_error: error,
            };
            return Transition::Exhausted;
        }

        let backoff = if heavy {
            self.policy.transport_backoff(self.attempts)
        } else {
            self.policy.rejection_backoff(self.attempts)
        };
        Transition::Retry { backoff }
    }
}
