//! Transactions: locking, deadlock detection, multi-versioning, and the
//! per-transaction state machine with two-phase commit.

pub mod deadlock;
pub mod locks;
pub mod manager;
pub mod mvcc;
pub mod twopc;

pub use deadlock::{DeadlockDetector, WaitForGraph};
pub use locks::{CancelToken, LockManager, LockMode};
pub use manager::{Transaction, TransactionManager, TxConfig};
pub use mvcc::{Version, VersionManager};
pub use twopc::{Coordinator, Participant, ParticipantStatus};

/// Isolation level of a transaction. The default is the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Levels that read from a snapshot captured at first read.
    #[must_use]
    pub const fn uses_snapshot(self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Serializable)
    }
}

/// Transaction lifecycle. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committed,
    Aborted,
}
