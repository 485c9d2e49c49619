//! Two-phase commit across local participants.
//!
//! The coordinator drives Prepare on every participant; on a unanimous
//! yes it drives Commit (retrying stragglers), otherwise Abort everywhere.

use crate::errors::DbError;
use crate::txn::manager::Transaction;
use crate::txn::TxState;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Active,
    Preparing,
    Prepared,
    Committed,
    Aborted,
    /// The participant cannot be reached; its state is unknown.
    Unreachable,
}

/// A 2PC participant. Local transactions implement this directly; remote
/// resource managers would adapt it over their transport.
pub trait Participant: Send + Sync {
    /// Vote. `Ok(())` is a yes; any error is a no and the participant is
    /// expected to have aborted itself.
    ///
    /// # Errors
    /// Participant-specific; treated as a no vote.
    fn prepare(&self) -> Result<(), DbError>;

    /// # Errors
    /// Participant-specific; the coordinator retries.
    fn commit(&self) -> Result<(), DbError>;

    /// # Errors
    /// Participant-specific; best effort.
    fn abort(&self) -> Result<(), DbError>;

    fn status(&self) -> ParticipantStatus;
}

impl Participant for Transaction {
    fn prepare(&self) -> Result<(), DbError> {
        Transaction::prepare(self)
    }

    fn commit(&self) -> Result<(), DbError> {
        Transaction::commit(self)
    }

    fn abort(&self) -> Result<(), DbError> {
        Transaction::rollback(self)
    }

    fn status(&self) -> ParticipantStatus {
        match self.state() {
            TxState::Active => ParticipantStatus::Active,
            TxState::Preparing => ParticipantStatus::Preparing,
            TxState::Prepared => ParticipantStatus::Prepared,
            TxState::Committed => ParticipantStatus::Committed,
            TxState::Aborted => ParticipantStatus::Aborted,
        }
    }
}

pub struct Coordinator {
    commit_retries: usize,
    retry_delay: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self { commit_retries: 3, retry_delay: Duration::from_millis(50) }
    }
}

impl Coordinator {
    #[must_use]
    pub const fn new(commit_retries: usize, retry_delay: Duration) -> Self {
        Self { commit_retries, retry_delay }
    }

    /// Run the protocol to completion.
    ///
    /// # Errors
    /// `Conflict` when any participant votes no (everything is aborted);
    /// `InvalidState` when a participant never acknowledges Commit after
    /// the configured retries (its state is then in doubt).
    pub fn run(&self, participants: &[Arc<dyn Participant>]) -> Result<(), DbError> {
        // Phase 1: prepare everywhere.
        for (i, participant) in participants.iter().enumerate() {
            if let Err(e) = participant.prepare() {
                log::warn!("2pc: participant {i} voted no ({e}); aborting all");
                self.abort_all(participants);
                return Err(DbError::Conflict(format!("participant {i} voted no: {e}")));
            }
        }

        // Phase 2: commit everywhere, retrying failures until acknowledged.
        for (i, participant) in participants.iter().enumerate() {
            let mut attempt = 0;
            loop {
                match participant.commit() {
                    Ok(()) => break,
                    Err(e) if attempt < self.commit_retries => {
                        attempt += 1;
                        log::warn!("2pc: commit retry {attempt} for participant {i}: {e}");
                        std::thread::sleep(self.retry_delay);
                    }
                    Err(e) => {
                        return Err(DbError::InvalidState(format!(
                            "participant {i} never acknowledged commit: {e}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn abort_all(&self, participants: &[Arc<dyn Participant>]) {
        for (i, participant) in participants.iter().enumerate() {
            if matches!(
                participant.status(),
                ParticipantStatus::Committed | ParticipantStatus::Aborted
            ) {
                continue;
            }
            if let Err(e) = participant.abort() {
                log::warn!("2pc: abort of participant {i} failed: {e}");
            }
        }
    }
}
