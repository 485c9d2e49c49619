pub mod aries;
pub mod checkpoint;

pub use aries::{Analysis, RecoveryManager, RecoveryReport};
pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointObserver, CheckpointOutcome};
