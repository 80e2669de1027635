//! Recovery and durability module.
//!
//! - Checkpoints, on demand and from a background worker
//! - Redo-only WAL replay at open

pub mod checkpoint;
pub mod replay;

pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointStats};
pub use replay::{replay_wal, RecoveryStats};
