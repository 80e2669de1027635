//! Concurrency control module.
//!
//! - Logical commit timestamps
//! - Before-image versions for snapshot reads and commit validation
//! - Isolation levels and snapshot visibility

pub mod mvcc;
pub mod timestamp;
pub mod version;

pub use mvcc::IsolationLevel;
pub use timestamp::{Timestamp, TimestampOracle};
pub use version::VersionStore;
