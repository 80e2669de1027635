//! Write-ahead log.
//!
//! The log holds logical redo records for committed work. Appends are
//! buffered and become durable on `flush`; frames are checksummed so a torn
//! tail left by a crash is detected and cut off at open.

pub mod iterator;
pub mod manager;
pub mod record;

pub use iterator::WalIterator;
pub use manager::{wal_path, WalConfig, WalManager};
pub use record::{Lsn, WalRecord, WalRecordHeader, WalRecordPayload};
