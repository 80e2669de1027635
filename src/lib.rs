//! LowkeyDB: an embeddable, transactional key-value store.
//!
//! A single data file of fixed-size pages cached by a buffer pool, a
//! write-ahead log with periodic checkpoints, and transactions at
//! read-committed, repeatable-read or serializable isolation.
//!
//! ```no_run
//! use lowkeydb::{Database, IsolationLevel};
//!
//! # fn main() -> lowkeydb::Result<()> {
//! let db = Database::create(std::path::Path::new("example.db"))?;
//! db.put(b"greeting", b"hello")?;
//!
//! let tx = db.begin(IsolationLevel::Serializable)?;
//! let value = db.tx_get(tx, b"greeting")?;
//! db.tx_put(tx, b"copy", &value)?;
//! db.commit(tx)?;
//! db.close();
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod concurrency;
pub mod config;
pub mod database;
pub mod error;
pub mod failpoint;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use concurrency::IsolationLevel;
pub use config::DatabaseConfig;
pub use database::Database;
pub use error::{error_message, ErrorCode, LowkeyError, Result};
pub use recovery::{CheckpointConfig, CheckpointStats, RecoveryStats};
pub use storage::wal::WalConfig;
pub use storage::BufferPoolStats;
pub use transaction::{TransactionId, TransactionInfo, TransactionState};
