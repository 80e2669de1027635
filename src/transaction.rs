//! Transaction management module.
//!
//! - Transaction lifecycle (begin, commit, rollback)
//! - Deferred writes with commit-time validation
//! - Transaction state tracking

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::TransactionManager;
pub use state::{TransactionInfo, TransactionState};
