//! Public error taxonomy.
//!
//! Every error reported by [`crate::Database`] carries a stable numeric
//! [`ErrorCode`] with a fixed message, so callers can branch on the kind
//! (retry a conflict, never retry an invalid transaction) without parsing
//! text.

use thiserror::Error;

use crate::storage::error::StorageError;
use crate::transaction::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidParam = -1,
    Memory = -2,
    Io = -3,
    KeyNotFound = -4,
    TransactionConflict = -5,
    InvalidTransaction = -6,
    Generic = -100,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Ok),
            -1 => Some(ErrorCode::InvalidParam),
            -2 => Some(ErrorCode::Memory),
            -3 => Some(ErrorCode::Io),
            -4 => Some(ErrorCode::KeyNotFound),
            -5 => Some(ErrorCode::TransactionConflict),
            -6 => Some(ErrorCode::InvalidTransaction),
            -100 => Some(ErrorCode::Generic),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::InvalidParam => "Invalid parameter",
            ErrorCode::Memory => "Memory allocation failed",
            ErrorCode::Io => "I/O error",
            ErrorCode::KeyNotFound => "Key not found",
            ErrorCode::TransactionConflict => "Transaction conflict",
            ErrorCode::InvalidTransaction => "Invalid transaction",
            ErrorCode::Generic => "Generic error",
        }
    }
}

/// Fixed message for a numeric code. Unknown codes get the generic message.
pub fn error_message(code: i32) -> &'static str {
    ErrorCode::from_code(code)
        .unwrap_or(ErrorCode::Generic)
        .message()
}

#[derive(Error, Debug)]
pub enum LowkeyError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Memory allocation failed: {0}")]
    Memory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Transaction conflict: {0} must be retried")]
    TransactionConflict(TransactionId),

    #[error("Invalid transaction: {0} is unknown or already finished")]
    InvalidTransaction(TransactionId),

    #[error("Internal error: {0}")]
    Generic(String),
}

impl LowkeyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LowkeyError::InvalidParam(_) => ErrorCode::InvalidParam,
            LowkeyError::Memory(_) => ErrorCode::Memory,
            LowkeyError::Io(_) => ErrorCode::Io,
            LowkeyError::KeyNotFound => ErrorCode::KeyNotFound,
            LowkeyError::TransactionConflict(_) => ErrorCode::TransactionConflict,
            LowkeyError::InvalidTransaction(_) => ErrorCode::InvalidTransaction,
            LowkeyError::Generic(_) => ErrorCode::Generic,
        }
    }
}

impl From<StorageError> for LowkeyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => LowkeyError::Io(e),
            err @ StorageError::EntryTooLarge { .. } => LowkeyError::InvalidParam(err.to_string()),
            other => LowkeyError::Generic(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LowkeyError>;
