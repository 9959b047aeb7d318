//! Unified error taxonomy for the store.

use thiserror::Error;

/// Errors returned from any public `Tqdb` operation.
#[derive(Debug, Error)]
pub enum TqdbError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("allocation failed")]
    NoMem,

    #[error("entity not found")]
    NotFound,

    #[error("entity already exists: {0}")]
    Exists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database file corrupt: {0}")]
    Corrupt(String),

    #[error("registry or type capacity exceeded")]
    Full,

    #[error("lock acquisition timed out")]
    Timeout,

    #[error("type not registered: {0}")]
    NotRegistered(String),
}

pub type Result<T> = std::result::Result<T, TqdbError>;
