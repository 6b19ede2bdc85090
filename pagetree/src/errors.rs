//! Error types shared by every layer of the crate.

use std::fmt::{Display, Formatter};
use std::io;
use thiserror::Error;

use crate::container::PageId;

/// Errors that can occur while storing, caching or restructuring index pages.
///
/// A lookup or removal of an absent key is never an error; those calls return
/// `Ok(None)` or `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("IO error: {0}")]
    Storage(#[from] io::Error),

    #[error("Page {0} does not exist")]
    MissingPage(PageId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Coarse classification of a [`TreeError`].
///
/// Callers use the kind to decide whether an operation may be retried against
/// a fresh tree instance. The tree itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Serialization,
    InvariantViolation,
    Configuration,
    InvalidState,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::Serialization => write!(f, "Serialization error"),
            ErrorKind::InvariantViolation => write!(f, "Invariant violation"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
        }
    }
}

impl TreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TreeError::Storage(_) | TreeError::MissingPage(_) => ErrorKind::Storage,
            TreeError::Serialization(_) => ErrorKind::Serialization,
            TreeError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            TreeError::Configuration(_) => ErrorKind::Configuration,
            TreeError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        TreeError::InvariantViolation(msg)
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        TreeError::Configuration(msg)
    }
}

impl From<bincode::error::EncodeError> for TreeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TreeError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for TreeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TreeError::Serialization(err.to_string())
    }
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;
