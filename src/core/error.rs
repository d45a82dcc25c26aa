use thiserror::Error;

use crate::core::version::Version;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Version incompatible: required {required}, found {found}")]
    VersionIncompatible { required: Version, found: Version },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Dependency from '{from}' to '{to}' would create a cycle")]
    WouldCycle { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Malformed export: {0}")]
    Malformed(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl<T> From<std::sync::PoisonError<T>> for RuntimeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
