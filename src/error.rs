//! Error types for nvs_blob

use thiserror::Error;

/// Result type alias for nvs_blob operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nvs_blob operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage is not initialized")]
    NotInitialized,

    #[error("Partition has no free pages")]
    NoFreePages,

    #[error("Partition written by a newer format: expected {expected}, found {found}")]
    NewVersionFound { expected: u32, found: u32 },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid partition file: {0}")]
    InvalidFile(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(u32),

    #[error("Handle is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Value too long: {len} bytes (max {max})")]
    ValueTooLong { len: usize, max: usize },

    #[error("Buffer too small: need {required} bytes, got {provided}")]
    InvalidLength { required: usize, provided: usize },

    #[error("Type mismatch for key: {0}")]
    TypeMismatch(String),

    #[error("Not enough space: need {required} bytes, {available} available")]
    NotEnoughSpace { required: usize, available: usize },

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// True for an absent namespace or key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Init failures that a one-time erase can fix
    pub fn is_recoverable_init(&self) -> bool {
        matches!(
            self,
            Error::NoFreePages | Error::NewVersionFound { .. } | Error::VersionMismatch { .. }
        )
    }

    /// Stable upper-case code, used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Json(_) => "JSON",
            Error::NotFound(_) => "NOT_FOUND",
            Error::NotInitialized => "NOT_INITIALIZED",
            Error::NoFreePages => "NO_FREE_PAGES",
            Error::NewVersionFound { .. } => "NEW_VERSION_FOUND",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::InvalidFile(_) => "INVALID_FILE",
            Error::Corruption(_) => "CORRUPTION",
            Error::InvalidHandle(_) => "INVALID_HANDLE",
            Error::ReadOnly(_) => "READ_ONLY",
            Error::InvalidName(_) => "INVALID_NAME",
            Error::ValueTooLong { .. } => "VALUE_TOO_LONG",
            Error::InvalidLength { .. } => "INVALID_LENGTH",
            Error::TypeMismatch(_) => "TYPE_MISMATCH",
            Error::NotEnoughSpace { .. } => "NOT_ENOUGH_SPACE",
            Error::Config(_) => "CONFIG",
        }
    }
}
