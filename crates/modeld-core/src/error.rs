//! Error types for modeld

use thiserror::Error;

/// Main error type for modeld
#[derive(Error, Debug)]
pub enum ModeldError {
    /// No snapshot exists for the entity
    #[error("Not found: {0}")]
    NotFound(String),

    /// Creating a model from its parameters failed
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// A snapshot, pointer or parameters blob could not be decoded
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// The per-entity lock was not acquired in time
    #[error("Timed out after {waited_ms}ms waiting for lock on '{name}'")]
    LockTimeout { name: String, waited_ms: u64 },

    /// The model's run call failed
    #[error("Computation failed: {0}")]
    ComputationFailure(String),

    /// Writing a snapshot or committing its pointer failed
    #[error("Store write failed: {0}")]
    StoreWriteFailure(String),

    /// No model kind registered under this tag
    #[error("Unknown model kind: {0}")]
    UnknownModelKind(String),

    /// Malformed request (bad entity name, bad payload)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Worker configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModeldError {
    /// Short machine-readable tag, used in job failure replies
    pub fn kind(&self) -> &'static str {
        match self {
            ModeldError::NotFound(_) => "not_found",
            ModeldError::ConfigurationInvalid(_) => "configuration_invalid",
            ModeldError::Corrupt(_) => "corrupt",
            ModeldError::LockTimeout { .. } => "lock_timeout",
            ModeldError::ComputationFailure(_) => "computation_failure",
            ModeldError::StoreWriteFailure(_) => "store_write_failure",
            ModeldError::UnknownModelKind(_) => "unknown_model_kind",
            ModeldError::InvalidRequest(_) => "invalid_request",
            ModeldError::Config(_) => "config",
            ModeldError::Io(_) => "io",
            ModeldError::Serialization(_) => "serialization",
            ModeldError::Internal(_) => "internal",
        }
    }
}

/// Result type for modeld operations
pub type ModeldResult<T> = Result<T, ModeldError>;

impl From<serde_json::Error> for ModeldError {
    fn from(err: serde_json::Error) -> Self {
        ModeldError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ModeldError {
    fn from(err: toml::de::Error) -> Self {
        ModeldError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ModeldError {
    fn from(err: tokio::task::JoinError) -> Self {
        ModeldError::Internal(format!("blocking task failed: {}", err))
    }
}
