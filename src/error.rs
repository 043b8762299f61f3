//! Error types for flowbox
//!
//! All modules use `FlowboxResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for flowbox operations
pub type FlowboxResult<T> = Result<T, FlowboxError>;

/// All errors that can occur in flowbox
#[derive(Error, Debug)]
pub enum FlowboxError {
    // Pool errors
    #[error("Isolation pool exhausted: all {size} slots are in use")]
    PoolExhausted { size: usize },

    #[error("Unknown isolation slot: {0}")]
    UnknownSlot(usize),

    #[error("Failed to recreate isolation slot {slot}: {reason}")]
    SlotRecreate { slot: usize, reason: String },

    #[error("Isolation backend unavailable: {0}")]
    BackendUnavailable(String),

    // Cache errors
    #[error("Dependency cache build failed for {key} in {}: {reason} (specs: {})", .target.display(), .specs.join(", "))]
    CacheBuildFailed {
        key: String,
        specs: Vec<String>,
        target: PathBuf,
        reason: String,
    },

    #[error("Invalid package spec {spec}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("Archive fetch failed for {archive_id}: {reason}")]
    ArchiveFetch { archive_id: String, reason: String },

    // Execution errors
    #[error("Execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Execution crashed: {reason}")]
    ExecutionCrashed { reason: String },

    // Bookkeeping errors. These mean shared pool or cache state is corrupt.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl FlowboxError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create an invariant violation, logging it at error level
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Invariant violated: {}", message);
        Self::Invariant(message)
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ExecutionTimeout { .. }
                | Self::CacheBuildFailed { .. }
                | Self::ArchiveFetch { .. }
        )
    }

    /// Check if error means shared bookkeeping is corrupt
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::UnknownSlot(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PoolExhausted { .. } => {
                Some("Retry later, or raise pool.size / pool.acquire_timeout_ms")
            }
            Self::BackendUnavailable(_) => {
                Some("Install isolate, or set sandbox.backend = \"process\" for development")
            }
            Self::CacheBuildFailed { .. } => {
                Some("Check installer.package_manager and registry access, then retry")
            }
            _ => None,
        }
    }
}
