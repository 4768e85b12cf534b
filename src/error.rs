use thiserror::Error;

/// Reasons a process descriptor is rejected by the config loader
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    MalformedSyntax(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main error type for the procward supervisor
#[derive(Debug, Error)]
pub enum ProcwardError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // Process-related errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process already exists: {0}")]
    ProcessAlreadyExists(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Process {0} entered a crash loop: {1}")]
    CrashLoop(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    // Monitor and log errors, both non-fatal to the supervised process
    #[error("Failed to read memory stats for pid {0}")]
    MonitorRead(u32),

    #[error("Failed to write log {0}: {1}")]
    LogWrite(String, String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to supervisor: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Supervisor daemon not running")]
    DaemonNotRunning,

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for procward operations
pub type Result<T> = std::result::Result<T, ProcwardError>;
