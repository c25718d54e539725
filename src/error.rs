// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the agent.
// Source failures are expected and degrade to `nginx.status = 0` or to an
// empty tick; only configuration problems stop the process.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 1.1 Agent Errors
// ----------------------------------------------------------------------------

/// The main error type for the agent.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum AgentError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Source Errors ----
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    // ---- Export Errors ----
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl AgentError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Config(_) => false,
            AgentError::Source(e) => e.is_recoverable(),
            AgentError::Export(_) => true,
            AgentError::Io(_) => true,
            AgentError::Internal(_) => false,
            AgentError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Source(_) => "source",
            AgentError::Export(_) => "export",
            AgentError::Io(_) => "io",
            AgentError::Internal(_) => "internal",
            AgentError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            AgentError::Config(_) => RecoveryHint::FixConfiguration,
            AgentError::Source(e) => e.recovery_hint(),
            AgentError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryNextTick,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Try again on the next collection tick
    RetryNextTick,
    /// Rebuild the source set for the instance
    RebuildSources,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// 1.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Configuration reload failed: {message}")]
    ReloadFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 1.3 Source Errors
// ----------------------------------------------------------------------------

/// Errors from metric sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Endpoint '{endpoint}' unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("Invalid response from '{endpoint}': {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Failed to read '{path}': {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse '{field}': {message}")]
    Parse { field: String, message: String },

    #[error("Unsupported layout: {message}")]
    Unsupported { message: String },

    #[error("Process {pid} not found")]
    ProcessNotFound { pid: u32 },
}

impl SourceError {
    pub fn unreachable(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SourceError::Unreachable {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_response(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SourceError::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        SourceError::Io {
            path: path.into(),
            error,
        }
    }

    pub fn parse(field: impl Into<String>, message: impl ToString) -> Self {
        SourceError::Parse {
            field: field.into(),
            message: message.to_string(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SourceError::Unsupported { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SourceError::Unreachable { .. } | SourceError::Timeout { .. } => {
                RecoveryHint::RetryNextTick
            }
            SourceError::InvalidResponse { .. } | SourceError::Parse { .. } => RecoveryHint::Skip,
            SourceError::Io { .. } | SourceError::ProcessNotFound { .. } => {
                RecoveryHint::RetryNextTick
            }
            SourceError::Unsupported { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 1.4 Export Errors
// ----------------------------------------------------------------------------

/// Errors from report sinks
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write report to '{target}': {message}")]
    WriteFailed { target: String, message: String },

    #[error("Failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ----------------------------------------------------------------------------
// 1.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type AgentResult<T> = Result<T, AgentError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type ExportResult<T> = Result<T, ExportError>;
