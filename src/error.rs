//! Error types for every layer of the exporter.
//!
//! Data-quality problems (unmatched joins, missing optional fields) never
//! reach these types: they are absorbed by the join policies. What remains is
//! connectivity trouble ([`UpstreamError`]), engine contract violations
//! ([`RenderError`], [`CounterError`]) and start-up problems ([`ConfigError`]).

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 1. Upstream Errors
// ----------------------------------------------------------------------------

/// Failures talking to one backend.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("Backend '{backend}' unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Backend '{backend}' returned status {status} for {url}")]
    Status {
        backend: String,
        status: u16,
        url: String,
    },

    #[error("Malformed response from '{backend}': {message}")]
    Malformed { backend: String, message: String },

    #[error("Record '{id}' not found on '{backend}'")]
    NotFound { backend: String, id: String },
}

impl UpstreamError {
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Unavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn malformed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Malformed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        UpstreamError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Any upstream failure may be answered with a stale snapshot.
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpstreamError::Unavailable { .. }
            | UpstreamError::Timeout { .. }
            | UpstreamError::Status { .. }
            | UpstreamError::Malformed { .. }
            | UpstreamError::NotFound { .. } => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Render Errors
// ----------------------------------------------------------------------------

/// Contract violations detected while producing exposition text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("Invalid metric family name '{name}'")]
    InvalidFamilyName { name: String },

    #[error("Invalid label name '{label}' in family '{family}'")]
    InvalidLabelName { family: String, label: String },

    #[error("Family '{family}' declares {expected} labels but a sample supplied {actual}")]
    LabelArity {
        family: String,
        expected: usize,
        actual: usize,
    },

    #[error("Family '{family}' rendered more than once")]
    DuplicateFamily { family: String },

    #[error("Encoding failed: {message}")]
    Encoding { message: String },
}

// ----------------------------------------------------------------------------
// 3. Counter Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CounterError {
    #[error("Counter '{family}' cannot be incremented by {delta}")]
    InvalidDelta { family: String, delta: f64 },
}

// ----------------------------------------------------------------------------
// 4. Collector Errors
// ----------------------------------------------------------------------------

/// Everything that can stop one collector from producing output.
#[derive(Error, Debug, Clone)]
pub enum CollectorError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error("Rebuild of '{key}' aborted: {message}")]
    BuildAborted { key: String, message: String },

    #[error("Rebuild of '{key}' failed while this caller waited: {message}")]
    SharedFailure { key: String, message: String },
}

impl CollectorError {
    /// Whether a stale snapshot may stand in for the failed result.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::Upstream(e) => e.is_recoverable(),
            CollectorError::Render(_) => false,
            CollectorError::Counter(_) => false,
            CollectorError::BuildAborted { .. } => true,
            CollectorError::SharedFailure { .. } => true,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            CollectorError::Upstream(_) => "upstream",
            CollectorError::Render(_) => "render",
            CollectorError::Counter(_) => "counter",
            CollectorError::BuildAborted { .. } => "aborted",
            CollectorError::SharedFailure { .. } => "shared_failure",
        }
    }
}

// ----------------------------------------------------------------------------
// 5. Configuration Errors
// ----------------------------------------------------------------------------

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
}

// ----------------------------------------------------------------------------
// 6. Top-level Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type of the exporter process.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Collector(e) => e.is_recoverable(),
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Collector(e) => e.category(),
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

impl From<UpstreamError> for ExporterError {
    fn from(err: UpstreamError) -> Self {
        ExporterError::Collector(CollectorError::Upstream(err))
    }
}

// ----------------------------------------------------------------------------
// 7. Result Aliases
// ----------------------------------------------------------------------------

pub type UpstreamResult<T> = Result<T, UpstreamError>;
pub type CollectorResult<T> = Result<T, CollectorError>;
pub type ExporterResult<T> = Result<T, ExporterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_errors_are_recoverable() {
        let err: CollectorError = UpstreamError::timeout("list nodes", 500).into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "upstream");
        assert_eq!(err.to_string(), "Timeout waiting for 'list nodes' (waited 500ms)");
    }

    #[test]
    fn test_missing_object_is_recoverable() {
        let err: CollectorError = UpstreamError::NotFound {
            backend: "ironic".into(),
            id: "n9".into(),
        }
        .into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_render_errors_are_fatal() {
        let err: ExporterError = CollectorError::from(RenderError::LabelArity {
            family: "ironic_node_totals".into(),
            expected: 6,
            actual: 5,
        })
        .into();
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), "render");
    }
}
