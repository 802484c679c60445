//! Error handling for the cycle-capture service
//!
//! One consolidated error type for the whole service. Variants map onto the
//! recovery policy: connection and read errors are station-local and
//! recoverable by reconnect/backoff, uniqueness violations are recovered by
//! regeneration, decode errors surface as structured scan outcomes.

use errors::{ErrorCategory, ServiceErrorTrait};
use thiserror::Error;

/// Cycle-capture service error type
#[derive(Error, Debug, Clone)]
pub enum CycleSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection establishment and maintenance errors (includes NotConnected)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A single bit or register read failed
    #[error("Read error: {0}")]
    ReadError(String),

    /// Field-bus protocol errors (framing, exception responses)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Register-block extraction failed; no record may be created from it
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Storage errors (SQLite, record store)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A generated code collided with an existing record
    #[error("Uniqueness violation: {0}")]
    UniquenessViolation(String),

    /// Malformed scan payload
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Label dispatch failed (printer unreachable, send timeout)
    #[error("Print error: {0}")]
    PrintError(String),

    /// Validation errors (invalid parameter, unsupported operation)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal errors (task management, serialization)
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the cycle-capture service
pub type Result<T> = std::result::Result<T, CycleSrvError>;

impl CycleSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        CycleSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        CycleSrvError::ConnectionError(msg.into())
    }

    pub fn read(msg: impl Into<String>) -> Self {
        CycleSrvError::ReadError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CycleSrvError::ProtocolError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        CycleSrvError::TimeoutError(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        CycleSrvError::ExtractionError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        CycleSrvError::StorageError(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        CycleSrvError::DecodeError(msg.into())
    }

    pub fn print(msg: impl Into<String>) -> Self {
        CycleSrvError::PrintError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CycleSrvError::ValidationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CycleSrvError::InternalError(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn station_not_found(id: impl std::fmt::Display) -> Self {
        CycleSrvError::NotFound(format!("Station not found: {}", id))
    }

    pub fn cycle_not_found(code: impl std::fmt::Display) -> Self {
        CycleSrvError::NotFound(format!("Cycle not found: {}", code))
    }

    pub fn not_connected() -> Self {
        CycleSrvError::ConnectionError("Not connected".to_string())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for CycleSrvError {
    fn from(err: std::io::Error) -> Self {
        CycleSrvError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for CycleSrvError {
    fn from(err: serde_json::Error) -> Self {
        CycleSrvError::InternalError(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for CycleSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        CycleSrvError::ConfigError(format!("YAML: {err}"))
    }
}

impl From<sqlx::Error> for CycleSrvError {
    fn from(err: sqlx::Error) -> Self {
        // Unique-constraint failures carry their own recovery policy
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return CycleSrvError::UniquenessViolation(db_err.to_string());
            }
        }
        CycleSrvError::StorageError(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn read_error(self, msg: &str) -> Result<T>;
    fn storage_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CycleSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CycleSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn read_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CycleSrvError::ReadError(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| CycleSrvError::StorageError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| CycleSrvError::InternalError(format!("{msg}: {e}")))
    }
}

// ============================================================================
// CycleSrvError implements ServiceErrorTrait
// ============================================================================

impl ServiceErrorTrait for CycleSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CYCLESRV_CONFIG_ERROR",
            Self::ConnectionError(_) => "CYCLESRV_CONNECTION_ERROR",
            Self::ReadError(_) => "CYCLESRV_READ_ERROR",
            Self::ProtocolError(_) => "CYCLESRV_PROTOCOL_ERROR",
            Self::TimeoutError(_) => "CYCLESRV_TIMEOUT",
            Self::ExtractionError(_) => "CYCLESRV_EXTRACTION_ERROR",
            Self::StorageError(_) => "CYCLESRV_STORAGE_ERROR",
            Self::UniquenessViolation(_) => "CYCLESRV_UNIQUENESS_VIOLATION",
            Self::DecodeError(_) => "CYCLESRV_DECODE_ERROR",
            Self::PrintError(_) => "CYCLESRV_PRINT_ERROR",
            Self::ValidationError(_) => "CYCLESRV_VALIDATION_ERROR",
            Self::NotFound(_) => "CYCLESRV_NOT_FOUND",
            Self::InternalError(_) => "CYCLESRV_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::ConnectionError(_) => ErrorCategory::Connection,
            Self::ReadError(_) => ErrorCategory::Protocol,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::TimeoutError(_) => ErrorCategory::Timeout,
            Self::ExtractionError(_) => ErrorCategory::Protocol,
            Self::StorageError(_) => ErrorCategory::Database,
            Self::UniquenessViolation(_) => ErrorCategory::Conflict,
            Self::DecodeError(_) => ErrorCategory::Validation,
            Self::PrintError(_) => ErrorCategory::Network,
            Self::ValidationError(_) => ErrorCategory::Validation,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::InternalError(_) => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            CycleSrvError::connection("x").error_code(),
            "CYCLESRV_CONNECTION_ERROR"
        );
        assert_eq!(
            CycleSrvError::UniquenessViolation("dup".into()).error_code(),
            "CYCLESRV_UNIQUENESS_VIOLATION"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(CycleSrvError::connection("x").is_retryable());
        assert!(CycleSrvError::timeout("x").is_retryable());
        assert!(!CycleSrvError::decode("x").is_retryable());
        assert!(!CycleSrvError::UniquenessViolation("x".into()).is_retryable());
    }

    #[test]
    fn test_error_ext_context() {
        let base: std::result::Result<(), String> = Err("no route".to_string());
        let err = base.connection_error("printer 10.0.0.9:9100").unwrap_err();
        assert!(matches!(err, CycleSrvError::ConnectionError(_)));
        assert!(err.to_string().contains("no route"));
    }
}
