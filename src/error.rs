//! Error types for the bridge.
//!
//! This module defines error codes, the host-facing error type and the
//! status codes reported back to the host for every native call.

use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Handle is unknown, freed, or of the wrong object type
    InvalidHandle,
    /// Calling convention violated (double complete, free while pending, ...)
    ProtocolViolation,
    /// No registration for the requested method name
    MethodNotFound,
    /// Argument could not be decoded into its declared kind
    DecodeError,
    /// Result could not be encoded into its declared kind
    EncodeError,
    /// Binding and library disagree on the contract version
    VersionMismatch,
    /// Binding and library disagree on a method's API checksum
    ChecksumMismatch,
    /// The native library returned an error
    NativeError,
    /// The native library panicked
    Panic,
    /// Resource limit exceeded (pending operations, ...)
    ResourceLimit,
    /// Module already installed on the host runtime
    AlreadyRegistered,
    /// Module has been unregistered
    NotRegistered,
    /// Invalid argument or configuration
    InvalidArgument,
    /// Internal bridge error (bug)
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidHandle => write!(f, "INVALID_HANDLE"),
            ErrorCode::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            ErrorCode::MethodNotFound => write!(f, "METHOD_NOT_FOUND"),
            ErrorCode::DecodeError => write!(f, "DECODE_ERROR"),
            ErrorCode::EncodeError => write!(f, "ENCODE_ERROR"),
            ErrorCode::VersionMismatch => write!(f, "VERSION_MISMATCH"),
            ErrorCode::ChecksumMismatch => write!(f, "CHECKSUM_MISMATCH"),
            ErrorCode::NativeError => write!(f, "NATIVE_ERROR"),
            ErrorCode::Panic => write!(f, "PANIC"),
            ErrorCode::ResourceLimit => write!(f, "RESOURCE_LIMIT"),
            ErrorCode::AlreadyRegistered => write!(f, "ALREADY_REGISTERED"),
            ErrorCode::NotRegistered => write!(f, "NOT_REGISTERED"),
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

impl ErrorCode {
    /// Call status reported to the host for this error
    pub fn call_status(&self) -> i8 {
        match self {
            ErrorCode::NativeError => call_status::ERROR,
            _ => call_status::UNEXPECTED_ERROR,
        }
    }
}

/// Error surfaced to the host, either thrown or as a rejected operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct BridgeError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Offending handle id, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,

    /// Serialized error payload produced by the native library
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,

    /// Additional context for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl BridgeError {
    /// Create a new bridge error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            handle: None,
            payload: None,
            context: None,
        }
    }

    /// Create an invalid handle error
    pub fn invalid_handle(handle: u64, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidHandle,
            format!("Invalid handle {}: {}", handle, reason.into()),
        )
        .with_handle(handle)
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    /// Create a method not found error
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method '{}' is not registered", method.into()),
        )
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DecodeError, message)
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EncodeError, message)
    }

    /// Create a contract version mismatch error
    pub fn version_mismatch(expected: u32, actual: u32) -> Self {
        Self::new(
            ErrorCode::VersionMismatch,
            format!(
                "Contract version mismatch: binding expects {}, library reports {}",
                expected, actual
            ),
        )
    }

    /// Create an API checksum mismatch error
    pub fn checksum_mismatch(
        method: impl Into<String>,
        expected: u16,
        actual: Option<u16>,
    ) -> Self {
        let method = method.into();
        let message = match actual {
            Some(actual) => format!(
                "API checksum mismatch for '{}': binding expects {}, library reports {}",
                method, expected, actual
            ),
            None => format!("Library reports no API checksum for '{}'", method),
        };
        Self::new(ErrorCode::ChecksumMismatch, message)
    }

    /// Create a native library error
    pub fn native(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NativeError, message)
    }

    /// Create a panic error
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Panic, message)
    }

    /// Create a resource limit error
    pub fn resource_limit(resource: impl Into<String>, limit: usize) -> Self {
        Self::new(
            ErrorCode::ResourceLimit,
            format!("Resource limit exceeded: {} (limit: {})", resource.into(), limit),
        )
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Attach the offending handle id
    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Attach a serialized native error payload
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Add context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Call status reported to the host for this error
    pub fn call_status(&self) -> i8 {
        self.code.call_status()
    }
}

impl From<crate::config::ConfigError> for BridgeError {
    fn from(e: crate::config::ConfigError) -> Self {
        BridgeError::new(ErrorCode::InvalidArgument, e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::internal(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BridgeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BridgeError::encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BridgeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BridgeError::decode(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status codes of a native call, as seen by the host
pub mod call_status {
    /// Success
    pub const SUCCESS: i8 = 0;
    /// The native library returned an error
    pub const ERROR: i8 = 1;
    /// Panic or bridge failure
    pub const UNEXPECTED_ERROR: i8 = 2;
    /// The operation was cancelled
    pub const CANCELLED: i8 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::InvalidHandle.to_string(), "INVALID_HANDLE");
        assert_eq!(ErrorCode::ProtocolViolation.to_string(), "PROTOCOL_VIOLATION");
    }

    #[test]
    fn test_invalid_handle_carries_id() {
        let err = BridgeError::invalid_handle(7, "freed");
        assert_eq!(err.code, ErrorCode::InvalidHandle);
        assert_eq!(err.handle, Some(7));
        assert!(err.message.contains('7'));
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::method_not_found("nope");
        assert_eq!(err.to_string(), "[METHOD_NOT_FOUND] Method 'nope' is not registered");
    }

    #[test]
    fn test_error_serialization() {
        let err = BridgeError::version_mismatch(26, 25);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("VERSION_MISMATCH"));
        assert!(!json.contains("handle"));
    }

    #[test]
    fn test_call_status() {
        assert_eq!(BridgeError::native("boom").call_status(), call_status::ERROR);
        assert_eq!(BridgeError::panic("boom").call_status(), call_status::UNEXPECTED_ERROR);
    }
}
