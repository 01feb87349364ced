//! Error types for lwm2m-client

use thiserror::Error;

use crate::coap_types::ResponseCode;

/// Main error type for LWM2M client operations
#[derive(Debug, Error)]
pub enum Lwm2mError {
    /// A node has no numeric identifier and cannot be TLV-encoded
    #[error("No numeric identifier for node: {0}")]
    MissingNameId(String),

    /// Payload decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Path does not resolve to a node
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A node with the same name or instance id already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed LWM2M path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Value cannot be encoded or converted
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Malformed notification attribute query
    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Invalid client configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No deferred response is pending for the token or resource
    #[error("No pending delayed response: {0}")]
    NoPendingResponse(String),

    /// The CoAP engine refused to build or send a message
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of decoding a TLV or JSON payload into the resource tree.
///
/// Success is `Ok(())`; each variant maps onto a CoAP response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// PUT targets a non-existent instance or resource
    #[error("target does not exist")]
    NotFound,
    /// Malformed or truncated record
    #[error("malformed payload")]
    NotValid,
    /// The operation mask forbids the write
    #[error("operation not allowed")]
    NotAllowed,
}

impl DecodeError {
    /// CoAP response code reported for this decode failure
    pub fn response_code(self) -> ResponseCode {
        match self {
            Self::NotFound => ResponseCode::NotFound,
            Self::NotValid => ResponseCode::BadRequest,
            Self::NotAllowed => ResponseCode::MethodNotAllowed,
        }
    }
}

/// Failure reported through `registration_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The server answered an outstanding request with an error code
    #[error("request rejected with {0}")]
    Rejected(ResponseCode),
    /// A success code arrived for a message that was not outstanding
    #[error("unexpected {0} response")]
    UnexpectedResponse(ResponseCode),
}

/// Result type alias for LWM2M client operations
pub type Result<T> = std::result::Result<T, Lwm2mError>;
