//! Typed error taxonomies for the transport and serialization layers.
//!
//! These mirror the error code tables carried in the wire header's `format`
//! dispatch and in `TransportResult`/`CallResult` style returns: every fault
//! a caller can observe is a named variant here, never a panic or an
//! exception crossing a transport boundary.

use thiserror::Error;

/// Errors a transport can report through `TransportResult<T>`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotInitialized,
    #[error("transport already initialized")]
    AlreadyInitialized,
    #[error("transport not connected")]
    NotConnected,
    #[error("transport already connected")]
    AlreadyConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    RecvFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid message")]
    InvalidMessage,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("unknown transport error: {0}")]
    UnknownError(String),
}

/// `Result` alias matching the header's `TransportResult<T>` contract.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors the message serializer layer can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("payload size {0} exceeds limit {1}")]
    SizeExceeded(usize, usize),
    #[error("invalid format marker")]
    InvalidFormat,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData { needed: usize, have: usize },
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("memory allocation failed")]
    MemoryAllocationFailed,
    #[error("unknown serializer error: {0}")]
    UnknownError(String),
}

pub type SerializerResult<T> = Result<T, SerializerError>;

/// Stub-side error code floor (spec §4.G). These ride in an ERROR message's
/// `error_code` field, not as a native Rust error type on their own -- a
/// stub always answers with a message, never propagates a panic.
pub mod stub_codes {
    pub const METHOD_NOT_FOUND: u32 = 1001;
    pub const VALIDATION_FAILED: u32 = 1002;
    pub const AUTHENTICATION_FAILED: u32 = 1003;
    pub const HANDLER_EXCEPTION: u32 = 1004;
    pub const HANDLER_TIMEOUT: u32 = 1005;
    pub const MAX_REQUESTS_EXCEEDED: u32 = 1006;
    pub const INVALID_REQUEST: u32 = 1007;
    pub const SERIALIZATION_FAILED: u32 = 1008;
    pub const TRANSPORT_ERROR: u32 = 1009;
}

/// Proxy-local call result codes (distinct, smaller namespace from the stub
/// floor above -- these describe failures the proxy itself detects before a
/// stub ever gets involved).
pub mod proxy_codes {
    pub const NOT_CONNECTED: u32 = 1;
    pub const SEND_FAILED: u32 = 2;
    pub const TIMEOUT: u32 = 3;
    pub const RECEIVE_FAILED: u32 = 4;
    pub const GENERIC_EXCEPTION: u32 = 999;
}
