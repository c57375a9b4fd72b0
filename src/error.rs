//! Error types for the iRODS client

use thiserror::Error;

/// Result type for iRODS client operations
pub type Result<T> = std::result::Result<T, IrodsError>;

/// Errors surfaced by the client.
///
/// Server status codes are mapped onto these variants by
/// [`IrodsError::from_status`]; anything the client cannot classify
/// lands in `Protocol` (well-formed but unexpected response) or
/// `Internal` (a bug on our side).
#[derive(Error, Debug)]
pub enum IrodsError {
    /// Frame corrupt, schema violation, or length field out of range
    #[error("wire format error: {0}")]
    WireFormat(String),

    /// Socket deadline elapsed
    #[error("network timeout during {0}")]
    NetworkTimeout(String),

    /// Socket closed or failed unexpectedly
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// Incompatible SSL stance or cipher during client-server negotiation
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Invalid credentials or bad challenge response
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Path or object absent on the server
    #[error("not found: {0}")]
    NotFound(String),

    /// Create collision, server -809000 family
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// ACL or policy rejection
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Caller-side logical collision, e.g. copy onto own parent
    #[error("duplicate data: {0}")]
    DuplicateData(String),

    /// Operation not representable on iRODS paths
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Cooperative cancellation observed
    #[error("transfer cancelled")]
    Cancelled,

    /// Well-formed but semantically invalid server response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bug: invariants violated on the client side
    #[error("internal error: {0}")]
    Internal(String),
}

/// Server error namespaces. Each covers code..code-999 ("family"),
/// matching how the catalog subcodes extend a base error.
const CAT_NAME_EXISTS_AS_DATAOBJ: i32 = -809000;
const CAT_NAME_EXISTS_AS_COLLECTION: i32 = -821000;
const CAT_NO_ROWS_FOUND: i32 = -808000;
const USER_FILE_DOES_NOT_EXIST: i32 = -310000;
const CAT_UNKNOWN_FILE: i32 = -520013;
const CAT_NO_ACCESS_PERMISSION: i32 = -818000;
const CAT_INVALID_AUTHENTICATION: i32 = -826000;
const CAT_INVALID_USER: i32 = -827000;
const PAM_AUTH_PASSWORD_FAILED: i32 = -994000;
const SYS_COPY_ALREADY_IN_RESC: i32 = -836000;

fn in_family(status: i32, base: i32) -> bool {
    status <= base && status > base - 1000
}

impl IrodsError {
    /// Map a negative server status in a reply header onto the taxonomy.
    pub fn from_status(status: i32, context: &str) -> IrodsError {
        debug_assert!(status < 0);
        if in_family(status, CAT_NAME_EXISTS_AS_DATAOBJ)
            || in_family(status, CAT_NAME_EXISTS_AS_COLLECTION)
            || in_family(status, SYS_COPY_ALREADY_IN_RESC)
        {
            IrodsError::AlreadyExists(format!("{context} (status {status})"))
        } else if in_family(status, CAT_NO_ROWS_FOUND)
            || in_family(status, USER_FILE_DOES_NOT_EXIST)
            || status == CAT_UNKNOWN_FILE
        {
            IrodsError::NotFound(format!("{context} (status {status})"))
        } else if in_family(status, CAT_NO_ACCESS_PERMISSION) {
            IrodsError::PermissionDenied(format!("{context} (status {status})"))
        } else if in_family(status, CAT_INVALID_AUTHENTICATION)
            || in_family(status, CAT_INVALID_USER)
            || in_family(status, PAM_AUTH_PASSWORD_FAILED)
        {
            IrodsError::AuthFailed(format!("{context} (status {status})"))
        } else {
            IrodsError::Protocol(format!("{context}: server status {status}"))
        }
    }

    /// Transient errors are worth one reconnect-and-retry inside a
    /// transfer; everything else surfaces immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IrodsError::NetworkTimeout(_) | IrodsError::NetworkFailure(_)
        )
    }
}

impl From<std::io::Error> for IrodsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                IrodsError::NetworkTimeout(err.to_string())
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionRefused => {
                IrodsError::NetworkFailure(err.to_string())
            }
            _ => IrodsError::NetworkFailure(err.to_string()),
        }
    }
}
