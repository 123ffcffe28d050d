//! Error types for the cluster client runtime.
//!
//! Every error is `Clone` so a single failure (a bootstrap timeout, a
//! durability deadline) can be delivered to many one-shot callbacks.

use std::io;
use thiserror::Error;

use crate::types::{ServerIndex, VbucketId};

/// Result type alias for client runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Cluster topology errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Authentication against a node failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Wire or configuration protocol errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Durability request errors.
    #[error("durability error: {0}")]
    Durability(#[from] DurabilityError),

    /// An argument supplied by the caller is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A client-side resource could not be allocated.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// No configuration was obtained before the bootstrap deadline.
    #[error("failed to bootstrap in time")]
    BootstrapTimeout,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// No server currently owns the requested vbucket, or no provider remains.
    #[error("no matching server: {0}")]
    NoMatchingServer(String),

    /// No cluster configuration is available yet.
    #[error("no cluster configuration available")]
    NoConfiguration,

    /// The document does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// The document exists with a different CAS.
    #[error("key exists")]
    KeyExists,

    /// The server is temporarily unable to handle the request.
    #[error("temporary failure")]
    TemporaryFailure,

    /// Local file system errors (config cache).
    #[error("io error: {0}")]
    Io(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The remote end refused the connection.
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    /// The connection was reset or closed by the remote end.
    #[error("connection reset by {addr}")]
    ConnectionReset { addr: String },

    /// Connecting did not complete in time.
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// Unspecified socket failure.
    #[error("network failure: {0}")]
    Generic(String),
}

/// Cluster topology errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The server does not own the vbucket the operation was sent for.
    #[error("server {server} is not the owner of vbucket {vbucket}")]
    NotMyVbucket {
        vbucket: VbucketId,
        server: ServerIndex,
    },

    /// The vbucket map changed while the operation was in flight.
    #[error("vbucket map changed")]
    MapChanged,

    /// The cluster announced a topology change in progress.
    #[error("topology change in progress")]
    ChangeInProgress,
}

/// Wire and configuration protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A response could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A configuration blob could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested bucket does not exist on the cluster.
    #[error("unknown bucket: {0}")]
    UnknownBucket(String),
}

/// Durability request errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurabilityError {
    /// More replicas were requested than the cluster can provide.
    #[error("replicate_to={requested} exceeds available replicas ({available})")]
    TooManyReplicas { requested: u16, available: u16 },

    /// More persisting nodes were requested than the cluster can provide.
    #[error("persist_to={requested} exceeds available nodes ({available})")]
    TooManyPersisted { requested: u16, available: u16 },

    /// The same key appears twice in one request.
    #[error("duplicate key in durability request: {0}")]
    DuplicateKey(String),

    /// The master reported a CAS different from the expected one.
    #[error("cas mismatch: expected {expected}, found {actual}")]
    CasMismatch { expected: u64, actual: u64 },
}

/// Coarse error classes used by the retry classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    VbucketMap,
    TopologyChange,
    Auth,
    Protocol,
    ClientLocal,
    Durability,
    Timeout,
    Other,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Network,
        ErrorCategory::VbucketMap,
        ErrorCategory::TopologyChange,
        ErrorCategory::Auth,
        ErrorCategory::Protocol,
        ErrorCategory::ClientLocal,
        ErrorCategory::Durability,
        ErrorCategory::Timeout,
        ErrorCategory::Other,
    ];

    /// Position in [`ErrorCategory::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::VbucketMap => "vbucket_map",
            ErrorCategory::TopologyChange => "topology_change",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::ClientLocal => "client_local",
            ErrorCategory::Durability => "durability",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Other => "other",
        }
    }
}

impl Error {
    /// Classify this error for the retry decision table.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_) => ErrorCategory::Network,
            Error::Topology(TopologyError::NotMyVbucket { .. }) => ErrorCategory::VbucketMap,
            Error::Topology(_) => ErrorCategory::TopologyChange,
            Error::Auth(_) => ErrorCategory::Auth,
            Error::Protocol(_) => ErrorCategory::Protocol,
            Error::InvalidArgument(_) | Error::AllocationFailed(_) | Error::NoConfiguration => {
                ErrorCategory::ClientLocal
            }
            Error::Durability(_) => ErrorCategory::Durability,
            Error::Timeout | Error::BootstrapTimeout => ErrorCategory::Timeout,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this is a network error carrying no detail beyond "it failed".
    ///
    /// Such errors never replace a more specific error already recorded.
    pub fn is_generic_network(&self) -> bool {
        matches!(
            self,
            Error::Network(NetworkError::Generic(_)) | Error::Network(NetworkError::ConnectionReset { .. })
        )
    }

    /// Whether the error came from a refused connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Error::Network(NetworkError::ConnectionRefused { .. }))
    }

    /// Whether the error is a NOT_MY_VBUCKET response.
    pub fn is_not_my_vbucket(&self) -> bool {
        matches!(self, Error::Topology(TopologyError::NotMyVbucket { .. }))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(ProtocolError::InvalidConfig(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let nmv = Error::Topology(TopologyError::NotMyVbucket {
            vbucket: 3,
            server: 1,
        });
        assert_eq!(nmv.category(), ErrorCategory::VbucketMap);
        assert!(nmv.is_not_my_vbucket());

        let moving: Error = TopologyError::ChangeInProgress.into();
        assert_eq!(moving.category(), ErrorCategory::TopologyChange);

        let refused: Error = NetworkError::ConnectionRefused {
            addr: "10.0.0.1:11210".into(),
        }
        .into();
        assert_eq!(refused.category(), ErrorCategory::Network);
        assert!(refused.is_connection_refused());
        assert!(!refused.is_generic_network());

        assert_eq!(Error::NoConfiguration.category(), ErrorCategory::ClientLocal);
        assert_eq!(Error::Timeout.category(), ErrorCategory::Timeout);
        assert_eq!(Error::KeyExists.category(), ErrorCategory::Other);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("missing")));
    }

    #[test]
    fn test_error_display() {
        let err = Error::Durability(DurabilityError::TooManyReplicas {
            requested: 3,
            available: 1,
        });
        assert_eq!(
            err.to_string(),
            "durability error: replicate_to=3 exceeds available replicas (1)"
        );
    }
}
