//! Collaborator interfaces consumed by the runtime.
//!
//! Packet encoding, sockets and SASL live behind these traits. Every
//! request made through them is answered later by calling back into the
//! [`Session`](crate::Session).

use crate::durability::ObserveRequest;
use crate::error::Result;
use crate::types::{Cas, HostPort, KvStatus, Opcode, OperationId, ServerIndex, VbucketId};
use bytes::Bytes;
use std::fmt;

/// Username and password for one node.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies credentials on demand.
pub trait Authenticator: Send {
    /// Credentials to present to `host`.
    fn credentials(&self, host: &HostPort) -> Credentials;
}

/// The same credentials for every node.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    credentials: Credentials,
}

impl StaticAuthenticator {
    /// Create an authenticator returning `credentials` for every host.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl Authenticator for StaticAuthenticator {
    fn credentials(&self, _host: &HostPort) -> Credentials {
        self.credentials.clone()
    }
}

/// Fetches configuration blobs.
pub trait ConfigTransport: Send {
    /// Ask `host` for its configuration over the data port. The outcome is
    /// delivered through `Session::on_config_fetched`.
    fn fetch_config(&mut self, host: &HostPort, credentials: &Credentials) -> Result<()>;

    /// Open a long-lived HTTP stream to `path` on `host`. Body bytes are
    /// delivered through `Session::on_http_stream_data`, closure through
    /// `Session::on_http_stream_closed`.
    fn open_stream(&mut self, host: &HostPort, path: &str, credentials: &Credentials) -> Result<()>;

    /// Close the stream to `host`, if open.
    fn close_stream(&mut self, host: &HostPort);
}

/// A routed key-value command ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRequest {
    pub id: OperationId,
    pub opcode: Opcode,
    pub key: Bytes,
    pub cas: Option<Cas>,
    pub vbucket: VbucketId,
    pub server: ServerIndex,
    /// Zero for the first send.
    pub attempt: u32,
}

/// Decoded response header of one key-value command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse {
    pub status: KvStatus,
    pub cas: Cas,
    /// Configuration carried in the body, as sent with NOT_MY_VBUCKET.
    pub config: Option<Bytes>,
}

impl KvResponse {
    /// A successful response.
    pub fn success(cas: Cas) -> Self {
        Self {
            status: KvStatus::Success,
            cas,
            config: None,
        }
    }

    /// A response with `status` and no body.
    pub fn status(status: KvStatus) -> Self {
        Self {
            status,
            cas: 0,
            config: None,
        }
    }

    /// Attach a configuration body.
    pub fn with_config(mut self, config: impl Into<Bytes>) -> Self {
        self.config = Some(config.into());
        self
    }
}

/// Accepts routed commands for transmission.
pub trait PacketScheduler: Send {
    /// Queue `request` on its server's pipeline. The response is delivered
    /// through `Session::on_kv_response`.
    fn schedule(&mut self, request: &KvRequest) -> Result<()>;

    /// Queue an observe packet. The response is delivered through
    /// `Session::on_observe_response`.
    fn schedule_observe(&mut self, request: ObserveRequest) -> Result<()>;

    /// Forget an in-flight request whose outcome is no longer wanted.
    fn cancel(&mut self, _id: OperationId) {}
}
