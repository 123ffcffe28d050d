//! Core types used throughout the client runtime.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Index of a server in the active configuration's server list.
pub type ServerIndex = usize;

/// Identifier of a vbucket.
pub type VbucketId = u16;

/// Opaque per-document version token.
pub type Cas = u64;

/// Opaque identifier of a scheduled key-value operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Create a new host/port pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid host:port '{}'", s));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// Key-value command kinds known to the routing and retry layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    GetReplica,
    GetAndTouch,
    GetAndLock,
    Touch,
    Unlock,
    Stat,
    Observe,
    Noop,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Delete,
    Increment,
    Decrement,
}

impl Opcode {
    /// Whether the command leaves the document unchanged.
    ///
    /// Commands that refresh expiry or take a lock count as mutations.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Opcode::Get | Opcode::GetReplica | Opcode::Stat | Opcode::Observe | Opcode::Noop
        )
    }

    /// Whether re-sending the command is safe, given whether it carries a CAS.
    pub fn is_idempotent(self, has_cas: bool) -> bool {
        self.is_read_only() || has_cas
    }
}

/// Status of a key-value response as reported by the data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvStatus {
    Success,
    KeyNotFound,
    KeyExists,
    NotMyVbucket,
    TemporaryFailure,
    AuthError,
    UnknownBucket,
    ConfigOnly,
}

impl KvStatus {
    /// Convert a non-success status to an error, given where it was routed.
    pub fn to_error(self, vbucket: VbucketId, server: ServerIndex) -> Option<Error> {
        use crate::error::{ProtocolError, TopologyError};

        match self {
            KvStatus::Success => None,
            KvStatus::KeyNotFound => Some(Error::KeyNotFound),
            KvStatus::KeyExists => Some(Error::KeyExists),
            KvStatus::NotMyVbucket => Some(TopologyError::NotMyVbucket { vbucket, server }.into()),
            KvStatus::TemporaryFailure => Some(Error::TemporaryFailure),
            KvStatus::AuthError => Some(Error::Auth(format!("rejected by server {}", server))),
            KvStatus::UnknownBucket => {
                Some(ProtocolError::UnknownBucket(format!("server {}", server)).into())
            }
            KvStatus::ConfigOnly => Some(TopologyError::ChangeInProgress.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_parse() {
        let hp: HostPort = "10.0.0.1:11210".parse().unwrap();
        assert_eq!(hp, HostPort::new("10.0.0.1", 11210));
        assert_eq!(hp.to_string(), "10.0.0.1:11210");

        let v6: HostPort = "[::1]:8091".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8091");

        assert!("nohost".parse::<HostPort>().is_err());
        assert!(":11210".parse::<HostPort>().is_err());
        assert!("host:notaport".parse::<HostPort>().is_err());
    }

    #[test]
    fn test_opcode_idempotency() {
        assert!(Opcode::Get.is_idempotent(false));
        assert!(Opcode::Stat.is_idempotent(false));
        assert!(!Opcode::Set.is_idempotent(false));
        assert!(Opcode::Replace.is_idempotent(true));
        assert!(!Opcode::Touch.is_read_only());
        assert!(!Opcode::GetAndLock.is_read_only());
    }

    #[test]
    fn test_status_to_error() {
        assert_eq!(KvStatus::Success.to_error(1, 0), None);
        assert!(KvStatus::NotMyVbucket
            .to_error(7, 2)
            .map(|e| e.is_not_my_vbucket())
            .unwrap_or(false));
    }
}
