//! Recording collaborators for driving a session without sockets.

use crate::confmon::ProviderContext;
use crate::durability::ObserveRequest;
use crate::error::{NetworkError, Result};
use crate::io::ManualIo;
use crate::transport::{
    Authenticator, ConfigTransport, Credentials, KvRequest, PacketScheduler, StaticAuthenticator,
};
use crate::types::{HostPort, OperationId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default)]
struct TransportLog {
    fetches: Vec<HostPort>,
    streams: Vec<(HostPort, String)>,
    closed: Vec<HostPort>,
    unreachable: HashSet<HostPort>,
}

/// A [`ConfigTransport`] that records every request.
///
/// Clones share the same log, so a test can keep one handle while the
/// session owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl RecordingTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later request to `host` fail immediately with a refused
    /// connection.
    pub fn refuse(&self, host: HostPort) {
        self.log.lock().unreachable.insert(host);
    }

    /// Hosts asked for a configuration, in order.
    pub fn fetches(&self) -> Vec<HostPort> {
        self.log.lock().fetches.clone()
    }

    /// Streams opened, in order.
    pub fn streams(&self) -> Vec<(HostPort, String)> {
        self.log.lock().streams.clone()
    }

    /// Streams closed, in order.
    pub fn closed(&self) -> Vec<HostPort> {
        self.log.lock().closed.clone()
    }

    fn check(&self, host: &HostPort) -> Result<()> {
        if self.log.lock().unreachable.contains(host) {
            return Err(NetworkError::ConnectionRefused {
                addr: host.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl ConfigTransport for RecordingTransport {
    fn fetch_config(&mut self, host: &HostPort, _credentials: &Credentials) -> Result<()> {
        self.check(host)?;
        self.log.lock().fetches.push(host.clone());
        Ok(())
    }

    fn open_stream(&mut self, host: &HostPort, path: &str, _credentials: &Credentials) -> Result<()> {
        self.check(host)?;
        self.log.lock().streams.push((host.clone(), path.to_string()));
        Ok(())
    }

    fn close_stream(&mut self, host: &HostPort) {
        self.log.lock().closed.push(host.clone());
    }
}

#[derive(Debug, Default)]
struct SchedulerLog {
    requests: Vec<KvRequest>,
    observes: Vec<ObserveRequest>,
    cancelled: Vec<OperationId>,
}

/// A [`PacketScheduler`] that records every packet instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct RecordingScheduler {
    log: Arc<Mutex<SchedulerLog>>,
}

impl RecordingScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key-value requests scheduled so far.
    pub fn requests(&self) -> Vec<KvRequest> {
        self.log.lock().requests.clone()
    }

    /// The most recent key-value request.
    pub fn last_request(&self) -> Option<KvRequest> {
        self.log.lock().requests.last().cloned()
    }

    /// Observe packets scheduled so far.
    pub fn observes(&self) -> Vec<ObserveRequest> {
        self.log.lock().observes.clone()
    }

    /// Remove and return the recorded observe packets.
    pub fn take_observes(&self) -> Vec<ObserveRequest> {
        std::mem::take(&mut self.log.lock().observes)
    }

    /// Operations cancelled so far.
    pub fn cancelled(&self) -> Vec<OperationId> {
        self.log.lock().cancelled.clone()
    }
}

impl PacketScheduler for RecordingScheduler {
    fn schedule(&mut self, request: &KvRequest) -> Result<()> {
        self.log.lock().requests.push(request.clone());
        Ok(())
    }

    fn schedule_observe(&mut self, request: ObserveRequest) -> Result<()> {
        self.log.lock().observes.push(request);
        Ok(())
    }

    fn cancel(&mut self, id: OperationId) {
        self.log.lock().cancelled.push(id);
    }
}

/// Everything a provider needs, owned in one place.
pub struct ProviderHarness {
    pub io: ManualIo,
    pub transport: RecordingTransport,
    pub auth: StaticAuthenticator,
}

impl Default for ProviderHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderHarness {
    /// Create a harness with a fresh clock and an empty transport log.
    pub fn new() -> Self {
        Self {
            io: ManualIo::new(),
            transport: RecordingTransport::new(),
            auth: StaticAuthenticator::new(Credentials::new("Administrator", "password")),
        }
    }

    /// Borrow the harness as a provider context.
    pub fn ctx(&mut self) -> ProviderContext<'_> {
        ProviderContext {
            io: &mut self.io,
            transport: &mut self.transport,
            auth: &self.auth as &dyn Authenticator,
        }
    }
}
