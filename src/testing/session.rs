//! A session wired to recording collaborators and a manual clock.

use super::fixtures;
use super::harness::{RecordingScheduler, RecordingTransport};
use crate::config::{ClientConfig, ProviderConfig};
use crate::error::Result;
use crate::io::{IoCapability, ManualIo};
use crate::operation::OperationResponse;
use crate::session::Session;
use crate::transport::{Credentials, StaticAuthenticator};
use crate::types::{Opcode, OperationId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Collects values handed to callbacks.
#[derive(Debug)]
pub struct Captured<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Captured<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for Captured<T> {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Send + 'static> Captured<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that records its argument.
    pub fn sink(&self) -> impl FnOnce(T) + Send + 'static {
        let values = Arc::clone(&self.values);
        move |value| values.lock().push(value)
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl<T: Clone + Send + 'static> Captured<T> {
    /// Everything recorded so far.
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    /// The only recorded value. `None` when zero or several were recorded.
    pub fn single(&self) -> Option<T> {
        match self.values.lock().as_slice() {
            [value] => Some(value.clone()),
            _ => None,
        }
    }
}

/// A [`Session`] over [`ManualIo`] plus handles on what it sent.
pub struct TestSession {
    pub session: Session<ManualIo>,
    pub transport: RecordingTransport,
    pub scheduler: RecordingScheduler,
}

impl TestSession {
    /// Build a session from `settings`.
    pub fn new(settings: ClientConfig) -> Self {
        let transport = RecordingTransport::new();
        let scheduler = RecordingScheduler::new();
        let session = Session::new(
            settings,
            ManualIo::new(),
            Box::new(transport.clone()),
            Box::new(scheduler.clone()),
            Box::new(StaticAuthenticator::new(Credentials::new(
                "Administrator",
                "password",
            ))),
        );
        Self {
            session,
            transport,
            scheduler,
        }
    }

    /// Settings seeded with the first `n` fixture data hosts, push provider
    /// only, hosts tried in order.
    pub fn settings(n: usize) -> ClientConfig {
        ClientConfig::new("default")
            .with_kv_hosts((0..n).map(fixtures::kv_host).collect())
            .with_provider_config(ProviderConfig {
                enable_http: false,
                ..ProviderConfig::default()
            })
    }

    /// A session over `n` fixture hosts, not yet bootstrapped.
    pub fn with_kv_hosts(n: usize) -> Self {
        Self::new(Self::settings(n))
    }

    /// A session that bootstrapped from `config` served by the first host.
    pub fn bootstrapped(n: usize, config: &str) -> Self {
        let mut t = Self::with_kv_hosts(n);
        let done = t.bootstrap();
        t.deliver_config(0, config);
        assert_eq!(done.values(), vec![Ok(())], "bootstrap did not complete");
        t
    }

    /// Start the initial bootstrap.
    pub fn bootstrap(&mut self) -> Captured<Result<()>> {
        let done = Captured::new();
        self.session.bootstrap(done.sink());
        done
    }

    /// Answer the push-protocol request sent to fixture host `server`.
    pub fn deliver_config(&mut self, server: usize, config: &str) {
        let payload = Bytes::copy_from_slice(config.as_bytes());
        self.session
            .on_config_fetched(&fixtures::kv_host(server), Ok(payload));
    }

    /// Schedule a read of `key`.
    pub fn get(&mut self, key: &str) -> (OperationId, Captured<Result<OperationResponse>>) {
        self.schedule(Opcode::Get, key)
    }

    /// Schedule `opcode` on `key` without a CAS.
    pub fn schedule(
        &mut self,
        opcode: Opcode,
        key: &str,
    ) -> (OperationId, Captured<Result<OperationResponse>>) {
        let done = Captured::new();
        let id = self
            .session
            .schedule(opcode, Bytes::copy_from_slice(key.as_bytes()), None, done.sink())
            .expect("schedule rejected");
        (id, done)
    }

    /// Move the clock forward by `by`, firing every timer that comes due on
    /// the way, in deadline order.
    pub fn advance(&mut self, by: Duration) {
        let until = self.session.io().now() + by;
        while let Some(timer) = self.session.io_mut().pop_expired(until) {
            self.session.on_timer(timer);
        }
        self.session.io_mut().set_now(until);
    }
}
