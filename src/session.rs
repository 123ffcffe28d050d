//! The client session: one explicit context owning every component.
//!
//! Each inbound event (a timer, a response, a socket failure, a
//! configuration blob) is handled to completion by one method call. A
//! configuration adopted during that call has rebuilt the router before
//! anything else observes it.
//!
//! ```text
//!   schedule() ──► route ──► PacketScheduler ──► in-flight table
//!                                                     │
//!           on_kv_response / on_server_failure ◄──────┘
//!                     │
//!                     ▼
//!             RetryClassifier ──Fail──► callback(Err)
//!                     │
//!                     ▼
//!               RetryQueue ──(timer / GotNewConfig)──► route again
//!
//!   ConfigMonitor events ──► router.rebuild ──► Bootstrap ──► listeners
//!                                                  │
//!                                      backlog dispatched / failed
//! ```

use crate::bootstrap::{Bootstrap, BootstrapOptions, RefreshOutcome, TimerOutcome};
use crate::config::ClientConfig;
use crate::confmon::{
    ConfigEvent, ConfigListener, ConfigMonitor, FileProvider, HostList, HttpProvider,
    ProviderContext, PushProvider,
};
use crate::durability::{DurabilityCommand, DurabilityOptions, DurabilityPoller, SetId};
use crate::error::{Error, ErrorCategory, Result};
use crate::io::{IoCapability, TimerId};
use crate::metrics::ClientMetrics;
use crate::operation::{OperationCallback, OperationResponse, PendingOperation};
use crate::retry::{FlushOutcome, RetryAction, RetryClassifier, RetryQueue, RetryStrategy};
use crate::topology::{ClusterConfig, VBucketRouter};
use crate::transport::{Authenticator, ConfigTransport, KvResponse, PacketScheduler};
use crate::types::{Cas, HostPort, Opcode, OperationId, ServerIndex, VbucketId};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Borrow the session's collaborators as a provider context.
macro_rules! provider_ctx {
    ($session:expr) => {
        ProviderContext {
            io: &mut $session.io,
            transport: $session.transport.as_mut(),
            auth: $session.auth.as_ref(),
        }
    };
}

/// A client session over the I/O backend `I`.
pub struct Session<I: IoCapability> {
    settings: ClientConfig,
    io: I,
    transport: Box<dyn ConfigTransport>,
    scheduler: Box<dyn PacketScheduler>,
    auth: Box<dyn Authenticator>,
    monitor: ConfigMonitor,
    bootstrap: Bootstrap,
    router: VBucketRouter,
    classifier: RetryClassifier,
    retry_queue: RetryQueue,
    durability: DurabilityPoller,
    inflight: HashMap<OperationId, (ServerIndex, PendingOperation)>,
    /// Operations scheduled before the first configuration.
    backlog: Vec<PendingOperation>,
    /// Deadline the operation-timeout timer is armed for.
    timeout_deadline: Option<Instant>,
    next_op: u64,
    metrics: Arc<ClientMetrics>,
}

impl<I: IoCapability> fmt::Debug for Session<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bucket", &self.settings.bucket)
            .field("monitor", &self.monitor)
            .field("bootstrap", &self.bootstrap)
            .field("revision", &self.router.revision())
            .field("inflight", &self.inflight.len())
            .field("retry_queue", &self.retry_queue.len())
            .field("backlog", &self.backlog.len())
            .field("durability_sets", &self.durability.len())
            .finish()
    }
}

impl<I: IoCapability> Session<I> {
    /// Create a session. Providers are registered from `settings`; nothing
    /// is fetched until [`Session::bootstrap`].
    pub fn new(
        settings: ClientConfig,
        io: I,
        transport: Box<dyn ConfigTransport>,
        scheduler: Box<dyn PacketScheduler>,
        auth: Box<dyn Authenticator>,
    ) -> Self {
        let mut monitor = ConfigMonitor::new(settings.bootstrap.grace_next_provider);
        let providers = &settings.providers;
        if let Some(path) = &providers.cache_file {
            monitor.add_provider(Box::new(FileProvider::new(path.clone())));
        }
        if providers.enable_push {
            monitor.add_provider(Box::new(PushProvider::new(
                HostList::new(settings.kv_hosts.iter().cloned()),
                providers.node_timeout,
                settings.randomize_hosts,
            )));
        }
        if providers.enable_http {
            monitor.add_provider(Box::new(HttpProvider::new(
                HostList::new(settings.http_hosts.iter().cloned()),
                settings.bucket.clone(),
                settings.randomize_hosts,
            )));
        }

        Self {
            bootstrap: Bootstrap::new(settings.bootstrap.clone()),
            classifier: RetryClassifier::new(settings.retry.clone()),
            retry_queue: RetryQueue::new(settings.retry.retry_interval),
            durability: DurabilityPoller::new(settings.durability.clone()),
            router: VBucketRouter::new(),
            monitor,
            settings,
            io,
            transport,
            scheduler,
            auth,
            inflight: HashMap::new(),
            backlog: Vec::new(),
            timeout_deadline: None,
            next_op: 1,
            metrics: Arc::new(ClientMetrics::new()),
        }
    }

    /// Replace the built-in retry table with `strategy`.
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.classifier = RetryClassifier::new(self.settings.retry.clone()).with_strategy(strategy);
        self
    }

    /// Register a listener for configuration events.
    pub fn add_listener(&mut self, listener: Arc<dyn ConfigListener>) {
        self.monitor.add_listener(listener);
    }

    pub fn settings(&self) -> &ClientConfig {
        &self.settings
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    pub fn router(&self) -> &VBucketRouter {
        &self.router
    }

    pub fn monitor(&self) -> &ConfigMonitor {
        &self.monitor
    }

    pub fn durability(&self) -> &DurabilityPoller {
        &self.durability
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The active configuration.
    pub fn config(&self) -> Option<Arc<ClusterConfig>> {
        self.monitor.get_config()
    }

    /// Operations sent and awaiting a response.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// Operations waiting for the first configuration.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Outcome of the initial bootstrap so far.
    pub fn bootstrap_status(&self) -> Result<()> {
        self.bootstrap.bootstrap_status()
    }

    // ----- bootstrap and configuration -----

    /// Start the initial bootstrap. `callback` fires exactly once.
    pub fn bootstrap(&mut self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.bootstrap.set_callback(Box::new(callback));
        self.refresh(BootstrapOptions::Initial);
    }

    /// Request a configuration refresh.
    pub fn refresh(&mut self, options: BootstrapOptions) {
        let outcome = {
            let mut ctx = provider_ctx!(self);
            self.bootstrap.bootstrap(options, &mut self.monitor, &mut ctx)
        };
        self.apply_refresh(outcome);
        self.update_gauges();
    }

    fn apply_refresh(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Started(events) => self.apply_events(events),
            RefreshOutcome::Throttled => self.metrics.refreshes_throttled.inc(),
            RefreshOutcome::AlreadyRefreshing => {}
        }
    }

    /// A push-protocol configuration request completed.
    pub fn on_config_fetched(&mut self, host: &HostPort, result: Result<Bytes>) {
        let events = {
            let mut ctx = provider_ctx!(self);
            self.monitor.on_config_fetched(host, result, &mut ctx)
        };
        self.apply_events(events);
        self.update_gauges();
    }

    /// A configuration arrived unasked on a data connection.
    pub fn on_config_pushed(&mut self, host: &HostPort, payload: &[u8]) {
        let events = {
            let mut ctx = provider_ctx!(self);
            self.monitor.on_config_pushed(host, payload, &mut ctx)
        };
        self.apply_events(events);
        self.update_gauges();
    }

    /// Bytes arrived on the HTTP configuration stream.
    pub fn on_http_stream_data(&mut self, host: &HostPort, data: &[u8]) {
        let events = {
            let mut ctx = provider_ctx!(self);
            self.monitor.on_stream_data(host, data, &mut ctx)
        };
        self.apply_events(events);
        self.update_gauges();
    }

    /// The HTTP configuration stream closed.
    pub fn on_http_stream_closed(&mut self, host: &HostPort, error: Error) {
        let events = {
            let mut ctx = provider_ctx!(self);
            self.monitor.on_stream_closed(host, error, &mut ctx)
        };
        self.apply_events(events);
        self.update_gauges();
    }

    /// Apply monitor events in order: router first, then bootstrap, then
    /// listeners, then the operations waiting on a new map.
    fn apply_events(&mut self, events: Vec<ConfigEvent>) {
        for event in events {
            if let ConfigEvent::GotNewConfig { config, .. } = &event {
                self.router.rebuild(Arc::clone(config));
                self.metrics.configs_adopted.inc();
            }

            let settled = {
                let mut ctx = provider_ctx!(self);
                self.bootstrap.on_event(&event, &mut self.monitor, &mut ctx)
            };
            self.monitor.notify_listeners(&event);

            match settled {
                Some(Ok(())) => self.drain_backlog(),
                Some(Err(error)) => self.fail_backlog(error),
                None => {}
            }

            if event.is_new_config() {
                let now = self.io.now();
                let outcome = self.retry_queue.flush_topology(now, &self.router);
                self.handle_flush(outcome);
            }
        }
    }

    // ----- operations -----

    /// Schedule one key-value operation.
    ///
    /// Errors returned here mean the operation was never accepted and
    /// `callback` is dropped uncalled. Otherwise `callback` fires exactly
    /// once.
    pub fn schedule(
        &mut self,
        opcode: Opcode,
        key: impl Into<Bytes>,
        cas: Option<Cas>,
        callback: impl FnOnce(Result<OperationResponse>) + Send + 'static,
    ) -> Result<OperationId> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        if self.router.config().is_none() {
            if let Err(error) = self.bootstrap.bootstrap_status() {
                if error != Error::NoConfiguration {
                    return Err(error);
                }
            }
        }

        let id = OperationId(self.next_op);
        self.next_op += 1;
        let deadline = self.io.now() + self.settings.retry.operation_timeout;
        let callback: OperationCallback = Box::new(callback);
        let op = PendingOperation::new(id, opcode, key, cas, deadline, callback);
        self.metrics.operations_scheduled.inc();

        if self.router.config().is_none() {
            tracing::debug!(op = %id, "No configuration yet, deferring command");
            self.backlog.push(op);
        } else {
            self.dispatch(op);
        }
        self.update_gauges();
        Ok(id)
    }

    /// Cancel an operation. Its callback fires with [`Error::Cancelled`].
    pub fn cancel(&mut self, id: OperationId) -> bool {
        let op = if let Some((_, op)) = self.inflight.remove(&id) {
            self.scheduler.cancel(id);
            Some(op)
        } else if let Some(op) = self.retry_queue.take(id) {
            Some(op)
        } else {
            let pos = self.backlog.iter().position(|op| op.id() == id);
            pos.map(|pos| self.backlog.remove(pos))
        };
        let Some(op) = op else {
            return false;
        };
        tracing::debug!(op = %id, "Cancelling command");
        op.complete(Err(Error::Cancelled));
        self.rearm_retry_queue();
        self.update_gauges();
        true
    }

    fn dispatch(&mut self, op: PendingOperation) {
        match self.router.route_key(op.key()) {
            Ok(route) => match route.server {
                Some(server) => self.send(op, route.vbucket, server),
                None if self.classifier.config().retry_on_missing_node => {
                    let now = self.io.now();
                    let reason = Error::NoMatchingServer(format!("vbucket {} has no master", route.vbucket));
                    let delay = self.classifier.config().retry_interval;
                    self.retry_queue.enqueue(op, reason, now, delay);
                    self.rearm_retry_queue();
                }
                None => self.finish_failed(
                    op,
                    Error::NoMatchingServer(format!("vbucket {} has no master", route.vbucket)),
                ),
            },
            Err(error) => self.finish_failed(op, error),
        }
    }

    fn send(&mut self, mut op: PendingOperation, vbucket: VbucketId, server: ServerIndex) {
        op.set_route(vbucket, Some(server));
        let request = op.to_request(server);
        match self.scheduler.schedule(&request) {
            Ok(()) => {
                tracing::trace!(op = %op.id(), vbucket, server, attempt = request.attempt, "Command sent");
                let deadline = op.deadline();
                self.inflight.insert(op.id(), (server, op));
                if self.timeout_deadline.map_or(true, |armed| deadline < armed) {
                    self.timeout_deadline = Some(deadline);
                    self.io.arm_at(TimerId::OperationTimeouts, deadline);
                }
            }
            Err(error) => {
                tracing::debug!(op = %op.id(), server, error = %error, "Could not send command");
                self.retry_or_fail(op, error);
            }
        }
    }

    /// A response for an in-flight operation.
    pub fn on_kv_response(&mut self, id: OperationId, response: KvResponse) {
        let Some((server, op)) = self.inflight.remove(&id) else {
            tracing::trace!(op = %id, "Response for unknown command");
            return;
        };
        let vbucket = op.vbucket();

        let Some(error) = response.status.to_error(vbucket, server) else {
            let result = OperationResponse {
                id,
                cas: response.cas,
                vbucket,
                server,
                retries: op.retries(),
            };
            op.complete(Ok(result));
            self.update_gauges();
            return;
        };

        let payload = response.config.filter(|c| !c.is_empty());
        if error.is_not_my_vbucket() {
            tracing::debug!(op = %id, vbucket, server, "Received NOT_MY_VBUCKET");
            if payload.is_none() {
                self.router.guess_remap(vbucket, server);
            }
        }
        let category = error.category();
        self.retry_or_fail(op, error);

        match payload {
            Some(payload) => self.config_from_server(server, &payload),
            None if matches!(category, ErrorCategory::VbucketMap | ErrorCategory::TopologyChange) => {
                self.refresh(BootstrapOptions::RefreshThrottled { incr_err: false });
            }
            None => {}
        }
        self.update_gauges();
    }

    fn config_from_server(&mut self, server: ServerIndex, payload: &[u8]) {
        let Some(host) = self.router.config().and_then(|c| c.servers().get(server).cloned()) else {
            tracing::debug!(server, "Ignoring configuration from unknown server");
            return;
        };
        self.on_config_pushed(&host, payload);
    }

    /// The connection to `server` failed. Every operation in flight on it
    /// goes through the retry classifier.
    pub fn on_server_failure(&mut self, server: ServerIndex, error: Error) {
        let mut ids: Vec<OperationId> = self
            .inflight
            .iter()
            .filter(|(_, (s, _))| *s == server)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        tracing::info!(server, error = %error, inflight = ids.len(), "Server connection failed");

        for id in ids {
            if let Some((_, op)) = self.inflight.remove(&id) {
                self.retry_or_fail(op, error.clone());
            }
        }
        self.durability.on_server_failure(server, &error, &mut self.io);
        self.refresh(BootstrapOptions::RefreshThrottled { incr_err: true });
        self.update_gauges();
    }

    fn retry_or_fail(&mut self, mut op: PendingOperation, error: Error) {
        let now = self.io.now();
        let action = self
            .classifier
            .should_retry(&mut op, &error, now, self.router.revision());
        let delay = match action {
            RetryAction::Fail => {
                let error = if op.is_expired(now) { Error::Timeout } else { error };
                self.finish_failed(op, error);
                return;
            }
            RetryAction::Now => Duration::ZERO,
            RetryAction::After(delay) => delay,
        };
        self.metrics.record_retry(error.category());
        self.retry_queue.enqueue(op, error, now, delay);
        self.rearm_retry_queue();
    }

    fn finish_failed(&self, op: PendingOperation, requested: Error) {
        let (id, retries) = (op.id(), op.retries());
        let error = op.fail(requested);
        tracing::warn!(op = %id, retries, error = %error, "Failing command");
        self.metrics.record_failure(error == Error::Timeout);
    }

    fn handle_flush(&mut self, outcome: FlushOutcome) {
        for (op, error) in outcome.expired {
            self.finish_failed(op, error);
        }
        for (op, vbucket, server) in outcome.dispatch {
            self.send(op, vbucket, server);
        }
        if !outcome.unroutable.is_empty() {
            self.refresh(BootstrapOptions::RefreshThrottled { incr_err: false });
            let keep =
                self.monitor.is_refreshing() || self.classifier.config().retry_on_missing_node;
            let now = self.io.now();
            for entry in outcome.unroutable {
                if keep {
                    self.retry_queue.requeue_unroutable(entry, now);
                } else {
                    let error = Error::NoMatchingServer(format!(
                        "vbucket {} has no master",
                        entry.op.vbucket()
                    ));
                    self.finish_failed(entry.op, error);
                }
            }
        }
        self.rearm_retry_queue();
    }

    fn rearm_retry_queue(&mut self) {
        match self.retry_queue.next_wakeup() {
            Some(at) => self.io.arm_at(TimerId::RetryQueue, at),
            None => self.io.disarm(TimerId::RetryQueue),
        }
    }

    fn drain_backlog(&mut self) {
        let backlog = std::mem::take(&mut self.backlog);
        if !backlog.is_empty() {
            tracing::debug!(count = backlog.len(), "Dispatching deferred commands");
        }
        for op in backlog {
            self.dispatch(op);
        }
    }

    fn fail_backlog(&mut self, error: Error) {
        for op in std::mem::take(&mut self.backlog) {
            self.finish_failed(op, error.clone());
        }
    }

    fn expire_operations(&mut self) {
        let now = self.io.now();
        let mut expired: Vec<OperationId> = self
            .inflight
            .iter()
            .filter(|(_, (_, op))| op.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in expired {
            if let Some((_, op)) = self.inflight.remove(&id) {
                self.scheduler.cancel(id);
                self.finish_failed(op, Error::Timeout);
            }
        }

        self.timeout_deadline = self.inflight.values().map(|(_, op)| op.deadline()).min();
        match self.timeout_deadline {
            Some(deadline) => self.io.arm_at(TimerId::OperationTimeouts, deadline),
            None => self.io.disarm(TimerId::OperationTimeouts),
        }
    }

    // ----- timers -----

    /// Dispatch an expired timer.
    pub fn on_timer(&mut self, timer: TimerId) {
        match timer {
            TimerId::Bootstrap | TimerId::BackgroundPoll => {
                let outcome = {
                    let mut ctx = provider_ctx!(self);
                    self.bootstrap.on_timer(timer, &mut self.monitor, &mut ctx)
                };
                match outcome {
                    TimerOutcome::Failed(error) => self.fail_backlog(error),
                    TimerOutcome::Refreshed(refresh) => self.apply_refresh(refresh),
                    TimerOutcome::Ignored => {}
                }
            }
            TimerId::ProviderGrace | TimerId::ProviderRequest => {
                let events = {
                    let mut ctx = provider_ctx!(self);
                    self.monitor.on_timer(timer, &mut ctx)
                };
                self.apply_events(events);
            }
            TimerId::RetryQueue => {
                let now = self.io.now();
                let outcome = self.retry_queue.flush(now, true, &self.router);
                self.handle_flush(outcome);
            }
            TimerId::OperationTimeouts => self.expire_operations(),
            TimerId::Durability(set) => {
                self.durability
                    .on_timer(set, &self.router, &mut self.io, self.scheduler.as_mut());
            }
        }
        self.update_gauges();
    }

    // ----- durability -----

    /// Wait until every key in `commands` meets `options`.
    ///
    /// Requests the cluster cannot satisfy are rejected here; their
    /// callbacks are dropped uncalled.
    pub fn durability_poll(
        &mut self,
        commands: Vec<DurabilityCommand>,
        mut options: DurabilityOptions,
    ) -> Result<SetId> {
        options.cap_max |= self.settings.durability.cap_max;
        let commands = commands
            .into_iter()
            .map(|command| self.instrument(command))
            .collect();
        let set = self.durability.poll(
            commands,
            options,
            &self.router,
            &mut self.io,
            self.scheduler.as_mut(),
        )?;
        self.update_gauges();
        Ok(set)
    }

    fn instrument(&self, command: DurabilityCommand) -> DurabilityCommand {
        let metrics = Arc::clone(&self.metrics);
        let DurabilityCommand { key, cas, callback } = command;
        DurabilityCommand::new(key, cas, move |result| {
            if result.result.is_ok() {
                metrics.durability_completed.inc();
            } else {
                metrics.durability_failed.inc();
            }
            callback(result)
        })
    }

    /// Observe results from `server` for `set`.
    pub fn on_observe_response(&mut self, set: SetId, server: ServerIndex, body: &[u8]) -> Result<()> {
        let result = self
            .durability
            .on_observe_response(set, server, body, &self.router);
        self.update_gauges();
        result
    }

    /// `server` finished answering its observe packet for `set`.
    pub fn on_observe_done(&mut self, set: SetId, server: ServerIndex, error: Option<Error>) {
        self.durability.on_observe_done(set, server, error, &mut self.io);
        self.update_gauges();
    }

    /// Cancel a durability request; pending keys fail with
    /// [`Error::Cancelled`].
    pub fn durability_cancel(&mut self, set: SetId) -> bool {
        let cancelled = self.durability.cancel(set, &mut self.io);
        self.update_gauges();
        cancelled
    }

    // ----- teardown -----

    /// Stop every timer and fail everything outstanding with
    /// [`Error::Cancelled`].
    pub fn shutdown(&mut self) {
        tracing::info!(bucket = %self.settings.bucket, "Shutting down session");
        let events = {
            let mut ctx = provider_ctx!(self);
            self.bootstrap.shutdown(&mut ctx);
            self.monitor.stop(&mut ctx)
        };
        for event in &events {
            self.monitor.notify_listeners(event);
        }

        self.fail_backlog(Error::Cancelled);
        let mut inflight: Vec<_> = self.inflight.drain().collect();
        inflight.sort_by_key(|(id, _)| *id);
        for (id, (_, op)) in inflight {
            self.scheduler.cancel(id);
            op.complete(Err(Error::Cancelled));
        }
        for op in self.retry_queue.drain() {
            op.complete(Err(Error::Cancelled));
        }
        self.durability.cancel_all(&mut self.io);

        self.timeout_deadline = None;
        self.io.disarm(TimerId::RetryQueue);
        self.io.disarm(TimerId::OperationTimeouts);
        self.update_gauges();
    }

    fn update_gauges(&self) {
        self.metrics.inflight_operations.set(self.inflight.len() as i64);
        self.metrics.retry_queue_depth.set(self.retry_queue.len() as i64);
        self.metrics.durability_sets.set(self.durability.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::testing::{fixtures, Captured, TestSession};
    use crate::types::KvStatus;

    #[test]
    fn test_schedule_before_bootstrap_is_deferred() {
        let mut t = TestSession::with_kv_hosts(3);
        let bootstrapped = t.bootstrap();
        let (id, done) = t.get("foo");
        assert_eq!(t.session.backlog_len(), 1);
        assert!(t.scheduler.requests().is_empty());

        t.deliver_config(0, &fixtures::three_node_json(1, 0));
        assert_eq!(bootstrapped.values(), vec![Ok(())]);
        let request = t.scheduler.last_request().unwrap();
        assert_eq!((request.id, request.vbucket, request.server), (id, 115, 1));

        t.session.on_kv_response(id, KvResponse::success(7));
        let response = done.single().unwrap().unwrap();
        assert_eq!((response.cas, response.server, response.retries), (7, 1, 0));
        assert_eq!(t.session.inflight_count(), 0);
    }

    #[test]
    fn test_bootstrap_failure_fails_backlog() {
        let mut t = TestSession::with_kv_hosts(1);
        let bootstrapped = t.bootstrap();
        let (_, done) = t.get("foo");

        t.advance(Duration::from_secs(6));
        assert_eq!(bootstrapped.len(), 1);
        let error = done.single().unwrap().unwrap_err();
        assert!(matches!(error, Error::Network(NetworkError::ConnectTimeout { .. })));
        assert!(t.session.bootstrap_status().is_err());

        let rejected = t.session.schedule(Opcode::Get, &b"bar"[..], None, |_| {});
        assert!(rejected.is_err());
    }

    #[test]
    fn test_operation_timeout_reports_original_error() {
        let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
        let (_, done) = t.get("foo");

        // Idempotent read: a network failure is retried.
        let refused: Error = NetworkError::ConnectionRefused { addr: "10.0.0.2:11210".into() }.into();
        t.session.on_server_failure(1, refused.clone());
        assert_eq!(t.session.retry_queue_len(), 1);
        assert!(done.is_empty());

        // Every resend fails the same way until the deadline.
        for _ in 0..1000 {
            if !done.is_empty() {
                break;
            }
            t.advance(Duration::from_millis(50));
            if t.session.inflight_count() > 0 {
                t.session.on_server_failure(1, refused.clone());
            }
        }
        assert_eq!(done.single().unwrap().unwrap_err(), refused);
        let snapshot = t.session.metrics().snapshot();
        assert_eq!((snapshot.operations_failed, snapshot.operations_timed_out), (1, 0));
    }

    #[test]
    fn test_mutation_not_retried_on_network_error() {
        let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
        let done: Captured<Result<OperationResponse>> = Captured::new();
        t.session
            .schedule(Opcode::Set, &b"foo"[..], None, done.sink())
            .unwrap();
        let refused: Error = NetworkError::ConnectionRefused { addr: "x".into() }.into();
        t.session.on_server_failure(1, refused.clone());
        assert_eq!(done.single().unwrap().unwrap_err(), refused);
        assert_eq!(t.session.retry_queue_len(), 0);
    }

    #[test]
    fn test_key_not_found_fails_immediately() {
        let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
        let (id, done) = t.get("foo");
        t.session.on_kv_response(id, KvResponse::status(KvStatus::KeyNotFound));
        assert_eq!(done.single().unwrap(), Err(Error::KeyNotFound));
        assert_eq!(t.session.metrics().snapshot().operations_failed, 1);
    }

    #[test]
    fn test_nmv_without_config_uses_guess() {
        let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
        let (id, done) = t.get("foo");

        t.session.on_kv_response(id, KvResponse::status(KvStatus::NotMyVbucket));
        assert!(t.session.router().has_guess(115));
        assert_eq!(t.session.retry_queue_len(), 1);

        t.advance(Duration::from_millis(100));
        let resent = t.scheduler.last_request().unwrap();
        assert_eq!(resent.id, id);
        assert_ne!(resent.server, 1);
        assert_eq!(resent.attempt, 1);

        t.session.on_kv_response(id, KvResponse::success(1));
        assert_eq!(done.single().unwrap().unwrap().retries, 1);
    }

    #[test]
    fn test_cancel_fires_callback_once() {
        let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(1, 0));
        let (id, done) = t.get("foo");
        assert!(t.session.cancel(id));
        assert!(!t.session.cancel(id));
        assert_eq!(done.values(), vec![Err(Error::Cancelled)]);
        assert_eq!(t.scheduler.cancelled(), vec![id]);

        t.session.on_kv_response(id, KvResponse::success(1));
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let mut t = TestSession::with_kv_hosts(3);
        let bootstrapped = t.bootstrap();
        let (_, deferred) = t.get("foo");
        t.session.shutdown();
        assert_eq!(bootstrapped.values(), vec![Err(Error::Cancelled)]);
        assert_eq!(deferred.values(), vec![Err(Error::Cancelled)]);
        assert_eq!(t.session.io().armed_count(), 0);
    }
}
