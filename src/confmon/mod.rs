//! Configuration monitor.
//!
//! Owns the configuration providers and the single active
//! [`ClusterConfig`]. Providers are tried in priority order (file cache,
//! push protocol, HTTP stream); a candidate is adopted only if it
//! supersedes the active configuration.
//!
//! # Refresh cycle
//!
//! ```text
//!   start()
//!     │
//!     ▼
//!   cached config newer? ──yes──► adopt ──► stop ──► GotNewConfig
//!     │ no
//!     ▼
//!   current provider.refresh()
//!     │
//!     ├── Config(candidate) ──► adopt if newer ──► stop
//!     │
//!     ├── Failed(err) ──► record last error
//!     │                     │
//!     └── Exhausted ────────┤
//!                           │
//!             next provider? ──yes──► (grace delay once configured) ──► refresh
//!                           │ no
//!                           ▼
//!                    ProvidersCycled ──► rewind ──► stop
//! ```
//!
//! Methods that can change state return the [`ConfigEvent`]s they raised,
//! in order. The caller applies them (router rebuild first) and then hands
//! them to [`ConfigMonitor::notify_listeners`].

mod events;
mod file;
mod hostlist;
mod http;
mod provider;
mod push;

pub use events::{ConfigEvent, ConfigListener, LoggingConfigListener, NoopConfigListener};
pub use file::{FileProvider, CACHE_MAGIC};
pub use hostlist::HostList;
pub use http::{HttpConfigStream, HttpProvider, STREAM_DELIMITER};
pub use provider::{
    ConfigProvider, ProviderContext, ProviderKind, ProviderOutput, ProviderState,
};

use provider::record_specific;
pub use push::PushProvider;

use crate::error::{Error, Result};
use crate::io::TimerId;
use crate::topology::ClusterConfig;
use crate::types::HostPort;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Idle,
    Active,
    /// Active, waiting out the grace period before the next provider.
    Grace,
}

struct ProviderSlot {
    provider: Box<dyn ConfigProvider>,
    enabled: bool,
}

/// Tracks the active cluster configuration.
pub struct ConfigMonitor {
    slots: Vec<ProviderSlot>,
    current: usize,
    state: MonitorState,
    active: Option<Arc<ClusterConfig>>,
    active_origin: Option<ProviderKind>,
    last_error: Option<Error>,
    listeners: Vec<Arc<dyn ConfigListener>>,
    grace_next_provider: Duration,
}

impl std::fmt::Debug for ConfigMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMonitor")
            .field("state", &self.state)
            .field("revision", &self.active.as_ref().and_then(|c| c.revision()))
            .field("origin", &self.active_origin)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl ConfigMonitor {
    /// Create a monitor with no providers.
    pub fn new(grace_next_provider: Duration) -> Self {
        Self {
            slots: Vec::new(),
            current: 0,
            state: MonitorState::Idle,
            active: None,
            active_origin: None,
            last_error: None,
            listeners: Vec::new(),
            grace_next_provider,
        }
    }

    /// Register a provider, enabled. A provider of the same kind is replaced.
    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        let kind = provider.kind();
        self.slots.retain(|s| s.provider.kind() != kind);
        let pos = self
            .slots
            .iter()
            .position(|s| s.provider.kind() > kind)
            .unwrap_or(self.slots.len());
        self.slots.insert(
            pos,
            ProviderSlot {
                provider,
                enabled: true,
            },
        );
        self.current = self.first_enabled().unwrap_or(0);
    }

    /// Register a listener for configuration events.
    pub fn add_listener(&mut self, listener: Arc<dyn ConfigListener>) {
        self.listeners.push(listener);
    }

    /// Deliver `event` to every registered listener.
    pub fn notify_listeners(&self, event: &ConfigEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Enable or disable a provider. Disabling shuts it down.
    pub fn set_provider_active(
        &mut self,
        kind: ProviderKind,
        active: bool,
        ctx: &mut ProviderContext<'_>,
    ) {
        let Some(ix) = self.slot_index(kind) else {
            return;
        };
        if self.slots[ix].enabled == active {
            return;
        }
        tracing::debug!(provider = %kind, active, "Changing provider state");
        self.slots[ix].enabled = active;
        if !active {
            self.slots[ix].provider.shutdown(ctx);
            if self.current == ix {
                self.current = self.first_enabled().unwrap_or(0);
            }
        } else if !self.slots[self.current].enabled {
            self.current = ix;
        }
    }

    /// Whether a provider of `kind` is registered and enabled.
    pub fn is_provider_active(&self, kind: ProviderKind) -> bool {
        self.slot_index(kind).map_or(false, |ix| self.slots[ix].enabled)
    }

    /// Provider of `kind`, if registered.
    pub fn provider(&self, kind: ProviderKind) -> Option<&dyn ConfigProvider> {
        self.slot_index(kind).map(|ix| self.slots[ix].provider.as_ref())
    }

    /// The active configuration.
    pub fn get_config(&self) -> Option<Arc<ClusterConfig>> {
        self.active.clone()
    }

    /// Provider that delivered the active configuration.
    pub fn active_origin(&self) -> Option<ProviderKind> {
        self.active_origin
    }

    /// Most specific provider error seen so far.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Whether a refresh cycle is running.
    pub fn is_refreshing(&self) -> bool {
        self.state != MonitorState::Idle
    }

    /// Begin a refresh cycle unless one is already running.
    pub fn start(&mut self, ctx: &mut ProviderContext<'_>) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        if self.is_refreshing() {
            tracing::debug!("Cluster map refresh already in progress");
            return events;
        }

        let Some(first) = self.first_enabled() else {
            let error = Error::NoMatchingServer("no configuration provider is enabled".into());
            self.record_error(error.clone());
            events.push(ConfigEvent::ProvidersCycled {
                last_error: Some(error),
            });
            return events;
        };
        if !self.slots[self.current].enabled {
            self.current = first;
        }

        tracing::trace!(provider = %self.slots[self.current].provider.kind(), "Refreshing cluster map");
        self.state = MonitorState::Active;
        self.next_provider(ctx, &mut events);
        events
    }

    /// End the refresh cycle, pausing every provider.
    pub fn stop(&mut self, ctx: &mut ProviderContext<'_>) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        self.stop_into(ctx, &mut events);
        events
    }

    /// Handle one of the monitor's timers.
    pub fn on_timer(&mut self, timer: TimerId, ctx: &mut ProviderContext<'_>) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        match timer {
            TimerId::ProviderGrace if self.state == MonitorState::Grace => {
                self.next_provider(ctx, &mut events);
            }
            TimerId::ProviderRequest => {
                if let Some(ix) = self.slot_index(ProviderKind::Push) {
                    let output = self.slots[ix].provider.on_request_timeout(ctx);
                    self.apply_outputs(ix, output, ctx, &mut events);
                }
            }
            _ => {}
        }
        events
    }

    /// A push-protocol configuration request completed.
    pub fn on_config_fetched(
        &mut self,
        host: &HostPort,
        result: Result<Bytes>,
        ctx: &mut ProviderContext<'_>,
    ) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        if let Some(ix) = self.slot_index(ProviderKind::Push) {
            let output = self.slots[ix].provider.on_fetched(host, result, ctx);
            self.apply_outputs(ix, output, ctx, &mut events);
        }
        events
    }

    /// The data plane pushed a configuration (for example in a
    /// NOT_MY_VBUCKET response body).
    pub fn on_config_pushed(
        &mut self,
        host: &HostPort,
        payload: &[u8],
        ctx: &mut ProviderContext<'_>,
    ) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        if let Some(ix) = self.slot_index(ProviderKind::Push) {
            let output = self.slots[ix].provider.on_pushed(host, payload);
            self.apply_outputs(ix, output, ctx, &mut events);
        }
        events
    }

    /// Bytes arrived on the HTTP configuration stream.
    pub fn on_stream_data(
        &mut self,
        host: &HostPort,
        data: &[u8],
        ctx: &mut ProviderContext<'_>,
    ) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        if let Some(ix) = self.slot_index(ProviderKind::Http) {
            if self.slots[ix].enabled {
                let outputs = self.slots[ix].provider.on_stream_data(host, data, ctx);
                self.apply_outputs(ix, outputs, ctx, &mut events);
            }
        }
        events
    }

    /// The HTTP configuration stream closed.
    pub fn on_stream_closed(
        &mut self,
        host: &HostPort,
        error: Error,
        ctx: &mut ProviderContext<'_>,
    ) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        if let Some(ix) = self.slot_index(ProviderKind::Http) {
            let output = self.slots[ix].provider.on_stream_closed(host, error, ctx);
            self.apply_outputs(ix, output, ctx, &mut events);
        }
        events
    }

    fn slot_index(&self, kind: ProviderKind) -> Option<usize> {
        self.slots.iter().position(|s| s.provider.kind() == kind)
    }

    fn first_enabled(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.enabled)
    }

    fn next_enabled_after(&self, ix: usize) -> Option<usize> {
        (ix + 1..self.slots.len()).find(|&i| self.slots[i].enabled)
    }

    fn next_provider(&mut self, ctx: &mut ProviderContext<'_>, events: &mut Vec<ConfigEvent>) {
        self.state = MonitorState::Active;
        ctx.io.disarm(TimerId::ProviderGrace);

        let cached: Vec<_> = self
            .slots
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| s.provider.cached().map(|c| (c, s.provider.kind())))
            .collect();
        for (config, origin) in cached {
            if self.set_next(config, origin, ctx, events) {
                tracing::debug!(source = %origin, "Using cached configuration");
                return;
            }
        }

        let ix = self.current;
        tracing::trace!(provider = %self.slots[ix].provider.kind(), "Attempting to retrieve cluster map");
        let output = self.slots[ix].provider.refresh(ctx);
        self.apply_outputs(ix, output, ctx, events);
    }

    fn apply_outputs(
        &mut self,
        ix: usize,
        outputs: impl IntoIterator<Item = ProviderOutput>,
        ctx: &mut ProviderContext<'_>,
        events: &mut Vec<ConfigEvent>,
    ) {
        let kind = self.slots[ix].provider.kind();
        for output in outputs {
            match output {
                ProviderOutput::Config(config) => {
                    self.set_next(config, kind, ctx, events);
                    self.stop_into(ctx, events);
                }
                ProviderOutput::Failed(error) => self.provider_failed(ix, Some(error), ctx, events),
                ProviderOutput::Exhausted => self.provider_failed(ix, None, ctx, events),
            }
        }
    }

    /// Adopt `config` if it supersedes the active one.
    fn set_next(
        &mut self,
        config: Arc<ClusterConfig>,
        origin: ProviderKind,
        ctx: &mut ProviderContext<'_>,
        events: &mut Vec<ConfigEvent>,
    ) -> bool {
        match &self.active {
            Some(active) if Arc::ptr_eq(active, &config) => return false,
            Some(active) => {
                let diff = active.diff(&config);
                if !config.supersedes(active) {
                    tracing::trace!(
                        source = %origin,
                        current = ?active.revision(),
                        candidate = ?config.revision(),
                        "Not applying configuration, not newer"
                    );
                    return false;
                }
                tracing::info!(
                    source = %origin,
                    bucket = config.bucket(),
                    revision = ?config.revision(),
                    previous = ?active.revision(),
                    servers_changed = diff.servers_modified,
                    map_changed = diff.map_modified,
                    replicas_changed = diff.replicas_modified,
                    "Setting new configuration"
                );
            }
            None => {
                tracing::info!(
                    source = %origin,
                    bucket = config.bucket(),
                    revision = ?config.revision(),
                    "Setting initial configuration"
                );
            }
        }

        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            slot.provider.config_updated(&config, origin, ctx);
        }
        self.active = Some(config.clone());
        self.active_origin = Some(origin);
        self.stop_into(ctx, events);
        events.push(ConfigEvent::GotNewConfig { config, origin });
        true
    }

    fn provider_failed(
        &mut self,
        ix: usize,
        error: Option<Error>,
        ctx: &mut ProviderContext<'_>,
        events: &mut Vec<ConfigEvent>,
    ) {
        let kind = self.slots[ix].provider.kind();
        match &error {
            Some(error) => tracing::info!(provider = %kind, error = %error, "Provider failed"),
            None => tracing::info!(provider = %kind, "Provider has no hosts left to try"),
        }

        if ix != self.current || !self.is_refreshing() {
            tracing::trace!(provider = %kind, "Ignoring failure, provider not being refreshed");
            return;
        }

        if let Some(error) = error {
            if matches!(error, Error::Auth(_)) {
                tracing::warn!("Received authentication error during bootstrap");
            }
            self.record_error(error);
        }

        if let Some(next) = self.next_enabled_after(ix) {
            self.current = next;
            if self.active.is_some() {
                tracing::debug!(delay = ?self.grace_next_provider, "Will try next provider");
                self.state = MonitorState::Grace;
                ctx.io.arm(TimerId::ProviderGrace, self.grace_next_provider);
            } else {
                self.next_provider(ctx, events);
            }
            return;
        }

        tracing::trace!("Maximum provider reached, resetting index");
        events.push(ConfigEvent::ProvidersCycled {
            last_error: self.last_error.clone(),
        });
        self.current = self.first_enabled().unwrap_or(0);
        self.stop_into(ctx, events);
    }

    fn record_error(&mut self, error: Error) {
        record_specific(&mut self.last_error, error);
    }

    fn stop_into(&mut self, ctx: &mut ProviderContext<'_>, events: &mut Vec<ConfigEvent>) {
        if !self.is_refreshing() {
            return;
        }
        for slot in self.slots.iter_mut().filter(|s| s.enabled) {
            slot.provider.pause(ctx);
        }
        ctx.io.disarm(TimerId::ProviderGrace);
        self.state = MonitorState::Idle;
        events.push(ConfigEvent::MonitorStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::io::IoCapability;
    use crate::testing::{fixtures, ProviderHarness};

    fn kv(host: &str) -> HostPort {
        HostPort::new(host, 11210)
    }

    fn monitor_with_push(hosts: &[&str]) -> ConfigMonitor {
        let mut monitor = ConfigMonitor::new(Duration::from_millis(100));
        let hosts = HostList::new(hosts.iter().map(|h| kv(h)));
        monitor.add_provider(Box::new(PushProvider::new(hosts, Duration::from_secs(2), false)));
        monitor
    }

    fn blob(rev: u64) -> Bytes {
        Bytes::from(fixtures::vbucket_config_json(rev, 2, 16, 1, |vb| {
            vec![(vb % 2) as i64, ((vb + 1) % 2) as i64]
        }))
    }

    fn new_configs(events: &[ConfigEvent]) -> Vec<Option<u64>> {
        events
            .iter()
            .filter(|e| e.is_new_config())
            .map(ConfigEvent::revision)
            .collect()
    }

    #[test]
    fn test_adopts_first_config() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);

        assert!(monitor.start(&mut harness.ctx()).is_empty());
        assert!(monitor.is_refreshing());

        let events = monitor.on_config_fetched(&kv("a"), Ok(blob(5)), &mut harness.ctx());
        assert_eq!(new_configs(&events), vec![Some(5)]);
        assert!(!monitor.is_refreshing());
        assert_eq!(monitor.get_config().and_then(|c| c.revision()), Some(5));
        assert_eq!(monitor.active_origin(), Some(ProviderKind::Push));
    }

    #[test]
    fn test_older_or_equal_revision_never_adopted() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);

        monitor.start(&mut harness.ctx());
        monitor.on_config_fetched(&kv("a"), Ok(blob(5)), &mut harness.ctx());

        for rev in [5, 4, 1] {
            let events = monitor.on_config_pushed(&kv("a"), &blob(rev), &mut harness.ctx());
            assert!(new_configs(&events).is_empty(), "revision {} adopted", rev);
        }
        assert_eq!(monitor.get_config().and_then(|c| c.revision()), Some(5));

        let events = monitor.on_config_pushed(&kv("a"), &blob(6), &mut harness.ctx());
        assert_eq!(new_configs(&events), vec![Some(6)]);
    }

    #[test]
    fn test_providers_cycled_records_last_error() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a", "b"]);
        monitor.start(&mut harness.ctx());

        let refused: Error = NetworkError::ConnectionRefused { addr: "a:11210".into() }.into();
        assert!(monitor
            .on_config_fetched(&kv("a"), Err(refused.clone()), &mut harness.ctx())
            .is_empty());

        let reset: Error = NetworkError::Generic("reset".into()).into();
        let events = monitor.on_config_fetched(&kv("b"), Err(reset), &mut harness.ctx());

        assert!(matches!(
            events.first(),
            Some(ConfigEvent::ProvidersCycled { last_error: Some(ref e) }) if *e == refused
        ));
        assert!(matches!(events.last(), Some(ConfigEvent::MonitorStopped)));
        assert_eq!(monitor.last_error(), Some(&refused));
        assert!(!monitor.is_refreshing());
    }

    #[test]
    fn test_empty_host_list_cycles_without_error() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&[]);

        let events = monitor.start(&mut harness.ctx());
        assert!(matches!(
            events.first(),
            Some(ConfigEvent::ProvidersCycled { last_error: None })
        ));
        assert_eq!(monitor.last_error(), None);
        assert!(harness.transport.fetches().is_empty());
        assert!(!monitor.is_refreshing());
    }

    #[test]
    fn test_falls_back_to_http() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);
        let mgmt = HostList::new([HostPort::new("a", 8091)]);
        monitor.add_provider(Box::new(HttpProvider::new(mgmt, "default", false)));

        monitor.start(&mut harness.ctx());
        let err: Error = NetworkError::ConnectTimeout { addr: "a:11210".into() }.into();
        monitor.on_config_fetched(&kv("a"), Err(err), &mut harness.ctx());

        // No config yet, so the HTTP provider is tried without a grace period.
        assert_eq!(harness.transport.streams().len(), 1);
        assert!(monitor.is_refreshing());

        let mut data = blob(3).to_vec();
        data.extend_from_slice(STREAM_DELIMITER);
        let events = monitor.on_stream_data(&HostPort::new("a", 8091), &data, &mut harness.ctx());
        assert_eq!(new_configs(&events), vec![Some(3)]);
        assert_eq!(monitor.active_origin(), Some(ProviderKind::Http));
    }

    #[test]
    fn test_grace_period_once_configured() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);
        let mgmt = HostList::new([HostPort::new("a", 8091)]);
        monitor.add_provider(Box::new(HttpProvider::new(mgmt, "default", false)));

        monitor.start(&mut harness.ctx());
        monitor.on_config_fetched(&kv("a"), Ok(blob(1)), &mut harness.ctx());

        // The push host list now comes from the adopted configuration.
        monitor.start(&mut harness.ctx());
        let host = harness.transport.fetches().last().cloned().unwrap();
        assert_eq!(host, fixtures::kv_host(0));
        let err: Error = NetworkError::ConnectTimeout { addr: host.to_string() }.into();
        monitor.on_config_fetched(&host, Err(err.clone()), &mut harness.ctx());
        monitor.on_config_fetched(&fixtures::kv_host(1), Err(err), &mut harness.ctx());

        assert!(harness.io.is_armed(TimerId::ProviderGrace));
        assert!(harness.transport.streams().is_empty());

        monitor.on_timer(TimerId::ProviderGrace, &mut harness.ctx());
        assert_eq!(harness.transport.streams().len(), 1);
    }

    #[test]
    fn test_start_while_refreshing_is_noop() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a", "b"]);
        monitor.start(&mut harness.ctx());
        monitor.start(&mut harness.ctx());
        assert_eq!(harness.transport.fetches(), vec![kv("a")]);
    }

    #[test]
    fn test_no_enabled_provider() {
        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);
        monitor.set_provider_active(ProviderKind::Push, false, &mut harness.ctx());
        assert!(!monitor.is_provider_active(ProviderKind::Push));

        let events = monitor.start(&mut harness.ctx());
        assert!(matches!(events.as_slice(), [ConfigEvent::ProvidersCycled { .. }]));
        assert!(!monitor.is_refreshing());
    }

    #[test]
    fn test_cached_file_config_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        std::fs::write(
            &path,
            format!("{}{}", String::from_utf8_lossy(&blob(9)), CACHE_MAGIC),
        )
        .unwrap();

        let mut harness = ProviderHarness::new();
        let mut monitor = monitor_with_push(&["a"]);
        monitor.add_provider(Box::new(FileProvider::new(&path)));

        let events = monitor.start(&mut harness.ctx());
        assert_eq!(new_configs(&events), vec![Some(9)]);
        assert_eq!(monitor.active_origin(), Some(ProviderKind::File));
        assert!(harness.transport.fetches().is_empty());

        // The next cycle skips the unchanged file and, after the grace
        // period, asks the cluster.
        monitor.start(&mut harness.ctx());
        assert!(harness.transport.fetches().is_empty());
        monitor.on_timer(TimerId::ProviderGrace, &mut harness.ctx());
        assert_eq!(harness.transport.fetches(), vec![fixtures::kv_host(0)]);
    }

    #[test]
    fn test_listeners_notified() {
        use parking_lot::Mutex;

        struct Recorder(Mutex<Vec<Option<u64>>>);
        impl ConfigListener for Recorder {
            fn on_event(&self, event: &ConfigEvent) {
                self.0.lock().push(event.revision());
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut monitor = monitor_with_push(&["a"]);
        monitor.add_listener(recorder.clone());

        let mut harness = ProviderHarness::new();
        monitor.start(&mut harness.ctx());
        for event in monitor.on_config_fetched(&kv("a"), Ok(blob(2)), &mut harness.ctx()) {
            monitor.notify_listeners(&event);
        }
        assert!(recorder.0.lock().contains(&Some(2)));
        assert!(!harness.io.is_armed(TimerId::ProviderRequest));
    }
}
