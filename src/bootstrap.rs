//! Initial bootstrap and throttled configuration refreshes.
//!
//! ```text
//!   Uninit ──bootstrap(Initial)──► Connecting ──GotNewConfig──► Configured
//!                                      │
//!                                      └──Bootstrap timer / fail-fast──► Failed
//! ```
//!
//! After the first configuration, refresh requests go through the throttle:
//! a refresh proceeds when enough time has passed since the last adopted
//! configuration, or when enough errors have been reported since.

use crate::config::BootstrapConfig;
use crate::confmon::{ConfigEvent, ConfigMonitor, ProviderContext, ProviderKind};
use crate::error::{Error, Result};
use crate::io::TimerId;
use crate::topology::Distribution;
use std::fmt;
use std::time::Instant;

/// How [`Bootstrap::bootstrap`] should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOptions {
    /// First configuration, bounded by the bootstrap timer.
    Initial,
    /// Refresh now unless a refresh is already running.
    RefreshAlways,
    /// Refresh subject to throttling. `incr_err` counts one more error
    /// toward the error threshold first.
    RefreshThrottled { incr_err: bool },
}

/// Lifecycle of the initial bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Uninit,
    Connecting,
    Configured,
    Failed,
}

/// What a bootstrap request did.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// The monitor was started; these are the events it raised right away.
    Started(Vec<ConfigEvent>),
    /// A refresh cycle is already running.
    AlreadyRefreshing,
    /// Skipped by throttling.
    Throttled,
}

/// One-shot bootstrap completion callback.
pub type BootstrapCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Drives the first configuration fetch and later refreshes.
pub struct Bootstrap {
    settings: BootstrapConfig,
    state: BootstrapState,
    last_refresh: Option<Instant>,
    errcounter: u32,
    origin: Option<ProviderKind>,
    error: Option<Error>,
    callback: Option<BootstrapCallback>,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("state", &self.state)
            .field("last_refresh", &self.last_refresh)
            .field("errcounter", &self.errcounter)
            .field("origin", &self.origin)
            .field("error", &self.error)
            .finish()
    }
}

impl Bootstrap {
    pub fn new(settings: BootstrapConfig) -> Self {
        Self {
            settings,
            state: BootstrapState::Uninit,
            last_refresh: None,
            errcounter: 0,
            origin: None,
            error: None,
            callback: None,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Errors reported since the last refresh.
    pub fn error_count(&self) -> u32 {
        self.errcounter
    }

    /// Outcome of the initial bootstrap so far.
    pub fn bootstrap_status(&self) -> Result<()> {
        match self.state {
            BootstrapState::Configured => Ok(()),
            BootstrapState::Failed => Err(self.error.clone().unwrap_or(Error::BootstrapTimeout)),
            BootstrapState::Uninit | BootstrapState::Connecting => Err(Error::NoConfiguration),
        }
    }

    /// Register the callback fired once the initial bootstrap settles.
    ///
    /// Replaces any callback not yet fired.
    pub fn set_callback(&mut self, callback: BootstrapCallback) {
        self.callback = Some(callback);
    }

    /// Start the initial bootstrap or request a refresh.
    pub fn bootstrap(
        &mut self,
        options: BootstrapOptions,
        monitor: &mut ConfigMonitor,
        ctx: &mut ProviderContext<'_>,
    ) -> RefreshOutcome {
        let now = ctx.io.now();

        if options == BootstrapOptions::Initial {
            if self.state == BootstrapState::Connecting {
                return RefreshOutcome::AlreadyRefreshing;
            }
            tracing::info!(timeout = ?self.settings.config_timeout, "Starting bootstrap");
            self.state = BootstrapState::Connecting;
            self.error = None;
            ctx.io.arm(TimerId::Bootstrap, self.settings.config_timeout);
        } else if monitor.is_refreshing() {
            return RefreshOutcome::AlreadyRefreshing;
        }

        if let BootstrapOptions::RefreshThrottled { incr_err } = options {
            if incr_err {
                self.errcounter += 1;
            }
            if !self.refresh_allowed(now) {
                tracing::info!(
                    errors = self.errcounter,
                    error_threshold = self.settings.error_threshold,
                    delay_threshold = ?self.settings.delay_threshold,
                    "Not requesting a config refresh because of throttling parameters"
                );
                return RefreshOutcome::Throttled;
            }
        }

        self.errcounter = 0;
        if options != BootstrapOptions::Initial {
            self.last_refresh = Some(now);
        }
        RefreshOutcome::Started(monitor.start(ctx))
    }

    /// Either gate is enough: enough time since the last refresh, or
    /// enough errors since.
    fn refresh_allowed(&self, now: Instant) -> bool {
        let delay_elapsed = match self.last_refresh {
            Some(last) => now >= last + self.settings.delay_threshold,
            None => true,
        };
        delay_elapsed || self.errcounter >= self.settings.error_threshold
    }

    /// React to a monitor event. Returns the initial bootstrap outcome when
    /// this event settled it.
    ///
    /// Must be called after the router has been rebuilt for the event.
    pub fn on_event(
        &mut self,
        event: &ConfigEvent,
        monitor: &mut ConfigMonitor,
        ctx: &mut ProviderContext<'_>,
    ) -> Option<Result<()>> {
        match event {
            ConfigEvent::GotNewConfig { config, origin } => {
                let previous = self.origin.replace(*origin);
                ctx.io.disarm(TimerId::Bootstrap);

                // A cached file must not suppress the first live refresh.
                if *origin != ProviderKind::File {
                    self.last_refresh = Some(ctx.io.now());
                    self.errcounter = 0;
                }

                if *origin == ProviderKind::Push && previous != Some(ProviderKind::Http) {
                    monitor.set_provider_active(ProviderKind::Http, false, ctx);
                }
                if config.distribution() == Distribution::Ketama && *origin != ProviderKind::Http {
                    tracing::info!("Reverting to HTTP config for memcached buckets");
                    monitor.set_provider_active(ProviderKind::Http, true, ctx);
                    monitor.set_provider_active(ProviderKind::Push, false, ctx);
                }

                self.check_bgpoll(ctx);

                if self.state == BootstrapState::Connecting {
                    self.state = BootstrapState::Configured;
                    tracing::info!(
                        revision = ?config.revision(),
                        source = %origin,
                        "Bootstrap complete"
                    );
                    self.fire(Ok(()));
                    return Some(Ok(()));
                }
                None
            }
            ConfigEvent::ProvidersCycled { .. }
                if self.state == BootstrapState::Connecting
                    && monitor.get_config().is_none()
                    && self.settings.fail_fast =>
            {
                Some(Err(self.initial_error(
                    Error::NoMatchingServer("no more bootstrap providers remain".into()),
                    monitor,
                    ctx,
                )))
            }
            _ => None,
        }
    }

    /// Handle one of the bootstrap timers.
    pub fn on_timer(
        &mut self,
        timer: TimerId,
        monitor: &mut ConfigMonitor,
        ctx: &mut ProviderContext<'_>,
    ) -> TimerOutcome {
        match timer {
            TimerId::Bootstrap if self.state == BootstrapState::Connecting => {
                TimerOutcome::Failed(self.initial_error(Error::BootstrapTimeout, monitor, ctx))
            }
            TimerId::BackgroundPoll => {
                tracing::trace!("Background-polling for new configuration");
                let outcome = self.bootstrap(BootstrapOptions::RefreshAlways, monitor, ctx);
                self.check_bgpoll(ctx);
                TimerOutcome::Refreshed(outcome)
            }
            _ => TimerOutcome::Ignored,
        }
    }

    fn initial_error(
        &mut self,
        fallback: Error,
        monitor: &ConfigMonitor,
        ctx: &mut ProviderContext<'_>,
    ) -> Error {
        let error = monitor.last_error().cloned().unwrap_or(fallback);
        tracing::error!(error = %error, "Failed to bootstrap");
        ctx.io.disarm(TimerId::Bootstrap);
        self.state = BootstrapState::Failed;
        self.error = Some(error.clone());
        self.fire(Err(error.clone()));
        error
    }

    fn fire(&mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Poll in the background only while configured over the push protocol.
    fn check_bgpoll(&self, ctx: &mut ProviderContext<'_>) {
        let interval = self.settings.config_poll_interval;
        if self.origin != Some(ProviderKind::Push) || interval.is_zero() {
            ctx.io.disarm(TimerId::BackgroundPoll);
        } else {
            ctx.io.arm(TimerId::BackgroundPoll, interval);
        }
    }

    /// Stop background polling and forget any pending callback.
    pub fn shutdown(&mut self, ctx: &mut ProviderContext<'_>) {
        ctx.io.disarm(TimerId::Bootstrap);
        ctx.io.disarm(TimerId::BackgroundPoll);
        if self.state == BootstrapState::Connecting {
            self.state = BootstrapState::Failed;
            self.error = Some(Error::Cancelled);
            self.fire(Err(Error::Cancelled));
        }
    }
}

/// Result of [`Bootstrap::on_timer`].
#[derive(Debug)]
pub enum TimerOutcome {
    /// The initial bootstrap failed with this error.
    Failed(Error),
    /// A background refresh was attempted.
    Refreshed(RefreshOutcome),
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confmon::{HostList, PushProvider};
    use crate::io::IoCapability;
    use crate::testing::{fixtures, ProviderHarness};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    type Outcomes = Arc<Mutex<Vec<Result<()>>>>;

    fn monitor(hosts: Vec<crate::types::HostPort>) -> ConfigMonitor {
        let mut monitor = ConfigMonitor::new(Duration::from_millis(100));
        monitor.add_provider(Box::new(PushProvider::new(
            HostList::new(hosts),
            Duration::from_secs(2),
            false,
        )));
        monitor
    }

    fn bootstrap(settings: BootstrapConfig) -> (Bootstrap, Outcomes) {
        let outcomes: Outcomes = Default::default();
        let sink = outcomes.clone();
        let mut bs = Bootstrap::new(settings);
        bs.set_callback(Box::new(move |r| sink.lock().push(r)));
        (bs, outcomes)
    }

    fn drive(
        bs: &mut Bootstrap,
        monitor: &mut ConfigMonitor,
        harness: &mut ProviderHarness,
        events: Vec<ConfigEvent>,
    ) -> Vec<Result<()>> {
        events
            .iter()
            .filter_map(|e| bs.on_event(e, monitor, &mut harness.ctx()))
            .collect()
    }

    fn blob(rev: u64) -> Bytes {
        Bytes::from(fixtures::three_node_json(rev, 0))
    }

    #[test]
    fn test_initial_success() {
        let mut harness = ProviderHarness::new();
        let mut mon = monitor(vec![fixtures::kv_host(0)]);
        let (mut bs, outcomes) = bootstrap(BootstrapConfig::default());

        let outcome = bs.bootstrap(BootstrapOptions::Initial, &mut mon, &mut harness.ctx());
        assert!(matches!(outcome, RefreshOutcome::Started(ref e) if e.is_empty()));
        assert!(harness.io.is_armed(TimerId::Bootstrap));
        assert_eq!(bs.state(), BootstrapState::Connecting);

        let events = mon.on_config_fetched(&fixtures::kv_host(0), Ok(blob(1)), &mut harness.ctx());
        let settled = drive(&mut bs, &mut mon, &mut harness, events);
        assert_eq!(settled, vec![Ok(())]);
        assert_eq!(*outcomes.lock(), vec![Ok(())]);
        assert!(!harness.io.is_armed(TimerId::Bootstrap));
        assert!(harness.io.is_armed(TimerId::BackgroundPoll));
        assert_eq!(bs.bootstrap_status(), Ok(()));
    }

    #[test]
    fn test_initial_timeout_fires_once() {
        let mut harness = ProviderHarness::new();
        let start = harness.io.now();
        let mut mon = monitor(vec![fixtures::kv_host(0)]);
        let (mut bs, outcomes) = bootstrap(BootstrapConfig::default());

        bs.bootstrap(BootstrapOptions::Initial, &mut mon, &mut harness.ctx());
        let timer = harness.io.pop_expired(start + Duration::from_secs(5)).unwrap();
        assert_eq!(timer, TimerId::ProviderRequest);
        let events = mon.on_timer(timer, &mut harness.ctx());
        drive(&mut bs, &mut mon, &mut harness, events);

        let timer = harness.io.pop_expired(start + Duration::from_secs(5)).unwrap();
        assert_eq!(timer, TimerId::Bootstrap);
        let outcome = bs.on_timer(timer, &mut mon, &mut harness.ctx());
        let TimerOutcome::Failed(error) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(matches!(error, Error::Network(_)));
        assert_eq!(outcomes.lock().len(), 1);
        assert_eq!(bs.state(), BootstrapState::Failed);

        assert!(matches!(
            bs.on_timer(TimerId::Bootstrap, &mut mon, &mut harness.ctx()),
            TimerOutcome::Ignored
        ));
        assert_eq!(outcomes.lock().len(), 1);
    }

    #[test]
    fn test_fail_fast_on_providers_cycled() {
        let mut harness = ProviderHarness::new();
        let mut mon = monitor(Vec::new());
        let (mut bs, outcomes) = bootstrap(BootstrapConfig::default().with_fail_fast(true));

        let RefreshOutcome::Started(events) =
            bs.bootstrap(BootstrapOptions::Initial, &mut mon, &mut harness.ctx())
        else {
            panic!("bootstrap did not start");
        };
        let settled = drive(&mut bs, &mut mon, &mut harness, events);
        assert_eq!(settled.len(), 1);
        assert!(matches!(settled[0], Err(Error::NoMatchingServer(_))));
        assert_eq!(outcomes.lock().len(), 1);
        assert!(!harness.io.is_armed(TimerId::Bootstrap));
    }

    #[test]
    fn test_throttle_gates_are_ored() {
        let mut harness = ProviderHarness::new();
        let mut mon = monitor(vec![fixtures::kv_host(0)]);
        let settings = BootstrapConfig::default().with_throttle(Duration::from_millis(10), 3);
        let (mut bs, _) = bootstrap(settings);

        bs.bootstrap(BootstrapOptions::Initial, &mut mon, &mut harness.ctx());
        let events = mon.on_config_fetched(&fixtures::kv_host(0), Ok(blob(1)), &mut harness.ctx());
        drive(&mut bs, &mut mon, &mut harness, events);

        let throttled = BootstrapOptions::RefreshThrottled { incr_err: false };
        let counted = BootstrapOptions::RefreshThrottled { incr_err: true };
        assert!(matches!(
            bs.bootstrap(throttled, &mut mon, &mut harness.ctx()),
            RefreshOutcome::Throttled
        ));
        assert!(matches!(bs.bootstrap(counted, &mut mon, &mut harness.ctx()), RefreshOutcome::Throttled));
        assert!(matches!(bs.bootstrap(counted, &mut mon, &mut harness.ctx()), RefreshOutcome::Throttled));
        assert_eq!(bs.error_count(), 2);
        // Third error reaches the threshold before the delay has passed.
        assert!(matches!(bs.bootstrap(counted, &mut mon, &mut harness.ctx()), RefreshOutcome::Started(_)));
        assert_eq!(bs.error_count(), 0);
        assert!(matches!(
            bs.bootstrap(throttled, &mut mon, &mut harness.ctx()),
            RefreshOutcome::AlreadyRefreshing
        ));

        mon.stop(&mut harness.ctx());
        let later = harness.io.now() + Duration::from_millis(10);
        harness.io.set_now(later);
        assert!(matches!(bs.bootstrap(throttled, &mut mon, &mut harness.ctx()), RefreshOutcome::Started(_)));
    }

    #[test]
    fn test_background_poll() {
        let mut harness = ProviderHarness::new();
        let start = harness.io.now();
        let mut mon = monitor(vec![fixtures::kv_host(0)]);
        let settings = BootstrapConfig::default().with_poll_interval(Duration::from_millis(500));
        let (mut bs, _) = bootstrap(settings);

        bs.bootstrap(BootstrapOptions::Initial, &mut mon, &mut harness.ctx());
        let events = mon.on_config_fetched(&fixtures::kv_host(0), Ok(blob(1)), &mut harness.ctx());
        drive(&mut bs, &mut mon, &mut harness, events);
        let fetches = harness.transport.fetches().len();

        let timer = harness.io.pop_expired(start + Duration::from_millis(500)).unwrap();
        assert_eq!(timer, TimerId::BackgroundPoll);
        assert!(matches!(
            bs.on_timer(timer, &mut mon, &mut harness.ctx()),
            TimerOutcome::Refreshed(RefreshOutcome::Started(_))
        ));
        assert_eq!(harness.transport.fetches().len(), fetches + 1);
        assert!(harness.io.is_armed(TimerId::BackgroundPoll));
    }

    #[test]
    fn test_status_before_bootstrap() {
        let bs = Bootstrap::new(BootstrapConfig::default());
        assert_eq!(bs.bootstrap_status(), Err(Error::NoConfiguration));
        assert_eq!(bs.state(), BootstrapState::Uninit);
    }
}
