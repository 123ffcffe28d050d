//! Push-protocol provider: configurations fetched over data-port
//! connections, plus configurations the data plane pushes unasked.

use super::hostlist::HostList;
use super::provider::{record_specific, ConfigProvider, ProviderContext, ProviderKind, ProviderOutput, ProviderState};
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::io::TimerId;
use crate::topology::ClusterConfig;
use crate::types::HostPort;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Fetches configurations from data nodes, one host at a time.
#[derive(Debug)]
pub struct PushProvider {
    hosts: HostList,
    in_flight: Option<HostPort>,
    cached: Option<Arc<ClusterConfig>>,
    cycle_error: Option<Error>,
    node_timeout: Duration,
    randomize: bool,
}

impl PushProvider {
    /// Create a provider seeded with `hosts`.
    pub fn new(hosts: HostList, node_timeout: Duration, randomize: bool) -> Self {
        let mut hosts = hosts;
        if randomize {
            hosts.randomize();
        }
        Self {
            hosts,
            in_flight: None,
            cached: None,
            cycle_error: None,
            node_timeout,
            randomize,
        }
    }

    /// Hosts the provider will cycle through.
    pub fn hosts(&self) -> &HostList {
        &self.hosts
    }

    /// Host of the request currently awaiting an answer.
    pub fn in_flight(&self) -> Option<&HostPort> {
        self.in_flight.as_ref()
    }

    fn parse(&mut self, host: &HostPort, payload: &[u8]) -> Result<Arc<ClusterConfig>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        let config = Arc::new(ClusterConfig::parse(text, &host.host)?);
        self.cached = Some(config.clone());
        Ok(config)
    }

    fn schedule_next(
        &mut self,
        error: Option<Error>,
        mut rollover: bool,
        ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        if let Some(error) = error {
            record_specific(&mut self.cycle_error, error);
        }
        loop {
            let Some(host) = self.hosts.next(rollover) else {
                self.in_flight = None;
                ctx.io.disarm(TimerId::ProviderRequest);
                return Some(match self.cycle_error.take() {
                    Some(error) => ProviderOutput::Failed(error),
                    None => ProviderOutput::Exhausted,
                });
            };

            let credentials = ctx.auth.credentials(&host);
            match ctx.transport.fetch_config(&host, &credentials) {
                Ok(()) => {
                    tracing::debug!(host = %host, "Requesting cluster configuration");
                    self.in_flight = Some(host);
                    ctx.io.arm(TimerId::ProviderRequest, self.node_timeout);
                    return None;
                }
                Err(err) => {
                    tracing::info!(host = %host, error = %err, "Configuration request could not be sent");
                    record_specific(&mut self.cycle_error, err);
                    rollover = false;
                }
            }
        }
    }
}

impl ConfigProvider for PushProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Push
    }

    fn state(&self) -> ProviderState {
        if self.in_flight.is_some() {
            ProviderState::Fetching
        } else {
            ProviderState::Idle
        }
    }

    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput> {
        if self.in_flight.is_some() {
            return None;
        }
        self.cycle_error = None;
        self.schedule_next(None, true, ctx)
    }

    fn cached(&self) -> Option<Arc<ClusterConfig>> {
        self.cached.clone()
    }

    fn pause(&mut self, ctx: &mut ProviderContext<'_>) {
        if self.in_flight.take().is_some() {
            ctx.io.disarm(TimerId::ProviderRequest);
        }
    }

    fn config_updated(
        &mut self,
        config: &Arc<ClusterConfig>,
        _origin: ProviderKind,
        _ctx: &mut ProviderContext<'_>,
    ) {
        self.hosts.replace(config.servers().iter().cloned());
        if self.randomize {
            self.hosts.randomize();
        }
    }

    fn on_fetched(
        &mut self,
        host: &HostPort,
        result: Result<Bytes>,
        ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        let is_current = self.in_flight.as_ref() == Some(host);
        if is_current {
            self.in_flight = None;
            ctx.io.disarm(TimerId::ProviderRequest);
        }

        let error = match result.and_then(|payload| self.parse(host, &payload)) {
            Ok(config) => return Some(ProviderOutput::Config(config)),
            Err(err) => err,
        };

        if !is_current {
            tracing::trace!(host = %host, error = %error, "Ignoring failure of superseded request");
            return None;
        }
        tracing::info!(host = %host, error = %error, "Configuration request failed");
        self.schedule_next(Some(error), false, ctx)
    }

    fn on_pushed(&mut self, host: &HostPort, payload: &[u8]) -> Option<ProviderOutput> {
        match self.parse(host, payload) {
            Ok(config) => Some(ProviderOutput::Config(config)),
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "Ignoring unparsable pushed configuration");
                None
            }
        }
    }

    fn on_request_timeout(&mut self, ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput> {
        let host = self.in_flight.take()?;
        tracing::info!(host = %host, "Configuration request timed out");
        let error = NetworkError::ConnectTimeout {
            addr: host.to_string(),
        };
        self.schedule_next(Some(error.into()), false, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, ProviderHarness};
    use crate::io::IoCapability;

    fn provider(hosts: &[&str]) -> PushProvider {
        let hosts = HostList::new(hosts.iter().map(|h| h.parse().unwrap()));
        PushProvider::new(hosts, Duration::from_secs(2), false)
    }

    #[test]
    fn test_refresh_requests_first_host() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&["a:11210", "b:11210"]);

        assert!(p.refresh(&mut harness.ctx()).is_none());
        assert_eq!(p.state(), ProviderState::Fetching);
        assert_eq!(harness.transport.fetches(), vec![HostPort::new("a", 11210)]);
        assert!(harness.io.is_armed(TimerId::ProviderRequest));

        // A second refresh while busy is a no-op.
        assert!(p.refresh(&mut harness.ctx()).is_none());
        assert_eq!(harness.transport.fetches().len(), 1);
    }

    #[test]
    fn test_success_yields_config() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&["a:11210"]);
        p.refresh(&mut harness.ctx());

        let blob = Bytes::from(fixtures::vbucket_config_json(3, 1, 4, 0, |_| vec![0]));
        let host = HostPort::new("a", 11210);
        let out = p.on_fetched(&host, Ok(blob), &mut harness.ctx());

        assert!(matches!(out, Some(ProviderOutput::Config(ref c)) if c.revision() == Some(3)));
        assert_eq!(p.state(), ProviderState::Idle);
        assert!(p.cached().is_some());
        assert!(!harness.io.is_armed(TimerId::ProviderRequest));
    }

    #[test]
    fn test_failure_cycles_then_gives_up() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&["a:11210", "b:11210"]);
        p.refresh(&mut harness.ctx());

        let refused = |h: &str| -> Error {
            NetworkError::ConnectionRefused { addr: h.to_string() }.into()
        };
        let a = HostPort::new("a", 11210);
        let b = HostPort::new("b", 11210);

        assert!(p.on_fetched(&a, Err(refused("a")), &mut harness.ctx()).is_none());
        assert_eq!(harness.transport.fetches(), vec![a.clone(), b.clone()]);

        let out = p.on_fetched(&b, Err(refused("b")), &mut harness.ctx());
        assert!(matches!(out, Some(ProviderOutput::Failed(ref e)) if e.is_connection_refused()));
        assert_eq!(p.state(), ProviderState::Idle);
    }

    #[test]
    fn test_timeout_moves_to_next_host() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&["a:11210", "b:11210"]);
        p.refresh(&mut harness.ctx());

        assert!(p.on_request_timeout(&mut harness.ctx()).is_none());
        assert_eq!(p.in_flight(), Some(&HostPort::new("b", 11210)));

        let out = p.on_request_timeout(&mut harness.ctx());
        assert!(matches!(
            out,
            Some(ProviderOutput::Failed(Error::Network(NetworkError::ConnectTimeout { .. })))
        ));
    }

    #[test]
    fn test_empty_host_list_exhausts_without_error() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&[]);
        let out = p.refresh(&mut harness.ctx());
        assert!(matches!(out, Some(ProviderOutput::Exhausted)));
        assert!(harness.transport.fetches().is_empty());
    }

    #[test]
    fn test_config_updated_replaces_hosts() {
        let mut harness = ProviderHarness::new();
        let mut p = provider(&["seed:11210"]);
        let config = Arc::new(
            ClusterConfig::parse(&fixtures::vbucket_config_json(1, 3, 4, 0, |_| vec![0]), "h").unwrap(),
        );
        p.config_updated(&config, ProviderKind::Http, &mut harness.ctx());
        assert_eq!(p.hosts().hosts(), config.servers());
    }

    #[test]
    fn test_pushed_config() {
        let mut p = provider(&["a:11210"]);
        let blob = fixtures::vbucket_config_json(8, 1, 4, 0, |_| vec![0]);
        let out = p.on_pushed(&HostPort::new("a", 11210), blob.as_bytes());
        assert!(matches!(out, Some(ProviderOutput::Config(_))));
        assert!(p.on_pushed(&HostPort::new("a", 11210), b"{garbage").is_none());
    }
}
