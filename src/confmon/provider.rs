//! Configuration provider abstraction.

use crate::error::Error;
use crate::io::IoCapability;
use crate::topology::ClusterConfig;
use crate::transport::{Authenticator, ConfigTransport};
use crate::types::HostPort;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Provider variants, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// On-disk configuration cache.
    File,
    /// Data-port push protocol.
    Push,
    /// Streaming HTTP on the management port.
    Http,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::File => "file",
            ProviderKind::Push => "push",
            ProviderKind::Http => "http",
        };
        f.write_str(name)
    }
}

/// Fetch state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Idle,
    Fetching,
}

/// Result of driving a provider.
#[derive(Debug, Clone)]
pub enum ProviderOutput {
    /// A candidate configuration.
    Config(Arc<ClusterConfig>),
    /// The provider ran out of hosts.
    Failed(Error),
    /// The provider ran out of hosts without any of them reporting an error.
    Exhausted,
}

/// Keep the most specific of the errors seen during one cycle.
///
/// A generic network failure never replaces an error already recorded.
pub(crate) fn record_specific(slot: &mut Option<Error>, error: Error) {
    if slot.is_some() && error.is_generic_network() {
        return;
    }
    *slot = Some(error);
}

/// Collaborators a provider may use while it runs.
pub struct ProviderContext<'a> {
    pub io: &'a mut dyn IoCapability,
    pub transport: &'a mut dyn ConfigTransport,
    pub auth: &'a dyn Authenticator,
}

/// A source of cluster configurations.
///
/// Providers never adopt anything themselves: they hand candidates and
/// failures to the monitor, which decides.
pub trait ConfigProvider: Send {
    /// Which variant this is.
    fn kind(&self) -> ProviderKind;

    /// Current fetch state.
    fn state(&self) -> ProviderState;

    /// Begin fetching. Returns an output immediately when one is available
    /// without waiting on the network.
    fn refresh(&mut self, ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput>;

    /// Last configuration this provider produced.
    fn cached(&self) -> Option<Arc<ClusterConfig>>;

    /// Stop any fetch in progress.
    fn pause(&mut self, ctx: &mut ProviderContext<'_>);

    /// Release every resource; called when the provider is deactivated.
    fn shutdown(&mut self, ctx: &mut ProviderContext<'_>) {
        self.pause(ctx);
    }

    /// A new configuration was adopted from `origin`.
    fn config_updated(
        &mut self,
        config: &Arc<ClusterConfig>,
        origin: ProviderKind,
        ctx: &mut ProviderContext<'_>,
    );

    /// A requested configuration fetch completed.
    fn on_fetched(
        &mut self,
        _host: &HostPort,
        _result: Result<Bytes, Error>,
        _ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        None
    }

    /// A configuration was pushed without being requested.
    fn on_pushed(&mut self, _host: &HostPort, _payload: &[u8]) -> Option<ProviderOutput> {
        None
    }

    /// Bytes arrived on a configuration stream.
    fn on_stream_data(
        &mut self,
        _host: &HostPort,
        _data: &[u8],
        _ctx: &mut ProviderContext<'_>,
    ) -> Vec<ProviderOutput> {
        Vec::new()
    }

    /// A configuration stream closed or failed to open.
    fn on_stream_closed(
        &mut self,
        _host: &HostPort,
        _error: Error,
        _ctx: &mut ProviderContext<'_>,
    ) -> Option<ProviderOutput> {
        None
    }

    /// The per-request deadline armed by this provider fired.
    fn on_request_timeout(&mut self, _ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput> {
        None
    }
}
