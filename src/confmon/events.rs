//! Configuration monitor events.

use super::provider::ProviderKind;
use crate::error::Error;
use crate::topology::ClusterConfig;
use std::sync::Arc;

/// Events raised by the [`ConfigMonitor`](super::ConfigMonitor).
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A strictly newer configuration was adopted.
    GotNewConfig {
        /// The adopted configuration.
        config: Arc<ClusterConfig>,
        /// Provider that delivered it.
        origin: ProviderKind,
    },

    /// Every active provider was tried without producing a newer config.
    ProvidersCycled {
        /// Most specific error recorded while cycling.
        last_error: Option<Error>,
    },

    /// The monitor stopped refreshing.
    MonitorStopped,
}

impl ConfigEvent {
    /// Revision of the configuration carried by this event, if any.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ConfigEvent::GotNewConfig { config, .. } => config.revision(),
            _ => None,
        }
    }

    /// Check if this event carries a new configuration.
    pub fn is_new_config(&self) -> bool {
        matches!(self, ConfigEvent::GotNewConfig { .. })
    }
}

/// Listener for configuration events.
pub trait ConfigListener: Send + Sync + 'static {
    /// Called synchronously, after the router has been rebuilt.
    fn on_event(&self, event: &ConfigEvent);
}

/// No-op event listener.
pub struct NoopConfigListener;

impl ConfigListener for NoopConfigListener {
    fn on_event(&self, _event: &ConfigEvent) {}
}

/// Event listener that logs events.
pub struct LoggingConfigListener;

impl ConfigListener for LoggingConfigListener {
    fn on_event(&self, event: &ConfigEvent) {
        match event {
            ConfigEvent::GotNewConfig { config, origin } => {
                tracing::info!(
                    revision = ?config.revision(),
                    bucket = config.bucket(),
                    servers = config.num_servers(),
                    source = %origin,
                    "Cluster configuration adopted"
                );
            }
            ConfigEvent::ProvidersCycled { last_error } => {
                tracing::warn!(last_error = ?last_error, "All configuration providers cycled");
            }
            ConfigEvent::MonitorStopped => {
                tracing::trace!("Configuration monitor stopped");
            }
        }
    }
}
