//! Configuration types for the client runtime.

use crate::retry::RetryMode;
use crate::types::HostPort;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bucket to open.
    pub bucket: String,

    /// Seed hosts for the push-protocol (data port) provider.
    pub kv_hosts: Vec<HostPort>,

    /// Seed hosts for the HTTP streaming provider (management port).
    pub http_hosts: Vec<HostPort>,

    /// Shuffle seed host lists before the first use.
    pub randomize_hosts: bool,

    /// Bootstrap and refresh behavior.
    pub bootstrap: BootstrapConfig,

    /// Configuration provider settings.
    pub providers: ProviderConfig,

    /// Retry behavior for failed operations.
    pub retry: RetryConfig,

    /// Durability polling defaults.
    pub durability: DurabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bucket: "default".to_string(),
            kv_hosts: Vec::new(),
            http_hosts: Vec::new(),
            randomize_hosts: false,
            bootstrap: BootstrapConfig::default(),
            providers: ProviderConfig::default(),
            retry: RetryConfig::default(),
            durability: DurabilityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration for the given bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Set the data-port seed hosts.
    pub fn with_kv_hosts(mut self, hosts: Vec<HostPort>) -> Self {
        self.kv_hosts = hosts;
        self
    }

    /// Set the management-port seed hosts.
    pub fn with_http_hosts(mut self, hosts: Vec<HostPort>) -> Self {
        self.http_hosts = hosts;
        self
    }

    /// Shuffle the seed host lists.
    pub fn with_randomized_hosts(mut self, randomize: bool) -> Self {
        self.randomize_hosts = randomize;
        self
    }

    /// Set bootstrap configuration.
    pub fn with_bootstrap_config(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Set provider configuration.
    pub fn with_provider_config(mut self, providers: ProviderConfig) -> Self {
        self.providers = providers;
        self
    }

    /// Set retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set durability configuration.
    pub fn with_durability_config(mut self, durability: DurabilityConfig) -> Self {
        self.durability = durability;
        self
    }

    /// Set the initial bootstrap deadline.
    pub fn with_config_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap.config_timeout = timeout;
        self
    }

    /// Set the on-disk configuration cache file.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.providers.cache_file = Some(path.into());
        self
    }

    /// Set the default operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.retry.operation_timeout = timeout;
        self
    }
}

/// Bootstrap and refresh throttling configuration.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Hard deadline for the first configuration.
    pub config_timeout: Duration,

    /// Minimum time since the last refresh before a throttled refresh proceeds.
    pub delay_threshold: Duration,

    /// Error count that lets a throttled refresh bypass the delay.
    pub error_threshold: u32,

    /// Pause before trying the next provider once a configuration exists.
    pub grace_next_provider: Duration,

    /// Background poll interval while configured over the push protocol.
    /// Zero disables polling.
    pub config_poll_interval: Duration,

    /// Fail the initial bootstrap as soon as every provider has been cycled,
    /// instead of waiting for the deadline.
    pub fail_fast: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            config_timeout: Duration::from_secs(5),
            delay_threshold: Duration::from_millis(10),
            error_threshold: 100,
            grace_next_provider: Duration::from_millis(100),
            config_poll_interval: Duration::from_millis(2500),
            fail_fast: false,
        }
    }
}

impl BootstrapConfig {
    /// Set the throttling thresholds.
    pub fn with_throttle(mut self, delay: Duration, errors: u32) -> Self {
        self.delay_threshold = delay;
        self.error_threshold = errors;
        self
    }

    /// Set the background poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = interval;
        self
    }

    /// Fail as soon as all providers are exhausted.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Configuration provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Enable the push-protocol (data port) provider.
    pub enable_push: bool,

    /// Enable the HTTP streaming provider.
    pub enable_http: bool,

    /// On-disk configuration cache.
    pub cache_file: Option<PathBuf>,

    /// How long a push-protocol request may stay unanswered before the
    /// provider moves to the next host.
    pub node_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enable_push: true,
            enable_http: true,
            cache_file: None,
            node_timeout: Duration::from_secs(2),
        }
    }
}

/// Retry behavior for failed operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Absolute deadline for every operation, measured from scheduling.
    pub operation_timeout: Duration,

    /// Base backoff; the n-th retry waits `n * retry_interval`.
    pub retry_interval: Duration,

    /// Backoff after NOT_MY_VBUCKET.
    pub nmv_retry_interval: Duration,

    /// Retry NOT_MY_VBUCKET immediately, ignoring `nmv_retry_interval`.
    pub nmv_retry_immediate: bool,

    /// Policy for network failures.
    pub network: RetryMode,

    /// Policy for NOT_MY_VBUCKET.
    pub vbucket_map: RetryMode,

    /// Policy for topology-change errors.
    pub topology_change: RetryMode,

    /// Keep operations queued when their vbucket has no owner.
    pub retry_on_missing_node: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(2500),
            retry_interval: Duration::from_millis(10),
            nmv_retry_interval: Duration::from_millis(100),
            nmv_retry_immediate: false,
            network: RetryMode::AllowIdempotentOnly,
            vbucket_map: RetryMode::AllowAll,
            topology_change: RetryMode::AllowAll,
            retry_on_missing_node: false,
        }
    }
}

impl RetryConfig {
    /// Set the network failure policy.
    pub fn with_network_mode(mut self, mode: RetryMode) -> Self {
        self.network = mode;
        self
    }

    /// Set the NOT_MY_VBUCKET policy.
    pub fn with_vbucket_map_mode(mut self, mode: RetryMode) -> Self {
        self.vbucket_map = mode;
        self
    }

    /// Set the topology-change policy.
    pub fn with_topology_change_mode(mut self, mode: RetryMode) -> Self {
        self.topology_change = mode;
        self
    }

    /// Retry NOT_MY_VBUCKET without backoff.
    pub fn with_nmv_immediate(mut self, immediate: bool) -> Self {
        self.nmv_retry_immediate = immediate;
        self
    }

    /// Keep operations whose vbucket has no owner.
    pub fn with_retry_on_missing_node(mut self, retry: bool) -> Self {
        self.retry_on_missing_node = retry;
        self
    }
}

/// Durability polling defaults.
#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Deadline for a whole durability request.
    pub timeout: Duration,

    /// Pause between observe sweeps.
    pub interval: Duration,

    /// Clamp thresholds to cluster capacity instead of rejecting the request.
    pub cap_max: bool,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(100),
            cap_max: false,
        }
    }
}
