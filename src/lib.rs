//! Client-side runtime for a vbucket-partitioned key-value cluster.
//!
//! This crate tracks the cluster topology, routes keys to the server that
//! owns them, retries operations across topology changes, and polls replicas
//! until a write is durable:
//! - **ConfigMonitor** cycles configuration providers (cache file, data-port
//!   push, HTTP stream) and adopts only strictly newer configurations
//! - **Bootstrap** bounds the first fetch with a deadline and throttles
//!   later refreshes
//! - **VBucketRouter** maps keys to vbuckets and vbuckets to servers, with
//!   remap guesses after NOT_MY_VBUCKET
//! - **RetryQueue** parks failed operations and re-sends them when their
//!   backoff ends or a new map arrives
//! - **DurabilityPoller** sweeps observe requests until persistence and
//!   replication thresholds are met
//!
//! Sockets, packet encoding and authentication handshakes are not part of
//! this crate. They plug in through [`ConfigTransport`], [`PacketScheduler`]
//! and [`Authenticator`].
//!
//! # Example
//!
//! ```rust,no_run
//! use vbucket_client::{ClientConfig, EventLoop, HostPort, Opcode};
//! # use vbucket_client::testing::{RecordingScheduler, RecordingTransport};
//! # use vbucket_client::transport::{Credentials, StaticAuthenticator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("default")
//!         .with_kv_hosts(vec!["10.0.0.1:11210".parse::<HostPort>()?]);
//! #   let transport = Box::new(RecordingTransport::new());
//! #   let scheduler = Box::new(RecordingScheduler::new());
//! #   let auth = Box::new(StaticAuthenticator::new(Credentials::new("u", "p")));
//!
//!     let (event_loop, handle) = EventLoop::new(config, transport, scheduler, auth);
//!     tokio::spawn(event_loop.run());
//!
//!     // Resolves once the first configuration is adopted, or fails at the
//!     // bootstrap deadline.
//!     handle.bootstrap().await?;
//!
//!     let op = handle.schedule(Opcode::Get, "user:123", None).await?;
//!     let response = op.wait().await?;
//!     println!("cas={} server={}", response.cas, response.server);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      Handle / network layer (Inbound)       │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │         EventLoop ── Session<I>             │
//! │  • schedule / cancel / durability_poll      │
//! │  • on_kv_response / on_server_failure       │
//! │  • on_config_* / on_observe_* / on_timer    │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬───────────────┐
//!     ▼               ▼               ▼               ▼
//! ┌─────────┐   ┌───────────┐   ┌───────────┐   ┌────────────┐
//! │ConfigMon│   │  VBucket  │   │  Retry    │   │ Durability │
//! │Bootstrap│   │  Router   │   │  Queue    │   │  Poller    │
//! └─────────┘   └───────────┘   └───────────┘   └────────────┘
//!                     │
//!                     ▼
//!          IoCapability (ManualIo | TokioIo)
//! ```
//!
//! # Execution model
//!
//! Every inbound event is handled to completion by one call on
//! [`Session`]. Timers are named ([`TimerId`]) and armed through
//! [`IoCapability`], so the same session runs under tokio ([`TokioIo`]) or
//! under a virtual clock in tests ([`ManualIo`]).

pub mod bootstrap;
pub mod config;
pub mod confmon;
pub mod durability;
pub mod error;
pub mod io;
pub mod metrics;
pub mod operation;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod testing;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::{BootstrapConfig, ClientConfig, DurabilityConfig, ProviderConfig, RetryConfig};
pub use error::{Error, ErrorCategory, Result};
pub use runtime::{DurabilityWait, EventLoop, Handle, Inbound, Scheduled};
pub use session::Session;
pub use types::{Cas, HostPort, KvStatus, Opcode, OperationId, ServerIndex, VbucketId};

// Configuration tracking
pub use bootstrap::{Bootstrap, BootstrapOptions, BootstrapState};
pub use confmon::{ConfigEvent, ConfigListener, ConfigMonitor, LoggingConfigListener, ProviderKind};

// Routing
pub use topology::{ClusterConfig, Distribution, VBucketRouter};

// Retries
pub use retry::{RetryAction, RetryClassifier, RetryMode, RetryQueue, RetryStrategy};

// Durability
pub use durability::{DurabilityCommand, DurabilityOptions, DurabilityPoller, DurabilityResult, SetId};

// Operations and collaborators
pub use io::{IoCapability, ManualIo, TimerId, TokioIo};
pub use operation::{OperationResponse, PendingOperation};
pub use transport::{Authenticator, ConfigTransport, KvRequest, KvResponse, PacketScheduler};

// Metrics
pub use metrics::{CategoryCounter, ClientMetrics, Counter, Gauge, MetricsSnapshot};
