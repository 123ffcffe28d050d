//! Testing utilities for the client runtime.
//!
//! Everything here runs against [`ManualIo`](crate::io::ManualIo): time only
//! moves when the test says so, and every packet the session wants to send
//! is recorded instead.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Test Harness                           │
//! │                                                             │
//! │  fixtures ──► configuration blobs (vbucket / ketama)        │
//! │                                                             │
//! │  ┌────────────────────┐   ┌──────────────────────────────┐  │
//! │  │ RecordingTransport │   │      RecordingScheduler      │  │
//! │  │  config fetches    │   │  routed KV packets, observes │  │
//! │  │  HTTP streams      │   │  cancellations               │  │
//! │  └─────────┬──────────┘   └───────────────┬──────────────┘  │
//! │            └──────────────┬───────────────┘                 │
//! │                           ▼                                 │
//! │              Session<ManualIo> / ConfigMonitor              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vbucket_client::testing::{fixtures, TestSession};
//!
//! let mut t = TestSession::bootstrapped(3, &fixtures::three_node_json(5, 0));
//! let (id, done) = t.get("foo");
//! let sent = t.scheduler.last_request().unwrap();
//! ```

pub mod fixtures;
mod harness;
mod session;

#[cfg(test)]
mod scenarios;

pub use harness::{ProviderHarness, RecordingScheduler, RecordingTransport};
pub use session::{Captured, TestSession};

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
