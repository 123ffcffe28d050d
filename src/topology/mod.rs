//! Cluster topology: configuration snapshots and key routing.
//!
//! ```text
//!   config blob ──parse──► ClusterConfig (immutable, Arc-shared)
//!                                 │ rebuild (once per adoption)
//!                                 ▼
//!                          VBucketRouter
//!                ┌────────────────┴────────────────┐
//!        map_key(key)                     guess_remap(vb, bad)
//!   CRC32 vbucket hash or ketama       side table, dropped on rebuild
//! ```

mod cluster_config;
mod ketama;
mod router;

pub use cluster_config::{
    ClusterConfig, ConfigDiff, Distribution, NodeInfo, VbucketServers, HOST_PLACEHOLDER,
};
pub use ketama::Continuum;
pub use router::{KeyRoute, VBucketRouter};
