//! Key routing over the active cluster configuration.
//!
//! [`VBucketRouter::map_key`] is a pure function of the key and the active
//! configuration. On top of it the router keeps a side table of remap
//! guesses made after NOT_MY_VBUCKET responses; [`VBucketRouter::master`]
//! and [`VBucketRouter::route_key`] consult that table. Every guess is
//! dropped when the router is rebuilt for a new configuration.

use super::cluster_config::{ClusterConfig, Distribution, VbucketServers};
use super::ketama::Continuum;
use crate::error::{Error, Result};
use crate::types::{ServerIndex, VbucketId};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::collections::HashMap;
use std::sync::Arc;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Where a key should be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRoute {
    /// Vbucket of the key (always 0 for ketama buckets).
    pub vbucket: VbucketId,
    /// Owning server, if the vbucket currently has one.
    pub server: Option<ServerIndex>,
}

#[derive(Debug, Clone, Default)]
struct RemapGuess {
    current: Option<ServerIndex>,
    tried: Vec<ServerIndex>,
}

/// Maps keys to vbuckets and servers.
#[derive(Debug, Default)]
pub struct VBucketRouter {
    config: Option<Arc<ClusterConfig>>,
    masters: Vec<Option<ServerIndex>>,
    continuum: Option<Continuum>,
    guesses: HashMap<VbucketId, RemapGuess>,
}

impl VBucketRouter {
    /// Create a router with no configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a key to its vbucket given the number of vbuckets.
    pub fn vbucket_hash(key: &[u8], num_vbuckets: usize) -> VbucketId {
        if num_vbuckets == 0 {
            return 0;
        }
        let digest = (CRC32.checksum(key) >> 16) & 0x7fff;
        (digest as usize % num_vbuckets) as VbucketId
    }

    /// Replace the routing table with one derived from `config`.
    pub fn rebuild(&mut self, config: Arc<ClusterConfig>) {
        self.masters = config.vbuckets().iter().map(VbucketServers::master).collect();
        self.continuum = match config.distribution() {
            Distribution::Ketama => Some(Continuum::build(config.servers())),
            Distribution::Vbucket => None,
        };
        if !self.guesses.is_empty() {
            tracing::debug!(
                discarded = self.guesses.len(),
                revision = ?config.revision(),
                "Discarding vbucket remap guesses"
            );
            self.guesses.clear();
        }
        self.config = Some(config);
    }

    /// The configuration the router was last rebuilt with.
    pub fn config(&self) -> Option<&Arc<ClusterConfig>> {
        self.config.as_ref()
    }

    /// Revision of the routing configuration.
    pub fn revision(&self) -> Option<u64> {
        self.config.as_ref().and_then(|c| c.revision())
    }

    /// Master server of every vbucket, as read from the configuration.
    pub fn table(&self) -> &[Option<ServerIndex>] {
        &self.masters
    }

    /// Number of servers in the routing configuration.
    pub fn num_servers(&self) -> usize {
        self.config.as_ref().map_or(0, |c| c.num_servers())
    }

    /// Number of configured replicas.
    pub fn num_replicas(&self) -> usize {
        self.config.as_ref().map_or(0, |c| c.num_replicas())
    }

    /// Master and replicas of `vb` as read from the configuration.
    pub fn vbucket_servers(&self, vb: VbucketId) -> Option<&VbucketServers> {
        self.config.as_ref()?.vbucket(vb)
    }

    /// Whether `server` holds `vb`, as master or replica.
    pub fn has_vbucket(&self, vb: VbucketId, server: ServerIndex) -> bool {
        self.vbucket_servers(vb).map_or(false, |s| s.contains(server))
    }

    /// Map a key using the configuration only.
    pub fn map_key(&self, key: &[u8]) -> Result<KeyRoute> {
        let config = self.config.as_ref().ok_or(Error::NoConfiguration)?;
        if let Some(continuum) = &self.continuum {
            return Ok(KeyRoute {
                vbucket: 0,
                server: continuum.server_for(key),
            });
        }
        let vbucket = Self::vbucket_hash(key, config.num_vbuckets());
        Ok(KeyRoute {
            vbucket,
            server: self.masters.get(vbucket as usize).copied().flatten(),
        })
    }

    /// Map a key, preferring an outstanding remap guess for its vbucket.
    pub fn route_key(&self, key: &[u8]) -> Result<KeyRoute> {
        let route = self.map_key(key)?;
        if self.continuum.is_some() {
            return Ok(route);
        }
        Ok(KeyRoute {
            vbucket: route.vbucket,
            server: self.master(route.vbucket),
        })
    }

    /// Current best owner of `vb`: the remap guess if one exists, else the
    /// configured master.
    pub fn master(&self, vb: VbucketId) -> Option<ServerIndex> {
        match self.guesses.get(&vb) {
            Some(guess) => guess.current,
            None => self.masters.get(vb as usize).copied().flatten(),
        }
    }

    /// Whether a remap guess is outstanding for `vb`.
    pub fn has_guess(&self, vb: VbucketId) -> bool {
        self.guesses.contains_key(&vb)
    }

    /// Propose a new owner for `vb` after `bad` answered NOT_MY_VBUCKET.
    ///
    /// If the current owner is already someone other than `bad` it is
    /// returned unchanged. Otherwise candidates are tried in order: the
    /// forward map's master, the vbucket's replicas, then every other server
    /// holding vbuckets, each round-robin from `bad + 1`. Servers already
    /// tried for this vbucket are skipped. Returns `None` when nothing is
    /// left to try.
    pub fn guess_remap(&mut self, vb: VbucketId, bad: ServerIndex) -> Option<ServerIndex> {
        let config = self.config.clone()?;
        if self.continuum.is_some() || vb as usize >= config.num_vbuckets() {
            return None;
        }

        let current = self.master(vb);
        if current.is_some() && current != Some(bad) {
            return current;
        }

        let guess = self.guesses.entry(vb).or_insert_with(|| RemapGuess {
            current,
            tried: Vec::new(),
        });
        if !guess.tried.contains(&bad) {
            guess.tried.push(bad);
        }

        let nsrv = config.num_servers();
        let rotation = |start: ServerIndex| (1..=nsrv).map(move |step| (start + step) % nsrv);

        let forward = config.forward_vbucket(vb).and_then(VbucketServers::master);
        let replicas: Vec<ServerIndex> = match config.vbucket(vb) {
            Some(entry) => rotation(bad).filter(|ix| entry.replicas().any(|r| r == *ix)).collect(),
            None => Vec::new(),
        };
        let owners = rotation(bad).filter(|ix| config.owned_count(*ix) > 0);

        let next = forward
            .into_iter()
            .chain(replicas)
            .chain(owners)
            .find(|ix| !guess.tried.contains(ix));

        guess.current = next;
        match next {
            Some(ix) => {
                tracing::debug!(vbucket = vb, bad, guess = ix, "Remapped vbucket after NOT_MY_VBUCKET");
            }
            None => {
                tracing::debug!(vbucket = vb, bad, "No untried server left for vbucket");
            }
        }
        next
    }
}
