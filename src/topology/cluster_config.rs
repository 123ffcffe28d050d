//! Parsed cluster configuration snapshots.
//!
//! A [`ClusterConfig`] is immutable once built. Successive snapshots are
//! ordered by revision; a snapshot without a revision never supersedes one
//! that has one.

use crate::error::{Error, ProtocolError, Result};
use crate::types::{HostPort, ServerIndex, VbucketId};
use serde::Deserialize;
use std::collections::HashMap;

/// Placeholder the cluster uses for "the host you fetched this from".
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// How keys are distributed across servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// CRC32-derived vbucket hashing.
    Vbucket,
    /// Ketama continuum (memcached buckets).
    Ketama,
}

/// One node as listed in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Data-service address.
    pub kv: HostPort,
    /// Management (HTTP) address, if advertised.
    pub mgmt: Option<HostPort>,
}

/// Master and replica server indices of one vbucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketServers {
    servers: Vec<Option<ServerIndex>>,
}

impl VbucketServers {
    /// Build from `[master, replica1, ...]`.
    pub fn new(servers: Vec<Option<ServerIndex>>) -> Self {
        Self { servers }
    }

    /// Current master.
    pub fn master(&self) -> Option<ServerIndex> {
        self.servers.first().copied().flatten()
    }

    /// The `n`-th replica (0-based).
    pub fn replica(&self, n: usize) -> Option<ServerIndex> {
        self.servers.get(n + 1).copied().flatten()
    }

    /// All assigned replicas, in order.
    pub fn replicas(&self) -> impl Iterator<Item = ServerIndex> + '_ {
        self.servers.iter().skip(1).filter_map(|s| *s)
    }

    /// Whether `server` is the master or a replica.
    pub fn contains(&self, server: ServerIndex) -> bool {
        self.servers.iter().any(|s| *s == Some(server))
    }
}

/// What changed between two configurations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers_modified: bool,
    pub map_modified: bool,
    pub replicas_modified: bool,
}

impl ConfigDiff {
    /// Whether anything at all changed.
    pub fn is_empty(&self) -> bool {
        !(self.servers_modified || self.map_modified || self.replicas_modified)
    }
}

/// An immutable cluster configuration snapshot.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    revision: Option<u64>,
    bucket: String,
    distribution: Distribution,
    servers: Vec<HostPort>,
    nodes: Vec<NodeInfo>,
    num_replicas: usize,
    vbuckets: Vec<VbucketServers>,
    forward: Option<Vec<VbucketServers>>,
    owned_counts: Vec<usize>,
    source: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    rev: Option<u64>,
    name: String,
    node_locator: String,
    #[serde(default)]
    nodes: Vec<RawNode>,
    nodes_ext: Option<Vec<RawNodeExt>>,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawServerMap>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMap {
    num_replicas: usize,
    #[serde(default)]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i64>>,
    #[serde(rename = "vBucketMapForward")]
    vbucket_map_forward: Option<Vec<Vec<i64>>>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError::InvalidConfig(msg.into()))
}

impl ClusterConfig {
    /// Parse a configuration blob fetched from `source_host`.
    ///
    /// Every `$HOST` placeholder is replaced with `source_host` first.
    pub fn parse(json: &str, source_host: &str) -> Result<Self> {
        let text = json.replace(HOST_PLACEHOLDER, source_host);
        let raw: RawConfig = serde_json::from_str(&text)?;

        let distribution = match raw.node_locator.as_str() {
            "ketama" => Distribution::Ketama,
            _ => Distribution::Vbucket,
        };

        let nodes = match &raw.nodes_ext {
            Some(ext) => ext
                .iter()
                .filter_map(|n| {
                    let host = n.hostname.clone().unwrap_or_else(|| source_host.to_string());
                    let kv = HostPort::new(host.clone(), *n.services.get("kv")?);
                    let mgmt = n.services.get("mgmt").map(|p| HostPort::new(host, *p));
                    Some(NodeInfo { kv, mgmt })
                })
                .collect::<Vec<_>>(),
            None => raw
                .nodes
                .iter()
                .map(|n| {
                    let mgmt: HostPort = n.hostname.parse()?;
                    let direct = n
                        .ports
                        .get("direct")
                        .copied()
                        .ok_or_else(|| invalid(format!("node {} has no direct port", n.hostname)))?;
                    Ok(NodeInfo {
                        kv: HostPort::new(mgmt.host.clone(), direct),
                        mgmt: Some(mgmt),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let mut config = Self {
            revision: raw.rev,
            bucket: raw.name,
            distribution,
            servers: Vec::new(),
            nodes,
            num_replicas: 0,
            vbuckets: Vec::new(),
            forward: None,
            owned_counts: Vec::new(),
            source: text,
        };

        match distribution {
            Distribution::Ketama => {
                config.servers = config.nodes.iter().map(|n| n.kv.clone()).collect();
            }
            Distribution::Vbucket => {
                let map = raw
                    .vbucket_server_map
                    .ok_or_else(|| invalid("expected top-level 'vBucketServerMap'"))?;
                config.servers = map
                    .server_list
                    .iter()
                    .map(|s| s.parse())
                    .collect::<Result<Vec<HostPort>>>()?;
                config.num_replicas = map.num_replicas;
                config.vbuckets = build_vbmap(&map.vbucket_map, config.servers.len())?;
                if config.vbuckets.is_empty() {
                    return Err(invalid("empty vBucketMap"));
                }
                if let Some(fwd) = &map.vbucket_map_forward {
                    let fwd = build_vbmap(fwd, config.servers.len())?;
                    if fwd.len() != config.vbuckets.len() {
                        return Err(invalid("vBucketMapForward size differs from vBucketMap"));
                    }
                    config.forward = Some(fwd);
                }
            }
        }

        if config.servers.is_empty() {
            return Err(invalid("configuration lists no servers"));
        }

        config.owned_counts = vec![0; config.servers.len()];
        for entry in config.vbuckets.iter().chain(config.forward.iter().flatten()) {
            for server in entry.servers.iter().flatten() {
                config.owned_counts[*server] += 1;
            }
        }

        Ok(config)
    }

    /// Revision, if the configuration carries one.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key distribution scheme.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Data-service addresses, indexed by [`ServerIndex`].
    pub fn servers(&self) -> &[HostPort] {
        &self.servers
    }

    /// Number of servers.
    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// Nodes as advertised by the cluster.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Configured replica count.
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Number of vbuckets (zero for ketama).
    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    /// Server assignment of `vb`.
    pub fn vbucket(&self, vb: VbucketId) -> Option<&VbucketServers> {
        self.vbuckets.get(vb as usize)
    }

    /// Whole vbucket table.
    pub fn vbuckets(&self) -> &[VbucketServers] {
        &self.vbuckets
    }

    /// Server assignment of `vb` in the forward (post-rebalance) map.
    pub fn forward_vbucket(&self, vb: VbucketId) -> Option<&VbucketServers> {
        self.forward.as_ref()?.get(vb as usize)
    }

    /// How many vbucket slots (master or replica, current or forward) a
    /// server holds.
    pub fn owned_count(&self, server: ServerIndex) -> usize {
        self.owned_counts.get(server).copied().unwrap_or(0)
    }

    /// Management addresses of all nodes.
    pub fn mgmt_hosts(&self) -> Vec<HostPort> {
        self.nodes.iter().filter_map(|n| n.mgmt.clone()).collect()
    }

    /// The blob this snapshot was parsed from, placeholders resolved.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compare the server list, map and replica assignments.
    pub fn diff(&self, other: &ClusterConfig) -> ConfigDiff {
        let servers_modified = self.servers != other.servers;
        let same_len = self.vbuckets.len() == other.vbuckets.len();
        let map_modified = !same_len
            || self
                .vbuckets
                .iter()
                .zip(&other.vbuckets)
                .any(|(a, b)| a.master() != b.master());
        let replicas_modified = !same_len
            || self
                .vbuckets
                .iter()
                .zip(&other.vbuckets)
                .any(|(a, b)| !a.replicas().eq(b.replicas()));
        ConfigDiff {
            servers_modified,
            map_modified,
            replicas_modified,
        }
    }

    /// Whether `self` should replace `active`.
    ///
    /// A revisioned candidate wins only with a strictly greater revision. A
    /// candidate without revision never replaces a revisioned one; between
    /// two revisionless configurations any content change wins.
    pub fn supersedes(&self, active: &ClusterConfig) -> bool {
        match (self.revision, active.revision) {
            (Some(candidate), Some(current)) => candidate > current,
            (None, Some(_)) => false,
            (Some(_), None) => true,
            (None, None) => !self.diff(active).is_empty(),
        }
    }
}

fn build_vbmap(raw: &[Vec<i64>], num_servers: usize) -> Result<Vec<VbucketServers>> {
    if raw.len() > (u16::MAX as usize) + 1 {
        return Err(invalid(format!("too many vbuckets: {}", raw.len())));
    }
    raw.iter()
        .enumerate()
        .map(|(vb, row)| {
            let servers = row
                .iter()
                .map(|&ix| match ix {
                    ix if ix < 0 => Ok(None),
                    ix if (ix as usize) < num_servers => Ok(Some(ix as usize)),
                    ix => Err(invalid(format!(
                        "vbucket {} references server {} of {}",
                        vb, ix, num_servers
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(VbucketServers::new(servers))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_parse_vbucket_config() {
        let json = fixtures::vbucket_config_json(5, 3, 8, 1, |vb| vec![(vb % 3) as i64, ((vb + 1) % 3) as i64]);
        let config = ClusterConfig::parse(&json, "10.0.0.1").unwrap();

        assert_eq!(config.revision(), Some(5));
        assert_eq!(config.bucket(), "default");
        assert_eq!(config.distribution(), Distribution::Vbucket);
        assert_eq!(config.num_servers(), 3);
        assert_eq!(config.num_vbuckets(), 8);
        assert_eq!(config.num_replicas(), 1);
        assert_eq!(config.vbucket(4).unwrap().master(), Some(1));
        assert_eq!(config.vbucket(4).unwrap().replica(0), Some(2));
        assert_eq!(config.owned_count(0), 5);
    }

    #[test]
    fn test_host_placeholder_replaced() {
        let json = r#"{
            "rev": 12,
            "name": "default",
            "nodeLocator": "vbucket",
            "nodes": [{"hostname": "$HOST:8091", "ports": {"direct": 11210}}],
            "vBucketServerMap": {
                "numReplicas": 0,
                "serverList": ["$HOST:11210"],
                "vBucketMap": [[0], [0]]
            }
        }"#;
        let config = ClusterConfig::parse(json, "192.168.1.9").unwrap();
        assert_eq!(config.servers()[0], HostPort::new("192.168.1.9", 11210));
        assert_eq!(config.mgmt_hosts(), vec![HostPort::new("192.168.1.9", 8091)]);
        assert!(!config.source().contains(HOST_PLACEHOLDER));
    }

    #[test]
    fn test_missing_revision() {
        let json = r#"{
            "name": "default",
            "nodeLocator": "vbucket",
            "nodesExt": [{"hostname": "a", "services": {"kv": 11210, "mgmt": 8091}}],
            "vBucketServerMap": {"numReplicas": 0, "serverList": ["a:11210"], "vBucketMap": [[0]]}
        }"#;
        let config = ClusterConfig::parse(json, "a").unwrap();
        assert_eq!(config.revision(), None);
        assert_eq!(config.nodes()[0].kv, HostPort::new("a", 11210));
    }

    #[test]
    fn test_parse_ketama() {
        let config = ClusterConfig::parse(&fixtures::ketama_config_json(3, 2), "h").unwrap();
        assert_eq!(config.distribution(), Distribution::Ketama);
        assert_eq!(config.num_servers(), 2);
        assert_eq!(config.num_vbuckets(), 0);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ClusterConfig::parse("not json", "h").is_err());

        let out_of_range = fixtures::vbucket_config_json(1, 2, 4, 0, |_| vec![5]);
        assert!(matches!(
            ClusterConfig::parse(&out_of_range, "h"),
            Err(Error::Protocol(ProtocolError::InvalidConfig(_)))
        ));

        let no_map = r#"{"rev": 1, "name": "b", "nodeLocator": "vbucket", "nodes": []}"#;
        assert!(ClusterConfig::parse(no_map, "h").is_err());
    }

    #[test]
    fn test_supersedes() {
        let json = |rev| fixtures::vbucket_config_json(rev, 2, 4, 0, |vb| vec![(vb % 2) as i64]);
        let v5 = ClusterConfig::parse(&json(5), "h").unwrap();
        let v6 = ClusterConfig::parse(&json(6), "h").unwrap();
        let v5b = ClusterConfig::parse(&json(5), "h").unwrap();

        assert!(v6.supersedes(&v5));
        assert!(!v5.supersedes(&v6));
        assert!(!v5b.supersedes(&v5));

        let unversioned = ClusterConfig::parse(
            &fixtures::vbucket_config_json_without_rev(2, 4, |vb| vec![(vb % 2) as i64]),
            "h",
        )
        .unwrap();
        assert!(!unversioned.supersedes(&v5));
        assert!(v5.supersedes(&unversioned));
        assert!(!unversioned.supersedes(&unversioned.clone()));
    }

    #[test]
    fn test_diff() {
        let a = ClusterConfig::parse(
            &fixtures::vbucket_config_json(1, 3, 4, 1, |vb| vec![(vb % 3) as i64, ((vb + 1) % 3) as i64]),
            "h",
        )
        .unwrap();
        let b = ClusterConfig::parse(
            &fixtures::vbucket_config_json(2, 3, 4, 1, |vb| {
                if vb == 0 {
                    vec![2, 1]
                } else {
                    vec![(vb % 3) as i64, ((vb + 1) % 3) as i64]
                }
            }),
            "h",
        )
        .unwrap();

        let diff = a.diff(&b);
        assert!(!diff.servers_modified);
        assert!(diff.map_modified);
        assert!(!diff.replicas_modified);
        assert!(a.diff(&a.clone()).is_empty());
    }
}
