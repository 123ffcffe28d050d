//! Configuration blobs shaped like the ones a cluster serves.
//!
//! Server `i` is always `10.0.0.{i+1}`, data port 11210, management port
//! 8091, and the bucket is `default`.

use crate::types::HostPort;
use serde_json::{json, Value};

/// Data-service address of server `index` in every fixture.
pub fn kv_host(index: usize) -> HostPort {
    HostPort::new(format!("10.0.0.{}", index + 1), 11210)
}

/// Management address of server `index` in every fixture.
pub fn mgmt_host(index: usize) -> HostPort {
    HostPort::new(format!("10.0.0.{}", index + 1), 8091)
}

fn nodes(num_servers: usize) -> Value {
    (0..num_servers)
        .map(|i| {
            json!({
                "hostname": mgmt_host(i).to_string(),
                "ports": {"direct": 11210}
            })
        })
        .collect()
}

fn server_list(num_servers: usize) -> Value {
    (0..num_servers).map(|i| kv_host(i).to_string()).collect()
}

fn vbucket_map<F>(num_vbuckets: usize, row: F) -> Value
where
    F: Fn(usize) -> Vec<i64>,
{
    (0..num_vbuckets).map(|vb| json!(row(vb))).collect()
}

fn vbucket_doc<F>(
    rev: Option<u64>,
    num_servers: usize,
    num_vbuckets: usize,
    num_replicas: usize,
    row: F,
) -> Value
where
    F: Fn(usize) -> Vec<i64>,
{
    let mut doc = json!({
        "name": "default",
        "nodeLocator": "vbucket",
        "nodes": nodes(num_servers),
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": num_replicas,
            "serverList": server_list(num_servers),
            "vBucketMap": vbucket_map(num_vbuckets, row),
        }
    });
    if let Some(rev) = rev {
        doc["rev"] = json!(rev);
    }
    doc
}

/// A vbucket configuration. `row(vb)` yields `[master, replica1, ...]`,
/// with `-1` for an unassigned slot.
pub fn vbucket_config_json<F>(
    rev: u64,
    num_servers: usize,
    num_vbuckets: usize,
    num_replicas: usize,
    row: F,
) -> String
where
    F: Fn(usize) -> Vec<i64>,
{
    vbucket_doc(Some(rev), num_servers, num_vbuckets, num_replicas, row).to_string()
}

/// Same as [`vbucket_config_json`] with no replicas and no revision.
pub fn vbucket_config_json_without_rev<F>(num_servers: usize, num_vbuckets: usize, row: F) -> String
where
    F: Fn(usize) -> Vec<i64>,
{
    vbucket_doc(None, num_servers, num_vbuckets, 0, row).to_string()
}

/// A vbucket configuration in the middle of a rebalance.
pub fn vbucket_config_json_with_forward<F, G>(
    rev: u64,
    num_servers: usize,
    num_vbuckets: usize,
    row: F,
    forward_row: G,
) -> String
where
    F: Fn(usize) -> Vec<i64>,
    G: Fn(usize) -> Vec<i64>,
{
    let mut doc = vbucket_doc(Some(rev), num_servers, num_vbuckets, 0, row);
    doc["vBucketServerMap"]["vBucketMapForward"] = vbucket_map(num_vbuckets, forward_row);
    doc.to_string()
}

/// A memcached-style bucket distributed over a ketama continuum.
pub fn ketama_config_json(rev: u64, num_servers: usize) -> String {
    json!({
        "rev": rev,
        "name": "default",
        "nodeLocator": "ketama",
        "nodes": nodes(num_servers),
    })
    .to_string()
}

/// Three servers, one replica, 1024 vbuckets. Vbucket `vb` lives on
/// `(vb + shift) % 3` with its replica on the next server.
pub fn three_node_json(rev: u64, shift: usize) -> String {
    vbucket_config_json(rev, 3, 1024, 1, move |vb| {
        vec![((vb + shift) % 3) as i64, ((vb + shift + 1) % 3) as i64]
    })
}
