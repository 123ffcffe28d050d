//! Ketama continuum for memcached-style buckets.
//!
//! Each server contributes 160 points to the ring: 40 MD5 digests of
//! `"<host:port>-<n>"`, four little-endian `u32` points per digest. A key is
//! owned by the first point at or after the key's own hash, wrapping around.

use crate::types::{HostPort, ServerIndex};
use std::collections::BTreeMap;

/// MD5 digests generated per server.
pub const HASHES_PER_SERVER: u32 = 40;

/// Points taken from each digest.
pub const POINTS_PER_HASH: usize = 4;

/// A ketama hash ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuum {
    /// Ring position to owning server.
    points: BTreeMap<u32, ServerIndex>,
}

impl Continuum {
    /// Build the continuum for `servers`, indexed by position in the slice.
    pub fn build(servers: &[HostPort]) -> Self {
        // Points are laid down in authority order so colliding points resolve
        // the same way regardless of server list order.
        let mut ordered: Vec<(String, ServerIndex)> = servers
            .iter()
            .enumerate()
            .map(|(ix, hp)| (hp.to_string(), ix))
            .collect();
        ordered.sort();

        let mut points = BTreeMap::new();
        for (authority, ix) in &ordered {
            for hh in 0..HASHES_PER_SERVER {
                let digest = md5::compute(format!("{}-{}", authority, hh).as_bytes()).0;
                for chunk in digest.chunks_exact(4).take(POINTS_PER_HASH) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.insert(point, *ix);
                }
            }
        }

        Self { points }
    }

    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the ring has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Hash a key onto the ring.
    pub fn hash_key(key: &[u8]) -> u32 {
        let digest = md5::compute(key).0;
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Server owning `key`.
    pub fn server_for(&self, key: &[u8]) -> Option<ServerIndex> {
        let hash = Self::hash_key(key);
        self.points
            .range(hash..)
            .chain(self.points.iter())
            .next()
            .map(|(_, ix)| *ix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<HostPort> {
        (0..n)
            .map(|i| HostPort::new(format!("10.0.0.{}", i + 1), 11211))
            .collect()
    }

    #[test]
    fn test_points_per_server() {
        let ring = Continuum::build(&servers(3));
        // Collisions are astronomically unlikely for three hosts.
        assert_eq!(ring.len(), 3 * 160);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = Continuum::build(&servers(4));
        for i in 0..100 {
            let key = format!("key-{}", i);
            let first = ring.server_for(key.as_bytes());
            assert!(first.is_some());
            assert_eq!(first, ring.server_for(key.as_bytes()));
        }
    }

    #[test]
    fn test_order_independent() {
        let mut reversed = servers(3);
        reversed.reverse();
        let a = Continuum::build(&servers(3));
        let b = Continuum::build(&reversed);

        for i in 0..50 {
            let key = format!("user:{}", i);
            let ia = a.server_for(key.as_bytes()).unwrap();
            let ib = b.server_for(key.as_bytes()).unwrap();
            assert_eq!(servers(3)[ia], reversed[ib]);
        }
    }

    #[test]
    fn test_distribution_uses_every_server() {
        let ring = Continuum::build(&servers(3));
        let mut seen = [0usize; 3];
        for i in 0..3000 {
            let key = format!("sample_key_{}", i);
            seen[ring.server_for(key.as_bytes()).unwrap()] += 1;
        }
        assert!(seen.iter().all(|&n| n > 300), "skewed distribution: {:?}", seen);
    }

    #[test]
    fn test_empty_ring() {
        let ring = Continuum::build(&[]);
        assert!(ring.is_empty());
        assert_eq!(ring.server_for(b"anything"), None);
    }
}
