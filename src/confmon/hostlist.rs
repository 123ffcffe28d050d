//! Rotating list of seed hosts.

use crate::types::HostPort;
use rand::seq::SliceRandom;

/// An ordered, de-duplicated host list with a cursor.
///
/// [`HostList::next`] walks the list once; only a call that is allowed to
/// roll over starts again from the top.
#[derive(Debug, Clone, Default)]
pub struct HostList {
    hosts: Vec<HostPort>,
    cursor: usize,
}

impl HostList {
    /// Create a list from `hosts`, dropping duplicates.
    pub fn new(hosts: impl IntoIterator<Item = HostPort>) -> Self {
        let mut list = Self::default();
        for host in hosts {
            list.add(host);
        }
        list
    }

    /// Append a host unless already present.
    pub fn add(&mut self, host: HostPort) {
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    /// Replace the hosts and rewind the cursor.
    pub fn replace(&mut self, hosts: impl IntoIterator<Item = HostPort>) {
        self.hosts.clear();
        self.cursor = 0;
        for host in hosts {
            self.add(host);
        }
    }

    /// Shuffle the hosts and rewind the cursor.
    pub fn randomize(&mut self) {
        self.hosts.shuffle(&mut rand::thread_rng());
        self.cursor = 0;
    }

    /// Next host, or `None` once the end is reached and `rollover` is false.
    pub fn next(&mut self, rollover: bool) -> Option<HostPort> {
        if self.hosts.is_empty() {
            return None;
        }
        if self.cursor >= self.hosts.len() {
            if !rollover {
                return None;
            }
            self.cursor = 0;
        }
        let host = self.hosts[self.cursor].clone();
        self.cursor += 1;
        Some(host)
    }

    /// Whether every host has been handed out since the last rewind.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.hosts.len()
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// All hosts in order.
    pub fn hosts(&self) -> &[HostPort] {
        &self.hosts
    }
}
