//! Observe-based durability polling.
//!
//! A durability request waits until every key in it has been persisted
//! and/or replicated to the requested number of nodes. The poller sends
//! observe sweeps until each key's predicate holds or the deadline passes.
//!
//! # Set lifecycle
//!
//! ```text
//!            poll()
//!              │ validate, build entries
//!              ▼
//!   ┌──► ObservePoll ──── sweep: one observe packet per server ────┐
//!   │                                                              ▼
//!   │                                                         WaitTimeout
//!   │                                      (timer armed at the deadline)
//!   │                                                              │
//!   └──── all servers answered, keys pending: arm interval ────────┤
//!                                                                  │
//!            deadline / cancel: purge pending entries ◄────────────┘
//!                                │
//!                                ▼
//!                             Ignore ──► dropped once no entry is
//!                                        pending and no sweep in flight
//! ```
//!
//! The set is held by one reference per pending entry plus one while a
//! sweep's responses are outstanding; it is removed from the poller when
//! both reach zero.

mod entry;
mod observe;

pub use entry::{
    Applied, DurabilityCallback, DurabilityCommand, DurabilityCounts, DurabilityEntry,
    DurabilityResult, Requirement,
};
pub use observe::{
    decode_request, decode_response, encode_request, encode_response, ObserveRequest,
    ObserveResult, ObserveStatus,
};

use crate::config::DurabilityConfig;
use crate::error::{DurabilityError, Error, Result};
use crate::io::{IoCapability, TimerId};
use crate::topology::{Distribution, VBucketRouter};
use crate::transport::PacketScheduler;
use crate::types::ServerIndex;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of one durability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(pub u64);

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dset#{}", self.0)
    }
}

/// Options of one durability request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityOptions {
    pub persist_to: u16,
    pub replicate_to: u16,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
    /// Overrides the configured sweep interval.
    pub interval: Option<Duration>,
    /// Clamp thresholds to what the cluster can provide.
    pub cap_max: bool,
    /// Wait for deletion instead of storage.
    pub check_delete: bool,
}

impl DurabilityOptions {
    /// Wait for `persist_to` persisted copies and `replicate_to` replicas.
    pub fn new(persist_to: u16, replicate_to: u16) -> Self {
        Self {
            persist_to,
            replicate_to,
            timeout: None,
            interval: None,
            cap_max: false,
            check_delete: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_cap_max(mut self, cap_max: bool) -> Self {
        self.cap_max = cap_max;
        self
    }

    pub fn with_check_delete(mut self, check_delete: bool) -> Self {
        self.check_delete = check_delete;
        self
    }
}

/// Poll state of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetState {
    /// The timer will start the next sweep.
    ObservePoll,
    /// A sweep is in flight; the timer guards the deadline.
    WaitTimeout,
    /// Finished or cancelled; waiting for stragglers.
    Ignore,
}

/// All entries of one durability request.
#[derive(Debug)]
pub struct DurabilitySet {
    id: SetId,
    entries: Vec<DurabilityEntry>,
    index: HashMap<Bytes, usize>,
    requirement: Requirement,
    deadline: Instant,
    interval: Duration,
    state: SetState,
    sweep: u64,
    /// Servers whose sweep packet is unanswered, with the entries it carried.
    outstanding: BTreeMap<ServerIndex, Vec<usize>>,
    remaining: usize,
    cancelled: bool,
}

impl DurabilitySet {
    pub fn id(&self) -> SetId {
        self.id
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    pub fn requirement(&self) -> Requirement {
        self.requirement
    }

    /// Entries still waiting for an outcome.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// References keeping the set alive.
    pub fn refcount(&self) -> usize {
        self.remaining + usize::from(!self.outstanding.is_empty())
    }

    /// Whether a sweep is waiting for responses.
    pub fn sweep_in_flight(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn entries(&self) -> &[DurabilityEntry] {
        &self.entries
    }

    fn settle(&mut self, ix: usize, result: Result<()>) {
        let entry = &mut self.entries[ix];
        if entry.is_done() {
            return;
        }
        entry.finish(result);
        self.remaining -= 1;
    }

    fn note_applied(&mut self, applied: Applied) {
        if applied == Applied::Done {
            self.remaining -= 1;
        }
    }

    /// Finish every pending entry. A recorded transient error wins over
    /// `error` unless `force` is set.
    fn purge(&mut self, error: Error, force: bool) {
        self.state = SetState::Ignore;
        for ix in 0..self.entries.len() {
            if self.entries[ix].is_done() {
                continue;
            }
            let error = match self.entries[ix].pending_error() {
                Some(pending) if !force => pending.clone(),
                _ => error.clone(),
            };
            self.settle(ix, Err(error));
        }
    }
}

/// Drives every outstanding durability request.
#[derive(Debug)]
pub struct DurabilityPoller {
    sets: HashMap<SetId, DurabilitySet>,
    next_id: u64,
    defaults: DurabilityConfig,
}

impl DurabilityPoller {
    pub fn new(defaults: DurabilityConfig) -> Self {
        Self {
            sets: HashMap::new(),
            next_id: 1,
            defaults,
        }
    }

    /// Number of live sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn set(&self, id: SetId) -> Option<&DurabilitySet> {
        self.sets.get(&id)
    }

    /// Start waiting on `commands`.
    ///
    /// Requests the cluster cannot satisfy are rejected here, before any
    /// packet is sent; their callbacks are dropped without being called.
    /// On success the first sweep has already been scheduled.
    pub fn poll(
        &mut self,
        commands: Vec<DurabilityCommand>,
        options: DurabilityOptions,
        router: &VBucketRouter,
        io: &mut dyn IoCapability,
        scheduler: &mut dyn PacketScheduler,
    ) -> Result<SetId> {
        let requirement = self.verify(&commands, options, router)?;

        let id = SetId(self.next_id);
        self.next_id += 1;

        let num_vbuckets = router.config().map_or(0, |c| c.num_vbuckets());
        let mut index = HashMap::with_capacity(commands.len());
        let entries: Vec<DurabilityEntry> = commands
            .into_iter()
            .enumerate()
            .map(|(ix, command)| {
                index.insert(command.key.clone(), ix);
                let vbucket = VBucketRouter::vbucket_hash(&command.key, num_vbuckets);
                DurabilityEntry::new(command, vbucket)
            })
            .collect();

        let timeout = options.timeout.unwrap_or(self.defaults.timeout);
        let set = DurabilitySet {
            id,
            remaining: entries.len(),
            entries,
            index,
            requirement,
            deadline: io.now() + timeout,
            interval: options.interval.unwrap_or(self.defaults.interval),
            state: SetState::ObservePoll,
            sweep: 0,
            outstanding: BTreeMap::new(),
            cancelled: false,
        };
        tracing::debug!(
            set = %id,
            keys = set.entries.len(),
            persist_to = requirement.persist_to,
            replicate_to = requirement.replicate_to,
            timeout_ms = timeout.as_millis() as u64,
            "Starting durability poll"
        );
        self.sets.insert(id, set);
        self.sweep(id, router, io, scheduler);
        Ok(id)
    }

    fn verify(
        &self,
        commands: &[DurabilityCommand],
        options: DurabilityOptions,
        router: &VBucketRouter,
    ) -> Result<Requirement> {
        if commands.is_empty() {
            return Err(Error::InvalidArgument("no keys to observe".into()));
        }
        if options.persist_to == 0 && options.replicate_to == 0 {
            return Err(Error::InvalidArgument(
                "persist_to and replicate_to are both zero".into(),
            ));
        }
        let config = router.config().ok_or(Error::TemporaryFailure)?;
        if config.distribution() != Distribution::Vbucket {
            return Err(Error::InvalidArgument(
                "durability requires a vbucket distribution".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(commands.len());
        for command in commands {
            if command.key.is_empty() {
                return Err(Error::InvalidArgument("empty key".into()));
            }
            if !seen.insert(&command.key) {
                return Err(DurabilityError::DuplicateKey(
                    String::from_utf8_lossy(&command.key).into_owned(),
                )
                .into());
            }
        }

        let replica_max = config
            .num_replicas()
            .min(config.num_servers().saturating_sub(1)) as u16;
        let persist_max = replica_max + 1;
        let mut persist_to = options.persist_to;
        let mut replicate_to = options.replicate_to;

        if persist_to > persist_max {
            if !options.cap_max {
                return Err(DurabilityError::TooManyPersisted {
                    requested: persist_to,
                    available: persist_max,
                }
                .into());
            }
            persist_to = persist_max;
        }
        if replicate_to > replica_max {
            if !options.cap_max {
                return Err(DurabilityError::TooManyReplicas {
                    requested: replicate_to,
                    available: replica_max,
                }
                .into());
            }
            replicate_to = replica_max;
        }

        Ok(Requirement {
            persist_to,
            replicate_to,
            check_delete: options.check_delete,
        })
    }

    /// Issue one observe sweep for `id`.
    fn sweep(
        &mut self,
        id: SetId,
        router: &VBucketRouter,
        io: &mut dyn IoCapability,
        scheduler: &mut dyn PacketScheduler,
    ) {
        let Some(set) = self.sets.get_mut(&id) else {
            return;
        };
        set.sweep += 1;
        let req = set.requirement;

        let mut per_server: BTreeMap<ServerIndex, Vec<usize>> = BTreeMap::new();
        for (ix, entry) in set.entries.iter_mut().enumerate() {
            if entry.is_done() {
                continue;
            }
            let Some(servers) = router.vbucket_servers(entry.vbucket()) else {
                entry.set_pending_error(Error::NoMatchingServer(format!(
                    "vbucket {} is not mapped",
                    entry.vbucket()
                )));
                continue;
            };
            let Some(master) = servers.master() else {
                entry.set_pending_error(Error::NoMatchingServer(format!(
                    "vbucket {} has no master",
                    entry.vbucket()
                )));
                continue;
            };

            let mut targets = vec![master];
            if !req.master_only() {
                targets.extend(servers.replicas());
            }
            for server in targets {
                if !entry.server_satisfied(server, &req) {
                    per_server.entry(server).or_default().push(ix);
                }
            }
        }

        for (server, ixs) in per_server {
            let body = encode_request(
                ixs.iter()
                    .map(|&ix| (set.entries[ix].vbucket(), set.entries[ix].key().as_ref())),
            );
            match scheduler.schedule_observe(ObserveRequest {
                set: id,
                server,
                body,
            }) {
                Ok(()) => {
                    set.outstanding.insert(server, ixs);
                }
                Err(err) => {
                    tracing::debug!(set = %id, server, error = %err, "Could not schedule observe");
                    for ix in ixs {
                        set.entries[ix].set_pending_error(err.clone());
                    }
                }
            }
        }

        tracing::trace!(
            set = %id,
            sweep = set.sweep,
            servers = set.outstanding.len(),
            remaining = set.remaining,
            "Observe sweep scheduled"
        );

        if set.outstanding.is_empty() {
            // Nothing reachable this round; try again after the interval.
            Self::arm_next_poll(set, io);
        } else {
            set.state = SetState::WaitTimeout;
            io.arm_at(TimerId::Durability(id), set.deadline);
        }
    }

    fn arm_next_poll(set: &mut DurabilitySet, io: &mut dyn IoCapability) {
        set.state = SetState::ObservePoll;
        let remaining = set.deadline.saturating_duration_since(io.now());
        io.arm(TimerId::Durability(set.id), set.interval.min(remaining));
    }

    /// The set's timer fired.
    pub fn on_timer(
        &mut self,
        id: SetId,
        router: &VBucketRouter,
        io: &mut dyn IoCapability,
        scheduler: &mut dyn PacketScheduler,
    ) {
        let now = io.now();
        let Some(set) = self.sets.get_mut(&id) else {
            return;
        };

        if now >= set.deadline && set.state != SetState::Ignore {
            tracing::warn!(set = %id, remaining = set.remaining, "Durability request timed out");
            set.purge(Error::Timeout, false);
        }

        let (state, deadline) = (set.state, set.deadline);
        match state {
            SetState::ObservePoll => self.sweep(id, router, io, scheduler),
            SetState::WaitTimeout => io.arm_at(TimerId::Durability(id), deadline),
            SetState::Ignore => {}
        }
        self.release(id, io);
    }

    /// One server's observe response body for set `id`.
    ///
    /// May be called more than once per server per sweep; repeats are
    /// ignored per key. Responses for keys the server neither masters nor
    /// replicates are ignored.
    pub fn on_observe_response(
        &mut self,
        id: SetId,
        server: ServerIndex,
        body: &[u8],
        router: &VBucketRouter,
    ) -> Result<()> {
        let results = decode_response(body)?;
        let Some(set) = self.sets.get_mut(&id) else {
            return Ok(());
        };
        let req = set.requirement;
        let sweep = set.sweep;

        for result in results {
            let Some(&ix) = set.index.get(&result.key) else {
                tracing::trace!(set = %id, "Observe response for unknown key");
                continue;
            };
            let vbucket = set.entries[ix].vbucket();
            let Some(servers) = router.vbucket_servers(vbucket) else {
                continue;
            };
            let from_master = servers.master() == Some(server);
            if !from_master && !servers.replicas().any(|r| r == server) {
                tracing::trace!(set = %id, server, vbucket, "Ignoring observe from non-owner");
                continue;
            }
            let applied =
                set.entries[ix].apply(sweep, server, from_master, result.status, result.cas, &req);
            set.note_applied(applied);
        }
        Ok(())
    }

    /// One server finished answering its sweep packet for set `id`.
    ///
    /// `error` is recorded on every key the packet carried. When the last
    /// server of the sweep is done and keys remain, the next sweep is
    /// scheduled after the interval.
    pub fn on_observe_done(&mut self, id: SetId, server: ServerIndex, error: Option<Error>, io: &mut dyn IoCapability) {
        let Some(set) = self.sets.get_mut(&id) else {
            return;
        };
        let Some(ixs) = set.outstanding.remove(&server) else {
            return;
        };
        if let Some(error) = error {
            tracing::debug!(set = %id, server, error = %error, "Observe failed");
            for ix in ixs {
                if !set.entries[ix].is_done() {
                    set.entries[ix].set_pending_error(error.clone());
                }
            }
        }

        if set.outstanding.is_empty() && set.remaining > 0 && set.state == SetState::WaitTimeout {
            Self::arm_next_poll(set, io);
        }
        self.release(id, io);
    }

    /// Fail every pending key of `id` with [`Error::Cancelled`].
    pub fn cancel(&mut self, id: SetId, io: &mut dyn IoCapability) -> bool {
        let Some(set) = self.sets.get_mut(&id) else {
            return false;
        };
        tracing::debug!(set = %id, remaining = set.remaining, "Cancelling durability poll");
        set.cancelled = true;
        set.purge(Error::Cancelled, true);
        self.release(id, io);
        true
    }

    /// Cancel every set, e.g. on shutdown.
    pub fn cancel_all(&mut self, io: &mut dyn IoCapability) {
        let ids: Vec<SetId> = self.sets.keys().copied().collect();
        for id in ids {
            self.cancel(id, io);
        }
    }

    /// `server` went away: every sweep packet it owed is answered with
    /// `error`.
    pub fn on_server_failure(&mut self, server: ServerIndex, error: &Error, io: &mut dyn IoCapability) {
        let ids: Vec<SetId> = self
            .sets
            .iter()
            .filter(|(_, s)| s.outstanding.contains_key(&server))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.on_observe_done(id, server, Some(error.clone()), io);
        }
    }

    /// Drop `id` once nothing references it.
    fn release(&mut self, id: SetId, io: &mut dyn IoCapability) {
        let Some(set) = self.sets.get_mut(&id) else {
            return;
        };
        if set.remaining == 0 && set.state != SetState::Ignore {
            set.state = SetState::Ignore;
        }
        if set.refcount() == 0 {
            tracing::trace!(set = %id, "Releasing durability set");
            io.disarm(TimerId::Durability(id));
            self.sets.remove(&id);
        }
    }
}
