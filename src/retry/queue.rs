//! Time-ordered queue of operations waiting to be re-sent.

use crate::error::{Error, ErrorCategory};
use crate::operation::PendingOperation;
use crate::topology::VBucketRouter;
use crate::types::{ServerIndex, VbucketId};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Entries due within this window of `now` are flushed together.
const FLUSH_FUZZ: Duration = Duration::from_millis(5);

/// An operation parked in the retry queue.
#[derive(Debug)]
pub struct RetryEntry {
    pub op: PendingOperation,
    pub reason: Error,
    pub try_at: Instant,
    seq: u64,
}

impl RetryEntry {
    /// Whether the entry was parked because of a topology change.
    pub fn is_topology(&self) -> bool {
        matches!(
            self.reason.category(),
            ErrorCategory::VbucketMap | ErrorCategory::TopologyChange
        )
    }
}

/// Work produced by one flush of the queue.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    /// Operations to send, with their fresh route.
    pub dispatch: Vec<(PendingOperation, VbucketId, ServerIndex)>,
    /// Operations whose deadline passed, with the error to report.
    pub expired: Vec<(PendingOperation, Error)>,
    /// Entries whose vbucket currently has no owner. The caller decides
    /// whether to keep them ([`RetryQueue::requeue_unroutable`]) or fail them.
    pub unroutable: Vec<RetryEntry>,
}

impl FlushOutcome {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.expired.is_empty() && self.unroutable.is_empty()
    }
}

/// Operations waiting for their next attempt.
///
/// Entries are indexed twice: by next-try time and by deadline, so a
/// flush can fail every expired entry first and then walk the due ones in
/// order. Both indices are keyed by `(instant, seq)`.
#[derive(Debug)]
pub struct RetryQueue {
    entries: HashMap<u64, RetryEntry>,
    by_try: BTreeSet<(Instant, u64)>,
    by_deadline: BTreeSet<(Instant, u64)>,
    next_seq: u64,
    retry_interval: Duration,
}

impl RetryQueue {
    /// Create an empty queue. `retry_interval` paces entries kept after a
    /// missing-owner flush.
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_try: BTreeSet::new(),
            by_deadline: BTreeSet::new(),
            next_seq: 0,
            retry_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park `op` until `now + delay`.
    pub fn enqueue(&mut self, mut op: PendingOperation, reason: Error, now: Instant, delay: Duration) {
        op.bump_retries();
        op.record_error(&reason);
        tracing::debug!(
            op = %op.id(),
            retries = op.retries(),
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "Adding command to retry queue"
        );
        self.insert(RetryEntry {
            op,
            reason,
            try_at: now + delay,
            seq: 0,
        });
    }

    fn insert(&mut self, mut entry: RetryEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        entry.seq = seq;
        self.by_try.insert((entry.try_at, seq));
        self.by_deadline.insert((entry.op.deadline(), seq));
        self.entries.insert(seq, entry);
    }

    fn remove(&mut self, seq: u64) -> Option<RetryEntry> {
        let entry = self.entries.remove(&seq)?;
        self.by_try.remove(&(entry.try_at, seq));
        self.by_deadline.remove(&(entry.op.deadline(), seq));
        Some(entry)
    }

    /// When the queue next needs attention: the earlier of the first
    /// next-try time and the first deadline.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let first_try = self.by_try.first().map(|(t, _)| *t);
        let first_deadline = self.by_deadline.first().map(|(t, _)| *t);
        match (first_try, first_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Flush due entries. With `throttle` off every entry is due.
    pub fn flush(&mut self, now: Instant, throttle: bool, router: &VBucketRouter) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        self.fail_expired(now, &mut outcome);

        let due: Vec<u64> = self
            .by_try
            .iter()
            .take_while(|(try_at, _)| !throttle || *try_at <= now + FLUSH_FUZZ)
            .map(|(_, seq)| *seq)
            .collect();
        for seq in due {
            if let Some(entry) = self.remove(seq) {
                self.route(entry, router, &mut outcome);
            }
        }
        outcome
    }

    /// Re-send every topology-tagged entry at once. Called when a new
    /// configuration has been adopted.
    pub fn flush_topology(&mut self, now: Instant, router: &VBucketRouter) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        self.fail_expired(now, &mut outcome);

        let tagged: Vec<u64> = self
            .by_try
            .iter()
            .map(|(_, seq)| *seq)
            .filter(|seq| self.entries.get(seq).map_or(false, RetryEntry::is_topology))
            .collect();
        for seq in tagged {
            if let Some(entry) = self.remove(seq) {
                self.route(entry, router, &mut outcome);
            }
        }
        outcome
    }

    /// Put back entries from [`FlushOutcome::unroutable`] that should wait
    /// for a configuration naming an owner.
    pub fn requeue_unroutable(&mut self, mut entry: RetryEntry, now: Instant) {
        entry.op.bump_retries();
        entry.try_at = now + self.retry_interval * entry.op.retries();
        self.insert(entry);
    }

    /// Remove everything, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        self.by_try.clear();
        self.by_deadline.clear();
        let mut entries: Vec<RetryEntry> = self.entries.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.op).collect()
    }

    /// Remove one operation by id.
    pub fn take(&mut self, id: crate::types::OperationId) -> Option<PendingOperation> {
        let seq = self
            .entries
            .iter()
            .find(|(_, e)| e.op.id() == id)
            .map(|(seq, _)| *seq)?;
        self.remove(seq).map(|e| e.op)
    }

    fn fail_expired(&mut self, now: Instant, outcome: &mut FlushOutcome) {
        let expired: Vec<u64> = self
            .by_deadline
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, seq)| *seq)
            .collect();
        for seq in expired {
            if let Some(entry) = self.remove(seq) {
                tracing::warn!(
                    op = %entry.op.id(),
                    retries = entry.op.retries(),
                    original = ?entry.op.original_error(),
                    "Failing command from retry queue: timed out"
                );
                outcome.expired.push((entry.op, Error::Timeout));
            }
        }
    }

    fn route(&self, mut entry: RetryEntry, router: &VBucketRouter, outcome: &mut FlushOutcome) {
        let vbucket = match router.route_key(entry.op.key()) {
            Ok(route) => route.vbucket,
            Err(_) => entry.op.vbucket(),
        };
        match router.master(vbucket) {
            Some(server) if server < router.num_servers() => {
                tracing::trace!(
                    op = %entry.op.id(),
                    retries = entry.op.retries(),
                    vbucket,
                    server,
                    "Flushing command to network"
                );
                entry.op.set_route(vbucket, Some(server));
                outcome.dispatch.push((entry.op, vbucket, server));
            }
            _ => {
                entry.op.record_error(&Error::NoMatchingServer(format!(
                    "vbucket {} has no owner",
                    vbucket
                )));
                entry.op.set_route(vbucket, None);
                outcome.unroutable.push(entry);
            }
        }
    }
}
