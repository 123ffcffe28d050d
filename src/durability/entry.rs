//! Per-key durability state.

use super::observe::ObserveStatus;
use crate::error::{DurabilityError, Error, Result};
use crate::types::{Cas, ServerIndex, VbucketId};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// What to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub persist_to: u16,
    pub replicate_to: u16,
    /// Wait for the key to disappear instead of to appear.
    pub check_delete: bool,
}

impl Requirement {
    /// Only the master needs to answer.
    pub fn master_only(&self) -> bool {
        self.persist_to == 1 && self.replicate_to == 0
    }
}

/// Progress counters of one key, as delivered with its callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurabilityCounts {
    pub exists_master: bool,
    pub persisted_master: bool,
    pub npersisted: u16,
    pub nreplicated: u16,
    /// CAS reported by the master, zero if none yet.
    pub cas: Cas,
    pub nresponses: u32,
}

/// Final outcome of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilityResult {
    pub key: Bytes,
    pub result: Result<()>,
    pub counts: DurabilityCounts,
}

/// Per-key completion callback.
pub type DurabilityCallback = Box<dyn FnOnce(DurabilityResult) + Send>;

/// One key to wait on.
pub struct DurabilityCommand {
    pub key: Bytes,
    /// CAS the master must still report.
    pub cas: Option<Cas>,
    pub callback: DurabilityCallback,
}

impl DurabilityCommand {
    pub fn new(
        key: impl Into<Bytes>,
        cas: Option<Cas>,
        callback: impl FnOnce(DurabilityResult) + Send + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            cas,
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for DurabilityCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurabilityCommand")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("cas", &self.cas)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct ServerReport {
    status: ObserveStatus,
    from_master: bool,
    sweep: u64,
}

/// How a response affected an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Counted; the entry is still pending.
    Counted,
    /// The entry reached its final outcome.
    Done,
    /// Ignored: the entry is done, or this server already answered in this
    /// sweep.
    Ignored,
}

/// Durability state of one key.
pub struct DurabilityEntry {
    key: Bytes,
    cas: Option<Cas>,
    vbucket: VbucketId,
    reports: HashMap<ServerIndex, ServerReport>,
    counts: DurabilityCounts,
    error: Option<Error>,
    done: bool,
    callback: Option<DurabilityCallback>,
}

impl fmt::Debug for DurabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurabilityEntry")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("vbucket", &self.vbucket)
            .field("counts", &self.counts)
            .field("error", &self.error)
            .field("done", &self.done)
            .finish()
    }
}

impl DurabilityEntry {
    pub fn new(command: DurabilityCommand, vbucket: VbucketId) -> Self {
        Self {
            key: command.key,
            cas: command.cas,
            vbucket,
            reports: HashMap::new(),
            counts: DurabilityCounts::default(),
            error: None,
            done: false,
            callback: Some(command.callback),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn vbucket(&self) -> VbucketId {
        self.vbucket
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn counts(&self) -> DurabilityCounts {
        self.counts
    }

    /// Error to report if the entry is forced to finish.
    pub fn pending_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Remember a transient error; reported only if the deadline expires.
    pub fn set_pending_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    /// Whether `server` has nothing more to tell about this key.
    pub fn server_satisfied(&self, server: ServerIndex, req: &Requirement) -> bool {
        let Some(report) = self.reports.get(&server) else {
            return false;
        };
        match (req.check_delete, report.status) {
            (false, ObserveStatus::Persisted) => true,
            (false, ObserveStatus::Found) => req.persist_to == 0,
            (true, ObserveStatus::NotFound) => true,
            (true, ObserveStatus::LogicallyDeleted) => req.persist_to == 0,
            _ => false,
        }
    }

    /// Apply one server's report from sweep `sweep`.
    pub fn apply(
        &mut self,
        sweep: u64,
        server: ServerIndex,
        from_master: bool,
        status: ObserveStatus,
        cas: Cas,
        req: &Requirement,
    ) -> Applied {
        if self.done {
            return Applied::Ignored;
        }
        if matches!(self.reports.get(&server), Some(r) if r.sweep == sweep) {
            tracing::trace!(key = %String::from_utf8_lossy(&self.key), server, "Duplicate observe response");
            return Applied::Ignored;
        }
        self.reports.insert(
            server,
            ServerReport {
                status,
                from_master,
                sweep,
            },
        );
        self.counts.nresponses += 1;

        if cas != 0 && from_master {
            self.counts.cas = cas;
            if let Some(expected) = self.cas {
                if expected != cas {
                    self.finish(Err(DurabilityError::CasMismatch {
                        expected,
                        actual: cas,
                    }
                    .into()));
                    return Applied::Done;
                }
            }
        }

        if !req.check_delete
            && from_master
            && matches!(status, ObserveStatus::NotFound | ObserveStatus::LogicallyDeleted)
        {
            self.finish(Err(Error::KeyNotFound));
            return Applied::Done;
        }

        self.recount(req);
        if self.is_complete(req) {
            self.error = None;
            self.finish(Ok(()));
            return Applied::Done;
        }
        Applied::Counted
    }

    fn recount(&mut self, req: &Requirement) {
        let cas = self.counts.cas;
        let nresponses = self.counts.nresponses;
        let mut counts = DurabilityCounts {
            cas,
            nresponses,
            ..Default::default()
        };
        for report in self.reports.values() {
            match (req.check_delete, report.status) {
                (false, ObserveStatus::Persisted) | (true, ObserveStatus::NotFound) => {
                    counts.npersisted += 1;
                    if report.from_master {
                        counts.persisted_master = true;
                        counts.exists_master = true;
                    } else {
                        counts.nreplicated += 1;
                    }
                }
                (false, ObserveStatus::Found) | (true, ObserveStatus::LogicallyDeleted) => {
                    if report.from_master {
                        counts.exists_master = true;
                    } else {
                        counts.nreplicated += 1;
                    }
                }
                _ => {}
            }
        }
        self.counts = counts;
    }

    /// The completion predicate.
    pub fn is_complete(&self, req: &Requirement) -> bool {
        let c = &self.counts;
        c.exists_master
            && (req.persist_to == 0 || (c.persisted_master && c.npersisted >= req.persist_to))
            && (req.replicate_to == 0 || c.nreplicated >= req.replicate_to)
    }

    /// Deliver the final outcome. Later calls do nothing.
    pub fn finish(&mut self, result: Result<()>) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(callback) = self.callback.take() {
            callback(DurabilityResult {
                key: self.key.clone(),
                result,
                counts: self.counts,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn entry(cas: Option<Cas>) -> (DurabilityEntry, Arc<Mutex<Vec<DurabilityResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let command = DurabilityCommand::new(&b"doc"[..], cas, move |r| sink.lock().push(r));
        (DurabilityEntry::new(command, 3), seen)
    }

    fn req(persist_to: u16, replicate_to: u16) -> Requirement {
        Requirement {
            persist_to,
            replicate_to,
            check_delete: false,
        }
    }

    #[test]
    fn test_predicate_persist_and_replicate() {
        let (mut e, seen) = entry(None);
        let r = req(2, 1);
        assert_eq!(e.apply(1, 0, true, ObserveStatus::Persisted, 10, &r), Applied::Counted);
        assert!(e.counts().persisted_master);
        assert_eq!(e.apply(1, 1, false, ObserveStatus::Persisted, 10, &r), Applied::Done);

        let results = seen.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, Ok(()));
        assert_eq!(results[0].counts.npersisted, 2);
        assert_eq!(results[0].counts.nreplicated, 1);
    }

    #[test]
    fn test_duplicates_within_sweep_counted_once() {
        let (mut e, seen) = entry(None);
        let r = req(2, 0);
        assert_eq!(e.apply(1, 1, false, ObserveStatus::Persisted, 0, &r), Applied::Counted);
        assert_eq!(e.apply(1, 1, false, ObserveStatus::Persisted, 0, &r), Applied::Ignored);
        assert_eq!(e.apply(1, 1, false, ObserveStatus::Persisted, 0, &r), Applied::Ignored);
        assert_eq!(e.counts().npersisted, 1);
        assert!(!e.is_done());

        assert_eq!(e.apply(1, 0, true, ObserveStatus::Persisted, 5, &r), Applied::Done);
        assert_eq!(e.apply(1, 0, true, ObserveStatus::Persisted, 5, &r), Applied::Ignored);
        assert_eq!(e.apply(2, 2, false, ObserveStatus::Persisted, 5, &r), Applied::Ignored);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_later_sweep_updates_report() {
        let (mut e, _) = entry(None);
        let r = req(0, 1);
        e.apply(1, 0, true, ObserveStatus::Found, 1, &r);
        e.apply(1, 1, false, ObserveStatus::NotFound, 0, &r);
        assert_eq!(e.counts().nreplicated, 0);
        assert!(!e.server_satisfied(1, &r));
        assert_eq!(e.apply(2, 1, false, ObserveStatus::Found, 0, &r), Applied::Done);
        assert!(e.server_satisfied(1, &r));
    }

    #[test]
    fn test_master_not_found_fails_positive() {
        let (mut e, seen) = entry(None);
        let r = req(1, 0);
        assert_eq!(e.apply(1, 0, true, ObserveStatus::NotFound, 0, &r), Applied::Done);
        assert_eq!(seen.lock()[0].result, Err(Error::KeyNotFound));
    }

    #[test]
    fn test_cas_mismatch() {
        let (mut e, seen) = entry(Some(100));
        let r = req(1, 0);
        assert_eq!(e.apply(1, 0, true, ObserveStatus::Found, 101, &r), Applied::Done);
        assert_eq!(
            seen.lock()[0].result,
            Err(DurabilityError::CasMismatch {
                expected: 100,
                actual: 101
            }
            .into())
        );
    }

    #[test]
    fn test_check_delete() {
        let (mut e, seen) = entry(None);
        let r = Requirement {
            persist_to: 1,
            replicate_to: 1,
            check_delete: true,
        };
        assert_eq!(e.apply(1, 0, true, ObserveStatus::Persisted, 9, &r), Applied::Counted);
        assert_eq!(e.apply(2, 0, true, ObserveStatus::NotFound, 0, &r), Applied::Counted);
        assert!(e.counts().persisted_master);
        assert_eq!(e.apply(2, 1, false, ObserveStatus::LogicallyDeleted, 0, &r), Applied::Done);
        assert_eq!(seen.lock()[0].result, Ok(()));
    }

    #[test]
    fn test_finish_once() {
        let (mut e, seen) = entry(None);
        e.finish(Err(Error::Timeout));
        e.finish(Ok(()));
        assert_eq!(seen.lock().len(), 1);
        assert!(e.is_done());
    }
}
