//! Scheduled key-value operations.
//!
//! A [`PendingOperation`] is owned by exactly one place at a time: the
//! session's in-flight table, the retry queue, or the pre-bootstrap backlog.
//! It moves between them by value and is consumed by
//! [`PendingOperation::complete`], so its callback cannot fire twice.

use crate::error::{Error, Result};
use crate::transport::KvRequest;
use crate::types::{Cas, Opcode, OperationId, ServerIndex, VbucketId};
use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// Metadata delivered with a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub id: OperationId,
    pub cas: Cas,
    pub vbucket: VbucketId,
    pub server: ServerIndex,
    /// How many times the operation was re-sent.
    pub retries: u32,
}

/// Completion callback of one operation.
pub type OperationCallback = Box<dyn FnOnce(Result<OperationResponse>) + Send>;

/// A key-value operation awaiting its final outcome.
pub struct PendingOperation {
    id: OperationId,
    opcode: Opcode,
    key: Bytes,
    cas: Option<Cas>,
    deadline: Instant,
    retries: u32,
    vbucket: VbucketId,
    server: Option<ServerIndex>,
    original_error: Option<Error>,
    topology_revision: Option<u64>,
    auth_retried: bool,
    change_notice_retried: bool,
    callback: OperationCallback,
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("opcode", &self.opcode)
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("retries", &self.retries)
            .field("vbucket", &self.vbucket)
            .field("server", &self.server)
            .field("original_error", &self.original_error)
            .finish()
    }
}

impl PendingOperation {
    /// Create an operation that must complete by `deadline`.
    pub fn new(
        id: OperationId,
        opcode: Opcode,
        key: Bytes,
        cas: Option<Cas>,
        deadline: Instant,
        callback: OperationCallback,
    ) -> Self {
        Self {
            id,
            opcode,
            key,
            cas,
            deadline,
            retries: 0,
            vbucket: 0,
            server: None,
            original_error: None,
            topology_revision: None,
            auth_retried: false,
            change_notice_retried: false,
            callback,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn cas(&self) -> Option<Cas> {
        self.cas
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Number of times the operation has been requeued.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Last vbucket the operation was routed to.
    pub fn vbucket(&self) -> VbucketId {
        self.vbucket
    }

    /// Last server the operation was sent to.
    pub fn server(&self) -> Option<ServerIndex> {
        self.server
    }

    /// Whether re-sending the operation cannot apply it twice.
    pub fn is_idempotent(&self) -> bool {
        self.opcode.is_idempotent(self.cas.is_some())
    }

    /// The error the operation will report if it gives up now.
    pub fn original_error(&self) -> Option<&Error> {
        self.original_error.as_ref()
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Record where the operation is about to be sent.
    pub fn set_route(&mut self, vbucket: VbucketId, server: Option<ServerIndex>) {
        self.vbucket = vbucket;
        self.server = server;
    }

    /// Count one more requeue.
    pub fn bump_retries(&mut self) {
        self.retries += 1;
    }

    /// Configuration revision at which a topology error was last retried.
    pub fn topology_revision(&self) -> Option<u64> {
        self.topology_revision
    }

    pub(crate) fn mark_topology_retry(&mut self, revision: Option<u64>) {
        self.topology_revision = revision;
    }

    pub(crate) fn auth_retried(&self) -> bool {
        self.auth_retried
    }

    pub(crate) fn mark_auth_retry(&mut self) {
        self.auth_retried = true;
    }

    pub(crate) fn change_notice_retried(&self) -> bool {
        self.change_notice_retried
    }

    pub(crate) fn mark_change_notice_retry(&mut self) {
        self.change_notice_retried = true;
    }

    /// Remember `error` as the reason this operation is being retried.
    ///
    /// NOT_MY_VBUCKET is recorded as a timeout. Timeouts never replace an
    /// earlier error, and a generic network failure never replaces an
    /// earlier network error.
    pub fn record_error(&mut self, error: &Error) {
        let error = if error.is_not_my_vbucket() {
            Error::Timeout
        } else {
            error.clone()
        };
        let Some(current) = &self.original_error else {
            self.original_error = Some(error);
            return;
        };
        if error == Error::Timeout {
            return;
        }
        if matches!(current, Error::Network(_)) && error.is_generic_network() {
            return;
        }
        self.original_error = Some(error);
    }

    /// The error to report when giving up with `requested`.
    pub fn final_error(&self, requested: Error) -> Error {
        match &self.original_error {
            Some(original) if requested == Error::Timeout => original.clone(),
            _ => requested,
        }
    }

    /// Wire request for the current route.
    pub fn to_request(&self, server: ServerIndex) -> KvRequest {
        KvRequest {
            id: self.id,
            opcode: self.opcode,
            key: self.key.clone(),
            cas: self.cas,
            vbucket: self.vbucket,
            server,
            attempt: self.retries,
        }
    }

    /// Deliver the final outcome.
    pub fn complete(self, result: Result<OperationResponse>) {
        (self.callback)(result)
    }

    /// Fail with `requested`, or with the preserved retry error when the
    /// request is a plain timeout. Returns the error delivered.
    pub fn fail(self, requested: Error) -> Error {
        let error = self.final_error(requested);
        self.complete(Err(error.clone()));
        error
    }
}
