//! Retry decision table.

use crate::config::RetryConfig;
use crate::error::{Error, ErrorCategory, TopologyError};
use crate::operation::PendingOperation;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-category retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Never retry.
    None,
    /// Retry only operations that are safe to apply twice.
    AllowIdempotentOnly,
    /// Always retry.
    AllowAll,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-send right away.
    Now,
    /// Re-send after the given delay.
    After(Duration),
    /// Give up and report the error.
    Fail,
}

impl RetryAction {
    /// Whether the operation will be retried.
    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryAction::Fail)
    }
}

/// What a user strategy is told about a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRequest {
    pub is_idempotent: bool,
    pub attempts: u32,
    pub reason: ErrorCategory,
}

/// What a user strategy answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAdvice {
    pub should_retry: bool,
    pub delay: Duration,
}

/// User-supplied retry strategy, replacing the per-category table.
pub trait RetryStrategy: Send + Sync + 'static {
    fn decide(&self, request: &RetryRequest) -> RetryAdvice;
}

impl<F> RetryStrategy for F
where
    F: Fn(&RetryRequest) -> RetryAdvice + Send + Sync + 'static,
{
    fn decide(&self, request: &RetryRequest) -> RetryAdvice {
        self(request)
    }
}

/// Decides whether a failed operation is retried, and when.
///
/// Checks run in this order:
///
/// ```text
///   deadline passed ───────────────────────────────► Fail
///   topology error already retried at this revision ► Fail
///   auth / topology-change notice, first time ─────► After(backoff)
///   user strategy present ─────────────────────────► its answer
///   network / vbucket-map / topology-change ───────► per-category mode
///   anything else ─────────────────────────────────► Fail
/// ```
#[derive(Clone)]
pub struct RetryClassifier {
    config: RetryConfig,
    strategy: Option<Arc<dyn RetryStrategy>>,
}

impl fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryClassifier")
            .field("config", &self.config)
            .field("strategy", &self.strategy.is_some())
            .finish()
    }
}

impl RetryClassifier {
    /// Create a classifier using the built-in table.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            strategy: None,
        }
    }

    /// Replace the per-category table with `strategy`.
    pub fn with_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Retry settings in effect.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff for the next requeue of `op`.
    pub fn backoff(&self, op: &PendingOperation) -> Duration {
        self.config.retry_interval * (op.retries() + 1)
    }

    /// Decide what to do with `op` after it failed with `error`.
    ///
    /// `revision` is the revision of the routing configuration now in use.
    /// Records the forced-once flags on `op` when they are consumed.
    pub fn should_retry(
        &self,
        op: &mut PendingOperation,
        error: &Error,
        now: Instant,
        revision: Option<u64>,
    ) -> RetryAction {
        if op.is_expired(now) {
            return RetryAction::Fail;
        }

        let category = error.category();
        if category == ErrorCategory::TopologyChange {
            if op.topology_revision().is_some() && op.topology_revision() == revision {
                tracing::debug!(op = %op.id(), revision = ?revision, "Topology error already retried at this revision");
                return RetryAction::Fail;
            }
            op.mark_topology_retry(revision);
        }

        match error {
            Error::Auth(_) if !op.auth_retried() => {
                op.mark_auth_retry();
                return RetryAction::After(self.backoff(op));
            }
            Error::Topology(TopologyError::ChangeInProgress) if !op.change_notice_retried() => {
                op.mark_change_notice_retry();
                return RetryAction::After(self.backoff(op));
            }
            _ => {}
        }

        let mode = match category {
            ErrorCategory::Network => self.config.network,
            ErrorCategory::VbucketMap => self.config.vbucket_map,
            ErrorCategory::TopologyChange => self.config.topology_change,
            _ => return RetryAction::Fail,
        };

        if let Some(strategy) = &self.strategy {
            let advice = strategy.decide(&RetryRequest {
                is_idempotent: op.is_idempotent(),
                attempts: op.retries(),
                reason: category,
            });
            return match advice {
                RetryAdvice {
                    should_retry: false,
                    ..
                } => RetryAction::Fail,
                RetryAdvice { delay, .. } if delay.is_zero() => RetryAction::Now,
                RetryAdvice { delay, .. } => RetryAction::After(delay),
            };
        }

        let allowed = match mode {
            RetryMode::None => false,
            RetryMode::AllowIdempotentOnly => op.is_idempotent(),
            RetryMode::AllowAll => true,
        };
        if !allowed {
            return RetryAction::Fail;
        }

        if category == ErrorCategory::VbucketMap {
            if self.config.nmv_retry_immediate {
                RetryAction::Now
            } else {
                RetryAction::After(self.config.nmv_retry_interval)
            }
        } else {
            RetryAction::After(self.backoff(op))
        }
    }
}
