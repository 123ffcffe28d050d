//! Retry classification and the retry queue.
//!
//! A failed operation goes through the [`RetryClassifier`] first. A
//! [`RetryAction::Fail`] ends it; anything else parks it in the
//! [`RetryQueue`] until its next-try time, or until a new configuration
//! is adopted if it failed for a topology reason.
//!
//! ```text
//!   response / socket error
//!            │
//!            ▼
//!   RetryClassifier::should_retry ──Fail──► callback(Err)
//!            │ Now / After(d)
//!            ▼
//!   RetryQueue (by try time, by deadline)
//!            │ timer / GotNewConfig
//!            ▼
//!   re-route via VBucketRouter ──► PacketScheduler
//! ```

mod classifier;
mod queue;

pub use classifier::{
    RetryAction, RetryAdvice, RetryClassifier, RetryMode, RetryRequest, RetryStrategy,
};
pub use queue::{FlushOutcome, RetryEntry, RetryQueue};
