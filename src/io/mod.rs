//! Abstract I/O capability used by the core runtime.
//!
//! The routing, retry and durability logic only ever talks to
//! [`IoCapability`]: it reads the clock and arms or disarms named timers.
//! Expired timers are fed back into the session by whoever drives it.
//!
//! # Backends
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │        ManualIo          │      │         TokioIo          │
//! │  virtual clock, caller   │      │  tokio DelayQueue, woken │
//! │  advances time and pulls │      │  by the runtime reactor  │
//! │  expired timers          │      │                          │
//! └────────────┬─────────────┘      └────────────┬─────────────┘
//!              └───────────────┬─────────────────┘
//!                              ▼
//!                 ┌──────────────────────────┐
//!                 │  Session<I: IoCapability>│
//!                 └──────────────────────────┘
//! ```

mod delay_queue;
mod manual;

pub use delay_queue::TokioIo;
pub use manual::ManualIo;

use crate::durability::SetId;
use std::time::{Duration, Instant};

/// Every timer the runtime may arm. At most one instance of each is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Initial bootstrap deadline.
    Bootstrap,
    /// Background configuration polling.
    BackgroundPoll,
    /// Delay before trying the next configuration provider.
    ProviderGrace,
    /// Push-protocol request deadline for the current host.
    ProviderRequest,
    /// Next retry queue flush.
    RetryQueue,
    /// Next in-flight operation deadline.
    OperationTimeouts,
    /// Durability set poll or deadline.
    Durability(SetId),
}

/// Clock and timer capability.
pub trait IoCapability: Send {
    /// Current time.
    fn now(&self) -> Instant;

    /// Arm `timer` to fire after `after`, replacing any earlier arming.
    fn arm(&mut self, timer: TimerId, after: Duration);

    /// Disarm `timer`. Disarming an unarmed timer is a no-op.
    fn disarm(&mut self, timer: TimerId);

    /// Whether `timer` is currently armed.
    fn is_armed(&self, timer: TimerId) -> bool;

    /// Arm `timer` to fire at `deadline`.
    fn arm_at(&mut self, timer: TimerId, deadline: Instant) {
        let after = deadline.saturating_duration_since(self.now());
        self.arm(timer, after);
    }
}
