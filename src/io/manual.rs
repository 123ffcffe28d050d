//! Deterministic, caller-driven I/O backend.

use super::{IoCapability, TimerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Completion-style backend with a virtual clock.
///
/// Nothing fires on its own: the owner advances the clock with
/// [`ManualIo::pop_expired`] and dispatches each returned timer.
#[derive(Debug)]
pub struct ManualIo {
    now: Instant,
    timers: HashMap<TimerId, Instant>,
}

impl Default for ManualIo {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualIo {
    /// Create a backend whose clock starts at the current instant.
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            timers: HashMap::new(),
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().min().copied()
    }

    /// Pop the earliest timer due at or before `until`, moving the clock to
    /// its deadline. Ties are broken by timer id so runs are reproducible.
    pub fn pop_expired(&mut self, until: Instant) -> Option<TimerId> {
        let (timer, deadline) = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= until)
            .min_by_key(|(timer, deadline)| (**deadline, **timer))
            .map(|(timer, deadline)| (*timer, *deadline))?;

        self.timers.remove(&timer);
        if deadline > self.now {
            self.now = deadline;
        }
        Some(timer)
    }

    /// Move the clock forward without firing anything.
    pub fn set_now(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

impl IoCapability for ManualIo {
    fn now(&self) -> Instant {
        self.now
    }

    fn arm(&mut self, timer: TimerId, after: Duration) {
        self.timers.insert(timer, self.now + after);
    }

    fn disarm(&mut self, timer: TimerId) {
        self.timers.remove(&timer);
    }

    fn is_armed(&self, timer: TimerId) -> bool {
        self.timers.contains_key(&timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_in_deadline_order() {
        let mut io = ManualIo::new();
        let start = io.now();
        io.arm(TimerId::RetryQueue, Duration::from_millis(30));
        io.arm(TimerId::Bootstrap, Duration::from_millis(10));
        io.arm(TimerId::BackgroundPoll, Duration::from_millis(50));

        let until = start + Duration::from_millis(40);
        assert_eq!(io.pop_expired(until), Some(TimerId::Bootstrap));
        assert_eq!(io.now(), start + Duration::from_millis(10));
        assert_eq!(io.pop_expired(until), Some(TimerId::RetryQueue));
        assert_eq!(io.pop_expired(until), None);
        assert!(io.is_armed(TimerId::BackgroundPoll));
    }

    #[test]
    fn test_rearm_replaces() {
        let mut io = ManualIo::new();
        let start = io.now();
        io.arm(TimerId::RetryQueue, Duration::from_millis(5));
        io.arm(TimerId::RetryQueue, Duration::from_millis(50));
        assert_eq!(io.armed_count(), 1);
        assert_eq!(io.pop_expired(start + Duration::from_millis(10)), None);

        io.disarm(TimerId::RetryQueue);
        assert!(!io.is_armed(TimerId::RetryQueue));
        assert_eq!(io.next_deadline(), None);
    }
}
