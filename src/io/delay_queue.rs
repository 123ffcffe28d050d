//! Tokio-backed I/O backend.

use super::{IoCapability, TimerId};
use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// Readiness-style backend: timers live in a [`DelayQueue`] driven by the
/// tokio time driver.
#[derive(Debug, Default)]
pub struct TokioIo {
    queue: DelayQueue<TimerId>,
    keys: HashMap<TimerId, Key>,
}

impl TokioIo {
    /// Create an empty backend. Must be used inside a tokio runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no timer is armed.
    pub fn is_idle(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer to expire.
    ///
    /// Never resolves while no timer is armed, so it can sit in a
    /// `select!` next to other event sources.
    pub async fn next_expired(&mut self) -> TimerId {
        poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let timer = expired.into_inner();
                self.keys.remove(&timer);
                Poll::Ready(timer)
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }
}

impl IoCapability for TokioIo {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn arm(&mut self, timer: TimerId, after: Duration) {
        match self.keys.get(&timer) {
            Some(key) => self.queue.reset(key, after),
            None => {
                let key = self.queue.insert(timer, after);
                self.keys.insert(timer, key);
            }
        }
    }

    fn disarm(&mut self, timer: TimerId) {
        if let Some(key) = self.keys.remove(&timer) {
            self.queue.remove(&key);
        }
    }

    fn is_armed(&self, timer: TimerId) -> bool {
        self.keys.contains_key(&timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_order() {
        let mut io = TokioIo::new();
        io.arm(TimerId::RetryQueue, Duration::from_millis(20));
        io.arm(TimerId::Bootstrap, Duration::from_millis(10));

        assert_eq!(io.next_expired().await, TimerId::Bootstrap);
        assert_eq!(io.next_expired().await, TimerId::RetryQueue);
        assert!(io.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_and_disarm() {
        let mut io = TokioIo::new();
        io.arm(TimerId::RetryQueue, Duration::from_millis(5));
        io.arm(TimerId::RetryQueue, Duration::from_millis(50));
        io.arm(TimerId::BackgroundPoll, Duration::from_millis(30));
        io.disarm(TimerId::BackgroundPoll);

        let start = tokio::time::Instant::now();
        assert_eq!(io.next_expired().await, TimerId::RetryQueue);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!io.is_armed(TimerId::BackgroundPoll));
    }
}
