//! Monotonic counters for operation and configuration outcomes.

use crate::error::ErrorCategory;
use std::sync::atomic::{AtomicU64, Ordering};

/// A named counter rendered as one Prometheus sample.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// One counter per [`ErrorCategory`], rendered with a `reason` label.
///
/// The category set is closed, so slots are fixed and never allocated.
#[derive(Debug)]
pub struct CategoryCounter {
    name: &'static str,
    help: &'static str,
    slots: [AtomicU64; ErrorCategory::ALL.len()],
}

impl CategoryCounter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self, category: ErrorCategory) {
        self.slots[category.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, category: ErrorCategory) -> u64 {
        self.slots[category.index()].load(Ordering::Relaxed)
    }

    /// Categories seen at least once, in declaration order.
    pub fn nonzero(&self) -> Vec<(ErrorCategory, u64)> {
        ErrorCategory::ALL
            .into_iter()
            .map(|category| (category, self.get(category)))
            .filter(|(_, value)| *value > 0)
            .collect()
    }

    /// Sum over every category.
    pub fn total(&self) -> u64 {
        self.slots.iter().map(|slot| slot.load(Ordering::Relaxed)).sum()
    }
}
