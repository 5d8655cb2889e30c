//! Heal counters.
//!
//! Lock-free atomics updated by the reconciliation loop and heal tasks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one heal element.
#[derive(Debug, Default)]
pub struct HealStats {
    heals_scheduled: AtomicU64,
    heals_deduplicated: AtomicU64,
    heals_succeeded: AtomicU64,
    heals_failed: AtomicU64,
    heals_aborted: AtomicU64,
    subscriptions: AtomicU64,
    subscriptions_lost: AtomicU64,
}

/// Point-in-time copy of [`HealStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealStatsSnapshot {
    /// Heal tasks spawned.
    pub heals_scheduled: u64,
    /// Triggers dropped because a heal was already in flight.
    pub heals_deduplicated: u64,
    pub heals_succeeded: u64,
    /// Heals abandoned after the retry policy was exhausted.
    pub heals_failed: u64,
    /// Heals stopped because their entry was closed or superseded.
    pub heals_aborted: u64,
    /// Monitoring subscriptions established.
    pub subscriptions: u64,
    /// Subscriptions that ended or could not be established.
    pub subscriptions_lost: u64,
}

impl HealStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn heal_scheduled(&self) {
        self.heals_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heal_deduplicated(&self) {
        self.heals_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heal_succeeded(&self) {
        self.heals_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heal_failed(&self) {
        self.heals_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn heal_aborted(&self) {
        self.heals_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn subscribed(&self) {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn subscription_lost(&self) {
        self.subscriptions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealStatsSnapshot {
        HealStatsSnapshot {
            heals_scheduled: self.heals_scheduled.load(Ordering::Relaxed),
            heals_deduplicated: self.heals_deduplicated.load(Ordering::Relaxed),
            heals_succeeded: self.heals_succeeded.load(Ordering::Relaxed),
            heals_failed: self.heals_failed.load(Ordering::Relaxed),
            heals_aborted: self.heals_aborted.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            subscriptions_lost: self.subscriptions_lost.load(Ordering::Relaxed),
        }
    }
}
