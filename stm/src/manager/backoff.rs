// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::BaseManager;
use crate::{ContentionManager, ManagerTuning, Policy, Transaction};
use log::debug;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

/// Sleeps for a random, exponentially growing time on every conflict, and aborts the other
/// transaction once a retry ceiling has been reached. Ignores priorities.
#[derive(Debug)]
pub struct BackoffManager {
    base: BaseManager,
    retries: AtomicU32,
    min_log: u32,
    max_log: u32,
    max_retries: u32,
}

impl BackoffManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            retries: AtomicU32::new(0),
            min_log: tuning.backoff_min_log,
            max_log: tuning.backoff_max_log.max(tuning.backoff_min_log),
            max_retries: tuning.backoff_max_retries,
        }
    }

    /// Number of conflicts since the last reset
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    fn delay(&self, retries: u32) -> Duration {
        let log = self.min_log.saturating_add(retries).min(self.max_log).min(u64::BITS - 1);
        let micros = rand::thread_rng().gen_range(0..(1u64 << log));
        Duration::from_micros(micros)
    }
}

impl ContentionManager for BackoffManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        let retries = self.retries();
        if retries >= self.max_retries {
            debug!("backoff: {} gives up waiting and aborts {}", me, other);
            other.abort();
            self.retries.store(0, Ordering::SeqCst);
            return;
        }

        std::thread::sleep(self.delay(retries));
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    fn open_succeeded(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    fn committed(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    fn priority(&self) -> i64 {
        self.base.priority()
    }

    fn set_priority(&self, priority: i64) {
        self.base.set_priority(priority)
    }

    fn transfer_priority(&self, delta: i64) {
        self.base.transfer(delta)
    }

    fn id(&self) -> u64 {
        self.base.id()
    }

    fn policy(&self) -> Policy {
        Policy::Backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> ManagerTuning {
        ManagerTuning {
            backoff_min_log: 1,
            backoff_max_log: 3,
            backoff_max_retries: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_aborts_other_past_the_ceiling() {
        let manager = BackoffManager::new(&quick());
        let me = Transaction::new(None);
        let other = Transaction::new(None);

        for retries in 0..5 {
            assert_eq!(manager.retries(), retries);
            manager.resolve_conflict(&me, &other);
            assert!(other.is_active());
        }

        manager.resolve_conflict(&me, &other);
        assert!(other.is_aborted());
        assert!(me.is_active());
        assert_eq!(manager.retries(), 0);
    }

    #[test]
    fn test_prior_abort_is_tolerated() {
        let manager = BackoffManager::new(&quick());
        let me = Transaction::new(None);
        let other = Transaction::new(None);
        other.abort();

        for _ in 0..=5 {
            manager.resolve_conflict(&me, &other);
        }
        assert!(other.is_aborted());
        assert!(me.is_active());
    }

    #[test]
    fn test_delay_is_bounded() {
        let manager = BackoffManager::new(&quick());
        for retries in 0..10 {
            assert!(manager.delay(retries) < Duration::from_micros(8));
        }
    }

    #[test]
    fn test_huge_logs_are_clamped() {
        let manager = BackoffManager::new(&ManagerTuning {
            backoff_min_log: 100,
            backoff_max_log: 200,
            ..Default::default()
        });
        assert!(manager.delay(u32::MAX) < Duration::from_micros(1 << 63));
    }
}
