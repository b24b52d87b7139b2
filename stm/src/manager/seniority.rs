// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::BaseManager;
use crate::{ContentionManager, ManagerTuning, Policy, ReadSet, Transaction};
use log::debug;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

/// The transaction that started first wins. Nested transactions are ranked by the ancestors
/// that sit right below the common ancestor of both sides, so siblings compete with each other
/// and unrelated transactions compete through their roots. The loser aborts itself and backs
/// off, longer with every retry its worker went through since the last commit.
#[derive(Debug)]
pub struct SeniorityManager {
    base: BaseManager,
    retries: AtomicU32,
    max_steps: u32,
    unit: Duration,
}

impl SeniorityManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            retries: AtomicU32::new(0),
            max_steps: tuning.seniority_max_steps,
            unit: tuning.seniority_unit,
        }
    }

    /// Number of retries since the last commit
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Returns `true`, if `me` outranks `other`
    pub fn is_senior(me: &Arc<Transaction>, other: &Arc<Transaction>) -> bool {
        let (mine, yours) = Transaction::diverging_ancestors(me, other);
        mine.is_older_than(&yours)
    }

    /// Upper bound of the backoff after `retries` retries
    fn window(&self, retries: u32) -> Duration {
        let steps = retries.min(self.max_steps).min(u32::BITS - 1);
        self.unit.saturating_mul(1 << steps)
    }

    fn give_way(&self, me: &Arc<Transaction>) {
        me.abort();

        let factor: f64 = rand::thread_rng().gen();
        std::thread::sleep(self.window(self.retries()).mul_f64(factor));
    }
}

impl ContentionManager for SeniorityManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        if !me.is_active() || !other.is_active() || me.same_family(other) {
            return;
        }

        if Self::is_senior(me, other) {
            debug!("seniority: {} outranks {}", me, other);
            other.abort();
        } else {
            debug!("seniority: {} gives way to {}", me, other);
            self.give_way(me);
        }
    }

    fn resolve_conflicts(&self, me: &Arc<Transaction>, others: &ReadSet) {
        let rivals: Vec<_> = others
            .iter()
            .filter(|other| other.is_active() && !me.same_family(other))
            .collect();

        if rivals.is_empty() || !me.is_active() {
            return;
        }

        if rivals.iter().all(|other| Self::is_senior(me, other)) {
            debug!("seniority: {} outranks {} readers", me, rivals.len());
            for other in rivals {
                other.abort();
            }
        } else {
            self.give_way(me);
        }
    }

    fn committed(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    fn aborted(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
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
        Policy::Seniority
    }
}
