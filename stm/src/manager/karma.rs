// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{priority_of, BaseManager};
use crate::{ContentionManager, ManagerTuning, Policy, Transaction};
use log::debug;
use std::{sync::Arc, time::Duration};

/// Accumulates priority with every successful access and keeps it across aborts. On a conflict
/// it waits one interval per point of priority the other transaction is ahead, then aborts it.
#[derive(Debug)]
pub struct KarmaManager {
    base: BaseManager,
    interval: Duration,
    max_attempts: i64,
}

impl KarmaManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            interval: tuning.karma_interval,
            max_attempts: tuning.karma_max_attempts,
        }
    }
}

impl ContentionManager for KarmaManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        let mut attempts = 0;
        loop {
            if !me.is_active() || !other.is_active() {
                return;
            }

            let gap = priority_of(other) - self.priority();
            if attempts > gap || attempts >= self.max_attempts {
                debug!("karma: {} aborts {} after {} attempts", me, other, attempts);
                other.abort();
                return;
            }

            std::thread::sleep(self.interval);
            attempts += 1;
        }
    }

    fn open_succeeded(&self) {
        self.base.increment();
    }

    fn committed(&self) {
        self.base.reset();
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
        Policy::Karma
    }
}
