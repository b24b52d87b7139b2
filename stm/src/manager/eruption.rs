// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{priority_of, BaseManager};
use crate::{ContentionManager, ManagerTuning, Policy, Transaction};
use log::{debug, trace};
use std::{sync::Arc, time::Duration};

/// Karma with momentum: a blocked transaction lends its priority to the transaction blocking
/// it, so that the blocker finishes sooner. Waits for up to the square of the priority gap.
#[derive(Debug)]
pub struct EruptionManager {
    base: BaseManager,
    interval: Duration,
    max_attempts: i64,
}

impl EruptionManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            interval: tuning.karma_interval,
            max_attempts: tuning.karma_max_attempts,
        }
    }
}

impl ContentionManager for EruptionManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        let mut attempts: i64 = 0;
        let mut transferred = 0;

        loop {
            if !me.is_active() || !other.is_active() {
                return;
            }

            let gap = priority_of(other) - self.priority();
            if gap < 0 || attempts > gap.saturating_mul(gap) || attempts >= self.max_attempts {
                debug!("eruption: {} aborts {} after {} attempts", me, other, attempts);
                other.abort();
                return;
            }

            // push our momentum onto the blocker
            if let Some(manager) = other.manager() {
                let mine = self.priority();
                if manager.id() != self.id() && mine > transferred {
                    trace!("eruption: {} lends {} to {}", me, mine - transferred, other);
                    manager.transfer_priority(mine - transferred);
                    transferred = mine;
                }
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
        Policy::Eruption
    }
}
