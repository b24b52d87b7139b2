// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::BaseManager;
use crate::{ContentionManager, ManagerTuning, Policy, Transaction};
use log::debug;
use std::{sync::Arc, time::Duration};

/// Older transactions win. A transaction blocked by an older one waits for it, and while it
/// waits it can be aborted by anyone. Transactions keep their age across retries of the same
/// atomic block, so every transaction eventually becomes the oldest.
#[derive(Debug)]
pub struct GreedyManager {
    base: BaseManager,
    wait_slice: Duration,
}

impl GreedyManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            wait_slice: tuning.greedy_wait_slice,
        }
    }
}

impl ContentionManager for GreedyManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        if !me.is_active() || !other.is_active() {
            return;
        }

        if other.is_waiting() || me.is_older_than(other) {
            debug!("greedy: {} aborts {}", me, other);
            other.abort();
            return;
        }

        me.set_waiting(true);
        while me.is_active() && !other.wait_while_active_not_waiting(self.wait_slice) {}
        me.set_waiting(false);
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
        Policy::Greedy
    }
}
