// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{party_of, BaseManager};
use crate::{ContentionManager, ManagerTuning, Policy, Transaction};
use log::debug;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Takes turns: the first time it meets a party it backs off and lets the other side go first,
/// remembering the party. The next conflict with a party that already had its turn aborts it.
/// The memory is wiped on every commit.
#[derive(Debug)]
pub struct KindergartenManager {
    base: BaseManager,
    had_their_turn: Mutex<HashSet<u64>>,
    tries: u32,
    interval: Duration,
}

impl KindergartenManager {
    pub fn new(tuning: &ManagerTuning) -> Self {
        Self {
            base: BaseManager::new(),
            had_their_turn: Mutex::new(HashSet::new()),
            tries: tuning.kindergarten_tries,
            interval: tuning.kindergarten_interval,
        }
    }
}

impl ContentionManager for KindergartenManager {
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>) {
        if !me.is_active() || !other.is_active() {
            return;
        }

        let party = party_of(other);
        if self.had_their_turn.lock().contains(&party) {
            debug!("kindergarten: {} already let {} go, aborting it", me, other);
            other.abort();
            return;
        }

        for _ in 0..self.tries {
            std::thread::sleep(self.interval);
            if !other.is_active() || !me.is_active() {
                return;
            }
        }

        debug!("kindergarten: {} gives way to {}", me, other);
        self.had_their_turn.lock().insert(party);
        me.abort();
    }

    fn committed(&self) {
        self.had_their_turn.lock().clear();
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
        Policy::Kindergarten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_takes_turns() {
        let manager = KindergartenManager::new(&ManagerTuning::default());
        let theirs: Arc<dyn ContentionManager> = Arc::new(KindergartenManager::new(&ManagerTuning::default()));

        // first conflict: wait, then give way
        let me = Transaction::new(None);
        let other = Transaction::new(Some(theirs.clone()));
        manager.resolve_conflict(&me, &other);
        assert!(me.is_aborted());
        assert!(other.is_active());

        // the same party again: it had its turn
        let me = Transaction::new(None);
        let other = Transaction::new(Some(theirs));
        manager.resolve_conflict(&me, &other);
        assert!(me.is_active());
        assert!(other.is_aborted());
    }

    #[test]
    fn test_commit_forgets_turns() {
        let manager = KindergartenManager::new(&ManagerTuning::default());
        let other = Transaction::new(None);

        let me = Transaction::new(None);
        manager.resolve_conflict(&me, &other);
        assert!(me.is_aborted());

        manager.committed();

        let me = Transaction::new(None);
        manager.resolve_conflict(&me, &other);
        assert!(me.is_aborted());
        assert!(other.is_active());
    }
}
