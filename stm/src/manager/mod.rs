// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Contention Management
//!
//! A [`ContentionManager`] decides what happens when a transaction runs into a slot held by
//! another active transaction: wait, abort the other transaction, or abort itself. Each worker
//! owns one manager, which travels with every transaction the worker starts, so a policy can
//! inspect and influence the manager on the other side of a conflict.
//!
//! Policies never assume the other transaction keeps its status while they look at it: any
//! transaction may be decided at any moment by its own worker or by a third party.

mod backoff;
mod eruption;
mod greedy;
mod karma;
mod kindergarten;
mod seniority;

pub use backoff::BackoffManager;
pub use eruption::EruptionManager;
pub use greedy::GreedyManager;
pub use karma::KarmaManager;
pub use kindergarten::KindergartenManager;
pub use seniority::SeniorityManager;

use crate::{Policy, ReadSet, Transaction};
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

// generate unique manager ids
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

pub trait ContentionManager: Send + Sync {
    /// Resolves a conflict of `me` with `other`. Returns once `me` may retry its access.
    fn resolve_conflict(&self, me: &Arc<Transaction>, other: &Arc<Transaction>);

    /// Resolves a conflict of `me` with a whole set of transactions, e.g. all active readers of a slot.
    fn resolve_conflicts(&self, me: &Arc<Transaction>, others: &ReadSet) {
        for other in others.iter() {
            if !me.is_active() {
                return;
            }
            if Arc::ptr_eq(&other, me) || !other.is_active() {
                continue;
            }
            self.resolve_conflict(me, &other);
        }
    }

    /// Called after every access that went through without a conflict
    fn open_succeeded(&self) {}

    /// Called after a transaction of this manager has committed
    fn committed(&self) {}

    /// Called before an aborted atomic block of this manager is retried
    fn aborted(&self) {}

    fn priority(&self) -> i64;

    fn set_priority(&self, priority: i64);

    /// Adds `delta` onto the priority in a single atomic step.
    fn transfer_priority(&self, delta: i64) {
        self.set_priority(self.priority() + delta);
    }

    /// Unique id of this manager
    fn id(&self) -> u64;

    fn policy(&self) -> Policy;
}

/// Priority and identity shared by all policies.
#[derive(Debug)]
pub(crate) struct BaseManager {
    id: u64,
    priority: AtomicI64,
}

impl BaseManager {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::SeqCst),
            priority: AtomicI64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn priority(&self) -> i64 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::SeqCst)
    }

    pub(crate) fn increment(&self) {
        self.transfer(1);
    }

    pub(crate) fn transfer(&self, delta: i64) {
        self.priority.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.set_priority(0);
    }
}

/// Priority of the manager behind `transaction`. Unmanaged transactions have none.
pub(crate) fn priority_of(transaction: &Transaction) -> i64 {
    transaction.manager().map(|m| m.priority()).unwrap_or(0)
}

/// Identity of the party behind `transaction`: its manager if any, the transaction itself otherwise.
pub(crate) fn party_of(transaction: &Transaction) -> u64 {
    transaction.manager().map(|m| m.id()).unwrap_or_else(|| transaction.id())
}
