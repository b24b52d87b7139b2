// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A concurrent set of transactions.
//!
//! Membership is a copy-on-write snapshot behind an [`ArcSwap`]: every update builds the next
//! snapshot and installs it with a compare-and-swap loop, so concurrent updates never lose each
//! other's entries and readers iterate over a consistent snapshot without locking.
//! Transactions are compared by identity.

use crate::Transaction;
use arc_swap::ArcSwap;
use std::{fmt, sync::Arc};

#[derive(Clone, Default)]
struct Members {
    sealed: bool,
    entries: Vec<Arc<Transaction>>,
}

impl Members {
    fn contains(&self, transaction: &Arc<Transaction>) -> bool {
        self.entries.iter().any(|t| Arc::ptr_eq(t, transaction))
    }
}

pub struct ReadSet {
    members: ArcSwap<Members>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self {
            members: ArcSwap::from_pointee(Members::default()),
        }
    }

    /// Inserts `transaction`. Returns `false`, if it was already present or the set has been sealed.
    pub fn add(&self, transaction: &Arc<Transaction>) -> bool {
        let mut inserted = false;
        self.members.rcu(|current| {
            inserted = false;
            if current.sealed || current.contains(transaction) {
                return Arc::clone(current);
            }
            let mut next = Members::clone(current);
            next.entries.push(Arc::clone(transaction));
            inserted = true;
            Arc::new(next)
        });
        inserted
    }

    /// Removes `transaction`. Returns `false`, if it was not present.
    pub fn remove(&self, transaction: &Transaction) -> bool {
        let mut removed = false;
        self.members.rcu(|current| {
            removed = false;
            match current
                .entries
                .iter()
                .position(|t| std::ptr::eq(Arc::as_ptr(t), transaction))
            {
                Some(position) => {
                    let mut next = Members::clone(current);
                    next.entries.remove(position);
                    removed = true;
                    Arc::new(next)
                }
                None => Arc::clone(current),
            }
        });
        removed
    }

    /// Drops every transaction that is no longer active and returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let mut dropped = 0;
        self.members.rcu(|current| {
            let mut next = Members::clone(current);
            next.entries.retain(|t| t.is_active());
            dropped = current.entries.len() - next.entries.len();
            next
        });
        dropped
    }

    pub fn contains(&self, transaction: &Arc<Transaction>) -> bool {
        self.members.load().contains(transaction)
    }

    pub fn len(&self) -> usize {
        self.members.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.members.load().sealed
    }

    /// Iterates over a snapshot of the current members.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Transaction>> {
        let snapshot = self.members.load_full();
        (0..snapshot.entries.len()).map(move |i| Arc::clone(&snapshot.entries[i]))
    }

    pub fn snapshot(&self) -> Vec<Arc<Transaction>> {
        self.members.load().entries.clone()
    }

    /// Refuses all further insertions and returns the final membership.
    pub fn seal(&self) -> Vec<Arc<Transaction>> {
        let previous = self.members.rcu(|current| {
            if current.sealed {
                return Arc::clone(current);
            }
            let mut next = Members::clone(current);
            next.sealed = true;
            Arc::new(next)
        });
        previous.entries.clone()
    }

    /// Removes all members. A sealed set stays sealed.
    pub fn clear(&self) {
        self.members.rcu(|current| {
            Arc::new(Members {
                sealed: current.sealed,
                entries: Vec::new(),
            })
        });
    }
}

impl Default for ReadSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Arc<Transaction>> for ReadSet {
    fn from_iter<I: IntoIterator<Item = Arc<Transaction>>>(iter: I) -> Self {
        let set = ReadSet::new();
        for transaction in iter {
            set.add(&transaction);
        }
        set
    }
}

impl fmt::Debug for ReadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members.load();
        f.debug_struct("ReadSet")
            .field("sealed", &members.sealed)
            .field("members", &members.entries.iter().map(|t| t.id()).collect::<Vec<_>>())
            .finish()
    }
}
