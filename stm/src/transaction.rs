// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactions
//!
//! A [`Transaction`] keeps its status, its position inside a tree of nested transactions and the
//! contention manager of the worker that started it. Status changes are CAS-guarded: a transaction
//! is decided (committed or aborted) at most once and orphaned at most once. Every other component
//! only ever observes the status, so callers must tolerate it changing right after they looked.

use crate::{ContentionManager, ReadSet, Result, TxError};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::{self, Debug, Display},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

// generate unique ids
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Possible transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Active = 0,
    Aborted = 1,
    Committed = 2,
    Orphaned = 3,
}

impl Status {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Status::Active,
            1 => Status::Aborted,
            2 => Status::Committed,
            3 => Status::Orphaned,
            _ => unreachable!("invalid transaction status {}", raw),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Active => "active",
            Status::Aborted => "aborted",
            Status::Committed => "committed",
            Status::Orphaned => "orphaned",
        };
        f.write_str(name)
    }
}

/// Final word on the effects of a transaction, taking its enclosing transactions into account.
///
/// The effects of a committed nested transaction stay pending until its enclosing transaction
/// decides, so the outcome walks up the parent chain past committed transactions.
#[derive(Clone)]
pub enum Outcome {
    /// Still undecided. Holds the innermost active transaction accountable for the effects.
    Pending(Arc<Transaction>),

    /// The effects are permanent.
    Committed,

    /// The effects must be rolled back.
    Aborted,
}

pub struct Transaction {
    id: u64,

    /// Start order used to arbitrate conflicts. Stays the same across retries of one atomic block
    /// and is shared by nested transactions.
    ticket: u64,

    status: AtomicU8,
    depth: usize,
    parent: Weak<Transaction>,
    children: ReadSet,
    manager: Option<Arc<dyn ContentionManager>>,

    /// Is this transaction waiting for another?
    waiting: AtomicBool,

    monitor: Mutex<()>,
    wakeup: Condvar,
}

impl Transaction {
    /// Creates a new, active root transaction.
    pub fn new(manager: Option<Arc<dyn ContentionManager>>) -> Arc<Self> {
        Self::begin(None, manager, None)
    }

    /// Creates a transaction nested inside `parent`.
    ///
    /// The child is registered with its parent only while the parent is active, otherwise
    /// it is born orphaned.
    pub fn nested(parent: &Arc<Transaction>, manager: Option<Arc<dyn ContentionManager>>) -> Arc<Self> {
        Self::begin(Some(parent), manager, None)
    }

    /// Creates a transaction, optionally nested and optionally reusing the ticket of an earlier attempt.
    /// Nested transactions inherit the ticket of their parent by default.
    pub fn begin(
        parent: Option<&Arc<Transaction>>,
        manager: Option<Arc<dyn ContentionManager>>,
        ticket: Option<u64>,
    ) -> Arc<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);

        let transaction = Arc::new(Self {
            id,
            ticket: ticket.or_else(|| parent.map(|p| p.ticket)).unwrap_or(id),
            status: AtomicU8::new(Status::Active as u8),
            depth: parent.map(|p| p.depth + 1).unwrap_or(0),
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            children: ReadSet::new(),
            manager,
            waiting: AtomicBool::new(false),
            monitor: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        if let Some(parent) = parent {
            // the parent may decide at any point, so check again after registering
            let registered = parent.is_active() && parent.children.add(&transaction);
            if !registered || !parent.is_active() {
                transaction.orphan();
            }
        }

        transaction
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Returns `true`, if `self` started before `other`. Transactions sharing a ticket are
    /// ordered by creation.
    pub fn is_older_than(&self, other: &Transaction) -> bool {
        (self.ticket, self.id) < (other.ticket, other.id)
    }

    /// Number of enclosing transactions
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<Arc<Transaction>> {
        self.parent.upgrade()
    }

    /// Point-in-time snapshot of the registered children
    pub fn children(&self) -> Vec<Arc<Transaction>> {
        self.children.snapshot()
    }

    /// This transaction's contention manager
    pub fn manager(&self) -> Option<&Arc<dyn ContentionManager>> {
        self.manager.as_ref()
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.status() == Status::Active
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == Status::Aborted
    }

    pub fn is_committed(&self) -> bool {
        self.status() == Status::Committed
    }

    pub fn is_orphaned(&self) -> bool {
        self.status() == Status::Orphaned
    }

    /// Returns `Ok(true)` while the transaction is active and `Ok(false)` once it has been
    /// aborted or orphaned. A committed transaction that is still running is a protocol violation.
    pub fn validate(&self) -> Result<bool> {
        match self.status() {
            Status::Active => Ok(true),
            Status::Aborted | Status::Orphaned => Ok(false),
            Status::Committed => Err(TxError::panic(format!("committed transaction {} still running", self.id))),
        }
    }

    /// Tries to commit the transaction. Returns `false`, if the transaction has already been decided.
    ///
    /// Children are not touched. They are handed over to the parent, which decides on their
    /// effects from now on. A root transaction simply forgets them.
    pub fn commit(&self) -> bool {
        let decided = self.decide(Status::Committed);
        if decided {
            let children = self.children.seal();
            self.children.clear();
            if let Some(parent) = self.parent() {
                for child in children {
                    if !parent.children.add(&child) && !parent.is_committed() {
                        child.orphan();
                    }
                }
            }
        }
        self.wake_up();
        decided
    }

    /// Tries to abort the transaction. Returns `false`, if the transaction has already been decided.
    ///
    /// A successful abort orphans every descendant and leaves the parent's children.
    pub fn abort(&self) -> bool {
        let decided = self.decide(Status::Aborted);
        if decided {
            self.orphan_children();
            self.detach();
        }
        self.wake_up();
        decided
    }

    /// Marks the transaction as orphaned, whatever its current status. Returns `false`, if
    /// it had already been orphaned.
    pub fn orphan(&self) -> bool {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if current == Status::Orphaned as u8 {
                return false;
            }
            match self.status.compare_exchange(
                current,
                Status::Orphaned as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.orphan_children();
        self.detach();
        self.wake_up();
        true
    }

    // only committed children have to stay with the parent, their effects still depend on it
    fn detach(&self) {
        if let Some(parent) = self.parent() {
            parent.children.remove(self);
        }
    }

    /// Resolves the fate of this transaction's effects. See [`Outcome`].
    pub fn outcome(self: &Arc<Self>) -> Outcome {
        let mut current = Arc::clone(self);
        loop {
            match current.status() {
                Status::Active => return Outcome::Pending(current),
                Status::Aborted | Status::Orphaned => return Outcome::Aborted,
                Status::Committed => match current.parent() {
                    Some(parent) => current = parent,
                    None => return Outcome::Committed,
                },
            }
        }
    }

    /// Returns `true`, if `self` encloses `other`, directly or transitively.
    pub fn is_ancestor_of(&self, other: &Transaction) -> bool {
        let mut cursor = other.parent();
        while let Some(transaction) = cursor {
            if std::ptr::eq(Arc::as_ptr(&transaction), self) {
                return true;
            }
            cursor = transaction.parent();
        }
        false
    }

    /// Returns `true`, if both transactions are the same, or one encloses the other.
    pub fn same_family(&self, other: &Transaction) -> bool {
        std::ptr::eq(self, other) || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Walks both transactions up to the level right below their lowest common ancestor and
    /// returns the two transactions found there. Unrelated transactions yield their roots.
    pub fn diverging_ancestors(a: &Arc<Transaction>, b: &Arc<Transaction>) -> (Arc<Transaction>, Arc<Transaction>) {
        let mut mine = Arc::clone(a);
        let mut yours = Arc::clone(b);

        while yours.depth < mine.depth {
            match mine.parent() {
                Some(parent) => mine = parent,
                None => break,
            }
        }
        while mine.depth < yours.depth {
            match yours.parent() {
                Some(parent) => yours = parent,
                None => break,
            }
        }

        let mut mine_last = Arc::clone(&mine);
        let mut yours_last = Arc::clone(&yours);

        while !Arc::ptr_eq(&mine, &yours) {
            mine_last = Arc::clone(&mine);
            yours_last = Arc::clone(&yours);
            match (mine.parent(), yours.parent()) {
                (Some(m), Some(y)) => {
                    mine = m;
                    yours = y;
                }
                _ => break,
            }
        }

        (mine_last, yours_last)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
        self.wake_up();
    }

    /// Blocks the caller while the transaction is active, for at most `timeout`.
    /// Returns `true`, if the transaction is no longer active.
    pub fn wait_while_active(&self, timeout: Duration) -> bool {
        self.block_while(timeout, |t| t.is_active())
    }

    /// Blocks the caller while the transaction is active and not waiting itself, for at most `timeout`.
    /// Returns `true`, if the condition has been lifted.
    pub fn wait_while_active_not_waiting(&self, timeout: Duration) -> bool {
        self.block_while(timeout, |t| t.is_active() && !t.is_waiting())
    }

    fn block_while<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = self.monitor.lock();
        while condition(self) {
            if self.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return !condition(self);
            }
        }
        true
    }

    /// Wake up any transactions waiting for this one
    fn wake_up(&self) {
        let _guard = self.monitor.lock();
        self.wakeup.notify_all();
    }

    fn decide(&self, status: Status) -> bool {
        self.status
            .compare_exchange(
                Status::Active as u8,
                status as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn orphan_children(&self) {
        for child in self.children.seal() {
            child.orphan();
        }
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("ticket", &self.ticket)
            .field("status", &self.status())
            .field("depth", &self.depth)
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction{}[{}]", self.id, self.status())
    }
}
