// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Slot Descriptors
//!
//! Every slot of a [`crate::TransactionalArray`] carries a [`Descriptor`] telling who is
//! accessing it: nobody, a chain of readers, or one writer. Descriptors are immutable once
//! installed and get replaced by compare-and-swap. The records inside only change through
//! their own atomics (the in-flight flag of a direct access) or their own lock (the rollback
//! state of a write).

use crate::{transaction::Outcome, Result, Transaction, TxError};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub enum Descriptor<V> {
    Empty,
    ReadChain(Arc<ReadRecord>),
    Write(Arc<WriteRecord<V>>),
}

impl<V> Descriptor<V> {
    /// Returns `true`, if any reader or the writer of this descriptor has not finished yet.
    pub fn is_active(&self) -> bool {
        match self {
            Descriptor::Empty => false,
            Descriptor::ReadChain(head) => head.clean().is_some(),
            Descriptor::Write(record) => record.access().is_active(),
        }
    }
}

impl<V> fmt::Debug for Descriptor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Empty => f.write_str("Empty"),
            Descriptor::ReadChain(head) => f.debug_tuple("ReadChain").field(head).finish(),
            Descriptor::Write(record) => f.debug_tuple("Write").field(record).finish(),
        }
    }
}

/// Who performs an access. Either a transaction, or a direct access from outside of any
/// transaction, which is tracked with an in-flight flag.
pub struct Access {
    owner: Option<Arc<Transaction>>,
    in_flight: AtomicBool,
}

impl Access {
    pub fn new(owner: Option<&Arc<Transaction>>) -> Self {
        Self {
            owner: owner.cloned(),
            in_flight: AtomicBool::new(owner.is_none()),
        }
    }

    pub fn owner(&self) -> Option<&Arc<Transaction>> {
        self.owner.as_ref()
    }

    /// Returns `true`, if the access is by `transaction` itself
    pub fn is_owned_by(&self, transaction: &Arc<Transaction>) -> bool {
        matches!(&self.owner, Some(owner) if Arc::ptr_eq(owner, transaction))
    }

    /// Returns `true`, while the access is in flight, or while the effects of the owning
    /// transaction are pending.
    pub fn is_active(&self) -> bool {
        match self.holder() {
            Holder::Transaction(_) | Holder::Direct => true,
            Holder::Finished(_) => false,
        }
    }

    /// Resolves who currently answers for this access.
    pub fn holder(&self) -> Holder {
        match &self.owner {
            Some(owner) => match owner.outcome() {
                Outcome::Pending(holder) => Holder::Transaction(holder),
                Outcome::Committed => Holder::Finished(true),
                Outcome::Aborted => Holder::Finished(false),
            },
            None if self.in_flight.load(Ordering::SeqCst) => Holder::Direct,
            None => Holder::Finished(true),
        }
    }

    /// Finishes the access. A direct access clears its in-flight flag, a transactional access
    /// fails, if its transaction has meanwhile lost its active status.
    pub fn completed(&self) -> Result<()> {
        match &self.owner {
            Some(owner) if owner.is_active() => Ok(()),
            Some(_) => Err(TxError::Aborted),
            None => {
                self.in_flight.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}", owner),
            None => write!(f, "Direct[in flight: {}]", self.in_flight.load(Ordering::SeqCst)),
        }
    }
}

/// The party an access is attributed to
#[derive(Debug, Clone)]
pub enum Holder {
    /// The innermost active transaction the effects of the access belong to
    Transaction(Arc<Transaction>),

    /// A direct access still in flight
    Direct,

    /// Nobody. `true`, if the effects are permanent, `false`, if they must be rolled back.
    Finished(bool),
}

/// One reader of a slot, linked to the readers that came before it
pub struct ReadRecord {
    access: Access,
    next: Option<Arc<ReadRecord>>,
}

impl ReadRecord {
    pub fn new(owner: Option<&Arc<Transaction>>, next: Option<Arc<ReadRecord>>) -> Arc<Self> {
        Arc::new(Self {
            access: Access::new(owner),
            next,
        })
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn next(&self) -> Option<&Arc<ReadRecord>> {
        self.next.as_ref()
    }

    /// Skips the finished readers at the front of the chain and returns the first active one.
    pub fn clean(self: &Arc<Self>) -> Option<Arc<ReadRecord>> {
        let mut cursor = Some(Arc::clone(self));
        while let Some(record) = cursor {
            if record.access.is_active() {
                return Some(record);
            }
            cursor = record.next.clone();
        }
        None
    }

    /// Iterates over the active readers of the chain.
    pub fn active(self: &Arc<Self>) -> impl Iterator<Item = Arc<ReadRecord>> {
        let mut cursor = self.clean();
        std::iter::from_fn(move || {
            let current = cursor.take()?;
            cursor = current.next.as_ref().and_then(|next| next.clean());
            Some(current)
        })
    }
}

impl Drop for ReadRecord {
    // unlink iteratively, long chains would otherwise overflow the stack
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(record) = next {
            match Arc::try_unwrap(record) {
                Ok(mut record) => next = record.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for ReadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        list.entry(&self.access);
        let mut cursor = self.next.as_ref();
        while let Some(record) = cursor {
            list.entry(&record.access);
            cursor = record.next.as_ref();
        }
        list.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackState {
    /// The writer's effects are undecided
    Pending,

    /// The old value has been written back
    Restored,

    /// The writer's effects are permanent
    Settled,
}

struct Rollback<V> {
    old: Option<Arc<V>>,
    state: RollbackState,
}

impl<V> Rollback<V> {
    fn must_restore(&self) -> bool {
        self.state == RollbackState::Pending
    }

    fn restored(&mut self) {
        self.state = RollbackState::Restored;
    }
}

/// The writer of a slot along with the value the slot had before.
pub struct WriteRecord<V> {
    access: Access,
    rollback: Mutex<Rollback<V>>,

    /// The still pending write of an enclosing transaction this write has been stacked on
    shadowed: Option<Arc<WriteRecord<V>>>,

    /// Readers of the writer's own family this write has displaced. They read the slot again
    /// once the write is rolled back.
    readers: Option<Arc<ReadRecord>>,
}

impl<V> WriteRecord<V> {
    pub fn new(
        owner: Option<&Arc<Transaction>>,
        old: Option<Arc<V>>,
        shadowed: Option<Arc<WriteRecord<V>>>,
        readers: Option<Arc<ReadRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            access: Access::new(owner),
            rollback: Mutex::new(Rollback {
                old,
                state: RollbackState::Pending,
            }),
            shadowed,
            readers,
        })
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn shadowed(&self) -> Option<&Arc<WriteRecord<V>>> {
        self.shadowed.as_ref()
    }

    pub fn readers(&self) -> Option<&Arc<ReadRecord>> {
        self.readers.as_ref()
    }

    pub fn old_value(&self) -> Option<Arc<V>> {
        self.rollback.lock().old.clone()
    }

    pub fn state(&self) -> RollbackState {
        self.rollback.lock().state
    }

    /// Returns `true`, as long as neither a rollback nor a settlement has happened
    pub fn must_restore(&self) -> bool {
        self.rollback.lock().must_restore()
    }

    /// Writes the old value back into `cell`, unless that already happened or the write has
    /// been settled. Returns `true`, if this call restored the value.
    pub fn restore(&self, cell: &ArcSwapOption<V>) -> bool {
        let mut rollback = self.rollback.lock();
        if !rollback.must_restore() {
            return false;
        }
        cell.store(rollback.old.clone());
        rollback.restored();
        true
    }

    /// Makes the write permanent. Has no effect once restored.
    pub fn settle(&self) {
        let mut rollback = self.rollback.lock();
        if rollback.state == RollbackState::Pending {
            rollback.state = RollbackState::Settled;
        }
    }

    /// Stores the writer's value into `cell`, as long as the write is pending.
    pub fn publish(&self, cell: &ArcSwapOption<V>, value: Arc<V>) -> Result<()> {
        let rollback = self.rollback.lock();
        if !rollback.must_restore() {
            return Err(TxError::Aborted);
        }
        cell.store(Some(value));
        Ok(())
    }
}

impl<V> fmt::Debug for WriteRecord<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRecord")
            .field("owner", &self.access)
            .field("state", &self.state())
            .field("shadowed", &self.shadowed)
            .field("readers", &self.readers)
            .finish()
    }
}
