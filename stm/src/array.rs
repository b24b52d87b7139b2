// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional Array
//!
//! A fixed number of slots, each holding an optional value and a [`Descriptor`]. Accesses
//! register themselves in the descriptor with a compare-and-swap before touching the value.
//! Whoever finds a descriptor left behind by an aborted writer rolls the slot back before
//! going on, so aborts never have to visit the slots they wrote to.
//!
//! Calls made with a [`Context`] that has no running transaction are direct accesses. They are
//! never aborted: conflicts with live transactions go through the context's contention manager
//! on behalf of a stand-in transaction, which is replaced whenever the manager gives up on it.

use crate::{
    descriptor::{Holder, ReadRecord, WriteRecord},
    BusyBreaker, ContentionManager, Context, Descriptor, ReadSet, Result, Transaction, TxError,
};
use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, trace};
use std::{fmt, sync::Arc};

/// What an access has to respect in a slot, after rolling back aborted writers
enum View<V> {
    /// The active readers, if there are any
    Readers(Option<Arc<ReadRecord>>),

    /// The live write, and the innermost active transaction answering for it
    Held(Arc<Transaction>, Arc<WriteRecord<V>>),

    /// A direct write is still in flight
    Direct,
}

/// The transaction a direct access presents to the contention manager. A direct access cannot
/// be aborted, so a stand-in the manager gave up on is replaced by a fresh one with the same ticket.
struct DirectParty<'a> {
    manager: &'a Arc<dyn ContentionManager>,
    stand_in: Option<Arc<Transaction>>,
}

impl<'a> DirectParty<'a> {
    fn new(manager: &'a Arc<dyn ContentionManager>) -> Self {
        Self { manager, stand_in: None }
    }

    fn stand_in(&mut self) -> Arc<Transaction> {
        let manager = self.manager;
        let stand_in = self
            .stand_in
            .get_or_insert_with(|| Transaction::new(Some(Arc::clone(manager))));
        if !stand_in.is_active() {
            let ticket = stand_in.ticket();
            *stand_in = Transaction::begin(None, Some(Arc::clone(manager)), Some(ticket));
        }
        Arc::clone(stand_in)
    }

    fn resolve_conflict(&mut self, other: &Arc<Transaction>) {
        let me = self.stand_in();
        self.manager.resolve_conflict(&me, other);
    }

    fn resolve_conflicts(&mut self, others: &ReadSet) {
        let me = self.stand_in();
        self.manager.resolve_conflicts(&me, others);
    }
}

pub struct TransactionalArray<V> {
    values: Box<[ArcSwapOption<V>]>,
    descriptors: Box<[ArcSwap<Descriptor<V>>]>,
}

impl<V> TransactionalArray<V> {
    /// Creates an array of `capacity` uninitialized slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            values: (0..capacity).map(|_| ArcSwapOption::empty()).collect(),
            descriptors: (0..capacity).map(|_| ArcSwap::from_pointee(Descriptor::Empty)).collect(),
        }
    }

    /// Creates an array initialized with `values`.
    pub fn from_values(values: Vec<V>) -> Self {
        let capacity = values.len();
        Self {
            values: values
                .into_iter()
                .map(|value| ArcSwapOption::new(Some(Arc::new(value))))
                .collect(),
            descriptors: (0..capacity).map(|_| ArcSwap::from_pointee(Descriptor::Empty)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Overwrites slot `index` and resets its descriptor, ignoring any running transaction.
    /// Meant for filling the array before it is shared. Returns `true`, if the slot was empty.
    pub fn init(&self, index: usize, value: V) -> Result<bool> {
        self.check(index)?;
        let previous = self.values[index].swap(Some(Arc::new(value)));
        self.descriptors[index].store(Arc::new(Descriptor::Empty));
        Ok(previous.is_none())
    }

    /// Returns the current descriptor of slot `index`
    pub fn descriptor(&self, index: usize) -> Result<Arc<Descriptor<V>>> {
        self.check(index)?;
        Ok(self.descriptors[index].load_full())
    }

    /// Reads the value of slot `index` inside the transaction of `ctx`, or directly if there is none.
    pub fn get(&self, ctx: &Context, index: usize) -> Result<Option<V>>
    where
        V: Clone,
    {
        self.check(index)?;
        let value = match ctx.transaction() {
            Some(me) => {
                let value = self.open_read(me, ctx.manager().as_ref(), index)?;
                ctx.manager().open_succeeded();
                value
            }
            None => self.read_direct(ctx.manager(), index)?,
        };
        Ok(value.map(|v| V::clone(&v)))
    }

    /// Writes `value` into slot `index` inside the transaction of `ctx`, or directly if there is none.
    pub fn set(&self, ctx: &Context, index: usize, value: V) -> Result<()> {
        self.check(index)?;
        let value = Arc::new(value);
        match ctx.transaction() {
            Some(me) => {
                self.open_write(me, ctx.manager().as_ref(), index, value)?;
                ctx.manager().open_succeeded();
                Ok(())
            }
            None => self.write_direct(ctx.manager(), index, value),
        }
    }

    /// Returns the raw value of slot `index`, bypassing all descriptors. The value may belong to
    /// a transaction that has not decided yet.
    pub fn peek(&self, index: usize) -> Result<Option<V>>
    where
        V: Clone,
    {
        self.check(index)?;
        Ok(self.values[index].load_full().map(|v| V::clone(&v)))
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.capacity() {
            return Err(TxError::OutOfBounds {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    fn open_read(
        &self,
        me: &Arc<Transaction>,
        manager: &dyn ContentionManager,
        index: usize,
    ) -> Result<Option<Arc<V>>> {
        let breaker = BusyBreaker::default();

        loop {
            if !me.is_active() {
                return Err(TxError::Aborted);
            }

            let current = self.descriptors[index].load_full();
            let record = match self.view(index, &current) {
                View::Readers(Some(first)) if first.access().is_owned_by(me) => {
                    if matches!(&*current, Descriptor::ReadChain(head) if Arc::ptr_eq(head, &first)) {
                        return self.finish_read(index, &first);
                    }
                    first
                }
                View::Readers(chain) => ReadRecord::new(Some(me), chain),
                View::Held(holder, _) if is_family(&holder, me) => {
                    let value = self.values[index].load_full();
                    if !me.is_active() {
                        return Err(TxError::Aborted);
                    }
                    return Ok(value);
                }
                View::Held(holder, _) => {
                    debug!("slot {}: {} reads over a write of {}", index, me, holder);
                    manager.resolve_conflict(me, &holder);
                    if me.is_active() && holder.is_active() {
                        breaker.pause();
                    }
                    continue;
                }
                View::Direct => {
                    breaker.pause();
                    continue;
                }
            };

            if self.install(index, &current, Descriptor::ReadChain(Arc::clone(&record))) {
                return self.finish_read(index, &record);
            }
        }
    }

    fn open_write(
        &self,
        me: &Arc<Transaction>,
        manager: &dyn ContentionManager,
        index: usize,
        value: Arc<V>,
    ) -> Result<()> {
        let breaker = BusyBreaker::default();

        loop {
            if !me.is_active() {
                return Err(TxError::Aborted);
            }

            let current = self.descriptors[index].load_full();
            let (shadowed, displaced) = match self.view(index, &current) {
                View::Readers(chain) => {
                    let readers = ReadSet::new();
                    let mut direct = false;
                    for reader in chain.iter().flat_map(|head| head.active()) {
                        match reader.access().holder() {
                            Holder::Transaction(holder) if !is_family(&holder, me) => {
                                readers.add(&holder);
                            }
                            Holder::Direct => direct = true,
                            _ => {}
                        }
                    }

                    if direct {
                        breaker.pause();
                        continue;
                    }
                    if !readers.is_empty() {
                        debug!("slot {}: {} writes over {} readers", index, me, readers.len());
                        manager.resolve_conflicts(me, &readers);
                        if me.is_active() && readers.cleanup() == 0 {
                            breaker.pause();
                        }
                        continue;
                    }
                    // only the family is left reading
                    (None, chain)
                }
                View::Held(holder, live) if is_family(&holder, me) => {
                    if !live.access().is_owned_by(me) {
                        // stack on top of the pending write of the family
                        (Some(live), None)
                    } else if matches!(&*current, Descriptor::Write(record) if Arc::ptr_eq(record, &live)) {
                        return self.finish_write(index, &live, value);
                    } else if self.install(index, &current, Descriptor::Write(Arc::clone(&live))) {
                        // rolled back writes of aborted children were stacked on our own
                        return self.finish_write(index, &live, value);
                    } else {
                        continue;
                    }
                }
                View::Held(holder, _) => {
                    debug!("slot {}: {} writes over a write of {}", index, me, holder);
                    manager.resolve_conflict(me, &holder);
                    if me.is_active() && holder.is_active() {
                        breaker.pause();
                    }
                    continue;
                }
                View::Direct => {
                    breaker.pause();
                    continue;
                }
            };

            let old = self.values[index].load_full();
            let record = WriteRecord::new(Some(me), old, shadowed, displaced);
            if self.install(index, &current, Descriptor::Write(Arc::clone(&record))) {
                return self.finish_write(index, &record, value);
            }
        }
    }

    fn read_direct(&self, manager: &Arc<dyn ContentionManager>, index: usize) -> Result<Option<Arc<V>>> {
        let before = self.descriptors[index].load_full();
        let value = self.values[index].load_full();
        let after = self.descriptors[index].load_full();
        if Arc::ptr_eq(&before, &after) && !matches!(*before, Descriptor::Write(_)) {
            return Ok(value);
        }

        let breaker = BusyBreaker::default();
        let mut party = DirectParty::new(manager);
        loop {
            let current = self.descriptors[index].load_full();
            let record = match self.view(index, &current) {
                View::Readers(chain) => ReadRecord::new(None, chain),
                View::Held(holder, _) => {
                    debug!("slot {}: direct read over a write of {}", index, holder);
                    party.resolve_conflict(&holder);
                    if holder.is_active() {
                        breaker.pause();
                    }
                    continue;
                }
                View::Direct => {
                    breaker.pause();
                    continue;
                }
            };

            if self.install(index, &current, Descriptor::ReadChain(Arc::clone(&record))) {
                return self.finish_read(index, &record);
            }
        }
    }

    fn write_direct(&self, manager: &Arc<dyn ContentionManager>, index: usize, value: Arc<V>) -> Result<()> {
        let breaker = BusyBreaker::default();
        let mut party = DirectParty::new(manager);
        loop {
            let current = self.descriptors[index].load_full();
            match self.view(index, &current) {
                View::Readers(None) => {}
                View::Readers(Some(head)) => {
                    let readers = ReadSet::new();
                    let mut direct = false;
                    for reader in head.active() {
                        match reader.access().holder() {
                            Holder::Transaction(holder) => {
                                readers.add(&holder);
                            }
                            Holder::Direct => direct = true,
                            Holder::Finished(_) => {}
                        }
                    }

                    if !direct && !readers.is_empty() {
                        debug!("slot {}: direct write over {} readers", index, readers.len());
                        party.resolve_conflicts(&readers);
                        if readers.cleanup() > 0 {
                            continue;
                        }
                    }
                    breaker.pause();
                    continue;
                }
                View::Held(holder, _) => {
                    debug!("slot {}: direct write over a write of {}", index, holder);
                    party.resolve_conflict(&holder);
                    if holder.is_active() {
                        breaker.pause();
                    }
                    continue;
                }
                View::Direct => {
                    breaker.pause();
                    continue;
                }
            }

            let old = self.values[index].load_full();
            let record = WriteRecord::new(None, old, None, None);
            if self.install(index, &current, Descriptor::Write(Arc::clone(&record))) {
                return self.finish_write(index, &record, value);
            }
        }
    }

    fn finish_read(&self, index: usize, record: &ReadRecord) -> Result<Option<Arc<V>>> {
        let value = self.values[index].load_full();
        record.access().completed()?;
        Ok(value)
    }

    fn finish_write(&self, index: usize, record: &WriteRecord<V>, value: Arc<V>) -> Result<()> {
        record.publish(&self.values[index], value)?;
        record.access().completed()
    }

    fn view(&self, index: usize, descriptor: &Descriptor<V>) -> View<V> {
        match descriptor {
            Descriptor::Empty => View::Readers(None),
            Descriptor::ReadChain(head) => View::Readers(head.clean()),
            Descriptor::Write(record) => self.resolve_write(index, record),
        }
    }

    /// Walks down the stack of writes behind `record`, rolling back aborted ones, until it
    /// finds a live write or nothing is left but readers.
    fn resolve_write(&self, index: usize, record: &Arc<WriteRecord<V>>) -> View<V> {
        let mut current = Arc::clone(record);
        loop {
            match current.access().holder() {
                Holder::Transaction(holder) => return View::Held(holder, current),
                Holder::Direct => return View::Direct,
                Holder::Finished(true) => {
                    let readers = current.readers().and_then(|head| head.clean());
                    let mut cursor = Some(current);
                    while let Some(write) = cursor {
                        write.settle();
                        cursor = write.shadowed().cloned();
                    }
                    return View::Readers(readers);
                }
                Holder::Finished(false) => {
                    if current.restore(&self.values[index]) {
                        trace!("slot {}: rolled back write of {:?}", index, current.access());
                    }
                    match current.shadowed() {
                        Some(shadowed) => current = Arc::clone(shadowed),
                        None => return View::Readers(current.readers().and_then(|head| head.clean())),
                    }
                }
            }
        }
    }

    fn install(&self, index: usize, current: &Arc<Descriptor<V>>, next: Descriptor<V>) -> bool {
        let previous = self.descriptors[index].compare_and_swap(current, Arc::new(next));
        let installed = Arc::ptr_eq(&*previous, current);
        if !installed {
            trace!("slot {}: descriptor changed, retrying", index);
        }
        installed
    }
}

/// Returns `true`, if the effects held by `holder` are visible to `me`
fn is_family(holder: &Arc<Transaction>, me: &Arc<Transaction>) -> bool {
    Arc::ptr_eq(holder, me) || holder.is_ancestor_of(me)
}

impl<V> fmt::Debug for TransactionalArray<V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (value, descriptor) in self.values.iter().zip(self.descriptors.iter()) {
            list.entry(&(value.load_full(), descriptor.load_full()));
        }
        list.finish()
    }
}
