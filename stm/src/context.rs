// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Context
//!
//! A [`Context`] is owned by one worker. It holds the worker's contention manager and the stack of
//! transactions the worker is currently running, innermost last. Every transactional access
//! takes the context, so the transaction an access belongs to is always explicit.
//!
//! ```
//! use ofree_stm::{Context, ManagerTuning, Policy, TransactionalArray};
//!
//! let mut ctx = Context::new(Policy::Karma.build(&ManagerTuning::default()));
//! let accounts = TransactionalArray::from_values(vec![100u64, 0]);
//!
//! ctx.atomically(|ctx| {
//!     let from = accounts.get(ctx, 0)?.unwrap_or_default();
//!     let to = accounts.get(ctx, 1)?.unwrap_or_default();
//!     accounts.set(ctx, 0, from - 10)?;
//!     accounts.set(ctx, 1, to + 10)
//! })
//! .expect("Failed to transfer");
//!
//! assert_eq!(accounts.peek(1), Ok(Some(10)));
//! ```

use crate::{
    config::DEFAULT_MAX_NESTING_DEPTH, BusyBreaker, ContentionManager, Result, StmConfig, Strategy, Transaction,
    TxError,
};
use log::{debug, trace};
use std::sync::Arc;

/// Counters of decided transactions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub committed: u64,
    pub aborted: u64,
}

pub struct Context {
    manager: Arc<dyn ContentionManager>,
    stack: Vec<Arc<Transaction>>,
    strategy: Strategy,
    max_nesting_depth: usize,

    /// Retries of the innermost running atomic block
    retries: u32,

    stats: Stats,
}

impl Context {
    pub fn new(manager: Arc<dyn ContentionManager>) -> Self {
        Self {
            manager,
            stack: Vec::new(),
            strategy: Strategy::default(),
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            retries: 0,
            stats: Stats::default(),
        }
    }

    /// Creates a context with a fresh manager as configured.
    pub fn from_config(config: &StmConfig) -> Self {
        Self::new(config.build_manager())
            .with_strategy(config.strategy)
            .with_max_nesting_depth(config.max_nesting_depth)
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// The innermost running transaction
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.stack.last()
    }

    pub fn manager(&self) -> &Arc<dyn ContentionManager> {
        &self.manager
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Starts a transaction nested in the current one, or a root transaction, and makes it current.
    pub fn begin(&mut self) -> Result<Arc<Transaction>> {
        self.begin_with_ticket(None)
    }

    fn begin_with_ticket(&mut self, ticket: Option<u64>) -> Result<Arc<Transaction>> {
        if self.stack.len() > self.max_nesting_depth {
            return Err(TxError::NestingTooDeep(self.max_nesting_depth));
        }

        let transaction = Transaction::begin(self.stack.last(), Some(Arc::clone(&self.manager)), ticket);
        trace!("begin {} at depth {}", transaction, transaction.depth());
        self.stack.push(Arc::clone(&transaction));
        Ok(transaction)
    }

    /// Commits the current transaction and makes its parent current again. Fails with
    /// [`TxError::Aborted`], if the transaction has been aborted in the meantime.
    pub fn commit(&mut self) -> Result<()> {
        let transaction = self
            .stack
            .pop()
            .ok_or_else(|| TxError::panic("commit without a running transaction"))?;

        if !transaction.commit() {
            self.stats.aborted += 1;
            return Err(TxError::Aborted);
        }

        self.stats.committed += 1;
        if self.stack.is_empty() {
            self.manager.committed();
        }
        Ok(())
    }

    /// Aborts the current transaction and makes its parent current again. Returns `false`, if
    /// there was nothing to abort.
    pub fn abort(&mut self) -> bool {
        match self.stack.pop() {
            Some(transaction) => {
                transaction.abort();
                self.stats.aborted += 1;
                true
            }
            None => false,
        }
    }

    /// Runs `program` inside a new transaction, nested into the current one if there is any,
    /// and commits it. An aborted attempt is retried as the strategy allows, unless the enclosing
    /// transaction has been aborted as well: then the enclosing atomic block has to retry.
    /// Any other error aborts the transaction and is returned as is.
    pub fn atomically<R, F>(&mut self, mut program: F) -> Result<R>
    where
        F: FnMut(&mut Context) -> Result<R>,
    {
        let breaker = BusyBreaker::default();
        let outer_retries = std::mem::replace(&mut self.retries, 0);
        let mut ticket = None;

        let result = loop {
            let transaction = match self.begin_with_ticket(ticket) {
                Ok(transaction) => transaction,
                Err(e) => break Err(e),
            };
            ticket = Some(transaction.ticket());

            let error = match program(self) {
                Ok(value) => match self.commit() {
                    Ok(()) => break Ok(value),
                    Err(e) => e,
                },
                Err(e) => {
                    self.unwind(&transaction);
                    e
                }
            };

            if !error.is_retryable() {
                break Err(error);
            }
            if let Some(parent) = self.transaction() {
                if !parent.is_active() {
                    break Err(error);
                }
            }

            match self.strategy {
                Strategy::Abort => break Err(error),
                Strategy::Retry => {}
                Strategy::RetryWithBreaker => {
                    if let Err(e) = breaker.spin() {
                        break Err(e);
                    }
                }
            }

            self.manager.aborted();
            self.retries += 1;
            debug!("{} aborted, retry #{}", transaction, self.retries);
        };

        self.retries = outer_retries;
        result
    }

    /// Aborts and drops `transaction` and every transaction still running inside of it.
    fn unwind(&mut self, transaction: &Arc<Transaction>) {
        if !self.stack.iter().any(|t| Arc::ptr_eq(t, transaction)) {
            return;
        }
        while let Some(top) = self.stack.pop() {
            top.abort();
            self.stats.aborted += 1;
            if Arc::ptr_eq(&top, transaction) {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("policy", &self.manager.policy())
            .field("transactions", &self.stack)
            .field("strategy", &self.strategy)
            .field("retries", &self.retries)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManagerTuning, Policy, TransactionalArray};

    fn context() -> Context {
        Context::new(Policy::Karma.build(&ManagerTuning::default()))
    }

    #[test]
    fn test_begin_and_commit_nest() {
        let mut ctx = context();
        let root = ctx.begin().expect("Failed to begin");
        let child = ctx.begin().expect("Failed to begin");
        assert!(root.is_ancestor_of(&child));
        assert!(Arc::ptr_eq(ctx.transaction().expect("No transaction"), &child));

        ctx.commit().expect("Failed to commit");
        assert!(Arc::ptr_eq(ctx.transaction().expect("No transaction"), &root));
        ctx.commit().expect("Failed to commit");
        assert!(ctx.transaction().is_none());
        assert_eq!(ctx.stats().committed, 2);

        assert!(matches!(ctx.commit(), Err(TxError::Panic(_))));
        assert!(!ctx.abort());
    }

    #[test]
    fn test_atomically_commits() {
        let mut ctx = context();
        let array = TransactionalArray::from_values(vec![1]);

        let result = ctx.atomically(|ctx| {
            let value = array.get(ctx, 0)?.unwrap_or_default();
            array.set(ctx, 0, value + 1)?;
            Ok(value)
        });

        assert_eq!(result, Ok(1));
        assert_eq!(array.peek(0), Ok(Some(2)));
        assert!(ctx.transaction().is_none());
        assert_eq!(ctx.stats(), Stats { committed: 1, aborted: 0 });
    }

    #[test]
    fn test_atomically_retries_aborted_attempts() {
        let mut ctx = context();
        let array = TransactionalArray::from_values(vec![0]);
        let mut attempts = 0;

        let result = ctx.atomically(|ctx| {
            attempts += 1;
            array.set(ctx, 0, attempts)?;
            if attempts < 3 {
                // somebody else aborts us
                ctx.transaction().expect("No transaction").abort();
            }
            Ok(ctx.retries())
        });

        assert_eq!(result, Ok(2));
        assert_eq!(array.peek(0), Ok(Some(3)));
        assert_eq!(ctx.retries(), 0);
        assert_eq!(ctx.stats(), Stats { committed: 1, aborted: 2 });
    }

    #[test]
    fn test_retries_keep_the_ticket() {
        let mut ctx = context();
        let mut tickets = Vec::new();

        ctx.atomically(|ctx| {
            let transaction = ctx.transaction().expect("No transaction");
            tickets.push((transaction.id(), transaction.ticket()));
            if tickets.len() < 2 {
                return Err(TxError::Aborted);
            }
            Ok(())
        })
        .expect("Failed to run atomic block");

        assert_ne!(tickets[0].0, tickets[1].0);
        assert_eq!(tickets[0].1, tickets[1].1);
    }

    #[test]
    fn test_errors_abort_and_propagate() {
        let mut ctx = context();
        let array = TransactionalArray::from_values(vec![0]);

        let result: Result<()> = ctx.atomically(|ctx| {
            array.set(ctx, 0, 1)?;
            array.set(ctx, 9, 1)
        });

        assert_eq!(result, Err(TxError::OutOfBounds { index: 9, capacity: 1 }));
        assert_eq!(array.get(&ctx, 0), Ok(Some(0)));
    }

    #[test]
    fn test_abort_strategy_gives_up() {
        let mut ctx = context().with_strategy(Strategy::Abort);
        let mut attempts = 0;
        let result: Result<()> = ctx.atomically(|_| {
            attempts += 1;
            Err(TxError::Aborted)
        });

        assert_eq!(result, Err(TxError::Aborted));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_breaker_strategy_trips() {
        let mut ctx = context().with_strategy(Strategy::RetryWithBreaker);
        let result: Result<()> = ctx.atomically(|_| Err(TxError::Aborted));
        assert!(matches!(result, Err(TxError::Exhausted(_))));
    }

    #[test]
    fn test_nested_block_propagates_when_parent_is_gone() {
        let mut ctx = context();
        let mut outer = 0;
        let mut inner = 0;

        let result = ctx.atomically(|ctx| {
            outer += 1;
            let parent = Arc::clone(ctx.transaction().expect("No transaction"));
            ctx.atomically(|_| {
                inner += 1;
                if outer == 1 {
                    parent.abort();
                    return Err(TxError::Aborted);
                }
                Ok(())
            })
        });

        assert_eq!(result, Ok(()));
        assert_eq!(outer, 2);
        assert_eq!(inner, 2);
    }

    #[test]
    fn test_nested_block_retries_alone() {
        let mut ctx = context();
        let mut inner = 0;

        let result = ctx.atomically(|ctx| {
            ctx.atomically(|ctx| {
                inner += 1;
                if inner < 3 {
                    return Err(TxError::Aborted);
                }
                Ok(ctx.transaction().expect("No transaction").depth())
            })
        });

        assert_eq!(result, Ok(1));
        assert_eq!(inner, 3);
    }

    #[test]
    fn test_failed_nested_blocks_leave_the_parent() {
        let mut ctx = context();
        let array = TransactionalArray::from_values(vec![0]);
        let root = ctx.begin().expect("Failed to begin");

        for _ in 0..1000 {
            let result: Result<()> = ctx.atomically(|ctx| {
                array.get(ctx, 0)?;
                array.get(ctx, 1).map(|_| ())
            });
            assert_eq!(result, Err(TxError::OutOfBounds { index: 1, capacity: 1 }));
        }
        assert!(root.children().is_empty());

        // committed blocks stay until the root decides
        ctx.atomically(|ctx| array.set(ctx, 0, 1)).expect("Failed to write");
        assert_eq!(root.children().len(), 1);
        ctx.commit().expect("Failed to commit");
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_retries_reach_the_manager() {
        let manager = Arc::new(crate::SeniorityManager::new(&ManagerTuning::default()));
        let mut ctx = Context::new(manager.clone());
        let mut seen = Vec::new();

        ctx.atomically(|_| {
            seen.push(manager.retries());
            if seen.len() < 3 {
                return Err(TxError::Aborted);
            }
            Ok(())
        })
        .expect("Failed to run atomic block");

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(manager.retries(), 0);
    }

    #[test]
    fn test_nesting_too_deep() {
        let mut ctx = context().with_max_nesting_depth(2);

        fn nest(ctx: &mut Context, levels: usize) -> Result<usize> {
            if levels == 0 {
                return Ok(ctx.transaction().map(|t| t.depth()).unwrap_or_default());
            }
            ctx.atomically(|ctx| nest(ctx, levels - 1))
        }

        assert_eq!(nest(&mut ctx, 3), Ok(2));
        assert_eq!(nest(&mut ctx, 4), Err(TxError::NestingTooDeep(2)));
        assert!(ctx.transaction().is_none());
    }
}
