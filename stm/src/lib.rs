// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Obstruction-Free Software Transactional Memory
//!
//! This crate implements an obstruction-free software transactional memory for arrays of shared
//! slots. Transactions nest, and conflicts between concurrent transactions are arbitrated by
//! a pluggable [`ContentionManager`]. Accesses are optimistic: every slot carries a descriptor
//! that readers and writers replace by compare-and-swap, and the writes of an aborted
//! transaction are rolled back lazily by whoever touches the slot next.
//!
//! A worker runs its transactions through a [`Context`], which owns the worker's contention
//! manager and retries aborted atomic blocks.
//!
//! ```
//! use ofree_stm::{Context, Policy, StmConfig, TaskRunner, TransactionalArray};
//! use std::sync::Arc;
//!
//! let config = StmConfig::default().with_policy(Policy::Greedy).with_threads(4);
//! let counter = Arc::new(TransactionalArray::from_values(vec![0usize]));
//!
//! let runner = TaskRunner::new(config);
//! for _ in 0..16 {
//!     let counter = counter.clone();
//!     runner.execute(move |ctx: &mut Context| {
//!         ctx.atomically(|ctx| {
//!             let value = counter.get(ctx, 0)?.unwrap_or_default();
//!             counter.set(ctx, 0, value + 1)
//!         })
//!     });
//! }
//! runner.join();
//!
//! assert_eq!(counter.peek(0), Ok(Some(16)));
//! ```

pub mod array;
pub mod breaker;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod manager;
pub mod readset;
pub mod runner;
pub mod transaction;

pub use array::TransactionalArray;
pub use breaker::BusyBreaker;
pub use config::{ManagerTuning, Policy, StmConfig, Strategy};
pub use context::{Context, Stats};
pub use descriptor::{Access, Descriptor, Holder, ReadRecord, RollbackState, WriteRecord};
pub use error::{ConfigError, Result, TxError};
pub use manager::{
    BackoffManager, ContentionManager, EruptionManager, GreedyManager, KarmaManager, KindergartenManager,
    SeniorityManager,
};
pub use readset::ReadSet;
pub use runner::{RunnerStats, TaskRunner};
pub use transaction::{Outcome, Status, Transaction};
