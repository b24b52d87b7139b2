// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Task Runner
//!
//! A fixed pool of worker threads. Every worker owns one [`Context`], created on first use from
//! the runner's configuration, so each worker has its own contention manager.
//! Tasks get the worker's context handed in and typically run one or more atomic blocks.

use crate::{Context, Result, StmConfig};
use log::{error, info};
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use threadpool::ThreadPool;

// generate unique runner ids
static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // workers of a pool only ever run tasks of their own runner
    static CONTEXT: RefCell<Option<Context>> = RefCell::new(None);
}

/// Counters over all tasks a runner has executed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunnerStats {
    pub completed: u64,
    pub failed: u64,
    pub committed: u64,
    pub aborted: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

pub struct TaskRunner {
    id: u64,
    pool: ThreadPool,
    config: Arc<StmConfig>,
    counters: Arc<Counters>,
}

impl TaskRunner {
    pub fn new(config: StmConfig) -> Self {
        let id = NEXT_RUNNER_ID.fetch_add(1, Ordering::SeqCst);
        let threads = config.threads.max(1);
        info!(
            "task runner {} starts {} workers managed by {}",
            id, threads, config.policy
        );

        Self {
            id,
            pool: ThreadPool::with_name(format!("stm-runner-{}", id), threads),
            config: Arc::new(config),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Queues `task` for execution on one of the workers. A failing task is logged and counted.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        let id = self.id;
        let config = Arc::clone(&self.config);
        let counters = Arc::clone(&self.counters);

        self.pool.execute(move || {
            // take the context out while the task runs, so a task never observes a borrowed cell
            let mut context = CONTEXT
                .with(|cell| cell.borrow_mut().take())
                .unwrap_or_else(|| Context::from_config(&config));

            let before = context.stats();
            match task(&mut context) {
                Ok(()) => counters.completed.fetch_add(1, Ordering::SeqCst),
                Err(e) => {
                    error!("task on runner {} failed: {}", id, e);
                    counters.failed.fetch_add(1, Ordering::SeqCst)
                }
            };
            let after = context.stats();
            counters
                .committed
                .fetch_add(after.committed - before.committed, Ordering::SeqCst);
            counters
                .aborted
                .fetch_add(after.aborted - before.aborted, Ordering::SeqCst);

            CONTEXT.with(|cell| *cell.borrow_mut() = Some(context));
        });
    }

    /// Blocks until all queued tasks have been executed.
    pub fn join(&self) {
        self.pool.join();
        info!("task runner {} is idle: {:?}", self.id, self.stats());
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            aborted: self.counters.aborted.load(Ordering::SeqCst),
        }
    }

    pub fn threads(&self) -> usize {
        self.pool.max_count()
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("id", &self.id)
            .field("threads", &self.threads())
            .field("policy", &self.config.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Policy, TransactionalArray, TxError};
    use std::sync::Mutex;

    #[test]
    fn test_counts_tasks() {
        let runner = TaskRunner::new(StmConfig::default().with_threads(2));
        let array = Arc::new(TransactionalArray::from_values(vec![0u64]));

        for _ in 0..10 {
            let array = array.clone();
            runner.execute(move |ctx| {
                ctx.atomically(|ctx| {
                    let value = array.get(ctx, 0)?.unwrap_or_default();
                    array.set(ctx, 0, value + 1)
                })
            });
        }
        runner.execute(|_| Err(TxError::panic("broken task")));
        runner.join();

        let stats = runner.stats();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.committed, 10);
        assert_eq!(array.peek(0), Ok(Some(10)));
    }

    #[test]
    fn test_workers_own_their_context() {
        let runner = TaskRunner::new(StmConfig::default().with_threads(3).with_policy(Policy::Greedy));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..30 {
            let seen = seen.clone();
            runner.execute(move |ctx| {
                let manager = ctx.manager();
                seen.lock().expect("Failed to lock").push((
                    std::thread::current().id(),
                    manager.id(),
                    manager.policy(),
                ));
                Ok(())
            });
        }
        runner.join();

        let seen = seen.lock().expect("Failed to lock");
        assert_eq!(seen.len(), 30);
        for (worker, manager, policy) in seen.iter() {
            assert_eq!(*policy, Policy::Greedy);
            for (other_worker, other_manager, _) in seen.iter() {
                assert_eq!(worker == other_worker, manager == other_manager);
            }
        }
        assert_eq!(runner.threads(), 3);
        assert_eq!(runner.stats().completed, 30);
    }

    #[test]
    fn test_context_survives_across_tasks() {
        let runner = TaskRunner::new(StmConfig::default().with_threads(1));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let seen = seen.clone();
            runner.execute(move |ctx| {
                ctx.atomically(|_| Ok(()))?;
                seen.lock().expect("Failed to lock").push((ctx.manager().id(), ctx.stats().committed));
                Ok(())
            });
        }
        runner.join();

        let seen = seen.lock().expect("Failed to lock");
        let manager = seen[0].0;
        assert!(seen.iter().all(|(id, _)| *id == manager));
        assert_eq!(seen.iter().map(|(_, committed)| *committed).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
