// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use ofree_stm::{Context, Policy, StmConfig, TaskRunner, TransactionalArray, TxError};
use rand::Rng;
use std::sync::{Arc, Barrier};

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

const ACCOUNTS: usize = 8;
const BALANCE: u64 = 1000;
const TRANSFERS: usize = 200;

/// Reads all balances outside of any transaction, rolling back what is left of aborted transfers
fn total(accounts: &TransactionalArray<u64>) -> u64 {
    let ctx = Context::new(Policy::Backoff.build(&Default::default()));
    (0..accounts.capacity())
        .map(|i| accounts.get(&ctx, i).expect("Failed to read").unwrap_or_default())
        .sum()
}

fn transfer(ctx: &mut Context, accounts: &TransactionalArray<u64>, from: usize, to: usize, amount: u64) -> Result<(), TxError> {
    ctx.atomically(|ctx| {
        let source = accounts.get(ctx, from)?.unwrap_or_default();
        let target = accounts.get(ctx, to)?.unwrap_or_default();
        if source < amount || from == to {
            return Ok(());
        }
        accounts.set(ctx, from, source - amount)?;
        accounts.set(ctx, to, target + amount)
    })
}

#[test]
fn test_transfers_conserve_money_with_every_policy() {
    for policy in Policy::ALL {
        let accounts = Arc::new(TransactionalArray::from_values(vec![BALANCE; ACCOUNTS]));
        let runner = TaskRunner::new(StmConfig::default().with_policy(policy).with_threads(4));

        for _ in 0..TRANSFERS {
            let accounts = accounts.clone();
            let mut rng = rand::thread_rng();
            let (from, to, amount) = (
                rng.gen_range(0..ACCOUNTS),
                rng.gen_range(0..ACCOUNTS),
                rng.gen_range(1..100),
            );
            runner.execute(move |ctx| transfer(ctx, &accounts, from, to, amount));
        }
        runner.join();

        let stats = runner.stats();
        assert_eq!(stats.failed, 0, "{} lost tasks", policy);
        assert_eq!(stats.completed, TRANSFERS as u64, "{} lost tasks", policy);
        assert_eq!(total(&accounts), BALANCE * ACCOUNTS as u64, "{} lost money", policy);
    }
}

#[test]
fn test_nested_transfers_conserve_money() {
    for policy in [Policy::Karma, Policy::Greedy, Policy::Seniority] {
        let accounts = Arc::new(TransactionalArray::from_values(vec![BALANCE; ACCOUNTS]));
        let runner = TaskRunner::new(StmConfig::default().with_policy(policy).with_threads(4));

        for task in 0..TRANSFERS {
            let accounts = accounts.clone();
            runner.execute(move |ctx| {
                // move money around a triangle of accounts, one nested block per leg
                let legs = [task % ACCOUNTS, (task + 3) % ACCOUNTS, (task + 5) % ACCOUNTS];
                ctx.atomically(|ctx| {
                    for (i, from) in legs.iter().enumerate() {
                        transfer(ctx, &accounts, *from, legs[(i + 1) % legs.len()], 7)?;
                    }
                    Ok(())
                })
            });
        }
        runner.join();

        assert_eq!(runner.stats().failed, 0);
        assert_eq!(total(&accounts), BALANCE * ACCOUNTS as u64, "{} lost money", policy);
    }
}

#[test]
fn test_multiple_readers_single_writer() {
    const EXPECTED: u64 = 15;

    let value = Arc::new(TransactionalArray::from_values(vec![6u64]));
    let barrier = Arc::new(Barrier::new(33));
    let mut threads = Vec::new();

    for i in 0..33 {
        let value = value.clone();
        let barrier = barrier.clone();
        threads.push(std::thread::spawn(move || {
            let mut ctx = Context::from_config(&StmConfig::default().with_policy(Policy::Karma));
            barrier.wait();

            if i == 0 {
                return ctx
                    .atomically(|ctx| {
                        let inner = value.get(ctx, 0)?.unwrap_or_default();
                        value.set(ctx, 0, inner + 9)?;
                        Ok(inner)
                    })
                    .expect("Failed to write");
            }

            ctx.atomically(|ctx| Ok(value.get(ctx, 0)?.unwrap_or_default()))
                .expect("Failed to read")
        }));
    }

    for thread in threads {
        let seen = thread.join().expect("Failed to join thread");
        assert!(seen == 6 || seen == EXPECTED, "torn read: {}", seen);
    }

    let ctx = Context::from_config(&StmConfig::default());
    assert_eq!(value.get(&ctx, 0), Ok(Some(EXPECTED)));
}

#[test]
fn test_failed_tasks_leave_no_trace() {
    let accounts = Arc::new(TransactionalArray::from_values(vec![BALANCE; 2]));
    let runner = TaskRunner::new(StmConfig::default().with_threads(2));

    for _ in 0..20 {
        let accounts = accounts.clone();
        runner.execute(move |ctx| {
            ctx.atomically(|ctx| {
                let balance = accounts.get(ctx, 0)?.unwrap_or_default();
                accounts.set(ctx, 0, balance - 1)?;
                // refused after the withdrawal
                accounts.get(ctx, 2).map(|_| ())
            })
        });
    }
    runner.join();

    assert_eq!(runner.stats().failed, 20);
    assert_eq!(total(&accounts), BALANCE * 2);
}
