// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::{distributions::Bernoulli, prelude::Distribution, Rng};
use runtime_stm::{guard, throw, LockingMode, Stm, StmConfig, StmError, TVar};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use threadpool::ThreadPool;

#[allow(unused_imports)]
use log::*;

fn init_logger() {
    #[cfg(feature = "verbose")]
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

fn engine(locking: LockingMode) -> Stm {
    Stm::with_config(
        StmConfig::default()
            .with_locking(locking)
            .with_recheck_interval(Duration::from_millis(20)),
    )
    .expect("Failed to start engine")
}

#[test]
fn test_stm_threaded_one_tvar() {
    init_logger();

    for locking in [LockingMode::Coarse, LockingMode::FineGrained] {
        let stm = engine(locking);
        let entries: usize = 500;

        // bernoulli distribution over reads vs read/write transactions
        let distribution = Bernoulli::new(0.7).expect("Invalid probability");

        let mut expected: HashSet<String> = (0..entries).map(|e: usize| format!("{:04}", e)).collect();
        let set: TVar<HashSet<String>> = stm.new_tvar(HashSet::new());
        let pool = ThreadPool::new(8);

        let mut removal = HashSet::new();

        for value in expected.iter() {
            let stm = stm.clone();
            let set = set.clone();
            let value = value.clone();

            let read_only = distribution.sample(&mut rand::thread_rng());

            // We store the value that won't be written
            if read_only {
                removal.insert(value.clone());
            }

            pool.execute(move || {
                let thread = stm.thread::<HashSet<String>>();
                let result = thread.atomically(|tx| {
                    let mut inner = tx.read_tvar(&set);
                    if !read_only {
                        inner.insert(value.clone());
                        tx.write_tvar(&set, inner);
                    }
                    Ok(())
                });

                assert!(result.is_ok(), "Failed to run transaction");
            });
        }

        // synchronized all running worker threads
        pool.join();
        assert_eq!(pool.panic_count(), 0);

        for value in removal.iter() {
            expected.remove(value);
        }

        let actual = set.read_uncommitted();
        assert!(
            expected == actual,
            "Actual collection is not equal to expected collection: missing {:?}",
            expected.symmetric_difference(&actual)
        );
    }
}

#[test]
fn test_stm_random_transfers_conserve_total() {
    init_logger();

    const ACCOUNTS: usize = 10;
    const INITIAL: i64 = 100;

    for locking in [LockingMode::Coarse, LockingMode::FineGrained] {
        let stm = engine(locking);
        let accounts: Vec<TVar<i64>> = (0..ACCOUNTS).map(|_| stm.new_tvar(INITIAL)).collect();
        let pool = ThreadPool::new(8);
        let declined = Arc::new(AtomicUsize::new(0));

        for _ in 0..400 {
            let mut rng = rand::thread_rng();
            let from = rng.gen_range(0..ACCOUNTS);
            let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
            let amount: i64 = rng.gen_range(1..=60);

            let (stm, accounts, declined) = (stm.clone(), accounts.clone(), declined.clone());
            pool.execute(move || {
                let thread = stm.thread::<i64>();
                let transferred = thread
                    .atomically(|tx| {
                        tx.catch_retry(
                            |tx| {
                                let balance = tx.read_tvar(&accounts[from]);
                                guard(balance >= amount)?;
                                tx.write_tvar(&accounts[from], balance - amount);

                                let target = tx.read_tvar(&accounts[to]);
                                tx.write_tvar(&accounts[to], target + amount);
                                Ok(true)
                            },
                            |_| Ok(false),
                        )
                    })
                    .expect("Failed to run transaction");

                if !transferred {
                    declined.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        pool.join();
        assert_eq!(pool.panic_count(), 0);

        let balances: Vec<i64> = accounts.iter().map(TVar::read_uncommitted).collect();
        assert!(balances.iter().all(|balance| *balance >= 0), "{:?}", balances);
        assert_eq!(balances.iter().sum::<i64>(), INITIAL * ACCOUNTS as i64);
        debug!("declined {} transfers", declined.load(Ordering::Relaxed));
    }
}

#[test]
fn test_stm_bounded_buffer() {
    init_logger();

    const CAPACITY: usize = 4;
    const ITEMS: usize = 200;
    const WORKERS: usize = 4;

    for locking in [LockingMode::Coarse, LockingMode::FineGrained] {
        let stm = engine(locking);
        let buffer: TVar<Vec<usize>> = stm.new_tvar(Vec::new());
        let consumed = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(WORKERS * 2);

        for worker in 0..WORKERS {
            {
                let (stm, buffer) = (stm.clone(), buffer.clone());
                pool.execute(move || {
                    let thread = stm.thread::<Vec<usize>>();
                    for item in 0..ITEMS {
                        thread
                            .atomically(|tx| {
                                let mut items = tx.read_tvar(&buffer);
                                guard(items.len() < CAPACITY)?;
                                items.push(worker * ITEMS + item);
                                tx.write_tvar(&buffer, items);
                                Ok(())
                            })
                            .expect("Failed to produce");
                    }
                });
            }

            {
                let (stm, buffer, consumed) = (stm.clone(), buffer.clone(), consumed.clone());
                pool.execute(move || {
                    let thread = stm.thread::<Vec<usize>>();
                    for _ in 0..ITEMS {
                        let item = thread
                            .atomically(|tx| {
                                let mut items = tx.read_tvar(&buffer);
                                let item = items.pop().ok_or(StmError::Retry)?;
                                tx.write_tvar(&buffer, items);
                                Ok(item)
                            })
                            .expect("Failed to consume");
                        consumed.fetch_add(item, Ordering::Relaxed);
                    }
                });
            }
        }

        pool.join();
        assert_eq!(pool.panic_count(), 0);

        let total = WORKERS * ITEMS;
        assert_eq!(consumed.load(Ordering::Relaxed), total * (total - 1) / 2);
        assert!(buffer.read_uncommitted().is_empty());
        assert_eq!(stm.stats().commits as usize, total * 2);
    }
}

#[test]
fn test_stm_exceptions_never_see_partial_commits() {
    init_logger();

    const VARS: usize = 32;
    const ROUNDS: usize = 2000;
    const READERS: usize = 3;

    for locking in [LockingMode::Coarse, LockingMode::FineGrained] {
        let stm = engine(locking);
        let vars: Vec<TVar<usize>> = (0..VARS).map(|_| stm.new_tvar(0)).collect();
        let done = Arc::new(AtomicBool::new(false));
        let torn = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(READERS + 1);

        for _ in 0..READERS {
            let (stm, vars, done, torn) = (stm.clone(), vars.clone(), done.clone(), torn.clone());
            pool.execute(move || {
                let thread = stm.thread::<usize>();
                while !done.load(Ordering::Acquire) {
                    let result = thread.atomically(|tx| {
                        let first = tx.read_tvar(&vars[0]);
                        let last = tx.read_tvar(&vars[VARS - 1]);
                        if first != last {
                            return throw(format!("saw {} and {}", first, last));
                        }
                        Ok(())
                    });

                    match result {
                        Ok(()) => {}
                        Err(StmError::Exception(exception)) => {
                            debug!("{:?}: {}", locking, exception);
                            torn.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(other) => panic!("unexpected outcome {:?}", other),
                    }
                }
            });
        }

        let (writer_stm, writer_vars, writer_done) = (stm.clone(), vars.clone(), done.clone());
        pool.execute(move || {
            let thread = writer_stm.thread::<usize>();
            for round in 1..=ROUNDS {
                thread
                    .atomically(|tx| {
                        for var in &writer_vars {
                            tx.write_tvar(var, round);
                        }
                        Ok(())
                    })
                    .expect("Failed to run transaction");
            }
            writer_done.store(true, Ordering::Release);
        });

        pool.join();
        assert_eq!(pool.panic_count(), 0);
        assert_eq!(torn.load(Ordering::Relaxed), 0, "{:?}", locking);
        assert!(vars.iter().all(|var| var.read_uncommitted() == ROUNDS));
    }
}
