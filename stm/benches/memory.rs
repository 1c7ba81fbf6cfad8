// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, Criterion};
use runtime_stm::{retry, LockingMode, Stm, StmConfig, TVar};

fn engine(locking: LockingMode) -> Stm {
    Stm::with_config(StmConfig::default().with_locking(locking).with_capabilities(1)).expect("Failed to start engine")
}

/// Primitive benchmark
pub fn bnc_memory_usize(c: &mut Criterion) {
    for (name, locking) in [
        ("bench_memory_coarse", LockingMode::Coarse),
        ("bench_memory_fine_grained", LockingMode::FineGrained),
    ] {
        c.bench_function(name, |b| {
            let stm = engine(locking);
            let thread = stm.thread::<usize>();
            let var = thread.new_tvar(8usize);

            b.iter(|| {
                thread
                    .atomically(|tx| {
                        let value = tx.read_tvar(&var);
                        tx.write_tvar(&var, black_box(value + 1));
                        Ok(())
                    })
                    .expect("Transaction failed")
            })
        });
    }
}

pub fn bnc_large_log(c: &mut Criterion) {
    c.bench_function("bench_large_log", |b| {
        let stm = engine(LockingMode::FineGrained);
        let thread = stm.thread::<usize>();
        let vars: Vec<TVar<usize>> = (0..256).map(|n| thread.new_tvar(n)).collect();

        b.iter(|| {
            thread
                .atomically(|tx| {
                    for var in &vars {
                        let value = tx.read_tvar(var);
                        tx.write_tvar(var, value.wrapping_add(1));
                    }
                    Ok(())
                })
                .expect("Transaction failed")
        })
    });
}

pub fn bnc_catch_retry(c: &mut Criterion) {
    c.bench_function("bench_catch_retry", |b| {
        let stm = engine(LockingMode::Coarse);
        let thread = stm.thread::<usize>();
        let var = thread.new_tvar(0usize);

        b.iter(|| {
            thread
                .atomically(|tx| {
                    tx.catch_retry(
                        |tx| {
                            tx.write_tvar(&var, 1);
                            retry()
                        },
                        |tx| Ok(tx.read_tvar(&var)),
                    )
                })
                .expect("Transaction failed")
        })
    });
}
