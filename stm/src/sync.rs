// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(feature = "no_deadlocks"))]
pub use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "no_deadlocks")]
pub use no_deadlocks::{Mutex, MutexGuard};

/// Acquires `mutex`. A poisoned lock is recovered, as the engine never leaves
/// shared state half-updated across a panic point.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
