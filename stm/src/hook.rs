// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Conflict injection for tests.
//!
//! A [`ConflictHook`] is consulted once per top-level commit. Returning `true` makes
//! the commit behave as if a concurrent transaction had invalidated its read set,
//! which lets tests drive the restart paths deterministically.

use crate::sync::{lock, Mutex};

pub trait ConflictHook: Send + Sync {
    /// Returns `true` to force the current commit to fail validation.
    fn shake(&self) -> bool;
}

/// Never injects conflicts. This is the default hook.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoShake;

impl ConflictHook for NoShake {
    fn shake(&self) -> bool {
        false
    }
}

/// Injects conflicts with a growing interval: the first commit fails, then one commit
/// passes before the next failure, then two, and so on.
pub struct Shake {
    /// (counter, limit)
    state: Mutex<(usize, usize)>,
}

impl Default for Shake {
    fn default() -> Self {
        Self {
            state: Mutex::new((0, 1)),
        }
    }
}

impl std::fmt::Debug for Shake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (counter, limit) = *lock(&self.state);
        f.debug_struct("Shake")
            .field("counter", &counter)
            .field("limit", &limit)
            .finish()
    }
}

impl ConflictHook for Shake {
    fn shake(&self) -> bool {
        let mut state = lock(&self.state);
        let (counter, limit) = &mut *state;

        let hit = *counter % *limit == 0;
        *counter += 1;
        if hit {
            *counter = 1;
            *limit += 1;
        }
        hit
    }
}
