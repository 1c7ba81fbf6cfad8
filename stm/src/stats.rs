// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine wide counters
#[derive(Default, Debug)]
pub(crate) struct StmStats {
    pub commits: AtomicU64,
    pub conflicts: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub blocks: AtomicU64,
    pub wakeups_sent: AtomicU64,
    pub wakeups_delivered: AtomicU64,
    pub stale_messages: AtomicU64,
}

impl StmStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            wakeups_sent: self.wakeups_sent.load(Ordering::Relaxed),
            wakeups_delivered: self.wakeups_delivered.load(Ordering::Relaxed),
            stale_messages: self.stale_messages.load(Ordering::Relaxed),
        }
    }
}

/// A point in time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Top-level transactions that published their log
    pub commits: u64,

    /// Restarts after a failed validation, an injected conflict or a violated
    /// invariant
    pub conflicts: u64,

    pub invariant_violations: u64,

    /// Times a thread suspended on a retry
    pub blocks: u64,

    pub wakeups_sent: u64,
    pub wakeups_delivered: u64,

    /// Messages dropped at dequeue time because they had been invalidated
    pub stale_messages: u64,
}
