// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Messages posted to capabilities.
//!
//! A message may be invalidated after it has been posted. Capabilities check the
//! validity when they dequeue a message and drop invalidated ones without effect.

use crate::{
    stats::StmStats,
    thread::{ThreadId, Tso},
};
use log::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

pub trait Message: Send + Sync {
    fn is_valid(&self) -> bool;

    fn invalidate(&self);

    /// Runs the message on the capability with number `capability`
    fn execute(&self, capability: usize);
}

/// Asks a thread blocked on a retry to re-check its read set.
///
/// Delivery is one-shot: executing the message invalidates it, so posting the same
/// message twice resumes the thread at most once.
pub struct WakeupMessage {
    target: Weak<Tso>,
    thread: ThreadId,
    valid: AtomicBool,
    stats: Arc<StmStats>,
}

impl WakeupMessage {
    pub(crate) fn new(target: &Arc<Tso>, stats: Arc<StmStats>) -> Self {
        Self {
            target: Arc::downgrade(target),
            thread: target.id(),
            valid: AtomicBool::new(true),
            stats,
        }
    }

    /// The thread this message is addressed to
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl Message for WakeupMessage {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn execute(&self, capability: usize) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            trace!("CAP({}): wakeup for TX({}) already consumed", capability, self.thread);
            return;
        }

        match self.target.upgrade() {
            Some(tso) => {
                trace!("CAP({}): waking TX({})", capability, self.thread);
                StmStats::bump(&self.stats.wakeups_delivered);
                tso.unpark();
            }
            None => trace!("CAP({}): TX({}) no longer exists", capability, self.thread),
        }
    }
}
