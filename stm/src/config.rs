// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::hook::{ConflictHook, NoShake};
use std::{fmt, sync::Arc, time::Duration};

/// Default number of entries per transaction log chunk
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// Default period after which a blocked thread re-checks its read set on its own
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Selects how commits are serialized against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingMode {
    /// A single engine-wide lock is held while a transaction validates and publishes.
    /// Committed values are read directly.
    #[default]
    Coarse,

    /// Every variable touched by a committing transaction is owned by it while it
    /// validates and publishes. Variables are acquired in [`crate::TVarId`] order, so
    /// commits over disjoint variables proceed in parallel. Readers spin while a
    /// variable is owned.
    FineGrained,
}

/// Defines how a failed validation at commit time is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Restarts the transaction until it commits. This is the default case.
    #[default]
    Retry,

    /// Gives up on the first failed validation and returns [`crate::StmError::Failure`],
    /// so the caller must try at another point in time.
    Abort,
}

/// Configuration of an [`crate::Stm`] engine.
#[derive(Clone)]
pub struct StmConfig {
    pub locking: LockingMode,
    pub strategy: Strategy,

    /// Number of entries a single transaction log chunk holds
    pub chunk_size: usize,

    /// Number of capabilities, each running a worker delivering messages
    pub capabilities: usize,

    /// Blocked threads revalidate their read set after this period, even if no
    /// wakeup arrived
    pub recheck_interval: Duration,

    pub conflict_hook: Arc<dyn ConflictHook>,
}

impl Default for StmConfig {
    fn default() -> Self {
        let capabilities = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        Self {
            locking: LockingMode::default(),
            strategy: Strategy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            capabilities,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            conflict_hook: Arc::new(NoShake),
        }
    }
}

impl StmConfig {
    pub fn with_locking(mut self, locking: LockingMode) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the log chunk size. Values below one are raised to one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sets the number of capabilities. Values below one are raised to one.
    pub fn with_capabilities(mut self, capabilities: usize) -> Self {
        self.capabilities = capabilities.max(1);
        self
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn with_conflict_hook<H>(mut self, hook: H) -> Self
    where
        H: ConflictHook + 'static,
    {
        self.conflict_hook = Arc::new(hook);
        self
    }
}

impl fmt::Debug for StmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StmConfig")
            .field("locking", &self.locking)
            .field("strategy", &self.strategy)
            .field("chunk_size", &self.chunk_size)
            .field("capabilities", &self.capabilities)
            .field("recheck_interval", &self.recheck_interval)
            .finish_non_exhaustive()
    }
}
