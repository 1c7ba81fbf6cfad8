// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    capability::Capability,
    config::{LockingMode, StmConfig},
    errors::{CommitError, RuntimeError, StmError, StmResult},
    message::WakeupMessage,
    stack::TRecStack,
    stats::{StatsSnapshot, StmStats},
    sync::{lock, Mutex},
    thread::{StmThread, ThreadHandle, ThreadId, Tso},
    trec::{TRecEntry, TRecHeader},
    tvar::TVar,
};
use log::*;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// The transactional memory engine.
///
/// An engine owns the capabilities delivering wakeups and serializes commits
/// according to its [`LockingMode`]. Handles are cheap to clone and share the same
/// engine. The capability workers shut down once the last handle is dropped.
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmInner>,
}

struct StmInner {
    config: StmConfig,

    /// Serializes commits in [`LockingMode::Coarse`]
    commit_lock: Mutex<()>,

    capabilities: Vec<Capability>,
    next_capability: AtomicUsize,
    next_thread: AtomicU64,
    stats: Arc<StmStats>,
}

impl Stm {
    /// Starts an engine with the default configuration
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(StmConfig::default())
    }

    pub fn with_config(config: StmConfig) -> Result<Self, RuntimeError> {
        let stats = Arc::new(StmStats::default());
        let capabilities = (0..config.capabilities.max(1))
            .map(|no| Capability::spawn(no, stats.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "STM: started with {} capabilities, {:?} locking",
            capabilities.len(),
            config.locking
        );

        Ok(Self {
            inner: Arc::new(StmInner {
                config,
                commit_lock: Mutex::new(()),
                capabilities,
                next_capability: AtomicUsize::new(0),
                next_thread: AtomicU64::new(1),
                stats,
            }),
        })
    }

    pub fn config(&self) -> &StmConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &StmStats {
        &self.inner.stats
    }

    /// Returns the number of capabilities
    pub fn capabilities(&self) -> usize {
        self.inner.capabilities.len()
    }

    pub fn capability(&self, no: usize) -> Option<&Capability> {
        self.inner.capabilities.get(no)
    }

    pub fn new_tvar<V>(&self, initial: V) -> TVar<V>
    where
        V: Clone,
    {
        TVar::new(initial)
    }

    /// Registers a new thread with this engine. Threads are assigned to the
    /// capabilities round robin.
    pub fn thread<V>(&self) -> StmThread<V>
    where
        V: Clone + 'static,
    {
        let id = ThreadId::new(self.inner.next_thread.fetch_add(1, Ordering::Relaxed));
        let capability = self.inner.next_capability.fetch_add(1, Ordering::Relaxed) % self.capabilities();
        trace!("STM: registered TX({}) on CAP({})", id, capability);

        StmThread::new(self.clone(), Arc::new(Tso::new(id, capability)))
    }

    /// Spawns an OS thread running `program` with a fresh [`StmThread`]. Returns a
    /// handle to the new thread along with the join handle of the OS thread.
    pub fn spawn<V, T, F>(&self, program: F) -> Result<(ThreadHandle, JoinHandle<T>), RuntimeError>
    where
        V: Clone + Send + 'static,
        T: Send + 'static,
        F: FnOnce(StmThread<V>) -> T + Send + 'static,
    {
        let stm = self.clone();
        let id = ThreadId::new(self.inner.next_thread.fetch_add(1, Ordering::Relaxed));
        let capability = self.inner.next_capability.fetch_add(1, Ordering::Relaxed) % self.capabilities();
        let tso = Arc::new(Tso::new(id, capability));
        let handle = ThreadHandle { tso: tso.clone() };

        let join = std::thread::Builder::new()
            .name(format!("stm-thread-{}", id))
            .spawn(move || program(StmThread::new(stm, tso)))
            .map_err(RuntimeError::Thread)?;

        Ok((handle, join))
    }

    /// Sends a wakeup to `thread` through its capability. A thread that is not
    /// blocked ignores the wakeup. Returns the posted message, which may be posted
    /// again without resuming the thread a second time.
    pub fn wake(&self, thread: &ThreadHandle) -> Arc<WakeupMessage> {
        self.send_wakeup(&thread.tso)
    }

    fn send_wakeup(&self, tso: &Arc<Tso>) -> Arc<WakeupMessage> {
        let message = Arc::new(WakeupMessage::new(tso, self.inner.stats.clone()));
        tso.track(message.clone());
        StmStats::bump(&self.inner.stats.wakeups_sent);

        let capabilities = &self.inner.capabilities;
        capabilities[tso.capability() % capabilities.len()].post(message.clone());
        message
    }

    /// Validates every record of `stack` against the committed state. In
    /// [`LockingMode::Coarse`] commits publish one variable after the other under the
    /// commit lock, so the lock is held here to never see a partially applied commit.
    pub(crate) fn validate<V>(&self, stack: &TRecStack<V>) -> bool
    where
        V: Clone,
    {
        match self.inner.config.locking {
            LockingMode::Coarse => {
                let _commit = lock(&self.inner.commit_lock);
                stack.is_valid()
            }
            LockingMode::FineGrained => stack.is_valid(),
        }
    }

    /// Validates `header` against the committed state and publishes its writes.
    /// Threads blocked on any written variable are sent one wakeup each.
    pub(crate) fn commit<V>(&self, header: &TRecHeader<V>) -> Result<(), CommitError>
    where
        V: Clone,
    {
        let trec = header.id();
        trace!("TREC({}): committing {} chunks", trec, header.chunks());

        if self.inner.config.conflict_hook.shake() {
            debug!("TREC({}): injected conflict", trec);
            return Err(CommitError::Validation);
        }

        let watchers = match self.inner.config.locking {
            LockingMode::Coarse => {
                let _commit = lock(&self.inner.commit_lock);
                if !header.entries().all(is_current) {
                    return Err(CommitError::Validation);
                }
                publish(header.entries())
            }
            LockingMode::FineGrained => {
                let mut entries: Vec<&TRecEntry<V>> = header.entries().collect();
                entries.sort_by_key(|entry| entry.tvar.id());

                for entry in &entries {
                    entry.tvar.acquire(trec);
                }
                let valid = entries.iter().copied().all(is_current);
                let watchers = if valid {
                    Some(publish(entries.iter().copied()))
                } else {
                    None
                };
                for entry in &entries {
                    entry.tvar.release(trec);
                }

                watchers.ok_or(CommitError::Validation)?
            }
        };

        StmStats::bump(&self.inner.stats.commits);
        for tso in watchers.values() {
            trace!("TREC({}): waking TX({})", trec, tso.id());
            self.send_wakeup(tso);
        }
        Ok(())
    }

    /// Blocks `tso` until a variable of `read_set` no longer has the version it was
    /// read at, or the thread is killed.
    ///
    /// The thread registers in the watch queues before it checks the read set, and
    /// committers publish before they collect watchers, so a commit is either seen by
    /// the check or sends a wakeup. Blocked threads also re-check after the configured
    /// interval.
    pub(crate) fn wait<V>(&self, tso: &Arc<Tso>, read_set: &[(TVar<V>, u64)]) -> StmResult<()>
    where
        V: Clone,
    {
        let interval = self.inner.config.recheck_interval;
        StmStats::bump(&self.inner.stats.blocks);

        tso.reset_notified();
        for (tvar, _) in read_set {
            tvar.add_watcher(tso);
        }
        debug!("TX({}): blocked on {} variables", tso.id(), read_set.len());

        let unchanged = || {
            read_set
                .iter()
                .all(|(tvar, version)| tvar.current_version() == *version)
        };
        while !tso.is_killed() && unchanged() {
            if !tso.park_timeout(interval) {
                trace!("TX({}): re-checking read set", tso.id());
            }
            tso.invalidate_messages();
        }

        for (tvar, _) in read_set {
            tvar.remove_watcher(tso.id());
        }
        tso.invalidate_messages();

        if tso.is_killed() {
            info!("TX({}): killed while blocked", tso.id());
            return Err(StmError::Killed);
        }
        debug!("TX({}): resumed", tso.id());
        Ok(())
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn is_current<V: Clone>(entry: &TRecEntry<V>) -> bool {
    entry.tvar.committed_version() == entry.expected_version
}

/// Publishes the updated entries and collects the threads watching them
fn publish<'a, V, I>(entries: I) -> BTreeMap<ThreadId, Arc<Tso>>
where
    V: Clone + 'a,
    I: Iterator<Item = &'a TRecEntry<V>>,
{
    let mut watchers = BTreeMap::new();
    for entry in entries.filter(|entry| entry.updated) {
        entry.tvar.publish(entry.new_value.clone());
        for tso in entry.tvar.live_watchers() {
            watchers.insert(tso.id(), tso);
        }
    }
    watchers
}
