// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    breaker::BusyBreaker,
    sync::{lock, Mutex},
    thread::{ThreadId, Tso},
    trec::TRecId,
};
use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

static NEXT_TVAR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`TVar`]. Identities are unique for the lifetime of the process and
/// totally ordered, which gives the lock order for fine-grained commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TVarId(u64);

impl fmt::Display for TVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transactional variable.
///
/// Cloning a [`TVar`] clones the handle, not the value: all clones refer to the same
/// variable. The variable lives as long as any handle (or any running transaction
/// that has logged it) exists.
pub struct TVar<V> {
    pub(crate) inner: Arc<TVarInner<V>>,
}

pub(crate) struct TVarInner<V> {
    id: TVarId,
    slot: Mutex<Slot<V>>,

    /// Threads blocked on a retry, that have read this variable
    watch_queue: Mutex<HashMap<ThreadId, Weak<Tso>>>,
}

/// The committed state of a variable
struct Slot<V> {
    value: V,

    /// Incremented with every published value. Together with the identity of the
    /// variable, the version identifies a committed value.
    version: u64,

    /// Set while a fine-grained commit owns the variable
    owner: Option<TRecId>,
}

impl<V> TVar<V>
where
    V: Clone,
{
    /// Creates a new variable holding `initial`. No transaction is required.
    pub fn new(initial: V) -> Self {
        Self {
            inner: Arc::new(TVarInner {
                id: TVarId(NEXT_TVAR_ID.fetch_add(1, Ordering::Relaxed)),
                slot: Mutex::new(Slot {
                    value: initial,
                    version: 0,
                    owner: None,
                }),
                watch_queue: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> TVarId {
        self.inner.id
    }

    /// Reads the committed value outside of any transaction. The value returned has
    /// been written by a committed transaction, or is the initial value.
    pub fn read_uncommitted(&self) -> V {
        self.read_current().0
    }

    /// Returns the number of threads currently blocked on this variable
    pub fn watchers(&self) -> usize {
        lock(&self.inner.watch_queue)
            .values()
            .filter(|tso| tso.strong_count() > 0)
            .count()
    }

    /// Returns the committed value together with its version. While a fine-grained
    /// commit owns the variable this spins until the owner has released it.
    pub(crate) fn read_current(&self) -> (V, u64) {
        let mut breaker = BusyBreaker::default();
        loop {
            {
                let slot = lock(&self.inner.slot);
                if slot.owner.is_none() {
                    return (slot.value.clone(), slot.version);
                }
            }
            breaker.spin();
        }
    }

    /// Like [`TVar::read_current`], without cloning the value
    pub(crate) fn current_version(&self) -> u64 {
        let mut breaker = BusyBreaker::default();
        loop {
            {
                let slot = lock(&self.inner.slot);
                if slot.owner.is_none() {
                    return slot.version;
                }
            }
            breaker.spin();
        }
    }

    /// Returns the version while the caller serializes commits by other means
    /// (engine-wide commit lock, or ownership of this variable).
    pub(crate) fn committed_version(&self) -> u64 {
        lock(&self.inner.slot).version
    }

    /// Takes ownership of this variable for a fine-grained commit, spinning while
    /// another transaction owns it.
    pub(crate) fn acquire(&self, trec: TRecId) {
        let mut breaker = BusyBreaker::default();
        loop {
            {
                let mut slot = lock(&self.inner.slot);
                if slot.owner.is_none() {
                    slot.owner = Some(trec);
                    return;
                }
                debug_assert_ne!(slot.owner, Some(trec), "TVar({}) acquired twice", self.id());
            }
            breaker.spin();
        }
    }

    /// Gives up ownership taken with [`TVar::acquire`]
    pub(crate) fn release(&self, trec: TRecId) {
        let mut slot = lock(&self.inner.slot);
        assert_eq!(
            slot.owner,
            Some(trec),
            "TVar({}) released by a transaction not owning it",
            self.id()
        );
        slot.owner = None;
    }

    /// Writes a committed value and bumps the version
    pub(crate) fn publish(&self, value: V) {
        let mut slot = lock(&self.inner.slot);
        slot.value = value;
        slot.version += 1;
    }

    pub(crate) fn add_watcher(&self, tso: &Arc<Tso>) {
        lock(&self.inner.watch_queue).insert(tso.id(), Arc::downgrade(tso));
    }

    pub(crate) fn remove_watcher(&self, thread: ThreadId) {
        lock(&self.inner.watch_queue).remove(&thread);
    }

    /// Returns all live watchers. Entries of threads that no longer exist are
    /// garbage collected on the way.
    pub(crate) fn live_watchers(&self) -> Vec<Arc<Tso>> {
        let mut queue = lock(&self.inner.watch_queue);
        queue.retain(|_, tso| tso.strong_count() > 0);
        queue.values().filter_map(Weak::upgrade).collect()
    }
}

impl<V> Clone for TVar<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> PartialEq for TVar<V> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<V> Eq for TVar<V> {}

impl<V> Hash for TVar<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<V> fmt::Debug for TVar<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TVar").field(&self.inner.id).finish()
    }
}
