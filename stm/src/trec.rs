// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction records.
//!
//! A [`TRecHeader`] is one attempt at a top-level or nested atomic block. Its log is a
//! stack of fixed size [`TRecChunk`]s holding one [`TRecEntry`] per variable accessed.

use crate::{errors::StmResult, thread::StmThread, tvar::TVar, TVarId};
use log::*;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_TREC_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a transaction record. Marks the owner of a variable during a
/// fine-grained commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TRecId(u64);

impl TRecId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TREC_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TRecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TRecState {
    Active,
    Committed,
    Aborted,
    Retrying,
}

/// An invariant registered through [`StmThread::check`]
pub(crate) type Invariant<V> = Box<dyn Fn(&StmThread<V>) -> StmResult<()>>;

/// One logged access of a variable
pub(crate) struct TRecEntry<V> {
    pub tvar: TVar<V>,

    /// The value seen when the entry was created
    pub expected_value: V,

    /// The version `expected_value` was committed under
    pub expected_version: u64,

    /// The value to publish on commit. Equal to `expected_value` until written.
    pub new_value: V,

    /// Set once the entry has been written
    pub updated: bool,
}

impl<V> TRecEntry<V>
where
    V: Clone,
{
    /// Creates a read-only entry
    pub fn read(tvar: TVar<V>, value: V, version: u64) -> Self {
        Self {
            tvar,
            new_value: value.clone(),
            expected_value: value,
            expected_version: version,
            updated: false,
        }
    }

    /// Creates an entry with a pending write
    pub fn write(tvar: TVar<V>, expected_value: V, expected_version: u64, new_value: V) -> Self {
        Self {
            tvar,
            expected_value,
            expected_version,
            new_value,
            updated: true,
        }
    }
}

/// A fixed size batch of entries
pub(crate) struct TRecChunk<V> {
    entries: Vec<TRecEntry<V>>,
}

impl<V> TRecChunk<V> {
    fn with_capacity(size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(size),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct TRecHeader<V> {
    id: TRecId,

    /// The record this one is nested in, `None` for top-level records
    enclosing: Option<TRecId>,

    chunks: Vec<TRecChunk<V>>,
    chunk_size: usize,
    invariants: Vec<Invariant<V>>,
    state: TRecState,
}

impl<V> TRecHeader<V>
where
    V: Clone,
{
    pub fn new(enclosing: Option<TRecId>, chunk_size: usize) -> Self {
        Self {
            id: TRecId::next(),
            enclosing,
            chunks: vec![TRecChunk::with_capacity(chunk_size)],
            chunk_size,
            invariants: Vec::new(),
            state: TRecState::Active,
        }
    }

    pub fn id(&self) -> TRecId {
        self.id
    }

    pub fn enclosing(&self) -> Option<TRecId> {
        self.enclosing
    }

    pub fn state(&self) -> TRecState {
        self.state
    }

    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Searches the log from the newest entry backwards
    pub fn find(&self, tvar: TVarId) -> Option<&TRecEntry<V>> {
        self.chunks
            .iter()
            .rev()
            .flat_map(|chunk| chunk.entries.iter().rev())
            .find(|entry| entry.tvar.id() == tvar)
    }

    pub fn find_mut(&mut self, tvar: TVarId) -> Option<&mut TRecEntry<V>> {
        self.chunks
            .iter_mut()
            .rev()
            .flat_map(|chunk| chunk.entries.iter_mut().rev())
            .find(|entry| entry.tvar.id() == tvar)
    }

    /// Appends an entry, allocating a new chunk when the current one is full.
    pub fn push(&mut self, entry: TRecEntry<V>) {
        debug_assert!(self.find(entry.tvar.id()).is_none(), "duplicate log entry");

        let size = self.chunk_size;
        if self.chunks.last().map_or(true, |chunk| chunk.len() >= size) {
            self.chunks.push(TRecChunk::with_capacity(self.chunk_size));
        }
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.entries.push(entry);
        }
    }

    /// Iterates all entries in creation order
    pub fn entries(&self) -> impl Iterator<Item = &TRecEntry<V>> {
        self.chunks.iter().flat_map(|chunk| chunk.entries.iter())
    }

    pub fn into_entries(self) -> impl Iterator<Item = TRecEntry<V>> {
        self.chunks.into_iter().flat_map(|chunk| chunk.entries.into_iter())
    }

    #[cfg(test)]
    pub fn has_updates(&self) -> bool {
        self.entries().any(|entry| entry.updated)
    }

    /// Returns every variable in the log with the version it was expected at
    pub fn read_set(&self) -> Vec<(TVar<V>, u64)> {
        self.entries()
            .map(|entry| (entry.tvar.clone(), entry.expected_version))
            .collect()
    }

    /// Returns `true`, if no entry has been invalidated by a commit since it was logged
    pub fn is_valid(&self) -> bool {
        self.entries()
            .all(|entry| entry.tvar.current_version() == entry.expected_version)
    }

    pub fn add_invariant(&mut self, invariant: Invariant<V>) {
        self.invariants.push(invariant);
    }

    pub fn take_invariants(&mut self) -> Vec<Invariant<V>> {
        std::mem::take(&mut self.invariants)
    }

    /// Leaves the [`TRecState::Active`] state. Records are never reused, so finishing a
    /// record twice is a bug in the engine.
    pub fn finish(&mut self, state: TRecState) {
        if self.state != TRecState::Active || state == TRecState::Active {
            error!("TREC({}): invalid transition {:?} -> {:?}", self.id, self.state, state);
            panic!("transaction record {} is not active ({:?})", self.id, self.state);
        }
        trace!("TREC({}): {:?}", self.id, state);
        self.state = state;
    }
}
