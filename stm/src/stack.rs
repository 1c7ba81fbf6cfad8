// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread stack of active transaction records.
//!
//! The innermost record is the last one. A record's enclosing record is the one right
//! below it, so the stack itself is the chain of `enclosing` links.

use crate::{
    trec::{Invariant, TRecEntry, TRecHeader, TRecId, TRecState},
    tvar::{TVar, TVarId},
};
use log::*;

pub(crate) struct TRecStack<V> {
    headers: Vec<TRecHeader<V>>,
}

impl<V> Default for TRecStack<V> {
    fn default() -> Self {
        Self { headers: Vec::new() }
    }
}

impl<V> TRecStack<V> {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.headers.len()
    }

    /// Discards whatever is left on the stack after a body unwound
    pub fn clear(&mut self) {
        if !self.headers.is_empty() {
            warn!("discarding {} transaction records", self.headers.len());
        }
        self.headers.clear();
    }
}

impl<V> TRecStack<V>
where
    V: Clone,
{
    /// Pushes a new record nested in the current innermost one, or a top-level record
    /// if the stack is empty. Returns the id of the new record.
    pub fn start(&mut self, chunk_size: usize) -> TRecId {
        let enclosing = self.headers.last().map(TRecHeader::id);
        let header = TRecHeader::new(enclosing, chunk_size);
        let id = header.id();
        self.headers.push(header);
        id
    }

    fn innermost_mut(&mut self) -> &mut TRecHeader<V> {
        match self.headers.last_mut() {
            Some(header) => header,
            None => panic!("no transaction is active on this thread"),
        }
    }

    /// Searches the stack from the innermost record outwards and returns the depth of
    /// the record holding an entry for `tvar`, along with the entry.
    pub fn get_entry(&self, tvar: TVarId) -> Option<(usize, &TRecEntry<V>)> {
        self.headers
            .iter()
            .enumerate()
            .rev()
            .find_map(|(depth, header)| header.find(tvar).map(|entry| (depth, entry)))
    }

    /// Returns the value of `tvar` as seen by the innermost record. The first access
    /// of a variable not known to any record is logged in the innermost record.
    pub fn read(&mut self, tvar: &TVar<V>) -> V {
        if let Some((_, entry)) = self.get_entry(tvar.id()) {
            return entry.new_value.clone();
        }

        let (value, version) = tvar.read_current();
        self.innermost_mut()
            .push(TRecEntry::read(tvar.clone(), value.clone(), version));
        value
    }

    /// Records a pending write in the innermost record.
    ///
    /// Entries owned by the innermost record are updated in place. An entry found in
    /// an enclosing record is shadowed by a new entry in the innermost record, so
    /// aborting the innermost record discards the write.
    pub fn write(&mut self, tvar: &TVar<V>, value: V) {
        let innermost = self.depth().saturating_sub(1);

        let shadowed = match self.get_entry(tvar.id()) {
            Some((depth, _)) if depth == innermost => None,
            Some((_, entry)) => Some((entry.expected_value.clone(), entry.expected_version)),
            None => {
                let (current, version) = tvar.read_current();
                Some((current, version))
            }
        };

        let header = self.innermost_mut();
        match shadowed {
            Some((expected_value, expected_version)) => {
                header.push(TRecEntry::write(tvar.clone(), expected_value, expected_version, value));
            }
            None => {
                if let Some(entry) = header.find_mut(tvar.id()) {
                    entry.new_value = value;
                    entry.updated = true;
                }
            }
        }
    }

    pub fn add_invariant(&mut self, invariant: Invariant<V>) {
        self.innermost_mut().add_invariant(invariant);
    }

    /// Takes the invariants registered on the top-level record
    pub fn take_invariants(&mut self) -> Vec<Invariant<V>> {
        self.innermost_mut().take_invariants()
    }

    /// Validates every record on the stack against the committed state
    pub fn is_valid(&self) -> bool {
        self.headers.iter().all(TRecHeader::is_valid)
    }

    /// Finishes a nested record successfully and merges its log into the enclosing
    /// record: written values replace the enclosing values, unknown entries are
    /// appended and invariants move to the enclosing record.
    pub fn commit_nested(&mut self) {
        let mut nested = self.pop_nested();
        nested.finish(TRecState::Committed);
        let invariants = nested.take_invariants();

        let enclosing = self.innermost_mut();
        debug_assert_eq!(Some(enclosing.id()), nested.enclosing());

        for entry in nested.into_entries() {
            match enclosing.find_mut(entry.tvar.id()) {
                Some(existing) => {
                    if entry.updated {
                        existing.new_value = entry.new_value;
                        existing.updated = true;
                    }
                }
                None => enclosing.push(entry),
            }
        }
        for invariant in invariants {
            enclosing.add_invariant(invariant);
        }
    }

    /// Finishes a nested record unsuccessfully. Its writes and invariants are
    /// discarded, but variables it read and that no record on the stack knows about
    /// are merged into the enclosing record as reads, so a blocking retry still
    /// watches them.
    pub fn abort_nested(&mut self) {
        let mut nested = self.pop_nested();
        nested.finish(TRecState::Aborted);

        for entry in nested.into_entries() {
            if self.get_entry(entry.tvar.id()).is_none() {
                let TRecEntry {
                    tvar,
                    expected_value,
                    expected_version,
                    ..
                } = entry;
                self.innermost_mut()
                    .push(TRecEntry::read(tvar, expected_value, expected_version));
            }
        }
    }

    /// Removes the top-level record. Nested records must have been finished already.
    pub fn pop_top(&mut self) -> TRecHeader<V> {
        assert_eq!(self.headers.len(), 1, "nested transactions left on the stack");
        match self.headers.pop() {
            Some(header) => header,
            None => unreachable!(),
        }
    }

    fn pop_nested(&mut self) -> TRecHeader<V> {
        assert!(self.headers.len() > 1, "no nested transaction is active");
        match self.headers.pop() {
            Some(header) => header,
            None => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 4;

    fn stack() -> TRecStack<usize> {
        let mut stack = TRecStack::default();
        stack.start(CHUNK);
        stack
    }

    #[test]
    fn test_read_logs_first_access() {
        let mut stack = stack();
        let var = TVar::new(3);

        assert_eq!(stack.read(&var), 3);
        var.publish(4);

        // the logged value is returned, not the committed one
        assert_eq!(stack.read(&var), 3);
        assert!(!stack.is_valid());
    }

    #[test]
    fn test_read_your_writes() {
        let mut stack = stack();
        let var = TVar::new(3);

        stack.write(&var, 10);
        assert_eq!(stack.read(&var), 10);
        assert_eq!(var.read_uncommitted(), 3);

        let (depth, entry) = stack.get_entry(var.id()).expect("entry not found");
        assert_eq!(depth, 0);
        assert_eq!((entry.expected_value, entry.new_value), (3, 10));
        assert!(entry.updated);
    }

    #[test]
    fn test_get_entry_prefers_innermost() {
        let mut stack = stack();
        let var = TVar::new(1);

        stack.write(&var, 2);
        stack.start(CHUNK);
        stack.write(&var, 3);

        let (depth, entry) = stack.get_entry(var.id()).expect("entry not found");
        assert_eq!(depth, 1);
        assert_eq!(entry.new_value, 3);

        // the enclosing entry is shadowed, not overwritten
        let outer = stack.headers[0].find(var.id()).expect("entry not found");
        assert_eq!(outer.new_value, 2);
        assert_eq!(entry.expected_version, outer.expected_version);
    }

    #[test]
    fn test_commit_nested_merges_writes() {
        let mut stack = stack();
        let a = TVar::new(1);
        let b = TVar::new(5);

        stack.read(&a);
        stack.start(CHUNK);
        stack.write(&a, 2);
        stack.write(&b, 6);
        stack.commit_nested();

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.read(&a), 2);
        assert_eq!(stack.read(&b), 6);

        let top = stack.pop_top();
        assert_eq!(top.entries().count(), 2);
        assert!(top.entries().all(|entry| entry.updated));
    }

    #[test]
    fn test_abort_nested_keeps_reads_only() {
        let mut stack = stack();
        let a = TVar::new(1);
        let b = TVar::new(5);

        stack.start(CHUNK);
        stack.write(&a, 2);
        assert_eq!(stack.read(&b), 5);
        stack.abort_nested();

        assert_eq!(stack.read(&a), 1);
        let top = stack.pop_top();
        assert!(!top.has_updates());

        let watched: Vec<TVarId> = top.read_set().iter().map(|(var, _)| var.id()).collect();
        assert!(watched.contains(&a.id()));
        assert!(watched.contains(&b.id()));
    }

    #[test]
    #[should_panic]
    fn test_read_outside_transaction() {
        let mut stack: TRecStack<usize> = TRecStack::default();
        stack.read(&TVar::new(0));
    }
}
