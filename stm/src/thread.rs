// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Threads running transactions.
//!
//! An [`StmThread`] owns the stack of transaction records of one OS thread and
//! exposes the transactional operations. The shared part of a thread (its parking
//! slot, cancellation flag and outstanding wakeups) lives in a [`Tso`], which the
//! watch queues of variables and the wakeup messages refer to.

use crate::{
    breaker::BusyBreaker,
    config::Strategy,
    engine::Stm,
    errors::{CommitError, Exception, StmError, StmResult},
    message::{Message, WakeupMessage},
    stack::TRecStack,
    stats::StmStats,
    sync::{lock, Mutex},
    trec::{TRecId, TRecState},
    tvar::TVar,
};
use log::*;
use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, PoisonError,
    },
    time::{Duration, Instant},
};

/// Identity of a thread registered with an [`Stm`] engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread state shared between the thread itself, the watch queues it is registered
/// in and the messages addressed to it.
pub(crate) struct Tso {
    id: ThreadId,
    capability: usize,

    /// Set by [`Tso::unpark`], consumed by [`Tso::park_timeout`]
    notified: std::sync::Mutex<bool>,
    wakeup: Condvar,

    killed: AtomicBool,

    /// Wakeups sent to this thread which may not have been delivered yet
    messages: Mutex<Vec<Arc<WakeupMessage>>>,
}

impl Tso {
    pub fn new(id: ThreadId, capability: usize) -> Self {
        Self {
            id,
            capability,
            notified: std::sync::Mutex::new(false),
            wakeup: Condvar::new(),
            killed: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn capability(&self) -> usize {
        self.capability
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.unpark();
    }

    pub fn unpark(&self) {
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        *notified = true;
        self.wakeup.notify_all();
    }

    /// Forgets a notification that arrived before the thread started waiting
    pub fn reset_notified(&self) {
        *self.notified.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Blocks until notified or until `timeout` has passed. Returns `true`, if the
    /// thread has been notified.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);

        while !*notified {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wakeup
                .wait_timeout(notified, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            notified = guard;
        }

        *notified = false;
        true
    }

    pub fn track(&self, message: Arc<WakeupMessage>) {
        lock(&self.messages).push(message);
    }

    /// Invalidates all outstanding wakeups. Called whenever the thread resumes, as
    /// it re-checks its read set on its own from then on.
    pub fn invalidate_messages(&self) {
        for message in lock(&self.messages).drain(..) {
            message.invalidate();
        }
    }
}

/// A handle to a thread, usable from any other thread.
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) tso: Arc<Tso>,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.tso.id()
    }

    /// The capability messages to this thread are delivered through
    pub fn capability(&self) -> usize {
        self.tso.capability()
    }

    /// Cancels the thread. A thread blocked on a retry is removed from all watch
    /// queues and resumes; the running or next transaction of the thread returns
    /// [`StmError::Killed`].
    pub fn kill(&self) {
        info!("TX({}): killed", self.id());
        self.tso.kill();
    }

    pub fn is_killed(&self) -> bool {
        self.tso.is_killed()
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("capability", &self.capability())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// A thread running transactions over variables holding values of type `V`.
///
/// All operations take `&self`, transaction bodies receive the thread they run on
/// and call the operations on it:
///
/// ```
/// use runtime_stm::Stm;
///
/// let stm = Stm::new().expect("Failed to start engine");
/// let thread = stm.thread::<usize>();
/// let var = thread.new_tvar(1);
///
/// let result = thread.atomically(|tx| {
///     let value = tx.read_tvar(&var);
///     tx.write_tvar(&var, value + 1);
///     Ok(value)
/// });
///
/// assert_eq!(result.expect("Transaction failed"), 1);
/// assert_eq!(var.read_uncommitted(), 2);
/// ```
pub struct StmThread<V> {
    stm: Stm,
    tso: Arc<Tso>,
    trec: RefCell<TRecStack<V>>,
}

impl<V> StmThread<V>
where
    V: Clone + 'static,
{
    pub(crate) fn new(stm: Stm, tso: Arc<Tso>) -> Self {
        Self {
            stm,
            tso,
            trec: RefCell::new(TRecStack::default()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.tso.id()
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle { tso: self.tso.clone() }
    }

    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Returns `true`, while this thread runs an atomic block
    pub fn in_transaction(&self) -> bool {
        !self.trec.borrow().is_empty()
    }

    /// Creates a new variable. May be called inside or outside a transaction; a
    /// variable created inside a transaction is visible to others once they obtain
    /// a handle to it, regardless of whether the transaction commits.
    pub fn new_tvar(&self, initial: V) -> TVar<V> {
        TVar::new(initial)
    }

    /// Reads `tvar` inside the running transaction.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is running on this thread.
    pub fn read_tvar(&self, tvar: &TVar<V>) -> V {
        trace!("TX({}): read TVar({})", self.id(), tvar.id());
        self.trec.borrow_mut().read(tvar)
    }

    /// Writes `value` to `tvar` inside the running transaction. The write becomes
    /// visible to other threads when the top-level transaction commits.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is running on this thread.
    pub fn write_tvar(&self, tvar: &TVar<V>, value: V) {
        trace!("TX({}): write TVar({})", self.id(), tvar.id());
        self.trec.borrow_mut().write(tvar, value);
    }

    /// Runs `block` as a top-level transaction until it commits.
    ///
    /// The block is re-run from scratch when its commit fails validation or violates
    /// an invariant registered with [`StmThread::check`], when it
    /// raises [`StmError::Retry`] (after one of the variables it read changed), and
    /// when it raises an exception from an inconsistent view. An exception raised
    /// from a consistent view aborts the transaction and is returned.
    ///
    /// Returns [`StmError::NestedAtomically`] without running `block`, if called while a
    /// transaction is already running on this thread.
    pub fn atomically<T, F>(&self, mut block: F) -> StmResult<T>
    where
        F: FnMut(&Self) -> StmResult<T>,
    {
        if self.in_transaction() {
            warn!("TX({}): atomically invoked inside a transaction", self.id());
            return Err(StmError::NestedAtomically);
        }

        let _reset = ResetOnUnwind(&self.trec);
        let strategy = self.stm.config().strategy;
        let mut breaker = BusyBreaker::default();

        loop {
            if self.tso.is_killed() {
                return Err(StmError::Killed);
            }

            let trec = self.start_top();
            debug!("TX({}): START TREC({})", self.id(), trec);

            let conflict = match block(self) {
                Ok(result) => match self.commit() {
                    Ok(()) => {
                        debug!("TX({}): COMMIT TREC({})", self.id(), trec);
                        return Ok(result);
                    }
                    Err(CommitError::Validation) => true,
                    Err(CommitError::Invariant) => {
                        debug!("TX({}): TREC({}) violates an invariant", self.id(), trec);
                        StmStats::bump(&self.stm.stats_ref().invariant_violations);
                        true
                    }
                },
                Err(StmError::Retry) => {
                    debug!("TX({}): TREC({}) retries", self.id(), trec);
                    self.block()?;
                    false
                }
                Err(StmError::Failure) => {
                    self.abort();
                    true
                }
                Err(error) => {
                    let valid = self.stm.validate(&self.trec.borrow());
                    self.abort();
                    if valid {
                        debug!("TX({}): TREC({}) aborted: {}", self.id(), trec, error);
                        return Err(error);
                    }
                    debug!("TX({}): TREC({}) raised from an inconsistent view", self.id(), trec);
                    true
                }
            };

            if conflict {
                debug!("TX({}): TREC({}) conflicted", self.id(), trec);
                StmStats::bump(&self.stm.stats_ref().conflicts);
                if strategy == Strategy::Abort {
                    return Err(StmError::Failure);
                }
                breaker.spin();
            }
        }
    }

    /// Runs `code` in a nested transaction. If it raises an exception, its writes are
    /// discarded and `handler` runs in a fresh nested transaction with the
    /// exception.
    ///
    /// Signals other than exceptions ([`StmError::Retry`], [`StmError::Failure`] and
    /// [`StmError::Killed`]) propagate unchanged. An exception raised from an
    /// inconsistent view is not handed to `handler`; [`StmError::Failure`] is raised
    /// instead, which restarts the enclosing transaction.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is running on this thread.
    pub fn catch_stm<T, C, H>(&self, code: C, handler: H) -> StmResult<T>
    where
        C: FnOnce(&Self) -> StmResult<T>,
        H: FnOnce(&Self, Exception) -> StmResult<T>,
    {
        self.start_nested();

        match code(self) {
            Err(error) if error.is_catchable() => {
                let valid = self.stm.validate(&self.trec.borrow());
                self.trec.borrow_mut().abort_nested();
                if !valid {
                    debug!("TX({}): exception raised from an inconsistent view", self.id());
                    return Err(StmError::Failure);
                }

                debug!("TX({}): caught exception: {}", self.id(), error);
                self.start_nested();
                let outcome = handler(self, error.into_exception());
                self.finish_nested(outcome)
            }
            outcome => self.finish_nested(outcome),
        }
    }

    /// Runs `first` in a nested transaction. If it retries, its writes are discarded
    /// and `alternative` runs in a fresh nested transaction. If both retry, the
    /// retry propagates and the enclosing transaction blocks on the variables read
    /// by either alternative.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is running on this thread.
    pub fn catch_retry<T, A, B>(&self, first: A, alternative: B) -> StmResult<T>
    where
        A: FnOnce(&Self) -> StmResult<T>,
        B: FnOnce(&Self) -> StmResult<T>,
    {
        self.start_nested();

        match first(self) {
            Err(StmError::Retry) => {
                self.trec.borrow_mut().abort_nested();
                trace!("TX({}): first alternative retried", self.id());

                self.start_nested();
                let outcome = alternative(self);
                self.finish_nested(outcome)
            }
            outcome => self.finish_nested(outcome),
        }
    }

    /// Registers `invariant` with the running transaction. Once the enclosing
    /// top-level transaction commits, the invariant is checked right before the
    /// commit, and the commit only succeeds if it holds. An invariant holds if it
    /// returns `Ok(())`. A violated invariant restarts the transaction like a failed
    /// validation, so under [`Strategy::Abort`] it returns [`StmError::Failure`].
    ///
    /// Invariants registered in a nested transaction that aborts are discarded.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is running on this thread.
    pub fn check<F>(&self, invariant: F)
    where
        F: Fn(&Self) -> StmResult<()> + 'static,
    {
        self.trec.borrow_mut().add_invariant(Box::new(invariant));
    }

    fn start_top(&self) -> TRecId {
        self.trec.borrow_mut().start(self.stm.config().chunk_size)
    }

    fn start_nested(&self) -> TRecId {
        let mut stack = self.trec.borrow_mut();
        assert!(!stack.is_empty(), "nested transaction started outside of atomically");
        stack.start(self.stm.config().chunk_size)
    }

    fn finish_nested<T>(&self, outcome: StmResult<T>) -> StmResult<T> {
        match outcome {
            Ok(_) => self.trec.borrow_mut().commit_nested(),
            Err(_) => self.trec.borrow_mut().abort_nested(),
        }
        outcome
    }

    /// Checks the invariants of the top-level record, then validates and publishes
    /// it. The record is removed from the stack in every case.
    fn commit(&self) -> Result<(), CommitError> {
        let invariants = self.trec.borrow_mut().take_invariants();

        if !invariants.is_empty() {
            if !self.stm.validate(&self.trec.borrow()) {
                self.abort();
                return Err(CommitError::Validation);
            }

            for invariant in &invariants {
                self.start_nested();
                let holds = invariant(self).is_ok();
                // reads of the invariant stay in the top-level record
                self.trec.borrow_mut().abort_nested();

                if !holds {
                    self.abort();
                    return Err(CommitError::Invariant);
                }
            }
        }

        let mut header = self.trec.borrow_mut().pop_top();
        debug_assert_eq!(header.state(), TRecState::Active);
        let result = self.stm.commit(&header);
        header.finish(match result {
            Ok(()) => TRecState::Committed,
            Err(_) => TRecState::Aborted,
        });
        result
    }

    fn abort(&self) {
        let mut header = self.trec.borrow_mut().pop_top();
        header.finish(TRecState::Aborted);
    }

    /// Suspends until a variable read by the top-level record has changed
    fn block(&self) -> StmResult<()> {
        let mut header = self.trec.borrow_mut().pop_top();
        header.finish(TRecState::Retrying);
        let read_set = header.read_set();
        drop(header);

        self.stm.wait(&self.tso, &read_set)
    }
}

impl<V> fmt::Debug for StmThread<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StmThread")
            .field("id", &self.tso.id())
            .field("capability", &self.tso.capability())
            .finish_non_exhaustive()
    }
}

/// Clears the record stack if a transaction body panics
struct ResetOnUnwind<'a, V>(&'a RefCell<TRecStack<V>>);

impl<V> Drop for ResetOnUnwind<'_, V> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Ok(mut stack) = self.0.try_borrow_mut() {
                stack.clear();
            }
        }
    }
}
