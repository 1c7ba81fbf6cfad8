// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Runtime Software Transactional Memory
//!
//! Blocking software transactional memory for threads sharing mutable state.
//!
//! Shared state lives in [`TVar`]s. A thread registered with an [`Stm`] engine runs
//! atomic blocks with [`StmThread::atomically`]; all reads and writes of a block are
//! logged in a transaction record and become visible to other threads at once when
//! the block commits. A block that observed an inconsistent view is re-run.
//!
//! Composition:
//! - [`retry`] abandons the current attempt. The thread blocks until a variable it
//!   read has been changed by another commit.
//! - [`StmThread::catch_retry`] runs an alternative if the first block retries.
//! - [`StmThread::catch_stm`] handles exceptions raised by a block, discarding the
//!   writes of the failed block.
//! - [`StmThread::check`] registers an invariant checked at every commit of the
//!   enclosing transaction.
//!
//! ```
//! use runtime_stm::{guard, Stm, StmThread};
//! use std::time::Duration;
//!
//! let stm = Stm::new().expect("Failed to start engine");
//! let flag = stm.new_tvar(false);
//!
//! let waiter = {
//!     let flag = flag.clone();
//!     let (_, join) = stm
//!         .spawn(move |thread: StmThread<bool>| thread.atomically(|tx| guard(tx.read_tvar(&flag))))
//!         .expect("Failed to spawn thread");
//!     join
//! };
//!
//! std::thread::sleep(Duration::from_millis(10));
//! let main = stm.thread::<bool>();
//! main.atomically(|tx| {
//!     tx.write_tvar(&flag, true);
//!     Ok(())
//! })
//! .expect("Transaction failed");
//!
//! assert!(waiter.join().expect("Failed to join thread").is_ok());
//! ```

mod breaker;
pub mod capability;
pub mod config;
mod engine;
pub mod errors;
pub mod hook;
pub mod message;
mod stack;
mod stats;
mod sync;
mod thread;
mod trec;
mod tvar;

pub use breaker::BusyBreaker;
pub use capability::Capability;
pub use config::{LockingMode, StmConfig, Strategy};
pub use engine::Stm;
pub use errors::{Exception, RuntimeError, StmError, StmResult};
pub use hook::{ConflictHook, NoShake, Shake};
pub use message::{Message, WakeupMessage};
pub use stats::StatsSnapshot;
pub use thread::{StmThread, ThreadHandle, ThreadId};
pub use trec::TRecState;
pub use tvar::{TVar, TVarId};

/// Abandons the current attempt of a transaction.
///
/// Inside [`StmThread::catch_retry`] the alternative runs. Otherwise the thread blocks
/// until a variable read by the transaction has changed, and the transaction runs
/// again.
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}

/// Retries, unless `condition` holds
pub fn guard(condition: bool) -> StmResult<()> {
    if condition {
        Ok(())
    } else {
        retry()
    }
}

/// Raises `error` as an exception
pub fn throw<T, E>(error: E) -> StmResult<T>
where
    E: Into<Exception>,
{
    Err(StmError::exception(error))
}
