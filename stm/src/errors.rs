// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// A user exception raised inside a transaction.
pub type Exception = Box<dyn std::error::Error + Send + Sync>;

/// Result type of every transactional computation.
pub type StmResult<T> = Result<T, StmError>;

/// Errors and control signals flowing through transactional code.
///
/// Transaction bodies should pass these on with `?`. Handling them inside a body
/// (other than through [`crate::StmThread::catch_stm`] or [`crate::StmThread::catch_retry`])
/// breaks the isolation guarantees of the engine.
#[derive(DeriveError, Debug)]
pub enum StmError {
    /// The transaction cannot make progress yet. It is absorbed by the nearest
    /// `catch_retry`, or blocks the thread until a variable it read has changed.
    #[error("transaction requested a retry")]
    Retry,

    /// The transaction observed an inconsistent view and must be restarted.
    #[error("transaction failed validation")]
    Failure,

    /// `atomically` was invoked while the thread was already running a transaction.
    #[error("atomically invoked inside a running transaction")]
    NestedAtomically,

    /// The thread has been cancelled.
    #[error("thread was killed while running a transaction")]
    Killed,

    /// A user exception raised from transactional code.
    #[error("exception raised inside transaction: {0}")]
    Exception(Exception),
}

impl StmError {
    /// Wraps any error into [`StmError::Exception`]
    pub fn exception<E>(error: E) -> Self
    where
        E: Into<Exception>,
    {
        Self::Exception(error.into())
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Returns `true`, if a `catch_stm` handler may observe this error
    pub(crate) fn is_catchable(&self) -> bool {
        matches!(self, Self::Exception(_) | Self::NestedAtomically)
    }

    /// Converts a catchable error into the exception handed to a `catch_stm` handler
    pub(crate) fn into_exception(self) -> Exception {
        match self {
            Self::Exception(inner) => inner,
            other => Box::new(other),
        }
    }
}

/// Reasons a top-level commit can fail. Never visible to users.
#[derive(DeriveError, Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum CommitError {
    #[error("read set is no longer consistent with committed state")]
    Validation,

    #[error("registered invariant does not hold")]
    Invariant,
}

/// Errors raised while setting up the runtime around the engine.
#[derive(DeriveError, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn worker for capability {0}: {1}")]
    Capability(usize, std::io::Error),

    #[error("failed to spawn thread: {0}")]
    Thread(std::io::Error),
}
