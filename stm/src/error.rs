// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;

#[derive(Debug, DeriveError, PartialEq, Eq, Clone)]
pub enum TxError {
    /// The calling transaction is no longer active. Recoverable by unwinding to the
    /// enclosing atomic block and running it again.
    #[error("Transaction aborted")]
    Aborted,

    /// An internal invariant has been violated. Never retried.
    #[error("Transactional invariant violated ({0})")]
    Panic(String),

    #[error("Index {index} is out of bounds for capacity {capacity}")]
    OutOfBounds { index: usize, capacity: usize },

    /// The retry strategy gave up on an atomic block
    #[error("Retries exhausted ({0})")]
    Exhausted(String),

    #[error("Maximum nesting depth of {0} exceeded")]
    NestingTooDeep(usize),
}

impl TxError {
    pub(crate) fn panic<S: Into<String>>(reason: S) -> Self {
        Self::Panic(reason.into())
    }

    /// Returns `true`, if the error can be recovered by running the atomic block again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[derive(Debug, DeriveError, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Unknown contention manager ({0})")]
    UnknownPolicy(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}
