//! # Error Taxonomy
//!
//! Every fallible operation in the crate returns [`StoreError`]. Callers on the
//! far side of the request gateway receive the same type inside the reply, so
//! the variants are the wire-level taxonomy, not an internal detail.
//!
//! Two variants poison the session: [`StoreError::Corruption`] and
//! [`StoreError::Io`] leave the tree unusable until the file is re-opened.
//! `Codec`, `Capacity`, `NotFound` and `InvalidArgument` never mutate tree
//! state; a lookup miss is a normal `Ok(None)` result, not an error.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not initialized")]
    NotInitialized,

    #[error("store '{0}' already exists")]
    AlreadyExists(String),

    #[error("store '{0}' not found")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("entry does not fit in a page: {0}")]
    Capacity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store is closed")]
    Closed,

    #[error("request timed out during '{0}'")]
    Timeout(&'static str),
}

impl StoreError {
    /// Whether this error leaves the store unusable until re-opened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Corruption(_))
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        StoreError::Corruption(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        StoreError::Codec(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
