//! Error types for the Strata metadata server cache.
//!
//! This module provides a unified error type [`MdsError`] for all cache,
//! locking and ownership-transfer operations, along with a convenient
//! [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lookup**: `NotFound`, `NotADirectory`, `InvalidPath`, `PermissionDenied`
//! - **Authority**: `NotAuthoritative` (carries a redirect hint), `Frozen`
//! - **Coordination**: `Conflict` (migration/hash overlap or incompatible lock)
//! - **Peers**: `Timeout`, `ProtocolViolation`
//! - **Configuration**: `Config`, `InvalidConfig`
//!
//! # Example
//!
//! ```rust
//! use strata_mds::error::MdsError;
//!
//! let err = MdsError::NotAuthoritative { redirect: Some(2) };
//! assert!(err.is_retryable());
//! assert_eq!(err.redirect(), Some(2));
//! ```

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for metadata server operations.
#[derive(Error, Debug)]
pub enum MdsError {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Authority errors
    #[error("Not authoritative. Authority is: {redirect:?}")]
    NotAuthoritative { redirect: Option<NodeId> },

    #[error("Frozen: {0}")]
    Frozen(String),

    // Coordination errors
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // Peer errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MdsError {
    /// Convert to POSIX errno for client-visible failures.
    pub fn to_errno(&self) -> i32 {
        match self {
            MdsError::NotFound(_) => libc::ENOENT,
            MdsError::NotADirectory(_) => libc::ENOTDIR,
            MdsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            MdsError::AlreadyExists(_) => libc::EEXIST,
            MdsError::InvalidPath(_) => libc::EINVAL,
            MdsError::PermissionDenied(_) => libc::EACCES,
            MdsError::NotAuthoritative { .. } => libc::EAGAIN,
            MdsError::Frozen(_) => libc::EAGAIN,
            MdsError::Conflict(_) => libc::EBUSY,
            MdsError::InvalidOperation(_) => libc::EINVAL,
            MdsError::Timeout(_) => libc::ETIMEDOUT,
            MdsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Check if the caller should retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MdsError::NotAuthoritative { .. }
                | MdsError::Frozen(_)
                | MdsError::Conflict(_)
                | MdsError::Timeout(_)
        )
    }

    /// Redirect hint carried by `NotAuthoritative`.
    pub fn redirect(&self) -> Option<NodeId> {
        match self {
            MdsError::NotAuthoritative { redirect } => *redirect,
            _ => None,
        }
    }

    /// Wire-safe summary of this error, used in replies to clients and peers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MdsError::NotFound(_) => ErrorKind::NotFound,
            MdsError::NotADirectory(_) => ErrorKind::NotADirectory,
            MdsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            MdsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MdsError::InvalidPath(_) => ErrorKind::InvalidPath,
            MdsError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MdsError::NotAuthoritative { redirect } => ErrorKind::NotAuthoritative(*redirect),
            MdsError::Frozen(_) => ErrorKind::Frozen,
            MdsError::Conflict(_) => ErrorKind::Conflict,
            MdsError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            MdsError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }
}

/// Serializable error classification sent across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    NotADirectory,
    DirectoryNotEmpty,
    AlreadyExists,
    InvalidPath,
    PermissionDenied,
    NotAuthoritative(Option<NodeId>),
    Frozen,
    Conflict,
    InvalidOperation,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Rebuild a local error from a wire classification.
    pub fn into_error(self, context: impl Into<String>) -> MdsError {
        let context = context.into();
        match self {
            ErrorKind::NotFound => MdsError::NotFound(context),
            ErrorKind::NotADirectory => MdsError::NotADirectory(context),
            ErrorKind::DirectoryNotEmpty => MdsError::DirectoryNotEmpty(context),
            ErrorKind::AlreadyExists => MdsError::AlreadyExists(context),
            ErrorKind::InvalidPath => MdsError::InvalidPath(context),
            ErrorKind::PermissionDenied => MdsError::PermissionDenied(context),
            ErrorKind::NotAuthoritative(redirect) => MdsError::NotAuthoritative { redirect },
            ErrorKind::Frozen => MdsError::Frozen(context),
            ErrorKind::Conflict => MdsError::Conflict(context),
            ErrorKind::InvalidOperation => MdsError::InvalidOperation(context),
            ErrorKind::Timeout => MdsError::Timeout(context),
            ErrorKind::Internal => MdsError::Internal(context),
        }
    }
}

impl From<bincode::Error> for MdsError {
    fn from(e: bincode::Error) -> Self {
        MdsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MdsError {
    fn from(e: serde_json::Error) -> Self {
        MdsError::Serialization(e.to_string())
    }
}

/// Result type alias for metadata server operations.
pub type Result<T> = std::result::Result<T, MdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MdsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(MdsError::Conflict("x".into()).to_errno(), libc::EBUSY);
        assert_eq!(MdsError::Timeout("x".into()).to_errno(), libc::ETIMEDOUT);
        assert_eq!(
            MdsError::PermissionDenied("x".into()).to_errno(),
            libc::EACCES
        );
    }

    #[test]
    fn test_retryable() {
        assert!(MdsError::Conflict("hash in flight".into()).is_retryable());
        assert!(MdsError::NotAuthoritative { redirect: Some(3) }.is_retryable());
        assert!(!MdsError::NotFound("a".into()).is_retryable());
        assert!(!MdsError::ProtocolViolation("bad ack".into()).is_retryable());
    }

    #[test]
    fn test_kind_round_trip_keeps_redirect() {
        let err = MdsError::NotAuthoritative { redirect: Some(7) };
        let back = err.kind().into_error("lookup");
        assert_eq!(back.redirect(), Some(7));
    }
}
