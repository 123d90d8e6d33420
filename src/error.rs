// SPDX-License-Identifier: Apache-2.0

//! Error types for shared memory and semaphore operations.
//!
//! All errors are explicit enum variants carrying the failing syscall and the
//! raw OS error code. No `Box<dyn Error>`, no `anyhow::Result`.

use nix::errno::Errno;
use thiserror::Error;

/// Result type alias using [`IpcError`].
pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors surfaced by the shared memory backends and the semaphore lock.
///
/// Variants carrying an [`Errno`] classify the native error code; the raw
/// code stays available through [`IpcError::errno`] for callers that need
/// the platform value.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The named object, key, segment or semaphore does not exist, or its
    /// kernel identifier was removed.
    #[error("{op}: no such resource ({errno})")]
    NotFound { op: &'static str, errno: Errno },

    /// Exclusive creation was requested but the target already exists.
    #[error("{op}: already exists ({errno})")]
    AlreadyExists { op: &'static str, errno: Errno },

    #[error("{op}: permission denied ({errno})")]
    PermissionDenied { op: &'static str, errno: Errno },

    /// A blocking call was interrupted by signal delivery. The crate never
    /// retries; callers wanting retry-on-interrupt loop explicitly.
    #[error("{op}: interrupted by signal ({errno})")]
    Interrupted { op: &'static str, errno: Errno },

    /// Descriptor, segment or semaphore table exhaustion.
    #[error("{op}: resource limit reached ({errno})")]
    ResourceExhausted { op: &'static str, errno: Errno },

    /// Any other native error code, carried verbatim.
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// A caller-side protocol violation: unlock on a free semaphore, a
    /// mapping longer than the backing object, or use after explicit close.
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// The shared memory name cannot be represented as a C string.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}

impl IpcError {
    /// Classify a native error code into the crate taxonomy.
    pub fn from_errno(op: &'static str, errno: Errno) -> Self {
        match errno {
            Errno::ENOENT | Errno::EIDRM => Self::NotFound { op, errno },
            Errno::EEXIST => Self::AlreadyExists { op, errno },
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied { op, errno },
            Errno::EINTR => Self::Interrupted { op, errno },
            Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM | Errno::ENOSPC => {
                Self::ResourceExhausted { op, errno }
            }
            _ => Self::Os { op, errno },
        }
    }

    /// Classify the calling thread's current errno value.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::from_errno(op, Errno::last())
    }

    /// Classify errno from a System V id-based call (`semop`, `shmat`,
    /// `semctl`, `shmctl`). Linux reports EINVAL for an identifier that was
    /// removed with IPC_RMID, so a stale handle maps to [`NotFound`] rather
    /// than a generic OS error.
    ///
    /// [`NotFound`]: IpcError::NotFound
    pub(crate) fn last_sysv(op: &'static str) -> Self {
        let errno = Errno::last();
        match errno {
            Errno::EINVAL => Self::NotFound { op, errno },
            _ => Self::from_errno(op, errno),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// The raw OS error code, when this error wraps one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::NotFound { errno, .. }
            | Self::AlreadyExists { errno, .. }
            | Self::PermissionDenied { errno, .. }
            | Self::Interrupted { errno, .. }
            | Self::ResourceExhausted { errno, .. }
            | Self::Os { errno, .. } => Some(*errno),
            Self::InvalidState { .. } | Self::InvalidName { .. } => None,
        }
    }

    /// True for the "no such resource" class of failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when exclusive creation lost a first-creator-wins race.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
