// SPDX-License-Identifier: Apache-2.0

//! Keyed-segment backend over System V IPC.
//!
//! Unrelated processes rendezvous on a numeric key derived from a stable
//! filesystem path, then share a kernel-resident memory segment and a binary
//! semaphore under that key. The kernel objects outlive any one process and
//! are destroyed only by explicit request.

mod segment;
mod semaphore;

pub use segment::{Segment, SegmentMap};
pub use semaphore::Semaphore;

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{IpcError, Result};

/// A System V IPC key.
///
/// Deterministically derived from an existing filesystem path plus a small
/// project discriminator: every process deriving from the same stable path
/// and discriminator reaches the same segment and semaphore without prior
/// communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SysvKey(libc::key_t);

impl SysvKey {
    /// Derive a key from `path` and `project_id` via `ftok`.
    ///
    /// The path must exist and stay stable for the lifetime of the
    /// rendezvous; only the low byte of `project_id` participates and it
    /// must be non-zero.
    pub fn derive(path: &Path, project_id: i32) -> Result<Self> {
        if (project_id & 0xff) == 0 {
            return Err(IpcError::invalid_state(
                "ftok project id must have a non-zero low byte",
            ));
        }
        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| IpcError::InvalidName {
                name: path.display().to_string(),
                reason: "path contains an interior NUL byte".to_string(),
            })?;

        // SAFETY: c_path is a valid NUL-terminated string.
        let key = unsafe { libc::ftok(c_path.as_ptr(), project_id) };
        if key == -1 {
            return Err(IpcError::last_os("ftok"));
        }
        Ok(Self(key))
    }

    /// Wrap a raw key obtained elsewhere (e.g. handed over by a peer).
    pub fn from_raw(key: i32) -> Self {
        Self(key as libc::key_t)
    }

    /// The raw numeric key.
    pub fn raw(&self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for SysvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
