// SPDX-License-Identifier: Apache-2.0

//! System V shared memory segments.

use std::ptr::NonNull;

use crate::error::{IpcError, Result};
use crate::region::SharedRegion;
use crate::sysv::SysvKey;

/// A kernel-resident shared memory segment identified by a [`SysvKey`].
///
/// The segment is not owned by any single process: the kernel reference
/// counts attachments across all of them, and the segment is destroyed only
/// by an explicit [`Segment::remove`] (or [`Segment::close`]), never by
/// `Drop`. Dropping a `Segment` merely forgets the local id.
#[derive(Debug)]
pub struct Segment {
    id: libc::c_int,
    key: SysvKey,
}

impl Segment {
    fn get(key: SysvKey, size: usize, flags: libc::c_int) -> Result<Self> {
        // SAFETY: shmget takes plain integers; invalid values fail with an
        // error, never undefined behavior.
        let id = unsafe { libc::shmget(key.raw() as libc::key_t, size, flags) };
        if id < 0 {
            return Err(IpcError::last_os("shmget"));
        }

        tracing::debug!(%key, id, size, "obtained shared memory segment");
        Ok(Self { id, key })
    }

    /// Create a new segment of `size` bytes under `key`.
    ///
    /// Creation is exclusive: losing the first-creator race yields
    /// `AlreadyExists`.
    pub fn create(key: SysvKey, size: usize) -> Result<Self> {
        Self::get(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o600)
    }

    /// Create the segment under `key` or return the existing one.
    pub fn get_or_create(key: SysvKey, size: usize) -> Result<Self> {
        Self::get(key, size, libc::IPC_CREAT | 0o600)
    }

    /// Open the existing segment under `key`.
    pub fn open(key: SysvKey) -> Result<Self> {
        Self::get(key, 0, 0)
    }

    /// The kernel-assigned segment identifier.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn key(&self) -> SysvKey {
        self.key
    }

    /// Size of the segment in bytes, as reported by the kernel.
    pub fn stat(&self) -> Result<usize> {
        // SAFETY: ds is a properly sized, writable shmid_ds buffer.
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) };
        if ret < 0 {
            return Err(IpcError::last_sysv("shmctl"));
        }
        Ok(ds.shm_segsz as usize)
    }

    /// Attach the segment into this process's address space.
    ///
    /// Each process holds its own attachment; writes through one are visible
    /// to all others.
    pub fn attach(&self) -> Result<SegmentMap> {
        // SAFETY: the kernel picks the address; a stale id fails with an
        // error.
        let addr = unsafe { libc::shmat(self.id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(IpcError::last_sysv("shmat"));
        }
        let ptr = NonNull::new(addr as *mut u8).expect("shmat returned null but not -1");

        let len = match self.stat() {
            Ok(len) => len,
            Err(err) => {
                // SAFETY: addr came from the shmat above.
                unsafe { libc::shmdt(addr) };
                return Err(err);
            }
        };

        tracing::debug!(key = %self.key, id = self.id, len, "attached shared memory segment");
        Ok(SegmentMap { ptr, len })
    }

    /// Destroy the kernel segment for all current and future attachers.
    ///
    /// The kernel marks the segment for removal and frees it when the last
    /// attachment is dropped; established attachments stay readable until
    /// then. A later open-by-key fails with `NotFound`.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID takes no buffer.
        let ret = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(IpcError::last_sysv("shmctl"));
        }
        tracing::debug!(key = %self.key, id = self.id, "removed shared memory segment");
        Ok(())
    }

    /// Detach `map` (when given) and destroy the segment.
    ///
    /// Both steps are attempted even if the first fails, so a failed detach
    /// cannot strand the kernel object; the first error is reported.
    pub fn close(self, map: Option<SegmentMap>) -> Result<()> {
        let mut first_err = None;

        if let Some(map) = map {
            if let Err(err) = map.detach() {
                first_err = Some(err);
            }
        }
        if let Err(err) = self.remove() {
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A process-local attachment of a [`Segment`]; detaches on drop.
///
/// Detaching invalidates this view only — other processes' attachments and
/// the kernel segment itself are unaffected.
#[derive(Debug)]
pub struct SegmentMap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the map owns its attachment; cross-thread moves are fine, the
// bytes themselves are synchronized by the caller.
unsafe impl Send for SegmentMap {}

impl SegmentMap {
    /// Detach explicitly, surfacing the error `Drop` can only log.
    pub fn detach(self) -> Result<()> {
        let ptr = self.ptr;
        std::mem::forget(self);
        // SAFETY: ptr came from shmat and is detached exactly once.
        let ret = unsafe { libc::shmdt(ptr.as_ptr() as *const libc::c_void) };
        if ret < 0 {
            return Err(IpcError::last_sysv("shmdt"));
        }
        Ok(())
    }
}

impl SharedRegion for SegmentMap {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        // SAFETY: ptr came from shmat and is detached exactly once.
        let ret = unsafe { libc::shmdt(self.ptr.as_ptr() as *const libc::c_void) };
        if ret < 0 {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "failed to detach shared memory segment"
            );
        }
    }
}
