// SPDX-License-Identifier: Apache-2.0

//! Capability traits shared by both backends.
//!
//! A [`SharedRegion`] is a process-local view over kernel-shared bytes; the
//! POSIX mapping and the System V attachment both implement it so callers can
//! pick a backend at configuration time without duplicating copy paths. An
//! [`IpcLock`] is the binary mutex that serializes access to those bytes.

use crate::error::{IpcError, Result};

/// A mapped, writable view over a shared memory resource.
///
/// Writes through one process's region are visible to every other process
/// holding a region over the same resource. The region itself carries no
/// consistency protocol: concurrent unsynchronized access from two processes
/// is a data race on the shared bytes, and callers are expected to serialize
/// with an [`IpcLock`] over the same rendezvous key.
pub trait SharedRegion {
    /// Base address of the view. Valid until the region is dropped,
    /// detached or unmapped.
    fn as_ptr(&self) -> *mut u8;

    /// Length of the view in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` to the start of the region.
    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.len() {
            return Err(IpcError::invalid_state(format!(
                "write of {} bytes exceeds region length {}",
                src.len(),
                self.len()
            )));
        }
        // SAFETY: the region owns a live mapping of at least src.len() bytes
        // and src cannot overlap freshly mapped kernel memory.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr(), src.len());
        }
        Ok(())
    }

    /// Copy the first `len` bytes of the region out into a vector.
    fn read_to_vec(&self, len: usize) -> Result<Vec<u8>> {
        if len > self.len() {
            return Err(IpcError::invalid_state(format!(
                "read of {} bytes exceeds region length {}",
                len,
                self.len()
            )));
        }
        let mut buf = vec![0u8; len];
        // SAFETY: the region owns a live mapping of at least len bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr(), buf.as_mut_ptr(), len);
        }
        Ok(buf)
    }
}

/// A cross-process binary mutex.
///
/// There is no ownership tracking: any process holding a handle may unlock,
/// including one that never locked. No recursion, no timeout, and no
/// fairness among waiters — starvation is possible.
pub trait IpcLock {
    /// Block until the lock is free, then claim it.
    ///
    /// Signal delivery while blocked surfaces as
    /// [`IpcError::Interrupted`]; the lock is not claimed in that case and
    /// callers wanting retry loop explicitly.
    fn lock(&self) -> Result<()>;

    /// Release the lock. Unlocking while already free is a protocol
    /// violation and yields [`IpcError::InvalidState`].
    fn unlock(&self) -> Result<()>;

    /// Claim the lock and release it when the guard leaves scope, including
    /// on early error returns.
    fn lock_guard(&self) -> Result<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        self.lock()?;
        Ok(LockGuard { lock: self })
    }
}

/// Scoped hold on an [`IpcLock`]; unlocks on drop.
#[must_use = "dropping the guard immediately releases the lock"]
pub struct LockGuard<'a, L: IpcLock> {
    lock: &'a L,
}

impl<L: IpcLock> LockGuard<'_, L> {
    /// Release explicitly, surfacing the unlock error that `Drop` can only
    /// log.
    pub fn release(self) -> Result<()> {
        let guard = std::mem::ManuallyDrop::new(self);
        guard.lock.unlock()
    }
}

impl<L: IpcLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            tracing::warn!(error = %err, "failed to unlock on guard drop");
        }
    }
}
