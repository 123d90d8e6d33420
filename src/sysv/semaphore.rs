// SPDX-License-Identifier: Apache-2.0

//! System V binary semaphore used as a cross-process mutex.
//!
//! Value 0 means the resource is free, 1 means it is held. The semaphore is
//! kernel-resident and shared by every process deriving the same key; there
//! is no ownership tracking, so any holder of a handle may unlock.

use crate::error::{IpcError, Result};
use crate::region::IpcLock;
use crate::sysv::SysvKey;

/// A kernel-resident binary semaphore identified by a [`SysvKey`].
///
/// Like [`Segment`](crate::sysv::Segment), the kernel object outlives any
/// single process and is destroyed only by an explicit
/// [`Semaphore::remove`]; `Drop` forgets the local id and nothing else.
#[derive(Debug)]
pub struct Semaphore {
    id: libc::c_int,
    key: SysvKey,
}

impl Semaphore {
    fn get(key: SysvKey, flags: libc::c_int) -> Result<Self> {
        // SAFETY: semget takes plain integers; invalid values fail with an
        // error, never undefined behavior.
        let id = unsafe { libc::semget(key.raw() as libc::key_t, 1, flags) };
        if id < 0 {
            return Err(IpcError::last_os("semget"));
        }

        tracing::debug!(%key, id, "obtained semaphore");
        Ok(Self { id, key })
    }

    /// Create a new semaphore under `key`, initially free.
    ///
    /// Creation is exclusive: losing the first-creator race yields
    /// `AlreadyExists`. A freshly created System V semaphore starts at
    /// value 0, which is exactly the Free state of the lock protocol.
    pub fn create(key: SysvKey) -> Result<Self> {
        Self::get(key, libc::IPC_CREAT | libc::IPC_EXCL | 0o600)
    }

    /// Create the semaphore under `key` or return the existing one.
    pub fn get_or_create(key: SysvKey) -> Result<Self> {
        Self::get(key, libc::IPC_CREAT | 0o600)
    }

    /// Open the existing semaphore under `key`.
    pub fn open(key: SysvKey) -> Result<Self> {
        Self::get(key, 0)
    }

    /// The kernel-assigned semaphore identifier.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn key(&self) -> SysvKey {
        self.key
    }

    /// Current semaphore value; 0 is Free, 1 is Held.
    pub fn value(&self) -> Result<i32> {
        // SAFETY: GETVAL reads the counter and takes no buffer.
        let ret = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if ret < 0 {
            return Err(IpcError::last_sysv("semctl"));
        }
        Ok(ret)
    }

    /// Destroy the semaphore for all processes.
    ///
    /// Waiters blocked in [`lock`](IpcLock::lock) are woken with an error,
    /// and any later operation through a stale handle fails `NotFound`.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID takes no buffer.
        let ret = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if ret < 0 {
            return Err(IpcError::last_sysv("semctl"));
        }
        tracing::debug!(key = %self.key, id = self.id, "removed semaphore");
        Ok(())
    }
}

impl IpcLock for Semaphore {
    /// Block until the value is 0, then raise it to 1.
    ///
    /// Both sub-steps are submitted to the kernel as one compound `semop`,
    /// so no other locker can observe 0 and also increment in between: the
    /// check-then-act race is closed inside the kernel. Blocking is
    /// indefinite and unfair; signal delivery surfaces `Interrupted`
    /// without claiming the lock.
    fn lock(&self) -> Result<()> {
        let mut ops = [
            // Wait for the value to be 0.
            libc::sembuf {
                sem_num: 0,
                sem_op: 0,
                sem_flg: 0,
            },
            // Increment the value.
            libc::sembuf {
                sem_num: 0,
                sem_op: 1,
                sem_flg: 0,
            },
        ];

        // SAFETY: ops points at two valid sembuf entries.
        let ret = unsafe { libc::semop(self.id, ops.as_mut_ptr(), 2) };
        if ret < 0 {
            return Err(IpcError::last_sysv("semop"));
        }
        Ok(())
    }

    /// Lower the value from 1 to 0.
    ///
    /// Unlocking while already free would drive the value negative, which
    /// is outside the {0, 1} invariant; IPC_NOWAIT turns that case into an
    /// immediate `InvalidState` instead of blocking or clamping.
    fn unlock(&self) -> Result<()> {
        let mut ops = [libc::sembuf {
            sem_num: 0,
            sem_op: -1,
            sem_flg: libc::IPC_NOWAIT as libc::c_short,
        }];

        // SAFETY: ops points at one valid sembuf entry.
        let ret = unsafe { libc::semop(self.id, ops.as_mut_ptr(), 1) };
        if ret < 0 {
            let err = IpcError::last_sysv("semop");
            if matches!(err.errno(), Some(nix::errno::Errno::EAGAIN)) {
                return Err(IpcError::invalid_state(
                    "unlock on a semaphore that is already free",
                ));
            }
            return Err(err);
        }
        Ok(())
    }
}
