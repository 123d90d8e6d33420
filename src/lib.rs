//! Cross-process shared memory with inter-process locking.
//!
//! Two backends expose the same contract over different POSIX facilities:
//!
//! - [`posix`] — named shared memory objects (`shm_open`/`mmap`), reached by
//!   a portable name string. No locking of its own.
//! - [`sysv`] — System V segments and binary semaphores, reached by a
//!   numeric key derived from a filesystem path. The semaphore is the
//!   mutual-exclusion gate.
//!
//! A caller derives a key or picks a name, creates or opens the backing
//! resource, maps or attaches it, then repeatedly locks, touches the shared
//! bytes, and unlocks; eventually it drops its local view and some
//! participant explicitly destroys the kernel object. The mapped bytes carry
//! no consistency protocol of their own — the lock exists so callers can
//! serialize access, but nothing forces them to.
//!
//! All handles are ownership-typed: descriptors close, mappings unmap and
//! attachments detach when their owners leave scope, on every exit path.
//! Kernel-resident System V objects are never destroyed implicitly.

pub mod error;
pub mod posix;
pub mod region;
pub mod sysv;

// Re-export commonly used types
pub use error::{IpcError, Result};
pub use posix::{MappedRegion, OpenOptions, PosixSharedMemory, ShmObject};
pub use region::{IpcLock, LockGuard, SharedRegion};
pub use sysv::{Segment, SegmentMap, Semaphore, SysvKey};
