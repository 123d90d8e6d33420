// SPDX-License-Identifier: Apache-2.0

//! Named-object backend over POSIX shared memory.
//!
//! Wraps `shm_open`/`ftruncate`/`mmap` behind ownership-typed handles: the
//! descriptor closes and the mapping unmaps when their owners leave scope,
//! on every exit path. This backend provides no locking by itself.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::{IpcError, Result};
use crate::region::SharedRegion;

/// Open intent for a named object. Always read-write.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    create: bool,
    create_exclusive: bool,
    mode: u32,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            create: false,
            create_exclusive: false,
            mode: 0o600,
        }
    }

    /// Create the object if it does not exist yet.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Create the object, failing with `AlreadyExists` if it is already
    /// there. First-creator-wins races are coordinated through that error.
    pub fn create_exclusive(mut self, exclusive: bool) -> Self {
        self.create_exclusive = exclusive;
        self
    }

    /// Permission bits used on creation.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    fn oflags(&self) -> libc::c_int {
        let mut flags = libc::O_RDWR;
        if self.create || self.create_exclusive {
            flags |= libc::O_CREAT;
        }
        if self.create_exclusive {
            flags |= libc::O_EXCL;
        }
        flags
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a public name into the kernel form.
///
/// Mirrors the python-compatible convention: the public name has no leading
/// slash, the name handed to the kernel always has exactly one.
fn kernel_name(name: &str) -> Result<CString> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(IpcError::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    CString::new(format!("/{trimmed}")).map_err(|_| IpcError::InvalidName {
        name: name.to_string(),
        reason: "name contains an interior NUL byte".to_string(),
    })
}

/// An open descriptor to a named shared memory object.
///
/// Owned exclusively by the process that opened it; the descriptor closes on
/// drop. Closing does not remove the name — that is [`ShmObject::unlink`].
#[derive(Debug)]
pub struct ShmObject {
    fd: libc::c_int,
}

impl ShmObject {
    /// Open or create the named object per `options`.
    pub fn open(name: &str, options: &OpenOptions) -> Result<Self> {
        let c_name = kernel_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string, flags and mode
        // are plain POSIX values.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                options.oflags(),
                options.mode as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(IpcError::last_os("shm_open"));
        }

        tracing::debug!(name = %name, fd, "opened shared memory object");
        Ok(Self { fd })
    }

    /// Truncate or extend the backing object to `len` bytes.
    ///
    /// Only meaningful right after creation, before other processes map the
    /// object; shrinking a region others already use invalidates their view.
    pub fn resize(&self, len: u64) -> Result<()> {
        // SAFETY: fd is a live descriptor owned by self.
        let ret = unsafe { libc::ftruncate(self.fd, len as libc::off_t) };
        if ret < 0 {
            return Err(IpcError::last_os("ftruncate"));
        }
        Ok(())
    }

    /// Current size of the backing object in bytes.
    pub fn stat(&self) -> Result<u64> {
        // SAFETY: fd is a live descriptor and st is a properly sized,
        // writable stat buffer.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(self.fd, &mut st) };
        if ret < 0 {
            return Err(IpcError::last_os("fstat"));
        }
        Ok(st.st_size as u64)
    }

    /// Map `len` bytes of the object read-write, shared with other mappers.
    ///
    /// A mapping longer than the object is undefined behavior at the OS
    /// level, so it is rejected here with `InvalidState`.
    pub fn map(&self, len: usize) -> Result<MappedRegion> {
        let size = self.stat()?;
        if len as u64 > size {
            return Err(IpcError::invalid_state(format!(
                "mapping of {len} bytes exceeds object size {size}"
            )));
        }

        // SAFETY: fd is live, len does not exceed the object size, offset 0
        // is valid.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(IpcError::last_os("mmap"));
        }

        let ptr = NonNull::new(ptr as *mut u8).expect("mmap returned null but not MAP_FAILED");
        Ok(MappedRegion { ptr, len })
    }

    /// Close the descriptor, surfacing the error `Drop` can only log.
    pub fn close(self) -> Result<()> {
        let fd = self.fd;
        std::mem::forget(self);
        // SAFETY: fd was open and is not owned by anything else anymore.
        let ret = unsafe { libc::close(fd) };
        if ret < 0 {
            return Err(IpcError::last_os("close"));
        }
        Ok(())
    }

    /// Remove `name` from the namespace.
    ///
    /// Descriptors and mappings other processes already hold stay valid
    /// until each is individually closed or unmapped; the object itself is
    /// freed on the last reference.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = kernel_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            return Err(IpcError::last_os("shm_unlink"));
        }
        tracing::debug!(name = %name, "unlinked shared memory object");
        Ok(())
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        // SAFETY: fd was opened by us and close is only reached once.
        let ret = unsafe { libc::close(self.fd) };
        if ret < 0 {
            tracing::error!(
                fd = self.fd,
                error = %std::io::Error::last_os_error(),
                "failed to close shared memory descriptor"
            );
        }
    }
}

/// A process-local mmap view over a named object; unmaps on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region owns its mapping; cross-thread moves are fine, the
// bytes themselves are synchronized by the caller.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Unmap explicitly, surfacing the error `Drop` can only log.
    pub fn unmap(self) -> Result<()> {
        let (ptr, len) = (self.ptr, self.len);
        std::mem::forget(self);
        // SAFETY: ptr/len describe a live mapping owned solely by self.
        let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
        if ret < 0 {
            return Err(IpcError::last_os("munmap"));
        }
        Ok(())
    }
}

impl SharedRegion for MappedRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and len were set by a successful mmap.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret < 0 {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "failed to unmap shared memory region"
            );
        }
    }
}

/// A named shared memory object together with its mapping.
///
/// The creator owns the name and unlinks it on close; openers only release
/// their local view. Size is learned from the kernel on open, not trusted
/// from the caller.
#[derive(Debug)]
pub struct PosixSharedMemory {
    name: String,
    map: Option<MappedRegion>,
    object: Option<ShmObject>,
    owner: bool,
}

impl PosixSharedMemory {
    /// Create a new named object of `size` bytes and map it.
    ///
    /// Creation is exclusive: losing the first-creator race yields
    /// `AlreadyExists`.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let object = ShmObject::open(
            name,
            &OpenOptions::new().create_exclusive(true).mode(0o600),
        )?;

        // Unlink the half-created name if sizing or mapping fails.
        let built = object.resize(size as u64).and_then(|()| object.map(size));
        let map = match built {
            Ok(map) => map,
            Err(err) => {
                if let Err(unlink_err) = ShmObject::unlink(name) {
                    tracing::warn!(name = %name, error = %unlink_err, "cleanup unlink failed");
                }
                return Err(err);
            }
        };

        tracing::debug!(name = %name, size, "created shared memory");
        Ok(Self {
            name: name.trim_start_matches('/').to_string(),
            map: Some(map),
            object: Some(object),
            owner: true,
        })
    }

    /// Open an existing named object and map its full current size.
    pub fn open(name: &str) -> Result<Self> {
        let object = ShmObject::open(name, &OpenOptions::new())?;
        let size = object.stat()?;
        let map = object.map(size as usize)?;

        tracing::debug!(name = %name, size, "opened shared memory");
        Ok(Self {
            name: name.trim_start_matches('/').to_string(),
            map: Some(map),
            object: Some(object),
            owner: false,
        })
    }

    /// Public name, without the leading slash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the mapping and descriptor; the creator also unlinks the
    /// name. All steps are attempted, the first failure is reported.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;

        if self.owner {
            self.owner = false;
            if let Err(err) = ShmObject::unlink(&self.name) {
                first_err.get_or_insert(err);
            }
        }
        if let Some(map) = self.map.take() {
            if let Err(err) = map.unmap() {
                first_err.get_or_insert(err);
            }
        }
        if let Some(object) = self.object.take() {
            if let Err(err) = object.close() {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn region(&self) -> &MappedRegion {
        self.map.as_ref().expect("mapping present until close")
    }
}

impl SharedRegion for PosixSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.region().as_ptr()
    }

    fn len(&self) -> usize {
        self.region().len()
    }
}

impl Drop for PosixSharedMemory {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(name = %self.name, error = %err, "failed to close shared memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmlock-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_create_write_reopen_read() {
        let name = unique_name("roundtrip");
        let mut shm = PosixSharedMemory::create(&name, 4096).unwrap();
        shm.write_bytes(&[0x5A; 4096]).unwrap();

        let other = PosixSharedMemory::open(&name).unwrap();
        assert_eq!(other.len(), 4096);
        assert_eq!(other.read_to_vec(4096).unwrap(), vec![0x5A; 4096]);

        other.close().unwrap();
        shm.close().unwrap();
        assert!(PosixSharedMemory::open(&name).is_err());
    }

    #[test]
    fn test_create_exclusive_collision() {
        let name = unique_name("excl");
        let shm = PosixSharedMemory::create(&name, 4096).unwrap();

        let err = PosixSharedMemory::create(&name, 4096).unwrap_err();
        assert!(err.is_already_exists(), "got {err}");

        shm.close().unwrap();
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let err = PosixSharedMemory::open(&unique_name("missing")).unwrap_err();
        assert!(err.is_not_found(), "got {err}");
    }

    #[test]
    fn test_map_longer_than_object_is_rejected() {
        let name = unique_name("overmap");
        let object = ShmObject::open(
            &name,
            &OpenOptions::new().create_exclusive(true).mode(0o600),
        )
        .unwrap();
        object.resize(4096).unwrap();

        let err = object.map(8192).unwrap_err();
        assert!(matches!(err, IpcError::InvalidState { .. }), "got {err}");

        ShmObject::unlink(&name).unwrap();
    }

    #[test]
    fn test_resize_and_stat_agree() {
        let name = unique_name("stat");
        let object = ShmObject::open(
            &name,
            &OpenOptions::new().create_exclusive(true).mode(0o600),
        )
        .unwrap();
        object.resize(12288).unwrap();
        assert_eq!(object.stat().unwrap(), 12288);

        ShmObject::unlink(&name).unwrap();
    }

    #[test]
    fn test_name_normalization() {
        let name = unique_name("slash");
        let shm = PosixSharedMemory::create(&format!("/{name}"), 4096).unwrap();
        assert_eq!(shm.name(), name);

        // The slashless spelling reaches the same kernel object.
        let other = PosixSharedMemory::open(&name).unwrap();
        other.close().unwrap();
        shm.close().unwrap();
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(matches!(
            PosixSharedMemory::create("", 4096),
            Err(IpcError::InvalidName { .. })
        ));
        assert!(matches!(
            PosixSharedMemory::create("/", 4096),
            Err(IpcError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_write_beyond_region_is_rejected() {
        let name = unique_name("bounds");
        let mut shm = PosixSharedMemory::create(&name, 4096).unwrap();

        let err = shm.write_bytes(&[0u8; 8192]).unwrap_err();
        assert!(matches!(err, IpcError::InvalidState { .. }), "got {err}");

        shm.close().unwrap();
    }

    #[test]
    fn test_unlink_leaves_existing_mapping_valid() {
        let name = unique_name("unlink");
        let mut shm = PosixSharedMemory::create(&name, 4096).unwrap();
        shm.write_bytes(b"still here").unwrap();

        ShmObject::unlink(&name).unwrap();

        // The name is gone but our mapping still reads.
        assert!(PosixSharedMemory::open(&name).is_err());
        assert_eq!(shm.read_to_vec(10).unwrap(), b"still here".to_vec());

        // Owner close now reports the already-unlinked name.
        assert!(shm.close().is_err());
    }
}
