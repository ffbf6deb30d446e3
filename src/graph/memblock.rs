//! Shared memory blocks backing activation records.
//!
//! A block is created through `shm_open` with a random name, sized, mapped
//! and immediately unlinked, so the only way to reach it is the file
//! descriptor. Peers map the same physical pages with [`MemBlock::from_fd`]
//! after receiving the fd out-of-band.

use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::graph::activation::ActivationRecord;
use crate::graph::error::{GraphError, Result};

/// An fd-backed shared memory mapping.
#[derive(Debug)]
pub struct MemBlock {
    fd: RawFd,
    ptr: *mut u8,
    size: usize,
    owner: bool,
}

// The mapping address is fixed for the lifetime of the block and all access
// to its contents goes through atomics.
unsafe impl Send for MemBlock {}
unsafe impl Sync for MemBlock {}

impl MemBlock {
    /// Allocate a new shared block of at least `size` bytes, zero-filled.
    pub fn alloc(size: usize) -> Result<MemBlock> {
        let name = format!("/mediaflow-{}", Uuid::new_v4().simple());
        let c_name = std::ffi::CString::new(name.clone())
            .map_err(|_| GraphError::invalid("bad shm name"))?;

        unsafe {
            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            );
            if fd < 0 {
                return Err(GraphError::NoMemory(format!(
                    "shm_open {name}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            // The name was only needed to mint the fd.
            libc::shm_unlink(c_name.as_ptr());

            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(GraphError::NoMemory(format!("ftruncate: {err}")));
            }

            match Self::map(fd, size, true) {
                Ok(block) => {
                    debug!("memblock: allocated {} bytes fd {}", size, block.fd);
                    Ok(block)
                }
                Err(e) => {
                    libc::close(fd);
                    Err(e)
                }
            }
        }
    }

    /// Map an existing block from a received file descriptor.
    ///
    /// The fd is duplicated; the caller keeps ownership of the original.
    pub fn from_fd(fd: RawFd, size: usize) -> Result<MemBlock> {
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(GraphError::Connection(format!(
                "dup fd {fd}: {}",
                std::io::Error::last_os_error()
            )));
        }
        unsafe { Self::map(dup, size, false) }
    }

    unsafe fn map(fd: RawFd, size: usize, owner: bool) -> Result<MemBlock> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(GraphError::NoMemory(format!(
                "mmap {size} bytes: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(MemBlock {
            fd,
            ptr: ptr as *mut u8,
            size,
            owner,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// File descriptor to hand to a peer alongside the layout size.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr as *mut libc::c_void, self.size) != 0 {
                warn!(
                    "memblock: munmap failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            libc::close(self.fd);
        }
    }
}

/// Cloneable handle to an activation record inside a shared block.
#[derive(Debug, Clone)]
pub struct Activation {
    mem: Arc<MemBlock>,
}

impl Activation {
    /// Allocate a fresh record, zeroed and clock-seeded.
    pub fn alloc(default_quantum: u32) -> Result<Activation> {
        let mem = MemBlock::alloc(std::mem::size_of::<ActivationRecord>())?;
        let this = Activation { mem: Arc::new(mem) };
        this.record().init(default_quantum);
        Ok(this)
    }

    /// Map a peer's record from its shared memory fd.
    pub fn from_fd(fd: RawFd) -> Result<Activation> {
        let mem = MemBlock::from_fd(fd, std::mem::size_of::<ActivationRecord>())?;
        Ok(Activation { mem: Arc::new(mem) })
    }

    pub fn record(&self) -> &ActivationRecord {
        // Layout guaranteed by alloc/from_fd sizing; the record is valid for
        // any bit pattern since every field is an atomic integer.
        unsafe { &*(self.mem.as_ptr() as *const ActivationRecord) }
    }

    pub fn fd(&self) -> RawFd {
        self.mem.fd()
    }
}
