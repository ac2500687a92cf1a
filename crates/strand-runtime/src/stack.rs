//! Fiber stacks backed by anonymous mmap with a guard page
//!
//! Layout (stack grows down):
//!
//! ```text
//! base                     base+GUARD_SIZE                 base+len
//!  | PROT_NONE guard page  |  usable stack (RW)            | <- top
//! ```
//!
//! Overflowing into the guard page faults instead of silently corrupting
//! the neighbouring mapping.

use nix::errno::Errno;
use strand_core::constants::GUARD_SIZE;
use strand_core::error::{SchedError, SchedResult};

/// An owned fiber stack
pub struct FiberStack {
    base: *mut u8,
    len: usize,
}

// Safety: the mapping is owned exclusively by this value
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack with `size` usable bytes plus one guard page
    pub fn new(size: usize) -> SchedResult<Self> {
        let size = round_to_page(size);
        let len = size + GUARD_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::os("mmap", Errno::last() as i32));
        }

        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let errno = Errno::last() as i32;
            unsafe { libc::munmap(base, len) };
            return Err(SchedError::os("mprotect", errno));
        }

        Ok(FiberStack { base: base as *mut u8, len })
    }

    /// High end of the stack, where the first frame goes
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: len is the size of the mapping
        unsafe { self.base.add(self.len) }
    }

    /// Usable bytes, excluding the guard page
    #[inline]
    pub fn size(&self) -> usize {
        self.len - GUARD_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

fn round_to_page(size: usize) -> usize {
    (size + GUARD_SIZE - 1) & !(GUARD_SIZE - 1)
}
