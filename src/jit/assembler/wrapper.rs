//! `AssemblyWrapper`: an mmap'd buffer that starts read-write and is
//! locked to read-execute exactly once, never reallocated afterwards.
//!
//! Grounded in `examples/original_source/src/jit/AssemblyWrapper.hpp`'s
//! `MMapAllocator` + `lock()`. The original backs a growable
//! `std::vector` with an mmap allocator; this implementation reserves a
//! single fixed-capacity page-aligned region up front instead (the same
//! choice `crate::vm::frame::ValueStack` makes for the interpreter's
//! value stack), since code embeds absolute pointers into itself and a
//! reallocating buffer would invalidate them.

use crate::error::{JitError, JitResult};

const DEFAULT_RESERVE: usize = 64 * 1024;

fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

fn round_up_to_page(size: usize, page: usize) -> usize {
    (size + page - 1) / page * page
}

pub struct AssemblyWrapper {
    ptr: *mut u8,
    cap: usize,
    len: usize,
    locked: bool,
}

impl AssemblyWrapper {
    /// Reserve at least `reserve_size` bytes of RW anonymous memory.
    pub fn new(reserve_size: usize) -> JitResult<Self> {
        let page = page_size();
        let cap = round_up_to_page(reserve_size.max(1), page);

        // SAFETY: anonymous, fixed-size, fully-owned mapping; checked
        // against MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::MProtectFailure(std::io::Error::last_os_error()));
        }

        Ok(AssemblyWrapper {
            ptr: ptr as *mut u8,
            cap,
            len: 0,
            locked: false,
        })
    }

    pub fn with_default_reserve() -> JitResult<Self> {
        Self::new(DEFAULT_RESERVE)
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Pointer to the start of the buffer; the trace's entry point once
    /// locked.
    pub fn start(&self) -> *const u8 {
        self.ptr
    }

    fn check_unlocked(&self) -> JitResult<()> {
        if self.locked {
            Err(JitError::EncodingError(
                "attempted to write to a locked AssemblyWrapper".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn check_capacity(&self, additional: usize) -> JitResult<()> {
        if self.len + additional > self.cap {
            Err(JitError::EncodingError(format!(
                "code buffer exceeded reserved capacity ({} bytes)",
                self.cap
            )))
        } else {
            Ok(())
        }
    }

    pub fn add_byte(&mut self, byte: u8) -> JitResult<()> {
        self.check_unlocked()?;
        self.check_capacity(1)?;
        // SAFETY: in-bounds by the capacity check above.
        unsafe { *self.ptr.add(self.len) = byte };
        self.len += 1;
        Ok(())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> JitResult<()> {
        self.check_unlocked()?;
        self.check_capacity(bytes.len())?;
        // SAFETY: in-bounds by the capacity check above; `bytes` does not
        // alias `self.ptr` (anonymous mmap region, never exposed to
        // callers as a shared slice).
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    pub fn write_byte(&mut self, pos: usize, byte: u8) -> JitResult<()> {
        self.check_unlocked()?;
        if pos >= self.len {
            return Err(JitError::EncodingError(format!(
                "write_byte out of bounds: pos={pos}, len={}",
                self.len
            )));
        }
        // SAFETY: bounds checked above.
        unsafe { *self.ptr.add(pos) = byte };
        Ok(())
    }

    pub fn write_bytes(&mut self, pos: usize, bytes: &[u8]) -> JitResult<()> {
        self.check_unlocked()?;
        if pos + bytes.len() > self.len {
            return Err(JitError::EncodingError(format!(
                "write_bytes out of bounds: pos={pos}, n={}, len={}",
                bytes.len(),
                self.len
            )));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(pos), bytes.len());
        }
        Ok(())
    }

    pub fn write_u32(&mut self, pos: usize, value: u32) -> JitResult<()> {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    pub fn write_i32(&mut self, pos: usize, value: i32) -> JitResult<()> {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, pos: usize, value: u64) -> JitResult<()> {
        self.write_bytes(pos, &value.to_le_bytes())
    }

    /// One-way transition to read-execute. Any further `add_*`/`write_*`
    /// call returns `JitError::EncodingError`.
    pub fn lock(&mut self) -> JitResult<()> {
        if self.locked {
            return Ok(());
        }
        // SAFETY: `self.ptr`/`self.cap` describe the mapping created in
        // `new`, still valid and owned by `self`.
        let rc = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.cap,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(JitError::MProtectFailure(std::io::Error::last_os_error()));
        }
        self.locked = true;
        Ok(())
    }
}

impl Drop for AssemblyWrapper {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.cap` describe a mapping owned
        // exclusively by `self`, unmapped at most once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.cap);
        }
    }
}

// The mapping is exclusively owned and never aliased; it may legitimately
// move between threads (e.g. a trace handed to a worker), even though
// this crate's execution model never does so concurrently.
unsafe impl Send for AssemblyWrapper {}

impl std::fmt::Debug for AssemblyWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyWrapper")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .field("locked", &self.locked)
            .finish()
    }
}
