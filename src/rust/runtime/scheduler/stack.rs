// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    ptr,
    ptr::NonNull,
    sync::OnceLock,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Memory for one lightweight thread's stack. The lowest page of the mapping is a guard page, so that an overflow
/// faults instead of silently corrupting a neighbor.
pub struct Stack {
    /// Start of the mapping (the guard page).
    base: NonNull<u8>,
    /// Length of the mapping, guard page included.
    mapped: usize,
    /// Length of the guard page.
    guard: usize,
}

// A stack is plain memory that is exclusively owned by one lightweight thread at a time.
unsafe impl Send for Stack {}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Stack {
    /// Maps a stack with at least `bytes` of usable space.
    pub fn new(bytes: usize) -> Result<Self, Fail> {
        let page: usize = page_size();
        let usable: usize = bytes.div_ceil(page) * page;
        let mapped: usize = usable + page;

        let addr: *mut libc::c_void = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let cause: String = format!("failed to map stack (bytes={}, error={:?})", mapped, errno());
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }

        if unsafe { libc::mprotect(addr, page, libc::PROT_NONE) } != 0 {
            let cause: String = format!("failed to protect stack guard page (error={:?})", errno());
            error!("new(): {}", &cause);
            unsafe { libc::munmap(addr, mapped) };
            return Err(Fail::new(libc::ENOMEM, &cause));
        }

        // Safety: mmap() does not return null on success.
        let base: NonNull<u8> = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        Ok(Self {
            base,
            mapped,
            guard: page,
        })
    }

    /// Lowest usable address.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// One past the highest usable address. Stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Stack {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped) } != 0 {
            warn!("drop(): failed to unmap stack (error={:?})", errno());
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    })
}

fn errno() -> ::std::io::Error {
    ::std::io::Error::last_os_error()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
