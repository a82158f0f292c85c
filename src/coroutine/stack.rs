// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::std::ptr;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A coroutine stack: an anonymous private mapping with one `PROT_NONE`
/// guard page below the usable region, so overflow faults instead of
/// silently corrupting the neighbouring allocation.
pub struct Stack {
    /// Mapping base (the guard page).
    base: *mut u8,
    /// Total mapped length, guard page included.
    map_len: usize,
    /// Usable stack bytes above the guard page.
    usable: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Stack {
    /// Allocates a stack with at least `size` usable bytes (rounded up to the
    /// page size, clamped to the configured minimum).
    pub fn new(size: usize) -> Result<Self, Fail> {
        let page_size: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let usable: usize = size.max(limits::MIN_STACK_SIZE).next_multiple_of(page_size);
        let map_len: usize = usable + page_size;

        let base: *mut libc::c_void = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let cause: String = format!("failed to map coroutine stack (len={})", map_len);
            error!("new(): {}", cause);
            return Err(Fail::last_os_error(&cause));
        }

        // Revoke access to the lowest page; the stack grows down toward it.
        if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } != 0 {
            let cause: String = format!("failed to protect stack guard page (base={:?})", base);
            error!("new(): {}", cause);
            unsafe { libc::munmap(base, map_len) };
            return Err(Fail::last_os_error(&cause));
        }

        Ok(Self {
            base: base as *mut u8,
            map_len,
            usable,
        })
    }

    /// Highest address of the stack; execution starts here and grows down.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.map_len) }
    }

    /// Usable stack bytes.
    pub fn size(&self) -> usize {
        self.usable
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Stack {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) } != 0 {
            warn!("drop(): failed to unmap coroutine stack (base={:?})", self.base);
        }
    }
}

// The mapping is plain anonymous memory; the coroutine that owns it is the
// only writer, and ownership moves between threads only through the
// scheduler queue.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}
