// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Execution stacks and saved register contexts for logical threads.
//!
//! Stacks are anonymous private mappings with a guard page at their low end, so an overflow faults instead of
//! silently corrupting a neighbouring allocation. Contexts wrap a `ucontext_t` and must never move once initialized:
//! glibc stores pointers into the structure itself, which is why they always live behind a [Box].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    mem,
    ptr,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Fallback page size, used when the system refuses to report one.
const DEFAULT_PAGE_SIZE: usize = 4096;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Number of stacks currently mapped by this process.
static LIVE_STACKS: AtomicUsize = AtomicUsize::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Execution stack of a logical thread.
pub struct Stack {
    /// Base address of the mapping, guard page included.
    base: *mut libc::c_void,
    /// Length of the mapping, guard page included.
    len: usize,
    /// Length of the guard page.
    guard: usize,
}

/// Saved execution state of a logical thread.
pub struct Context {
    ucontext: libc::ucontext_t,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Stack {
    /// Maps a new stack with at least `size` usable bytes.
    pub fn alloc(size: usize) -> Result<Self, Fail> {
        if size == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot allocate an empty stack"));
        }

        let page_size: usize = page_size();
        let usable: usize = size.div_ceil(page_size) * page_size;
        let len: usize = usable + page_size;

        let base: *mut libc::c_void = unsafe {
            let ret: *mut libc::c_void = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );

            if ret == libc::MAP_FAILED {
                let cause: String = format!("failed to map stack (len={:?})", len);
                error!("alloc(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            }
            ret
        };

        // Stacks grow downwards, so the guard page sits at the lowest address.
        if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } == -1 {
            let e: Fail = Fail::last_os_error("failed to protect stack guard page");
            error!("alloc(): {}", e.cause);
            unsafe { libc::munmap(base, len) };
            return Err(e);
        }

        LIVE_STACKS.fetch_add(1, Ordering::Relaxed);
        trace!("alloc(): base={:?}, len={:?}", base, len);

        Ok(Self {
            base,
            len,
            guard: page_size,
        })
    }

    /// Lowest usable address of the stack.
    fn bottom(&self) -> *mut libc::c_void {
        unsafe { (self.base as *mut u8).add(self.guard) as *mut libc::c_void }
    }

    /// Number of usable bytes.
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Context {
    /// Creates an empty context. It becomes meaningful once it is either initialized or saved into by [switch].
    pub fn new() -> Box<Self> {
        Box::new(Self {
            // ucontext_t is a plain C structure for which all-zeroes is a valid bit pattern.
            ucontext: unsafe { mem::zeroed() },
        })
    }

    /// Prepares this context so that resuming it runs `entry` on top of `stack`. `entry` must never return.
    pub fn init(&mut self, stack: &Stack, entry: extern "C" fn()) -> Result<(), Fail> {
        unsafe {
            if libc::getcontext(&mut self.ucontext) == -1 {
                let e: Fail = Fail::last_os_error("failed to capture execution context");
                error!("init(): {}", e.cause);
                return Err(e);
            }
            self.ucontext.uc_stack.ss_sp = stack.bottom();
            self.ucontext.uc_stack.ss_size = stack.size();
            self.ucontext.uc_stack.ss_flags = 0;
            self.ucontext.uc_link = ptr::null_mut();
            libc::makecontext(&mut self.ucontext, entry, 0);
        }
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Saves the live execution state into `from` and resumes `to`. Returns once some later switch targets `from`.
///
/// # Safety
///
/// Both pointers must reference live, pinned contexts, and `to` must have been initialized or saved into before.
pub unsafe fn switch(from: *mut Context, to: *const Context) -> Result<(), Fail> {
    if libc::swapcontext(&mut (*from).ucontext, &(*to).ucontext) == -1 {
        return Err(Fail::last_os_error("failed to switch execution context"));
    }
    Ok(())
}

/// Resumes `to` without saving the caller's state.
///
/// # Safety
///
/// Same requirements as [switch] for `to`. Nothing on the caller's stack is dropped.
pub unsafe fn restore(to: *const Context) -> ! {
    libc::setcontext(&(*to).ucontext);
    panic!("restore(): failed to resume execution context");
}

/// Number of stacks currently mapped by this process.
pub fn live_stacks() -> usize {
    LIVE_STACKS.load(Ordering::Relaxed)
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Stack {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base, self.len) } == -1 {
            warn!("drop(): failed to unmap stack (base={:?})", self.base);
        }
        LIVE_STACKS.fetch_sub(1, Ordering::Relaxed);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
