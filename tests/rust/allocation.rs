// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Allocations released by the runtime on behalf of a logical thread must happen with preemption disabled.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::std::{
    alloc::{
        GlobalAlloc,
        Layout,
        System,
    },
    cell::Cell,
    hint,
    panic,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};
use ::uthread::{
    ensure_eq,
    preempt,
    Fail,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Smallest allocation whose release is tracked.
const TRACKED_SIZE: usize = 16 * 1024;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Tracked allocations released so far.
static TRACKED_FREES: AtomicUsize = AtomicUsize::new(0);

/// Tracked allocations released while preemption was enabled.
static PREEMPTIBLE_FREES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Set on the OS thread that runs the run loop under test.
    static TRACKING: Cell<bool> = const { Cell::new(false) };
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

//======================================================================================================================
// Structures
//======================================================================================================================

/// System allocator that counts large releases on the tracked OS thread.
struct CountingAllocator;

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() >= TRACKED_SIZE && TRACKING.try_with(|tracking| tracking.get()).unwrap_or(false) {
            TRACKED_FREES.fetch_add(1, Ordering::Relaxed);
            if preempt::is_enabled() {
                PREEMPTIBLE_FREES.fetch_add(1, Ordering::Relaxed);
            }
        }
        System.dealloc(ptr, layout)
    }
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn entry_and_panic_payload_are_released_with_preemption_disabled() -> Result<()> {
    let _lock = common::serialize();
    TRACKED_FREES.store(0, Ordering::Relaxed);
    PREEMPTIBLE_FREES.store(0, Ordering::Relaxed);

    TRACKING.with(|tracking| tracking.set(true));
    let result: Result<(), Fail> = uthread::run(false, || {
        let buffer: [u8; TRACKED_SIZE] = [1; TRACKED_SIZE];
        uthread::create(move || {
            hint::black_box(&buffer);
        })
        .expect("create() should succeed");

        let buffer: [u8; TRACKED_SIZE] = [2; TRACKED_SIZE];
        uthread::create(move || {
            hint::black_box(&buffer);
            panic::panic_any(vec![3u8; TRACKED_SIZE]);
        })
        .expect("create() should succeed");
    });
    TRACKING.with(|tracking| tracking.set(false));
    result?;

    // Two entry closures and one panic payload.
    ensure_eq!(TRACKED_FREES.load(Ordering::Relaxed) >= 3, true);
    ensure_eq!(PREEMPTIBLE_FREES.load(Ordering::Relaxed), 0);
    ensure_eq!(preempt::is_enabled(), true);
    Ok(())
}
