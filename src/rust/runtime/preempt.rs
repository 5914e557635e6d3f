// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Timer-driven preemption of logical threads.
//!
//! A recurring `ITIMER_VIRTUAL` timer raises `SIGVTALRM` at a fixed rate while the process consumes CPU time. The
//! signal handler forces the running logical thread to yield, unless preemption is disabled at that instant, in which
//! case the tick is dropped. Disabling preemption is how the scheduler and the semaphores protect their bookkeeping.
//!
//! Code running in a logical thread with preemption enabled may be interrupted at any instruction. Calls that take
//! process-wide locks (allocation, logging, standard output) should therefore be wrapped in [disabled].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler,
};
use ::libc::c_int;
use ::std::{
    hint,
    mem,
    ptr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default preemption frequency, in ticks per second.
pub const DEFAULT_HZ: u32 = 100;

/// Number of microseconds in a second.
const USEC_PER_SEC: u64 = 1_000_000;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Set while preemption is disabled.
static DISABLED: AtomicBool = AtomicBool::new(false);

/// Timer ticks handled on the owner thread.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Timer ticks dropped because preemption was disabled.
static DEFERRED_TICKS: AtomicU64 = AtomicU64::new(0);

/// OS thread that receives forced yields, or zero.
static OWNER: AtomicUsize = AtomicUsize::new(0);

/// Signal handlers that may still forward a tick to [OWNER].
static FORWARDING: AtomicUsize = AtomicUsize::new(0);

/// Signal disposition and timer value that preceded [start].
static SAVED: Mutex<Option<SavedTimer>> = Mutex::new(None);

//======================================================================================================================
// Structures
//======================================================================================================================

struct SavedTimer {
    action: libc::sigaction,
    timer: libc::itimerval,
}

/// Keeps preemption disabled while alive. When dropped, preemption is re-enabled only if this guard disabled it.
pub struct PreemptGuard {
    reenable: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl PreemptGuard {
    pub fn new() -> Self {
        Self {
            reenable: !DISABLED.swap(true, Ordering::AcqRel),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Starts preempting logical threads `hz` times per second of CPU time. Forced yields are delivered to the calling
/// OS thread. Does nothing if `enabled` is false.
pub fn start(enabled: bool, hz: u32) -> Result<(), Fail> {
    if !enabled {
        return Ok(());
    }
    if hz == 0 {
        return Err(Fail::new(libc::EINVAL, "preemption frequency must be positive"));
    }

    let mut saved: MutexGuard<Option<SavedTimer>> = lock_saved();
    if saved.is_some() {
        let cause: &str = "preemption is already started";
        error!("start(): {}", cause);
        return Err(Fail::new(libc::EBUSY, cause));
    }

    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_timer_expired as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut old_action: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGVTALRM, &action, &mut old_action) == -1 {
            let e: Fail = Fail::last_os_error("failed to install timer signal handler");
            error!("start(): {}", e.cause);
            return Err(e);
        }

        OWNER.store(libc::pthread_self() as usize, Ordering::SeqCst);

        let period_us: u64 = (USEC_PER_SEC / hz as u64).max(1);
        let period: libc::timeval = libc::timeval {
            tv_sec: (period_us / USEC_PER_SEC) as libc::time_t,
            tv_usec: (period_us % USEC_PER_SEC) as libc::suseconds_t,
        };
        let timer: libc::itimerval = libc::itimerval {
            it_interval: period,
            it_value: period,
        };
        let mut old_timer: libc::itimerval = mem::zeroed();
        if libc::setitimer(libc::ITIMER_VIRTUAL, &timer, &mut old_timer) == -1 {
            let e: Fail = Fail::last_os_error("failed to arm preemption timer");
            error!("start(): {}", e.cause);
            OWNER.store(0, Ordering::SeqCst);
            libc::sigaction(libc::SIGVTALRM, &old_action, ptr::null_mut());
            return Err(e);
        }

        *saved = Some(SavedTimer {
            action: old_action,
            timer: old_timer,
        });
    }

    debug!("start(): hz={:?}", hz);
    Ok(())
}

/// Stops preemption and restores the timer and signal disposition that preceded [start]. Does nothing if preemption
/// is not started.
pub fn stop() {
    let mut saved: MutexGuard<Option<SavedTimer>> = lock_saved();
    if let Some(previous) = saved.take() {
        OWNER.store(0, Ordering::SeqCst);
        unsafe {
            let mut timer_signal: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut timer_signal);
            libc::sigaddset(&mut timer_signal, libc::SIGVTALRM);
            let mut old_mask: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &timer_signal, &mut old_mask);

            if libc::setitimer(libc::ITIMER_VIRTUAL, &previous.timer, ptr::null_mut()) == -1 {
                warn!("stop(): failed to restore timer");
            }

            // No tick may be generated or forwarded past this point. Ignoring the signal discards pending ones, so
            // that a default disposition can be restored.
            while FORWARDING.load(Ordering::SeqCst) != 0 {
                hint::spin_loop();
            }
            let mut ignore: libc::sigaction = mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ignore.sa_mask);
            libc::sigaction(libc::SIGVTALRM, &ignore, ptr::null_mut());
            if libc::sigaction(libc::SIGVTALRM, &previous.action, ptr::null_mut()) == -1 {
                warn!("stop(): failed to restore signal handler");
            }

            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
        }
        debug!("stop(): ticks={:?}, deferred={:?}", ticks(), deferred_ticks());
    }
}

/// Disables preemption. Calls do not nest: each call must be matched by exactly one [enable] before the next one.
pub fn disable() {
    let was_disabled: bool = DISABLED.swap(true, Ordering::AcqRel);
    debug_assert!(!was_disabled, "disable(): preemption is already disabled");
}

/// Enables preemption.
pub fn enable() {
    let was_disabled: bool = DISABLED.swap(false, Ordering::AcqRel);
    debug_assert!(was_disabled, "enable(): preemption is already enabled");
}

/// Returns whether forced yields are currently allowed.
pub fn is_enabled() -> bool {
    !DISABLED.load(Ordering::Acquire)
}

/// Runs `f` with preemption disabled.
pub fn disabled<R, F: FnOnce() -> R>(f: F) -> R {
    let _guard: PreemptGuard = PreemptGuard::new();
    f()
}

/// Number of timer ticks observed since the process started.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Number of timer ticks that were dropped because preemption was disabled.
pub fn deferred_ticks() -> u64 {
    DEFERRED_TICKS.load(Ordering::Relaxed)
}

fn lock_saved() -> MutexGuard<'static, Option<SavedTimer>> {
    match SAVED.lock() {
        Ok(saved) => saved,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handler for `SIGVTALRM`. Only async-signal-safe calls are made here besides the forced yield itself.
extern "C" fn on_timer_expired(signum: c_int) {
    if signum != libc::SIGVTALRM {
        return;
    }
    let errno: c_int = unsafe { *libc::__errno_location() };

    let this_thread: usize = unsafe { libc::pthread_self() } as usize;
    FORWARDING.fetch_add(1, Ordering::SeqCst);
    let owner: usize = OWNER.load(Ordering::SeqCst);
    if owner != 0 && owner != this_thread {
        // The timer signal is process-directed; hand it over to the thread that runs the logical threads.
        unsafe { libc::pthread_kill(owner as libc::pthread_t, libc::SIGVTALRM) };
    }
    FORWARDING.fetch_sub(1, Ordering::SeqCst);

    if owner == this_thread {
        TICKS.fetch_add(1, Ordering::Relaxed);
        if DISABLED.load(Ordering::Acquire) {
            DEFERRED_TICKS.fetch_add(1, Ordering::Relaxed);
        } else {
            scheduler::forced_yield();
        }
    }

    unsafe { *libc::__errno_location() = errno };
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if self.reenable {
            DISABLED.store(false, Ordering::Release);
        }
    }
}

