// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Logical threads and the run loop that drives them.
//!
//! Every operation in this module acts on the run loop that is active in this process. The run loop is entered with
//! [run] (or [run_with_config]) from an ordinary OS thread, which becomes the bootstrap thread, and ends once no
//! logical thread is ready anymore. Scheduler state is only touched with preemption disabled.

pub mod context;
mod scheduler;
mod thread;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    scheduler::SchedulerStats,
    thread::{
        ThreadId,
        ThreadState,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    scheduler::{
        Dispatch,
        Scheduler,
    },
    thread::ThreadEntry,
};
use crate::{
    config::Config,
    runtime::{
        fail::Fail,
        preempt::{
            self,
            PreemptGuard,
        },
    },
};
use ::std::{
    any::Any,
    mem,
    panic::{
        self,
        AssertUnwindSafe,
    },
    process,
    ptr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicPtr,
            AtomicUsize,
            Ordering,
        },
        Once,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Set while a run loop is active in this process.
static RUN_SLOT: AtomicBool = AtomicBool::new(false);

/// Scheduler of the active run loop, or null. Only dereferenced with preemption disabled.
static SCHEDULER: AtomicPtr<Scheduler> = AtomicPtr::new(ptr::null_mut());

/// OS thread that runs the active run loop, or zero.
static RUN_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Installs the panic hook of logical threads.
static PANIC_HOOK: Once = Once::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Ownership of the process-wide run loop. Dropping it tears the run loop down.
struct RunLoop {
    scheduler: *mut Scheduler,
    preempt: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunLoop {
    /// Claims the run slot and publishes a fresh scheduler for the calling execution context.
    fn enter(stack_size: usize) -> Result<Self, Fail> {
        if RUN_SLOT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let cause: &str = "a run loop is already active";
            error!("enter(): {}", cause);
            return Err(Fail::new(libc::EBUSY, cause));
        }

        let scheduler: *mut Scheduler = Box::into_raw(Box::new(Scheduler::new(stack_size)));
        RUN_THREAD.store(unsafe { libc::pthread_self() } as usize, Ordering::Release);
        SCHEDULER.store(scheduler, Ordering::Release);
        Ok(Self {
            scheduler,
            preempt: false,
        })
    }

    fn start_preemption(&mut self, hz: u32) -> Result<(), Fail> {
        preempt::start(true, hz)?;
        self.preempt = true;
        Ok(())
    }

    /// Tears the run loop down. Returns the number of threads that were left blocked.
    fn leave(mut self) -> usize {
        self.teardown()
    }

    fn teardown(&mut self) -> usize {
        if self.scheduler.is_null() {
            return 0;
        }
        {
            let _guard: PreemptGuard = PreemptGuard::new();
            SCHEDULER.store(ptr::null_mut(), Ordering::Release);
            RUN_THREAD.store(0, Ordering::Release);
        }
        if self.preempt {
            preempt::stop();
            self.preempt = false;
        }
        let scheduler: Box<Scheduler> = unsafe { Box::from_raw(self.scheduler) };
        self.scheduler = ptr::null_mut();
        let stranded: usize = scheduler.shutdown();
        RUN_SLOT.store(false, Ordering::Release);
        stranded
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `f` against the active scheduler. The caller must have preemption disabled and must not hold any other
/// reference obtained from this function.
pub(crate) fn with_scheduler<R, F: FnOnce(&mut Scheduler) -> Result<R, Fail>>(f: F) -> Result<R, Fail> {
    let scheduler: *mut Scheduler = SCHEDULER.load(Ordering::Acquire);
    if scheduler.is_null() {
        return Err(Fail::new(libc::EINVAL, "no run loop is active"));
    }
    f(unsafe { &mut *scheduler })
}

/// Runs `entry` as the first logical thread of a new run loop with the default configuration, and returns once no
/// logical thread is ready anymore. With `preempt` set, running threads are forced to yield periodically.
pub fn run<F: FnOnce() + 'static>(preempt: bool, entry: F) -> Result<(), Fail> {
    run_with_config(&Config::default(), preempt, entry)
}

/// Same as [run] with an explicit configuration.
pub fn run_with_config<F: FnOnce() + 'static>(config: &Config, preempt: bool, entry: F) -> Result<(), Fail> {
    let hz: u32 = config.preempt_hz()?;
    let stack_size: usize = config.stack_size()?;

    install_panic_hook();
    let mut run_loop: RunLoop = RunLoop::enter(stack_size)?;
    debug!("run(): preempt={:?}, hz={:?}, stack_size={:?}", preempt, hz, stack_size);

    if preempt {
        run_loop.start_preemption(hz)?;
    }

    create(entry)?;

    loop {
        let has_ready: bool = {
            let _guard: PreemptGuard = PreemptGuard::new();
            with_scheduler(|scheduler| Ok(scheduler.has_ready()))?
        };
        if !has_ready {
            break;
        }
        yield_now()?;
    }

    let stranded: usize = run_loop.leave();
    if stranded > 0 {
        let cause: String = format!("threads left blocked with nothing to wake them (count={:?})", stranded);
        warn!("run(): {}", cause);
        return Err(Fail::new(libc::EDEADLK, &cause));
    }
    debug!("run(): done");
    Ok(())
}

/// Creates a logical thread that runs `entry` and exits when it returns. The thread is appended to the ready queue.
pub fn create<F: FnOnce() + 'static>(entry: F) -> Result<ThreadId, Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    let mut entry: Option<F> = Some(entry);
    let entry: ThreadEntry = Box::new(move || {
        if let Some(entry) = entry.take() {
            entry()
        }
    });
    let thread_id: ThreadId = with_scheduler(|scheduler| scheduler.insert_thread(entry, thread_main))?;
    debug!("create(): thread_id={:?}", thread_id);
    Ok(thread_id)
}

/// Returns the identifier of the running logical thread.
pub fn current() -> Result<ThreadId, Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| Ok(scheduler.current()))
}

/// Returns the state of a logical thread, or `None` if it has been reclaimed.
pub fn state(thread_id: ThreadId) -> Result<Option<ThreadState>, Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| Ok(scheduler.state(&thread_id)))
}

/// Returns a snapshot of the scheduler bookkeeping.
pub fn stats() -> Result<SchedulerStats, Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| Ok(scheduler.stats()))
}

/// Gives up the executor to the next ready thread. A running caller is queued behind every thread that is already
/// ready; a blocked caller stays off the ready queue until someone unblocks it.
pub fn yield_now() -> Result<(), Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    dispatch()
}

/// Forced yield, invoked from the preemption signal handler with preemption enabled. Neither allocates nor logs.
pub(crate) fn forced_yield() {
    if SCHEDULER.load(Ordering::Acquire).is_null() {
        return;
    }
    let _guard: PreemptGuard = PreemptGuard::new();
    let _ = dispatch();
}

/// Picks the next thread and switches to it. Expects preemption to be disabled.
fn dispatch() -> Result<(), Fail> {
    match with_scheduler(|scheduler| Ok(scheduler.schedule()))? {
        Dispatch::Continue => Ok(()),
        Dispatch::Switch { from, to } => unsafe { context::switch(from, to) },
        Dispatch::Exhausted => {
            error!("dispatch(): no thread is ready to run");
            process::exit(0)
        },
    }
}

/// Marks the running logical thread as blocked. The caller must yield afterwards for the thread to stop running.
pub fn block() -> Result<(), Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| {
        scheduler.block_current();
        Ok(())
    })
}

/// Makes a blocked logical thread ready again. Does not switch to it.
pub fn unblock(thread_id: ThreadId) -> Result<(), Fail> {
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| scheduler.unblock(thread_id))
}

/// Terminates the running logical thread. Its stack is reclaimed later by the scheduler.
pub fn exit() -> ! {
    let guard: PreemptGuard = PreemptGuard::new();
    let next = match with_scheduler(|scheduler| {
        let thread_id: ThreadId = scheduler.current();
        trace!("exit(): thread_id={:?}", thread_id);
        Ok(scheduler.retire_current())
    }) {
        Ok(next) => next,
        Err(e) => panic!("exit(): {:?}", e),
    };

    match next {
        Some(to) => {
            // The successor re-enables preemption when it resumes.
            mem::forget(guard);
            unsafe { context::restore(to) }
        },
        None => {
            error!("exit(): no thread is ready to run");
            let _ = with_scheduler(|scheduler| {
                scheduler.release_all_but_current();
                Ok(())
            });
            process::exit(0)
        },
    }
}

/// First frame of every logical thread. Entered with preemption disabled by whoever switched here.
extern "C" fn thread_main() {
    let mut entry: ThreadEntry = match with_scheduler(|scheduler| Ok(scheduler.take_entry())) {
        Ok(Some(entry)) => entry,
        _ => {
            warn!("thread_main(): logical thread has no entry point");
            exit()
        },
    };
    preempt::enable();

    let result: Result<(), Box<dyn Any + Send>> = panic::catch_unwind(AssertUnwindSafe(|| entry()));

    // After a panic, the hook has already disabled preemption.
    let guard: PreemptGuard = PreemptGuard::new();
    drop(entry);
    if let Err(cause) = result {
        error!("thread_main(): logical thread panicked ({:?})", cause);
    }

    // The successor re-enables preemption.
    mem::forget(guard);
    exit()
}

/// Wraps the panic hook so that a panicking logical thread prints its message and unwinds with preemption disabled.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let guard: PreemptGuard = PreemptGuard::new();
            previous(info);
            if on_logical_thread() {
                // Re-enabled by the successor of the panicking thread.
                mem::forget(guard);
            }
        }));
    });
}

/// Returns whether the caller runs on a logical thread of the active run loop.
fn on_logical_thread() -> bool {
    if RUN_THREAD.load(Ordering::Acquire) != unsafe { libc::pthread_self() } as usize {
        return false;
    }
    let _guard: PreemptGuard = PreemptGuard::new();
    with_scheduler(|scheduler| Ok(!scheduler.on_bootstrap())).unwrap_or(false)
}
