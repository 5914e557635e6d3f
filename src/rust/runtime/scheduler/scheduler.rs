// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our single-threaded, round-robin thread scheduler.
//!
//! Thread control blocks live in a slab and are addressed by [ThreadId]s. The scheduler itself never switches
//! execution contexts: it decides what to run next and hands the pair of contexts back to the caller, which performs
//! the switch once it no longer holds a reference to the scheduler.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::{
        id_map::IdMap,
        queue::Queue,
    },
    runtime::{
        fail::Fail,
        scheduler::{
            context::Context,
            thread::{
                Thread,
                ThreadEntry,
                ThreadId,
                ThreadState,
            },
        },
    },
};
use ::slab::Slab;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Internal offset into the slab that holds the thread control block.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct InternalId(usize);

/// Outcome of a scheduling decision.
pub enum Dispatch {
    /// Keep running the current thread.
    Continue,
    /// Save the current thread into `from` and resume `to`.
    Switch { from: *mut Context, to: *const Context },
    /// The current thread cannot continue and nothing else is ready.
    Exhausted,
}

/// Snapshot of the scheduler bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Thread control blocks alive, bootstrap included.
    pub threads: usize,
    /// Threads waiting in the ready queue.
    pub ready: usize,
    /// Exited threads whose stacks have not been reclaimed yet.
    pub zombies: usize,
    /// Threads waiting to be unblocked.
    pub blocked: usize,
}

/// Thread Scheduler
pub struct Scheduler {
    // Mapping between external thread ids and offsets into the thread slab.
    ids: IdMap<ThreadId, InternalId>,
    threads: Slab<Thread>,
    // Threads eligible to run, in FIFO order. Capacity is kept at or above the number of live threads so that a forced
    // yield never allocates.
    ready: Queue<ThreadId>,
    // Exited threads awaiting stack reclamation.
    zombies: Queue<ThreadId>,
    current: ThreadId,
    // The execution context that entered the scheduler. It owns no stack and is released when the scheduler is dropped.
    bootstrap: ThreadId,
    stack_size: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    /// Creates a scheduler whose running thread is the calling execution context.
    pub fn new(stack_size: usize) -> Self {
        let mut ids: IdMap<ThreadId, InternalId> = IdMap::default();
        let mut threads: Slab<Thread> = Slab::new();
        let internal_id: InternalId = threads.insert(Thread::bootstrap()).into();
        let bootstrap: ThreadId = ids.insert_with_new_id(internal_id);
        Self {
            ids,
            threads,
            ready: Queue::with_capacity(1),
            zombies: Queue::new(),
            current: bootstrap,
            bootstrap,
            stack_size,
        }
    }

    fn get_thread(&self, thread_id: &ThreadId) -> Option<&Thread> {
        let internal_id: InternalId = self.ids.get(thread_id)?;
        self.threads.get(internal_id.into())
    }

    fn get_mut_thread(&mut self, thread_id: &ThreadId) -> Option<&mut Thread> {
        let internal_id: InternalId = self.ids.get(thread_id)?;
        self.threads.get_mut(internal_id.into())
    }

    /// Same as [Scheduler::get_mut_thread] but for threads that the scheduler itself tracks in its queues.
    fn expect_thread(&mut self, thread_id: &ThreadId) -> &mut Thread {
        self.get_mut_thread(thread_id).expect("scheduled thread should exist")
    }

    /// Creates a ready thread that starts in `trampoline`. Pending zombies are reclaimed once the new thread has its
    /// stack, so a failed creation leaves the scheduler untouched.
    pub fn insert_thread(&mut self, entry: ThreadEntry, trampoline: extern "C" fn()) -> Result<ThreadId, Fail> {
        let thread: Thread = Thread::new(self.stack_size, entry, trampoline)?;
        self.reap_zombies();

        // Keep room for every live thread in the run queues.
        let live: usize = self.threads.len() + 1;
        self.ready.reserve(live.saturating_sub(self.ready.len()));
        self.zombies.reserve(live.saturating_sub(self.zombies.len()));
        self.ids.reserve(1);

        let internal_id: InternalId = self.threads.insert(thread).into();
        let thread_id: ThreadId = self.ids.insert_with_new_id(internal_id);
        self.ready.enqueue(thread_id);
        trace!("insert_thread(): thread_id={:?}", thread_id);
        Ok(thread_id)
    }

    /// Takes the entry point of the current thread. Returns `None` once it has been taken.
    pub fn take_entry(&mut self) -> Option<ThreadEntry> {
        let current: ThreadId = self.current;
        self.expect_thread(&current).take_entry()
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn on_bootstrap(&self) -> bool {
        self.current == self.bootstrap
    }

    pub fn state(&self, thread_id: &ThreadId) -> Option<ThreadState> {
        self.get_thread(thread_id).map(|thread| thread.state())
    }

    /// Marks the current thread as blocked. The thread keeps running until the caller yields.
    pub fn block_current(&mut self) {
        let current: ThreadId = self.current;
        self.expect_thread(&current).set_state(ThreadState::Blocked);
    }

    /// Moves a blocked thread back to the ready queue.
    pub fn unblock(&mut self, thread_id: ThreadId) -> Result<(), Fail> {
        let thread: &mut Thread = match self.get_mut_thread(&thread_id) {
            Some(thread) => thread,
            None => {
                let cause: String = format!("no such thread (thread_id={:?})", thread_id);
                error!("unblock(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if thread.state() != ThreadState::Blocked {
            let cause: String = format!("thread is not blocked (thread_id={:?}, state={:?})", thread_id, thread.state());
            error!("unblock(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        thread.set_state(ThreadState::Ready);
        self.ready.enqueue(thread_id);
        Ok(())
    }

    /// Picks the next thread to run. A running current thread goes to the back of the ready queue first; a blocked or
    /// exited one does not.
    pub fn schedule(&mut self) -> Dispatch {
        let outgoing: ThreadId = self.current;
        let outgoing_state: ThreadState = self.expect_thread(&outgoing).state();

        if outgoing_state == ThreadState::Running {
            self.expect_thread(&outgoing).set_state(ThreadState::Ready);
            self.ready.enqueue(outgoing);
        }

        let incoming: ThreadId = match self.ready.dequeue() {
            Ok(thread_id) => thread_id,
            Err(_) => {
                return match outgoing_state {
                    ThreadState::Blocked | ThreadState::Zombie => Dispatch::Exhausted,
                    _ => {
                        self.expect_thread(&outgoing).set_state(ThreadState::Running);
                        Dispatch::Continue
                    },
                }
            },
        };

        if incoming == outgoing {
            self.expect_thread(&outgoing).set_state(ThreadState::Running);
            return Dispatch::Continue;
        }

        self.expect_thread(&incoming).set_state(ThreadState::Running);
        self.current = incoming;

        let from: *mut Context = self.expect_thread(&outgoing).context_mut();
        let to: *const Context = self.expect_thread(&incoming).context();
        Dispatch::Switch { from, to }
    }

    /// Retires the current thread and picks its successor. The retired thread is queued for reclamation unless it is
    /// the bootstrap thread. Returns the context to resume, if any thread is ready.
    pub fn retire_current(&mut self) -> Option<*const Context> {
        let outgoing: ThreadId = self.current;
        let thread: &mut Thread = self.expect_thread(&outgoing);
        thread.set_state(ThreadState::Zombie);
        if thread.has_stack() {
            self.zombies.enqueue(outgoing);
        }

        let incoming: ThreadId = self.ready.dequeue().ok()?;
        self.expect_thread(&incoming).set_state(ThreadState::Running);
        self.current = incoming;
        Some(self.expect_thread(&incoming).context())
    }

    /// Releases the stacks and control blocks of exited threads. Returns how many were reclaimed.
    pub fn reap_zombies(&mut self) -> usize {
        let mut reaped: usize = 0;
        while let Ok(thread_id) = self.zombies.dequeue() {
            // The current thread may be a zombie that is still running on its own stack.
            if thread_id == self.bootstrap || thread_id == self.current {
                self.zombies.enqueue(thread_id);
                break;
            }
            if let Some(internal_id) = self.ids.remove(&thread_id) {
                self.threads.remove(internal_id.into());
                reaped += 1;
            }
        }
        if reaped > 0 {
            trace!("reap_zombies(): reaped={:?}", reaped);
        }
        reaped
    }

    /// Releases every thread except the current one. Used when the process is about to terminate from a thread that
    /// cannot return to the bootstrap context.
    pub fn release_all_but_current(&mut self) {
        let current: ThreadId = self.current;
        while self.zombies.dequeue().is_ok() {}
        while self.ready.dequeue().is_ok() {}
        let internal_ids: Vec<usize> = self.threads.iter().map(|(key, _)| key).collect();
        for key in internal_ids {
            if self.ids.get(&current) != Some(InternalId::from(key)) {
                self.threads.remove(key);
            }
        }
    }

    /// Tears down the scheduler from the bootstrap context. Returns the number of threads that were still blocked
    /// and whose stacks were released without them ever running again.
    pub fn shutdown(mut self) -> usize {
        debug_assert_eq!(self.current, self.bootstrap);
        self.reap_zombies();
        let stranded: usize = self
            .threads
            .iter()
            .filter(|(_, thread)| thread.state() == ThreadState::Blocked)
            .count();
        while self.zombies.dequeue().is_ok() {}
        while self.ready.dequeue().is_ok() {}
        self.threads.clear();
        stranded
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            threads: self.threads.len(),
            ready: self.ready.len(),
            zombies: self.zombies.len(),
            blocked: self
                .threads
                .iter()
                .filter(|(_, thread)| thread.state() == ThreadState::Blocked)
                .count(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<usize> for InternalId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<InternalId> for usize {
    fn from(value: InternalId) -> Self {
        value.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
