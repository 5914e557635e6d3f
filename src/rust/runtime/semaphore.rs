// Copyright (c) Microsoft Corporation. All rights reserved.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::queue::Queue,
    runtime::{
        fail::Fail,
        preempt::PreemptGuard,
        scheduler::{
            self,
            with_scheduler,
            ThreadId,
            ThreadState,
        },
        SharedObject,
    },
};
use ::std::ops::{
    Deref,
    DerefMut,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// What [SharedSemaphore::up] does when threads are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SemaphorePolicy {
    /// Transfer the released unit to the oldest waiter without incrementing the count. A thread that calls down before
    /// the waiter gets to run cannot take the unit away from it.
    #[default]
    HandOff,
    /// Increment the count and wake the oldest waiter, which then competes for the unit like any other thread.
    Increment,
}

/// Counting semaphore for logical threads. There is no lock: the bookkeeping is only mutated with preemption
/// disabled, and only one logical thread runs at a time.
pub struct Semaphore {
    count: usize,
    policy: SemaphorePolicy,
    /// Threads waiting for a unit, oldest first. `None` once the semaphore is destroyed.
    waiters: Option<Queue<ThreadId>>,
    /// Woken waiters that were handed a unit and have not picked it up yet.
    grants: Queue<ThreadId>,
}

#[derive(Clone)]
pub struct SharedSemaphore(SharedObject<Semaphore>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedSemaphore {
    /// Creates a semaphore with `count` available units and the hand-off policy.
    pub fn new(count: usize) -> Self {
        Self::with_policy(count, SemaphorePolicy::default())
    }

    pub fn with_policy(count: usize, policy: SemaphorePolicy) -> Self {
        Self(SharedObject::new(Semaphore {
            count,
            policy,
            waiters: Some(Queue::new()),
            grants: Queue::new(),
        }))
    }

    /// Releases the semaphore. Fails if threads are still waiting on it. Any later operation fails with `EBADF`.
    pub fn destroy(&mut self) -> Result<(), Fail> {
        let _guard: PreemptGuard = PreemptGuard::new();
        let waiters: &Queue<ThreadId> = self.alive("destroy")?;
        if !waiters.is_empty() || !self.grants.is_empty() {
            let cause: String = format!(
                "threads are still waiting on semaphore (waiters={:?}, grants={:?})",
                waiters.len(),
                self.grants.len()
            );
            error!("destroy(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if let Some(waiters) = self.waiters.take() {
            waiters.destroy().map_err(|(e, _)| e)?;
        }
        self.count = 0;
        Ok(())
    }

    /// Takes one unit, suspending the calling thread until one is available.
    pub fn down(&mut self) -> Result<(), Fail> {
        let mut guard: PreemptGuard = PreemptGuard::new();
        self.alive("down")?;

        if self.count > 0 {
            self.count -= 1;
            return Ok(());
        }

        let me: ThreadId = with_scheduler(|scheduler| Ok(scheduler.current()))?;
        self.waiters_mut()?.enqueue(me);

        loop {
            with_scheduler(|scheduler| {
                scheduler.block_current();
                Ok(())
            })?;
            drop(guard);
            scheduler::yield_now()?;
            guard = PreemptGuard::new();

            // A unit was handed over by up().
            if self.grants.delete(&me).is_ok() {
                return Ok(());
            }

            // Being woken does not mean that a unit is left: another thread may have taken it first.
            if self.count > 0 {
                let _ = self.waiters_mut()?.delete(&me);
                self.count -= 1;
                return Ok(());
            }

            let waiters: &mut Queue<ThreadId> = self.waiters_mut()?;
            if !waiters.contains(&me) {
                waiters.enqueue(me);
            }
        }
    }

    /// Takes one unit if one is available right away. Fails with `EAGAIN` otherwise.
    pub fn try_down(&mut self) -> Result<(), Fail> {
        let _guard: PreemptGuard = PreemptGuard::new();
        self.alive("try_down")?;
        if self.count == 0 {
            return Err(Fail::new(libc::EAGAIN, "no unit is available"));
        }
        self.count -= 1;
        Ok(())
    }

    /// Releases one unit, waking the oldest waiter if there is one. Does not yield.
    pub fn up(&mut self) -> Result<(), Fail> {
        let _guard: PreemptGuard = PreemptGuard::new();
        let policy: SemaphorePolicy = self.policy;

        let woken: Option<ThreadId> = if self.alive("up")?.is_empty() {
            None
        } else {
            let waiters: &mut Queue<ThreadId> = self.waiters_mut()?;
            with_scheduler(|scheduler| {
                // A waiter that is not blocked anymore was woken some other way and re-checks the count by itself.
                while let Ok(thread_id) = waiters.dequeue() {
                    if scheduler.state(&thread_id) == Some(ThreadState::Blocked) {
                        scheduler.unblock(thread_id)?;
                        return Ok(Some(thread_id));
                    }
                    trace!("up(): skipping waiter that is not blocked (thread_id={:?})", thread_id);
                }
                Ok(None)
            })?
        };

        match (policy, woken) {
            (SemaphorePolicy::HandOff, Some(thread_id)) => self.grants.enqueue(thread_id),
            (SemaphorePolicy::HandOff, None) | (SemaphorePolicy::Increment, _) => self.count += 1,
        }
        Ok(())
    }

    /// Number of available units.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of threads waiting for a unit.
    pub fn waiters(&self) -> usize {
        self.waiters.as_ref().map_or(0, |waiters| waiters.len())
    }

    pub fn policy(&self) -> SemaphorePolicy {
        self.policy
    }

    fn alive(&self, op: &str) -> Result<&Queue<ThreadId>, Fail> {
        match self.waiters.as_ref() {
            Some(waiters) => Ok(waiters),
            None => {
                let cause: &str = "semaphore was destroyed";
                warn!("{}(): {}", op, cause);
                Err(Fail::new(libc::EBADF, cause))
            },
        }
    }

    fn waiters_mut(&mut self) -> Result<&mut Queue<ThreadId>, Fail> {
        self.waiters
            .as_mut()
            .ok_or_else(|| Fail::new(libc::EBADF, "semaphore was destroyed"))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedSemaphore {
    type Target = Semaphore;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedSemaphore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
