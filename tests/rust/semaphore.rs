// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
};
use ::uthread::{
    ensure_eq,
    SemaphorePolicy,
    SharedSemaphore,
    ThreadId,
    ThreadState,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Seed of the randomized stress test, so that failures can be replayed.
const STRESS_SEED: u64 = 0x5eed_cafe;

//======================================================================================================================
// Helper Functions
//======================================================================================================================

type Trace = Rc<RefCell<Vec<&'static str>>>;

fn new_trace() -> Trace {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(trace: &Trace, event: &'static str) {
    trace.borrow_mut().push(event);
}

fn yield_now() {
    uthread::yield_now().expect("yield_now() should succeed");
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// One unit, two contenders: the unit is handed to the waiter and never counted twice.
#[test]
fn mutual_exclusion_hands_unit_to_waiter() -> Result<()> {
    let _lock = common::serialize();
    let sem: SharedSemaphore = SharedSemaphore::new(1);
    let trace: Trace = new_trace();
    let b_id: Rc<Cell<Option<ThreadId>>> = Rc::new(Cell::new(None));

    let (sem_, trace_, b_id_) = (sem.clone(), trace.clone(), b_id.clone());
    uthread::run(false, move || {
        let (mut sem_a, trace_a, b_id_a) = (sem_.clone(), trace_.clone(), b_id_.clone());
        uthread::create(move || {
            sem_a.down().expect("down() should succeed");
            record(&trace_a, "A down");
            if sem_a.count() == 0 {
                record(&trace_a, "count 0");
            }
            // Let B block on the semaphore.
            yield_now();
            sem_a.up().expect("up() should succeed");
            record(&trace_a, "A up");
            if let Some(b) = b_id_a.get() {
                if uthread::state(b) == Ok(Some(ThreadState::Ready)) {
                    record(&trace_a, "B ready");
                }
            }
            if sem_a.count() == 0 {
                record(&trace_a, "count 0");
            }
        })
        .expect("create() should succeed");

        let (mut sem_b, trace_b) = (sem_.clone(), trace_.clone());
        let b: ThreadId = uthread::create(move || {
            sem_b.down().expect("down() should succeed");
            record(&trace_b, "B down");
        })
        .expect("create() should succeed");
        b_id_.set(Some(b));
    })?;

    let trace: Vec<&'static str> = trace.borrow().clone();
    ensure_eq!(trace, vec!["A down", "count 0", "A up", "B ready", "count 0", "B down"]);
    ensure_eq!(sem.count(), 0);
    ensure_eq!(sem.waiters(), 0);
    Ok(())
}

/// Waiters queued in order A, B, C are served in that order, whatever the policy.
#[test]
fn waiters_are_served_in_fifo_order() -> Result<()> {
    let _lock = common::serialize();

    for policy in [SemaphorePolicy::HandOff, SemaphorePolicy::Increment] {
        let sem: SharedSemaphore = SharedSemaphore::with_policy(0, policy);
        let trace: Trace = new_trace();

        let (sem_, trace_) = (sem.clone(), trace.clone());
        uthread::run(false, move || {
            for name in ["A", "B", "C"] {
                let (mut sem, trace) = (sem_.clone(), trace_.clone());
                uthread::create(move || {
                    sem.down().expect("down() should succeed");
                    record(&trace, name);
                })
                .expect("create() should succeed");
            }

            let (mut sem, trace) = (sem_.clone(), trace_.clone());
            uthread::create(move || {
                while sem.waiters() < 3 {
                    yield_now();
                }
                for served in 1..=3 {
                    sem.up().expect("up() should succeed");
                    while trace.borrow().len() < served {
                        yield_now();
                    }
                }
            })
            .expect("create() should succeed");
        })?;

        let trace: Vec<&'static str> = trace.borrow().clone();
        ensure_eq!(trace, vec!["A", "B", "C"]);
        ensure_eq!(sem.count(), 0);
    }
    Ok(())
}

/// A woken waiter that finds the unit already taken goes back to sleep.
#[test]
fn woken_waiter_rechecks_count() -> Result<()> {
    let _lock = common::serialize();
    let sem: SharedSemaphore = SharedSemaphore::with_policy(0, SemaphorePolicy::Increment);
    let trace: Trace = new_trace();
    let a_id: Rc<Cell<Option<ThreadId>>> = Rc::new(Cell::new(None));

    let (sem_, trace_, a_id_) = (sem.clone(), trace.clone(), a_id.clone());
    uthread::run(false, move || {
        let (mut sem_a, trace_a) = (sem_.clone(), trace_.clone());
        let a: ThreadId = uthread::create(move || {
            sem_a.down().expect("down() should succeed");
            record(&trace_a, "A down");
        })
        .expect("create() should succeed");
        a_id_.set(Some(a));

        let mut sem_b = sem_.clone();
        uthread::create(move || {
            sem_b.up().expect("up() should succeed");
        })
        .expect("create() should succeed");

        // Scheduled right after B, before A gets to run again.
        let (mut sem_c, trace_c) = (sem_.clone(), trace_.clone());
        uthread::create(move || {
            sem_c.down().expect("down() should succeed");
            record(&trace_c, "C down");
        })
        .expect("create() should succeed");

        let (mut sem_d, trace_d, a_id_d) = (sem_.clone(), trace_.clone(), a_id_.clone());
        uthread::create(move || {
            let a: ThreadId = match a_id_d.get() {
                Some(a) => a,
                None => return,
            };
            while sem_d.waiters() == 0 || uthread::state(a) != Ok(Some(ThreadState::Blocked)) {
                yield_now();
            }
            record(&trace_d, "A blocked again");
            sem_d.up().expect("up() should succeed");
        })
        .expect("create() should succeed");
    })?;

    let trace: Vec<&'static str> = trace.borrow().clone();
    ensure_eq!(trace, vec!["C down", "A blocked again", "A down"]);
    ensure_eq!(sem.count(), 0);
    Ok(())
}

/// With hand-off, a thread calling down after up cannot steal the unit from the woken waiter.
#[test]
fn hand_off_prevents_stealing() -> Result<()> {
    let _lock = common::serialize();
    let sem: SharedSemaphore = SharedSemaphore::new(0);
    let trace: Trace = new_trace();

    let (sem_, trace_) = (sem.clone(), trace.clone());
    uthread::run(false, move || {
        let (mut sem_a, trace_a) = (sem_.clone(), trace_.clone());
        uthread::create(move || {
            sem_a.down().expect("down() should succeed");
            record(&trace_a, "A down");
            sem_a.up().expect("up() should succeed");
        })
        .expect("create() should succeed");

        let mut sem_b = sem_.clone();
        uthread::create(move || {
            sem_b.up().expect("up() should succeed");
        })
        .expect("create() should succeed");

        let (mut sem_c, trace_c) = (sem_.clone(), trace_.clone());
        uthread::create(move || {
            if sem_c.count() == 0 {
                record(&trace_c, "C finds nothing");
            }
            sem_c.down().expect("down() should succeed");
            record(&trace_c, "C down");
        })
        .expect("create() should succeed");
    })?;

    let trace: Vec<&'static str> = trace.borrow().clone();
    ensure_eq!(trace, vec!["C finds nothing", "A down", "C down"]);
    ensure_eq!(sem.count(), 0);
    Ok(())
}

/// A waiter woken by someone else is skipped: the unit stays in the count and the waiter picks it up on its own.
#[test]
fn waiter_woken_elsewhere_is_skipped() -> Result<()> {
    let _lock = common::serialize();
    let sem: SharedSemaphore = SharedSemaphore::new(0);
    let trace: Trace = new_trace();
    let a_id: Rc<Cell<Option<ThreadId>>> = Rc::new(Cell::new(None));

    let (sem_, trace_, a_id_) = (sem.clone(), trace.clone(), a_id.clone());
    uthread::run(false, move || {
        let (mut sem_a, trace_a) = (sem_.clone(), trace_.clone());
        let a: ThreadId = uthread::create(move || {
            sem_a.down().expect("down() should succeed");
            record(&trace_a, "A down");
        })
        .expect("create() should succeed");
        a_id_.set(Some(a));

        let (mut sem_b, trace_b, a_id_b) = (sem_.clone(), trace_.clone(), a_id_.clone());
        uthread::create(move || {
            let a: ThreadId = match a_id_b.get() {
                Some(a) => a,
                None => return,
            };
            while uthread::state(a) != Ok(Some(ThreadState::Blocked)) {
                yield_now();
            }
            uthread::unblock(a).expect("unblock() should succeed");
            sem_b.up().expect("up() should succeed");
            if sem_b.count() == 1 && sem_b.waiters() == 0 {
                record(&trace_b, "unit kept");
            }
        })
        .expect("create() should succeed");
    })?;

    let trace: Vec<&'static str> = trace.borrow().clone();
    ensure_eq!(trace, vec!["unit kept", "A down"]);
    ensure_eq!(sem.count(), 0);
    ensure_eq!(sem.waiters(), 0);
    Ok(())
}

#[test]
fn destroy_fails_while_threads_wait() -> Result<()> {
    let _lock = common::serialize();
    let sem: SharedSemaphore = SharedSemaphore::new(0);
    let errors: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));

    let (sem_, errors_) = (sem.clone(), errors.clone());
    uthread::run(false, move || {
        let mut sem_a = sem_.clone();
        uthread::create(move || {
            sem_a.down().expect("down() should succeed");
        })
        .expect("create() should succeed");

        let (mut sem_b, errors_b) = (sem_.clone(), errors_.clone());
        uthread::create(move || {
            if let Err(e) = sem_b.destroy() {
                errors_b.borrow_mut().push(e.errno);
            }
            sem_b.up().expect("up() should succeed");
            // Let A pick up the unit, then tear the semaphore down.
            yield_now();
            sem_b.destroy().expect("destroy() should succeed");
            if let Err(e) = sem_b.try_down() {
                errors_b.borrow_mut().push(e.errno);
            }
        })
        .expect("create() should succeed");
    })?;

    let errors: Vec<i32> = errors.borrow().clone();
    ensure_eq!(errors, vec![libc::EBUSY, libc::EBADF]);
    ensure_eq!(sem.waiters(), 0);
    Ok(())
}

/// Randomized interleavings of a semaphore guarding a pool of two units.
#[test]
fn random_interleavings_respect_capacity() -> Result<()> {
    let _lock = common::serialize();
    const UNITS: usize = 2;
    const NTHREADS: usize = 8;
    const ITERATIONS: usize = 20;

    let sem: SharedSemaphore = SharedSemaphore::new(UNITS);
    let inside: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let max_inside: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let acquisitions: Rc<Cell<usize>> = Rc::new(Cell::new(0));

    let (sem_, inside_, max_inside_, acquisitions_) =
        (sem.clone(), inside.clone(), max_inside.clone(), acquisitions.clone());
    uthread::run(false, move || {
        for worker in 0..NTHREADS {
            let (mut sem, inside, max_inside, acquisitions) =
                (sem_.clone(), inside_.clone(), max_inside_.clone(), acquisitions_.clone());
            uthread::create(move || {
                let mut rng: SmallRng = SmallRng::seed_from_u64(STRESS_SEED + worker as u64);
                for _ in 0..ITERATIONS {
                    if rng.gen_bool(0.5) {
                        sem.down().expect("down() should succeed");
                    } else {
                        while sem.try_down().is_err() {
                            yield_now();
                        }
                    }
                    inside.set(inside.get() + 1);
                    max_inside.set(max_inside.get().max(inside.get()));
                    acquisitions.set(acquisitions.get() + 1);

                    for _ in 0..rng.gen_range(0..3) {
                        yield_now();
                    }

                    inside.set(inside.get() - 1);
                    sem.up().expect("up() should succeed");

                    for _ in 0..rng.gen_range(0..3) {
                        yield_now();
                    }
                }
            })
            .expect("create() should succeed");
        }
    })?;

    ensure_eq!(acquisitions.get(), NTHREADS * ITERATIONS);
    ensure_eq!(max_inside.get() <= UNITS, true);
    ensure_eq!(inside.get(), 0);
    ensure_eq!(sem.count(), UNITS);
    ensure_eq!(sem.waiters(), 0);
    Ok(())
}
