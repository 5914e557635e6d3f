// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::context::{
        Context,
        Stack,
    },
};
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Entry point of a logical thread. Called once, through a mutable reference, so that the trampoline decides when
/// the allocation behind it is released.
pub type ThreadEntry = Box<dyn FnMut()>;

/// External identifier of a logical thread. Identifiers are never reused within a run.
#[derive(Eq, PartialEq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct ThreadId(u64);

/// Scheduling state of a logical thread.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// Thread control block.
pub struct Thread {
    /// Owned stack. The bootstrap thread runs on the stack of the OS thread and has none.
    stack: Option<Stack>,
    /// Saved execution state. Boxed so that its address survives moves of the thread table.
    context: Box<Context>,
    state: ThreadState,
    /// Code to run on first dispatch.
    entry: Option<ThreadEntry>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Thread {
    /// Creates the control block for the execution context that entered the scheduler.
    pub fn bootstrap() -> Self {
        Self {
            stack: None,
            context: Context::new(),
            state: ThreadState::Running,
            entry: None,
        }
    }

    /// Creates a ready thread that will start in `trampoline` on a fresh stack of `stack_size` bytes. The trampoline
    /// is expected to fetch `entry` through [Thread::take_entry].
    pub fn new(stack_size: usize, entry: ThreadEntry, trampoline: extern "C" fn()) -> Result<Self, Fail> {
        let stack: Stack = Stack::alloc(stack_size)?;
        let mut context: Box<Context> = Context::new();
        context.init(&stack, trampoline)?;
        Ok(Self {
            stack: Some(stack),
            context,
            state: ThreadState::Ready,
            entry: Some(entry),
        })
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Returns whether this thread owns a stack, i.e. is not the bootstrap thread.
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    pub fn take_entry(&mut self) -> Option<ThreadEntry> {
        self.entry.take()
    }

    pub fn context_mut(&mut self) -> *mut Context {
        &mut *self.context as *mut Context
    }

    pub fn context(&self) -> *const Context {
        &*self.context as *const Context
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for ThreadId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ThreadId> for u64 {
    fn from(value: ThreadId) -> Self {
        value.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
