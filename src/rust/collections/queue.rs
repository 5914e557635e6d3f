// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Decision returned by the visitor of [Queue::iterate].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Leave the item in the queue.
    Keep,
    /// Remove the item that was just visited.
    Delete,
}

/// A FIFO queue of handles. Items are compared by value, so handles must be unique for delete-by-identity to remove
/// the intended entry.
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: PartialEq> Queue<T> {
    pub fn new() -> Self {
        Self { items: VecDeque::new() }
    }

    /// Creates a queue that can hold `capacity` items without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Tears down the queue. Fails, leaving the queue untouched, if it still holds items.
    pub fn destroy(self) -> Result<(), (Fail, Self)> {
        if !self.items.is_empty() {
            let cause: String = format!("cannot destroy a non-empty queue (len={:?})", self.items.len());
            warn!("destroy(): {}", cause);
            return Err((Fail::new(libc::EBUSY, &cause), self));
        }
        Ok(())
    }

    /// Appends `item` to the back of the queue.
    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Removes the item at the front of the queue.
    pub fn dequeue(&mut self) -> Result<T, Fail> {
        self.items
            .pop_front()
            .ok_or_else(|| Fail::new(libc::EAGAIN, "cannot dequeue from an empty queue"))
    }

    /// Removes the item at the front of the queue and stores it in `slot`. On failure `slot` is not written.
    pub fn dequeue_into(&mut self, slot: &mut T) -> Result<(), Fail> {
        *slot = self.dequeue()?;
        Ok(())
    }

    /// Removes the oldest entry equal to `item`, preserving the order of the rest.
    pub fn delete(&mut self, item: &T) -> Result<(), Fail> {
        match self.items.iter().position(|x| x == item) {
            Some(index) => {
                self.items.remove(index);
                Ok(())
            },
            None => Err(Fail::new(libc::ENOENT, "item not found in queue")),
        }
    }

    /// Visits every item in FIFO order. The visitor may delete the item it was just given by returning
    /// [Visit::Delete]; the remaining items are still visited.
    pub fn iterate<F: FnMut(&mut T) -> Visit>(&mut self, mut visitor: F) {
        self.items.retain_mut(|item| visitor(item) == Visit::Keep);
    }

    /// Returns whether an entry equal to `item` is enqueued.
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Grows the backing storage so that `additional` more items fit without reallocating.
    pub fn reserve(&mut self, additional: usize) {
        self.items.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: PartialEq> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
