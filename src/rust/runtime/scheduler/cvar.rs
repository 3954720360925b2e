// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    collections::intrusive_queue::IntrusiveQueue,
    fail::Fail,
    parcel::Parcel,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Queue of lightweight threads blocked on an LCO, plus a sticky error slot. Every operation requires the owning
/// LCO's lock to be held; the condition variable does not check this.
pub struct ConditionVariable {
    waiters: IntrusiveQueue<Parcel>,
    error: Option<Fail>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ConditionVariable {
    pub const fn new() -> Self {
        Self {
            waiters: IntrusiveQueue::new(),
            error: None,
        }
    }

    /// Clears the error slot. Resetting a condition variable that still has waiters is a usage error.
    pub fn reset(&mut self) {
        debug_assert!(
            self.waiters.is_empty(),
            "reset(): condition variable still has {} waiting threads",
            self.waiters.len()
        );
        self.error = None;
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns the posted error as a result.
    pub fn status(&self) -> Result<(), Fail> {
        match &self.error {
            Some(fail) => Err(fail.clone()),
            None => Ok(()),
        }
    }

    /// Posts `fail` (the first posted error sticks) and hands back every waiter so that the caller can resume them.
    pub(crate) fn set_error(&mut self, fail: Fail) -> IntrusiveQueue<Parcel> {
        if self.error.is_none() {
            self.error = Some(fail);
        }
        self.dequeue_all()
    }

    pub(crate) fn enqueue(&mut self, parcel: Box<Parcel>) {
        self.waiters.push_back(parcel);
    }

    pub(crate) fn dequeue_one(&mut self) -> Option<Box<Parcel>> {
        self.waiters.pop_front()
    }

    pub(crate) fn dequeue_all(&mut self) -> IntrusiveQueue<Parcel> {
        self.waiters.take_all()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConditionVariable {
    fn drop(&mut self) {
        if !self.waiters.is_empty() {
            warn!("drop(): abandoning {} waiting threads", self.waiters.len());
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
