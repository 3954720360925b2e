// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::thread,
};
use ::crossbeam_utils::Backoff;
use ::std::sync::atomic::{
    AtomicBool,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lock that protects one LCO's state. Critical sections are short and never block, so waiters spin instead of
/// suspending. Acquisitions from a lightweight thread are counted in its `lco_depth`.
pub struct LcoLock {
    locked: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LcoLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire this lock, spinning until it is free.
    pub fn lock(&self) {
        let backoff: Backoff = Backoff::new();
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Try to acquire this lock. Return [true] if successful
    pub fn try_lock(&self) -> bool {
        match self.locked.swap(true, Ordering::Acquire) {
            // The lock was previously locked.
            true => false,
            false => {
                thread::adjust_lco_depth(1);
                true
            },
        }
    }

    /// Release this lock.
    pub fn unlock(&self) -> Result<(), Fail> {
        self.release()?;
        thread::adjust_lco_depth(-1);
        Ok(())
    }

    /// Release this lock on behalf of a thread that already left the running context.
    pub(crate) fn release(&self) -> Result<(), Fail> {
        // Must return true as it was previously locked.
        match self.locked.swap(false, Ordering::Release) {
            true => Ok(()),
            false => {
                let cause: String = format!("lco lock was not locked");
                error!("release(): {}", &cause);
                Err(Fail::new(libc::EPERM, &cause))
            },
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LcoLock {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Tests
//======================================================================================================================
