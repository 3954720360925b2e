// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::{
        self,
        Lco,
        LcoCell,
        LcoGuard,
    },
    runtime::{
        address::GlobalAddress,
        fail::Fail,
        scheduler::{
            self,
            cvar::ConditionVariable,
        },
    },
};
use ::std::{
    slice,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct FutureState {
    value: Option<Vec<u8>>,
    cvar: ConditionVariable,
}

/// Single-assignment value. Set once, then read by any number of threads until reset.
pub struct Future {
    /// Largest value the future accepts.
    size: usize,
    cell: LcoCell<FutureState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Future {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cell: LcoCell::new(FutureState {
                value: None,
                cvar: ConditionVariable::new(),
            }),
        }
    }

    /// Whether a value was set.
    pub fn is_set(&self) -> bool {
        self.cell.lock().value.is_some()
    }

    /// Blocks until the future holds a value, then runs `f` on it.
    fn with_value<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, Fail> {
        let mut state: LcoGuard<FutureState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if let Some(value) = state.value.as_deref() {
                return Ok(f(value));
            }
            state.wait(|s| &mut s.cvar)?;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for Future {
    fn kind(&self) -> &'static str {
        "future"
    }

    fn set(&self, data: &[u8]) -> Result<(), Fail> {
        if data.len() > self.size {
            let cause: String = format!("value does not fit (len={}, size={})", data.len(), self.size);
            error!("set(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut state: LcoGuard<FutureState> = self.cell.lock();
        state.cvar.status()?;
        if state.value.is_some() {
            let cause: String = format!("future was already set");
            error!("set(): {}", &cause);
            return Err(Fail::new(libc::EALREADY, &cause));
        }
        state.value = Some(data.to_vec());
        scheduler::signal_all(&mut state.cvar);
        Ok(())
    }

    fn get(&self) -> Result<Vec<u8>, Fail> {
        self.with_value(|value| value.to_vec())
    }

    fn wait(&self) -> Result<(), Fail> {
        self.with_value(|_| ())
    }

    fn reset(&self) -> Result<(), Fail> {
        reset_all(slice::from_ref(self))
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<FutureState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Resets every future in `futures`, or none of them if any has waiting threads. Futures are locked in order.
pub(crate) fn reset_all(futures: &[Future]) -> Result<(), Fail> {
    let mut states: Vec<LcoGuard<FutureState>> = futures.iter().map(|future| future.cell.lock()).collect();
    for state in states.iter() {
        lco::ensure_idle("future", &state.cvar)?;
    }
    for state in states.iter_mut() {
        state.value = None;
        state.cvar.reset();
    }
    Ok(())
}

/// Allocates a future that holds values of up to `size` bytes.
pub fn new(size: usize) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(Future::new(size)))
}

/// Allocates a future that holds values of any size.
pub fn new_unsized() -> Result<GlobalAddress, Fail> {
    new(usize::MAX)
}

/// Allocates `n` futures of `size` bytes.
pub fn new_array(n: usize, size: usize) -> Result<Vec<GlobalAddress>, Fail> {
    (0..n).map(|_| new(size)).collect()
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
