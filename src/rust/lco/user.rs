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
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Writes the identity value into a buffer.
pub type MonoidId = fn(&mut [u8]);

/// Folds an input into a buffer. Calls are serialized by the LCO's lock, in arrival order.
pub type MonoidOp = fn(&mut [u8], &[u8]);

/// Whether a buffer is final.
pub type Predicate = fn(&[u8]) -> bool;

struct UserState {
    buffer: Vec<u8>,
    cvar: ConditionVariable,
}

/// LCO whose value is built by a user-supplied monoid and that is satisfied once a user-supplied predicate holds. Sets
/// made after the predicate holds are still folded in, and the predicate is checked again.
pub struct User {
    id: MonoidId,
    op: MonoidOp,
    predicate: Predicate,
    cell: LcoCell<UserState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl User {
    pub fn new(size: usize, id: MonoidId, op: MonoidOp, predicate: Predicate) -> Self {
        let mut buffer: Vec<u8> = vec![0; size];
        id(&mut buffer);
        Self {
            id,
            op,
            predicate,
            cell: LcoCell::new(UserState {
                buffer,
                cvar: ConditionVariable::new(),
            }),
        }
    }

    fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, Fail> {
        let mut state: LcoGuard<UserState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if (self.predicate)(&state.buffer) {
                return Ok(f(&state.buffer));
            }
            state.wait(|s| &mut s.cvar)?;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for User {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn set(&self, data: &[u8]) -> Result<(), Fail> {
        let mut state: LcoGuard<UserState> = self.cell.lock();
        state.cvar.status()?;
        (self.op)(&mut state.buffer, data);
        if (self.predicate)(&state.buffer) {
            scheduler::signal_all(&mut state.cvar);
        }
        Ok(())
    }

    fn get(&self) -> Result<Vec<u8>, Fail> {
        self.with_buffer(|buffer| buffer.to_vec())
    }

    fn wait(&self) -> Result<(), Fail> {
        self.with_buffer(|_| ())
    }

    fn reset(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<UserState> = self.cell.lock();
        lco::ensure_idle(self.kind(), &state.cvar)?;
        (self.id)(&mut state.buffer);
        state.cvar.reset();
        Ok(())
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<UserState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates a user LCO with a `size`-byte buffer.
pub fn new(size: usize, id: MonoidId, op: MonoidOp, predicate: Predicate) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(User::new(size, id, op, predicate)))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
