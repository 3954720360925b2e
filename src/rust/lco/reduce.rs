// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::{
        self,
        user::{
            MonoidId,
            MonoidOp,
        },
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

struct ReduceState {
    remaining: usize,
    buffer: Vec<u8>,
    cvar: ConditionVariable,
}

/// Reduction over a fixed number of inputs. Inputs past that number are rejected until the next reset.
pub struct Reduce {
    inputs: usize,
    id: MonoidId,
    op: MonoidOp,
    cell: LcoCell<ReduceState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Reduce {
    pub fn new(inputs: usize, size: usize, id: MonoidId, op: MonoidOp) -> Self {
        let mut buffer: Vec<u8> = vec![0; size];
        id(&mut buffer);
        Self {
            inputs,
            id,
            op,
            cell: LcoCell::new(ReduceState {
                remaining: inputs,
                buffer,
                cvar: ConditionVariable::new(),
            }),
        }
    }

    fn with_result<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, Fail> {
        let mut state: LcoGuard<ReduceState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if state.remaining == 0 {
                return Ok(f(&state.buffer));
            }
            state.wait(|s| &mut s.cvar)?;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for Reduce {
    fn kind(&self) -> &'static str {
        "reduce"
    }

    fn set(&self, data: &[u8]) -> Result<(), Fail> {
        let mut state: LcoGuard<ReduceState> = self.cell.lock();
        state.cvar.status()?;
        if state.remaining == 0 {
            let cause: String = format!("reduction already has all {} inputs", self.inputs);
            error!("set(): {}", &cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        (self.op)(&mut state.buffer, data);
        state.remaining -= 1;
        if state.remaining == 0 {
            scheduler::signal_all(&mut state.cvar);
        }
        Ok(())
    }

    fn get(&self) -> Result<Vec<u8>, Fail> {
        self.with_result(|buffer| buffer.to_vec())
    }

    fn wait(&self) -> Result<(), Fail> {
        self.with_result(|_| ())
    }

    fn reset(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<ReduceState> = self.cell.lock();
        lco::ensure_idle(self.kind(), &state.cvar)?;
        (self.id)(&mut state.buffer);
        state.remaining = self.inputs;
        state.cvar.reset();
        Ok(())
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<ReduceState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates a reduction of `inputs` values into a `size`-byte buffer.
pub fn new(inputs: usize, size: usize, id: MonoidId, op: MonoidOp) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(Reduce::new(inputs, size, id, op)))
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
