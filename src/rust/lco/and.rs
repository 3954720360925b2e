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

struct AndState {
    remaining: u64,
    cvar: ConditionVariable,
}

/// Conjunction gate: releases its waiters once it has been set `inputs` times. It carries no value.
pub struct And {
    inputs: u64,
    cell: LcoCell<AndState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl And {
    pub fn new(inputs: u64) -> Self {
        Self {
            inputs,
            cell: LcoCell::new(AndState {
                remaining: inputs,
                cvar: ConditionVariable::new(),
            }),
        }
    }

    /// Counts `n` inputs at once.
    pub fn set_num(&self, n: u64) -> Result<(), Fail> {
        let mut state: LcoGuard<AndState> = self.cell.lock();
        state.cvar.status()?;
        if n > state.remaining {
            let cause: String = format!("too many inputs (n={}, remaining={})", n, state.remaining);
            error!("set_num(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        state.remaining -= n;
        if state.remaining == 0 && n > 0 {
            scheduler::signal_all(&mut state.cvar);
        }
        Ok(())
    }

    /// Inputs still missing.
    pub fn remaining(&self) -> u64 {
        self.cell.lock().remaining
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for And {
    fn kind(&self) -> &'static str {
        "and"
    }

    /// An empty payload counts one input. An 8-byte payload holds a count.
    fn set(&self, data: &[u8]) -> Result<(), Fail> {
        match <[u8; 8]>::try_from(data) {
            Ok(n) => self.set_num(u64::from_le_bytes(n)),
            Err(_) => self.set_num(1),
        }
    }

    fn get(&self) -> Result<Vec<u8>, Fail> {
        self.wait()?;
        Ok(Vec::new())
    }

    fn wait(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<AndState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if state.remaining == 0 {
                return Ok(());
            }
            state.wait(|s| &mut s.cvar)?;
        }
    }

    fn reset(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<AndState> = self.cell.lock();
        lco::ensure_idle(self.kind(), &state.cvar)?;
        state.remaining = self.inputs;
        state.cvar.reset();
        Ok(())
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<AndState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates a gate that opens after `inputs` sets.
pub fn new(inputs: u64) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(And::new(inputs)))
}

/// Counts `n` inputs of the gate at `addr`.
pub fn set_num(addr: GlobalAddress, n: u64) -> Result<(), Fail> {
    lco::set(addr, &n.to_le_bytes())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
