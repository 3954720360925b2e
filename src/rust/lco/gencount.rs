// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Generation counter: a repeating barrier. Every generation completes after `per_generation` sets, and the counter
//! then rearms for the next one. Threads wait for a specific generation to complete.
//!
//! The next few generations each get a dedicated wait queue, so completing a generation wakes exactly its own
//! waiters. Waiters further ahead share an overflow queue. It is woken once every `ninplace` generations, when the
//! dedicated queues cover a fresh window of generations, and its waiters either move to a dedicated queue or keep
//! waiting for the next window.
//!
//! Sets beyond the ones a generation needs count toward the next generation.

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
        limits,
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

struct GencountState {
    /// Number of completed generations.
    generation: u64,
    /// Sets still missing from the current generation.
    remaining: u64,
    /// Queue `g % inplace.len()` holds the waiters of generation `g`.
    inplace: Vec<ConditionVariable>,
    oflow: ConditionVariable,
    /// Holds the posted error.
    cvar: ConditionVariable,
}

pub struct Gencount {
    per_generation: u64,
    cell: LcoCell<GencountState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl GencountState {
    fn has_waiters(&self) -> bool {
        !self.oflow.is_empty() || self.inplace.iter().any(|cvar| !cvar.is_empty())
    }
}

impl Gencount {
    /// Creates a counter whose generations complete after `per_generation` sets each, and that keeps dedicated wait
    /// queues for `ninplace` generations.
    pub fn new(ninplace: usize, per_generation: u64) -> Self {
        let ninplace: usize = ninplace.max(1);
        Self {
            per_generation: per_generation.max(1),
            cell: LcoCell::new(GencountState {
                generation: 0,
                remaining: per_generation.max(1),
                inplace: (0..ninplace).map(|_| ConditionVariable::new()).collect(),
                oflow: ConditionVariable::new(),
                cvar: ConditionVariable::new(),
            }),
        }
    }

    /// Number of completed generations.
    pub fn generation(&self) -> u64 {
        self.cell.lock().generation
    }

    /// Counts one set toward the current generation.
    pub fn inc(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<GencountState> = self.cell.lock();
        state.cvar.status()?;
        state.remaining -= 1;
        if state.remaining > 0 {
            return Ok(());
        }

        let completed: u64 = state.generation;
        state.generation += 1;
        state.remaining = self.per_generation;
        trace!("inc(): generation {} completed", completed);

        let n: u64 = state.inplace.len() as u64;
        scheduler::signal_all(&mut state.inplace[(completed % n) as usize]);
        // Waiters only leave the overflow queue once a whole window of generations opened up.
        if state.generation % n == 0 {
            scheduler::signal_all(&mut state.oflow);
        }
        Ok(())
    }

    /// Blocks until generation `generation` completed.
    pub fn wait_for(&self, generation: u64) -> Result<(), Fail> {
        let mut state: LcoGuard<GencountState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if state.generation > generation {
                return Ok(());
            }
            let n: u64 = state.inplace.len() as u64;
            if generation - state.generation < n {
                state.wait(|s| &mut s.inplace[(generation % n) as usize])?;
            } else {
                state.wait(|s| &mut s.oflow)?;
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for Gencount {
    fn kind(&self) -> &'static str {
        "gencount"
    }

    fn set(&self, _data: &[u8]) -> Result<(), Fail> {
        self.inc()
    }

    /// Blocks until the current generation completes, then returns the number of completed generations.
    fn get(&self) -> Result<Vec<u8>, Fail> {
        let current: u64 = self.generation();
        self.wait_for(current)?;
        Ok((current + 1).to_le_bytes().to_vec())
    }

    fn wait(&self) -> Result<(), Fail> {
        let current: u64 = self.generation();
        self.wait_for(current)
    }

    fn reset(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<GencountState> = self.cell.lock();
        if state.has_waiters() {
            let cause: String = format!("cannot reset gencount with waiting threads");
            error!("reset(): {}", &cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        state.generation = 0;
        state.remaining = self.per_generation;
        state.cvar.reset();
        state.oflow.reset();
        state.inplace.iter_mut().for_each(ConditionVariable::reset);
        Ok(())
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<GencountState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail.clone());
        scheduler::signal_error(&mut state.oflow, fail.clone());
        for cvar in state.inplace.iter_mut() {
            scheduler::signal_error(cvar, fail.clone());
        }
    }

    fn wait_at(&self, generation: usize) -> Result<(), Fail> {
        self.wait_for(generation as u64)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates a counter with one set per generation.
pub fn new(ninplace: usize) -> Result<GlobalAddress, Fail> {
    new_with(ninplace, 1)
}

/// Allocates a counter whose generations complete after `per_generation` sets.
pub fn new_with(ninplace: usize, per_generation: u64) -> Result<GlobalAddress, Fail> {
    let ninplace: usize = if ninplace == 0 {
        limits::DEFAULT_GENERATIONS_INPLACE
    } else {
        ninplace
    };
    lco::alloc(Arc::new(Gencount::new(ninplace, per_generation)))
}

/// Counts one set toward the current generation of the counter at `addr`.
pub fn inc(addr: GlobalAddress) -> Result<(), Fail> {
    lco::set(addr, &[])
}

/// Blocks until generation `generation` of the counter at `addr` completed.
pub fn wait_for(addr: GlobalAddress, generation: u64) -> Result<(), Fail> {
    lco::wait_at(addr, generation as usize)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
