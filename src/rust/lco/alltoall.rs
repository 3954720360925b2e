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

struct AllToAllState {
    /// Contribution of every participant, once it arrived.
    rows: Vec<Option<Vec<u8>>>,
    arrived: usize,
    cvar: ConditionVariable,
}

/// All-to-all exchange among `inputs` participants. Each participant contributes `size` bytes, split into one chunk per
/// participant, and participant `id` collects chunk `id` of every contribution.
pub struct AllToAll {
    inputs: usize,
    size: usize,
    cell: LcoCell<AllToAllState>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl AllToAll {
    pub fn new(inputs: usize, size: usize) -> Result<Self, Fail> {
        if inputs == 0 || size % inputs != 0 {
            let cause: String = format!("size must split evenly among inputs (inputs={}, size={})", inputs, size);
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(Self {
            inputs,
            size,
            cell: LcoCell::new(AllToAllState {
                rows: vec![None; inputs],
                arrived: 0,
                cvar: ConditionVariable::new(),
            }),
        })
    }

    fn chunk(&self) -> usize {
        self.size / self.inputs
    }

    fn check_id(&self, id: usize) -> Result<(), Fail> {
        if id >= self.inputs {
            let cause: String = format!("no such participant (id={}, inputs={})", id, self.inputs);
            error!("check_id(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    /// Blocks until every participant contributed, then runs `f` on the contributions.
    fn with_rows<R>(&self, f: impl FnOnce(&[Option<Vec<u8>>]) -> R) -> Result<R, Fail> {
        let mut state: LcoGuard<AllToAllState> = self.cell.lock();
        loop {
            state.cvar.status()?;
            if state.arrived == self.inputs {
                return Ok(f(&state.rows));
            }
            state.wait(|s| &mut s.cvar)?;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for AllToAll {
    fn kind(&self) -> &'static str {
        "alltoall"
    }

    fn set(&self, _data: &[u8]) -> Result<(), Fail> {
        Err(lco::unsupported(self.kind(), "set"))
    }

    /// Blocks until every participant contributed, then returns all contributions in participant order.
    fn get(&self) -> Result<Vec<u8>, Fail> {
        self.with_rows(|rows| rows.iter().flatten().flatten().copied().collect())
    }

    fn wait(&self) -> Result<(), Fail> {
        self.with_rows(|_| ())
    }

    fn reset(&self) -> Result<(), Fail> {
        let mut state: LcoGuard<AllToAllState> = self.cell.lock();
        lco::ensure_idle(self.kind(), &state.cvar)?;
        state.rows.iter_mut().for_each(|row| *row = None);
        state.arrived = 0;
        state.cvar.reset();
        Ok(())
    }

    fn error(&self, fail: Fail) {
        let mut state: LcoGuard<AllToAllState> = self.cell.lock();
        scheduler::signal_error(&mut state.cvar, fail);
    }

    fn set_at(&self, id: usize, data: &[u8]) -> Result<(), Fail> {
        self.check_id(id)?;
        if data.len() != self.size {
            let cause: String = format!("contribution has the wrong size (len={}, size={})", data.len(), self.size);
            error!("set_at(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut state: LcoGuard<AllToAllState> = self.cell.lock();
        state.cvar.status()?;
        if state.rows[id].is_some() {
            let cause: String = format!("participant already contributed (id={})", id);
            error!("set_at(): {}", &cause);
            return Err(Fail::new(libc::EALREADY, &cause));
        }
        state.rows[id] = Some(data.to_vec());
        state.arrived += 1;
        if state.arrived == self.inputs {
            scheduler::signal_all(&mut state.cvar);
        }
        Ok(())
    }

    fn get_at(&self, id: usize) -> Result<Vec<u8>, Fail> {
        self.check_id(id)?;
        let chunk: usize = self.chunk();
        self.with_rows(|rows| {
            rows.iter()
                .flatten()
                .flat_map(|row| row[id * chunk..(id + 1) * chunk].iter().copied())
                .collect()
        })
    }

    fn wait_at(&self, id: usize) -> Result<(), Fail> {
        self.check_id(id)?;
        self.wait()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates an exchange among `inputs` participants that contribute `size` bytes each.
pub fn new(inputs: usize, size: usize) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(AllToAll::new(inputs, size)?))
}

/// Contributes `data` as participant `id`.
pub fn setid(addr: GlobalAddress, id: usize, data: &[u8]) -> Result<(), Fail> {
    lco::set_at(addr, id, data)
}

/// Blocks until every participant contributed, then returns the chunks addressed to participant `id`.
pub fn getid(addr: GlobalAddress, id: usize) -> Result<Vec<u8>, Fail> {
    lco::get_at(addr, id)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
