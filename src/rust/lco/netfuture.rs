// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Net futures: an array of independent futures behind one address, typically one slot per participant. Slots are
//! set and read by index from any locality, which gives point-to-point rendezvous without a central reduction.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::{
        self,
        future::{
            self,
            Future,
        },
        Lco,
    },
    runtime::{
        address::GlobalAddress,
        fail::Fail,
    },
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

pub struct NetFuture {
    slots: Vec<Future>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl NetFuture {
    /// Creates `n` slots that hold up to `size` bytes each.
    pub fn new(n: usize, size: usize) -> Self {
        Self {
            slots: (0..n).map(|_| Future::new(size)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Future, Fail> {
        match self.slots.get(index) {
            Some(slot) => Ok(slot),
            None => {
                let cause: String = format!("no such slot (index={}, len={})", index, self.slots.len());
                error!("slot(): {}", &cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Lco for NetFuture {
    fn kind(&self) -> &'static str {
        "netfuture"
    }

    fn set(&self, _data: &[u8]) -> Result<(), Fail> {
        Err(lco::unsupported(self.kind(), "set"))
    }

    /// Blocks until every slot is set, then returns their values back to back.
    fn get(&self) -> Result<Vec<u8>, Fail> {
        let mut values: Vec<u8> = Vec::new();
        for slot in self.slots.iter() {
            values.extend_from_slice(&slot.get()?);
        }
        Ok(values)
    }

    fn wait(&self) -> Result<(), Fail> {
        self.slots.iter().try_for_each(Future::wait)
    }

    /// Resets every slot, or none if any slot has waiting threads.
    fn reset(&self) -> Result<(), Fail> {
        future::reset_all(&self.slots)
    }

    fn error(&self, fail: Fail) {
        for slot in self.slots.iter() {
            slot.error(fail.clone());
        }
    }

    fn set_at(&self, index: usize, data: &[u8]) -> Result<(), Fail> {
        self.slot(index)?.set(data)
    }

    fn get_at(&self, index: usize) -> Result<Vec<u8>, Fail> {
        self.slot(index)?.get()
    }

    fn wait_at(&self, index: usize) -> Result<(), Fail> {
        self.slot(index)?.wait()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates `n` slots of `size` bytes behind one address.
pub fn new_all(n: usize, size: usize) -> Result<GlobalAddress, Fail> {
    lco::alloc(Arc::new(NetFuture::new(n, size)))
}

/// Sets slot `index` of `base` to `data`. The LCO at `lsync` is set once `data` was copied and can be reused; the LCO
/// at `rsync` is set once the slot holds the value. Either may be null.
pub fn setat(
    base: GlobalAddress,
    index: usize,
    data: &[u8],
    lsync: GlobalAddress,
    rsync: GlobalAddress,
) -> Result<(), Fail> {
    let copy: Vec<u8> = data.to_vec();
    if !lsync.is_null() {
        lco::set(lsync, &[])?;
    }
    lco::set_at_with(base, index, &copy, rsync)
}

/// Blocks until slot `index` of `base` is set and returns its value.
pub fn getat(base: GlobalAddress, index: usize) -> Result<Vec<u8>, Fail> {
    lco::get_at(base, index)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
