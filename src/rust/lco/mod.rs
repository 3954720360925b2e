// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Local Control Objects (LCOs). Every LCO keeps its state behind its own [lock::LcoLock] and parks blocked
//! lightweight threads on condition variables embedded in that state. Waiting is Mesa-style: a woken thread takes the
//! lock again and re-checks its condition before returning.
//!
//! LCOs are named by global addresses. The functions in this module pin the address when the LCO lives here and
//! forward the operation as a built-in action parcel to the owning locality otherwise.

pub mod alltoall;
pub mod and;
pub mod future;
pub mod gencount;
pub mod lock;
pub mod netfuture;
pub mod reduce;
pub mod user;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::lock::LcoLock,
    runtime::{
        self,
        action::ActionId,
        address::GlobalAddress,
        fail::Fail,
        gas::Pinned,
        parcel::{
            self,
            Parcel,
        },
        scheduler::{
            self,
            cvar::ConditionVariable,
            thread,
        },
        Locality,
    },
};
use ::std::{
    cell::UnsafeCell,
    ops::{
        Deref,
        DerefMut,
    },
    sync::Arc,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Operations every LCO variant provides. Blocking operations must be called from lightweight threads.
pub trait Lco: Send + Sync {
    /// Name of the variant.
    fn kind(&self) -> &'static str;

    /// Applies `data` to the LCO. Never blocks.
    fn set(&self, data: &[u8]) -> Result<(), Fail>;

    /// Blocks until the LCO is satisfied, then returns its value.
    fn get(&self) -> Result<Vec<u8>, Fail>;

    /// Blocks until the LCO is satisfied.
    fn wait(&self) -> Result<(), Fail>;

    /// Returns the LCO to its initial state. Fails with `EBUSY` while threads are blocked on it.
    fn reset(&self) -> Result<(), Fail>;

    /// Posts `fail` to every current and future waiter, until the next reset.
    fn error(&self, fail: Fail);

    fn set_at(&self, _index: usize, _data: &[u8]) -> Result<(), Fail> {
        Err(unsupported(self.kind(), "set_at"))
    }

    fn get_at(&self, _index: usize) -> Result<Vec<u8>, Fail> {
        Err(unsupported(self.kind(), "get_at"))
    }

    fn wait_at(&self, _index: usize) -> Result<(), Fail> {
        Err(unsupported(self.kind(), "wait_at"))
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// State of an LCO together with the lock that protects it.
pub struct LcoCell<S> {
    lock: LcoLock,
    state: UnsafeCell<S>,
}

// The state is only reached through an [LcoGuard], which holds the lock.
unsafe impl<S: Send> Send for LcoCell<S> {}
unsafe impl<S: Send> Sync for LcoCell<S> {}

/// Exclusive access to the state of an [LcoCell]. Unlocks on drop.
pub struct LcoGuard<'a, S> {
    cell: &'a LcoCell<S>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<S> LcoCell<S> {
    pub fn new(state: S) -> Self {
        Self {
            lock: LcoLock::new(),
            state: UnsafeCell::new(state),
        }
    }

    pub fn lock(&self) -> LcoGuard<'_, S> {
        self.lock.lock();
        LcoGuard { cell: self }
    }
}

impl<'a, S> LcoGuard<'a, S> {
    /// Parks the calling lightweight thread on the condition variable that `cvar` selects, releasing the lock while
    /// parked. Returns with the lock held again, or with the error posted to the condition variable.
    pub fn wait(&mut self, cvar: impl FnOnce(&mut S) -> &mut ConditionVariable) -> Result<(), Fail> {
        let cvar: *mut ConditionVariable = cvar(&mut **self);
        scheduler::wait(&self.cell.lock, cvar)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a, S> Deref for LcoGuard<'a, S> {
    type Target = S;

    fn deref(&self) -> &S {
        unsafe { &*self.cell.state.get() }
    }
}

impl<'a, S> DerefMut for LcoGuard<'a, S> {
    fn deref_mut(&mut self) -> &mut S {
        unsafe { &mut *self.cell.state.get() }
    }
}

impl<'a, S> Drop for LcoGuard<'a, S> {
    fn drop(&mut self) {
        if let Err(e) = self.cell.lock.unlock() {
            error!("drop(): {:?}", e);
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub(crate) fn unsupported(kind: &str, op: &str) -> Fail {
    let cause: String = format!("{} does not support {}()", kind, op);
    error!("{}(): {}", op, &cause);
    Fail::new(libc::ENOTSUP, &cause)
}

/// Fails with `EBUSY` if threads are blocked on `cvar`.
pub(crate) fn ensure_idle(kind: &str, cvar: &ConditionVariable) -> Result<(), Fail> {
    if !cvar.is_empty() {
        let cause: String = format!("cannot reset {} with {} waiting threads", kind, cvar.len());
        error!("reset(): {}", &cause);
        return Err(Fail::new(libc::EBUSY, &cause));
    }
    Ok(())
}

/// Stores `lco` in this locality's address space.
pub fn alloc(lco: Arc<dyn Lco>) -> Result<GlobalAddress, Fail> {
    Locality::current()?.gas().alloc(lco)
}

/// Where the LCO at an address lives.
enum Route<'a> {
    Local(Pinned<'a>),
    Remote(u32),
}

fn route<'a>(here: &'a Locality, addr: GlobalAddress) -> Result<Route<'a>, Fail> {
    if let Some(pinned) = Pinned::new(here.gas(), addr) {
        return Ok(Route::Local(pinned));
    }
    let owner: u32 = here.gas().owner(addr)?;
    if owner == here.rank() {
        let cause: String = format!("no LCO at address (addr={:?})", addr);
        error!("route(): {}", &cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    Ok(Route::Remote(owner))
}

/// Sends a built-in action to the remote owner of `addr` without waiting for it.
fn forward(
    owner: u32,
    addr: GlobalAddress,
    action: ActionId,
    payload: Vec<u8>,
    c_target: GlobalAddress,
) -> Result<(), Fail> {
    trace!("forward(): {:?} on {:?} to locality {}", action, addr, owner);
    parcel::send(Parcel::new(addr, action, payload).with_continuation(c_target, ActionId::LCO_SET))
}

/// Applies `data` to the LCO at `addr`.
pub fn set(addr: GlobalAddress, data: &[u8]) -> Result<(), Fail> {
    set_with(addr, data, GlobalAddress::NULL)
}

/// Applies `data` to the LCO at `addr`, then sets the LCO at `rsync` (unless it is null) once the update happened.
pub fn set_with(addr: GlobalAddress, data: &[u8], rsync: GlobalAddress) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => {
            lco.set(data)?;
            drop(lco);
            if !rsync.is_null() {
                set(rsync, &[])?;
            }
            Ok(())
        },
        Route::Remote(owner) => forward(owner, addr, ActionId::LCO_SET, data.to_vec(), rsync),
    };
    result
}

/// Blocks until the LCO at `addr` is satisfied and returns its value.
pub fn get(addr: GlobalAddress) -> Result<Vec<u8>, Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<Vec<u8>, Fail> = match route(&here, addr)? {
        Route::Local(lco) => lco.get(),
        Route::Remote(_) => runtime::call_sync(addr, ActionId::LCO_GET, &[]),
    };
    result
}

/// Blocks until the LCO at `addr` is satisfied.
pub fn wait(addr: GlobalAddress) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => lco.wait(),
        Route::Remote(_) => runtime::call_sync(addr, ActionId::LCO_WAIT, &[]).map(|_| ()),
    };
    result
}

/// Returns the LCO at `addr` to its initial state.
pub fn reset(addr: GlobalAddress) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => lco.reset(),
        Route::Remote(_) => runtime::call_sync(addr, ActionId::LCO_RESET, &[]).map(|_| ()),
    };
    result
}

/// Posts `fail` to the LCO at `addr`.
pub fn error(addr: GlobalAddress, fail: Fail) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => {
            lco.error(fail);
            Ok(())
        },
        Route::Remote(owner) => forward(owner, addr, ActionId::LCO_ERROR, fail.to_bytes(), GlobalAddress::NULL),
    };
    result
}

/// Removes the LCO at `addr` from the address space. Threads still blocked on it resume with `ECANCELED`.
pub fn delete(addr: GlobalAddress) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    if here.gas().owner(addr)? != here.rank() {
        return runtime::call_sync(addr, ActionId::LCO_DELETE, &[]).map(|_| ());
    }
    let lco: Arc<dyn Lco> = here.gas().free(addr)?;
    trace!("delete(): {} at {:?}", lco.kind(), addr);
    lco.error(Fail::new(libc::ECANCELED, "lco deleted"));
    Ok(())
}

/// Sets slot `index` of the LCO at `addr`.
pub fn set_at(addr: GlobalAddress, index: usize, data: &[u8]) -> Result<(), Fail> {
    set_at_with(addr, index, data, GlobalAddress::NULL)
}

/// Sets slot `index` of the LCO at `addr`, then sets the LCO at `rsync` (unless it is null).
pub fn set_at_with(addr: GlobalAddress, index: usize, data: &[u8], rsync: GlobalAddress) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => {
            lco.set_at(index, data)?;
            drop(lco);
            if !rsync.is_null() {
                set(rsync, &[])?;
            }
            Ok(())
        },
        Route::Remote(owner) => forward(owner, addr, ActionId::LCO_SET_AT, encode_indexed(index, data), rsync),
    };
    result
}

/// Blocks until slot `index` of the LCO at `addr` is satisfied and returns its value.
pub fn get_at(addr: GlobalAddress, index: usize) -> Result<Vec<u8>, Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<Vec<u8>, Fail> = match route(&here, addr)? {
        Route::Local(lco) => lco.get_at(index),
        Route::Remote(_) => runtime::call_sync(addr, ActionId::LCO_GET_AT, &encode_indexed(index, &[])),
    };
    result
}

/// Blocks until slot `index` of the LCO at `addr` is satisfied.
pub fn wait_at(addr: GlobalAddress, index: usize) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let result: Result<(), Fail> = match route(&here, addr)? {
        Route::Local(lco) => lco.wait_at(index),
        Route::Remote(_) => runtime::call_sync(addr, ActionId::LCO_WAIT_AT, &encode_indexed(index, &[])).map(|_| ()),
    };
    result
}

/// Gets every LCO in `addrs`, in order. Fails with the first error.
pub fn get_all(addrs: &[GlobalAddress]) -> Result<Vec<Vec<u8>>, Fail> {
    addrs.iter().map(|addr| get(*addr)).collect()
}

/// Waits for every LCO in `addrs`. Every LCO is waited for; the first error is returned.
pub fn wait_all(addrs: &[GlobalAddress]) -> Result<(), Fail> {
    let mut status: Result<(), Fail> = Ok(());
    for addr in addrs {
        if let Err(e) = wait(*addr) {
            if status.is_ok() {
                status = Err(e);
            }
        }
    }
    status
}

/// Deletes every LCO in `addrs`.
pub fn delete_all(addrs: &[GlobalAddress]) -> Result<(), Fail> {
    addrs.iter().try_for_each(|addr| delete(*addr))
}

/// Prefixes `data` with a slot index.
fn encode_indexed(index: usize, data: &[u8]) -> Vec<u8> {
    let mut bytes: Vec<u8> = Vec::with_capacity(8 + data.len());
    bytes.extend_from_slice(&(index as u64).to_le_bytes());
    bytes.extend_from_slice(data);
    bytes
}

fn decode_indexed(payload: &[u8]) -> Result<(usize, &[u8]), Fail> {
    match payload.get(..8).map(<[u8; 8]>::try_from) {
        Some(Ok(index)) => Ok((u64::from_le_bytes(index) as usize, &payload[8..])),
        _ => {
            let cause: String = format!("payload is too short for a slot index (len={})", payload.len());
            error!("decode_indexed(): {}", &cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

//======================================================================================================================
// Built-in Actions
//======================================================================================================================

// These run at the owner of the parcel's target, so the LCO is local.

pub(crate) fn action_set(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    set(thread::current_target(), payload)?;
    Ok(Vec::new())
}

pub(crate) fn action_set_at(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let (index, data): (usize, &[u8]) = decode_indexed(payload)?;
    set_at(thread::current_target(), index, data)?;
    Ok(Vec::new())
}

pub(crate) fn action_get(_: &[u8]) -> Result<Vec<u8>, Fail> {
    get(thread::current_target())
}

pub(crate) fn action_get_at(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let (index, _): (usize, &[u8]) = decode_indexed(payload)?;
    get_at(thread::current_target(), index)
}

pub(crate) fn action_wait(_: &[u8]) -> Result<Vec<u8>, Fail> {
    wait(thread::current_target())?;
    Ok(Vec::new())
}

pub(crate) fn action_wait_at(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let (index, _): (usize, &[u8]) = decode_indexed(payload)?;
    wait_at(thread::current_target(), index)?;
    Ok(Vec::new())
}

pub(crate) fn action_error(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    error(thread::current_target(), Fail::from_bytes(payload)?)?;
    Ok(Vec::new())
}

pub(crate) fn action_reset(_: &[u8]) -> Result<Vec<u8>, Fail> {
    reset(thread::current_target())?;
    Ok(Vec::new())
}

pub(crate) fn action_delete(_: &[u8]) -> Result<Vec<u8>, Fail> {
    delete(thread::current_target())?;
    Ok(Vec::new())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
