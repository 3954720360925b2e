// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    action::{
        ActionHandler,
        ActionId,
    },
    address::GlobalAddress,
    collections::intrusive_queue::IntrusivelyQueueable,
    fail::Fail,
    scheduler,
    scheduler::thread::Ustack,
    Locality,
};
use ::std::{
    fmt,
    ptr::NonNull,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Local work that runs as a lightweight thread without going through the action table.
pub type Thunk = Box<dyn FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static>;

/// A unit of work: an action applied to a target with a payload, plus an optional continuation that receives the
/// action's result. Once scheduled, a parcel carries the lightweight thread that executes it.
pub struct Parcel {
    action: ActionId,
    target: GlobalAddress,
    c_action: ActionId,
    c_target: GlobalAddress,
    payload: Vec<u8>,
    thunk: Option<Thunk>,
    pub(crate) ustack: Option<Box<Ustack>>,
    next: Option<NonNull<Parcel>>,
}

// A parcel and its stack are owned by exactly one queue or worker at a time.
unsafe impl Send for Parcel {}

/// The part of a parcel consumed when its lightweight thread starts.
pub(crate) struct Job {
    action: ActionId,
    thunk: Option<Thunk>,
    payload: Vec<u8>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Parcel {
    pub fn new(target: GlobalAddress, action: ActionId, payload: Vec<u8>) -> Box<Self> {
        Box::new(Self {
            action,
            target,
            c_action: ActionId::NULL,
            c_target: GlobalAddress::NULL,
            payload,
            thunk: None,
            ustack: None,
            next: None,
        })
    }

    /// Wraps a closure. Closure parcels run only on the locality that created them.
    pub fn from_closure<F>(f: F) -> Box<Self>
    where
        F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
    {
        let mut parcel: Box<Self> = Self::new(GlobalAddress::NULL, ActionId::NULL, Vec::new());
        parcel.thunk = Some(Box::new(f));
        parcel
    }

    /// Sends the result of this parcel's action to `c_target` through `c_action`. A null continuation action sets the
    /// target LCO.
    pub fn with_continuation(mut self: Box<Self>, c_target: GlobalAddress, c_action: ActionId) -> Box<Self> {
        self.c_target = c_target;
        self.c_action = if c_action.is_null() { ActionId::LCO_SET } else { c_action };
        self
    }

    pub fn action(&self) -> ActionId {
        self.action
    }

    pub fn target(&self) -> GlobalAddress {
        self.target
    }

    pub fn c_action(&self) -> ActionId {
        self.c_action
    }

    pub fn c_target(&self) -> GlobalAddress {
        self.c_target
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_closure(&self) -> bool {
        self.thunk.is_some()
    }

    /// Whether a lightweight thread was already attached to this parcel.
    pub fn is_started(&self) -> bool {
        self.ustack.is_some()
    }

    pub(crate) fn take_job(&mut self) -> Job {
        Job {
            action: self.action,
            thunk: self.thunk.take(),
            payload: ::std::mem::take(&mut self.payload),
        }
    }
}

impl Job {
    /// Runs the closure, or looks the action up in this locality's table and applies it to the payload.
    pub(crate) fn invoke(self) -> Result<Vec<u8>, Fail> {
        if let Some(thunk) = self.thunk {
            return thunk();
        }
        let here: Arc<Locality> = Locality::current()?;
        let handler: ActionHandler = match here.actions().get(self.action) {
            Some(handler) => handler,
            None => {
                let cause: String = format!("unknown action (id={:?})", self.action);
                error!("invoke(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        handler(&self.payload)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl IntrusivelyQueueable for Parcel {
    fn get_queue_next(&self) -> Option<NonNull<Self>> {
        self.next
    }

    fn set_queue_next(&mut self, element: Option<NonNull<Self>>) {
        self.next = element;
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("action", &self.action)
            .field("target", &self.target)
            .field("c_action", &self.c_action)
            .field("c_target", &self.c_target)
            .field("payload_len", &self.payload.len())
            .field("closure", &self.thunk.is_some())
            .field("started", &self.ustack.is_some())
            .finish()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Sends a parcel to the locality that owns its target. Parcels for this locality (or with a null target) become
/// lightweight threads here; others are handed to the transport.
pub fn send(parcel: Box<Parcel>) -> Result<(), Fail> {
    let here: Arc<Locality> = Locality::current()?;
    let owner: u32 = match parcel.target.rank() {
        None => here.rank(),
        Some(_) => here.gas().owner(parcel.target)?,
    };
    if owner == here.rank() {
        return scheduler::spawn(parcel);
    }
    if parcel.is_closure() {
        let cause: String = format!("closures cannot leave their locality (target={:?})", parcel.target);
        error!("send(): {}", &cause);
        return Err(Fail::new(libc::ENOTSUP, &cause));
    }
    trace!("send(): delivering {:?} to locality {}", parcel, owner);
    here.network().deliver(owner, parcel)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
