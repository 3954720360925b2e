// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handler of an action. It receives the parcel payload and returns the value sent to the parcel's continuation.
pub type ActionHandler = fn(&[u8]) -> Result<Vec<u8>, Fail>;

/// Identifier of a registered action. Identifiers are dense and assigned in registration order, so every locality
/// must register the same actions in the same order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ActionId(pub u16);

struct ActionEntry {
    name: String,
    handler: ActionHandler,
}

/// Registry of actions known to this locality.
pub struct ActionTable {
    entries: RwLock<Vec<ActionEntry>>,
    frozen: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ActionId {
    /// No action. As a continuation action, it selects the default ([ActionId::LCO_SET]).
    pub const NULL: ActionId = ActionId(0);
    pub const LCO_SET: ActionId = ActionId(1);
    pub const LCO_SET_AT: ActionId = ActionId(2);
    pub const LCO_GET: ActionId = ActionId(3);
    pub const LCO_GET_AT: ActionId = ActionId(4);
    pub const LCO_WAIT: ActionId = ActionId(5);
    pub const LCO_WAIT_AT: ActionId = ActionId(6);
    pub const LCO_ERROR: ActionId = ActionId(7);
    pub const LCO_RESET: ActionId = ActionId(8);
    pub const LCO_DELETE: ActionId = ActionId(9);
    pub const LOCALITY_STOP: ActionId = ActionId(10);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl ActionTable {
    /// Creates a table whose only entry is the null action.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(vec![ActionEntry {
                name: "null".to_string(),
                handler: null_action,
            }]),
            frozen: AtomicBool::new(false),
        }
    }

    /// Registers an action and returns its identifier. Registration closes once the runtime first runs.
    pub fn register(&self, name: &str, handler: ActionHandler) -> Result<ActionId, Fail> {
        if self.frozen.load(Ordering::Acquire) {
            let cause: String = format!("cannot register actions after the runtime started (name={})", name);
            error!("register(): {}", &cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        let mut entries: RwLockWriteGuard<Vec<ActionEntry>> = self.write();
        let id: u16 = match u16::try_from(entries.len()) {
            Ok(id) => id,
            Err(_) => {
                let cause: String = format!("too many actions (name={})", name);
                error!("register(): {}", &cause);
                return Err(Fail::new(libc::ENOSPC, &cause));
            },
        };
        entries.push(ActionEntry {
            name: name.to_string(),
            handler,
        });
        trace!("register(): name={}, id={}", name, id);
        Ok(ActionId(id))
    }

    /// Closes registration.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn get(&self, id: ActionId) -> Option<ActionHandler> {
        self.read().get(id.0 as usize).map(|entry| entry.handler)
    }

    pub fn name(&self, id: ActionId) -> Option<String> {
        self.read().get(id.0 as usize).map(|entry| entry.name.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<Vec<ActionEntry>> {
        match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<Vec<ActionEntry>> {
        match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.read().iter().map(|entry| entry.name.clone()).collect();
        f.debug_struct("ActionTable").field("actions", &names).finish()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn null_action(_: &[u8]) -> Result<Vec<u8>, Fail> {
    Ok(Vec::new())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
