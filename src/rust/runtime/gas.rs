// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Global address space. LCOs live in the address space of the locality that allocated them, and every operation on
//! an LCO first pins its address to reach the local object.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::Lco,
    runtime::{
        address::GlobalAddress,
        fail::Fail,
    },
};
use ::slab::{
    Slab,
    VacantEntry,
};
use ::std::{
    ops::Deref,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of low key bits that hold the slab slot. The bits above hold the slot's generation.
const SLOT_BITS: u32 = 32;

const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

/// Generations wrap at 15 bits so that every key fits in the offset of a [GlobalAddress].
const GENERATION_MASK: u16 = (1 << 15) - 1;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Translation from global addresses to local objects.
pub trait AddressSpace: Send + Sync {
    /// Rank of this locality.
    fn here(&self) -> u32;

    /// Rank of the locality that owns `addr`.
    fn owner(&self, addr: GlobalAddress) -> Result<u32, Fail>;

    /// Stores `lco` in this locality and returns its address.
    fn alloc(&self, lco: Arc<dyn Lco>) -> Result<GlobalAddress, Fail>;

    /// Removes the object at `addr`. Pinned references stay valid until they are unpinned.
    fn free(&self, addr: GlobalAddress) -> Result<Arc<dyn Lco>, Fail>;

    /// Resolves `addr` to a local object and pins it. Fails if `addr` is not stored here.
    fn try_pin(&self, addr: GlobalAddress) -> Option<Arc<dyn Lco>>;

    fn unpin(&self, addr: GlobalAddress);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Pinned local object. Unpins on drop.
pub struct Pinned<'a> {
    gas: &'a dyn AddressSpace,
    addr: GlobalAddress,
    lco: Arc<dyn Lco>,
}

struct Entry {
    lco: Arc<dyn Lco>,
    generation: u16,
    pins: usize,
}

struct Objects {
    slab: Slab<Entry>,
    /// Generation of the next object stored in each slot. Bumped on free, so stale addresses never match.
    generations: Vec<u16>,
}

/// Address space of a locality whose objects are kept in a slab. Keys carry the generation of their slot.
pub struct SmpAddressSpace {
    rank: u32,
    ranks: u32,
    objects: Mutex<Objects>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<'a> Pinned<'a> {
    pub fn new(gas: &'a dyn AddressSpace, addr: GlobalAddress) -> Option<Self> {
        gas.try_pin(addr).map(|lco| Self { gas, addr, lco })
    }
}

impl SmpAddressSpace {
    pub fn new(rank: u32, ranks: u32) -> Self {
        Self {
            rank,
            ranks,
            objects: Mutex::new(Objects {
                slab: Slab::new(),
                generations: Vec::new(),
            }),
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.lock().slab.len()
    }

    fn lock(&self) -> MutexGuard<Objects> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Slot and generation of `addr` if it is owned here.
    fn local_key(&self, addr: GlobalAddress) -> Option<(usize, u16)> {
        match addr.rank() {
            Some(rank) if rank == self.rank => addr.key().map(|key| (key & SLOT_MASK, (key >> SLOT_BITS) as u16)),
            _ => None,
        }
    }
}

impl Objects {
    /// Live entry of the object at `slot`, if it still has `generation`.
    fn get_mut(&mut self, slot: usize, generation: u16) -> Option<&mut Entry> {
        self.slab.get_mut(slot).filter(|entry| entry.generation == generation)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<'a> Deref for Pinned<'a> {
    type Target = dyn Lco;

    fn deref(&self) -> &Self::Target {
        self.lco.as_ref()
    }
}

impl<'a> Drop for Pinned<'a> {
    fn drop(&mut self) {
        self.gas.unpin(self.addr);
    }
}

impl AddressSpace for SmpAddressSpace {
    fn here(&self) -> u32 {
        self.rank
    }

    fn owner(&self, addr: GlobalAddress) -> Result<u32, Fail> {
        match addr.rank() {
            Some(rank) if rank < self.ranks => Ok(rank),
            _ => {
                let cause: String = format!("address is not owned by any locality (addr={:?})", addr);
                error!("owner(): {}", &cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn alloc(&self, lco: Arc<dyn Lco>) -> Result<GlobalAddress, Fail> {
        let mut objects: MutexGuard<Objects> = self.lock();
        let Objects { slab, generations } = &mut *objects;
        let entry: VacantEntry<Entry> = slab.vacant_entry();
        let slot: usize = entry.key();
        if slot > SLOT_MASK {
            let cause: String = format!("address space exhausted (slot={})", slot);
            error!("alloc(): {}", &cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }
        if generations.len() <= slot {
            generations.resize(slot + 1, 0);
        }
        let generation: u16 = generations[slot];
        let addr: GlobalAddress = GlobalAddress::object(self.rank, ((generation as usize) << SLOT_BITS) | slot);
        trace!("alloc(): {} at {:?}", lco.kind(), addr);
        entry.insert(Entry {
            lco,
            generation,
            pins: 0,
        });
        Ok(addr)
    }

    fn free(&self, addr: GlobalAddress) -> Result<Arc<dyn Lco>, Fail> {
        let mut objects: MutexGuard<Objects> = self.lock();
        let live: Option<usize> = match self.local_key(addr) {
            Some((slot, generation)) => objects.get_mut(slot, generation).map(|_| slot),
            None => None,
        };
        match live.and_then(|slot| objects.slab.try_remove(slot).map(|entry| (slot, entry))) {
            Some((slot, entry)) => {
                objects.generations[slot] = (entry.generation + 1) & GENERATION_MASK;
                if entry.pins > 0 {
                    warn!("free(): {:?} is still pinned {} times", addr, entry.pins);
                }
                Ok(entry.lco)
            },
            None => {
                let cause: String = format!("no object at address (addr={:?})", addr);
                error!("free(): {}", &cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn try_pin(&self, addr: GlobalAddress) -> Option<Arc<dyn Lco>> {
        let (slot, generation): (usize, u16) = self.local_key(addr)?;
        let mut objects: MutexGuard<Objects> = self.lock();
        let entry: &mut Entry = objects.get_mut(slot, generation)?;
        entry.pins += 1;
        Some(entry.lco.clone())
    }

    fn unpin(&self, addr: GlobalAddress) {
        if let Some((slot, generation)) = self.local_key(addr) {
            if let Some(entry) = self.lock().get_mut(slot, generation) {
                entry.pins = entry.pins.saturating_sub(1);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
