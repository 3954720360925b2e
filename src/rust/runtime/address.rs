// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::fmt;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of low bits that hold the offset of an address within its locality.
const OFFSET_BITS: u32 = 48;

/// Mask for the offset bits.
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A global address. The high bits hold the owning locality's rank plus one, so that the all-zero address is null.
/// The low bits hold the object key plus one, so that offset zero names the locality itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GlobalAddress(u64);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl GlobalAddress {
    /// The null address.
    pub const NULL: GlobalAddress = GlobalAddress(0);

    /// Address of a locality.
    pub const fn locality(rank: u32) -> Self {
        Self(((rank as u64) + 1) << OFFSET_BITS)
    }

    /// Address of the object stored under `key` at locality `rank`.
    pub const fn object(rank: u32, key: usize) -> Self {
        Self((((rank as u64) + 1) << OFFSET_BITS) | (((key as u64) + 1) & OFFSET_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Rank of the locality that owns this address, if it is not null.
    pub const fn rank(self) -> Option<u32> {
        match self.0 >> OFFSET_BITS {
            0 => None,
            r => Some((r - 1) as u32),
        }
    }

    /// Object key within the owning locality, if this address names an object.
    pub const fn key(self) -> Option<usize> {
        match self.0 & OFFSET_MASK {
            0 => None,
            k => Some((k - 1) as usize),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.rank(), self.key()) {
            (None, _) => write!(f, "NULL"),
            (Some(rank), None) => write!(f, "locality({})", rank),
            (Some(rank), Some(key)) => write!(f, "{}:{}", rank, key),
        }
    }
}

impl fmt::Display for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
