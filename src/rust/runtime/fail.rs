// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EINVAL,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of the encoded error number that prefixes a serialized failure.
const ERRNO_BYTES: usize = ::std::mem::size_of::<i32>();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Encodes this failure so that it can travel as an opaque parcel payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::with_capacity(ERRNO_BYTES + self.cause.len());
        bytes.extend_from_slice(&self.errno.to_le_bytes());
        bytes.extend_from_slice(self.cause.as_bytes());
        bytes
    }

    /// Decodes a failure that was encoded with [Fail::to_bytes].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fail> {
        if bytes.len() < ERRNO_BYTES {
            let cause: String = format!("encoded failure is too short (len={})", bytes.len());
            error!("from_bytes(): {}", &cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        let mut errno: [u8; ERRNO_BYTES] = [0; ERRNO_BYTES];
        errno.copy_from_slice(&bytes[..ERRNO_BYTES]);
        Ok(Self {
            errno: i32::from_le_bytes(errno),
            cause: String::from_utf8_lossy(&bytes[ERRNO_BYTES..]).into_owned(),
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
