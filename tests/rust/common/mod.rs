// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::parallex::{
    Config,
    Fail,
    Runtime,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Stack size used by test runtimes.
pub const STACK_BYTES: usize = 64 * 1024;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub fn config(workers: usize) -> Result<Config> {
    let yaml: String = format!(
        "parallex:\n  worker_count: {}\n  stack_bytes: {}\n",
        workers, STACK_BYTES
    );
    Ok(Config::from_yaml_str(&yaml)?)
}

/// Creates a single-locality runtime bound to the calling thread.
pub fn runtime(workers: usize) -> Result<Runtime> {
    Ok(Runtime::new(&config(workers)?)?)
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, Fail> {
    match <[u8; 8]>::try_from(bytes) {
        Ok(word) => Ok(u64::from_le_bytes(word)),
        Err(_) => Err(Fail::new(libc::EINVAL, "expected an 8-byte word")),
    }
}
