// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::common::{
    decode_u64,
    encode_u64,
};
use ::anyhow::Result;
use ::parallex::{
    lco::{
        self,
        future,
        netfuture,
    },
    runtime::{
        self,
        gas::SmpAddressSpace,
        network::{
            Loopback,
            Transport,
        },
    },
    ActionId,
    Fail,
    GlobalAddress,
    Runtime,
};
use ::std::{
    sync::Arc,
    thread::JoinHandle,
};

//======================================================================================================================
// Actions
//======================================================================================================================

fn square(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let x: u64 = decode_u64(payload)?;
    Ok(encode_u64(x * x))
}

/// Allocates a future at the locality that runs it and returns its address.
fn make_future(_: &[u8]) -> Result<Vec<u8>, Fail> {
    let addr: GlobalAddress = future::new(64)?;
    Ok(encode_u64(addr.into_raw()))
}

fn refuse(_: &[u8]) -> Result<Vec<u8>, Fail> {
    Err(Fail::new(libc::EACCES, "refused"))
}

struct Actions {
    square: ActionId,
    make_future: ActionId,
    refuse: ActionId,
}

/// Every locality registers the same actions in the same order.
fn register(runtime: &Runtime) -> Result<Actions, Fail> {
    Ok(Actions {
        square: runtime.register_action("square", square)?,
        make_future: runtime.register_action("make_future", make_future)?,
        refuse: runtime.register_action("refuse", refuse)?,
    })
}

//======================================================================================================================
// Helpers
//======================================================================================================================

fn locality_runtime(endpoint: Arc<Loopback>) -> Result<Runtime> {
    let gas: Arc<SmpAddressSpace> = Arc::new(SmpAddressSpace::new(endpoint.rank(), endpoint.ranks()));
    Ok(Runtime::with_services(&common::config(2)?, gas, endpoint)?)
}

/// Runs `main` at locality 0 while locality 1 serves. Returns the output of `main` and the stop code locality 1 saw.
fn run_pair<F>(main: F) -> Result<(Vec<u8>, u64)>
where
    F: FnOnce(Actions) -> Result<Vec<u8>, Fail> + Send + 'static,
{
    let mut fabric: Vec<Arc<Loopback>> = Loopback::fabric(2);
    let remote: Arc<Loopback> = fabric.remove(1);
    let local: Arc<Loopback> = fabric.remove(0);

    let server: JoinHandle<Result<u64, String>> = ::std::thread::spawn(move || {
        let runtime: Runtime = locality_runtime(remote).map_err(|e| e.to_string())?;
        register(&runtime).map_err(|e| e.to_string())?;
        runtime.serve().map_err(|e| e.to_string())
    });

    let runtime: Runtime = locality_runtime(local)?;
    let actions: Actions = register(&runtime)?;
    let output: Result<Vec<u8>, Fail> = runtime.run(move || main(actions));

    let code: u64 = match server.join() {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => anyhow::bail!("locality 1 failed: {}", e),
        Err(_) => anyhow::bail!("locality 1 panicked"),
    };
    Ok((output?, code))
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn remote_call_returns_result() -> Result<()> {
    let (output, code): (Vec<u8>, u64) = run_pair(|actions| {
        let remote: GlobalAddress = GlobalAddress::locality(1);
        runtime::call_sync(remote, actions.square, &encode_u64(12))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 144);
    parallex::ensure_eq!(code, 0);
    Ok(())
}

#[test]
fn remote_lco_set_and_get() -> Result<()> {
    let (output, _): (Vec<u8>, u64) = run_pair(|actions| {
        let bytes: Vec<u8> = runtime::call_sync(GlobalAddress::locality(1), actions.make_future, &[])?;
        let remote: GlobalAddress = GlobalAddress::from_raw(decode_u64(&bytes)?);
        if remote.rank() != Some(1) {
            return Err(Fail::new(libc::EINVAL, "future was not allocated remotely"));
        }

        let done: GlobalAddress = future::new(0)?;
        lco::set_with(remote, b"across", done)?;
        lco::wait(done)?;
        let value: Vec<u8> = lco::get(remote)?;
        lco::delete(remote)?;
        Ok(value)
    })?;
    parallex::ensure_eq!(output, b"across".to_vec());
    Ok(())
}

#[test]
fn remote_errors_propagate() -> Result<()> {
    let (output, _): (Vec<u8>, u64) = run_pair(|actions| {
        let refused: i32 = match runtime::call_sync(GlobalAddress::locality(1), actions.refuse, &[]) {
            Ok(_) => return Err(Fail::new(libc::EINVAL, "remote failure was lost")),
            Err(e) => e.errno,
        };

        let bytes: Vec<u8> = runtime::call_sync(GlobalAddress::locality(1), actions.make_future, &[])?;
        let remote: GlobalAddress = GlobalAddress::from_raw(decode_u64(&bytes)?);
        lco::error(remote, Fail::new(libc::EIO, "posted from locality 0"))?;
        let posted: i32 = match lco::wait(remote) {
            Ok(()) => return Err(Fail::new(libc::EINVAL, "remote error was lost")),
            Err(e) => e.errno,
        };
        Ok([encode_u64(refused as u64), encode_u64(posted as u64)].concat())
    })?;
    parallex::ensure_eq!(decode_u64(&output[..8])?, libc::EACCES as u64);
    parallex::ensure_eq!(decode_u64(&output[8..])?, libc::EIO as u64);
    Ok(())
}

#[test]
fn netfuture_slots_are_set_from_the_other_locality() -> Result<()> {
    let (output, _): (Vec<u8>, u64) = run_pair(|actions| {
        let base: GlobalAddress = netfuture::new_all(2, 8)?;
        let rsync: GlobalAddress = future::new(0)?;
        let remote: GlobalAddress = GlobalAddress::locality(1);

        // Slot 1 holds the square computed at locality 1.
        let square: Vec<u8> = runtime::call_sync(remote, actions.square, &encode_u64(9))?;
        netfuture::setat(base, 1, &square, GlobalAddress::NULL, rsync)?;
        netfuture::setat(base, 0, &encode_u64(1), GlobalAddress::NULL, GlobalAddress::NULL)?;
        lco::wait(rsync)?;
        let slots: Vec<u8> = lco::get(base)?;
        Ok(slots)
    })?;
    parallex::ensure_eq!(decode_u64(&output[..8])?, 1);
    parallex::ensure_eq!(decode_u64(&output[8..])?, 81);
    Ok(())
}
