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
        and,
        future,
    },
    runtime::{
        self,
        parcel::Parcel,
        scheduler,
    },
    thread,
    ActionId,
    Fail,
    GlobalAddress,
    Runtime,
};
use ::std::{
    collections::HashSet,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Lifecycle
//======================================================================================================================

#[test]
fn runtime_restarts_after_run() -> Result<()> {
    let runtime: Runtime = common::runtime(4)?;
    for round in 0..3u64 {
        let output: Vec<u8> = runtime.run(move || Ok(encode_u64(round)))?;
        parallex::ensure_eq!(decode_u64(&output)?, round);
    }
    Ok(())
}

#[test]
fn exit_from_any_thread_ends_the_run() -> Result<()> {
    let runtime: Runtime = common::runtime(2)?;
    let output: Vec<u8> = runtime.run(|| {
        let never: GlobalAddress = future::new(8)?;
        runtime::spawn(|| runtime::exit(Ok(b"bye".to_vec())))?;
        // Parked forever; the run ends without it.
        lco::get(never)
    })?;
    parallex::ensure_eq!(output, b"bye".to_vec());
    Ok(())
}

//======================================================================================================================
// Work Distribution
//======================================================================================================================

#[test]
fn every_unit_runs_exactly_once() -> Result<()> {
    const UNITS: usize = 2000;
    let runtime: Runtime = common::runtime(4)?;
    let counts: Arc<Vec<AtomicU32>> = Arc::new((0..UNITS).map(|_| AtomicU32::new(0)).collect());

    let shared: Arc<Vec<AtomicU32>> = counts.clone();
    runtime.run(move || {
        let done: GlobalAddress = and::new(UNITS as u64)?;
        for i in 0..UNITS {
            let counts: Arc<Vec<AtomicU32>> = shared.clone();
            runtime::spawn_with_continuation(
                move || {
                    counts[i].fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                },
                done,
            )?;
        }
        lco::wait(done)?;
        lco::delete(done)?;
        Ok(Vec::new())
    })?;

    for (i, count) in counts.iter().enumerate() {
        if count.load(Ordering::SeqCst) != 1 {
            anyhow::bail!("unit {} ran {} times", i, count.load(Ordering::SeqCst));
        }
    }
    Ok(())
}

#[test]
fn yield_lets_other_threads_run() -> Result<()> {
    let runtime: Runtime = common::runtime(1)?;
    runtime.run(|| {
        let flag: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let done: GlobalAddress = and::new(2)?;

        let spinner: Arc<AtomicBool> = flag.clone();
        runtime::spawn_with_continuation(
            move || {
                while !spinner.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
                Ok(Vec::new())
            },
            done,
        )?;
        runtime::spawn_with_continuation(
            move || {
                flag.store(true, Ordering::SeqCst);
                Ok(Vec::new())
            },
            done,
        )?;
        lco::wait(done)?;
        Ok(Vec::new())
    })?;
    Ok(())
}

#[test]
fn reduced_worker_target_still_finishes() -> Result<()> {
    let runtime: Runtime = common::runtime(4)?;
    let output: Vec<u8> = runtime.run(|| {
        scheduler::set_target_threads(1)?;
        let results: Vec<GlobalAddress> = future::new_array(16, 8)?;
        for (i, result) in results.iter().enumerate() {
            runtime::spawn_with_continuation(move || Ok(encode_u64(i as u64 * 2)), *result)?;
        }
        let mut sum: u64 = 0;
        for value in lco::get_all(&results)? {
            sum += decode_u64(&value)?;
        }
        lco::delete_all(&results)?;
        scheduler::set_target_threads(scheduler::worker_count()?)?;
        Ok(encode_u64(sum))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 240);
    Ok(())
}

#[test]
fn threads_posted_to_a_deactivated_worker_still_run() -> Result<()> {
    const PINNED: usize = 3;
    let runtime: Runtime = common::runtime(PINNED + 1)?;
    let output: Vec<u8> = runtime.run(|| {
        scheduler::set_target_threads(1)?;
        let results: Vec<GlobalAddress> = future::new_array(PINNED, 8)?;
        for (i, result) in results.iter().enumerate() {
            let id: usize = i + 1;
            let parcel: Box<Parcel> = Parcel::from_closure(move || Ok(encode_u64(id as u64)))
                .with_continuation(*result, ActionId::LCO_SET);
            scheduler::spawn_at(parcel, id)?;
        }
        let mut sum: u64 = 0;
        for value in lco::get_all(&results)? {
            sum += decode_u64(&value)?;
        }
        lco::delete_all(&results)?;
        scheduler::set_target_threads(scheduler::worker_count()?)?;
        Ok(encode_u64(sum))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 6);
    Ok(())
}

//======================================================================================================================
// Thread Services
//======================================================================================================================

#[test]
fn thread_context_describes_running_thread() -> Result<()> {
    let runtime: Runtime = common::runtime(2)?;
    let workers: usize = runtime.worker_count();
    runtime.run(move || {
        let context: thread::ContextInfo = match thread::current_context() {
            Some(context) => context,
            None => return Err(Fail::new(libc::EINVAL, "main has no thread context")),
        };
        if context.worker >= workers || context.lco_depth != 0 {
            return Err(Fail::new(libc::EINVAL, "unexpected thread context"));
        }
        if !thread::can_alloca(1024) || thread::can_alloca(common::STACK_BYTES * 2) {
            return Err(Fail::new(libc::EINVAL, "unexpected stack headroom"));
        }
        Ok(Vec::new())
    })?;
    parallex::ensure_eq!(thread::current_context().is_none(), true);
    Ok(())
}

#[test]
fn tls_ids_are_unique_and_stable() -> Result<()> {
    const THREADS: usize = 32;
    let runtime: Runtime = common::runtime(4)?;
    let output: Vec<u8> = runtime.run(|| {
        let ids: Vec<GlobalAddress> = future::new_array(THREADS, 8)?;
        for id in ids.iter() {
            runtime::spawn_with_continuation(
                || {
                    let first: Option<u32> = thread::tls_id();
                    thread::yield_now();
                    match (first, thread::tls_id()) {
                        (Some(a), Some(b)) if a == b => Ok(encode_u64(a as u64)),
                        _ => Err(Fail::new(libc::EINVAL, "tls id changed")),
                    }
                },
                *id,
            )?;
        }
        let values: Vec<Vec<u8>> = lco::get_all(&ids)?;
        let unique: HashSet<Vec<u8>> = values.into_iter().collect();
        Ok(encode_u64(unique.len() as u64))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, THREADS as u64);
    Ok(())
}

#[test]
fn continue_value_is_sent_once() -> Result<()> {
    let runtime: Runtime = common::runtime(2)?;
    let output: Vec<u8> = runtime.run(|| {
        let result: GlobalAddress = future::new(8)?;
        runtime::spawn_with_continuation(
            || {
                thread::continue_value(b"early")?;
                if thread::continue_value(b"twice").is_ok() {
                    return Err(Fail::new(libc::EINVAL, "continuation sent twice"));
                }
                Ok(b"late".to_vec())
            },
            result,
        )?;
        lco::get(result)
    })?;
    parallex::ensure_eq!(output, b"early".to_vec());
    Ok(())
}

#[test]
fn panics_become_posted_errors() -> Result<()> {
    let runtime: Runtime = common::runtime(2)?;
    let output: Vec<u8> = runtime.run(|| {
        let result: GlobalAddress = future::new(8)?;
        runtime::spawn_with_continuation(|| panic!("boom"), result)?;
        match lco::get(result) {
            Ok(_) => Err(Fail::new(libc::EINVAL, "panic was not reported")),
            Err(e) => Ok(encode_u64(e.errno as u64)),
        }
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, libc::ECANCELED as u64);
    Ok(())
}

#[test]
fn signal_mask_follows_the_thread() -> Result<()> {
    let runtime: Runtime = common::runtime(2)?;
    runtime.run(|| {
        let mut set: libc::sigset_t = unsafe { ::std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGUSR1);
        }
        let old: libc::sigset_t = thread::sigmask(libc::SIG_BLOCK, &set)?;
        if unsafe { libc::sigismember(&old, libc::SIGUSR1) } == 1 {
            return Err(Fail::new(libc::EINVAL, "SIGUSR1 was blocked before"));
        }
        thread::yield_now();
        let mut current: libc::sigset_t = unsafe { ::std::mem::zeroed() };
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, ::std::ptr::null(), &mut current) };
        if unsafe { libc::sigismember(&current, libc::SIGUSR1) } != 1 {
            return Err(Fail::new(libc::EINVAL, "signal mask was lost across a yield"));
        }
        Ok(Vec::new())
    })?;
    Ok(())
}

#[test]
fn runtime_rejects_bad_configuration() -> Result<()> {
    let config: parallex::Config = parallex::Config::from_yaml_str("parallex:\n  worker_count: 0\n")?;
    match Runtime::new(&config) {
        Ok(_) => anyhow::bail!("zero workers should be rejected"),
        Err(e) => parallex::ensure_eq!(e.errno, libc::EINVAL),
    }
    Ok(())
}
