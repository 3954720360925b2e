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
        alltoall,
        and,
        future::{
            self,
            Future,
        },
        gencount,
        netfuture,
        reduce,
        user,
        Lco,
    },
    runtime,
    thread,
    Fail,
    GlobalAddress,
    Runtime,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

//======================================================================================================================
// Helpers
//======================================================================================================================

fn word(buffer: &[u8], i: usize) -> u64 {
    let mut bytes: [u8; 8] = [0; 8];
    bytes.copy_from_slice(&buffer[i * 8..(i + 1) * 8]);
    u64::from_le_bytes(bytes)
}

fn zero(buffer: &mut [u8]) {
    buffer.fill(0);
}

/// Buffer layout: [sum, count].
fn sum_and_count(buffer: &mut [u8], input: &[u8]) {
    let sum: u64 = word(buffer, 0) + word(input, 0);
    let count: u64 = word(buffer, 1) + 1;
    buffer[..8].copy_from_slice(&sum.to_le_bytes());
    buffer[8..16].copy_from_slice(&count.to_le_bytes());
}

fn eight_inputs(buffer: &[u8]) -> bool {
    word(buffer, 1) == 8
}

fn add(buffer: &mut [u8], input: &[u8]) {
    let sum: u64 = word(buffer, 0) + word(input, 0);
    buffer.copy_from_slice(&sum.to_le_bytes());
}

/// Runs `main` on a fresh runtime and returns its output.
fn run<F>(workers: usize, main: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
{
    let runtime: Runtime = common::runtime(workers)?;
    Ok(runtime.run(main)?)
}

//======================================================================================================================
// And Gates
//======================================================================================================================

#[test]
fn and_gate_releases_waiter_after_all_sets() -> Result<()> {
    let sets: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let observed: Arc<AtomicUsize> = sets.clone();
    let output: Vec<u8> = run(4, move || {
        let gate: GlobalAddress = and::new(3)?;
        let result: GlobalAddress = future::new(8)?;

        let seen: Arc<AtomicUsize> = observed.clone();
        runtime::spawn_with_continuation(
            move || {
                let value: Vec<u8> = lco::get(gate)?;
                if !value.is_empty() {
                    return Err(Fail::new(libc::EINVAL, "and gates carry no value"));
                }
                Ok(encode_u64(seen.load(Ordering::SeqCst) as u64))
            },
            result,
        )?;
        for _ in 0..3 {
            let sets: Arc<AtomicUsize> = observed.clone();
            runtime::spawn(move || {
                sets.fetch_add(1, Ordering::SeqCst);
                lco::set(gate, &[])?;
                Ok(Vec::new())
            })?;
        }
        let value: Vec<u8> = lco::get(result)?;
        lco::delete_all(&[gate, result])?;
        Ok(value)
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 3);
    parallex::ensure_eq!(sets.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn and_gate_without_inputs_is_already_released() -> Result<()> {
    let output: Vec<u8> = run(2, || {
        let gate: GlobalAddress = and::new(0)?;
        lco::wait(gate)?;
        let value: Vec<u8> = lco::get(gate)?;
        lco::delete(gate)?;
        Ok(value)
    })?;
    parallex::ensure_eq!(output, Vec::<u8>::new());
    Ok(())
}

#[test]
fn and_gate_rejects_sets_past_zero() -> Result<()> {
    let output: Vec<u8> = run(2, || {
        let gate: GlobalAddress = and::new(1)?;
        lco::set(gate, &[])?;
        lco::wait(gate)?;
        match lco::set(gate, &[]) {
            Ok(()) => Err(Fail::new(libc::EINVAL, "gate accepted an extra set")),
            Err(e) => Ok(encode_u64(e.errno as u64)),
        }
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, libc::EINVAL as u64);
    Ok(())
}

//======================================================================================================================
// Futures
//======================================================================================================================

#[test]
fn future_value_reaches_every_getter() -> Result<()> {
    const GETTERS: u64 = 24;
    let output: Vec<u8> = run(4, || {
        let value: GlobalAddress = future::new(16)?;
        let done: GlobalAddress = and::new(GETTERS)?;
        // Half of the getters start before the value is set.
        for _ in 0..GETTERS / 2 {
            runtime::spawn_with_continuation(move || expect_value(value), done)?;
        }
        runtime::spawn(move || {
            lco::set(value, b"sixteen bytes!!!")?;
            Ok(Vec::new())
        })?;
        for _ in 0..GETTERS / 2 {
            runtime::spawn_with_continuation(move || expect_value(value), done)?;
        }
        lco::wait(done)?;
        lco::get(value)
    })?;
    parallex::ensure_eq!(output, b"sixteen bytes!!!".to_vec());
    Ok(())
}

fn expect_value(value: GlobalAddress) -> Result<Vec<u8>, Fail> {
    match lco::get(value)?.as_slice() {
        b"sixteen bytes!!!" => Ok(Vec::new()),
        _ => Err(Fail::new(libc::EINVAL, "getter saw a different value")),
    }
}

#[test]
fn reset_with_waiter_is_refused() -> Result<()> {
    // One worker: the waiter parks before main resumes from its yield.
    let output: Vec<u8> = run(1, || {
        let value: GlobalAddress = future::new(8)?;
        let result: GlobalAddress = future::new(8)?;
        runtime::spawn_with_continuation(move || lco::get(value), result)?;
        thread::yield_now();

        let errno: i32 = match lco::reset(value) {
            Ok(()) => return Err(Fail::new(libc::EINVAL, "reset dropped a waiter")),
            Err(e) => e.errno,
        };
        lco::set(value, &encode_u64(5))?;
        let got: u64 = decode_u64(&lco::get(result)?)?;
        lco::reset(value)?;
        Ok([encode_u64(errno as u64), encode_u64(got)].concat())
    })?;
    parallex::ensure_eq!(word(&output, 0), libc::EBUSY as u64);
    parallex::ensure_eq!(word(&output, 1), 5);
    Ok(())
}

#[test]
fn set_from_an_os_thread_resumes_the_waiter() -> Result<()> {
    let output: Vec<u8> = run(2, || {
        let value: Arc<Future> = Arc::new(Future::new(8));
        let setter: Arc<Future> = value.clone();
        // Gives the waiter time to park before the value arrives.
        let handle: JoinHandle<Result<(), Fail>> = ::std::thread::spawn(move || {
            ::std::thread::sleep(Duration::from_millis(50));
            setter.set(b"outside")
        });
        let got: Vec<u8> = value.get()?;
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(Fail::new(libc::EIO, "setter thread panicked")),
        }
        Ok(got)
    })?;
    parallex::ensure_eq!(output, b"outside".to_vec());
    Ok(())
}

#[test]
fn posted_error_is_sticky_until_reset() -> Result<()> {
    run(2, || {
        let value: GlobalAddress = future::new(8)?;
        let first: GlobalAddress = future::new(8)?;
        runtime::spawn_with_continuation(move || lco::get(value), first)?;
        lco::error(value, Fail::new(libc::EIO, "producer failed"))?;

        for result in [lco::get(first), lco::get(value), lco::wait(value).map(|_| Vec::new())] {
            match result {
                Err(e) if e.errno == libc::EIO => {},
                _ => return Err(Fail::new(libc::EINVAL, "error was not sticky")),
            }
        }
        lco::reset(value)?;
        lco::set(value, b"ok")?;
        lco::get(value)
    })?;
    Ok(())
}

#[test]
fn delete_cancels_waiters() -> Result<()> {
    let output: Vec<u8> = run(1, || {
        let value: GlobalAddress = future::new(8)?;
        let result: GlobalAddress = future::new(8)?;
        runtime::spawn_with_continuation(move || lco::get(value), result)?;
        thread::yield_now();
        lco::delete(value)?;
        if lco::get(value).is_ok() {
            return Err(Fail::new(libc::EINVAL, "deleted LCO is still reachable"));
        }
        match lco::get(result) {
            Ok(_) => Err(Fail::new(libc::EINVAL, "waiter was not cancelled")),
            Err(e) => Ok(encode_u64(e.errno as u64)),
        }
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, libc::ECANCELED as u64);
    Ok(())
}

#[test]
fn stale_address_does_not_reach_a_new_object() -> Result<()> {
    let output: Vec<u8> = run(1, || {
        let stale: GlobalAddress = future::new(8)?;
        lco::delete(stale)?;
        let fresh: GlobalAddress = future::new(8)?;
        if fresh == stale {
            return Err(Fail::new(libc::EINVAL, "a deleted address was handed out again"));
        }

        let errno: i32 = match lco::set(stale, b"stale") {
            Ok(()) => return Err(Fail::new(libc::EINVAL, "stale address reached an object")),
            Err(e) => e.errno,
        };
        if lco::delete(stale).is_ok() {
            return Err(Fail::new(libc::EINVAL, "stale address deleted an object"));
        }
        lco::set(fresh, b"fresh")?;
        let value: Vec<u8> = lco::get(fresh)?;
        lco::delete(fresh)?;
        Ok([encode_u64(errno as u64), value].concat())
    })?;
    parallex::ensure_eq!(word(&output, 0), libc::EINVAL as u64);
    parallex::ensure_eq!(&output[8..], b"fresh");
    Ok(())
}

//======================================================================================================================
// Generation Counters
//======================================================================================================================

#[test]
fn gencount_wakes_only_the_completed_generation() -> Result<()> {
    let output: Vec<u8> = run(4, || {
        let counter: GlobalAddress = gencount::new(4)?;
        let first: GlobalAddress = future::new(0)?;
        let second: GlobalAddress = future::new(0)?;
        let second_released: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

        runtime::spawn_with_continuation(
            move || {
                gencount::wait_for(counter, 0)?;
                Ok(Vec::new())
            },
            first,
        )?;
        let released: Arc<AtomicBool> = second_released.clone();
        runtime::spawn_with_continuation(
            move || {
                gencount::wait_for(counter, 1)?;
                released.store(true, Ordering::SeqCst);
                Ok(Vec::new())
            },
            second,
        )?;

        gencount::inc(counter)?;
        lco::wait(first)?;
        if second_released.load(Ordering::SeqCst) {
            return Err(Fail::new(libc::EINVAL, "generation 1 waiter released by generation 0"));
        }
        gencount::inc(counter)?;
        lco::wait(second)?;
        Ok(encode_u64(second_released.load(Ordering::SeqCst) as u64))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 1);
    Ok(())
}

#[test]
fn gencount_overflow_waiters_are_released_in_turn() -> Result<()> {
    run(2, || {
        let counter: GlobalAddress = gencount::new(1)?;
        let done: GlobalAddress = and::new(3)?;
        for generation in 0..3u64 {
            runtime::spawn_with_continuation(
                move || {
                    gencount::wait_for(counter, generation)?;
                    Ok(Vec::new())
                },
                done,
            )?;
        }
        for _ in 0..3 {
            gencount::inc(counter)?;
        }
        lco::wait(done)?;
        Ok(Vec::new())
    })?;
    Ok(())
}

#[test]
fn gencount_overflow_waiters_cross_several_windows() -> Result<()> {
    const GENERATIONS: u64 = 7;
    // One worker: every waiter parks before main resumes from its yield.
    run(1, || {
        let counter: GlobalAddress = gencount::new(2)?;
        let done: GlobalAddress = and::new(GENERATIONS)?;
        for generation in 0..GENERATIONS {
            runtime::spawn_with_continuation(
                move || {
                    gencount::wait_for(counter, generation)?;
                    Ok(Vec::new())
                },
                done,
            )?;
        }
        thread::yield_now();
        for _ in 0..GENERATIONS {
            gencount::inc(counter)?;
        }
        lco::wait(done)?;
        lco::delete_all(&[counter, done])?;
        Ok(Vec::new())
    })?;
    Ok(())
}

//======================================================================================================================
// Reductions
//======================================================================================================================

#[test]
fn user_lco_releases_with_the_full_sum() -> Result<()> {
    let output: Vec<u8> = run(4, || {
        let sum: GlobalAddress = user::new(16, zero, sum_and_count, eight_inputs)?;
        let seen: GlobalAddress = and::new(2)?;
        for _ in 0..2 {
            runtime::spawn_with_continuation(
                move || {
                    let buffer: Vec<u8> = lco::get(sum)?;
                    match (word(&buffer, 0), word(&buffer, 1)) {
                        (36, 8) => Ok(Vec::new()),
                        _ => Err(Fail::new(libc::EINVAL, "waiter saw a partial sum")),
                    }
                },
                seen,
            )?;
        }
        for v in 1..=8u64 {
            runtime::spawn(move || {
                lco::set(sum, &encode_u64(v))?;
                Ok(Vec::new())
            })?;
        }
        lco::wait(seen)?;
        lco::get(sum)
    })?;
    parallex::ensure_eq!(word(&output, 0), 36);
    parallex::ensure_eq!(word(&output, 1), 8);
    Ok(())
}

#[test]
fn reduce_collects_a_fixed_number_of_inputs() -> Result<()> {
    let output: Vec<u8> = run(4, || {
        let total: GlobalAddress = reduce::new(10, 8, zero, add)?;
        for v in 0..10u64 {
            runtime::spawn_with_continuation(move || Ok(encode_u64(v)), total)?;
        }
        let value: Vec<u8> = lco::get(total)?;
        if lco::set(total, &encode_u64(1)).is_ok() {
            return Err(Fail::new(libc::EINVAL, "reduction accepted an extra input"));
        }
        Ok(value)
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 45);
    Ok(())
}

//======================================================================================================================
// Collectives
//======================================================================================================================

#[test]
fn netfuture_slots_with_completion_lcos() -> Result<()> {
    const SLOTS: usize = 4;
    let output: Vec<u8> = run(4, || {
        let base: GlobalAddress = netfuture::new_all(SLOTS, 8)?;
        let lsyncs: Vec<GlobalAddress> = future::new_array(SLOTS, 0)?;
        let rsyncs: Vec<GlobalAddress> = future::new_array(SLOTS, 0)?;
        for i in 0..SLOTS {
            let (lsync, rsync): (GlobalAddress, GlobalAddress) = (lsyncs[i], rsyncs[i]);
            runtime::spawn(move || {
                netfuture::setat(base, i, &encode_u64(i as u64 * 10), lsync, rsync)?;
                Ok(Vec::new())
            })?;
        }
        lco::wait_all(&lsyncs)?;
        lco::wait_all(&rsyncs)?;
        let mut sum: u64 = 0;
        for i in (0..SLOTS).rev() {
            sum += decode_u64(&netfuture::getat(base, i)?)?;
        }
        Ok(encode_u64(sum))
    })?;
    parallex::ensure_eq!(decode_u64(&output)?, 60);
    Ok(())
}

#[test]
fn refused_netfuture_reset_changes_no_slot() -> Result<()> {
    // One worker: the waiter on slot 1 parks before main resumes from its yield.
    let output: Vec<u8> = run(1, || {
        let base: GlobalAddress = netfuture::new_all(2, 8)?;
        let result: GlobalAddress = future::new(8)?;
        netfuture::setat(base, 0, &encode_u64(3), GlobalAddress::NULL, GlobalAddress::NULL)?;
        runtime::spawn_with_continuation(move || netfuture::getat(base, 1), result)?;
        thread::yield_now();

        let refused: i32 = match lco::reset(base) {
            Ok(()) => return Err(Fail::new(libc::EINVAL, "reset dropped a waiter")),
            Err(e) => e.errno,
        };
        let again: i32 = match lco::set_at(base, 0, &encode_u64(4)) {
            Ok(()) => return Err(Fail::new(libc::EINVAL, "refused reset cleared slot 0")),
            Err(e) => e.errno,
        };
        lco::set_at(base, 1, &encode_u64(5))?;
        let slot1: u64 = decode_u64(&lco::get(result)?)?;
        let slot0: u64 = decode_u64(&netfuture::getat(base, 0)?)?;
        lco::reset(base)?;
        Ok([refused as u64, again as u64, slot0, slot1].iter().flat_map(|v| v.to_le_bytes()).collect())
    })?;
    parallex::ensure_eq!(word(&output, 0), libc::EBUSY as u64);
    parallex::ensure_eq!(word(&output, 1), libc::EALREADY as u64);
    parallex::ensure_eq!(word(&output, 2), 3);
    parallex::ensure_eq!(word(&output, 3), 5);
    Ok(())
}

#[test]
fn alltoall_exchanges_columns() -> Result<()> {
    const PARTICIPANTS: usize = 3;
    let output: Vec<u8> = run(4, || {
        let exchange: GlobalAddress = alltoall::new(PARTICIPANTS, PARTICIPANTS)?;
        let results: Vec<GlobalAddress> = future::new_array(PARTICIPANTS, PARTICIPANTS)?;
        for (id, result) in results.iter().enumerate() {
            runtime::spawn_with_continuation(
                move || {
                    // Participant `id` sends `10 * id + j` to participant `j`.
                    let row: Vec<u8> = (0..PARTICIPANTS).map(|j| (10 * id + j) as u8).collect();
                    alltoall::setid(exchange, id, &row)?;
                    alltoall::getid(exchange, id)
                },
                *result,
            )?;
        }
        Ok(lco::get_all(&results)?.concat())
    })?;
    parallex::ensure_eq!(output, vec![0, 10, 20, 1, 11, 21, 2, 12, 22]);
    Ok(())
}
