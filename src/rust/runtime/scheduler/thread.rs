// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lightweight threads: the per-thread execution state that travels with a parcel, and the services a running
//! lightweight thread can ask for.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco,
    runtime::{
        action::ActionId,
        address::GlobalAddress,
        fail::Fail,
        parcel::{
            self,
            Job,
            Parcel,
        },
        scheduler::{
            context::ExecutionContext,
            scheduler::SchedulerShared,
            stack::Stack,
            worker::{
                self,
                Checkpoint,
            },
        },
    },
};
use ::std::{
    mem,
    panic::{
        self,
        AssertUnwindSafe,
    },
    process,
    ptr,
    sync::{
        Arc,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Execution state of one lightweight thread.
pub struct Ustack {
    /// Saved registers while the thread is not running.
    pub(crate) context: ExecutionContext,
    stack: Stack,
    /// Number of LCO locks the thread holds.
    pub(crate) lco_depth: i32,
    /// Thread-local storage identifier, assigned on first request.
    pub(crate) tls_id: Option<u32>,
    /// Set once the continuation was sent explicitly.
    pub(crate) cont: bool,
    /// Set once the thread installed its own signal mask.
    pub(crate) masked: bool,
    pub(crate) sigmask: libc::sigset_t,
    /// Scheduler and worker the thread last blocked on. Wakeups from outside that scheduler are posted there.
    pub(crate) home: Option<(Weak<SchedulerShared>, usize)>,
}

/// Snapshot of the running lightweight thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    pub worker: usize,
    pub action: ActionId,
    pub target: GlobalAddress,
    pub c_action: ActionId,
    pub c_target: GlobalAddress,
    pub tls_id: Option<u32>,
    pub lco_depth: i32,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Ustack {
    pub(crate) fn new(stack_bytes: usize) -> Result<Box<Self>, Fail> {
        let stack: Stack = Stack::new(stack_bytes)?;
        trace!("new(): lightweight thread stack (size={})", stack.size());
        Ok(Box::new(Self {
            context: ExecutionContext::empty(),
            stack,
            lco_depth: 0,
            tls_id: None,
            cont: false,
            masked: false,
            sigmask: empty_sigset(),
            home: None,
        }))
    }

    /// Prepares the stack to start a fresh thread at [entry]. Stacks are reused, so every field is reset.
    pub(crate) fn init(&mut self) {
        self.context = unsafe { ExecutionContext::create(&self.stack, entry, ptr::null_mut()) };
        self.lco_depth = 0;
        self.tls_id = None;
        self.cont = false;
        self.masked = false;
        self.home = None;
    }

    /// Bytes left between `sp` and the bottom of the stack.
    fn headroom(&self, sp: usize) -> usize {
        sp.saturating_sub(self.stack.bottom() as usize)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs `f` on the running lightweight thread's parcel. Returns None outside lightweight threads.
fn with_running<R>(f: impl FnOnce(usize, &mut Parcel) -> R) -> Option<R> {
    worker::with_current(|w| {
        let id: usize = w.id();
        w.running_mut().map(|parcel| f(id, parcel))
    })
    .flatten()
}

fn with_ustack<R>(f: impl FnOnce(&mut Ustack) -> R) -> Option<R> {
    with_running(|_, parcel| parcel.ustack.as_deref_mut().map(f)).flatten()
}

/// Entry point of every lightweight thread.
extern "C" fn entry(_: *mut u8) -> ! {
    execute();
    let _ = worker::suspend(Checkpoint::Exit);
    error!("entry(): a retired lightweight thread was resumed");
    process::abort()
}

/// Runs the parcel's work and sends its continuation.
fn execute() {
    let job: Job = match with_running(|_, parcel| parcel.take_job()) {
        Some(job) => job,
        None => {
            error!("execute(): no parcel is bound to this lightweight thread");
            return;
        },
    };

    let result: Result<Vec<u8>, Fail> = match panic::catch_unwind(AssertUnwindSafe(|| job.invoke())) {
        Ok(result) => result,
        Err(cause) => {
            let cause: String = match cause.downcast_ref::<&str>() {
                Some(s) => format!("lightweight thread panicked ({})", s),
                None => match cause.downcast_ref::<String>() {
                    Some(s) => format!("lightweight thread panicked ({})", s),
                    None => "lightweight thread panicked".to_string(),
                },
            };
            error!("execute(): {}", &cause);
            Err(Fail::new(libc::ECANCELED, &cause))
        },
    };

    if let Some(depth) = with_ustack(|ustack| ustack.lco_depth) {
        debug_assert_eq!(depth, 0, "lightweight thread finished while holding {} LCO locks", depth);
    }

    let continuation: Option<(ActionId, GlobalAddress, bool)> = with_running(|_, parcel| {
        let cont: bool = parcel.ustack.as_deref().map_or(false, |ustack| ustack.cont);
        (parcel.c_action(), parcel.c_target(), cont)
    });
    match continuation {
        Some((_, _, true)) => {},
        Some((c_action, c_target, false)) => continue_with(c_action, c_target, result),
        None => error!("execute(): lost track of the running parcel"),
    }
}

/// Sends `result` to a continuation. Values go through the continuation action; errors are posted to the target LCO.
fn continue_with(c_action: ActionId, c_target: GlobalAddress, result: Result<Vec<u8>, Fail>) {
    if c_target.is_null() {
        if let Err(e) = result {
            warn!("continue_with(): dropping error with no continuation (error={:?})", e);
        }
        return;
    }
    let status: Result<(), Fail> = match result {
        Ok(value) if c_action == ActionId::LCO_SET || c_action.is_null() => lco::set(c_target, &value),
        Ok(value) => parcel::send(Parcel::new(c_target, c_action, value)),
        Err(fail) => lco::error(c_target, fail),
    };
    if let Err(e) = status {
        error!("continue_with(): failed to continue (target={:?}, error={:?})", c_target, e);
    }
}

/// Adds `delta` to the running thread's LCO lock count. Does nothing outside lightweight threads.
pub(crate) fn adjust_lco_depth(delta: i32) {
    let _ = with_ustack(|ustack| {
        ustack.lco_depth += delta;
        debug_assert!(ustack.lco_depth >= 0, "unbalanced LCO unlock");
    });
}

/// Current LCO lock count of the running thread.
pub(crate) fn lco_depth() -> Option<i32> {
    with_ustack(|ustack| ustack.lco_depth)
}

/// Gives other lightweight threads a chance to run. Outside lightweight threads this yields the OS thread.
pub fn yield_now() {
    match lco_depth() {
        Some(depth) => {
            debug_assert_eq!(depth, 0, "yield while holding {} LCO locks", depth);
            if let Err(e) = worker::suspend(Checkpoint::Yield) {
                warn!("yield_now(): {:?}", e);
            }
        },
        None => ::std::thread::yield_now(),
    }
}

/// Describes the running lightweight thread.
pub fn current_context() -> Option<ContextInfo> {
    with_running(|worker, parcel| {
        let (tls_id, lco_depth): (Option<u32>, i32) =
            parcel.ustack.as_deref().map_or((None, 0), |u| (u.tls_id, u.lco_depth));
        ContextInfo {
            worker,
            action: parcel.action(),
            target: parcel.target(),
            c_action: parcel.c_action(),
            c_target: parcel.c_target(),
            tls_id,
            lco_depth,
        }
    })
}

/// Target of the running parcel, or null outside lightweight threads.
pub fn current_target() -> GlobalAddress {
    with_running(|_, parcel| parcel.target()).unwrap_or(GlobalAddress::NULL)
}

/// Identifier of the worker bound to this OS thread.
pub fn worker_id() -> Option<usize> {
    worker::with_current(|w| w.id())
}

/// Thread-local storage identifier of the running thread, unique among the threads of this scheduler.
pub fn tls_id() -> Option<u32> {
    worker::with_current(|w| {
        let shared: Arc<SchedulerShared> = w.shared().clone();
        w.running_mut()
            .and_then(|parcel| parcel.ustack.as_deref_mut())
            .map(|ustack| *ustack.tls_id.get_or_insert_with(|| shared.next_tls_id()))
    })
    .flatten()
}

/// Whether `bytes` more can be placed on the running thread's stack.
pub fn can_alloca(bytes: usize) -> bool {
    let marker: u8 = 0;
    let sp: usize = &marker as *const u8 as usize;
    with_ustack(|ustack| ustack.headroom(sp) > bytes).unwrap_or(false)
}

/// Changes the running thread's signal mask. The mask follows the thread across workers. Returns the previous mask.
pub fn sigmask(how: libc::c_int, set: &libc::sigset_t) -> Result<libc::sigset_t, Fail> {
    if lco_depth().is_none() {
        let cause: String = format!("not running in a lightweight thread");
        error!("sigmask(): {}", &cause);
        return Err(Fail::new(libc::EPERM, &cause));
    }
    let mut old: libc::sigset_t = empty_sigset();
    let mut new: libc::sigset_t = empty_sigset();
    let rc: libc::c_int = unsafe {
        let rc: libc::c_int = libc::pthread_sigmask(how, set, &mut old);
        if rc == 0 {
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut new)
        } else {
            rc
        }
    };
    if rc != 0 {
        let cause: String = format!("pthread_sigmask() failed (rc={})", rc);
        error!("sigmask(): {}", &cause);
        return Err(Fail::new(rc, &cause));
    }
    let _ = with_ustack(|ustack| {
        ustack.masked = true;
        ustack.sigmask = new;
    });
    Ok(old)
}

/// Sends `value` to the running thread's continuation now. The thread keeps running, and its eventual result is not
/// sent again.
pub fn continue_value(value: &[u8]) -> Result<(), Fail> {
    let continuation: Option<(ActionId, GlobalAddress)> = with_running(|_, parcel| {
        let c: (ActionId, GlobalAddress) = (parcel.c_action(), parcel.c_target());
        match parcel.ustack.as_deref_mut() {
            Some(ustack) if !ustack.cont => {
                ustack.cont = true;
                Some(c)
            },
            _ => None,
        }
    })
    .flatten();
    match continuation {
        Some((c_action, c_target)) => {
            continue_with(c_action, c_target, Ok(value.to_vec()));
            Ok(())
        },
        None => {
            let cause: String = format!("no continuation is pending");
            error!("continue_value(): {}", &cause);
            Err(Fail::new(libc::EPERM, &cause))
        },
    }
}

/// Runs `f` as a new lightweight thread on this locality.
pub fn spawn<F>(f: F) -> Result<(), Fail>
where
    F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
{
    super::spawn(Parcel::from_closure(f))
}

/// Runs `f` as a new lightweight thread and sends its result to the LCO at `c_target`.
pub fn spawn_with_continuation<F>(f: F, c_target: GlobalAddress) -> Result<(), Fail>
where
    F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
{
    super::spawn(Parcel::from_closure(f).with_continuation(c_target, ActionId::LCO_SET))
}

pub(crate) fn empty_sigset() -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    unsafe { libc::sigemptyset(&mut set) };
    set
}
