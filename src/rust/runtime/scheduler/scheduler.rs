// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Scheduler lifecycle and the operations lightweight threads use to spawn, block, and wake each other.
//!
//! Worker 0 belongs to the OS thread that creates the scheduler; every other worker gets its own OS thread at startup.
//! Workers idle until the scheduler is started, run their loops until it is stopped, and go back to idling until
//! the next start or shutdown.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::lock::LcoLock,
    runtime::{
        action::ActionId,
        address::GlobalAddress,
        config::SchedulerConfig,
        fail::Fail,
        parcel::Parcel,
        scheduler::{
            cvar::ConditionVariable,
            thread,
            worker::{
                self,
                Checkpoint,
                Worker,
                WorkerSlot,
            },
        },
        Locality,
    },
};
use ::crossbeam_channel::Receiver;
use ::crossbeam_deque::{
    Injector,
    Worker as Deque,
};
use ::std::{
    marker::PhantomData,
    process,
    sync::{
        atomic::{
            AtomicU32,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        Weak,
    },
    thread::JoinHandle,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Value of the stop word while the scheduler runs. Any other value is a posted stop code.
const RUNNING: u64 = u64::MAX;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle state of a scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Shutdown,
}

/// Run state shared with idle workers.
struct RunState {
    state: SchedulerState,
    /// Incremented on every start, so that a worker joins each run exactly once.
    epoch: u64,
}

/// Scheduler state shared by all workers.
pub(crate) struct SchedulerShared {
    pub(crate) workers: Box<[WorkerSlot]>,
    /// [RUNNING] or the posted stop code.
    stopped: AtomicU64,
    run_state: Mutex<RunState>,
    run_changed: Condvar,
    /// Number of workers that pull work.
    n_target: AtomicUsize,
    next_tls_id: AtomicU32,
    /// Threads handed off by workers outside the target threads. Active workers pick them up.
    pub(crate) handoff: Injector<Box<Parcel>>,
    pub(crate) stack_bytes: usize,
    pub(crate) locality: Arc<Locality>,
    /// Result of the current run.
    output: Mutex<Option<Result<Vec<u8>, Fail>>>,
}

/// Lightweight-thread scheduler. It is bound to the OS thread that created it, which becomes worker 0.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    handles: Vec<JoinHandle<()>>,
    /// Pins the scheduler to its creating thread.
    _not_send: PhantomData<*const ()>,
    /// Worker whose OS thread fails to start.
    #[cfg(test)]
    fail_startup_at: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerShared {
    /// Posted stop code, or None while running.
    pub(crate) fn stop_code(&self) -> Option<u64> {
        match self.stopped.load(Ordering::Acquire) {
            RUNNING => None,
            code => Some(code),
        }
    }

    pub(crate) fn is_active(&self, id: usize) -> bool {
        id < self.n_target.load(Ordering::Relaxed)
    }

    pub(crate) fn next_tls_id(&self) -> u32 {
        self.next_tls_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn stop(&self, code: u64) {
        let code: u64 = if code == RUNNING { RUNNING - 1 } else { code };
        self.stopped.store(code, Ordering::Release);
    }

    /// Records the result of the current run. The first result sticks.
    pub(crate) fn set_output(&self, output: Result<Vec<u8>, Fail>) {
        let mut slot: MutexGuard<Option<Result<Vec<u8>, Fail>>> = lock(&self.output);
        if slot.is_none() {
            *slot = Some(output);
        }
    }

    fn lock_run_state(&self) -> MutexGuard<RunState> {
        lock(&self.run_state)
    }

    /// Moves every idle worker to `state` and wakes them.
    fn broadcast(&self, state: SchedulerState) {
        let mut run_state: MutexGuard<RunState> = self.lock_run_state();
        if state == SchedulerState::Running {
            run_state.epoch += 1;
        }
        run_state.state = state;
        self.run_changed.notify_all();
    }

    /// Body of the OS thread of worker `id`.
    fn worker_main(self: Arc<Self>, id: usize) {
        if let Err(e) = worker::bind(&self, id) {
            error!("worker_main(): {:?}", e);
            return;
        }
        let mut epoch: u64 = 0;
        loop {
            {
                let mut run_state: MutexGuard<RunState> = self.lock_run_state();
                loop {
                    match run_state.state {
                        SchedulerState::Shutdown => break,
                        SchedulerState::Running if run_state.epoch != epoch => break,
                        _ => {},
                    }
                    run_state = match self.run_changed.wait(run_state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                if run_state.state == SchedulerState::Shutdown {
                    break;
                }
                epoch = run_state.epoch;
            }
            unsafe { Worker::run(worker::current_ptr()) };
        }
        worker::unbind();
        trace!("worker_main(): worker {} exiting", id);
    }
}

impl Scheduler {
    /// Allocates every worker and binds worker 0 to the calling thread. No other OS thread is started yet.
    pub fn new(config: SchedulerConfig, locality: Arc<Locality>) -> Result<Self, Fail> {
        let mut slots: Vec<WorkerSlot> = Vec::with_capacity(config.worker_count);
        let mut owned: Vec<(Deque<Box<Parcel>>, Receiver<Box<Parcel>>)> = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let (slot, queue, inbox): (WorkerSlot, Deque<Box<Parcel>>, Receiver<Box<Parcel>>) = WorkerSlot::new(id);
            slots.push(slot);
            owned.push((queue, inbox));
        }

        let shared: Arc<SchedulerShared> = Arc::new(SchedulerShared {
            workers: slots.into_boxed_slice(),
            stopped: AtomicU64::new(0),
            run_state: Mutex::new(RunState {
                state: SchedulerState::Stopped,
                epoch: 0,
            }),
            run_changed: Condvar::new(),
            n_target: AtomicUsize::new(config.worker_count),
            next_tls_id: AtomicU32::new(0),
            handoff: Injector::new(),
            stack_bytes: config.stack_bytes,
            locality,
            output: Mutex::new(None),
        });
        for (id, (queue, inbox)) in owned.into_iter().enumerate() {
            shared.workers[id].park(Worker::new(id, shared.clone(), queue, inbox));
        }

        let scheduler: Self = Self {
            shared,
            handles: Vec::with_capacity(config.worker_count),
            _not_send: PhantomData,
            #[cfg(test)]
            fail_startup_at: None,
        };
        if let Err(e) = worker::bind(&scheduler.shared, 0) {
            scheduler.release_workers();
            return Err(e);
        }
        debug!(
            "new(): scheduler with {} workers (stack_bytes={})",
            config.worker_count, config.stack_bytes
        );
        Ok(scheduler)
    }

    /// Starts one OS thread per worker besides worker 0. If any thread fails to start, the ones already started are
    /// shut down and joined before the failure is reported.
    pub fn startup(&mut self) -> Result<(), Fail> {
        for id in 1..self.shared.workers.len() {
            match self.spawn_worker_thread(id) {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    error!("startup(): failed to start worker {} (error={:?})", id, e);
                    self.join_workers();
                    return Err(e);
                },
            }
        }
        Ok(())
    }

    fn spawn_worker_thread(&self, id: usize) -> Result<JoinHandle<()>, Fail> {
        #[cfg(test)]
        if self.fail_startup_at == Some(id) {
            return Err(Fail::new(libc::EAGAIN, "injected worker startup failure"));
        }
        let shared: Arc<SchedulerShared> = self.shared.clone();
        let handle: JoinHandle<()> = ::std::thread::Builder::new()
            .name(format!("parallex-worker-{}", id))
            .spawn(move || shared.worker_main(id))?;
        Ok(handle)
    }

    /// Runs the scheduler on the calling thread (worker 0) until it is stopped, and returns the stop code. Can be
    /// called again after it returns.
    pub fn start(&self) -> Result<u64, Fail> {
        let bound: *mut Worker = worker::current_ptr();
        let is_worker_0: bool = worker::with_current(|w| w.id() == 0 && Arc::ptr_eq(w.shared(), &self.shared))
            .unwrap_or(false);
        if !is_worker_0 {
            let cause: String = format!("the scheduler must be started from the thread that created it");
            error!("start(): {}", &cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        if self.state() != SchedulerState::Stopped {
            let cause: String = format!("the scheduler is not stopped (state={:?})", self.state());
            error!("start(): {}", &cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }

        *lock(&self.shared.output) = None;
        self.shared.broadcast(SchedulerState::Starting);
        self.shared.stopped.store(RUNNING, Ordering::Release);
        self.shared.broadcast(SchedulerState::Running);

        let code: u64 = unsafe { Worker::run(bound) };

        self.shared.broadcast(SchedulerState::Stopped);
        debug!("start(): scheduler stopped (code={})", code);
        Ok(code)
    }

    /// Posts a stop code. Workers honor it between scheduling decisions.
    pub fn stop(&self, code: u64) {
        self.shared.stop(code);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop_code().is_some()
    }

    pub fn state(&self) -> SchedulerState {
        let state: SchedulerState = self.shared.lock_run_state().state;
        match state {
            SchedulerState::Running if self.is_stopped() => SchedulerState::Stopping,
            state => state,
        }
    }

    /// Takes the result recorded by the last run.
    pub fn take_output(&self) -> Option<Result<Vec<u8>, Fail>> {
        lock(&self.shared.output).take()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn locality(&self) -> &Arc<Locality> {
        &self.shared.locality
    }

    /// Limits how many workers pull work. Worker 0 always does. Workers left out hand their threads to the others.
    pub fn set_target_threads(&self, n: usize) {
        set_target(&self.shared, n);
    }

    /// Makes `parcel` runnable on worker `id`.
    pub fn spawn_at(&self, parcel: Box<Parcel>, id: usize) -> Result<(), Fail> {
        post_to(&self.shared, parcel, id)
    }

    fn join_workers(&mut self) {
        self.shared.stop(0);
        self.shared.broadcast(SchedulerState::Shutdown);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("join_workers(): a worker thread panicked");
            }
        }
    }

    /// Drops every parked worker, releasing queued threads and breaking the worker/scheduler reference cycle.
    fn release_workers(&self) {
        for slot in self.shared.workers.iter() {
            drop(slot.unpark());
        }
    }
}

#[cfg(test)]
impl Scheduler {
    /// Creates a scheduler whose startup fails when it reaches worker `id`.
    pub(crate) fn with_startup_failure(
        config: SchedulerConfig,
        locality: Arc<Locality>,
        id: usize,
    ) -> Result<Self, Fail> {
        let mut scheduler: Self = Self::new(config, locality)?;
        scheduler.fail_startup_at = Some(id);
        Ok(scheduler)
    }

    pub(crate) fn running_workers(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_finished()).count()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.join_workers();
        let is_bound_here: bool = worker::with_current(|w| Arc::ptr_eq(w.shared(), &self.shared)).unwrap_or(false);
        if is_bound_here {
            worker::unbind();
        }
        self.release_workers();
        debug!("drop(): scheduler shut down");
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_target(shared: &SchedulerShared, n: usize) {
    let n: usize = n.clamp(1, shared.workers.len());
    shared.n_target.store(n, Ordering::Relaxed);
}

fn post_to(shared: &SchedulerShared, parcel: Box<Parcel>, id: usize) -> Result<(), Fail> {
    match shared.workers.get(id) {
        Some(slot) => slot.post(parcel),
        None => {
            let cause: String = format!("no such worker (id={})", id);
            error!("spawn_at(): {}", &cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

fn current_shared() -> Result<Arc<SchedulerShared>, Fail> {
    match worker::with_current(|w| w.shared().clone()) {
        Some(shared) => Ok(shared),
        None => {
            let cause: String = format!("this thread is not bound to a worker");
            error!("current_shared(): {}", &cause);
            Err(Fail::new(libc::EPERM, &cause))
        },
    }
}

/// Locality served by the worker bound to this thread.
pub(crate) fn current_locality() -> Result<Arc<Locality>, Fail> {
    Ok(current_shared()?.locality.clone())
}

/// Makes `parcel` runnable on the calling worker. Idle peers steal it from there.
pub fn spawn(parcel: Box<Parcel>) -> Result<(), Fail> {
    let worker: *mut Worker = worker::current_ptr();
    if worker.is_null() {
        let cause: String = format!("this thread is not bound to a worker");
        error!("spawn(): {}", &cause);
        return Err(Fail::new(libc::EPERM, &cause));
    }
    unsafe { (*worker).push(parcel) };
    Ok(())
}

/// Makes `parcel` runnable on worker `id`. Peers do not steal it from there; it only moves if `id` stops being one of
/// the target threads.
pub fn spawn_at(parcel: Box<Parcel>, id: usize) -> Result<(), Fail> {
    match worker::with_current(|w| w.id()) {
        Some(current) if current == id => spawn(parcel),
        _ => post_to(&*current_shared()?, parcel, id),
    }
}

/// Limits how many workers pull work.
pub fn set_target_threads(n: usize) -> Result<(), Fail> {
    set_target(&*current_shared()?, n);
    Ok(())
}

/// Number of workers of the calling thread's scheduler.
pub fn worker_count() -> Result<usize, Fail> {
    Ok(current_shared()?.workers.len())
}

/// Posts a stop code to the calling thread's scheduler.
pub fn stop(code: u64) -> Result<(), Fail> {
    current_shared()?.stop(code);
    Ok(())
}

/// Records `output` as the result of the current run and stops the scheduler.
pub(crate) fn finish(output: Result<Vec<u8>, Fail>) -> Result<(), Fail> {
    let shared: Arc<SchedulerShared> = current_shared()?;
    let code: u64 = if output.is_ok() { 0 } else { 1 };
    shared.set_output(output);
    shared.stop(code);
    Ok(())
}

/// Target and action of the running parcel.
pub fn current_parcel() -> Option<(GlobalAddress, ActionId)> {
    thread::current_context().map(|context| (context.target, context.action))
}

/// Abandons the calling lightweight thread without unwinding it. Its stack goes back to the worker.
pub(crate) fn exit_thread() -> ! {
    let _ = worker::suspend(Checkpoint::Exit);
    error!("exit_thread(): called outside a lightweight thread, aborting");
    process::abort()
}

/// Blocks the calling lightweight thread on `cvar`. The caller holds `lock` exactly once; it is released while the
/// thread is parked and held again when this returns. Returns the error posted to `cvar`, if any.
pub(crate) fn wait(lock: &LcoLock, cvar: *mut ConditionVariable) -> Result<(), Fail> {
    match thread::lco_depth() {
        Some(depth) => {
            debug_assert_eq!(depth, 1, "blocking on an LCO while holding {} other LCO locks", depth - 1);
        },
        None => {
            let cause: String = format!("only lightweight threads can block on an LCO");
            error!("wait(): {}", &cause);
            return Err(Fail::new(libc::EPERM, &cause));
        },
    }
    thread::adjust_lco_depth(-1);
    worker::suspend(Checkpoint::Wait { lock, cvar })?;
    lock.lock();
    unsafe { (*cvar).status() }
}

/// Wakes every thread blocked on `cvar`. The caller holds the owning LCO's lock.
pub(crate) fn signal_all(cvar: &mut ConditionVariable) {
    while let Some(parcel) = cvar.dequeue_one() {
        resume(parcel);
    }
}

/// Posts `fail` to `cvar` and wakes every thread blocked on it. The caller holds the owning LCO's lock.
pub(crate) fn signal_error(cvar: &mut ConditionVariable, fail: Fail) {
    for parcel in cvar.set_error(fail) {
        resume(parcel);
    }
}

/// Makes a woken thread runnable again. A worker of the thread's own scheduler takes it; anyone else posts it to
/// the worker it blocked on.
fn resume(parcel: Box<Parcel>) {
    let home: Option<(Arc<SchedulerShared>, usize)> = parcel
        .ustack
        .as_deref()
        .and_then(|ustack| ustack.home.as_ref())
        .and_then(|(shared, id): &(Weak<SchedulerShared>, usize)| shared.upgrade().map(|shared| (shared, *id)));
    let result: Result<(), Fail> = match home {
        Some((shared, id)) => match worker::with_current(|w| Arc::ptr_eq(w.shared(), &shared)) {
            Some(true) => spawn(parcel),
            _ => post_to(&shared, parcel, id),
        },
        None => spawn(parcel),
    };
    if let Err(e) = result {
        error!("resume(): dropping a woken thread (error={:?})", e);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
