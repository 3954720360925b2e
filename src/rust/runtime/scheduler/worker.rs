// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A worker is the scheduling loop of one OS thread. It pops lightweight threads from its own deque (LIFO), then from
//! its inbox and the scheduler's handoff queue, then steals from a random peer (FIFO), then polls the transport, and
//! finally resumes the threads that yielded on it. A worker that is not among the target threads hands everything it
//! holds to the handoff queue.
//! Lightweight threads always switch back into the loop, which then completes whatever the thread asked for on its
//! way out (see [Checkpoint]) before picking the next thread.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::lock::LcoLock,
    runtime::{
        fail::Fail,
        limits,
        parcel::Parcel,
        scheduler::{
            context::{
                self,
                ExecutionContext,
            },
            cvar::ConditionVariable,
            scheduler::SchedulerShared,
            thread::{
                self,
                Ustack,
            },
        },
    },
};
use ::arrayvec::ArrayVec;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::crossbeam_deque::{
    Steal,
    Stealer,
    Worker as Deque,
};
use ::crossbeam_utils::Backoff;
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::Cell,
    process,
    ptr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Thread Local Storage
//======================================================================================================================

thread_local! {
    /// Worker bound to this OS thread.
    static CURRENT: Cell<*mut Worker> = const { Cell::new(ptr::null_mut()) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// What a lightweight thread asked the worker loop to do with it after switching out.
pub(crate) enum Checkpoint {
    /// Requeue behind other runnable threads.
    Yield,
    /// Park on `cvar`, then release `lock`.
    Wait {
        lock: *const LcoLock,
        cvar: *mut ConditionVariable,
    },
    /// Retire the thread and recycle its stack.
    Exit,
}

/// The part of a worker that its peers can see.
pub(crate) struct WorkerSlot {
    pub(crate) id: usize,
    stealer: Stealer<Box<Parcel>>,
    inbox: Sender<Box<Parcel>>,
    /// The worker itself while no OS thread is bound to it.
    parked: Mutex<Option<Box<Worker>>>,
}

#[derive(Default, Debug)]
struct WorkerStats {
    executed: u64,
    stolen: u64,
    created: u64,
    handed_off: u64,
}

/// Scheduling state owned by the OS thread a worker is bound to.
pub(crate) struct Worker {
    id: usize,
    shared: Arc<SchedulerShared>,
    queue: Deque<Box<Parcel>>,
    inbox: Receiver<Box<Parcel>>,
    /// Threads that yielded on this worker, in FIFO order. Peers cannot steal from it.
    yielded: Deque<Box<Parcel>>,
    /// Context of the worker loop itself while a lightweight thread runs.
    system: ExecutionContext,
    /// Lightweight thread that is running on top of this worker.
    current: Option<Box<Parcel>>,
    pending: Option<Checkpoint>,
    stacks: ArrayVec<Box<Ustack>, { limits::STACK_FREELIST_DEPTH }>,
    rng: SmallRng,
    /// Signal mask of the OS thread, restored after running a thread that changed its own mask.
    sigmask: libc::sigset_t,
    stats: WorkerStats,
}

// A worker only moves between OS threads while it is parked in its slot.
unsafe impl Send for Worker {}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkerSlot {
    /// Creates the slot of worker `id` together with the deque and inbox that the worker will own.
    pub(crate) fn new(id: usize) -> (Self, Deque<Box<Parcel>>, Receiver<Box<Parcel>>) {
        let queue: Deque<Box<Parcel>> = Deque::new_lifo();
        let (inbox, inbox_rx): (Sender<Box<Parcel>>, Receiver<Box<Parcel>>) = ::crossbeam_channel::unbounded();
        let slot: Self = Self {
            id,
            stealer: queue.stealer(),
            inbox,
            parked: Mutex::new(None),
        };
        (slot, queue, inbox_rx)
    }

    /// Pushes work into this worker's inbox.
    pub(crate) fn post(&self, parcel: Box<Parcel>) -> Result<(), Fail> {
        if self.inbox.send(parcel).is_err() {
            let cause: String = format!("inbox of worker {} is closed", self.id);
            error!("post(): {}", &cause);
            return Err(Fail::new(libc::EPIPE, &cause));
        }
        Ok(())
    }

    pub(crate) fn park(&self, worker: Box<Worker>) {
        *self.lock_parked() = Some(worker);
    }

    pub(crate) fn unpark(&self) -> Option<Box<Worker>> {
        self.lock_parked().take()
    }

    fn lock_parked(&self) -> MutexGuard<Option<Box<Worker>>> {
        match self.parked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<SchedulerShared>,
        queue: Deque<Box<Parcel>>,
        inbox: Receiver<Box<Parcel>>,
    ) -> Box<Self> {
        Box::new(Self {
            id,
            shared,
            queue,
            inbox,
            yielded: Deque::new_fifo(),
            system: ExecutionContext::empty(),
            current: None,
            pending: None,
            stacks: ArrayVec::new(),
            rng: SmallRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ id as u64),
            sigmask: thread::empty_sigset(),
            stats: WorkerStats::default(),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    /// Parcel of the lightweight thread running on top of this worker.
    pub(crate) fn running_mut(&mut self) -> Option<&mut Parcel> {
        self.current.as_deref_mut()
    }

    /// Makes `parcel` runnable on this worker.
    pub(crate) fn push(&mut self, parcel: Box<Parcel>) {
        self.queue.push(parcel);
    }

    /// Runs the scheduling loop until the scheduler is stopped, then returns the stop code.
    ///
    /// # Safety
    ///
    /// `this` must be the worker bound to the calling OS thread, and the caller must not be a lightweight thread.
    pub(crate) unsafe fn run(this: *mut Worker) -> u64 {
        let shared: Arc<SchedulerShared> = (*this).shared.clone();
        let backoff: Backoff = Backoff::new();
        trace!("run(): worker {} entering scheduling loop", (*this).id);
        loop {
            if let Some(code) = shared.stop_code() {
                trace!("run(): worker {} observed stop (code={})", (*this).id, code);
                return code;
            }
            let next: Option<Box<Parcel>> = match shared.is_active((*this).id) {
                true => (*this).next_parcel(),
                false => {
                    (*this).hand_off();
                    None
                },
            };
            match next {
                Some(parcel) => {
                    backoff.reset();
                    Self::transfer(this, parcel);
                },
                None if backoff.is_completed() => ::std::thread::yield_now(),
                None => backoff.snooze(),
            }
        }
    }

    /// Picks the next runnable thread.
    fn next_parcel(&mut self) -> Option<Box<Parcel>> {
        if let Some(parcel) = self.queue.pop() {
            return Some(parcel);
        }
        if let Ok(parcel) = self.inbox.try_recv() {
            return Some(parcel);
        }
        loop {
            match self.shared.handoff.steal() {
                Steal::Success(parcel) => return Some(parcel),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        if let Some(parcel) = self.steal() {
            return Some(parcel);
        }
        if let Some(parcel) = self.shared.locality.network().probe() {
            return Some(parcel);
        }
        self.yielded.pop()
    }

    /// Moves every thread this worker holds to the handoff queue, where active workers pick them up.
    fn hand_off(&mut self) {
        let mut n: u64 = 0;
        let held = || {
            self.queue
                .pop()
                .or_else(|| self.inbox.try_recv().ok())
                .or_else(|| self.yielded.pop())
        };
        while let Some(parcel) = held() {
            self.shared.handoff.push(parcel);
            n += 1;
        }
        if n > 0 {
            trace!("hand_off(): worker {} handed off {} threads", self.id, n);
            self.stats.handed_off += n;
        }
    }

    /// Steals from the FIFO end of peers' deques, starting at a random victim.
    fn steal(&mut self) -> Option<Box<Parcel>> {
        let n: usize = self.shared.workers.len();
        if n < 2 {
            return None;
        }
        let start: usize = self.rng.gen_range(0..n);
        for i in 0..n {
            let victim: usize = (start + i) % n;
            if victim == self.id {
                continue;
            }
            loop {
                match self.shared.workers[victim].stealer.steal() {
                    Steal::Success(parcel) => {
                        self.stats.stolen += 1;
                        return Some(parcel);
                    },
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Switches into `parcel`'s lightweight thread (creating it if needed) and, once it switches back, completes its
    /// checkpoint.
    unsafe fn transfer(this: *mut Worker, mut parcel: Box<Parcel>) {
        if parcel.ustack.is_none() {
            parcel.ustack = Some((*this).thread_new());
        }
        let (to, mask): (*const ExecutionContext, Option<libc::sigset_t>) = match parcel.ustack.as_deref() {
            Some(ustack) => (&ustack.context, ustack.masked.then_some(ustack.sigmask)),
            None => return,
        };
        if let Some(mask) = mask {
            libc::pthread_sigmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
        }

        (*this).stats.executed += 1;
        (*this).current = Some(parcel);
        context::transfer(ptr::addr_of_mut!((*this).system), to);

        let masked: bool = match (*this).current.as_deref() {
            Some(parcel) => parcel.ustack.as_deref().map_or(false, |ustack| ustack.masked),
            None => false,
        };
        if mask.is_some() || masked {
            libc::pthread_sigmask(libc::SIG_SETMASK, &(*this).sigmask, ptr::null_mut());
        }
        (*this).checkpoint();
    }

    /// Completes the request of the thread that just switched out.
    fn checkpoint(&mut self) {
        let mut parcel: Box<Parcel> = match self.current.take() {
            Some(parcel) => parcel,
            None => {
                error!("checkpoint(): no lightweight thread was running");
                return;
            },
        };
        match self.pending.take() {
            Some(Checkpoint::Yield) => self.yielded.push(parcel),
            Some(Checkpoint::Wait { lock, cvar }) => unsafe {
                if let Some(ustack) = parcel.ustack.as_deref_mut() {
                    ustack.home = Some((Arc::downgrade(&self.shared), self.id));
                }
                // The waiter is visible on the queue before anyone can take the lock and signal it.
                (*cvar).enqueue(parcel);
                if let Err(e) = (*lock).release() {
                    error!("checkpoint(): {:?}", e);
                }
            },
            Some(Checkpoint::Exit) | None => self.retire(parcel),
        }
    }

    /// Gets a stack for a new lightweight thread. Running out of stack memory is fatal.
    fn thread_new(&mut self) -> Box<Ustack> {
        let mut ustack: Box<Ustack> = match self.stacks.pop() {
            Some(ustack) => ustack,
            None => match Ustack::new(self.shared.stack_bytes) {
                Ok(ustack) => {
                    self.stats.created += 1;
                    ustack
                },
                Err(e) => {
                    error!("thread_new(): cannot allocate a lightweight thread stack, aborting (error={:?})", e);
                    process::abort();
                },
            },
        };
        ustack.init();
        ustack
    }

    /// Recycles a finished thread's stack and drops its parcel.
    fn retire(&mut self, mut parcel: Box<Parcel>) {
        if let Some(ustack) = parcel.ustack.take() {
            // Stacks beyond the free list depth are unmapped.
            let _ = self.stacks.try_push(ustack);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Worker {
    fn drop(&mut self) {
        debug!(
            "drop(): worker {} (executed={}, stolen={}, handed_off={}, stacks_created={})",
            self.id, self.stats.executed, self.stats.stolen, self.stats.handed_off, self.stats.created
        );
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Worker bound to the calling OS thread. Never inlined, so that the thread-local address is recomputed after a
/// lightweight thread resumes on a different OS thread.
#[inline(never)]
pub(crate) fn current_ptr() -> *mut Worker {
    CURRENT.with(|current| current.get())
}

/// Runs `f` on the worker bound to this OS thread. `f` must not suspend the running lightweight thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
    let worker: *mut Worker = current_ptr();
    if worker.is_null() {
        return None;
    }
    Some(f(unsafe { &mut *worker }))
}

/// Binds worker `id` of `shared` to the calling OS thread.
pub(crate) fn bind(shared: &Arc<SchedulerShared>, id: usize) -> Result<(), Fail> {
    if !current_ptr().is_null() {
        let cause: String = format!("this thread is already bound to a worker (id={})", id);
        error!("bind(): {}", &cause);
        return Err(Fail::new(libc::EBUSY, &cause));
    }
    let mut worker: Box<Worker> = match shared.workers.get(id).and_then(WorkerSlot::unpark) {
        Some(worker) => worker,
        None => {
            let cause: String = format!("worker is not available (id={})", id);
            error!("bind(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        },
    };
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &mut worker.sigmask) };
    CURRENT.with(|current| current.set(Box::into_raw(worker)));
    trace!("bind(): worker {} bound to {:?}", id, ::std::thread::current().id());
    Ok(())
}

/// Unbinds the calling OS thread from its worker and parks the worker back in its slot.
pub(crate) fn unbind() -> Option<usize> {
    let worker: *mut Worker = CURRENT.with(|current| current.replace(ptr::null_mut()));
    if worker.is_null() {
        return None;
    }
    let worker: Box<Worker> = unsafe { Box::from_raw(worker) };
    let id: usize = worker.id;
    let shared: Arc<SchedulerShared> = worker.shared.clone();
    shared.workers[id].park(worker);
    Some(id)
}

/// Switches the running lightweight thread out to its worker loop with `checkpoint`. Returns once the thread is
/// resumed, possibly on another worker.
pub(crate) fn suspend(checkpoint: Checkpoint) -> Result<(), Fail> {
    let worker: *mut Worker = current_ptr();
    let from: *mut ExecutionContext = if worker.is_null() {
        ptr::null_mut()
    } else {
        unsafe {
            match (*worker).current.as_deref_mut().and_then(|parcel| parcel.ustack.as_deref_mut()) {
                Some(ustack) => &mut ustack.context,
                None => ptr::null_mut(),
            }
        }
    };
    if from.is_null() {
        let cause: String = format!("not running in a lightweight thread");
        error!("suspend(): {}", &cause);
        return Err(Fail::new(libc::EPERM, &cause));
    }
    unsafe {
        (*worker).pending = Some(checkpoint);
        context::transfer(from, ptr::addr_of!((*worker).system));
    }
    Ok(())
}
