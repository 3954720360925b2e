// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod action;
pub mod address;
pub mod collections;
pub mod config;
pub mod fail;
pub mod gas;
pub mod limits;
pub mod logging;
pub mod network;
pub mod parcel;
pub mod scheduler;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    lco::{
        self,
        future,
    },
    runtime::{
        action::{
            ActionHandler,
            ActionId,
            ActionTable,
        },
        address::GlobalAddress,
        config::{
            Config,
            SchedulerConfig,
        },
        fail::Fail,
        gas::{
            AddressSpace,
            SmpAddressSpace,
        },
        network::{
            Loopback,
            Transport,
        },
        parcel::Parcel,
        scheduler::Scheduler,
    },
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One process of the runtime: its rank, its actions, and the services that connect it to the other localities.
pub struct Locality {
    rank: u32,
    ranks: u32,
    actions: ActionTable,
    gas: Arc<dyn AddressSpace>,
    network: Arc<dyn Transport>,
}

/// Runtime of one locality. It owns the scheduler, whose worker 0 is the thread that created the runtime.
pub struct Runtime {
    scheduler: Scheduler,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Locality {
    /// Creates a locality and registers the built-in actions.
    pub fn new(gas: Arc<dyn AddressSpace>, network: Arc<dyn Transport>) -> Result<Arc<Self>, Fail> {
        if gas.here() != network.rank() {
            let cause: String = format!(
                "address space and transport disagree on the rank (gas={}, network={})",
                gas.here(),
                network.rank()
            );
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if network.ranks() > limits::MAX_LOCALITIES {
            let cause: String = format!(
                "too many localities (ranks={}, max={})",
                network.ranks(),
                limits::MAX_LOCALITIES
            );
            error!("new(): {}", &cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let locality: Self = Self {
            rank: network.rank(),
            ranks: network.ranks(),
            actions: ActionTable::new(),
            gas,
            network,
        };

        let builtins: [(ActionId, &str, ActionHandler); 10] = [
            (ActionId::LCO_SET, "lco_set", lco::action_set),
            (ActionId::LCO_SET_AT, "lco_set_at", lco::action_set_at),
            (ActionId::LCO_GET, "lco_get", lco::action_get),
            (ActionId::LCO_GET_AT, "lco_get_at", lco::action_get_at),
            (ActionId::LCO_WAIT, "lco_wait", lco::action_wait),
            (ActionId::LCO_WAIT_AT, "lco_wait_at", lco::action_wait_at),
            (ActionId::LCO_ERROR, "lco_error", lco::action_error),
            (ActionId::LCO_RESET, "lco_reset", lco::action_reset),
            (ActionId::LCO_DELETE, "lco_delete", lco::action_delete),
            (ActionId::LOCALITY_STOP, "locality_stop", locality_stop),
        ];
        for (expected, name, handler) in builtins {
            let id: ActionId = locality.actions.register(name, handler)?;
            debug_assert_eq!(id, expected, "built-in action {} registered out of order", name);
        }
        Ok(Arc::new(locality))
    }

    /// Locality served by the calling worker.
    pub fn current() -> Result<Arc<Locality>, Fail> {
        scheduler::current_locality()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn ranks(&self) -> u32 {
        self.ranks
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    pub fn gas(&self) -> &dyn AddressSpace {
        self.gas.as_ref()
    }

    pub fn network(&self) -> &dyn Transport {
        self.network.as_ref()
    }
}

impl Runtime {
    /// Creates a single-locality runtime.
    pub fn new(config: &Config) -> Result<Self, Fail> {
        Self::with_services(config, Arc::new(SmpAddressSpace::new(0, 1)), Loopback::single())
    }

    /// Creates the runtime of one locality among several, and starts the OS threads of its workers.
    pub fn with_services(
        config: &Config,
        gas: Arc<dyn AddressSpace>,
        network: Arc<dyn Transport>,
    ) -> Result<Self, Fail> {
        logging::initialize();
        let scheduler_config: SchedulerConfig = config.scheduler()?;
        let locality: Arc<Locality> = Locality::new(gas, network)?;
        let mut scheduler: Scheduler = Scheduler::new(scheduler_config, locality)?;
        scheduler.startup()?;
        info!(
            "with_services(): locality {} of {} up with {} workers",
            scheduler.locality().rank(),
            scheduler.locality().ranks(),
            scheduler.worker_count()
        );
        Ok(Self { scheduler })
    }

    /// Registers an application action. Every locality must register the same actions in the same order, before its
    /// first run.
    pub fn register_action(&self, name: &str, handler: ActionHandler) -> Result<ActionId, Fail> {
        self.scheduler.locality().actions().register(name, handler)
    }

    /// Runs `main` as a lightweight thread and drives the scheduler on the calling thread until the run ends, either
    /// through [exit] or by `main` returning. Returns the run's output.
    pub fn run<F>(&self, main: F) -> Result<Vec<u8>, Fail>
    where
        F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
    {
        self.scheduler.locality().actions().freeze();
        let entry: Box<Parcel> = Parcel::from_closure(move || {
            shutdown(main());
            Ok(Vec::new())
        });
        self.scheduler.spawn_at(entry, 0)?;
        let code: u64 = self.scheduler.start()?;
        match self.scheduler.take_output() {
            Some(output) => output,
            None => {
                let cause: String = format!("run stopped without an output (code={})", code);
                warn!("run(): {}", &cause);
                Err(Fail::new(libc::ECANCELED, &cause))
            },
        }
    }

    /// Serves parcels from other localities until one of them stops this locality. Returns the stop code.
    pub fn serve(&self) -> Result<u64, Fail> {
        self.scheduler.locality().actions().freeze();
        self.scheduler.start()
    }

    pub fn rank(&self) -> u32 {
        self.scheduler.locality().rank()
    }

    pub fn ranks(&self) -> u32 {
        self.scheduler.locality().ranks()
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Records the output of the run, stops this locality, and stops every other locality.
fn shutdown(output: Result<Vec<u8>, Fail>) {
    let code: u64 = if output.is_ok() { 0 } else { 1 };
    let here: Arc<Locality> = match Locality::current() {
        Ok(here) => here,
        Err(e) => {
            error!("shutdown(): {:?}", e);
            return;
        },
    };
    for rank in (0..here.ranks()).filter(|rank| *rank != here.rank()) {
        let parcel: Box<Parcel> =
            Parcel::new(GlobalAddress::locality(rank), ActionId::LOCALITY_STOP, code.to_le_bytes().to_vec());
        if let Err(e) = here.network().deliver(rank, parcel) {
            warn!("shutdown(): cannot stop locality {} (error={:?})", rank, e);
        }
    }
    if let Err(e) = scheduler::scheduler::finish(output) {
        error!("shutdown(): {:?}", e);
    }
}

/// Ends the run with `output`. The calling lightweight thread does not return.
pub fn exit(output: Result<Vec<u8>, Fail>) -> ! {
    shutdown(output);
    scheduler::scheduler::exit_thread()
}

/// Sends `action` with `payload` to `target`. The action's result goes to the LCO at `c_target`, unless it is null.
pub fn call(target: GlobalAddress, action: ActionId, payload: &[u8], c_target: GlobalAddress) -> Result<(), Fail> {
    parcel::send(Parcel::new(target, action, payload.to_vec()).with_continuation(c_target, ActionId::LCO_SET))
}

/// Sends `action` with `payload` to `target` and blocks until its result arrives.
pub fn call_sync(target: GlobalAddress, action: ActionId, payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let result: GlobalAddress = future::new_unsized()?;
    let value: Result<Vec<u8>, Fail> = call(target, action, payload, result).and_then(|_| lco::get(result));
    lco::delete(result)?;
    value
}

/// Runs `f` as a new lightweight thread on this locality.
pub fn spawn<F>(f: F) -> Result<(), Fail>
where
    F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
{
    scheduler::thread::spawn(f)
}

/// Runs `f` as a new lightweight thread and sends its result to the LCO at `c_target`.
pub fn spawn_with_continuation<F>(f: F, c_target: GlobalAddress) -> Result<(), Fail>
where
    F: FnOnce() -> Result<Vec<u8>, Fail> + Send + 'static,
{
    scheduler::thread::spawn_with_continuation(f, c_target)
}

/// Handler of [ActionId::LOCALITY_STOP]. The payload holds the stop code.
fn locality_stop(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let code: u64 = match <[u8; 8]>::try_from(payload) {
        Ok(bytes) => u64::from_le_bytes(bytes),
        Err(_) => 0,
    };
    debug!("locality_stop(): code={}", code);
    scheduler::stop(code)?;
    Ok(Vec::new())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Locality,
        Runtime,
    };
    use crate::runtime::{
        action::ActionId,
        config::Config,
        fail::Fail,
        gas::SmpAddressSpace,
        limits,
        network::{
            Loopback,
            Transport,
        },
        parcel::Parcel,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    /// Transport that claims more localities than an address can name.
    struct Oversized;

    impl Transport for Oversized {
        fn rank(&self) -> u32 {
            0
        }

        fn ranks(&self) -> u32 {
            limits::MAX_LOCALITIES + 1
        }

        fn deliver(&self, _: u32, _: Box<Parcel>) -> Result<(), Fail> {
            Err(Fail::new(libc::ENOTSUP, "no fabric"))
        }

        fn probe(&self) -> Option<Box<Parcel>> {
            None
        }
    }

    fn config(workers: usize) -> Result<Config, Fail> {
        Config::from_yaml_str(&format!("parallex:\n  worker_count: {}\n  stack_bytes: 65536\n", workers))
    }

    #[test]
    fn builtin_actions_come_first() -> Result<()> {
        let locality: Arc<Locality> = Locality::new(Arc::new(SmpAddressSpace::new(0, 1)), Loopback::single())?;
        crate::ensure_eq!(locality.actions().len(), ActionId::LOCALITY_STOP.0 as usize + 1);
        crate::ensure_eq!(locality.actions().name(ActionId::LCO_SET), Some("lco_set".to_string()));
        crate::ensure_eq!(
            locality.actions().name(ActionId::LOCALITY_STOP),
            Some("locality_stop".to_string())
        );
        Ok(())
    }

    #[test]
    fn mismatched_services_are_rejected() -> Result<()> {
        match Locality::new(Arc::new(SmpAddressSpace::new(1, 2)), Loopback::single()) {
            Ok(_) => anyhow::bail!("rank mismatch should be rejected"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
        }
        Ok(())
    }

    #[test]
    fn locality_count_is_bounded() -> Result<()> {
        let gas: Arc<SmpAddressSpace> = Arc::new(SmpAddressSpace::new(0, limits::MAX_LOCALITIES + 1));
        match Locality::new(gas, Arc::new(Oversized)) {
            Ok(_) => anyhow::bail!("an oversized fabric should be rejected"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EINVAL),
        }
        Ok(())
    }

    #[test]
    fn main_result_is_the_run_output() -> Result<()> {
        let runtime: Runtime = Runtime::new(&config(2)?)?;
        crate::ensure_eq!(runtime.run(|| Ok(b"done".to_vec()))?, b"done".to_vec());
        match runtime.run(|| Err(Fail::new(libc::EIO, "main failed"))) {
            Ok(_) => anyhow::bail!("run should report the failure of main"),
            Err(e) => crate::ensure_eq!(e.errno, libc::EIO),
        }
        Ok(())
    }

    #[test]
    fn exit_skips_the_rest_of_main() -> Result<()> {
        let runtime: Runtime = Runtime::new(&config(1)?)?;
        let output: Vec<u8> = runtime.run(|| {
            super::exit(Ok(vec![1]));
        })?;
        crate::ensure_eq!(output, vec![1]);
        Ok(())
    }

    #[test]
    fn actions_close_after_first_run() -> Result<()> {
        let runtime: Runtime = Runtime::new(&config(1)?)?;
        runtime.run(|| Ok(Vec::new()))?;
        crate::ensure_eq!(runtime.register_action("late", |_| Ok(Vec::new())).is_err(), true);
        Ok(())
    }
}
