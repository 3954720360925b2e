// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod context;
mod stack;
pub(crate) mod worker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod cvar;
pub mod scheduler;
pub mod thread;

pub use self::{
    cvar::ConditionVariable,
    scheduler::{
        current_parcel,
        set_target_threads,
        spawn,
        spawn_at,
        stop,
        worker_count,
        Scheduler,
        SchedulerState,
    },
    thread::{
        current_context,
        yield_now,
        ContextInfo,
    },
};
pub(crate) use self::scheduler::{
    current_locality,
    signal_all,
    signal_error,
    wait,
};
