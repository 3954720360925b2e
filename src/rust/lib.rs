// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lightweight-thread scheduler and Local Control Objects for parcel-driven runtimes.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod lco;
pub mod runtime;

pub use crate::runtime::{
    action::{
        ActionHandler,
        ActionId,
    },
    address::GlobalAddress,
    config::Config,
    fail::Fail,
    scheduler::thread,
    Locality,
    Runtime,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, or bails with both values.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, or bails with both values.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
