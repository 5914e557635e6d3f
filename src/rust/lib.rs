// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

cfg_if::cfg_if! {
    if #[cfg(not(all(target_os = "linux", target_env = "gnu")))] {
        compile_error!("uthread requires ucontext support (linux-gnu)");
    }
}

pub mod collections;
pub mod config;
pub mod runtime;

pub use crate::{
    config::Config,
    runtime::{
        fail::Fail,
        preempt,
        scheduler::{
            block,
            create,
            current,
            exit,
            run,
            run_with_config,
            state,
            stats,
            unblock,
            yield_now,
            SchedulerStats,
            ThreadId,
            ThreadState,
        },
        semaphore::{
            SemaphorePolicy,
            SharedSemaphore,
        },
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}` ({}:{})",
                        &*left_val,
                        &*right_val,
                        file!(),
                        line!()
                    );
                }
            }
        }
    });
}

/// Ensures that two expressions are not equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}` ({}:{})",
                        &*left_val,
                        &*right_val,
                        file!(),
                        line!()
                    );
                }
            }
        }
    });
}
