// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stackful coroutine runtime bound to a multi-threaded cooperative
//! scheduler, with an epoll reactor that folds socket readiness, timer
//! expiries and cross-thread wakeups into coroutine resumptions.
//!
//! Blocking-looking I/O goes through the [hook] wrappers: on `EAGAIN` the
//! calling coroutine parks itself in the reactor and yields; readiness (or a
//! timeout) re-schedules it on its scheduler, and the wrapper retries.

#[macro_use]
extern crate log;

pub mod byte_array;
pub mod config;
pub mod coroutine;
pub mod fd_table;
pub mod hook;
pub mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod socket;
pub mod tcp_server;
pub mod timer;

pub use crate::{
    byte_array::ByteArray,
    config::Config,
    coroutine::Coroutine,
    reactor::IoScheduler,
    runtime::fail::Fail,
    scheduler::{
        BasicScheduler,
        ScheduleTask,
        Scheduler,
        SchedulerExt,
    },
    socket::Socket,
    tcp_server::TcpServer,
    timer::{
        Timer,
        TimerManager,
    },
};

/// Asserts that a condition holds, returning an error instead of panicking.
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !$cond {
            ::anyhow::bail!("condition failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            ::anyhow::bail!($($arg)+);
        }
    };
}

/// Asserts that two expressions are equal, returning an error instead of panicking.
#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr $(,)?) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs != rhs {
            ::anyhow::bail!(
                "{} != {} ({:?} != {:?})",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}

/// Asserts that two expressions differ, returning an error instead of panicking.
#[macro_export]
macro_rules! ensure_neq {
    ($lhs:expr, $rhs:expr $(,)?) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs == rhs {
            ::anyhow::bail!(
                "{} == {} ({:?} == {:?})",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}
