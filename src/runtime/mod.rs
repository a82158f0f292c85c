// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod fail;
pub mod limits;
pub mod logging;

pub use fail::Fail;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    sync::OnceLock,
    time::Instant,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Origin of the runtime's monotonic clock. Pinned on first use so that every
/// component measures milliseconds against the same epoch.
static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns monotonic milliseconds since the process-wide clock origin.
///
/// All runtime timeouts and timer deadlines are expressed against this clock;
/// wall-clock time is never consulted, so clock rollback cannot occur.
pub fn now_ms() -> u64 {
    CLOCK_ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Returns the OS thread id of the calling thread.
pub fn current_thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Reads the calling thread's errno.
pub fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

/// Sets the calling thread's errno.
pub fn set_errno(value: libc::c_int) {
    unsafe { *libc::__errno_location() = value }
}
