// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Machine-context save/restore primitives.
//!
//! A [SavedContext] holds exactly the callee-saved register set of the
//! platform ABI plus the stack pointer and resume address. [switch] stores
//! the calling context into `old` and resumes `new`; it returns when some
//! other context switches back into `old`.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{
    init_context,
    switch,
    SavedContext,
};
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{
    init_context,
    switch,
    SavedContext,
};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("no context-switch support for this architecture");
