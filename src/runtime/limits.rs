// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Tunable constants. Values that have a configuration knob list their
//! default here; the rest are fixed by the runtime's design.

/// Default usable stack size for a task coroutine (bytes).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack the runtime will allocate (bytes).
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default base node size for a byte array (bytes).
pub const DEFAULT_NODE_SIZE: usize = 4096;

/// Maximum number of events collected per `epoll_wait` call.
pub const EPOLL_BATCH_SIZE: usize = 256;

/// Hard upper bound on the reactor's `epoll_wait` timeout (milliseconds).
/// Workers wake at least this often even with no registered interest.
pub const MAX_EPOLL_TIMEOUT_MS: u64 = 5000;

/// Chunk size used when draining the wake pipe.
pub const WAKE_PIPE_DRAIN_SIZE: usize = 256;

/// Initial capacity of the reactor's per-fd context table.
pub const INITIAL_FD_CONTEXTS: usize = 32;

/// Initial capacity of the hooked-fd registry.
pub const INITIAL_FD_INFOS: usize = 64;

/// Sentinel meaning "no timeout configured".
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

/// Default connect timeout applied when the caller did not set one (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default read timeout installed on sockets accepted by the server (ms).
pub const DEFAULT_SERVER_READ_TIMEOUT_MS: u64 = 120_000;
