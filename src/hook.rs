// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative syscall wrappers.
//!
//! Each wrapper keeps the libc contract (return value and errno) but, when
//! hooking is enabled for the calling thread and the fd is a runtime-managed
//! socket, converts blocking into cooperative suspension: `EINTR` retries,
//! `EAGAIN` parks the calling coroutine in the I/O scheduler, and a
//! configured timeout surfaces as `ETIMEDOUT`.
//!
//! Hooking is per-thread opt-in; scheduler workers enable it on entry. With
//! hooking disabled every wrapper calls straight through to libc.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    coroutine::Coroutine,
    fd_table::{
        fd_table,
        Direction,
        FdInfo,
    },
    reactor::{
        IoEvent,
        IoScheduler,
    },
    runtime::{
        self,
        limits,
    },
    scheduler::{
        current_io_scheduler,
        Scheduler,
    },
    timer::Timer,
};
use ::std::{
    cell::Cell,
    mem,
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Weak,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

thread_local! {
    /// Does this thread convert blocking syscalls into suspension points?
    static HOOKING_ENABLED: Cell<bool> = const { Cell::new(false) };
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub fn is_hooking_enabled() -> bool {
    HOOKING_ENABLED.with(|flag| flag.get())
}

pub fn set_hooking_enabled(enabled: bool) {
    HOOKING_ENABLED.with(|flag| flag.set(enabled));
}

/// Common driver for hooked I/O syscalls: retry on `EINTR`; on `EAGAIN`,
/// register `(fd, event)` with the thread's I/O scheduler (continuation =
/// current coroutine), arm a condition timer when a timeout is configured,
/// and yield; on resume either retry or report `ETIMEDOUT`.
fn do_io<F>(fd: RawFd, event: IoEvent, direction: Direction, mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hooking_enabled() {
        return op();
    }
    let info: Arc<FdInfo> = match fd_table().get(fd, false) {
        Some(info) => info,
        None => return op(),
    };
    if info.is_closed() {
        runtime::set_errno(libc::EBADF);
        return -1;
    }
    // The application either opted into non-blocking itself or the fd is not
    // a socket: behave exactly as the raw call would.
    if !info.is_socket() || info.is_user_nonblock() {
        return op();
    }

    let timeout_ms: u64 = info.timeout_ms(direction);
    // Guard for the readiness/timeout race: lives on this frame, so a timer
    // firing after we returned finds a dead weak reference and does nothing.
    let timed_out: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    loop {
        let mut n: isize = op();
        while n == -1 && runtime::errno() == libc::EINTR {
            n = op();
        }
        if !(n == -1 && runtime::errno() == libc::EAGAIN) {
            return n;
        }

        // Not ready: park this coroutine in the reactor.
        let io: Arc<IoScheduler> = match current_io_scheduler() {
            Some(io) => io,
            None => return n,
        };
        let timer: Option<Arc<Timer>> = if timeout_ms != limits::TIMEOUT_INFINITE {
            let io_weak: Weak<IoScheduler> = Arc::downgrade(&io);
            let flag_weak: Weak<AtomicBool> = Arc::downgrade(&timed_out);
            Some(io.add_condition_timer(
                timeout_ms,
                Arc::new(move || {
                    if let Some(flag) = flag_weak.upgrade() {
                        flag.store(true, Ordering::Release);
                    }
                    if let Some(io) = io_weak.upgrade() {
                        io.remove_and_fire(fd, event);
                    }
                }),
                Arc::downgrade(&timed_out),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = io.add_event(fd, event, None) {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            error!("do_io(): cannot register {:?} on fd {:?}: {:?}", event, fd, e);
            runtime::set_errno(e.errno);
            return -1;
        }

        Coroutine::current()
            .expect("hooked I/O suspends the running coroutine")
            .yield_now();

        // Resumed by readiness or by the timeout; cancelling is idempotent.
        if let Some(timer) = &timer {
            timer.cancel();
        }
        if timed_out.load(Ordering::Acquire) {
            runtime::set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
}

/// Suspends the calling coroutine for `ms` milliseconds. A zero duration, a
/// disabled hook, or a thread without an I/O scheduler falls back to a
/// blocking sleep.
pub fn sleep_ms(ms: u64) {
    if !is_hooking_enabled() || ms == 0 {
        thread::sleep(Duration::from_millis(ms));
        return;
    }
    let io: Arc<IoScheduler> = match current_io_scheduler() {
        Some(io) => io,
        None => {
            thread::sleep(Duration::from_millis(ms));
            return;
        },
    };
    let coroutine: Arc<Coroutine> = Coroutine::current().expect("hooked sleep suspends the running coroutine");

    let io_weak: Weak<IoScheduler> = Arc::downgrade(&io);
    let resumed: Arc<Coroutine> = coroutine.clone();
    io.add_timer(
        ms,
        Arc::new(move || {
            if let Some(io) = io_weak.upgrade() {
                io.submit_coroutine(resumed.clone());
            }
        }),
        false,
    );
    coroutine.yield_now();
}

/// [sleep_ms] over a [Duration] (sub-millisecond durations round up to 1 ms).
pub fn sleep(duration: Duration) {
    if duration.is_zero() {
        thread::sleep(duration);
        return;
    }
    let ms: u64 = duration.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
    sleep_ms(ms);
}

/// Creates a socket and registers it with the fd registry, which flips it to
/// system-level non-blocking. Registration happens regardless of the
/// per-thread hook flag so that sockets created on a setup thread suspend
/// correctly once used from a worker.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> RawFd {
    let fd: RawFd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 {
        let _ = fd_table().get(fd, true);
    }
    fd
}

/// Hooked accept; the accepted fd is registered with the fd registry.
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> isize {
    let n: isize = do_io(fd, IoEvent::Read, Direction::Read, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 {
        let _ = fd_table().get(n as RawFd, true);
    }
    n
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let ptr: *mut libc::c_void = buf.as_mut_ptr() as *mut libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Read, Direction::Read, || unsafe { libc::read(fd, ptr, len) })
}

pub fn readv(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let ptr: *const libc::iovec = iov.as_ptr();
    let count: libc::c_int = iov.len() as libc::c_int;
    do_io(fd, IoEvent::Read, Direction::Read, || unsafe { libc::readv(fd, ptr, count) })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> isize {
    let ptr: *mut libc::c_void = buf.as_mut_ptr() as *mut libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Read, Direction::Read, || unsafe {
        libc::recv(fd, ptr, len, flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr: *mut libc::c_void = buf.as_mut_ptr() as *mut libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Read, Direction::Read, || unsafe {
        libc::recvfrom(fd, ptr, len, flags, addr, addrlen)
    })
}

pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, IoEvent::Read, Direction::Read, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let ptr: *const libc::c_void = buf.as_ptr() as *const libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Write, Direction::Write, || unsafe { libc::write(fd, ptr, len) })
}

pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let ptr: *const libc::iovec = iov.as_ptr();
    let count: libc::c_int = iov.len() as libc::c_int;
    do_io(fd, IoEvent::Write, Direction::Write, || unsafe {
        libc::writev(fd, ptr, count)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> isize {
    let ptr: *const libc::c_void = buf.as_ptr() as *const libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Write, Direction::Write, || unsafe {
        libc::send(fd, ptr, len, flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr: *const libc::c_void = buf.as_ptr() as *const libc::c_void;
    let len: usize = buf.len();
    do_io(fd, IoEvent::Write, Direction::Write, || unsafe {
        libc::sendto(fd, ptr, len, flags, addr, addrlen)
    })
}

pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, IoEvent::Write, Direction::Write, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Hooked connect with an explicit timeout. Semantics:
/// - zero timeout, disabled hook, unknown/non-socket/user-nonblocking fd:
///   the raw call, as-is;
/// - `EINPROGRESS`: wait for writability (bounded by the timeout), then read
///   `SO_ERROR` to decide the outcome.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> libc::c_int {
    let raw = || unsafe { libc::connect(fd, addr, addrlen) };
    if !is_hooking_enabled() {
        return raw();
    }
    let info: Arc<FdInfo> = match fd_table().get(fd, false) {
        Some(info) => info,
        None => return raw(),
    };
    if info.is_closed() {
        runtime::set_errno(libc::EBADF);
        return -1;
    }
    if !info.is_socket() || info.is_user_nonblock() {
        return raw();
    }
    if timeout_ms == 0 {
        return raw();
    }

    let ret: libc::c_int = raw();
    if ret == 0 {
        return 0;
    }
    if !(ret == -1 && runtime::errno() == libc::EINPROGRESS) {
        return ret;
    }
    let io: Arc<IoScheduler> = match current_io_scheduler() {
        Some(io) => io,
        None => return ret,
    };

    let timed_out: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let timer: Option<Arc<Timer>> = if timeout_ms != limits::TIMEOUT_INFINITE {
        let io_weak: Weak<IoScheduler> = Arc::downgrade(&io);
        let flag_weak: Weak<AtomicBool> = Arc::downgrade(&timed_out);
        Some(io.add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                if let Some(flag) = flag_weak.upgrade() {
                    flag.store(true, Ordering::Release);
                }
                if let Some(io) = io_weak.upgrade() {
                    io.remove_and_fire(fd, IoEvent::Write);
                }
            }),
            Arc::downgrade(&timed_out),
            false,
        ))
    } else {
        None
    };

    match io.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Coroutine::current()
                .expect("hooked connect suspends the running coroutine")
                .yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if timed_out.load(Ordering::Acquire) {
                runtime::set_errno(libc::ETIMEDOUT);
                return -1;
            }
        },
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            error!("connect_with_timeout(): cannot register write on fd {:?}: {:?}", fd, e);
        },
    }

    // Writability signalled completion; SO_ERROR tells which way it went.
    let mut so_error: libc::c_int = 0;
    let mut len: libc::socklen_t = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc: libc::c_int = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        runtime::set_errno(libc::EBADF);
        return -1;
    }
    if so_error == 0 {
        return 0;
    }
    runtime::set_errno(so_error);
    -1
}

/// Hooked connect using the fd's `SO_SNDTIMEO` bookkeeping when set, the
/// configured default otherwise.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> libc::c_int {
    let timeout_ms: u64 = match fd_table().get(fd, false) {
        Some(info) if info.timeout_ms(Direction::Write) != limits::TIMEOUT_INFINITE => {
            info.timeout_ms(Direction::Write)
        },
        _ => Config::global().connect_timeout_ms,
    };
    connect_with_timeout(fd, addr, addrlen, timeout_ms)
}

/// Hooked close: wakes any continuation still parked on the fd (so its
/// syscall retry observes the failure), evicts the registry entry, then
/// closes the fd.
pub fn close(fd: RawFd) -> libc::c_int {
    if !is_hooking_enabled() {
        return unsafe { libc::close(fd) };
    }
    let info: Option<Arc<FdInfo>> = fd_table().get(fd, false);
    if let Some(info) = info {
        if let Some(io) = current_io_scheduler() {
            io.remove_and_fire_all(fd);
        }
        info.set_closed();
        fd_table().remove(fd);
    }
    unsafe { libc::close(fd) }
}

/// The `fcntl(F_SETFL, O_NONBLOCK)` / `ioctl(FIONBIO)` contract: records the
/// application's wish in the registry and applies the real flag change while
/// preserving the runtime's system-level `O_NONBLOCK`.
pub fn set_user_nonblocking(fd: RawFd, enabled: bool) -> libc::c_int {
    let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return flags;
    }
    let mut new_flags: libc::c_int = if enabled {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    match fd_table().get(fd, false) {
        Some(info) if info.is_socket() && !info.is_closed() => {
            info.set_user_nonblock(enabled);
            if info.is_sys_nonblock() {
                new_flags |= libc::O_NONBLOCK;
            }
        },
        _ => (),
    }
    unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) }
}

/// The `fcntl(F_GETFL)` contract: reports what the application set, masking
/// the runtime's system-level `O_NONBLOCK`.
pub fn is_user_nonblocking(fd: RawFd) -> bool {
    match fd_table().get(fd, false) {
        Some(info) if info.is_socket() && !info.is_closed() => info.is_user_nonblock(),
        _ => {
            let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            flags >= 0 && (flags & libc::O_NONBLOCK) != 0
        },
    }
}

/// The `setsockopt(SOL_SOCKET, SO_RCVTIMEO|SO_SNDTIMEO)` contract: stores the
/// timeout in the registry and still applies the real socket option so that
/// call-through paths behave.
pub fn set_timeout(fd: RawFd, direction: Direction, timeout_ms: u64) -> libc::c_int {
    if let Some(info) = fd_table().get(fd, false) {
        info.set_timeout_ms(direction, timeout_ms);
    }
    let optname: libc::c_int = match direction {
        Direction::Read => libc::SO_RCVTIMEO,
        Direction::Write => libc::SO_SNDTIMEO,
    };
    // The sentinel maps to a zeroed timeval, which the kernel reads as
    // "no timeout".
    let effective_ms: u64 = if timeout_ms == limits::TIMEOUT_INFINITE { 0 } else { timeout_ms };
    let tv: libc::timeval = libc::timeval {
        tv_sec: (effective_ms / 1000) as libc::time_t,
        tv_usec: ((effective_ms % 1000) * 1000) as libc::suseconds_t,
    };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    }
}
