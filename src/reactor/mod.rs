// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod fd_context;

pub use fd_context::{
    FdContext,
    IoEvent,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::{
        Coroutine,
        CoroutineState,
        TaskFn,
    },
    runtime::{
        self,
        fail::Fail,
        limits,
    },
    scheduler::{
        self,
        Scheduler,
        SchedulerCore,
    },
    timer::{
        Timer,
        TimerCallback,
        TimerManager,
    },
};
use ::std::{
    cmp,
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        RwLock,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// epoll user-data token reserved for the wake pipe; never a valid fd.
const WAKE_TOKEN: u64 = u64::MAX;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The reactor: a scheduler whose idle coroutine multiplexes fd readiness,
/// timer expiries and cross-thread wakeups through one epoll instance.
///
/// Suspended I/O callers park a continuation here via [IoScheduler::add_event];
/// the reactor dispatches it back onto the registering scheduler's queue when
/// the fd turns ready (or a timeout fires first).
pub struct IoScheduler {
    /// Back-reference to the `Arc` this reactor lives in; continuations
    /// registered outside any scheduler dispatch back here.
    self_ref: Weak<IoScheduler>,
    core: SchedulerCore,
    /// The epoll instance owned by this reactor.
    epoll_fd: RawFd,
    /// Self-pipe: `[read, write]`. The read end is registered edge-triggered
    /// under [WAKE_TOKEN]; `tickle` writes one byte to the write end.
    wake_pipe: [RawFd; 2],
    /// Per-fd contexts, indexed by fd.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Registered-but-undispatched event count; part of the stop predicate.
    pending_events: AtomicUsize,
    /// Deadline set serviced by the reactor loop.
    timers: Arc<TimerManager>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IoScheduler {
    /// Creates a reactor with `thread_num` participating threads (see
    /// [SchedulerCore::new] for `use_creator`).
    pub fn new(thread_num: usize, use_creator: bool, name: &str) -> Result<Arc<Self>, Fail> {
        let epoll_fd: RawFd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let cause: String = "failed to create epoll instance".to_string();
                error!("new(): {}", cause);
                return Err(Fail::last_os_error(&cause));
            },
        };

        let mut pipe_fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let cause: String = "failed to create wake pipe".to_string();
            error!("new(): {}", cause);
            unsafe { libc::close(epoll_fd) };
            return Err(Fail::last_os_error(&cause));
        }
        for fd in pipe_fds {
            let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }

        // Watch the read end so a tickle interrupts epoll_wait.
        let mut event: libc::epoll_event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut event) } != 0 {
            let cause: String = "failed to register wake pipe".to_string();
            error!("new(): {}", cause);
            unsafe {
                libc::close(epoll_fd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(Fail::last_os_error(&cause));
        }

        let mut contexts: Vec<Arc<FdContext>> = Vec::with_capacity(limits::INITIAL_FD_CONTEXTS);
        for fd in 0..limits::INITIAL_FD_CONTEXTS {
            contexts.push(Arc::new(FdContext::new(fd as RawFd)));
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            core: SchedulerCore::new(thread_num, use_creator, name),
            epoll_fd,
            wake_pipe: pipe_fds,
            contexts: RwLock::new(contexts),
            pending_events: AtomicUsize::new(0),
            timers: TimerManager::new(),
        }))
    }

    /// Number of registered events not yet dispatched or removed.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Returns the context slot for `fd`, growing the table when needed.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut contexts = self.contexts.write().unwrap();
        // Re-check under the writer lock: a concurrent grower may have won.
        if contexts.len() <= fd as usize {
            let new_len: usize = cmp::max((fd as usize + 1) * 3 / 2, limits::INITIAL_FD_CONTEXTS);
            for fd in contexts.len()..new_len {
                contexts.push(Arc::new(FdContext::new(fd as RawFd)));
            }
        }
        contexts[fd as usize].clone()
    }

    /// Returns the context slot for `fd` only if the table already covers it.
    fn existing_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    /// Registers interest in `(fd, event)` with a continuation: the given
    /// closure, or (when `task` is `None`) the currently-running coroutine,
    /// so that firing the event resumes the suspended caller.
    ///
    /// Registering the same `(fd, event)` twice is a programmer error.
    pub fn add_event(&self, fd: RawFd, event: IoEvent, task: Option<TaskFn>) -> Result<(), Fail> {
        if fd < 0 {
            return Err(Fail::new(libc::EBADF, "add_event on a negative fd"));
        }
        let ctx: Arc<FdContext> = self.context_for(fd);
        let mut inner = ctx.lock();

        let op: libc::c_int = if inner.registered() == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };

        // The continuation dispatches back to whichever scheduler the caller
        // belongs to; callers outside any scheduler get this reactor.
        let owner: Weak<dyn Scheduler> = match scheduler::current_scheduler() {
            Some(scheduler) => Arc::downgrade(&scheduler),
            None => self.self_ref.clone(),
        };
        let coroutine: Option<Arc<Coroutine>> = if task.is_none() {
            let current: Arc<Coroutine> =
                Coroutine::current().expect("a continuation-less add_event must run inside a coroutine");
            assert_eq!(current.state(), CoroutineState::Running);
            Some(current)
        } else {
            None
        };

        // Update the context before the epoll syscall: a racing fire on
        // another worker must always find a valid continuation.
        inner.register(event, owner, coroutine, task);

        let mut epoll_event: libc::epoll_event = libc::epoll_event {
            events: inner.epoll_events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epoll_event) } != 0 {
            let errno: libc::c_int = runtime::errno();
            // Roll the registration back so the pending counter cannot drift.
            inner.deregister(event);
            let cause: String = format!("epoll_ctl failed (fd={:?}, op={:?}, errno={:?})", fd, op, errno);
            error!("add_event(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Withdraws interest in `(fd, event)` without running its continuation.
    /// Idempotent: returns `false` when the event was not registered.
    pub fn remove_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx: Arc<FdContext> = match self.existing_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.lock();
        if !inner.is_registered(event) {
            return false;
        }

        if !self.update_epoll(fd, inner.registered() & !event.mask()) {
            return false;
        }
        inner.deregister(event);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Withdraws interest in `(fd, event)` and dispatches its continuation
    /// to the owning scheduler ("stop waiting, wake the caller"). This is
    /// what hooked timeouts call.
    pub fn remove_and_fire(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx: Arc<FdContext> = match self.existing_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.lock();
        if !inner.is_registered(event) {
            return false;
        }

        if !self.update_epoll(fd, inner.registered() & !event.mask()) {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.fire(event);
        true
    }

    /// Withdraws and fires every registered direction of `fd`; used when the
    /// fd is closed so pending continuations wake and observe the failure.
    pub fn remove_and_fire_all(&self, fd: RawFd) -> bool {
        let ctx: Arc<FdContext> = match self.existing_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.lock();
        if inner.registered() == 0 {
            return false;
        }

        if !self.update_epoll(fd, 0) {
            return false;
        }
        if inner.is_registered(IoEvent::Read) {
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
            inner.fire(IoEvent::Read);
        }
        if inner.is_registered(IoEvent::Write) {
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
            inner.fire(IoEvent::Write);
        }
        assert_eq!(inner.registered(), 0);
        true
    }

    /// Reflects a leftover-interest mask into epoll (MOD, or DEL when none
    /// is left). Returns whether the syscall succeeded.
    fn update_epoll(&self, fd: RawFd, leftover: u32) -> bool {
        let op: libc::c_int = if leftover == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut events: u32 = libc::EPOLLET as u32;
        if leftover & IoEvent::Read.mask() != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if leftover & IoEvent::Write.mask() != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        let mut epoll_event: libc::epoll_event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epoll_event) } != 0 {
            let cause: String = format!(
                "epoll_ctl failed (fd={:?}, op={:?}, errno={:?})",
                fd,
                op,
                runtime::errno()
            );
            error!("update_epoll(): {}", cause);
            return false;
        }
        true
    }

    /// Adds a timer to the embedded manager, waking the reactor when the new
    /// timer became the next deadline.
    pub fn add_timer(&self, interval_ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer: Arc<Timer> = self.timers.add_timer(interval_ms, callback, recurring);
        self.tickle_for_new_head();
        timer
    }

    /// Adds a condition timer (see [TimerManager::add_condition_timer]).
    pub fn add_condition_timer(
        &self,
        interval_ms: u64,
        callback: TimerCallback,
        condition: Weak<AtomicBool>,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer: Arc<Timer> = self
            .timers
            .add_condition_timer(interval_ms, callback, condition, recurring);
        self.tickle_for_new_head();
        timer
    }

    fn tickle_for_new_head(&self) {
        if self.timers.need_tickle() {
            self.tickle();
            self.timers.set_tickled();
        }
    }

    /// Empties the wake pipe. Runs on every reactor pass that saw the wake
    /// token; loops until `EAGAIN`.
    fn drain_wake_pipe(&self) {
        let mut buf: [u8; limits::WAKE_PIPE_DRAIN_SIZE] = [0; limits::WAKE_PIPE_DRAIN_SIZE];
        loop {
            let n: isize =
                unsafe { libc::read(self.wake_pipe[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Scheduler for IoScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Wakes one reactor pass by writing a byte into the self-pipe. Skipped
    /// when no worker is parked in idle (nobody is blocked in epoll_wait).
    fn tickle(&self) {
        if !self.core.has_idle_workers() {
            return;
        }
        let byte: u8 = 1;
        let n: isize = unsafe { libc::write(self.wake_pipe[1], &byte as *const u8 as *const libc::c_void, 1) };
        // A full pipe already guarantees a pending wakeup.
        if n != 1 && runtime::errno() != libc::EAGAIN {
            warn!("tickle(): wake pipe write failed (errno={:?})", runtime::errno());
        }
    }

    /// Base predicate extended with "no pending I/O events and no timers".
    fn stoppable(&self) -> bool {
        self.timers.next_deadline_ms().is_none()
            && self.pending_events.load(Ordering::Acquire) == 0
            && self.core.base_stoppable()
    }

    /// The reactor loop, run inside each worker's idle coroutine.
    fn idle(&self) {
        debug!("idle(): reactor loop on thread {}", runtime::current_thread_id());
        let mut ready: Vec<libc::epoll_event> = Vec::with_capacity(limits::EPOLL_BATCH_SIZE);
        loop {
            if self.stoppable() {
                debug!("idle(): reactor on thread {} may stop", runtime::current_thread_id());
                break;
            }

            // Sleep until the next deadline, the 5 s cap, or a readiness/
            // tickle event, whichever comes first.
            let timeout_ms: u64 = cmp::min(self.timers.next_deadline_or_infinite(), limits::MAX_EPOLL_TIMEOUT_MS);
            let nready: libc::c_int = loop {
                let rc: libc::c_int = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        ready.as_mut_ptr(),
                        limits::EPOLL_BATCH_SIZE as libc::c_int,
                        timeout_ms as libc::c_int,
                    )
                };
                if rc == -1 && runtime::errno() == libc::EINTR {
                    continue;
                }
                break rc;
            };
            if nready < 0 {
                error!("idle(): epoll_wait failed (errno={:?})", runtime::errno());
            }
            unsafe { ready.set_len(cmp::max(nready, 0) as usize) };

            // Timers first; their callbacks typically enqueue resumptions
            // that the scheduler runs after this coroutine yields.
            for callback in self.timers.collect_due() {
                callback();
            }

            for index in 0..ready.len() {
                let token: u64 = ready[index].u64;
                let revents: u32 = ready[index].events;

                if token == WAKE_TOKEN {
                    self.drain_wake_pipe();
                    continue;
                }

                let fd: RawFd = token as RawFd;
                let ctx: Arc<FdContext> = match self.existing_context(fd) {
                    Some(ctx) => ctx,
                    None => continue,
                };
                let mut inner = ctx.lock();
                if inner.registered() == 0 {
                    continue;
                }

                // Error/hangup wakes every registered direction, so the
                // caller's retry observes the failure.
                let mut revents: u32 = revents;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.epoll_events();
                }
                let mut fired: u32 = 0;
                if revents & libc::EPOLLIN as u32 != 0 {
                    fired |= IoEvent::Read.mask();
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    fired |= IoEvent::Write.mask();
                }
                fired &= inner.registered();
                if fired == 0 {
                    continue;
                }

                // Keep epoll in sync with the not-yet-fired leftover set; a
                // failing fd is skipped so others continue to be serviced.
                if !self.update_epoll(fd, inner.registered() & !fired) {
                    continue;
                }

                if fired & IoEvent::Read.mask() != 0 {
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                    inner.fire(IoEvent::Read);
                }
                if fired & IoEvent::Write.mask() != 0 {
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                    inner.fire(IoEvent::Write);
                }
            }
            ready.clear();

            // Hand control back to the worker loop so it can run whatever
            // the reactor just enqueued.
            Coroutine::current()
                .expect("the reactor loop runs inside the idle coroutine")
                .yield_now();
        }
    }

    fn as_io(self: Arc<Self>) -> Option<Arc<IoScheduler>> {
        Some(self)
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_pipe[0]);
            libc::close(self.wake_pipe[1]);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        IoEvent,
        IoScheduler,
    };
    use crate::scheduler::Scheduler;
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn test_remove_unregistered_event_is_idempotent() -> Result<()> {
        let io: Arc<IoScheduler> = IoScheduler::new(1, false, "reactor-unit")?;
        crate::ensure!(!io.remove_event(10, IoEvent::Read));
        crate::ensure!(!io.remove_event(10, IoEvent::Write));
        crate::ensure!(!io.remove_and_fire(10, IoEvent::Read));
        crate::ensure!(!io.remove_and_fire_all(10));
        crate::ensure_eq!(io.pending_events(), 0);
        io.stop();
        Ok(())
    }

    #[test]
    fn test_failed_registration_rolls_back() -> Result<()> {
        let io: Arc<IoScheduler> = IoScheduler::new(1, false, "reactor-rollback")?;
        // Closure continuation on an fd that is not open: epoll_ctl refuses,
        // and the partial registration must be unwound.
        let bogus_fd: i32 = 700;
        crate::ensure!(io.add_event(bogus_fd, IoEvent::Read, Some(Box::new(|| ()))).is_err());
        crate::ensure_eq!(io.pending_events(), 0);
        crate::ensure!(!io.remove_event(bogus_fd, IoEvent::Read));
        io.stop();
        Ok(())
    }

    #[test]
    fn test_negative_fd_is_rejected() -> Result<()> {
        let io: Arc<IoScheduler> = IoScheduler::new(1, false, "reactor-badfd")?;
        let err = io
            .add_event(-1, IoEvent::Write, Some(Box::new(|| ())))
            .expect_err("negative fds are invalid");
        crate::ensure_eq!(err.errno, libc::EBADF);
        io.stop();
        Ok(())
    }
}
