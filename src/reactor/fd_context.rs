// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::{
        Coroutine,
        TaskFn,
    },
    scheduler::{
        ScheduleTask,
        Scheduler,
    },
};
use ::std::{
    os::fd::RawFd,
    sync::{
        Arc,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An I/O direction a continuation can wait on.
///
/// The mask encoding keeps "nothing registered" (0) distinct from either
/// direction, so a context's bitset is never ambiguous.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoEvent {
    Read = 1,
    Write = 2,
}

/// What to run when a direction becomes ready: exactly one of a captured
/// coroutine or a closure, dispatched onto the scheduler that registered it.
pub struct EventContext {
    /// Scheduler the continuation is dispatched to.
    scheduler: Weak<dyn Scheduler>,
    /// Captured coroutine continuation.
    coroutine: Option<Arc<Coroutine>>,
    /// Callback alternative to a coroutine.
    closure: Option<TaskFn>,
}

/// Reactor bookkeeping for one file descriptor: which directions are
/// registered with epoll and what continuation each holds.
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

/// Mutable part of [FdContext]; one short mutex serializes registration
/// against event firing.
pub struct FdContextInner {
    /// Bitset of registered [IoEvent]s.
    registered: u32,
    read: EventContext,
    write: EventContext,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for EventContext {
    fn default() -> Self {
        Self {
            scheduler: Weak::<crate::reactor::IoScheduler>::new(),
            coroutine: None,
            closure: None,
        }
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IoEvent {
    pub fn mask(self) -> u32 {
        self as u32
    }

    /// The epoll flag carrying this direction.
    pub fn epoll_flag(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.strong_count() == 0 && self.coroutine.is_none() && self.closure.is_none()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl FdContext {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdContextInner {
                registered: 0,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FdContextInner> {
        self.inner.lock().unwrap()
    }
}

impl FdContextInner {
    pub fn registered(&self) -> u32 {
        self.registered
    }

    pub fn is_registered(&self, event: IoEvent) -> bool {
        self.registered & event.mask() != 0
    }

    /// Translates the registered bitset into edge-triggered epoll flags.
    pub fn epoll_events(&self) -> u32 {
        let mut events: u32 = libc::EPOLLET as u32;
        if self.registered & IoEvent::Read.mask() != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if self.registered & IoEvent::Write.mask() != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn event_context_mut(&mut self, event: IoEvent) -> &mut EventContext {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }

    /// Installs a continuation for `event`. The direction must not already
    /// be registered (double registration is a programmer error).
    pub fn register(
        &mut self,
        event: IoEvent,
        scheduler: Weak<dyn Scheduler>,
        coroutine: Option<Arc<Coroutine>>,
        closure: Option<TaskFn>,
    ) {
        assert!(
            !self.is_registered(event),
            "event {:?} already registered on this fd",
            event
        );
        self.registered |= event.mask();
        let ctx: &mut EventContext = self.event_context_mut(event);
        assert!(ctx.is_empty(), "stale continuation for {:?}", event);
        ctx.scheduler = scheduler;
        ctx.coroutine = coroutine;
        ctx.closure = closure;
    }

    /// Drops the continuation for `event` without running it.
    pub fn deregister(&mut self, event: IoEvent) {
        self.registered &= !event.mask();
        self.event_context_mut(event).reset();
    }

    /// Fires `event`: clears its bit and its continuation, then dispatches
    /// the continuation to the scheduler that registered it.
    pub fn fire(&mut self, event: IoEvent) {
        assert!(self.is_registered(event), "firing an unregistered event {:?}", event);
        self.registered &= !event.mask();

        let ctx: &mut EventContext = self.event_context_mut(event);
        let scheduler: Option<Arc<dyn Scheduler>> = ctx.scheduler.upgrade();
        let coroutine: Option<Arc<Coroutine>> = ctx.coroutine.take();
        let closure: Option<TaskFn> = ctx.closure.take();
        ctx.reset();

        let scheduler: Arc<dyn Scheduler> = match scheduler {
            Some(scheduler) => scheduler,
            // Whoever registered the continuation is gone; nothing to wake.
            None => return,
        };
        if let Some(closure) = closure {
            scheduler.submit(ScheduleTask::boxed(closure));
        } else if let Some(coroutine) = coroutine {
            scheduler.submit(ScheduleTask::coroutine(coroutine));
        }
    }
}
