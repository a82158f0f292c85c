// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod arch;
pub mod stack;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    arch::SavedContext,
    stack::Stack,
};
use crate::{
    config::Config,
    runtime::fail::Fail,
};
use ::std::{
    cell::{
        RefCell,
        UnsafeCell,
    },
    panic::{
        self,
        AssertUnwindSafe,
    },
    sync::{
        atomic::{
            AtomicU64,
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of coroutine identifiers.
static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(0);

/// Gauge of live coroutines across the process.
static LIVE_COROUTINES: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The coroutine currently executing on this thread.
    static RUNNING_COROUTINE: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    /// The thread's sentinel coroutine: the context the OS thread itself
    /// runs in once it has entered coroutine mode.
    static MAIN_COROUTINE: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task payload executed by a coroutine.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of a coroutine.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoroutineState {
    /// May be resumed.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// Task completed (or never installed); may be reset or dropped.
    Stopped = 2,
}

/// A stackful cooperative task.
///
/// Task coroutines own a heap stack and a machine context; the per-thread
/// sentinel coroutine owns neither (it runs on the OS thread's own stack).
/// Control transfers are asymmetric: `resume` switches from the caller into
/// the coroutine, `yield_now` switches back to whichever coroutine performed
/// the resume.
pub struct Coroutine {
    /// Monotonic identifier.
    id: u64,
    /// Back-reference to the `Arc` this coroutine lives in; lets `resume`
    /// install the coroutine into the thread's running slot.
    self_ref: Weak<Coroutine>,
    /// Stack region; `None` for a thread's sentinel coroutine.
    stack: Option<Stack>,
    /// Lifecycle state.
    state: AtomicU8,
    /// Saved machine context.
    ctx: UnsafeCell<SavedContext>,
    /// Task closure; consumed by the trampoline on first run.
    task: UnsafeCell<Option<TaskFn>>,
    /// The coroutine that must regain control on yield. Re-captured at every
    /// resume so that a continuation may be resumed from any worker thread.
    parent: Mutex<Weak<Coroutine>>,
}

// A coroutine's context, task and stack are only ever touched by the thread
// that currently runs it (or exclusively owns it while suspended); handoff
// between threads goes through the scheduler queue, whose mutex provides the
// happens-before edge. The state word is atomic for the cross-thread
// running-skip check in the scheduler loop.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Coroutine {
    /// Creates a coroutine in `Ready` state. A `stack_size` of zero selects
    /// the configured default.
    pub fn new(task: TaskFn, stack_size: usize) -> Result<Arc<Self>, Fail> {
        let stack_size: usize = if stack_size == 0 {
            Config::global().stack_size
        } else {
            stack_size
        };
        let stack: Stack = Stack::new(stack_size)?;
        let coroutine: Arc<Self> = Arc::new_cyclic(|self_ref| Self {
            id: NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            stack: Some(stack),
            state: AtomicU8::new(CoroutineState::Ready as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            task: UnsafeCell::new(Some(task)),
            parent: Mutex::new(Weak::new()),
        });
        coroutine.init_entry_context();
        LIVE_COROUTINES.fetch_add(1, Ordering::Relaxed);
        trace!("coroutine {} created", coroutine.id);
        Ok(coroutine)
    }

    /// Creates a task coroutine in `Stopped` state with no task installed.
    /// Used for pooling: `reset` arms it with a closure before each run.
    pub fn new_pooled(stack_size: usize) -> Result<Arc<Self>, Fail> {
        let stack_size: usize = if stack_size == 0 {
            Config::global().stack_size
        } else {
            stack_size
        };
        let stack: Stack = Stack::new(stack_size)?;
        let coroutine: Arc<Self> = Arc::new_cyclic(|self_ref| Self {
            id: NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            stack: Some(stack),
            state: AtomicU8::new(CoroutineState::Stopped as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            task: UnsafeCell::new(None),
            parent: Mutex::new(Weak::new()),
        });
        LIVE_COROUTINES.fetch_add(1, Ordering::Relaxed);
        trace!("coroutine {} created (pooled)", coroutine.id);
        Ok(coroutine)
    }

    /// Builds the thread's sentinel coroutine: no stack, already `Running`.
    fn new_sentinel() -> Arc<Self> {
        let coroutine: Arc<Self> = Arc::new_cyclic(|self_ref| Self {
            id: NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            stack: None,
            state: AtomicU8::new(CoroutineState::Running as u8),
            ctx: UnsafeCell::new(SavedContext::default()),
            task: UnsafeCell::new(None),
            parent: Mutex::new(Weak::new()),
        });
        LIVE_COROUTINES.fetch_add(1, Ordering::Relaxed);
        trace!("coroutine {} created (sentinel)", coroutine.id);
        coroutine
    }

    /// Puts the calling OS thread into coroutine mode: installs the sentinel
    /// coroutine as both the thread's main and running coroutine. Idempotent.
    pub fn init_thread() {
        MAIN_COROUTINE.with(|main| {
            let mut main = main.borrow_mut();
            if main.is_none() {
                let sentinel: Arc<Coroutine> = Self::new_sentinel();
                *main = Some(sentinel.clone());
                set_running(Some(sentinel));
            }
        });
    }

    /// The coroutine currently executing on this thread.
    pub fn current() -> Option<Arc<Coroutine>> {
        RUNNING_COROUTINE.with(|c| c.borrow().clone())
    }

    /// This thread's sentinel coroutine, if the thread entered coroutine mode.
    pub fn thread_main() -> Option<Arc<Coroutine>> {
        MAIN_COROUTINE.with(|c| c.borrow().clone())
    }

    /// Number of live coroutines across the process.
    pub fn live_count() -> u64 {
        LIVE_COROUTINES.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CoroutineState {
        match self.state.load(Ordering::Acquire) {
            0 => CoroutineState::Ready,
            1 => CoroutineState::Running,
            _ => CoroutineState::Stopped,
        }
    }

    fn set_state(&self, state: CoroutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Re-arms a `Stopped` task coroutine with a new closure, reusing its
    /// stack, and returns it to `Ready`.
    pub fn reset(&self, task: TaskFn) {
        assert_eq!(self.state(), CoroutineState::Stopped, "only a stopped coroutine can be reset");
        assert!(self.stack.is_some(), "the sentinel coroutine cannot be reset");
        // Exclusive access: a stopped coroutine has no frame on its stack and
        // is owned by the calling thread.
        unsafe { *self.task.get() = Some(task) };
        self.init_entry_context();
        self.set_state(CoroutineState::Ready);
    }

    /// Transfers control from the calling coroutine into `self`.
    ///
    /// The caller becomes `self`'s parent and regains control when `self`
    /// yields or stops.
    pub fn resume(&self) {
        assert_eq!(self.state(), CoroutineState::Ready, "only a ready coroutine can be resumed");
        let me: Arc<Coroutine> = self.self_ref.upgrade().expect("a live coroutine is arc-held");
        let parent: Arc<Coroutine> =
            Self::current().expect("resume requires the calling thread to be in coroutine mode");
        assert!(!Arc::ptr_eq(&parent, &me), "a coroutine cannot resume itself");

        // Capture who resumed us, then clear our slot in the thread before
        // the switch; the weak link cannot form an ownership cycle.
        *self.parent.lock().unwrap() = Arc::downgrade(&parent);
        set_running(Some(me));
        self.set_state(CoroutineState::Running);

        let old: *mut SavedContext = parent.ctx.get();
        let new: *const SavedContext = self.ctx.get();
        unsafe { arch::switch(old, new) };
    }

    /// Returns control to the coroutine that resumed `self`. A `Running`
    /// coroutine re-enters `Ready` (it may be scheduled again); a `Stopped`
    /// one stays stopped.
    pub fn yield_now(&self) {
        let state: CoroutineState = self.state();
        assert!(
            state == CoroutineState::Running || state == CoroutineState::Stopped,
            "yield from invalid state {:?}",
            state
        );
        if state == CoroutineState::Running {
            self.set_state(CoroutineState::Ready);
        }

        let parent: Arc<Coroutine> = self
            .parent
            .lock()
            .unwrap()
            .upgrade()
            .expect("yield requires a live parent");
        *self.parent.lock().unwrap() = Weak::new();
        set_running(Some(parent.clone()));

        let old: *mut SavedContext = self.ctx.get();
        let new: *const SavedContext = parent.ctx.get();
        unsafe { arch::switch(old, new) };
    }

    /// (Re)initializes the machine context to enter the trampoline on the
    /// first switch.
    fn init_entry_context(&self) {
        let stack: &Stack = self.stack.as_ref().expect("task coroutines own a stack");
        unsafe { arch::init_context(self.ctx.get(), stack.top(), coroutine_main as usize) };
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Replaces the thread's running-coroutine slot.
fn set_running(coroutine: Option<Arc<Coroutine>>) {
    RUNNING_COROUTINE.with(|c| *c.borrow_mut() = coroutine);
}

/// Entry point of every task coroutine: runs the installed task to
/// completion, marks the coroutine stopped, and yields one final time.
///
/// A panicking task is fatal to the coroutine, not the process: the panic is
/// caught here, fully unwinding the coroutine's own stack, and logged
/// before the stopped transition. It must never cross the switch boundary,
/// where unwinding is undefined.
extern "C" fn coroutine_main() {
    let current: Arc<Coroutine> = Coroutine::current().expect("trampoline entered without a running coroutine");
    let task: TaskFn = unsafe { (*current.task.get()).take() }.expect("trampoline entered without a task");

    let result = panic::catch_unwind(AssertUnwindSafe(task));
    current.set_state(CoroutineState::Stopped);
    if let Err(e) = result {
        error!("coroutine {} task panicked: {:?}", current.id(), e);
    }

    // Drop our own reference before the final switch: this frame is never
    // resumed, so anything still owned here would leak. The scheduler that
    // resumed us still holds the coroutine.
    let raw: *const Coroutine = Arc::as_ptr(&current);
    drop(current);
    unsafe { (*raw).yield_now() };
    unreachable!("a stopped coroutine must never be resumed");
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Coroutine {
    fn drop(&mut self) {
        if self.stack.is_some() {
            assert_eq!(
                self.state(),
                CoroutineState::Stopped,
                "dropping a task coroutine that has not stopped"
            );
        } else {
            assert_eq!(
                self.state(),
                CoroutineState::Running,
                "the sentinel coroutine outlives everything the thread ran"
            );
        }
        LIVE_COROUTINES.fetch_sub(1, Ordering::Relaxed);
        trace!("coroutine {} destroyed", self.id);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Coroutine,
        CoroutineState,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    #[test]
    fn test_resume_yield_round_trip() -> Result<()> {
        Coroutine::init_thread();
        let steps: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let steps2: Arc<AtomicUsize> = steps.clone();

        let co: Arc<Coroutine> = Coroutine::new(
            Box::new(move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                Coroutine::current().unwrap().yield_now();
                steps2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        )?;

        crate::ensure_eq!(co.state(), CoroutineState::Ready);
        co.resume();
        crate::ensure_eq!(steps.load(Ordering::SeqCst), 1);
        crate::ensure_eq!(co.state(), CoroutineState::Ready);
        co.resume();
        crate::ensure_eq!(steps.load(Ordering::SeqCst), 2);
        crate::ensure_eq!(co.state(), CoroutineState::Stopped);
        Ok(())
    }

    #[test]
    fn test_reset_reuses_stack() -> Result<()> {
        Coroutine::init_thread();
        let hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

        let co: Arc<Coroutine> = Coroutine::new_pooled(0)?;
        crate::ensure_eq!(co.state(), CoroutineState::Stopped);
        for _ in 0..3 {
            let hits2: Arc<AtomicUsize> = hits.clone();
            co.reset(Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }));
            crate::ensure_eq!(co.state(), CoroutineState::Ready);
            co.resume();
            crate::ensure_eq!(co.state(), CoroutineState::Stopped);
        }
        crate::ensure_eq!(hits.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn test_nested_resume() -> Result<()> {
        Coroutine::init_thread();
        let order: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_inner: Arc<std::sync::Mutex<Vec<u32>>> = order.clone();
        let inner: Arc<Coroutine> = Coroutine::new(
            Box::new(move || {
                order_inner.lock().unwrap().push(2);
            }),
            0,
        )?;

        let order_outer: Arc<std::sync::Mutex<Vec<u32>>> = order.clone();
        let outer: Arc<Coroutine> = Coroutine::new(
            Box::new(move || {
                order_outer.lock().unwrap().push(1);
                inner.resume();
                order_outer.lock().unwrap().push(3);
            }),
            0,
        )?;

        outer.resume();
        let order_guard = order.lock().unwrap();
        crate::ensure_eq!(order_guard.as_slice(), &[1, 2, 3]);
        Ok(())
    }
}
