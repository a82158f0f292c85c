// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::{
        Coroutine,
        CoroutineState,
        TaskFn,
    },
    hook,
    reactor::IoScheduler,
    runtime::{
        self,
        fail::Fail,
    },
};
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        mpsc,
        Arc,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

thread_local! {
    /// The scheduler this thread works for.
    static THREAD_SCHEDULER: RefCell<Option<Arc<dyn Scheduler>>> = const { RefCell::new(None) };
    /// The thread's scheduling coroutine: the context the worker loop runs
    /// in. Equal to the thread's sentinel for pool threads; a distinct task
    /// coroutine for a participating creator thread.
    static SCHEDULE_COROUTINE: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// The two shapes of schedulable work.
pub enum Runnable {
    /// A previously-suspended coroutine to resume.
    Coroutine(Arc<Coroutine>),
    /// A closure; the worker wraps it in its reusable closure coroutine.
    Closure(TaskFn),
}

/// A unit of work in a scheduler's queue, optionally pinned to one OS thread.
pub struct ScheduleTask {
    runnable: Runnable,
    /// When set, only the worker with this OS thread id may run the task.
    target_thread: Option<libc::pid_t>,
}

/// A plain scheduler with no reactor attached: the trait's base behavior,
/// unmodified. Workers poll the queue and spin through their idle coroutine
/// between tasks, so it suits short-lived CPU work; I/O-suspending tasks
/// belong on an I/O scheduler.
pub struct BasicScheduler {
    core: SchedulerCore,
}

/// Shared state of a scheduler: the task queue, the worker pool, and the
/// counters the stop predicate is computed from.
pub struct SchedulerCore {
    /// Human-readable name; also the worker thread-name prefix.
    name: String,
    /// Number of pool threads (excludes a participating creator).
    worker_count: usize,
    /// Does the creating thread lend itself as a worker during `stop`?
    use_creator: bool,
    /// OS thread id of the creator when it participates, -1 otherwise.
    creator_thread_id: Mutex<libc::pid_t>,
    /// FIFO task queue.
    queue: Mutex<VecDeque<ScheduleTask>>,
    /// Workers currently executing a task.
    active_workers: AtomicUsize,
    /// Workers currently parked in their idle coroutine.
    idle_workers: AtomicUsize,
    /// Monotonic stop flag.
    stopping: AtomicBool,
    /// Guards against double `start`.
    started: AtomicBool,
    /// Pool thread handles, taken by `stop` for joining.
    pool: Mutex<Vec<JoinHandle<()>>>,
    /// OS thread ids of every participating thread.
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// The creator's scheduling coroutine, when it participates.
    creator_schedule_coroutine: Mutex<Option<Arc<Coroutine>>>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// A scheduler: a task queue served by a pool of cooperative worker threads.
///
/// The base behavior lives in provided methods; the I/O scheduler overrides
/// `tickle` (self-pipe wakeup), `idle` (the epoll reactor loop) and
/// `stoppable` (no pending events, no pending timers).
pub trait Scheduler: Send + Sync + 'static {
    /// The scheduler's shared state.
    fn core(&self) -> &SchedulerCore;

    /// Wakes a worker blocked in idle. The base scheduler has nothing to
    /// wake it with; workers poll the queue when their idle coroutine yields.
    fn tickle(&self) {
        trace!("tickle(): scheduler {}", self.core().name());
    }

    /// Body of the per-worker idle coroutine: yield until the scheduler may
    /// stop, then return (stopping the coroutine and thus the worker).
    fn idle(&self) {
        debug!("idle(): thread {} idling", runtime::current_thread_id());
        while !self.stoppable() {
            Coroutine::current()
                .expect("idle runs inside a coroutine")
                .yield_now();
        }
    }

    /// May the workers exit?
    fn stoppable(&self) -> bool {
        self.core().base_stoppable()
    }

    /// Downcast hook for the I/O-scheduler specialization.
    fn as_io(self: Arc<Self>) -> Option<Arc<IoScheduler>> {
        None
    }

    /// Enqueues a task; wakes a worker when the queue was empty. Thread-safe.
    fn submit(&self, task: ScheduleTask) {
        let need_tickle: bool = {
            let mut queue = self.core().queue.lock().unwrap();
            let was_empty: bool = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a closure.
    fn submit_closure<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.submit(ScheduleTask::closure(f));
    }

    /// Enqueues a coroutine resumption.
    fn submit_coroutine(&self, coroutine: Arc<Coroutine>)
    where
        Self: Sized,
    {
        self.submit(ScheduleTask::coroutine(coroutine));
    }

    /// Stops the scheduler: raises the stop flag, wakes every worker, drains
    /// the creator's scheduling coroutine when it participates, and joins
    /// the pool. The queue is empty when this returns.
    fn stop(&self) {
        let core: &SchedulerCore = self.core();
        debug!("stop(): scheduler {}", core.name);
        if self.stoppable() {
            return;
        }
        core.stopping.store(true, Ordering::Release);

        // One wake per worker releases anyone parked in idle.
        for _ in 0..core.worker_count.max(1) {
            self.tickle();
        }

        if core.use_creator {
            let coroutine: Option<Arc<Coroutine>> = core.creator_schedule_coroutine.lock().unwrap().take();
            if let Some(coroutine) = coroutine {
                assert_eq!(
                    runtime::current_thread_id(),
                    *core.creator_thread_id.lock().unwrap(),
                    "stop must run on the creating thread when it participates"
                );
                coroutine.resume();
                debug!("stop(): creator scheduling coroutine drained");
            }
        }

        let handles: Vec<JoinHandle<()>> = core.pool.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Arc-level operations on a scheduler. Separate from [Scheduler] because
/// they need an owning handle to seed worker threads with.
pub trait SchedulerExt {
    /// Spawns the worker pool. When the creator participates, its scheduling
    /// coroutine is created here and driven later by `stop`; `start` must
    /// then be called on the creating thread.
    fn start(&self) -> Result<(), Fail>;
}

impl<T: Scheduler> SchedulerExt for Arc<T> {
    fn start(&self) -> Result<(), Fail> {
        let this: Arc<dyn Scheduler> = self.clone();
        start_scheduler(this)
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ScheduleTask {
    /// A task that resumes `coroutine` on whichever worker picks it up.
    pub fn coroutine(coroutine: Arc<Coroutine>) -> Self {
        Self {
            runnable: Runnable::Coroutine(coroutine),
            target_thread: None,
        }
    }

    /// A task that runs `f` inside a worker's reusable closure coroutine.
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            runnable: Runnable::Closure(Box::new(f)),
            target_thread: None,
        }
    }

    /// A closure task from an already-boxed payload.
    pub fn boxed(task: TaskFn) -> Self {
        Self {
            runnable: Runnable::Closure(task),
            target_thread: None,
        }
    }

    /// Pins this task to the worker with OS thread id `tid`.
    pub fn pinned(mut self, tid: libc::pid_t) -> Self {
        self.target_thread = Some(tid);
        self
    }
}

impl BasicScheduler {
    /// Creates a plain scheduler (see [SchedulerCore::new] for the thread
    /// accounting).
    pub fn new(thread_num: usize, use_creator: bool, name: &str) -> Arc<Self> {
        Arc::new(Self {
            core: SchedulerCore::new(thread_num, use_creator, name),
        })
    }
}

impl SchedulerCore {
    /// Creates the shared state for a scheduler with `thread_num` total
    /// participating threads. When `use_creator` is set, one of them is the
    /// creating thread itself and only `thread_num - 1` pool threads spawn.
    pub fn new(thread_num: usize, use_creator: bool, name: &str) -> Self {
        assert!(thread_num > 0, "a scheduler needs at least one thread");
        Self {
            name: name.to_string(),
            worker_count: thread_num - usize::from(use_creator),
            use_creator,
            creator_thread_id: Mutex::new(-1),
            queue: Mutex::new(VecDeque::new()),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pool: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            creator_schedule_coroutine: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of every participating thread (valid after `start`).
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Is any worker parked in its idle coroutine?
    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Base stop predicate: stop requested, queue drained, nobody active.
    pub fn base_stoppable(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The scheduler the calling thread works for, if any.
pub fn current_scheduler() -> Option<Arc<dyn Scheduler>> {
    THREAD_SCHEDULER.with(|s| s.borrow().clone())
}

/// The I/O scheduler the calling thread works for, if any.
pub fn current_io_scheduler() -> Option<Arc<IoScheduler>> {
    current_scheduler().and_then(|s| s.as_io())
}

/// The calling thread's scheduling coroutine, if any.
pub fn current_schedule_coroutine() -> Option<Arc<Coroutine>> {
    SCHEDULE_COROUTINE.with(|c| c.borrow().clone())
}

/// Body of [SchedulerExt::start].
fn start_scheduler(this: Arc<dyn Scheduler>) -> Result<(), Fail> {
    let core: &SchedulerCore = this.core();
    debug!("start(): scheduler {}", core.name);
    if core.started.swap(true, Ordering::AcqRel) {
        return Err(Fail::new(libc::EBUSY, "scheduler already started"));
    }

    if core.use_creator {
        let tid: libc::pid_t = runtime::current_thread_id();
        *core.creator_thread_id.lock().unwrap() = tid;
        core.thread_ids.lock().unwrap().push(tid);
        install_thread_scheduler(this.clone());
        Coroutine::init_thread();
        let for_creator: Arc<dyn Scheduler> = this.clone();
        let coroutine: Arc<Coroutine> = Coroutine::new(Box::new(move || worker_loop(for_creator)), 0)?;
        *core.creator_schedule_coroutine.lock().unwrap() = Some(coroutine);
    }

    // Handshake: start returns only once every pool thread has reported its
    // OS thread id and installed its runtime state.
    let (tx, rx) = mpsc::channel::<libc::pid_t>();
    let mut pool = core.pool.lock().unwrap();
    for i in 0..core.worker_count {
        let for_worker: Arc<dyn Scheduler> = this.clone();
        let tx = tx.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(format!("{}-{}", core.name, i))
            .spawn(move || {
                tx.send(runtime::current_thread_id())
                    .expect("scheduler start is waiting on the handshake");
                drop(tx);
                worker_loop(for_worker);
            })
            .map_err(Fail::from)?;
        pool.push(handle);
    }
    drop(tx);
    let mut thread_ids = core.thread_ids.lock().unwrap();
    for _ in 0..core.worker_count {
        let tid: libc::pid_t = rx
            .recv()
            .map_err(|_| Fail::new(libc::ECHILD, "worker died during startup"))?;
        thread_ids.push(tid);
    }
    Ok(())
}

/// Installs the calling thread's scheduler slot.
fn install_thread_scheduler(sched: Arc<dyn Scheduler>) {
    THREAD_SCHEDULER.with(|s| {
        let mut slot = s.borrow_mut();
        assert!(slot.is_none(), "thread already belongs to a scheduler");
        *slot = Some(sched);
    });
}

/// The scheduling loop run by every worker (and by the creator's scheduling
/// coroutine when it participates).
fn worker_loop(sched: Arc<dyn Scheduler>) {
    let my_tid: libc::pid_t = runtime::current_thread_id();
    debug!("worker_loop(): thread {} running for {}", my_tid, sched.core().name());

    let creator_tid: libc::pid_t = *sched.core().creator_thread_id.lock().unwrap();
    if my_tid != creator_tid {
        // Pool thread: enter coroutine mode and adopt this scheduler. The
        // creator thread did both in start().
        install_thread_scheduler(sched.clone());
        Coroutine::init_thread();
    }
    hook::set_hooking_enabled(true);
    SCHEDULE_COROUTINE.with(|c| *c.borrow_mut() = Coroutine::current());

    // The worker's idle coroutine; its task returning is the exit signal.
    let sched_for_idle: Arc<dyn Scheduler> = sched.clone();
    let idle_coroutine: Arc<Coroutine> =
        Coroutine::new(Box::new(move || sched_for_idle.idle()), 0).expect("cannot allocate idle coroutine");
    // Reusable coroutine that closure tasks are run in.
    let mut closure_coroutine: Arc<Coroutine> =
        Coroutine::new_pooled(0).expect("cannot allocate closure coroutine");

    let core: &SchedulerCore = sched.core();
    loop {
        let mut picked: Option<Runnable> = None;
        let mut tickle_other: bool = false;
        {
            let mut queue = core.queue.lock().unwrap();
            let mut index: usize = 0;
            while index < queue.len() {
                // A task pinned to another thread stays queued; remember to
                // wake someone else for it.
                if let Some(tid) = queue[index].target_thread {
                    if tid != my_tid {
                        tickle_other = true;
                        index += 1;
                        continue;
                    }
                }
                // Skip a coroutine that has not yielded yet: an event can
                // re-schedule it between its event registration and its
                // yield, and resuming it now would run two workers on one
                // stack.
                if let Runnable::Coroutine(ref coroutine) = queue[index].runnable {
                    if coroutine.state() == CoroutineState::Running {
                        index += 1;
                        continue;
                    }
                }
                picked = queue.remove(index).map(|t| t.runnable);
                break;
            }
            tickle_other |= !queue.is_empty();
        }

        if tickle_other {
            sched.tickle();
        }

        match picked {
            Some(Runnable::Coroutine(coroutine)) => {
                core.active_workers.fetch_add(1, Ordering::AcqRel);
                coroutine.resume();
                core.active_workers.fetch_sub(1, Ordering::AcqRel);
            },
            Some(Runnable::Closure(task)) => {
                closure_coroutine.reset(task);
                core.active_workers.fetch_add(1, Ordering::AcqRel);
                closure_coroutine.resume();
                core.active_workers.fetch_sub(1, Ordering::AcqRel);
                // The closure may have parked itself in the reactor; its
                // continuation now owns the coroutine, so pool a fresh one.
                if closure_coroutine.state() != CoroutineState::Stopped {
                    closure_coroutine = Coroutine::new_pooled(0).expect("cannot allocate closure coroutine");
                }
            },
            None => {
                if idle_coroutine.state() == CoroutineState::Stopped {
                    debug!("worker_loop(): idle coroutine ended, thread {} exits", my_tid);
                    // Pass the shutdown wake along to any worker still parked.
                    sched.tickle();
                    break;
                }
                core.idle_workers.fetch_add(1, Ordering::AcqRel);
                idle_coroutine.resume();
                core.idle_workers.fetch_sub(1, Ordering::AcqRel);
            },
        }
    }

    SCHEDULE_COROUTINE.with(|c| *c.borrow_mut() = None);
    THREAD_SCHEDULER.with(|s| *s.borrow_mut() = None);
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Scheduler for BasicScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        assert!(
            !self.started.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire),
            "scheduler {} dropped without being stopped",
            self.name
        );
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        BasicScheduler,
        ScheduleTask,
        Scheduler,
        SchedulerExt,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        mpsc,
        Arc,
    };

    #[test]
    fn test_basic_scheduler_runs_closures() -> Result<()> {
        let sched: Arc<BasicScheduler> = BasicScheduler::new(2, false, "basic-test");
        sched.start().map_err(anyhow::Error::from)?;

        let (tx, rx) = mpsc::channel::<usize>();
        for index in 0..10 {
            let tx = tx.clone();
            sched.submit_closure(move || {
                tx.send(index).expect("receiver lives in the test");
            });
        }
        drop(tx);

        let mut total: usize = 0;
        for _ in 0..10 {
            total += rx.recv()?;
        }
        crate::ensure_eq!(total, 45);

        sched.stop();
        Ok(())
    }

    #[test]
    fn test_stop_drains_queue() -> Result<()> {
        let sched: Arc<BasicScheduler> = BasicScheduler::new(1, true, "basic-creator-test");
        sched.start().map_err(anyhow::Error::from)?;

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter: Arc<AtomicUsize> = counter.clone();
            sched.submit(ScheduleTask::closure(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sched.stop();
        crate::ensure_eq!(counter.load(Ordering::SeqCst), 4);
        Ok(())
    }
}
