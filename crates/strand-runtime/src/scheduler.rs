//! M:N cooperative scheduler
//!
//! One shared run queue of work items (a fiber or a closure, optionally
//! pinned to an OS thread) served by every worker's run loop. Each worker
//! runs tasks on fibers and, when nothing is eligible, resumes its idle
//! fiber. What "idle" means is decided by an [`IdleDriver`]: the plain
//! [`ParkingDriver`] parks the thread, the reactor blocks in `epoll_wait`.
//!
//! # Inject mode
//!
//! With `use_caller` the constructing thread is one of the workers. Its
//! run loop lives on a root fiber that `stop()` resumes, so queued work
//! on that thread runs inside `stop()`.
//!
//! # Shutdown
//!
//! `stopping()` requires the stop flag, an empty queue and no worker in
//! the middle of running a task. Parked (`Hold`) fibers do not hold
//! shutdown back.

use crate::config::SchedulerConfig;
use crate::fiber::{box_entry, Fiber, FiberEntry, IntoFiberResult};
use crate::parking::{new_parking, IdleParking};
use crate::thread::Thread;
use crate::tls;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use strand_core::constants::ANY_THREAD;
use strand_core::error::{SchedError, SchedResult};
use strand_core::{fatal_assert, kdebug, kerror, kinfo, ktrace, kwarn, FiberState, SpinLock};

/// Idle behaviour plugged into a [`Scheduler`]
pub trait IdleDriver: Send + Sync + 'static {
    /// Wake one worker that may be idle
    fn tickle(&self, sched: &Scheduler);

    /// Wake every worker (stop requested)
    fn tickle_all(&self, sched: &Scheduler) {
        for _ in 0..sched.thread_count().max(1) {
            self.tickle(sched);
        }
    }

    /// Body of each worker's idle fiber
    ///
    /// Must yield back to the run loop (`Fiber::yield_to_hold`) whenever
    /// work may have arrived, and return once `sched.stopping()` holds.
    fn idle(&self, sched: &Scheduler);

    /// Shutdown condition; drivers may add their own requirements
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Something to run
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(FiberEntry),
}

impl Task {
    /// Wrap a closure; it runs on a scheduler-owned fiber
    pub fn call<F, R>(f: F) -> Task
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFiberResult,
    {
        Task::Call(box_entry(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Fiber(fiber) => write!(f, "Task::Fiber({})", fiber.id()),
            Task::Call(_) => f.write_str("Task::Call"),
        }
    }
}

struct WorkItem {
    task: Task,
    /// OS thread id this item must run on
    thread: Option<i32>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct Scheduler {
    name: String,
    stack_size: usize,
    queue: SpinLock<VecDeque<WorkItem>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<i32>>,
    /// Threads spawned by start()
    spawn_count: usize,
    /// Workers currently running a task
    active: AtomicUsize,
    /// Workers inside their idle fiber
    idle: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    /// Inject mode: the constructing thread
    root_thread: Option<i32>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    driver: Arc<dyn IdleDriver>,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Scheduler whose idle workers park
    pub fn new(config: SchedulerConfig) -> SchedResult<Arc<Scheduler>> {
        let driver = Arc::new(ParkingDriver::new(config.park_timeout));
        Self::with_driver(config, driver)
    }

    /// Scheduler with a custom idle driver
    pub fn with_driver(config: SchedulerConfig, driver: Arc<dyn IdleDriver>) -> SchedResult<Arc<Scheduler>> {
        config.validate()?;

        let root_thread = config.use_caller.then(tls::thread_id);
        if let Some(tid) = root_thread {
            fatal_assert!(
                tls::scheduler().is_none(),
                "thread {} already drives a scheduler",
                tid
            );
        }

        let sched = Arc::new_cyclic(|weak| Scheduler {
            name: config.name.clone(),
            stack_size: config.stack_size,
            queue: SpinLock::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            spawn_count: config.spawned_threads(),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
            driver,
            weak_self: weak.clone(),
        });

        if let Some(tid) = root_thread {
            Fiber::current();
            tls::set_thread_name(&config.name);
            tls::set_scheduler(Arc::downgrade(&sched));

            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                },
                config.stack_size,
            )?;
            *lock(&sched.root_fiber) = Some(root);
            lock(&sched.thread_ids).push(tid);
        }

        kinfo!(
            "scheduler {} created: threads={} use_caller={}",
            config.name,
            config.threads,
            config.use_caller
        );
        Ok(sched)
    }

    /// Scheduler the calling thread works for
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workers including the injected caller
    pub fn thread_count(&self) -> usize {
        self.spawn_count + usize::from(self.root_thread.is_some())
    }

    /// OS thread ids of all workers known so far
    pub fn thread_ids(&self) -> Vec<i32> {
        lock(&self.thread_ids).clone()
    }

    /// Inject mode: the thread that constructed the scheduler
    pub fn root_thread(&self) -> Option<i32> {
        self.root_thread
    }

    pub fn driver(&self) -> &Arc<dyn IdleDriver> {
        &self.driver
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Spawn the worker threads; repeated calls do nothing
    pub fn start(&self) -> SchedResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(SchedError::InvalidState);
        }
        let me = self.weak_self.upgrade().ok_or(SchedError::NotInitialized)?;

        let mut threads = lock(&self.threads);
        for i in 0..self.spawn_count {
            let sched = Arc::clone(&me);
            let thread = Thread::spawn(format!("{}_{}", self.name, i), move || sched.run())?;
            lock(&self.thread_ids).push(thread.id());
            threads.push(thread);
        }
        kdebug!("scheduler {} started {} threads", self.name, self.spawn_count);
        Ok(())
    }

    /// Enqueue on any thread
    pub fn schedule(&self, task: impl Into<Task>) {
        self.push(vec![WorkItem { task: task.into(), thread: None }]);
    }

    /// Enqueue a closure on any thread
    pub fn schedule_fn<F, R>(&self, f: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFiberResult,
    {
        self.schedule(Task::call(f));
    }

    /// Enqueue pinned to the worker with OS thread id `thread`
    ///
    /// `ANY_THREAD` (or any negative id) leaves the task unpinned.
    pub fn schedule_on(&self, task: impl Into<Task>, thread: i32) {
        let thread = (thread != ANY_THREAD && thread >= 0).then_some(thread);
        self.push(vec![WorkItem { task: task.into(), thread }]);
    }

    /// Enqueue a batch under one lock acquisition
    pub fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        let items: Vec<WorkItem> = tasks
            .into_iter()
            .map(|t| WorkItem { task: t.into(), thread: None })
            .collect();
        self.push(items);
    }

    fn push(&self, items: Vec<WorkItem>) {
        if items.is_empty() {
            return;
        }
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(items);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    #[inline]
    fn tickle(&self) {
        self.driver.tickle(self);
    }

    /// True once the scheduler may shut down
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    /// Stop flag set, queue empty and no task mid-run
    pub fn base_stopping(&self) -> bool {
        if !self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        let queue = self.queue.lock();
        queue.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Request shutdown, drain the queue and join the workers
    ///
    /// In inject mode this must be called on the constructing thread and it
    /// runs that thread's share of the work before returning. Calling it
    /// again after it returned is a no-op.
    pub fn stop(&self) {
        if let Some(root) = self.root_thread {
            let here = tls::thread_id();
            fatal_assert!(
                here == root,
                "stop() of inject-mode scheduler {} from thread {}, it belongs to thread {}",
                self.name,
                here,
                root
            );
        }

        if self.stop_requested.swap(true, Ordering::SeqCst) {
            kdebug!("scheduler {} stop requested again", self.name);
        } else {
            kinfo!("scheduler {} stopping", self.name);
        }
        self.driver.tickle_all(self);

        let root = lock(&self.root_fiber).clone();
        if let Some(root) = root {
            if root.state().is_resumable() {
                root.resume();
            }
        }

        let threads = std::mem::take(&mut *lock(&self.threads));
        for thread in threads {
            thread.join();
        }

        if self.root_thread.is_some() {
            let mine = tls::scheduler().is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self));
            if mine {
                tls::clear_scheduler();
            }
        }
        kinfo!("scheduler {} stopped", self.name);
    }

    /// Pop the first item this thread may run
    ///
    /// Second value: other workers should be woken.
    fn take_next(&self, tid: i32) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();
        let mut wake_others = false;
        let mut pick = None;

        for (i, item) in queue.iter().enumerate() {
            if item.thread.is_some_and(|t| t != tid) {
                wake_others = true;
                continue;
            }
            if let Task::Fiber(fiber) = &item.task {
                // Still switching out on another thread
                if fiber.state() == FiberState::Exec {
                    continue;
                }
            }
            pick = Some(i);
            break;
        }

        let task = pick.and_then(|i| queue.remove(i)).map(|item| item.task);
        if task.is_some() {
            self.active.fetch_add(1, Ordering::SeqCst);
            wake_others |= !queue.is_empty();
        }
        (task, wake_others)
    }

    /// Worker run loop
    pub(crate) fn run(self: &Arc<Self>) {
        let tid = tls::thread_id();
        tls::set_scheduler(Arc::downgrade(self));
        Fiber::current();
        kdebug!("scheduler {} run loop entered on thread {}", self.name, tid);

        let me = Arc::clone(self);
        let idle_fiber = match Fiber::new(move || me.driver.idle(&me), self.stack_size) {
            Ok(fiber) => fiber,
            Err(e) => {
                kerror!("scheduler {}: cannot create idle fiber: {}", self.name, e);
                return;
            }
        };

        let mut scratch: Option<Arc<Fiber>> = None;
        loop {
            let (task, wake_others) = self.take_next(tid);
            if wake_others && self.has_idle_threads() {
                self.tickle();
            }

            match task {
                Some(Task::Fiber(fiber)) => {
                    if fiber.state().is_terminal() {
                        ktrace!("skipping finished fiber {}", fiber.id());
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    let state = fiber.resume();
                    if state == FiberState::Ready {
                        self.schedule(fiber);
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task::Call(entry)) => {
                    let fiber = match scratch.take() {
                        Some(fiber) => {
                            fiber.reset_entry(entry);
                            fiber
                        }
                        None => match Fiber::with_entry(entry, self.stack_size) {
                            Ok(fiber) => fiber,
                            Err(e) => {
                                kerror!("scheduler {}: dropping task, no fiber: {}", self.name, e);
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };
                    match fiber.resume() {
                        FiberState::Ready => self.schedule(fiber),
                        FiberState::Term | FiberState::Except => scratch = Some(fiber),
                        // Parked: whoever will wake it holds a reference
                        _ => {}
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state().is_terminal() {
                        kdebug!("scheduler {} idle fiber finished on thread {}", self.name, tid);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if self.root_thread != Some(tid) {
            tls::clear_scheduler();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst) {
            kwarn!("scheduler {} dropped without stop()", self.name);
        }
    }
}

/// Idle driver that parks the worker thread between polls
pub struct ParkingDriver {
    parking: Box<dyn IdleParking>,
    park_timeout: Duration,
}

impl ParkingDriver {
    pub fn new(park_timeout: Duration) -> Self {
        ParkingDriver {
            parking: new_parking(),
            park_timeout,
        }
    }
}

impl IdleDriver for ParkingDriver {
    fn tickle(&self, _sched: &Scheduler) {
        self.parking.wake_one();
    }

    fn tickle_all(&self, _sched: &Scheduler) {
        self.parking.wake_all();
    }

    fn idle(&self, sched: &Scheduler) {
        while !sched.stopping() {
            if sched.queue_len() == 0 {
                self.parking.park(Some(self.park_timeout));
            } else {
                // Only work pinned to other threads is left
                std::thread::yield_now();
            }
            Fiber::yield_to_hold();
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    fn config(threads: usize, use_caller: bool) -> SchedulerConfig {
        SchedulerConfig::new()
            .name("test")
            .threads(threads)
            .use_caller(use_caller)
            .stack_size(64 * 1024)
            .park_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_thousand_closures_run_exactly_once() {
        let sched = Scheduler::new(config(4, true)).unwrap();
        sched.start().unwrap();

        let runs: Arc<Vec<AtomicU8>> = Arc::new((0..1000).map(|_| AtomicU8::new(0)).collect());
        for i in 0..1000 {
            let runs = Arc::clone(&runs);
            sched.schedule_fn(move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_spawned_only_workers() {
        let sched = Scheduler::new(config(2, false)).unwrap();
        sched.start().unwrap();
        sched.start().unwrap();
        assert_eq!(sched.thread_ids().len(), 2);

        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule_all((0..100).map(|_| {
            let hits = Arc::clone(&hits);
            Task::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        }));
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_parked_fiber_does_not_block_stop() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let resumed = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&resumed);
        sched.schedule_fn(move || {
            Fiber::yield_to_hold();
            r.store(true, Ordering::SeqCst);
        });
        sched.stop();
        assert!(!resumed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_ready_fiber_is_requeued() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&steps);
        sched.schedule_fn(move || {
            for _ in 0..3 {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
            }
            s.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_self_reschedule_while_running() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let weak = Arc::downgrade(&sched);
        sched.schedule_fn(move || {
            let sched = weak.upgrade().unwrap();
            // Queued while still Exec; picked up once parked
            sched.schedule(Fiber::current());
            drop(sched);
            Fiber::yield_to_hold();
            d.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_affinity_pins_thread() {
        let sched = Scheduler::new(config(2, false)).unwrap();
        sched.start().unwrap();
        let target = sched.thread_ids()[1];

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let seen = Arc::clone(&seen);
            sched.schedule_on(
                Task::call(move || seen.lock().unwrap().push(tls::thread_id())),
                target,
            );
        }
        sched.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|&t| t == target));
    }

    #[test]
    fn test_any_thread_runs_unpinned() {
        let sched = Scheduler::new(config(2, false)).unwrap();
        sched.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for id in [ANY_THREAD, -7] {
            let ran = Arc::clone(&ran);
            sched.schedule_on(
                Task::call(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }),
                id,
            );
        }
        sched.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_existing_fiber_and_current_scheduler() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let name = Arc::new(Mutex::new(String::new()));
        let n = Arc::clone(&name);
        let fiber = Fiber::new(
            move || {
                let current = Scheduler::current().unwrap();
                *n.lock().unwrap() = current.name().to_string();
            },
            0,
        )
        .unwrap();
        sched.schedule(Arc::clone(&fiber));
        sched.stop();

        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*name.lock().unwrap(), "test");
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_failing_task_is_absorbed() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let after = Arc::new(AtomicUsize::new(0));
        sched.schedule_fn::<_, ()>(|| panic!("task panic"));
        sched.schedule_fn(|| -> Result<(), String> { Err("task error".into()) });
        let a = Arc::clone(&after);
        sched.schedule_fn(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_stop_is_noop() {
        let sched = Scheduler::new(config(2, true)).unwrap();
        sched.start().unwrap();
        sched.stop();
        sched.stop();
        assert!(sched.stopping());
        assert!(sched.start().is_ok());
    }

    #[test]
    fn test_stop_from_foreign_thread_is_fatal() {
        let sched = Scheduler::new(config(1, true)).unwrap();
        let remote = Arc::clone(&sched);
        let result = std::thread::spawn(move || remote.stop()).join();
        assert!(result.is_err());

        // The owning thread can still stop it
        sched.stop();
    }
}
