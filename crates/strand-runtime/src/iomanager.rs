//! epoll reactor
//!
//! [`IoManager`] is a [`Scheduler`] whose idle driver is a [`Reactor`]:
//! idle workers block in `epoll_wait` bounded by the next timer deadline,
//! run expired timer callbacks, and hand ready fd waiters back to the run
//! queue.
//!
//! Registrations are level-triggered and one-shot per direction: when a
//! direction fires, its bit is removed from the epoll registration and its
//! waiter is scheduled. The local `events` mask of an fd always matches
//! what epoll has for it.
//!
//! A pipe interrupts a blocked wait ("tickle"). It is written when work is
//! scheduled on an empty queue, when a timer becomes the earliest one and
//! when stop is requested.

use crate::config::{IoConfig, SchedulerConfig};
use crate::fiber::{Fiber, IntoFiberResult};
use crate::scheduler::{IdleDriver, Scheduler, Task};
use crate::timer::{Timer, TimerCallback, TimerManager};
use nix::errno::Errno;
use std::any::Any;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::Duration;
use strand_core::constants::NO_TIMER;
use strand_core::error::{SchedError, SchedResult};
use strand_core::{fatal_assert, kdebug, kerror, ktrace, kwarn, Event};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Waiter for one direction of one fd
#[derive(Default)]
struct EventContext {
    /// Scheduler the waiter goes back to
    scheduler: Weak<Scheduler>,
    task: Option<Task>,
}

impl EventContext {
    fn clear(&mut self) {
        self.scheduler = Weak::new();
        self.task = None;
    }
}

#[derive(Default)]
struct FdState {
    /// Directions registered with epoll
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, ev: Event) -> &mut EventContext {
        if ev == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Hand the waiter for `ev` back to its scheduler and clear the bit
    fn trigger(&mut self, fd: RawFd, ev: Event) {
        fatal_assert!(self.events.contains(ev), "fd {} trigger of unregistered {}", fd, ev);
        self.events.remove(ev);

        let ctx = self.context_mut(ev);
        let task = ctx.task.take();
        let sched = std::mem::take(&mut ctx.scheduler).upgrade();
        match (task, sched) {
            (Some(task), Some(sched)) => {
                ktrace!("fd {} {} ready, scheduling {:?}", fd, ev, task);
                sched.schedule(task);
            }
            (Some(_), None) => kwarn!("fd {} {} fired after its scheduler went away", fd, ev),
            (None, _) => {}
        }
    }
}

/// Per-fd slot of the reactor table
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(FdContext {
            fd,
            state: Mutex::new(FdState::default()),
        })
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}

/// The epoll instance, fd table, tickle pipe and timers of an [`IoManager`]
pub struct Reactor {
    epfd: RawFd,
    /// [read, write]
    tickle_fds: [RawFd; 2],
    fd_table: RwLock<Vec<Arc<FdContext>>>,
    /// Registered directions across all fds
    pending: AtomicUsize,
    timers: TimerManager,
    max_wait: Duration,
    batch: usize,
    owner: OnceLock<Weak<Scheduler>>,
}

impl Reactor {
    fn new(config: &IoConfig) -> SchedResult<Arc<Reactor>> {
        // Safety: plain syscalls, every fd is closed on the error paths
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::os("epoll_create1", Errno::last() as i32));
        }

        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            let errno = Errno::last() as i32;
            unsafe { libc::close(epfd) };
            return Err(SchedError::os("pipe2", errno));
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) } < 0 {
            let errno = Errno::last() as i32;
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
                libc::close(epfd);
            }
            return Err(SchedError::os("epoll_ctl", errno));
        }

        let table = (0..config.fd_table_size as RawFd).map(FdContext::new).collect();
        kdebug!("reactor created: epfd={} tickle={:?}", epfd, fds);

        Ok(Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let weak = weak.clone();
            Reactor {
                epfd,
                tickle_fds: fds,
                fd_table: RwLock::new(table),
                pending: AtomicUsize::new(0),
                timers: TimerManager::with_front_hook(move || {
                    if let Some(reactor) = weak.upgrade() {
                        reactor.wake();
                    }
                }),
                max_wait: config.max_wait,
                batch: config.epoll_batch,
                owner: OnceLock::new(),
            }
        }))
    }

    /// Interrupt one blocked `epoll_wait`
    pub fn wake(&self) {
        self.wake_n(1);
    }

    /// Queue `n` wakeups; each idle pass consumes one
    fn wake_n(&self, n: usize) {
        let bytes = vec![b'T'; n.max(1)];
        // Safety: writes from a live buffer into our own pipe
        let rc = unsafe { libc::write(self.tickle_fds[1], bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if rc < 0 {
            let errno = Errno::last();
            // Full pipe: wakeups are already pending
            if errno != Errno::EAGAIN {
                kwarn!("tickle write failed: {}", errno);
            }
        }
    }

    /// Take a single wakeup; the rest stay readable for other workers
    fn drain_tickle(&self) {
        let mut byte = 0u8;
        // Safety: reads one byte into a stack slot from our own pipe
        unsafe { libc::read(self.tickle_fds[0], &mut byte as *mut u8 as *mut libc::c_void, 1) };
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// See [`IoManager::cancel_event`]
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> SchedResult<bool> {
        self.unregister(fd, ev, true)
    }

    fn owner(&self) -> Weak<Scheduler> {
        self.owner.get().cloned().unwrap_or_default()
    }

    /// Existing slot for `fd`
    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.fd_table.read().unwrap_or_else(|p| p.into_inner());
        table.get(fd as usize).cloned()
    }

    /// Slot for `fd`, growing the table when needed
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let mut table = self.fd_table.write().unwrap_or_else(|p| p.into_inner());
        let len = table.len();
        if fd as usize >= len {
            let new_len = (fd as usize + 1).max(len * 3 / 2);
            table.extend((len as RawFd..new_len as RawFd).map(FdContext::new));
            ktrace!("fd table grown {} -> {}", len, new_len);
        }
        Arc::clone(&table[fd as usize])
    }

    fn raw_ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: events.bits(),
            u64: fd as u64,
        };
        // Safety: epfd is owned by self, ev outlives the call
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    /// ADD or MOD, switching to the other op when epoll disagrees about
    /// whether the fd is already in the set (fd numbers get reused)
    fn ctl_register(&self, op: libc::c_int, fd: RawFd, events: Event) -> SchedResult<()> {
        let err = match self.raw_ctl(op, fd, events) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let retry = match (op, err) {
            (libc::EPOLL_CTL_ADD, Errno::EEXIST) => Some(libc::EPOLL_CTL_MOD),
            (libc::EPOLL_CTL_MOD, Errno::ENOENT) => Some(libc::EPOLL_CTL_ADD),
            _ => None,
        };
        let err = match retry.map(|op| self.raw_ctl(op, fd, events)) {
            Some(Ok(())) => return Ok(()),
            Some(Err(e)) => e,
            None => err,
        };
        kerror!("epoll_ctl({}, fd={}, {}) failed: {}", op_name(op), fd, events, err);
        Err(SchedError::os("epoll_ctl", err as i32))
    }

    /// Shrink the registration of `fd` to `left`
    ///
    /// An fd that was closed behind our back is already gone from epoll,
    /// which counts as success.
    fn ctl_unregister(&self, fd: RawFd, left: Event) -> SchedResult<()> {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        match self.raw_ctl(op, fd, left) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) | Err(Errno::EBADF) => {
                kdebug!("fd {} no longer in epoll set", fd);
                Ok(())
            }
            Err(e) => {
                kerror!("epoll_ctl({}, fd={}, {}) failed: {}", op_name(op), fd, left, e);
                Err(SchedError::os("epoll_ctl", e as i32))
            }
        }
    }

    fn register(&self, fd: RawFd, ev: Event, task: Option<Task>) -> SchedResult<()> {
        if fd < 0 {
            return Err(SchedError::InvalidFd(fd));
        }
        fatal_assert!(ev.is_single(), "add_event takes one direction, got {}", ev);
        let task = match task {
            Some(task) => task,
            None => {
                fatal_assert!(Fiber::in_fiber(), "add_event without callback outside a fiber");
                Task::Fiber(Fiber::current())
            }
        };
        let scheduler = Scheduler::current()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_else(|| self.owner());

        let ctx = self.context_for(fd);
        let mut st = lock(&ctx.state);
        if st.events.intersects(ev) {
            kerror!("fd {} already waiting for {}", fd, ev);
            return Err(SchedError::AlreadyRegistered);
        }

        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = st.events | ev;
        self.ctl_register(op, fd, events)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events = events;
        let slot = st.context_mut(ev);
        slot.scheduler = scheduler;
        slot.task = Some(task);
        ktrace!("fd {} waiting for {}", fd, ev);
        Ok(())
    }

    /// Remove `ev` from `fd`; with `fire` its waiter is scheduled first
    fn unregister(&self, fd: RawFd, ev: Event, fire: bool) -> SchedResult<bool> {
        let Some(ctx) = self.lookup(fd) else {
            return Ok(false);
        };
        let mut st = lock(&ctx.state);
        if !st.events.intersects(ev) {
            return Ok(false);
        }

        self.ctl_unregister(fd, st.events & !ev)?;
        if fire {
            st.trigger(fd, ev);
        } else {
            st.events.remove(ev);
            st.context_mut(ev).clear();
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    fn unregister_all(&self, fd: RawFd) -> SchedResult<bool> {
        let Some(ctx) = self.lookup(fd) else {
            return Ok(false);
        };
        let mut st = lock(&ctx.state);
        if st.events.is_empty() {
            return Ok(false);
        }

        self.ctl_unregister(fd, Event::NONE)?;
        for ev in [Event::READ, Event::WRITE] {
            if st.events.contains(ev) {
                st.trigger(fd, ev);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(true)
    }

    /// Consume readiness reported for one fd
    fn dispatch(&self, fd: RawFd, reported: u32) {
        let Some(ctx) = self.lookup(fd) else {
            kdebug!("readiness for unknown fd {}", fd);
            return;
        };
        debug_assert_eq!(ctx.fd, fd);
        let mut st = lock(&ctx.state);

        let mut fired = Event::from_bits_truncate(reported);
        if reported & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            // Errors wake both directions; the retried call reports them
            fired |= st.events;
        }
        let ready = fired & st.events;
        if ready.is_empty() {
            return;
        }

        let left = st.events & !ready;
        if let Err(e) = self.ctl_unregister(fd, left) {
            kerror!("fd {}: dropping readiness {}: {}", fd, ready, e);
            return;
        }
        for ev in [Event::READ, Event::WRITE] {
            if ready.contains(ev) {
                st.trigger(fd, ev);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn run_expired_timers(&self) {
        let cbs: Vec<TimerCallback> = self.timers.list_expired_cb();
        for cb in cbs {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                kerror!("timer callback panicked");
            }
        }
    }
}

impl IdleDriver for Reactor {
    fn tickle(&self, _sched: &Scheduler) {
        self.wake();
    }

    fn tickle_all(&self, sched: &Scheduler) {
        self.wake_n(sched.thread_count());
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        !self.timers.has_timer() && self.pending_event_count() == 0 && sched.base_stopping()
    }

    fn idle(&self, sched: &Scheduler) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.batch];
        let cap = self.max_wait.as_millis() as u64;

        loop {
            let next = self.timers.get_next_timer();
            if next == NO_TIMER && self.pending_event_count() == 0 && sched.base_stopping() {
                kdebug!("reactor idle exits, scheduler {} stopping", sched.name());
                break;
            }

            let timeout = next.min(cap) as libc::c_int;
            let n = loop {
                // Safety: events has room for batch entries
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout)
                };
                if rc < 0 && Errno::last() == Errno::EINTR {
                    continue;
                }
                break rc;
            };
            if n < 0 {
                kerror!("epoll_wait(epfd={}) failed: {}", self.epfd, Errno::last());
            }

            self.run_expired_timers();

            for ev in events.iter().take(n.max(0) as usize) {
                let (bits, data) = (ev.events, ev.u64);
                let fd = data as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle();
                    continue;
                }
                self.dispatch(fd, bits);
            }

            Fiber::yield_to_hold();
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let pending = self.pending_event_count();
        if pending > 0 {
            kwarn!("reactor dropped with {} pending events", pending);
        }
        // Safety: these fds are owned by self and closed exactly once
        unsafe {
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
            libc::close(self.epfd);
        }
    }
}

/// Scheduler plus reactor
///
/// Cheap to clone; dereferences to the [`Scheduler`] for `schedule`,
/// `stop` and friends.
#[derive(Clone)]
pub struct IoManager {
    sched: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Build the reactor and scheduler and start the worker threads
    pub fn new(config: SchedulerConfig, io: IoConfig) -> SchedResult<IoManager> {
        io.validate()?;
        let reactor = Reactor::new(&io)?;
        let sched = Scheduler::with_driver(config, Arc::clone(&reactor) as Arc<dyn IdleDriver>)?;
        // Fresh reactor, the cell is empty
        let _ = reactor.owner.set(Arc::downgrade(&sched));
        sched.start()?;
        Ok(IoManager { sched, reactor })
    }

    /// IoManager the calling thread works for
    pub fn current() -> Option<IoManager> {
        let sched = Scheduler::current()?;
        let reactor = Arc::clone(sched.driver()).as_any().downcast::<Reactor>().ok()?;
        Some(IoManager { sched, reactor })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Park the current fiber until `fd` is ready for `ev`
    ///
    /// Registers only; the caller yields with `Fiber::yield_to_hold()`.
    pub fn add_event(&self, fd: RawFd, ev: Event) -> SchedResult<()> {
        self.reactor.register(fd, ev, None)
    }

    /// Run `cb` on the scheduler once `fd` is ready for `ev`
    pub fn add_event_with<F, R>(&self, fd: RawFd, ev: Event, cb: F) -> SchedResult<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFiberResult,
    {
        self.reactor.register(fd, ev, Some(Task::call(cb)))
    }

    /// Stop watching `ev` on `fd`; the waiter is dropped without running
    ///
    /// `Ok(false)` if nothing was registered.
    pub fn del_event(&self, fd: RawFd, ev: Event) -> SchedResult<bool> {
        self.reactor.unregister(fd, ev, false)
    }

    /// Stop watching `ev` on `fd` and schedule its waiter now
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> SchedResult<bool> {
        self.reactor.cancel_event(fd, ev)
    }

    /// Cancel both directions of `fd`, leaving its slot free for reuse
    pub fn cancel_all(&self, fd: RawFd) -> SchedResult<bool> {
        self.reactor.unregister_all(fd)
    }

    pub fn pending_event_count(&self) -> usize {
        self.reactor.pending_event_count()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.reactor.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.reactor.timers.add_condition_timer(ms, cb, cond, recurring)
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::now_ms;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Instant;

    fn sched_config(threads: usize, use_caller: bool) -> SchedulerConfig {
        SchedulerConfig::new()
            .name("io")
            .threads(threads)
            .use_caller(use_caller)
            .stack_size(64 * 1024)
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_readiness_resumes_parked_fiber() {
        let iom = IoManager::new(sched_config(2, false), IoConfig::new()).unwrap();
        let (rfd, wfd) = pipe();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let iom = IoManager::current().unwrap();
            iom.add_event(rfd, Event::READ).unwrap();
            Fiber::yield_to_hold();

            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            tx.send(n).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        let rc = unsafe { libc::write(wfd, b"ping".as_ptr() as *const libc::c_void, 4) };
        assert_eq!(rc, 4);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 4);
        iom.stop();
        assert_eq!(iom.pending_event_count(), 0);
        close(rfd);
        close(wfd);
    }

    #[test]
    fn test_callback_runs_on_readiness() {
        let iom = IoManager::new(sched_config(1, false), IoConfig::new()).unwrap();
        let (rfd, wfd) = pipe();
        let (tx, rx) = mpsc::channel();

        // A pipe's write end is writable right away
        iom.add_event_with(wfd, Event::WRITE, move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

        iom.stop();
        assert_eq!(iom.pending_event_count(), 0);
        close(rfd);
        close(wfd);
    }

    #[test]
    fn test_cancel_event_fires_once() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let (rfd, wfd) = pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        iom.add_event_with(rfd, Event::READ, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_event_count(), 1);
        assert!(matches!(
            iom.add_event_with(rfd, Event::READ, || {}),
            Err(SchedError::AlreadyRegistered)
        ));

        assert!(iom.cancel_event(rfd, Event::READ).unwrap());
        assert!(!iom.cancel_event(rfd, Event::READ).unwrap());
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        close(rfd);
        close(wfd);
    }

    #[test]
    fn test_del_event_is_silent() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let (rfd, wfd) = pipe();
        let fired = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&fired);
        iom.add_event_with(rfd, Event::READ, move || f.store(true, Ordering::SeqCst)).unwrap();
        iom.add_event_with(rfd, Event::WRITE, || {}).unwrap();
        assert_eq!(iom.pending_event_count(), 2);

        assert!(iom.del_event(rfd, Event::READ).unwrap());
        assert!(iom.del_event(rfd, Event::WRITE).unwrap());
        assert!(!iom.del_event(rfd, Event::READ).unwrap());
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert!(!fired.load(Ordering::SeqCst));
        close(rfd);
        close(wfd);
    }

    #[test]
    fn test_invalid_fd_rejected() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        assert!(matches!(
            iom.add_event_with(-1, Event::READ, || {}),
            Err(SchedError::InvalidFd(-1))
        ));
        assert!(!iom.cancel_all(-1).unwrap());
        iom.stop();
    }

    #[test]
    fn test_closed_fd_cleanup_and_reuse() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let (rfd, wfd) = pipe();
        let f = Arc::clone(&fired);
        iom.add_event_with(wfd, Event::WRITE, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Closed without cancelling first
        close(wfd);
        close(rfd);
        assert!(iom.cancel_all(wfd).unwrap());
        assert_eq!(iom.pending_event_count(), 0);

        // The kernel hands out the lowest free number again
        let (rfd2, wfd2) = pipe();
        let f = Arc::clone(&fired);
        iom.add_event_with(rfd2, Event::READ, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(iom.cancel_event(rfd2, Event::READ).unwrap());

        iom.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        close(rfd2);
        close(wfd2);
    }

    #[test]
    fn test_fd_table_grows() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new().fd_table_size(1)).unwrap();
        let (rfd, wfd) = pipe();
        iom.add_event_with(rfd, Event::READ, || {}).unwrap();
        assert!(iom.cancel_all(rfd).unwrap());
        iom.stop();
        close(rfd);
        close(wfd);
    }

    #[test]
    fn test_recurring_timer_cadence() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let start = now_ms();
        let fires = Arc::new(Mutex::new(Vec::new()));

        let f = Arc::clone(&fires);
        let ticker = iom.add_timer(100, move || f.lock().unwrap().push(now_ms()), true);
        let t = Arc::clone(&ticker);
        iom.add_timer(
            550,
            move || {
                t.cancel();
            },
            false,
        );

        // Inject mode: the timers run inside stop()
        iom.stop();

        let fires = fires.lock().unwrap();
        assert!((4..=6).contains(&fires.len()), "fired {} times", fires.len());
        for (i, &at) in fires.iter().enumerate() {
            assert!(at >= start + 100 * (i as u64 + 1));
        }
        assert!(fires.windows(2).all(|w| w[0] <= w[1]));
        assert!(!iom.timers().has_timer());
    }

    #[test]
    fn test_new_front_timer_interrupts_wait() {
        let io = IoConfig::new().max_wait(Duration::from_secs(3));
        let iom = IoManager::new(sched_config(1, false), io).unwrap();
        // Let the worker settle into epoll_wait
        std::thread::sleep(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let armed = now_ms();
        iom.add_timer(50, move || lock(&tx).send(now_ms()).unwrap(), false);

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired - armed < 1000);
        iom.stop();
    }

    #[test]
    fn test_stop_wakes_every_worker() {
        let io = IoConfig::new().max_wait(Duration::from_secs(3));
        let iom = IoManager::new(sched_config(4, false), io).unwrap();
        // All four workers blocked in epoll_wait
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        iom.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_condition_timer_skipped_after_owner_drop() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let token = Arc::new(());

        let f = Arc::clone(&fired);
        iom.add_condition_timer(10, move || f.store(true, Ordering::SeqCst), Arc::downgrade(&token), false);
        drop(token);

        iom.stop();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_current_inside_worker() {
        let iom = IoManager::new(sched_config(1, true), IoConfig::new()).unwrap();
        let found = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&found);
        iom.schedule_fn(move || {
            let current = IoManager::current().unwrap();
            f.store(current.name() == "io", Ordering::SeqCst);
        });
        iom.stop();
        assert!(found.load(Ordering::SeqCst));
        assert!(IoManager::current().is_none());
    }
}
