//! Thread-local worker context
//!
//! Per OS thread: the running fiber, the thread's main fiber, the scheduler
//! the thread works for, and the cached OS thread id and name.
//!
//! Fibers migrate between threads across a context switch, so every
//! accessor here is `#[inline(never)]`: a TLS address computed before a
//! switch must not be reused after it.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber running on this thread (null before the main fiber exists)
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// The fiber standing for this thread's own stack
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread works for
    static SCHEDULER: RefCell<Weak<Scheduler>> = RefCell::new(Weak::new());

    /// Cached gettid(), 0 until first asked
    static THREAD_ID: Cell<i32> = const { Cell::new(0) };

    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

#[inline(never)]
pub fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
    let id = if fiber.is_null() {
        0
    } else {
        // Safety: callers pass a live fiber
        unsafe { (*fiber).id().as_u64() }
    };
    strand_core::kprint::set_fiber_id(id);
}

/// Install `main` as this thread's main fiber and make it current
#[inline(never)]
pub fn install_main_fiber(main: Arc<Fiber>) -> *const Fiber {
    let ptr = Arc::as_ptr(&main);
    MAIN_FIBER.with(|m| *m.borrow_mut() = Some(main));
    set_current_fiber(ptr);
    ptr
}

#[inline(never)]
pub fn set_scheduler(sched: Weak<Scheduler>) {
    SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

#[inline(never)]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|s| s.borrow().upgrade())
}

#[inline(never)]
pub fn clear_scheduler() {
    SCHEDULER.with(|s| *s.borrow_mut() = Weak::new());
}

/// OS thread id of the calling thread
#[inline(never)]
pub fn thread_id() -> i32 {
    THREAD_ID.with(|t| {
        let cached = t.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        t.set(tid);
        tid
    })
}

#[inline(never)]
pub fn thread_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

#[inline(never)]
pub fn set_thread_name(name: &str) {
    THREAD_NAME.with(|n| {
        let mut n = n.borrow_mut();
        n.clear();
        n.push_str(name);
    });
    strand_core::kprint::set_thread_context(thread_id(), name);
}
