//! Stackful fibers
//!
//! A `Fiber` owns an mmap'd stack, a saved register file and an entry
//! closure. It is always handled through `Arc<Fiber>`: the run queue, an
//! event registration or a timer callback may all hold one.
//!
//! # State protocol
//!
//! `state` is `Exec` exactly while the fiber's context is live on some
//! thread. A fiber that yields records the state it wants in `yielded`
//! and switches away; the thread that resumed it publishes that state only
//! after the switch has completed. Another thread therefore never sees
//! `Hold`/`Ready` for a context that is still being saved.
//!
//! Every OS thread gets a lazily created *main fiber* for its own stack.
//! It has no stack of its own, id 0, and is permanently `Exec`.

use crate::arch::{self, SavedRegs};
use crate::stack::FiberStack;
use crate::tls;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use strand_core::constants::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use strand_core::error::SchedResult;
use strand_core::{fatal_assert, kdebug, kerror, ktrace, kwarn, FiberId, FiberState};

/// Boxed fiber body; `Err` marks the fiber `Except`
pub type FiberEntry = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// Return types accepted from a fiber body
pub trait IntoFiberResult {
    fn into_fiber_result(self) -> Result<(), String>;
}

impl IntoFiberResult for () {
    #[inline]
    fn into_fiber_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> IntoFiberResult for Result<(), E> {
    #[inline]
    fn into_fiber_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// Box a closure as a `FiberEntry`
pub fn box_entry<F, R>(f: F) -> FiberEntry
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoFiberResult,
{
    Box::new(move || f().into_fiber_result())
}

static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// State requested by the last yield, published by `resume`
    yielded: AtomicU8,
    regs: UnsafeCell<SavedRegs>,
    /// None for a thread's main fiber
    stack: Option<FiberStack>,
    entry: UnsafeCell<Option<FiberEntry>>,
    /// Context that resumed us; valid while we are Exec
    caller: AtomicPtr<Fiber>,
}

// Safety: regs and entry are only touched by the thread that owns the
// fiber's execution, which the Exec state makes exclusive.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber in `Init` state
    ///
    /// `stack_size` of 0 selects the default (1 MiB).
    pub fn new<F, R>(f: F, stack_size: usize) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFiberResult,
    {
        Self::with_entry(box_entry(f), stack_size)
    }

    pub fn with_entry(entry: FiberEntry, stack_size: usize) -> SchedResult<Arc<Fiber>> {
        let size = match stack_size {
            0 => DEFAULT_STACK_SIZE,
            n => n.max(MIN_STACK_SIZE),
        };
        let stack = FiberStack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            yielded: AtomicU8::new(FiberState::Hold as u8),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(entry)),
            caller: AtomicPtr::new(std::ptr::null_mut()),
        });
        // Safety: nobody else can see the fiber yet
        unsafe { fiber.init_regs() };

        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        ktrace!("fiber {} created, stack {} bytes", fiber.id, size);
        Ok(fiber)
    }

    fn new_main() -> Arc<Fiber> {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::NONE,
            state: AtomicU8::new(FiberState::Exec as u8),
            yielded: AtomicU8::new(FiberState::Exec as u8),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: None,
            entry: UnsafeCell::new(None),
            caller: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    /// # Safety
    ///
    /// The fiber must not be running and nobody may resume it concurrently.
    unsafe fn init_regs(&self) {
        if let Some(stack) = &self.stack {
            arch::init_context(self.regs.get(), stack.top(), fiber_main, self as *const Fiber as usize);
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether this is a thread's main fiber
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, FiberStack::size)
    }

    /// Switch into this fiber and run it until it yields or finishes
    ///
    /// Returns the state the fiber left in: `Hold`, `Ready`, `Term` or
    /// `Except`. Resuming a fiber that is already running anywhere is a
    /// fatal contract violation.
    pub fn resume(&self) -> FiberState {
        let prev = self.state();
        fatal_assert!(
            prev != FiberState::Exec,
            "double resume of fiber {} which is already running",
            self.id
        );
        fatal_assert!(
            prev.is_resumable() && !self.is_main(),
            "resume of fiber {} in state {}",
            self.id,
            prev
        );
        let claimed = self.state.compare_exchange(
            prev as u8,
            FiberState::Exec as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        fatal_assert!(claimed.is_ok(), "fiber {} resumed concurrently from two threads", self.id);

        let caller = current_ptr();
        self.caller.store(caller as *mut Fiber, Ordering::Release);
        tls::set_current_fiber(self);

        // Safety: caller is the live context of this thread, self was
        // claimed above so no other thread touches its registers.
        unsafe {
            arch::switch_context((*caller).regs.get(), self.regs.get());
        }

        tls::set_current_fiber(caller);
        let next = FiberState::from(self.yielded.load(Ordering::Acquire));
        self.state.store(next as u8, Ordering::Release);
        next
    }

    /// Give up the CPU and ask to be rescheduled right away
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Give up the CPU and park until someone re-enqueues this fiber
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    fn yield_with(state: FiberState) {
        let cur = tls::current_fiber_ptr();
        fatal_assert!(!cur.is_null(), "yield outside of any fiber");
        // Safety: the current fiber is alive while it runs
        let cur = unsafe { &*cur };
        fatal_assert!(!cur.is_main(), "yield from a thread's main fiber");
        cur.switch_out(state);
    }

    fn switch_out(&self, state: FiberState) {
        let caller = self.caller.load(Ordering::Acquire);
        self.yielded.store(state as u8, Ordering::Release);
        // Safety: caller is blocked inside resume() until we switch back
        unsafe {
            arch::switch_context(self.regs.get(), (*caller).regs.get());
        }
    }

    /// Give a finished fiber a new body, keeping its stack
    ///
    /// Only legal in `Init`, `Term` or `Except`.
    pub fn reset<F, R>(&self, f: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoFiberResult,
    {
        self.reset_entry(box_entry(f));
    }

    pub fn reset_entry(&self, entry: FiberEntry) {
        let prev = self.state();
        fatal_assert!(!self.is_main(), "reset of a main fiber");
        fatal_assert!(prev.is_resettable(), "reset of fiber {} in state {}", self.id, prev);

        // Hold the fiber as Exec while rewriting so nothing can resume it
        let claimed = self.state.compare_exchange(
            prev as u8,
            FiberState::Exec as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        fatal_assert!(claimed.is_ok(), "fiber {} reset while being resumed", self.id);

        // Safety: claimed above
        unsafe {
            *self.entry.get() = Some(entry);
            self.init_regs();
        }
        self.state.store(FiberState::Init as u8, Ordering::Release);
    }

    /// The fiber running on this thread, creating the main fiber on first use
    pub fn current() -> Arc<Fiber> {
        let ptr = current_ptr();
        // Safety: every fiber pointer in TLS comes from a live Arc
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber, `FiberId::NONE` outside any task fiber
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            FiberId::NONE
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// True when running on a fiber stack rather than a thread's own stack
    pub fn in_fiber() -> bool {
        let ptr = tls::current_fiber_ptr();
        !ptr.is_null() && unsafe { !(*ptr).is_main() }
    }

    /// Live `Fiber` objects in the process, main fibers included
    pub fn total_fibers() -> u64 {
        TOTAL_FIBERS.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack", &self.stack_size())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.is_main() {
            return;
        }
        let state = self.state();
        match state {
            FiberState::Init | FiberState::Term | FiberState::Except => {
                ktrace!("fiber {} destroyed in {}", self.id, state);
            }
            // The suspended frames are discarded without unwinding
            _ => kwarn!("fiber {} dropped while {}", self.id, state),
        }
    }
}

/// Current fiber pointer, creating the main fiber on first use
fn current_ptr() -> *const Fiber {
    let ptr = tls::current_fiber_ptr();
    if !ptr.is_null() {
        return ptr;
    }
    let main = Fiber::new_main();
    kdebug!("main fiber installed on thread {}", tls::thread_id());
    tls::install_main_fiber(main)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// First frame on every fiber stack
extern "C" fn fiber_main(arg: usize) -> ! {
    // Safety: arg is the fiber that was resumed into this stack
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = unsafe { (*fiber.entry.get()).take() };

    let end = match entry.map(|body| panic::catch_unwind(AssertUnwindSafe(body))) {
        None | Some(Ok(Ok(()))) => FiberState::Term,
        Some(Ok(Err(msg))) => {
            kerror!(
                "fiber {} failed: {}\nbacktrace:\n{}",
                fiber.id,
                msg,
                Backtrace::force_capture()
            );
            FiberState::Except
        }
        Some(Err(payload)) => {
            kerror!(
                "fiber {} panicked: {}\nbacktrace:\n{}",
                fiber.id,
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            );
            FiberState::Except
        }
    };

    fiber.switch_out(end);
    // A finished fiber is only ever re-entered through reset()
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_resume_runs_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 64 * 1024).unwrap();

        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_hold_and_ready() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&steps);
        let fiber = Fiber::new(
            move || {
                s.lock().unwrap().push(1);
                Fiber::yield_to_hold();
                s.lock().unwrap().push(2);
                Fiber::yield_to_ready();
                s.lock().unwrap().push(3);
            },
            0,
        )
        .unwrap();

        assert_eq!(fiber.resume(), FiberState::Hold);
        assert_eq!(*steps.lock().unwrap(), vec![1]);
        assert_eq!(fiber.resume(), FiberState::Ready);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(*steps.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_current_id_inside_and_outside() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let fiber = Fiber::new(
            move || {
                assert!(Fiber::in_fiber());
                s.store(Fiber::current_id().as_u64(), Ordering::SeqCst);
            },
            0,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(seen.load(Ordering::SeqCst), fiber.id().as_u64());
        assert!(!Fiber::in_fiber());
        assert!(Fiber::current_id().is_none());
        assert!(Fiber::current().is_main());
    }

    #[test]
    fn test_error_and_panic_become_except() {
        let failing = Fiber::new(|| -> Result<(), String> { Err("nope".into()) }, 0).unwrap();
        assert_eq!(failing.resume(), FiberState::Except);

        let panicking = Fiber::new::<_, ()>(|| panic!("fiber body panic"), 0).unwrap();
        assert_eq!(panicking.resume(), FiberState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 0).unwrap();
        fiber.resume();

        let h = Arc::clone(&hits);
        fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_double_resume_is_rejected() {
        let slot: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
        let rejected = Arc::new(AtomicUsize::new(0));

        let slot2 = Arc::clone(&slot);
        let rejected2 = Arc::clone(&rejected);
        let fiber = Fiber::new(
            move || {
                let me = slot2.lock().unwrap().clone().unwrap();
                // Resuming ourselves while Exec must trip the assertion
                if panic::catch_unwind(AssertUnwindSafe(|| me.resume())).is_err() {
                    rejected2.fetch_add(1, Ordering::SeqCst);
                }
                assert_eq!(me.state(), FiberState::Exec);
            },
            0,
        )
        .unwrap();
        *slot.lock().unwrap() = Some(Arc::clone(&fiber));

        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        slot.lock().unwrap().take();
    }

    #[test]
    #[should_panic(expected = "reset of fiber")]
    fn test_reset_of_parked_fiber_is_fatal() {
        let fiber = Fiber::new(Fiber::yield_to_hold, 0).unwrap();
        assert_eq!(fiber.resume(), FiberState::Hold);
        fiber.reset(|| ());
    }

    #[test]
    #[should_panic(expected = "yield")]
    fn test_yield_on_main_stack_is_fatal() {
        Fiber::current();
        Fiber::yield_to_hold();
    }

    #[test]
    fn test_nested_resume_returns_to_resumer() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let outer = Fiber::new(
            move || {
                let o2 = Arc::clone(&o);
                let inner = Fiber::new(
                    move || {
                        o2.lock().unwrap().push("inner-1");
                        Fiber::yield_to_hold();
                        o2.lock().unwrap().push("inner-2");
                    },
                    0,
                )
                .unwrap();
                o.lock().unwrap().push("outer-1");
                assert_eq!(inner.resume(), FiberState::Hold);
                Fiber::yield_to_hold();
                assert_eq!(inner.resume(), FiberState::Term);
                o.lock().unwrap().push("outer-2");
            },
            0,
        )
        .unwrap();

        assert_eq!(outer.resume(), FiberState::Hold);
        assert_eq!(outer.resume(), FiberState::Term);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-1", "inner-1", "inner-2", "outer-2"]
        );
    }
}
