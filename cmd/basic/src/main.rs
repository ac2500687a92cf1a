//! Basic strand example
//!
//! Runs closures and fibers on a 4-thread scheduler that injects into the
//! main thread, then a timer and a sleeping fiber on an IoManager.
//!
//! # Environment Variables
//!
//! - `STRAND_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `STRAND_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use strand::{current_fiber_id, sleep_ms, yield_now, Fiber, IoConfig, IoManager, Scheduler, SchedulerConfig};
use strand::{kdebug, kinfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

// STRAND_LOG_LEVEL=debug STRAND_FLUSH_EPRINT=1 cargo run -p strand-basic
fn main() {
    println!("=== strand Basic Example ===\n");
    strand::init_logging();

    let config = SchedulerConfig::from_env().name("basic").threads(4).use_caller(true);
    config.print();
    let sched = Scheduler::new(config).expect("scheduler");
    sched.start().expect("start");

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        sched.schedule_fn(move || {
            kdebug!("[task {}] started on fiber {}", i, current_fiber_id());
            for j in 0..3 {
                kdebug!("[task {}] iteration {}", i, j);
                yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // A fiber built up front and handed to the scheduler
    let c = completed.clone();
    let fiber = Fiber::new(
        move || {
            kdebug!("[fiber] parked once");
            Fiber::yield_to_ready();
            c.fetch_add(1, Ordering::SeqCst);
        },
        0,
    )
    .expect("fiber");
    println!("Created fiber {}", fiber.id());
    sched.schedule(fiber);

    // Pinned to the main thread, which joins in during stop()
    let main_tid = sched.root_thread().unwrap_or(-1);
    let c = completed.clone();
    sched.schedule_on(
        strand::Task::call(move || {
            kdebug!("[pinned] on thread {}", strand::Thread::current_id());
            c.fetch_add(1, Ordering::SeqCst);
        }),
        main_tid,
    );

    sched.stop();
    println!("{} tasks completed on the scheduler", completed.load(Ordering::SeqCst));

    // Reactor: a recurring timer and a fiber sleeping on it
    let iom = IoManager::new(
        SchedulerConfig::from_env().name("reactor").threads(2),
        IoConfig::from_env(),
    )
    .expect("iomanager");

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let ticker = iom.add_timer(50, move || {
        t.fetch_add(1, Ordering::SeqCst);
    }, true);

    let start = Instant::now();
    iom.schedule_fn(move || {
        sleep_ms(275);
        ticker.cancel();
        kinfo!("sleeper woke after {:?}", start.elapsed());
    });

    iom.stop();
    println!("Timer ticked {} times", ticks.load(Ordering::SeqCst));
    println!("\n=== Example Complete ===");
}
