//! strand Echo Server
//!
//! TCP echo server with one fiber per connection. Reads and writes go
//! through `strand::hook`, so a connection waiting for data parks its
//! fiber instead of blocking a worker.
//!
//! Usage:
//!     cargo build --release -p strand-echo
//!     ./target/release/strand-echo [port] [--threads N] [--idle-timeout-ms MS]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     # Many clients (from another terminal):
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done
//!
//! Ctrl-C closes the listener; open connections finish or time out.

use nix::sys::signal::{signal, SigHandler, Signal};
use std::net::TcpListener;
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use strand::{hook, kdebug, kinfo, kwarn, Event, IoConfig, IoManager, SchedulerConfig, Timer};

static RUNNING: AtomicBool = AtomicBool::new(true);
static TOTAL_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static BYTES_ECHOED: AtomicU64 = AtomicU64::new(0);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

struct Args {
    port: u16,
    threads: usize,
    idle_timeout: Duration,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        port: 9999,
        threads: 4,
        idle_timeout: Duration::from_secs(5),
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--threads" | "-t" => {
                i += 1;
                if let Some(t) = args.get(i).and_then(|s| s.parse().ok()) {
                    parsed.threads = t;
                }
            }
            "--idle-timeout-ms" => {
                i += 1;
                if let Some(ms) = args.get(i).and_then(|s| s.parse().ok()) {
                    parsed.idle_timeout = Duration::from_millis(ms);
                }
            }
            s => {
                if let Ok(port) = s.parse() {
                    parsed.port = port;
                }
            }
        }
        i += 1;
    }
    parsed
}

fn handle_conn(fd: RawFd, idle_timeout: Duration) -> std::io::Result<()> {
    hook::set_timeout(fd, Event::READ, Some(idle_timeout))?;
    hook::set_timeout(fd, Event::WRITE, Some(idle_timeout))?;

    let mut buf = [0u8; 4096];
    let result = loop {
        let n = match hook::read(fd, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = hook::write_all(fd, &buf[..n]) {
            break Err(e);
        }
        BYTES_ECHOED.fetch_add(n as u64, Ordering::Relaxed);
    };
    hook::close(fd)?;
    result
}

fn accept_loop(lfd: RawFd, idle_timeout: Duration) {
    loop {
        let fd = match hook::accept(lfd) {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                kinfo!("listener closed, accept loop done");
                return;
            }
            Err(e) => {
                kwarn!("accept failed: {}", e);
                hook::sleep_ms(10);
                continue;
            }
        };
        TOTAL_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        kdebug!("accepted fd {}", fd);

        let spawned = strand::spawn(move || {
            if let Err(e) = handle_conn(fd, idle_timeout) {
                kdebug!("connection fd {} ended: {}", fd, e);
            }
        });
        if let Err(e) = spawned {
            kwarn!("cannot spawn connection fiber: {}", e);
            let _ = hook::close(fd);
        }
    }
}

fn main() {
    strand::init_logging();
    let args = parse_args();

    // Safety: the handler only stores to an atomic
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_sigint));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_sigint));
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let listener = match TcpListener::bind(("0.0.0.0", args.port)) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("strand-echo: bind port {} failed: {}", args.port, e);
            std::process::exit(1);
        }
    };
    let lfd = listener.into_raw_fd();

    let config = SchedulerConfig::from_env().name("echo").threads(args.threads).use_caller(true);
    let iom = match IoManager::new(config, IoConfig::from_env()) {
        Ok(iom) => iom,
        Err(e) => {
            eprintln!("strand-echo: reactor setup failed: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "strand-echo: port={} threads={} idle_timeout={:?}",
        args.port, args.threads, args.idle_timeout
    );

    let idle_timeout = args.idle_timeout;
    iom.schedule_fn(move || accept_loop(lfd, idle_timeout));

    // Shutdown watcher: closing the listener wakes the accept loop
    let watcher: Arc<OnceLock<Arc<Timer>>> = Arc::new(OnceLock::new());
    let slot = Arc::clone(&watcher);
    let timer = iom.add_timer(
        200,
        move || {
            if RUNNING.load(Ordering::Relaxed) {
                return;
            }
            if let Some(timer) = slot.get() {
                timer.cancel();
            }
            if let Err(e) = hook::close(lfd) {
                kwarn!("closing listener: {}", e);
            }
        },
        true,
    );
    let _ = watcher.set(timer);

    // The main thread serves as a worker until everything has drained
    iom.stop();

    eprintln!(
        "\nstrand-echo: shutdown - {} connections, {} bytes echoed",
        TOTAL_CONNECTIONS.load(Ordering::Relaxed),
        BYTES_ECHOED.load(Ordering::Relaxed)
    );
}
