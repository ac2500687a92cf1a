//! Fiber-aware blocking calls
//!
//! Inside a fiber running on an [`IoManager`] these behave like their
//! blocking libc counterparts without blocking the worker: the call is
//! tried non-blocking, and on `EAGAIN` the fiber registers interest in the
//! fd (plus a timeout timer when one is set), parks, and retries once it
//! is woken. Anywhere else they are the plain blocking call.
//!
//! ```ignore
//! iom.schedule_fn(move || -> std::io::Result<()> {
//!     let conn = hook::accept(listen_fd)?;
//!     hook::set_timeout(conn, Event::READ, Some(Duration::from_secs(5)))?;
//!     let mut buf = [0u8; 4096];
//!     let n = hook::read(conn, &mut buf)?;
//!     hook::write_all(conn, &buf[..n])?;
//!     hook::close(conn)
//! });
//! ```
//!
//! Sockets seen through this module are switched to `O_NONBLOCK` at the
//! OS level; [`set_nonblocking`] records what the caller asked for, and a
//! caller-requested non-blocking fd gets `EAGAIN` back as usual.

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use nix::errno::Errno;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use strand_core::constants::NO_TIMER;
use strand_core::{kdebug, kerror, ktrace, Event};

/// What the hook layer knows about one fd
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    /// O_NONBLOCK set by us
    sys_nonblock: bool,
    /// O_NONBLOCK requested by the caller
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn inspect(fd: RawFd) -> Option<FdCtx> {
        // Safety: fstat into a zeroed stat buffer
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            return None;
        }
        let is_socket = st.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        Some(FdCtx {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMER),
            send_timeout: AtomicU64::new(NO_TIMER),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn timeout_slot(&self, dir: Event) -> &AtomicU64 {
        if dir == Event::READ {
            &self.recv_timeout
        } else {
            &self.send_timeout
        }
    }

    /// Timeout for waits in direction `dir`, in ms
    pub fn timeout(&self, dir: Event) -> Option<u64> {
        match self.timeout_slot(dir).load(Ordering::Relaxed) {
            NO_TIMER => None,
            ms => Some(ms),
        }
    }

    fn set_timeout(&self, dir: Event, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMER, |d| (d.as_millis() as u64).min(NO_TIMER - 1));
        self.timeout_slot(dir).store(ms, Ordering::Relaxed);
    }
}

/// Process-wide fd table, indexed by fd number
pub struct FdRegistry {
    table: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    pub fn global() -> &'static FdRegistry {
        static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| FdRegistry {
            table: RwLock::new(vec![None; 64]),
        })
    }

    /// Context for `fd`; with `create` an unknown fd is inspected and added
    pub fn get(&self, fd: RawFd, create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let table = self.table.read().unwrap_or_else(|p| p.into_inner());
            match table.get(fd as usize) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !create => return None,
                _ => {}
            }
        }

        let ctx = Arc::new(FdCtx::inspect(fd)?);
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        let idx = fd as usize;
        if idx >= table.len() {
            let len = (idx + 1).max(table.len() * 3 / 2);
            table.resize(len, None);
        }
        let slot = table[idx].get_or_insert_with(|| Arc::clone(&ctx));
        ktrace!("fd {} registered (socket={})", fd, slot.is_socket);
        Some(Arc::clone(slot))
    }

    /// Forget `fd`, marking its context closed
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        if let Some(ctx) = table.get_mut(fd as usize).and_then(Option::take) {
            ctx.closed.store(true, Ordering::Relaxed);
        }
    }
}

/// The reactor to park on, if the caller is a fiber under one
fn hooked() -> Option<IoManager> {
    if !Fiber::in_fiber() {
        return None;
    }
    IoManager::current()
}

#[inline]
fn last_error() -> io::Error {
    io::Error::from_raw_os_error(Errno::last() as i32)
}

/// Park the current fiber until `fd` is ready for `dir` or `timeout` ms
/// pass. Returns true on timeout.
fn wait_ready(iom: &IoManager, fd: RawFd, dir: Event, timeout: Option<u64>, what: &str) -> io::Result<bool> {
    let token = Arc::new(AtomicI32::new(0));
    let timer = timeout.map(|ms| {
        let flag = Arc::downgrade(&token);
        let reactor = Arc::downgrade(iom.reactor());
        iom.add_condition_timer(
            ms,
            move || {
                let (Some(flag), Some(reactor)) = (flag.upgrade(), reactor.upgrade()) else {
                    return;
                };
                flag.store(libc::ETIMEDOUT, Ordering::SeqCst);
                let _ = reactor.cancel_event(fd, dir);
            },
            Arc::downgrade(&token),
            false,
        )
    });

    if let Err(e) = iom.add_event(fd, dir) {
        kerror!("{}: add_event(fd={}, {}) failed: {}", what, fd, dir, e);
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(e.into());
    }

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    Ok(token.load(Ordering::SeqCst) != 0)
}

/// Run `op` until it stops returning `EAGAIN`, parking between attempts
fn do_io<F>(fd: RawFd, what: &'static str, dir: Event, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    let attempt = |op: &mut F| loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        if Errno::last() != Errno::EINTR {
            return Err(last_error());
        }
    };

    let Some(iom) = hooked() else {
        return attempt(&mut op);
    };
    let Some(ctx) = FdRegistry::global().get(fd, true) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return attempt(&mut op);
    }

    let timeout = ctx.timeout(dir);
    loop {
        match attempt(&mut op) {
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {}
            res => return res,
        }
        ktrace!("{}(fd={}) would block, parking", what, fd);
        if wait_ready(&iom, fd, dir, timeout, what)? {
            kdebug!("{}(fd={}) timed out after {:?} ms", what, fd, timeout);
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
    }
}

/// Sleep the current fiber, or the thread outside a reactor fiber
pub fn sleep_ms(ms: u64) {
    let Some(iom) = hooked() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let sched = Arc::downgrade(iom.scheduler());
    iom.add_timer(
        ms,
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.schedule(Arc::clone(&fiber));
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// Write all of `buf`, parking as often as needed
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags | libc::MSG_NOSIGNAL)
    })
}

/// Accept a connection; the new fd is close-on-exec and known to the
/// registry
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let conn = do_io(fd, "accept", Event::READ, || unsafe {
        libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC) as isize
    })? as RawFd;
    FdRegistry::global().get(conn, true);
    Ok(conn)
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            // Safety: sockaddr_storage is larger than and aligned for sockaddr_in
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            // Safety: as above, for sockaddr_in6
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn raw_connect(fd: RawFd, addr: &SocketAddr) -> libc::c_int {
    let (storage, len) = to_sockaddr(addr);
    // Safety: storage holds a sockaddr of length len
    unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) }
}

/// Connect `fd` to `addr`, giving up after `timeout`
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<()> {
    let blocking = |fd| {
        if raw_connect(fd, addr) == 0 {
            Ok(())
        } else {
            Err(last_error())
        }
    };

    let Some(iom) = hooked() else {
        return blocking(fd);
    };
    let Some(ctx) = FdRegistry::global().get(fd, true) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return blocking(fd);
    }

    if raw_connect(fd, addr) == 0 {
        return Ok(());
    }
    let err = Errno::last();
    if err != Errno::EINPROGRESS {
        return Err(io::Error::from_raw_os_error(err as i32));
    }

    let timeout_ms = timeout.map(|d| d.as_millis() as u64);
    if wait_ready(&iom, fd, Event::WRITE, timeout_ms, "connect")? {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let mut so_error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: so_error and len are live out-params
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// Close `fd`, waking anything parked on it first
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(iom) = IoManager::current() {
        if let Err(e) = iom.cancel_all(fd) {
            kerror!("close(fd={}): cancel_all failed: {}", fd, e);
        }
    }
    FdRegistry::global().remove(fd);
    // Safety: the caller gives up fd
    if unsafe { libc::close(fd) } < 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Timeout for parked reads (`Event::READ`) or writes (`Event::WRITE`)
pub fn set_timeout(fd: RawFd, dir: Event, timeout: Option<Duration>) -> io::Result<()> {
    let ctx = FdRegistry::global()
        .get(fd, true)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
    ctx.set_timeout(dir, timeout);
    Ok(())
}

/// Record whether the caller wants `EAGAIN` instead of parking
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let ctx = FdRegistry::global()
        .get(fd, true)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
    ctx.user_nonblock.store(nonblocking, Ordering::Relaxed);
    if !ctx.is_socket() {
        // Safety: plain fcntl on a caller-owned fd
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(last_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(last_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IoConfig, SchedulerConfig};
    use std::net::TcpListener;
    use std::os::fd::IntoRawFd;
    use std::sync::mpsc;
    use std::time::Instant;

    fn iomanager(threads: usize) -> IoManager {
        let config = SchedulerConfig::new()
            .name("hook")
            .threads(threads)
            .use_caller(false)
            .stack_size(128 * 1024);
        IoManager::new(config, IoConfig::new()).unwrap()
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_registry_inspects_sockets() {
        let (a, b) = socketpair();
        let ctx = FdRegistry::global().get(a, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        assert!(FdRegistry::global().get(-1, true).is_none());
        close(a).unwrap();
        close(b).unwrap();
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_plain_calls_outside_reactor() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"abc").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        close(fds[0]).unwrap();
        close(fds[1]).unwrap();

        let start = Instant::now();
        sleep_ms(20);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_read_parks_until_peer_writes() {
        let iom = iomanager(2);
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let mut buf = [0u8; 16];
            let n = read(a, &mut buf).unwrap();
            tx.send(buf[..n].to_vec()).unwrap();
        });
        iom.schedule_fn(move || {
            sleep_ms(50);
            write_all(b, b"hello").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"hello");
        iom.stop();
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let iom = iomanager(1);
        let (a, b) = socketpair();
        set_timeout(a, Event::READ, Some(Duration::from_millis(100))).unwrap();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let err = read(a, &mut buf).unwrap_err();
            tx.send((err.kind(), start.elapsed())).unwrap();
        });

        let (kind, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, io::ErrorKind::TimedOut);
        assert!(elapsed >= Duration::from_millis(100));
        iom.stop();
        assert_eq!(iom.pending_event_count(), 0);
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_user_nonblocking_returns_eagain() {
        let iom = iomanager(1);
        let (a, b) = socketpair();
        set_nonblocking(a, true).unwrap();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let mut buf = [0u8; 4];
            tx.send(read(a, &mut buf).unwrap_err().kind()).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), io::ErrorKind::WouldBlock);
        iom.stop();
        close(a).unwrap();
        close(b).unwrap();
    }

    #[test]
    fn test_fiber_sleep() {
        let iom = iomanager(1);
        let (tx, rx) = mpsc::channel();
        iom.schedule_fn(move || {
            let start = Instant::now();
            sleep_ms(60);
            tx.send(start.elapsed()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap() >= Duration::from_millis(60));
        iom.stop();
    }

    #[test]
    fn test_tcp_accept_connect_echo() {
        let iom = iomanager(2);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let lfd = listener.into_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || -> io::Result<()> {
            let conn = accept(lfd)?;
            let mut buf = [0u8; 64];
            let n = read(conn, &mut buf)?;
            write_all(conn, &buf[..n])?;
            close(conn)
        });
        iom.schedule_fn(move || -> io::Result<()> {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
            assert!(fd >= 0);
            connect_with_timeout(fd, &addr, Some(Duration::from_secs(1)))?;
            write_all(fd, b"ping")?;
            let mut buf = [0u8; 64];
            let n = read(fd, &mut buf)?;
            tx.send(buf[..n].to_vec()).unwrap();
            close(fd)
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), b"ping");
        iom.stop();
        close(lfd).unwrap();
    }
}
