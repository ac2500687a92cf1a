//! Named OS thread wrapper with a startup handshake
//!
//! `Thread::spawn` does not return until the new thread has published its
//! OS thread id and installed its name, so affinity checks made right after
//! spawning compare against the real id.

use crate::tls;
use std::sync::mpsc;
use std::thread::JoinHandle;
use strand_core::error::{SchedError, SchedResult};
use strand_core::{kdebug, kerror};

/// A spawned, named OS thread
pub struct Thread {
    id: i32,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn `f` on a new thread called `name`
    ///
    /// An empty name becomes `"UNKNOWN"`.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut name = name.into();
        if name.is_empty() {
            name = "UNKNOWN".to_string();
        }

        let (tx, rx) = mpsc::sync_channel::<i32>(1);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tls::set_thread_name(&thread_name);
                // Creator is blocked on recv until this lands
                let _ = tx.send(tls::thread_id());
                drop(tx);
                f();
            })
            .map_err(|e| SchedError::os("thread spawn", e.raw_os_error().unwrap_or(libc::EAGAIN)))?;

        let id = match rx.recv() {
            Ok(id) => id,
            Err(_) => {
                kerror!("thread {} exited before the startup handshake", name);
                return Err(SchedError::InvalidState);
            }
        };
        kdebug!("thread {} started, tid {}", name, id);

        Ok(Thread { id, name, handle: Some(handle) })
    }

    /// OS thread id
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    ///
    /// A panic on the thread is logged, not propagated.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                kerror!("thread {} (tid {}) panicked", self.name, self.id);
            }
        }
    }

    /// Name of the calling thread, `"UNKNOWN"` if it was not spawned here
    pub fn current_name() -> String {
        tls::thread_name()
    }

    /// Rename the calling thread for logging purposes
    pub fn set_current_name(name: &str) {
        tls::set_thread_name(name);
    }

    /// OS thread id of the calling thread
    #[inline]
    pub fn current_id() -> i32 {
        tls::thread_id()
    }
}

// Dropping an unjoined Thread detaches it, like std's JoinHandle.

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_handshake_publishes_tid_before_return() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = Arc::clone(&seen);
        let t = Thread::spawn("hs_worker", move || {
            seen2.store(Thread::current_id(), Ordering::SeqCst);
        })
        .unwrap();

        let id = t.id();
        assert!(id > 0);
        assert_ne!(id, Thread::current_id());
        t.join();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }

    #[test]
    fn test_name_visible_inside_thread() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn("named_7", move || {
            tx.send(Thread::current_name()).unwrap();
        })
        .unwrap();
        assert_eq!(t.name(), "named_7");
        assert_eq!(rx.recv().unwrap(), "named_7");
        t.join();
    }

    #[test]
    fn test_empty_name_and_panicking_body() {
        let t = Thread::spawn("", || panic!("boom")).unwrap();
        assert_eq!(t.name(), "UNKNOWN");
        // Logged, not propagated
        t.join();
    }
}
