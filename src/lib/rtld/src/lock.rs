//! The loader lock. Readers (symbol lookup, lazy binding, `dladdr` and friends) share it; loading,
//! unloading and running init or fini code take it exclusively.
//!
//! The exclusive holder may also take the lock shared, since initializers routinely call
//! `dlsym`. Taking it exclusively again from the same thread would deadlock, so that is reported
//! instead of waited on.

use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{fatal_error, RtldError, RtldErrorKind};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<ThreadId>,
    /// The exclusive owner while it runs downgraded. It counts as one of `readers`, and keeps
    /// other threads from taking the lock exclusively until it upgrades again.
    downgraded: Option<ThreadId>,
}

#[derive(Debug, Default)]
pub struct RtldLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

fn block_signals() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = core::mem::zeroed();
        let mut old: libc::sigset_t = core::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, libc::SIGTRAP);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
        old
    }
}

fn restore_signals(old: &libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, old, core::ptr::null_mut());
    }
}

impl RtldLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock shared. Waits while another thread holds it exclusively.
    pub fn shared(&self) -> SharedGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        while state.writer.is_some_and(|w| w != me) {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
        SharedGuard { lock: self }
    }

    /// Take the lock exclusively, or fail if the calling thread already holds it exclusively.
    pub fn try_exclusive(&self) -> Result<ExclusiveGuard<'_>, RtldError> {
        let me = std::thread::current().id();
        let mask = block_signals();
        let mut state = self.state.lock();
        if state.writer == Some(me) || state.downgraded == Some(me) {
            drop(state);
            restore_signals(&mask);
            return Err(RtldErrorKind::ReentrantExclusive.into());
        }
        while state.writer.is_some() || state.downgraded.is_some() || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = Some(me);
        trace!("rtld lock: exclusive taken");
        Ok(ExclusiveGuard {
            lock: self,
            mask: Some(mask),
        })
    }

    /// Take the lock exclusively. Re-entering is fatal.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        match self.try_exclusive() {
            Ok(guard) => guard,
            Err(e) => fatal_error(&e),
        }
    }

    /// Whether the exclusive holder is currently running downgraded.
    pub fn is_downgraded(&self) -> bool {
        self.state.lock().downgraded.is_some()
    }

    /// Whether the calling thread holds the lock exclusively.
    pub fn held_exclusive(&self) -> bool {
        self.state.lock().writer == Some(std::thread::current().id())
    }
}

/// Shared access. Released on drop.
#[derive(Debug)]
pub struct SharedGuard<'a> {
    lock: &'a RtldLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.cond.notify_all();
        }
    }
}

/// Exclusive access. Released on drop, restoring the signal mask that was in effect before.
pub struct ExclusiveGuard<'a> {
    lock: &'a RtldLock,
    mask: Option<libc::sigset_t>,
}

impl core::fmt::Debug for ExclusiveGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExclusiveGuard")
            .field("lock", self.lock)
            .finish_non_exhaustive()
    }
}

impl ExclusiveGuard<'_> {
    /// Run `f` with the lock downgraded to shared: other threads may take it shared too, but
    /// none may take it exclusively. The caller must not modify loader state. Used to run
    /// indirect function resolvers, which may call back into `dlsym`.
    pub fn with_downgraded<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let me = std::thread::current().id();
        {
            let mut state = self.lock.state.lock();
            state.writer = None;
            state.downgraded = Some(me);
            state.readers += 1;
            self.lock.cond.notify_all();
        }
        trace!("rtld lock: downgraded");
        let ret = f();
        {
            let mut state = self.lock.state.lock();
            state.readers -= 1;
            while state.readers > 0 {
                self.lock.cond.wait(&mut state);
            }
            state.downgraded = None;
            state.writer = Some(me);
        }
        trace!("rtld lock: upgraded");
        ret
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            state.writer = None;
            state.downgraded = None;
            self.lock.cond.notify_all();
        }
        trace!("rtld lock: exclusive released");
        if let Some(mask) = self.mask.take() {
            restore_signals(&mask);
        }
    }
}
