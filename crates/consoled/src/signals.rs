//! Process signals as flags the main loop checks between waits.
//!
//! Handlers only store into atomics. They are installed without
//! `SA_RESTART` so that a signal interrupts the readiness wait and the
//! loop gets to look at the flags promptly.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction,
};

use crate::Result;

static INSTALLED: OnceLock<Arc<Inner>> = OnceLock::new();

#[derive(Clone)]
pub struct Signals {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    reload: AtomicBool,
    shutdown: AtomicBool,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    /// Flags nobody but the caller can set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// Route SIGHUP to reload and SIGTERM/SIGINT to shutdown.
    /// Calling it again returns the already installed flags.
    pub fn install() -> Result<Self> {
        let inner = INSTALLED.get_or_init(|| Arc::new(Inner::default()));
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGHUP, Signal::SIGTERM, Signal::SIGINT] {
            // SAFETY: the handler only touches atomics
            unsafe { sigaction(sig, &action) }?;
        }
        Ok(Self {
            inner: Arc::clone(inner),
        })
    }

    pub fn request_reload(&self) {
        self.inner.reload.store(true, Ordering::SeqCst);
    }

    /// Whether a reload was requested since the last call.
    pub fn take_reload(&self) -> bool {
        self.inner.reload.swap(false, Ordering::SeqCst)
    }

    /// Trigger shutdown. Subsequent calls are no-ops.
    pub fn trigger_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    let Some(inner) = INSTALLED.get() else {
        return;
    };
    if sig == libc::SIGHUP {
        inner.reload.store(true, Ordering::SeqCst);
    } else {
        inner.shutdown.store(true, Ordering::SeqCst);
    }
}
