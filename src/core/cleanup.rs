//! Operator-interrupt plumbing and the registry of live slave emulators.
//!
//! The normal and the abort path share one cleanup routine inside the
//! rotation engine: an interrupt only flips the [`AbortSignal`], and the
//! engine notices it between (and during) master operations, stops issuing
//! requests and terminates its slaves the same way it would on a normal
//! return. [`SlaveRegistry`] is the last resort for a second interrupt, when
//! the operator no longer wants to wait for an orderly shutdown.

use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// Cloneable, level-triggered abort flag.
#[derive(Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`AbortSignal::trigger`] has been called, immediately if
    /// it already was.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let waited = rx.wait_for(|aborted| *aborted).await.map(|_| ());
        if waited.is_err() {
            // Sender lives as long as `self`, so this cannot happen; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Process ids of every slave emulator currently alive, keyed to their port.
#[derive(Clone, Default)]
pub struct SlaveRegistry {
    live: Arc<Mutex<BTreeMap<u32, String>>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, pid: u32, port: &str) {
        self.live.lock().insert(pid, port.to_string());
    }

    pub fn untrack(&self, pid: u32) {
        self.live.lock().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Kill every tracked emulator without waiting for it. Used only when the
    /// process is about to exit and cannot wait for the engine's own cleanup.
    pub fn kill_all(&self) {
        let live = std::mem::take(&mut *self.live.lock());
        for (pid, port) in live {
            log::warn!("Force-killing slave emulator on {port} (pid {pid})");
            force_kill(pid);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn force_kill(pid: u32) {
            // SAFETY: kill(2) has no memory-safety preconditions.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } != 0 {
                log::warn!(
                    "kill({pid}, SIGKILL) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    } else {
        fn force_kill(pid: u32) {
            log::warn!("Cannot force-kill pid {pid} on this platform");
        }
    }
}
