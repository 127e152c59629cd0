//! ---
//! oa_section: "07-resilience-fault-tolerance"
//! oa_subsection: "module"
//! oa_type: "source"
//! oa_scope: "code"
//! oa_description: "Dual-controller discovery, role tracking and failover."
//! oa_version: "v0.0.0-prealpha"
//! oa_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cooperative cancellation flag shared by the coordinator and its monitors.
///
/// Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Returns `true` for the first call only.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless cancelled first. Returns whether the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}

/// Outcome of the shutdown sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Bays whose monitor thread exited normally.
    pub joined: Vec<u8>,
    /// Bays whose monitor thread panicked.
    pub panicked: Vec<u8>,
    /// Session handles closed during teardown.
    pub sessions_closed: usize,
    /// Locks that could not be acquired after teardown.
    pub lock_defects: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.lock_defects.is_empty()
    }
}
