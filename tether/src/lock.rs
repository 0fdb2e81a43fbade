//! Lock broker for the host runtime.
//!
//! The binding imposes no threading model of its own: work is submitted
//! on whatever thread the host chose, and native callbacks arrive on
//! whatever thread the native library chose. What the broker guarantees
//! is the lock discipline around every boundary crossing:
//!
//! - every native→host callback begins with [`HostRuntime::enter`] and
//!   returns silently if the runtime is tearing down;
//! - host→native calls run with the lock held, except the two bulk
//!   checksum/hash operations, which may release it via
//!   [`HostGuard::without_lock`] for inputs over [`SUSPEND_THRESHOLD`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::{self, Error};

/// Inputs larger than this may be processed with the host lock released.
pub const SUSPEND_THRESHOLD: usize = 5 * 1024;

type UnraisableSink = Box<dyn Fn(&Error) + Send + Sync>;

/// The host runtime's shared state: global lock, teardown flag, and the
/// sink for errors raised inside callbacks.
///
/// One of these exists per embedding; resources hold it by [`Arc`] so the
/// runtime out-lives every binding record that may still dispatch into it.
pub struct HostRuntime {
    gil: Mutex<()>,
    teardown: AtomicBool,
    sink: RwLock<Option<UnraisableSink>>,
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

impl HostRuntime {
    /// Create a live host runtime.
    #[must_use]
    pub fn new() -> Arc<Self> {
        error::register_binding_errors();
        Arc::new(Self {
            gil: Mutex::new(()),
            teardown: AtomicBool::new(false),
            sink: RwLock::new(None),
        })
    }

    /// Acquire the global lock.
    ///
    /// Returns `None` once teardown has begun — the caller must then
    /// return without touching host state, without raising, and without
    /// calling back.
    #[must_use]
    pub fn enter(&self) -> Option<HostGuard<'_>> {
        if self.teardown.load(Ordering::Acquire) {
            return None;
        }
        let guard = self.gil.lock().unwrap_or_else(PoisonError::into_inner);
        // Teardown may have begun while this thread was waiting.
        if self.teardown.load(Ordering::Acquire) {
            return None;
        }
        Some(HostGuard {
            runtime: self,
            inner: Some(guard),
        })
    }

    /// Begin teardown. Waits for the current lock holder, then flips the
    /// flag: all later [`enter`](Self::enter) calls return `None` and
    /// every handle becomes inert.
    pub fn begin_teardown(&self) {
        let guard = self.gil.lock().unwrap_or_else(PoisonError::into_inner);
        self.teardown.store(true, Ordering::Release);
        drop(guard);
    }

    /// Whether teardown has begun.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// Replace the unraisable-error sink. `None` restores the default
    /// (log via `tracing`).
    pub fn set_unraisable_sink(&self, sink: Option<UnraisableSink>) {
        *self
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Report an error raised inside a callback. There is no host stack
    /// to propagate on, so the error is handed to the sink and dropped;
    /// the callback then returns normally.
    pub fn unraisable(&self, err: &Error) {
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner);
        match sink.as_ref() {
            Some(f) => f(err),
            None => tracing::error!(error = %err, "error raised inside a native callback"),
        }
    }
}

/// Proof of holding the host runtime's global lock.
#[must_use = "dropping the guard releases the host lock"]
pub struct HostGuard<'rt> {
    runtime: &'rt HostRuntime,
    inner: Option<MutexGuard<'rt, ()>>,
}

impl std::fmt::Debug for HostGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostGuard")
            .field("held", &self.inner.is_some())
            .finish()
    }
}

impl HostGuard<'_> {
    /// Run `f` with the lock released, re-acquiring before returning.
    ///
    /// This is the suspension point for bulk native work; everything else
    /// runs with the lock held.
    pub fn without_lock<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.inner = None;
        let result = f();
        self.inner = Some(
            self.runtime
                .gil
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        result
    }

    /// The runtime this guard belongs to.
    #[must_use]
    pub fn runtime(&self) -> &HostRuntime {
        self.runtime
    }
}
