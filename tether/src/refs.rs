//! Reference classes for binding records.
//!
//! Records attached to native resources hold host objects in exactly one
//! of three ways, and the distinction is load-bearing:
//!
//! - **strong** (`Arc<T>`): terminal callbacks and bracketing
//!   dependencies; released only when the resource reaches its terminal
//!   state. Releasing early is a bug.
//! - **pending** ([`PendingCallback`]): strong from submission until its
//!   single dispatch, then released.
//! - **observed** ([`Observed`]): the user's wrapper object, reached from
//!   callbacks without keeping it alive; a dead observer short-circuits
//!   the callback.
//!
//! A record must never hold a strong reference to an object that itself
//! strongly holds the record's capsule — such cycles are broken by
//! holding the wrapper as [`Observed`].

use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Weak observer of a host object.
pub struct Observed<T: ?Sized> {
    target: Weak<T>,
}

impl<T: ?Sized> std::fmt::Debug for Observed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observed")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl<T: ?Sized> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
        }
    }
}

impl<T: ?Sized> Observed<T> {
    /// Observe `target` without keeping it alive.
    #[must_use]
    pub fn new(target: &Arc<T>) -> Self {
        Self {
            target: Arc::downgrade(target),
        }
    }

    /// An observer that was never attached; upgrades always fail.
    #[must_use]
    pub fn detached() -> Self
    where
        T: Sized,
    {
        Self { target: Weak::new() }
    }

    /// Run `f` against the target if it is still alive. Returns `None`
    /// (and runs nothing) if the target has been collected.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.target.upgrade().map(|strong| f(&strong))
    }

    /// Whether the target is still alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

/// A strong, one-shot callable reference.
///
/// The callable is held strongly from submission until its single
/// dispatch, then dropped immediately — whether dispatched or cancelled.
pub struct PendingCallback<A> {
    slot: Mutex<Option<Box<dyn FnOnce(A) + Send>>>,
}

impl<A> std::fmt::Debug for PendingCallback<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallback")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl<A> PendingCallback<A> {
    /// An empty slot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Hold `f` until dispatch.
    #[must_use]
    pub fn new(f: impl FnOnce(A) + Send + 'static) -> Self {
        Self {
            slot: Mutex::new(Some(Box::new(f))),
        }
    }

    /// Arm the slot with `f`, dropping any previous callable undispatched.
    pub fn arm(&self, f: impl FnOnce(A) + Send + 'static) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    /// Dispatch with `args` if still armed. Returns whether a callable ran.
    pub fn complete(&self, args: A) -> bool {
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(f) => {
                f(args);
                true
            }
            None => false,
        }
    }

    /// Drop the callable without dispatching. Returns whether one was held.
    pub fn cancel(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether a callable is still waiting to be dispatched.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// One-shot record for an in-flight operation: the completion callable
/// plus every buffer the operation needs until it completes.
///
/// Buffers are heap-pinned (`Box<[u8]>`), so the pointers handed to
/// native code stay stable while further buffers are added. The whole
/// token — callable and buffers — is destroyed in the completion handler.
pub struct CompletionToken<A> {
    callback: Option<Box<dyn FnOnce(A) + Send>>,
    buffers: Vec<Box<[u8]>>,
    kind: Option<&'static str>,
}

impl<A> std::fmt::Debug for CompletionToken<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionToken")
            .field("kind", &self.kind)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl<A> CompletionToken<A> {
    /// Token for an operation of `kind` completing into `f`.
    #[must_use]
    pub fn new(kind: Option<&'static str>, f: impl FnOnce(A) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(f)),
            buffers: Vec::new(),
            kind,
        }
    }

    /// Take ownership of `bytes` for the lifetime of the operation and
    /// return a stable `(ptr, len)` view for native submission.
    pub fn hold(&mut self, bytes: Vec<u8>) -> (*const u8, usize) {
        let boxed = bytes.into_boxed_slice();
        let view = (boxed.as_ptr(), boxed.len());
        self.buffers.push(boxed);
        view
    }

    /// The operation kind, if one was recorded.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        self.kind
    }

    /// Dispatch the callable and drop the held buffers.
    pub fn complete(mut self, args: A) {
        if let Some(f) = self.callback.take() {
            f(args);
        }
        // Buffers die with the token, after the callable has run.
    }
}
