#![allow(unsafe_code)]
//! Release/shutdown coordination for resources whose destruction is not
//! instantaneous.
//!
//! Two independent terminal events must both occur before a binding
//! record can be freed: the host-side handle destructor runs, and the
//! native shutdown callback fires. They happen on different threads in
//! either order. Each event arms its own bit of a [`Gate`] with a single
//! atomic RMW; whichever arrival observes the other bit already set is
//! the last one and performs the free. The record is freed exactly once,
//! lock-free.
//!
//! A record is shared between those two holders as a raw
//! `*mut SharedState<B>`: one copy lives in the capsule destructor, the
//! other rides as the native callback's user data. [`arm_release`] /
//! [`arm_shutdown`] reconstitute and return the owning box on the last
//! arrival so the caller can drop it outside any lock.

use std::sync::atomic::{AtomicU8, Ordering};

const RELEASED: u8 = 0b01;
const SHUTDOWN: u8 = 0b10;

/// Which arrival a gate arm was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateArm {
    /// The other terminal event has not happened yet.
    Pending,
    /// Both terminal events have now happened; the caller must free.
    Last,
}

/// Two-event free gate.
#[derive(Debug, Default)]
pub struct Gate(AtomicU8);

impl Gate {
    /// A gate with neither event armed.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Record that the handle destructor has run.
    pub fn release(&self) -> GateArm {
        let prev = self.0.fetch_or(RELEASED, Ordering::AcqRel);
        debug_assert_eq!(prev & RELEASED, 0, "release armed twice");
        if prev & SHUTDOWN != 0 {
            GateArm::Last
        } else {
            GateArm::Pending
        }
    }

    /// Record that the native shutdown callback has fired.
    pub fn shutdown(&self) -> GateArm {
        let prev = self.0.fetch_or(SHUTDOWN, Ordering::AcqRel);
        debug_assert_eq!(prev & SHUTDOWN, 0, "shutdown armed twice");
        if prev & RELEASED != 0 {
            GateArm::Last
        } else {
            GateArm::Pending
        }
    }

    /// Whether both events have occurred.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.0.load(Ordering::Acquire) == RELEASED | SHUTDOWN
    }
}

/// A heap record shared between the handle destructor and the native
/// shutdown callback.
#[derive(Debug)]
pub struct SharedState<B> {
    /// The free gate.
    pub gate: Gate,
    /// Subsystem-specific record body.
    pub body: B,
}

impl<B> SharedState<B> {
    /// Allocate the shared record and leak it to a raw pointer. The two
    /// terminal events jointly own it from here on.
    #[must_use]
    pub fn into_shared(body: B) -> *mut Self {
        Box::into_raw(Box::new(Self {
            gate: Gate::new(),
            body,
        }))
    }
}

/// Arm the release side of `raw`'s gate. Returns the owning box if this
/// was the last arrival; dropping it frees the record.
///
/// # Safety
/// `raw` must come from [`SharedState::into_shared`] and the release side
/// must not have been armed before.
pub unsafe fn arm_release<B>(raw: *mut SharedState<B>) -> Option<Box<SharedState<B>>> {
    match unsafe { &*raw }.gate.release() {
        GateArm::Last => Some(unsafe { Box::from_raw(raw) }),
        GateArm::Pending => None,
    }
}

/// Arm the shutdown side of `raw`'s gate. Returns the owning box if this
/// was the last arrival.
///
/// # Safety
/// `raw` must come from [`SharedState::into_shared`] and the shutdown
/// side must not have been armed before.
pub unsafe fn arm_shutdown<B>(raw: *mut SharedState<B>) -> Option<Box<SharedState<B>>> {
    match unsafe { &*raw }.gate.shutdown() {
        GateArm::Last => Some(unsafe { Box::from_raw(raw) }),
        GateArm::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_arrival_is_last_in_both_orders() {
        let gate = Gate::new();
        assert_eq!(gate.release(), GateArm::Pending);
        assert_eq!(gate.shutdown(), GateArm::Last);
        assert!(gate.is_terminal());

        let gate = Gate::new();
        assert_eq!(gate.shutdown(), GateArm::Pending);
        assert_eq!(gate.release(), GateArm::Last);
    }

    struct CountedBody {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for CountedBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn record_is_freed_exactly_once_under_racing_arrivals() {
        for _ in 0..200 {
            let drops = Arc::new(AtomicUsize::new(0));
            let raw = SharedState::into_shared(CountedBody {
                drops: Arc::clone(&drops),
            });
            let addr = raw as usize;

            let t1 = std::thread::spawn(move || {
                let freed = unsafe { arm_release(addr as *mut SharedState<CountedBody>) };
                freed.is_some()
            });
            let t2 = std::thread::spawn(move || {
                let freed = unsafe { arm_shutdown(addr as *mut SharedState<CountedBody>) };
                freed.is_some()
            });
            let f1 = t1.join().expect("join");
            let f2 = t2.join().expect("join");
            // Exactly one side observed itself last, and the body dropped
            // exactly once.
            assert!(f1 ^ f2);
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
    }
}
