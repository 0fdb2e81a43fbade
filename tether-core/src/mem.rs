//! Allocation metering for native resources.
//!
//! The trace level is fixed once at start-up. At [`TraceLevel::Bytes`] the
//! engines count live resource bytes; at [`TraceLevel::Stacks`] each live
//! resource additionally keeps the backtrace of its allocation site so
//! leaks can be attributed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

/// How much allocation tracking the native layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceLevel {
    /// No tracking.
    #[default]
    None,
    /// Count live bytes and allocations.
    Bytes,
    /// Count live bytes and keep per-allocation backtraces.
    Stacks,
}

static LEVEL: OnceLock<TraceLevel> = OnceLock::new();
static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static LIVE_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

fn stacks() -> &'static Mutex<HashMap<usize, String>> {
    static STACKS: OnceLock<Mutex<HashMap<usize, String>>> = OnceLock::new();
    STACKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fix the trace level. The first call wins; later calls are ignored.
pub fn init(level: TraceLevel) {
    let _ = LEVEL.set(level);
}

/// The active trace level.
pub fn level() -> TraceLevel {
    LEVEL.get().copied().unwrap_or_default()
}

/// Record a native allocation of `bytes` identified by `token`.
pub(crate) fn on_alloc(token: usize, bytes: u64) {
    match level() {
        TraceLevel::None => {}
        TraceLevel::Bytes => {
            LIVE_BYTES.fetch_add(bytes, Ordering::Relaxed);
            LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        TraceLevel::Stacks => {
            LIVE_BYTES.fetch_add(bytes, Ordering::Relaxed);
            LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
            let trace = std::backtrace::Backtrace::force_capture().to_string();
            stacks()
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(token, trace);
        }
    }
}

/// Record the release of an allocation previously reported via [`on_alloc`].
pub(crate) fn on_free(token: usize, bytes: u64) {
    if level() == TraceLevel::None {
        return;
    }
    LIVE_BYTES.fetch_sub(bytes, Ordering::Relaxed);
    LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
    if level() == TraceLevel::Stacks {
        stacks()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }
}

/// Bytes currently attributed to live native resources.
pub fn live_bytes() -> u64 {
    LIVE_BYTES.load(Ordering::Relaxed)
}

/// Count of live native resources.
pub fn live_allocations() -> u64 {
    LIVE_ALLOCATIONS.load(Ordering::Relaxed)
}

/// Backtraces of live allocations, if the level is [`TraceLevel::Stacks`].
pub fn live_stacks() -> Vec<String> {
    stacks()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect()
}
