//! Shared tokio runtime that stands in for the native libraries' own
//! thread pools. Every asynchronous callback in this crate is delivered
//! from one of its worker threads, never from the submitting thread.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Get or initialize the global runtime.
pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to create tokio runtime"))
}

/// Run `f` on a worker thread after `delay`.
pub(crate) fn spawn_after(delay: Duration, f: impl FnOnce() + Send + 'static) {
    runtime().spawn(async move {
        tokio::time::sleep(delay).await;
        f();
    });
}

/// Run `f` on a worker thread as soon as one is free.
pub(crate) fn spawn(f: impl FnOnce() + Send + 'static) {
    runtime().spawn(async move { f() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn callbacks_arrive_on_a_foreign_thread() {
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        spawn(move || {
            let _ = tx.send(std::thread::current().id());
        });
        let callee = rx.recv_timeout(Duration::from_secs(5)).expect("spawned");
        assert_ne!(caller, callee);
    }
}
