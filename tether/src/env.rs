#![allow(unsafe_code)]
//! Start-up environment configuration.
//!
//! Two variables are consulted once at process start:
//!
//! - `TETHER_MEM_TRACE` — `none`, `bytes`, or `stacks`; anything else
//!   (or absence) selects `none`.
//! - `TETHER_CRASH_HANDLER` — a truthy value (`1`, `true`, `on`, `yes`)
//!   installs a fatal-signal handler that prints a backtrace to stderr.

use std::sync::OnceLock;

use tether_core::mem::TraceLevel;

/// Memory-trace level variable.
pub const MEM_TRACE_VAR: &str = "TETHER_MEM_TRACE";
/// Crash-handler toggle variable.
pub const CRASH_HANDLER_VAR: &str = "TETHER_CRASH_HANDLER";

/// Parse a `TETHER_MEM_TRACE` value. Unknown values select `None`.
#[must_use]
pub fn parse_trace_level(value: Option<&str>) -> TraceLevel {
    match value.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("bytes") => TraceLevel::Bytes,
        Some(v) if v.eq_ignore_ascii_case("stacks") => TraceLevel::Stacks,
        _ => TraceLevel::None,
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Read the environment and apply start-up configuration. Idempotent.
pub fn init_from_env() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let level = parse_trace_level(std::env::var(MEM_TRACE_VAR).ok().as_deref());
        tether_core::mem::init(level);
        if std::env::var(CRASH_HANDLER_VAR).is_ok_and(|v| truthy(&v)) {
            install_crash_handler();
        }
    });
}

/// Install a handler for SIGSEGV/SIGABRT/SIGILL/SIGBUS that prints a
/// backtrace to stderr before the process dies. Idempotent.
pub fn install_crash_handler() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        imp::install();
    });
}

#[cfg(unix)]
mod imp {
    use std::io::Write;

    const FATAL_SIGNALS: &[i32] = &[libc::SIGSEGV, libc::SIGABRT, libc::SIGILL, libc::SIGBUS];

    extern "C" fn on_fatal_signal(signal: i32) {
        // The process is already doomed; best-effort diagnostics only.
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "fatal signal {signal}, backtrace follows:");
        let _ = writeln!(stderr, "{}", std::backtrace::Backtrace::force_capture());
        let _ = stderr.flush();
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            libc::raise(signal);
        }
    }

    pub(super) fn install() {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_fatal_signal as usize;
            libc::sigemptyset(&raw mut action.sa_mask);
            for &signal in FATAL_SIGNALS {
                libc::sigaction(signal, &raw const action, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) fn install() {
        // Non-POSIX targets rely on the platform's unhandled-exception
        // reporting.
    }
}
