//! Error-code subsystem: a process-wide code table plus a thread-local
//! "last error" channel, mirroring how C libraries report failure out of
//! band from their return codes.
//!
//! Codes below [`USER_ERROR_BASE`] belong to this crate. Higher layers
//! register their own codes with [`register`]; the table keeps name and
//! message strings so callers can render an error from its number alone.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Success return code.
pub const OK: i32 = 0;
/// Generic failure return code for `extern "C"` entry points.
pub const OP_ERR: i32 = -1;

/// Unclassified failure.
pub const ERROR_UNKNOWN: i32 = 1;
/// Allocation failed.
pub const ERROR_OOM: i32 = 2;
/// An argument was missing, null, or malformed.
pub const ERROR_INVALID_ARGUMENT: i32 = 3;
/// An index was outside the valid range.
pub const ERROR_INVALID_INDEX: i32 = 4;
/// An arithmetic or length computation overflowed.
pub const ERROR_OVERFLOW: i32 = 5;
/// The requested operation is not implemented by this resource.
pub const ERROR_UNIMPLEMENTED: i32 = 6;
/// A file path did not resolve.
pub const ERROR_INVALID_FILE_PATH: i32 = 7;
/// A read would block; retry later.
pub const ERROR_READ_WOULD_BLOCK: i32 = 8;
/// The peer or source went away mid-operation.
pub const ERROR_BROKEN_PIPE: i32 = 9;
/// Connection establishment failed.
pub const ERROR_CONNECTION_FAILED: i32 = 10;
/// The resource was closed while the operation was in flight.
pub const ERROR_OPERATION_INTERRUPTED: i32 = 11;
/// The operation requires a connected resource.
pub const ERROR_NOT_CONNECTED: i32 = 12;
/// CBOR input was truncated or structurally malformed.
pub const ERROR_CBOR_MALFORMED: i32 = 13;
/// CBOR input used an item kind this codec does not support.
pub const ERROR_CBOR_UNSUPPORTED: i32 = 14;
/// The stream does not support seeking.
pub const ERROR_STREAM_UNSEEKABLE: i32 = 15;

/// First code available to layers built on top of this crate.
pub const USER_ERROR_BASE: i32 = 1000;

struct ErrorInfo {
    name: &'static str,
    message: &'static str,
}

const CORE_ERRORS: &[(i32, ErrorInfo)] = &[
    (
        ERROR_UNKNOWN,
        ErrorInfo {
            name: "ERROR_UNKNOWN",
            message: "unknown error",
        },
    ),
    (
        ERROR_OOM,
        ErrorInfo {
            name: "ERROR_OOM",
            message: "out of memory",
        },
    ),
    (
        ERROR_INVALID_ARGUMENT,
        ErrorInfo {
            name: "ERROR_INVALID_ARGUMENT",
            message: "invalid argument",
        },
    ),
    (
        ERROR_INVALID_INDEX,
        ErrorInfo {
            name: "ERROR_INVALID_INDEX",
            message: "index out of range",
        },
    ),
    (
        ERROR_OVERFLOW,
        ErrorInfo {
            name: "ERROR_OVERFLOW",
            message: "arithmetic overflow",
        },
    ),
    (
        ERROR_UNIMPLEMENTED,
        ErrorInfo {
            name: "ERROR_UNIMPLEMENTED",
            message: "operation not implemented",
        },
    ),
    (
        ERROR_INVALID_FILE_PATH,
        ErrorInfo {
            name: "ERROR_INVALID_FILE_PATH",
            message: "invalid file path",
        },
    ),
    (
        ERROR_READ_WOULD_BLOCK,
        ErrorInfo {
            name: "ERROR_READ_WOULD_BLOCK",
            message: "read would block",
        },
    ),
    (
        ERROR_BROKEN_PIPE,
        ErrorInfo {
            name: "ERROR_BROKEN_PIPE",
            message: "broken pipe",
        },
    ),
    (
        ERROR_CONNECTION_FAILED,
        ErrorInfo {
            name: "ERROR_CONNECTION_FAILED",
            message: "connection establishment failed",
        },
    ),
    (
        ERROR_OPERATION_INTERRUPTED,
        ErrorInfo {
            name: "ERROR_OPERATION_INTERRUPTED",
            message: "operation interrupted by resource shutdown",
        },
    ),
    (
        ERROR_NOT_CONNECTED,
        ErrorInfo {
            name: "ERROR_NOT_CONNECTED",
            message: "resource is not connected",
        },
    ),
    (
        ERROR_CBOR_MALFORMED,
        ErrorInfo {
            name: "ERROR_CBOR_MALFORMED",
            message: "malformed or truncated CBOR input",
        },
    ),
    (
        ERROR_CBOR_UNSUPPORTED,
        ErrorInfo {
            name: "ERROR_CBOR_UNSUPPORTED",
            message: "unsupported CBOR item kind",
        },
    ),
    (
        ERROR_STREAM_UNSEEKABLE,
        ErrorInfo {
            name: "ERROR_STREAM_UNSEEKABLE",
            message: "stream does not support seeking",
        },
    ),
];

fn registered() -> &'static RwLock<HashMap<i32, (String, String)>> {
    static TABLE: OnceLock<RwLock<HashMap<i32, (String, String)>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an error code owned by a higher layer.
///
/// Codes must be `>=` [`USER_ERROR_BASE`]; re-registering the same code is
/// a no-op so init paths may race freely.
pub fn register(code: i32, name: &str, message: &str) {
    if code < USER_ERROR_BASE {
        return;
    }
    let mut table = registered()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    table
        .entry(code)
        .or_insert_with(|| (name.to_owned(), message.to_owned()));
}

fn core_info(code: i32) -> Option<&'static ErrorInfo> {
    CORE_ERRORS.iter().find(|(c, _)| *c == code).map(|(_, i)| i)
}

/// Symbolic name for an error code.
pub fn error_name(code: i32) -> String {
    if let Some(info) = core_info(code) {
        return info.name.to_owned();
    }
    let table = registered()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    table
        .get(&code)
        .map_or_else(|| "ERROR_UNKNOWN".to_owned(), |(n, _)| n.clone())
}

/// Human-readable message for an error code.
pub fn error_message(code: i32) -> String {
    if let Some(info) = core_info(code) {
        return info.message.to_owned();
    }
    let table = registered()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    table
        .get(&code)
        .map_or_else(|| "unknown error".to_owned(), |(_, m)| m.clone())
}

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(OK) };
}

/// Record `code` as this thread's last error and return [`OP_ERR`].
///
/// The return value lets `extern "C"` entry points end with
/// `return raise_error(code);`.
pub fn raise_error(code: i32) -> i32 {
    LAST_ERROR.with(|e| e.set(code));
    OP_ERR
}

/// This thread's last error code. [`OK`] if none was raised.
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

/// Clear this thread's last error.
pub fn reset_error() {
    LAST_ERROR.with(|e| e.set(OK));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_codes_have_names_and_messages() {
        assert_eq!(error_name(ERROR_OOM), "ERROR_OOM");
        assert_eq!(error_message(ERROR_READ_WOULD_BLOCK), "read would block");
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(error_name(987_654), "ERROR_UNKNOWN");
    }

    #[test]
    fn registration_is_first_write_wins() {
        register(USER_ERROR_BASE + 7, "ERROR_SEVEN", "seven");
        register(USER_ERROR_BASE + 7, "ERROR_OTHER", "other");
        assert_eq!(error_name(USER_ERROR_BASE + 7), "ERROR_SEVEN");
        assert_eq!(error_message(USER_ERROR_BASE + 7), "seven");
    }

    #[test]
    fn registration_below_base_is_ignored() {
        register(ERROR_OOM, "ERROR_HIJACK", "hijack");
        assert_eq!(error_name(ERROR_OOM), "ERROR_OOM");
    }

    #[test]
    fn last_error_is_thread_local() {
        assert_eq!(raise_error(ERROR_BROKEN_PIPE), OP_ERR);
        assert_eq!(last_error(), ERROR_BROKEN_PIPE);
        std::thread::spawn(|| assert_eq!(last_error(), OK))
            .join()
            .expect("thread");
        reset_error();
        assert_eq!(last_error(), OK);
    }
}
