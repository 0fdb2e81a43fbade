//! Error bridge between the native error-code namespace and typed host
//! errors.
//!
//! Native → host: [`last_native_error`] reads the thread-local code and
//! wraps it with its registered name and message; the code number stays
//! the canonical identity — there are no per-subsystem error types.
//! Host → native: [`translate_to_native`] maps host error kinds onto the
//! fixed code table; anything unmapped becomes `ERROR_UNKNOWN` and is
//! logged. The reverse view is [`host_kind_for`].

use tether_core::error as native;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Native code reserved for "the host-side callback failed".
///
/// Native setup paths that observe this code abort the attempt they are
/// in rather than continuing with a half-configured resource.
pub const ERROR_CALLBACK_EXCEPTION: i32 = native::USER_ERROR_BASE + 1;

/// Register the binding's own codes with the native error subsystem.
/// Idempotent; every [`HostRuntime`](crate::lock::HostRuntime) calls it.
pub(crate) fn register_binding_errors() {
    native::register(
        ERROR_CALLBACK_EXCEPTION,
        "ERROR_CALLBACK_EXCEPTION",
        "a host-side callback raised an error",
    );
}

/// Top-level error type for the binding runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error reported by the native layer. The code is canonical; name
    /// and message are carried for rendering only.
    #[error("{name} ({code}): {message}")]
    Native {
        /// Native error code.
        code: i32,
        /// Symbolic name registered for the code.
        name: String,
        /// Human-readable message registered for the code.
        message: String,
    },

    /// A host object carries no native binding.
    #[error("object of type {0} has no native binding")]
    NotBound(&'static str),

    /// A capsule was presented to the wrong resource family.
    #[error("expected capsule tagged {expected:?}, found {found:?}")]
    TagMismatch {
        /// Tag the caller required.
        expected: &'static str,
        /// Tag the capsule actually carries.
        found: &'static str,
    },

    /// A capsule's native pointer has already been consumed.
    #[error("native pointer in {0:?} capsule is null")]
    NullNative(&'static str),

    /// A native call unexpectedly produced a null pointer.
    #[error("unexpected null pointer from native call")]
    NullPointer,

    /// The host runtime has been torn down; handles are inert.
    #[error("host runtime has been torn down")]
    HostDown,

    /// An argument passed to the binding was invalid.
    #[error("{0}")]
    InvalidArgument(String),

    /// An index was out of range.
    #[error("index out of range: {0}")]
    InvalidIndex(usize),

    /// Memory could not be obtained.
    #[error("out of memory")]
    Oom,

    /// The operation is not implemented for this resource.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// An arithmetic or length computation overflowed.
    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    /// A file path did not resolve.
    #[error("invalid file path: {0}")]
    InvalidFilePath(String),

    /// A read had no bytes available; retry later.
    #[error("read would block")]
    WouldBlock,

    /// The peer or source went away mid-operation.
    #[error("broken pipe")]
    BrokenPipe,

    /// A user-supplied callback failed; carried to the unraisable sink.
    #[error("callback raised: {0}")]
    Callback(String),
}

impl Error {
    /// Build the host error for a native `code`.
    #[must_use]
    pub fn from_native(code: i32) -> Self {
        Self::Native {
            code,
            name: native::error_name(code),
            message: native::error_message(code),
        }
    }

    /// The native code this error carries, if it originated natively.
    #[must_use]
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Self::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Read the thread-local native error and wrap it.
#[must_use]
pub fn last_native_error() -> Error {
    let code = native::last_error();
    if code == native::OK {
        // A failure was reported without a code; keep it identifiable.
        return Error::from_native(native::ERROR_UNKNOWN);
    }
    Error::from_native(code)
}

/// Check a native return code. `0` = success.
#[inline]
pub fn check(rc: i32) -> Result<()> {
    if rc == native::OK {
        Ok(())
    } else {
        Err(last_native_error())
    }
}

/// Map a host error onto the native code namespace.
///
/// Unmapped errors become `ERROR_UNKNOWN` and the error is logged, since
/// the native side has no richer channel to carry it.
#[must_use]
pub fn translate_to_native(err: &Error) -> i32 {
    match err {
        Error::Native { code, .. } => *code,
        Error::InvalidIndex(_) => native::ERROR_INVALID_INDEX,
        Error::Oom => native::ERROR_OOM,
        Error::Unimplemented(_) => native::ERROR_UNIMPLEMENTED,
        Error::Overflow(_) => native::ERROR_OVERFLOW,
        Error::InvalidArgument(_) | Error::TagMismatch { .. } | Error::NotBound(_) => {
            native::ERROR_INVALID_ARGUMENT
        }
        Error::InvalidFilePath(_) => native::ERROR_INVALID_FILE_PATH,
        Error::WouldBlock => native::ERROR_READ_WOULD_BLOCK,
        Error::BrokenPipe => native::ERROR_BROKEN_PIPE,
        Error::Callback(_) => ERROR_CALLBACK_EXCEPTION,
        Error::NullNative(_) | Error::NullPointer | Error::HostDown => {
            tracing::error!(error = %err, "unmapped host error crossing into native code");
            native::ERROR_UNKNOWN
        }
    }
}

/// Host error kinds, as seen from the native side of the bridge.
///
/// This is the reverse of [`translate_to_native`]: native layers use it to
/// ask what host error family a code corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// Out-of-range index.
    InvalidIndex,
    /// Out of memory.
    Oom,
    /// Not implemented.
    Unimplemented,
    /// Arithmetic overflow.
    Overflow,
    /// Type or value error.
    InvalidArgument,
    /// Missing file path.
    InvalidFilePath,
    /// Read would block.
    WouldBlock,
    /// Broken pipe.
    BrokenPipe,
    /// A host callback raised.
    Callback,
    /// No specific host kind.
    Unknown,
}

/// The host error kind a native code maps back to.
#[must_use]
pub fn host_kind_for(code: i32) -> HostErrorKind {
    match code {
        native::ERROR_INVALID_INDEX => HostErrorKind::InvalidIndex,
        native::ERROR_OOM => HostErrorKind::Oom,
        native::ERROR_UNIMPLEMENTED => HostErrorKind::Unimplemented,
        native::ERROR_OVERFLOW => HostErrorKind::Overflow,
        native::ERROR_INVALID_ARGUMENT => HostErrorKind::InvalidArgument,
        native::ERROR_INVALID_FILE_PATH => HostErrorKind::InvalidFilePath,
        native::ERROR_READ_WOULD_BLOCK => HostErrorKind::WouldBlock,
        native::ERROR_BROKEN_PIPE => HostErrorKind::BrokenPipe,
        c if c == ERROR_CALLBACK_EXCEPTION => HostErrorKind::Callback,
        _ => HostErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_carries_code_name_message() {
        register_binding_errors();
        tether_core::raise_error(native::ERROR_BROKEN_PIPE);
        let err = last_native_error();
        match &err {
            Error::Native {
                code,
                name,
                message,
            } => {
                assert_eq!(*code, native::ERROR_BROKEN_PIPE);
                assert_eq!(name, "ERROR_BROKEN_PIPE");
                assert_eq!(message, "broken pipe");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        tether_core::reset_error();
    }

    #[test]
    fn translation_table_round_trips() {
        let cases: &[(Error, i32, HostErrorKind)] = &[
            (
                Error::InvalidIndex(9),
                native::ERROR_INVALID_INDEX,
                HostErrorKind::InvalidIndex,
            ),
            (Error::Oom, native::ERROR_OOM, HostErrorKind::Oom),
            (
                Error::Unimplemented("x"),
                native::ERROR_UNIMPLEMENTED,
                HostErrorKind::Unimplemented,
            ),
            (
                Error::Overflow("y"),
                native::ERROR_OVERFLOW,
                HostErrorKind::Overflow,
            ),
            (
                Error::InvalidArgument("z".into()),
                native::ERROR_INVALID_ARGUMENT,
                HostErrorKind::InvalidArgument,
            ),
            (
                Error::InvalidFilePath("/nope".into()),
                native::ERROR_INVALID_FILE_PATH,
                HostErrorKind::InvalidFilePath,
            ),
            (
                Error::WouldBlock,
                native::ERROR_READ_WOULD_BLOCK,
                HostErrorKind::WouldBlock,
            ),
            (
                Error::BrokenPipe,
                native::ERROR_BROKEN_PIPE,
                HostErrorKind::BrokenPipe,
            ),
        ];
        for (err, code, kind) in cases {
            assert_eq!(translate_to_native(err), *code, "{err:?}");
            assert_eq!(host_kind_for(*code), *kind, "{code}");
        }
    }

    #[test]
    fn unmapped_errors_become_unknown() {
        assert_eq!(
            translate_to_native(&Error::HostDown),
            native::ERROR_UNKNOWN
        );
        assert_eq!(host_kind_for(999_999), HostErrorKind::Unknown);
    }

    #[test]
    fn callback_exception_code_is_registered() {
        register_binding_errors();
        assert_eq!(
            native::error_name(ERROR_CALLBACK_EXCEPTION),
            "ERROR_CALLBACK_EXCEPTION"
        );
        assert_eq!(
            translate_to_native(&Error::Callback("boom".into())),
            ERROR_CALLBACK_EXCEPTION
        );
        assert_eq!(
            host_kind_for(ERROR_CALLBACK_EXCEPTION),
            HostErrorKind::Callback
        );
    }

    #[test]
    fn check_maps_zero_to_ok() {
        assert!(check(0).is_ok());
        tether_core::raise_error(native::ERROR_OOM);
        let err = check(-1).expect_err("nonzero rc");
        assert_eq!(err.native_code(), Some(native::ERROR_OOM));
        tether_core::reset_error();
    }
}
