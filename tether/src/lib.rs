#![doc = include_str!("../README.md")]
#![allow(unsafe_code)]

pub mod capsule;
pub mod cbor;
pub mod checksum;
pub mod env;
pub mod error;
pub mod handshake;
pub mod headers;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod mqtt5;
pub mod refs;
pub mod stream;

// Re-export the core public API at crate root.
pub use capsule::{Bound, Capsule, native_of};
pub use error::{ERROR_CALLBACK_EXCEPTION, Error, Result, check, last_native_error};
pub use headers::{Body, Headers, Request, Response};
pub use lifecycle::{Gate, GateArm, SharedState};
pub use lock::{HostGuard, HostRuntime, SUSPEND_THRESHOLD};
pub use mqtt5::{Mqtt5Client, Mqtt5Events, Mqtt5Options, PublishReceived, Qos};
pub use refs::{CompletionToken, Observed, PendingCallback};
pub use stream::{
    BufferSource, ByteSource, FileSource, INPUT_STREAM_TAG, MeteredSource, SeekBasis,
    StreamAdapter,
};

// Re-export standalone initializers.
pub use env::{init_from_env, install_crash_handler};
pub use logging::init as init_logging;
