#![doc = include_str!("../README.md")]
#![allow(unsafe_code)]

pub mod cbor;
pub mod checksum;
pub mod error;
pub mod mem;
pub mod mqtt;
pub mod stream;

mod runtime;

// Re-export the error channel at crate root; every layer touches it.
pub use error::{OK, OP_ERR, last_error, raise_error, reset_error};
