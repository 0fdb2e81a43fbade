#![allow(unsafe_code)]
//! Native input-stream contract.
//!
//! An [`InputStream`] is a vtable plus an opaque implementation pointer.
//! Producers (the binding layer) allocate the stream and supply the
//! vtable; consumers (engines in this crate) pull bytes through it and
//! balance [`acquire`]/[`release`] around every hop across threads. The
//! final `release` is expected to free the stream.

use std::ffi::c_void;
use std::time::Duration;

use crate::error::{self, ERROR_BROKEN_PIPE, OK};

/// Seek reference point. Forwarded verbatim between producer and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SeekBasis {
    /// Offset from the start of the stream.
    Begin = 0,
    /// Offset from the end of the stream.
    End = 2,
}

impl SeekBasis {
    /// Convert from the wire `i32`. Returns `None` for unknown values.
    #[must_use]
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Begin),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// Destination buffer for [`InputStreamVtable::read`]: `len` is the
/// logical fill level, `capacity` the usable size. Reads append bytes at
/// `len` and advance it.
#[repr(C)]
#[derive(Debug)]
pub struct ByteBuf {
    /// Base pointer of the buffer.
    pub ptr: *mut u8,
    /// Logical length (bytes filled so far).
    pub len: usize,
    /// Total usable capacity.
    pub capacity: usize,
}

/// Stream liveness snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStatus {
    /// The stream has delivered its final byte.
    pub is_end_of_stream: bool,
    /// The stream can still service reads.
    pub is_valid: bool,
}

/// Operations every input stream must provide.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InputStreamVtable {
    /// Reposition the stream. Must clear the end-of-stream flag on success.
    pub seek: unsafe extern "C" fn(stream: *mut InputStream, offset: i64, basis: i32) -> i32,
    /// Append bytes into `dest` (between `len` and `capacity`). Appending
    /// zero bytes with an end-of-stream status signals EOF; appending zero
    /// bytes while still valid means "would block, retry".
    pub read: unsafe extern "C" fn(stream: *mut InputStream, dest: *mut ByteBuf) -> i32,
    /// Report liveness and EOF.
    pub status: unsafe extern "C" fn(stream: *mut InputStream, out: *mut StreamStatus) -> i32,
    /// Total length if known.
    pub length: unsafe extern "C" fn(stream: *mut InputStream, out: *mut i64) -> i32,
    /// Take a reference for another holder/thread.
    pub acquire: unsafe extern "C" fn(stream: *mut InputStream),
    /// Drop a reference. The last release frees the stream.
    pub release: unsafe extern "C" fn(stream: *mut InputStream),
}

/// A native input stream: vtable + opaque implementation state.
#[repr(C)]
#[derive(Debug)]
pub struct InputStream {
    /// Operations table.
    pub vtable: *const InputStreamVtable,
    /// Producer-owned state; opaque to consumers.
    pub impl_ptr: *mut c_void,
}

/// Take a reference on `stream`.
///
/// # Safety
/// `stream` must point at a live [`InputStream`] with a valid vtable.
pub unsafe fn acquire(stream: *mut InputStream) {
    unsafe { ((*(*stream).vtable).acquire)(stream) }
}

/// Drop a reference on `stream`. May free it.
///
/// # Safety
/// `stream` must point at a live [`InputStream`]; the caller must own one
/// reference.
pub unsafe fn release(stream: *mut InputStream) {
    unsafe { ((*(*stream).vtable).release)(stream) }
}

/// Pull `stream` to exhaustion in `chunk_len`-byte reads, returning the
/// total byte count. Would-block reads are retried after a short pause.
///
/// Consumes one reference: the caller's reference is released when the
/// drain finishes, whether it succeeds or fails.
///
/// # Safety
/// `stream` must point at a live [`InputStream`] and the caller must own
/// the reference being consumed.
pub unsafe fn drain(stream: *mut InputStream, chunk_len: usize) -> Result<u64, i32> {
    let result = unsafe { drain_inner(stream, chunk_len) };
    unsafe { release(stream) };
    result
}

unsafe fn drain_inner(stream: *mut InputStream, chunk_len: usize) -> Result<u64, i32> {
    let vtable = unsafe { (*stream).vtable };
    let mut storage = vec![0u8; chunk_len.max(1)];
    let mut total: u64 = 0;
    loop {
        let mut dest = ByteBuf {
            ptr: storage.as_mut_ptr(),
            len: 0,
            capacity: storage.len(),
        };
        let rc = unsafe { ((*vtable).read)(stream, &raw mut dest) };
        if rc != OK {
            return Err(error::last_error());
        }
        total += dest.len as u64;

        let mut status = StreamStatus::default();
        let rc = unsafe { ((*vtable).status)(stream, &raw mut status) };
        if rc != OK {
            return Err(error::last_error());
        }
        if status.is_end_of_stream {
            return Ok(total);
        }
        if !status.is_valid {
            return Err(ERROR_BROKEN_PIPE);
        }
        if dest.len == 0 {
            // Would-block: the producer has nothing yet.
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
