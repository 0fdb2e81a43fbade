#![allow(unsafe_code)]
//! Host byte sources exposed as native input streams.
//!
//! A [`StreamAdapter`] owns the native-facing state: the vtable
//! [`InputStream`](tether_core::stream::InputStream) header, an atomic
//! native refcount, and the end-of-stream flag. The host object behind it
//! is held strongly only while the native refcount is above zero — the
//! strong reference is taken on the 0→1 transition and dropped on 1→0,
//! so native code can pass the stream between threads without touching
//! the host reference on every hop.
//!
//! [`MeteredSource`] wraps another source and reports bytes transferred,
//! coalescing reports into a one-second window.

use std::ffi::c_void;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tether_core::error::{
    ERROR_BROKEN_PIPE, ERROR_INVALID_ARGUMENT, OK, raise_error,
};
use tether_core::stream::{ByteBuf, InputStream, InputStreamVtable, StreamStatus};

use crate::error::{Error, Result, translate_to_native};
use crate::lock::HostRuntime;

pub use tether_core::stream::SeekBasis;

/// Capsule tag for stream adapters.
pub const INPUT_STREAM_TAG: &str = "InputStream";

/// Reports are coalesced into windows of this length.
pub const REPORT_WINDOW: Duration = Duration::from_secs(1);

/// A host-side readable byte source.
pub trait ByteSource: Send {
    /// Read bytes into `dest`, returning how many were written.
    ///
    /// `Ok(None)` means "would block": nothing was written and the caller
    /// should retry. `Ok(Some(0))` means end of stream.
    fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>>;

    /// Reposition the source.
    fn seek(&mut self, offset: i64, basis: SeekBasis) -> Result<()> {
        let _ = (offset, basis);
        Err(Error::Unimplemented("seek"))
    }

    /// Total length in bytes, if known.
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Native-facing adapter
// ---------------------------------------------------------------------------

/// Shared source handle: host object observed weakly, held strongly only
/// while native references exist.
type SharedSource = Arc<Mutex<dyn ByteSource>>;

#[repr(C)]
struct AdapterCore {
    // Must stay the first field: `*mut InputStream` and `*mut AdapterCore`
    // are the same address.
    native: InputStream,
    refcount: AtomicUsize,
    eof: AtomicBool,
    host: Arc<HostRuntime>,
    source_weak: Weak<Mutex<dyn ByteSource>>,
    source_strong: Mutex<Option<SharedSource>>,
}

static VTABLE: InputStreamVtable = InputStreamVtable {
    seek: adapter_seek,
    read: adapter_read,
    status: adapter_status,
    length: adapter_length,
    acquire: adapter_acquire,
    release: adapter_release,
};

/// One native reference to an adapted host byte source.
///
/// Creating the adapter is the 0→1 refcount transition: the host object
/// is strongly referenced from that point until the final native release.
/// Dropping this value releases the reference it represents;
/// [`into_raw`](Self::into_raw) instead transfers it to native code.
pub struct StreamAdapter {
    raw: *mut InputStream,
}

impl std::fmt::Debug for StreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAdapter")
            .field("eof", &self.is_eof())
            .finish()
    }
}

// The adapter is handed across threads by design; interior state is
// atomic or mutex-guarded.
unsafe impl Send for StreamAdapter {}

impl StreamAdapter {
    /// Adapt `source` for native consumption.
    pub fn new(host: &Arc<HostRuntime>, source: &SharedSource) -> Self {
        let core = Box::into_raw(Box::new(AdapterCore {
            native: InputStream {
                vtable: &VTABLE,
                impl_ptr: std::ptr::null_mut(),
            },
            refcount: AtomicUsize::new(1),
            eof: AtomicBool::new(false),
            host: Arc::clone(host),
            source_weak: Arc::downgrade(source),
            source_strong: Mutex::new(Some(Arc::clone(source))),
        }));
        unsafe { (*core).native.impl_ptr = core.cast::<c_void>() };
        Self { raw: core.cast() }
    }

    /// The native stream pointer. Does not transfer the reference.
    #[must_use]
    pub fn as_ptr(&self) -> *mut InputStream {
        self.raw
    }

    /// Hand the caller's reference to native code. The native side now
    /// owes one release for it.
    #[must_use]
    pub fn into_raw(self) -> *mut InputStream {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }

    /// Whether the stream has hit end of stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        let core = self.raw.cast::<AdapterCore>();
        unsafe { &*core }.eof.load(Ordering::Acquire)
    }

    /// Current native refcount. Diagnostic.
    #[must_use]
    pub fn refcount(&self) -> usize {
        let core = self.raw.cast::<AdapterCore>();
        unsafe { &*core }.refcount.load(Ordering::Acquire)
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        unsafe { tether_core::stream::release(self.raw) };
    }
}

fn with_source<R>(
    core: &AdapterCore,
    f: impl FnOnce(&mut dyn ByteSource) -> Result<R>,
) -> Result<R> {
    let slot = core
        .source_strong
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let source = slot.as_ref().ok_or(Error::BrokenPipe)?;
    let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut *source)
}

unsafe extern "C" fn adapter_seek(stream: *mut InputStream, offset: i64, basis: i32) -> i32 {
    let core = unsafe { &*stream.cast::<AdapterCore>() };
    let Some(_guard) = core.host.enter() else {
        return raise_error(ERROR_BROKEN_PIPE);
    };
    let Some(basis) = SeekBasis::from_raw(basis) else {
        return raise_error(ERROR_INVALID_ARGUMENT);
    };
    match with_source(core, |s| s.seek(offset, basis)) {
        Ok(()) => {
            core.eof.store(false, Ordering::Release);
            OK
        }
        Err(err) => raise_error(translate_to_native(&err)),
    }
}

unsafe extern "C" fn adapter_read(stream: *mut InputStream, dest: *mut ByteBuf) -> i32 {
    let core = unsafe { &*stream.cast::<AdapterCore>() };
    let Some(_guard) = core.host.enter() else {
        return raise_error(ERROR_BROKEN_PIPE);
    };
    if dest.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let dest = unsafe { &mut *dest };
    let space = dest.capacity.saturating_sub(dest.len);
    if space == 0 {
        return OK;
    }
    let slice = unsafe { std::slice::from_raw_parts_mut(dest.ptr.add(dest.len), space) };
    match with_source(core, |s| s.read_into(slice)) {
        Ok(Some(n)) => {
            let n = n.min(space);
            dest.len += n;
            if n == 0 {
                core.eof.store(true, Ordering::Release);
            }
            OK
        }
        // Would-block: zero bytes appended, EOF untouched.
        Ok(None) => OK,
        Err(err) => raise_error(translate_to_native(&err)),
    }
}

unsafe extern "C" fn adapter_status(stream: *mut InputStream, out: *mut StreamStatus) -> i32 {
    if out.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let core = unsafe { &*stream.cast::<AdapterCore>() };
    let valid = {
        let slot = core
            .source_strong
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.is_some() && !core.host.is_torn_down()
    };
    unsafe {
        *out = StreamStatus {
            is_end_of_stream: core.eof.load(Ordering::Acquire),
            is_valid: valid,
        };
    }
    OK
}

unsafe extern "C" fn adapter_length(stream: *mut InputStream, out: *mut i64) -> i32 {
    let core = unsafe { &*stream.cast::<AdapterCore>() };
    let Some(_guard) = core.host.enter() else {
        return raise_error(ERROR_BROKEN_PIPE);
    };
    if out.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    match with_source(core, |s| {
        s.len_hint().ok_or(Error::Unimplemented("len_hint"))
    }) {
        Ok(len) => {
            unsafe { *out = i64::try_from(len).unwrap_or(i64::MAX) };
            OK
        }
        Err(err) => raise_error(translate_to_native(&err)),
    }
}

unsafe extern "C" fn adapter_acquire(stream: *mut InputStream) {
    let core = unsafe { &*stream.cast::<AdapterCore>() };
    let prev = core.refcount.fetch_add(1, Ordering::AcqRel);
    if prev == 0 {
        // 0→1: re-take the host object reference. Upgrade can fail if the
        // host object died while unreferenced; the stream then reports
        // invalid status.
        let mut slot = core
            .source_strong
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = core.source_weak.upgrade();
    }
}

unsafe extern "C" fn adapter_release(stream: *mut InputStream) {
    let core_ptr = stream.cast::<AdapterCore>();
    let prev = unsafe { &*core_ptr }.refcount.fetch_sub(1, Ordering::AcqRel);
    if prev != 1 {
        return;
    }
    // 1→0: drop the host object reference under the host lock (its drop
    // may run host-side code), then free the adapter itself.
    let boxed = unsafe { Box::from_raw(core_ptr) };
    let dropped = boxed
        .source_strong
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(guard) = boxed.host.enter() {
        drop(dropped);
        drop(guard);
    } else {
        drop(dropped);
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A [`ByteSource`] over an in-memory buffer. Mostly useful in tests and
/// for small bodies.
#[derive(Debug)]
pub struct BufferSource {
    data: Vec<u8>,
    pos: usize,
}

impl BufferSource {
    /// Source over `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for BufferSource {
    fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>> {
        let n = dest.len().min(self.data.len() - self.pos);
        dest[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(Some(n))
    }

    fn seek(&mut self, offset: i64, basis: SeekBasis) -> Result<()> {
        let base = match basis {
            SeekBasis::Begin => 0_i64,
            SeekBasis::End => self.data.len() as i64,
        };
        let target = base.checked_add(offset).ok_or(Error::Overflow("seek"))?;
        if target < 0 || target > self.data.len() as i64 {
            return Err(Error::InvalidIndex(target.unsigned_abs() as usize));
        }
        self.pos = target as usize;
        Ok(())
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// A [`ByteSource`] over a file on disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    len: Option<u64>,
}

impl FileSource {
    /// Open `path` for streaming.
    ///
    /// # Errors
    /// [`Error::InvalidFilePath`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|_| Error::InvalidFilePath(path.display().to_string()))?;
        let len = file.metadata().ok().map(|m| m.len());
        Ok(Self { file, len })
    }
}

fn map_io(err: &std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::WouldBlock => Error::WouldBlock,
        std::io::ErrorKind::BrokenPipe => Error::BrokenPipe,
        std::io::ErrorKind::NotFound => Error::InvalidFilePath(err.to_string()),
        _ => Error::InvalidArgument(err.to_string()),
    }
}

impl ByteSource for FileSource {
    fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>> {
        match self.file.read(dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(map_io(&e)),
        }
    }

    fn seek(&mut self, offset: i64, basis: SeekBasis) -> Result<()> {
        let from = match basis {
            SeekBasis::Begin => {
                SeekFrom::Start(u64::try_from(offset).map_err(|_| Error::Overflow("seek"))?)
            }
            SeekBasis::End => SeekFrom::End(offset),
        };
        self.file.seek(from).map(|_| ()).map_err(|e| map_io(&e))
    }

    fn len_hint(&self) -> Option<u64> {
        self.len
    }
}

// ---------------------------------------------------------------------------
// Progress metering
// ---------------------------------------------------------------------------

/// Wraps a source and reports bytes transferred since the previous
/// report, at most once per [`REPORT_WINDOW`]. Hitting end of stream
/// flushes the remainder.
pub struct MeteredSource<S> {
    inner: S,
    on_progress: Box<dyn FnMut(u64) + Send>,
    pending: u64,
    last_report: Option<Instant>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for MeteredSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredSource")
            .field("inner", &self.inner)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<S: ByteSource> MeteredSource<S> {
    /// Meter `inner`, delivering byte deltas to `on_progress`.
    #[must_use]
    pub fn new(inner: S, on_progress: impl FnMut(u64) + Send + 'static) -> Self {
        Self {
            inner,
            on_progress: Box::new(on_progress),
            pending: 0,
            last_report: None,
        }
    }

    fn flush(&mut self) {
        if self.pending > 0 {
            (self.on_progress)(self.pending);
            self.pending = 0;
            self.last_report = Some(Instant::now());
        }
    }
}

impl<S: ByteSource> ByteSource for MeteredSource<S> {
    fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>> {
        let read = self.inner.read_into(dest)?;
        match read {
            Some(0) => self.flush(),
            Some(n) => {
                self.pending += n as u64;
                let now = Instant::now();
                match self.last_report {
                    // The window opens on first activity.
                    None => self.last_report = Some(now),
                    Some(t) if now.duration_since(t) >= REPORT_WINDOW => self.flush(),
                    Some(_) => {}
                }
            }
            None => {}
        }
        Ok(read)
    }

    fn seek(&mut self, offset: i64, basis: SeekBasis) -> Result<()> {
        self.inner.seek(offset, basis)
    }

    fn len_hint(&self) -> Option<u64> {
        self.inner.len_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::stream as native_stream;

    fn shared(source: impl ByteSource + 'static) -> SharedSource {
        Arc::new(Mutex::new(source))
    }

    #[test]
    fn host_reference_tracks_native_refcount() {
        let host = HostRuntime::new();
        let source = shared(BufferSource::new(vec![1, 2, 3]));
        assert_eq!(Arc::strong_count(&source), 1);

        let adapter = StreamAdapter::new(&host, &source);
        assert_eq!(adapter.refcount(), 1);
        assert_eq!(Arc::strong_count(&source), 2);

        // Intermediate acquire/release hops leave the host reference alone.
        unsafe { native_stream::acquire(adapter.as_ptr()) };
        assert_eq!(adapter.refcount(), 2);
        assert_eq!(Arc::strong_count(&source), 2);
        unsafe { native_stream::release(adapter.as_ptr()) };
        assert_eq!(Arc::strong_count(&source), 2);

        drop(adapter);
        assert_eq!(Arc::strong_count(&source), 1);
    }

    #[test]
    fn read_appends_and_zero_sets_eof() {
        let host = HostRuntime::new();
        let source = shared(BufferSource::new(b"abcdef".to_vec()));
        let adapter = StreamAdapter::new(&host, &source);

        let mut storage = [0u8; 4];
        let mut buf = ByteBuf {
            ptr: storage.as_mut_ptr(),
            len: 0,
            capacity: storage.len(),
        };
        let vt = unsafe { (*adapter.as_ptr()).vtable };
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        assert_eq!(buf.len, 4);
        assert_eq!(&storage[..4], b"abcd");
        assert!(!adapter.is_eof());

        buf.len = 0;
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        assert_eq!(buf.len, 2);
        assert!(!adapter.is_eof());

        buf.len = 0;
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        assert_eq!(buf.len, 0);
        assert!(adapter.is_eof());
    }

    #[test]
    fn seek_clears_eof() {
        let host = HostRuntime::new();
        let source = shared(BufferSource::new(b"xy".to_vec()));
        let adapter = StreamAdapter::new(&host, &source);
        let vt = unsafe { (*adapter.as_ptr()).vtable };

        let mut storage = [0u8; 8];
        let mut buf = ByteBuf {
            ptr: storage.as_mut_ptr(),
            len: 0,
            capacity: storage.len(),
        };
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        buf.len = 0;
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        assert!(adapter.is_eof());

        assert_eq!(
            unsafe { ((*vt).seek)(adapter.as_ptr(), 0, SeekBasis::Begin as i32) },
            OK
        );
        assert!(!adapter.is_eof());
    }

    #[test]
    fn length_reports_hint() {
        let host = HostRuntime::new();
        let source = shared(BufferSource::new(vec![0; 37]));
        let adapter = StreamAdapter::new(&host, &source);
        let vt = unsafe { (*adapter.as_ptr()).vtable };
        let mut len = 0_i64;
        assert_eq!(unsafe { ((*vt).length)(adapter.as_ptr(), &raw mut len) }, OK);
        assert_eq!(len, 37);
    }

    struct DripSource {
        served: bool,
    }

    impl ByteSource for DripSource {
        fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>> {
            if self.served {
                return Ok(Some(0));
            }
            self.served = true;
            dest[0] = 0xAA;
            Ok(None)
        }
    }

    #[test]
    fn would_block_does_not_set_eof() {
        let host = HostRuntime::new();
        let source = shared(DripSource { served: false });
        let adapter = StreamAdapter::new(&host, &source);
        let vt = unsafe { (*adapter.as_ptr()).vtable };
        let mut storage = [0u8; 2];
        let mut buf = ByteBuf {
            ptr: storage.as_mut_ptr(),
            len: 0,
            capacity: storage.len(),
        };
        assert_eq!(unsafe { ((*vt).read)(adapter.as_ptr(), &raw mut buf) }, OK);
        assert_eq!(buf.len, 0);
        assert!(!adapter.is_eof());
    }

    #[test]
    fn metered_source_flushes_remainder_at_eof() {
        let reports: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let mut metered = MeteredSource::new(BufferSource::new(vec![7; 100]), move |n| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(n);
        });
        let mut buf = [0u8; 64];
        loop {
            match metered.read_into(&mut buf).expect("read") {
                Some(0) => break,
                Some(_) | None => {}
            }
        }
        let reports = reports.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(reports.iter().sum::<u64>(), 100);
    }
}
