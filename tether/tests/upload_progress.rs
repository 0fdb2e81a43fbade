//! Streaming upload with progress metering: a native consumer drains a
//! metered host source and the progress reports coalesce into one-second
//! windows.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tether::error::Result;
use tether::stream::{BufferSource, ByteSource, MeteredSource, SeekBasis, StreamAdapter};
use tether::HostRuntime;

const UPLOAD_LEN: usize = 10 * 1024 * 1024;
const CHUNK: usize = 64 * 1024;

/// Paces reads so the transfer spans multiple report windows.
struct ThrottledSource {
    inner: BufferSource,
    pause: Duration,
}

impl ByteSource for ThrottledSource {
    fn read_into(&mut self, dest: &mut [u8]) -> Result<Option<usize>> {
        std::thread::sleep(self.pause);
        self.inner.read_into(dest)
    }

    fn seek(&mut self, offset: i64, basis: SeekBasis) -> Result<()> {
        self.inner.seek(offset, basis)
    }

    fn len_hint(&self) -> Option<u64> {
        self.inner.len_hint()
    }
}

#[test]
fn metered_upload_reports_coalesced_progress() {
    let host = HostRuntime::new();

    let reports: Arc<Mutex<Vec<(Instant, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let source = ThrottledSource {
        inner: BufferSource::new(vec![0xA5; UPLOAD_LEN]),
        pause: Duration::from_millis(13),
    };
    let metered = MeteredSource::new(source, move |bytes| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Instant::now(), bytes));
    });

    let shared: Arc<Mutex<dyn ByteSource>> = Arc::new(Mutex::new(metered));
    let adapter = StreamAdapter::new(&host, &shared);
    assert_eq!(Arc::strong_count(&shared), 2);

    // Hand the reference to the "native" consumer and drain on its thread.
    let raw = adapter.into_raw() as usize;
    let consumer = std::thread::spawn(move || unsafe {
        tether_core::stream::drain(raw as *mut tether_core::stream::InputStream, CHUNK)
    });
    let total = consumer
        .join()
        .expect("consumer thread")
        .expect("drain succeeds");
    assert_eq!(total, UPLOAD_LEN as u64);

    // The final native release dropped the host reference.
    assert_eq!(Arc::strong_count(&shared), 1);

    let reports = reports.lock().unwrap_or_else(PoisonError::into_inner);
    assert!(!reports.is_empty());

    // Counts sum to the upload size.
    let sum: u64 = reports.iter().map(|(_, n)| n).sum();
    assert_eq!(sum, UPLOAD_LEN as u64);

    // Windowed reports are at least a second apart; the terminal
    // end-of-stream flush is exempt.
    for i in 1..reports.len() {
        if i == reports.len() - 1 {
            continue;
        }
        let gap = reports[i].0.duration_since(reports[i - 1].0);
        assert!(
            gap >= Duration::from_millis(990),
            "windowed reports only {gap:?} apart"
        );
    }
}
