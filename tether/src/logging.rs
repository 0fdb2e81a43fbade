//! Logging initializer.
//!
//! One-shot wiring of `tracing` output: `init(level, destination)` where
//! the destination strings `"stdout"` and `"stderr"` select the standard
//! streams and any other string is taken as a file path.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Initialize logging at `level` (an `EnvFilter` directive such as
/// `"info"` or `"tether=debug"`) writing to `destination`. Call at most
/// once; later calls are no-ops.
///
/// # Errors
/// [`Error::InvalidFilePath`] if a file destination cannot be opened.
pub fn init(level: &str, destination: &str) -> Result<()> {
    let filter = EnvFilter::builder().parse_lossy(level);
    match destination {
        "stdout" => {
            LOGGER_INIT.get_or_init(|| {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stdout)
                    .init();
            });
        }
        "stderr" => {
            LOGGER_INIT.get_or_init(|| {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            });
        }
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(path))
                .map_err(|_| Error::InvalidFilePath(path.to_owned()))?;
            let writer = Mutex::new(file);
            LOGGER_INIT.get_or_init(move || {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            });
        }
    }
    Ok(())
}
