//! Checksum and hash surfaces with the lock-suspension rule.
//!
//! Bulk checksum computation and bulk hash update are the only native
//! operations allowed to run with the host lock released, and only when
//! the input exceeds [`SUSPEND_THRESHOLD`]. Small inputs are not worth a
//! lock bounce and run locked.

use crate::error::{Error, Result};
use crate::lock::{HostRuntime, SUSPEND_THRESHOLD};

/// CRC32 of `input`, continuing from `previous` (0 to start).
///
/// # Errors
/// [`Error::HostDown`] if the runtime is tearing down.
pub fn crc32(host: &HostRuntime, input: &[u8], previous: u32) -> Result<u32> {
    let mut guard = host.enter().ok_or(Error::HostDown)?;
    let crc = if input.len() > SUSPEND_THRESHOLD {
        guard.without_lock(|| tether_core::checksum::crc32(input, previous))
    } else {
        tether_core::checksum::crc32(input, previous)
    };
    Ok(crc)
}

/// Incremental SHA3-256 bound to a host runtime.
#[derive(Debug)]
pub struct Sha3 {
    inner: tether_core::checksum::Sha3Stream,
}

impl Sha3 {
    /// Fresh hash state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: tether_core::checksum::Sha3Stream::new(),
        }
    }

    /// Absorb `input`, suspending the host lock for large buffers.
    ///
    /// # Errors
    /// [`Error::HostDown`] if the runtime is tearing down.
    pub fn update(&mut self, host: &HostRuntime, input: &[u8]) -> Result<()> {
        let mut guard = host.enter().ok_or(Error::HostDown)?;
        if input.len() > SUSPEND_THRESHOLD {
            guard.without_lock(|| self.inner.update(input));
        } else {
            self.inner.update(input);
        }
        Ok(())
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finish(self) -> [u8; 32] {
        self.inner.finish()
    }
}

impl Default for Sha3 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_and_large_inputs_agree() {
        let host = HostRuntime::new();
        let small = vec![0x5A_u8; 64];
        let large = vec![0x5A_u8; SUSPEND_THRESHOLD + 1];

        // Same bytes, different code path: results must chain identically.
        let c1 = crc32(&host, &small, 0).expect("crc");
        let c2 = crc32(&host, &large, c1).expect("crc");
        let mut joined = small.clone();
        joined.extend_from_slice(&large);
        assert_eq!(crc32(&host, &joined, 0).expect("crc"), c2);
    }

    #[test]
    fn hash_update_suspends_without_changing_digest() {
        let host = HostRuntime::new();
        let big = vec![7_u8; SUSPEND_THRESHOLD * 2];
        let mut hasher = Sha3::new();
        hasher.update(&host, &big).expect("update");
        hasher.update(&host, b"tail").expect("update");

        let mut joined = big.clone();
        joined.extend_from_slice(b"tail");
        assert_eq!(hasher.finish(), tether_core::checksum::sha3_256(&joined));
    }

    #[test]
    fn torn_down_runtime_rejects_work() {
        let host = HostRuntime::new();
        host.begin_teardown();
        assert!(matches!(
            crc32(&host, b"abc", 0),
            Err(Error::HostDown)
        ));
        let mut hasher = Sha3::new();
        assert!(matches!(
            hasher.update(&host, b"abc"),
            Err(Error::HostDown)
        ));
    }
}
