//! Bulk checksum and hash primitives.
//!
//! These are the long-running native computations the binding layer is
//! allowed to run without holding the host lock. The implementations
//! delegate to `crc32fast` and `sha3`.

use sha3::{Digest, Sha3_256};

/// CRC32 (IEEE) over `input`, continuing from `previous` (0 for a fresh
/// computation).
#[must_use]
pub fn crc32(input: &[u8], previous: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(previous);
    hasher.update(input);
    hasher.finalize()
}

/// Streaming SHA3-256 state.
#[derive(Debug, Default)]
pub struct Sha3Stream {
    inner: Sha3_256,
}

impl Sha3Stream {
    /// Fresh hash state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb `input`.
    pub fn update(&mut self, input: &[u8]) {
        self.inner.update(input);
    }

    /// Finish and return the 32-byte digest.
    #[must_use]
    pub fn finish(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

/// One-shot SHA3-256 of `input`.
#[must_use]
pub fn sha3_256(input: &[u8]) -> [u8; 32] {
    let mut s = Sha3Stream::new();
    s.update(input);
    s.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // "123456789" is the classic CRC check string.
        assert_eq!(crc32(b"123456789", 0), 0xCBF4_3926);
    }

    #[test]
    fn crc32_is_resumable() {
        let whole = crc32(b"hello world", 0);
        let first = crc32(b"hello ", 0);
        assert_eq!(crc32(b"world", first), whole);
    }

    #[test]
    fn sha3_known_vector() {
        let digest = sha3_256(b"");
        assert_eq!(
            hex::encode(digest),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn sha3_streaming_matches_one_shot() {
        let mut s = Sha3Stream::new();
        s.update(b"abc");
        s.update(b"def");
        assert_eq!(s.finish(), sha3_256(b"abcdef"));
    }
}
