//! CBOR item codec (RFC 8949 subset).
//!
//! Item-level primitives only: the binding layer above drives these to
//! marshal whole host values. Supported items: unsigned and negative
//! integers, 64-bit (and, on decode, 32-bit) floats, booleans, null,
//! definite byte/text strings, definite arrays and maps, and
//! indefinite-length byte/text strings whose segments the decoder
//! coalesces. Tags and other simple values are rejected as unsupported.

use crate::error::{ERROR_CBOR_MALFORMED, ERROR_CBOR_UNSUPPORTED};

const MAJOR_UINT: u8 = 0;
const MAJOR_NINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const INFO_INDEFINITE: u8 = 31;
const SIMPLE_FALSE: u8 = 20;
const SIMPLE_TRUE: u8 = 21;
const SIMPLE_NULL: u8 = 22;
const SIMPLE_F32: u8 = 26;
const SIMPLE_F64: u8 = 27;
const BREAK: u8 = 0xFF;

/// Codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CborError {
    /// Input ended inside an item.
    Truncated,
    /// Structurally invalid input (bad argument widths, invalid UTF-8,
    /// stray break).
    Malformed,
    /// A well-formed item this codec does not carry (tags, undefined,
    /// half-floats, indefinite containers).
    Unsupported,
    /// The next item is not of the requested kind.
    TypeMismatch,
}

impl CborError {
    /// The native error code for this failure.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Truncated | Self::Malformed | Self::TypeMismatch => ERROR_CBOR_MALFORMED,
            Self::Unsupported => ERROR_CBOR_UNSUPPORTED,
        }
    }
}

/// Codec result alias.
pub type CborResult<T> = Result<T, CborError>;

/// Kind of the next item in a decoder, as reported by [`Decoder::peek_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Major type 0.
    UInt,
    /// Major type 1.
    NInt,
    /// Major type 2, definite or indefinite.
    Bytes,
    /// Major type 3, definite or indefinite.
    Text,
    /// Major type 4, definite length.
    Array,
    /// Major type 5, definite length.
    Map,
    /// Float (32- or 64-bit).
    Float,
    /// `true` / `false`.
    Bool,
    /// `null`.
    Null,
    /// A break byte (only valid inside indefinite strings).
    Break,
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Append-only CBOR item writer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the encoder and return the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn head(&mut self, major: u8, arg: u64) {
        let m = major << 5;
        if arg < 24 {
            self.buf.push(m | arg as u8);
        } else if arg <= u64::from(u8::MAX) {
            self.buf.push(m | 24);
            self.buf.push(arg as u8);
        } else if arg <= u64::from(u16::MAX) {
            self.buf.push(m | 25);
            self.buf.extend_from_slice(&(arg as u16).to_be_bytes());
        } else if arg <= u64::from(u32::MAX) {
            self.buf.push(m | 26);
            self.buf.extend_from_slice(&(arg as u32).to_be_bytes());
        } else {
            self.buf.push(m | 27);
            self.buf.extend_from_slice(&arg.to_be_bytes());
        }
    }

    /// Write an unsigned integer.
    pub fn uint(&mut self, v: u64) {
        self.head(MAJOR_UINT, v);
    }

    /// Write the negative integer `-(n + 1)`.
    pub fn negative(&mut self, n: u64) {
        self.head(MAJOR_NINT, n);
    }

    /// Write a 64-bit float.
    pub fn float(&mut self, v: f64) {
        self.buf.push((MAJOR_SIMPLE << 5) | SIMPLE_F64);
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Write a boolean.
    pub fn bool(&mut self, v: bool) {
        let info = if v { SIMPLE_TRUE } else { SIMPLE_FALSE };
        self.buf.push((MAJOR_SIMPLE << 5) | info);
    }

    /// Write `null`. Other simple values are intentionally not exposed.
    pub fn null(&mut self) {
        self.buf.push((MAJOR_SIMPLE << 5) | SIMPLE_NULL);
    }

    /// Write a definite-length byte string.
    pub fn bytes(&mut self, v: &[u8]) {
        self.head(MAJOR_BYTES, v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    /// Write a definite-length text string.
    pub fn text(&mut self, v: &str) {
        self.head(MAJOR_TEXT, v.len() as u64);
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// Write a definite-length array header; `len` items must follow.
    pub fn array(&mut self, len: u64) {
        self.head(MAJOR_ARRAY, len);
    }

    /// Write a definite-length map header; `len` key/value pairs must follow.
    pub fn map(&mut self, len: u64) {
        self.head(MAJOR_MAP, len);
    }

    /// Open an indefinite-length byte string. Write segments with
    /// [`bytes`](Self::bytes), then close with [`finish_indefinite`](Self::finish_indefinite).
    pub fn begin_indefinite_bytes(&mut self) {
        self.buf.push((MAJOR_BYTES << 5) | INFO_INDEFINITE);
    }

    /// Open an indefinite-length text string.
    pub fn begin_indefinite_text(&mut self) {
        self.buf.push((MAJOR_TEXT << 5) | INFO_INDEFINITE);
    }

    /// Close an open indefinite-length string.
    pub fn finish_indefinite(&mut self) {
        self.buf.push(BREAK);
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Pull-based CBOR item reader over a borrowed buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Decode items from `input`.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn peek_byte(&self) -> CborResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(CborError::Truncated)
    }

    fn take(&mut self, n: usize) -> CborResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(CborError::Malformed)?;
        let chunk = self.input.get(self.pos..end).ok_or(CborError::Truncated)?;
        self.pos = end;
        Ok(chunk)
    }

    /// Consume one item head, returning `(major, info, argument)`. The
    /// argument is 0 for the indefinite-length info value; callers must
    /// check `info` before trusting it.
    fn head(&mut self) -> CborResult<(u8, u8, u64)> {
        let initial = self.peek_byte()?;
        self.pos += 1;
        let major = initial >> 5;
        let info = initial & 0x1F;
        let arg = match info {
            0..=23 => u64::from(info),
            24 => u64::from(self.take(1)?[0]),
            25 => u64::from(u16::from_be_bytes(
                self.take(2)?.try_into().map_err(|_| CborError::Truncated)?,
            )),
            26 => u64::from(u32::from_be_bytes(
                self.take(4)?.try_into().map_err(|_| CborError::Truncated)?,
            )),
            27 => u64::from_be_bytes(
                self.take(8)?.try_into().map_err(|_| CborError::Truncated)?,
            ),
            INFO_INDEFINITE => 0,
            _ => return Err(CborError::Malformed),
        };
        Ok((major, info, arg))
    }

    /// Kind of the next item without consuming it.
    pub fn peek_kind(&self) -> CborResult<ItemKind> {
        let initial = self.peek_byte()?;
        if initial == BREAK {
            return Ok(ItemKind::Break);
        }
        let major = initial >> 5;
        let info = initial & 0x1F;
        Ok(match major {
            MAJOR_UINT => ItemKind::UInt,
            MAJOR_NINT => ItemKind::NInt,
            MAJOR_BYTES => ItemKind::Bytes,
            MAJOR_TEXT => ItemKind::Text,
            MAJOR_ARRAY => {
                if info == INFO_INDEFINITE {
                    return Err(CborError::Unsupported);
                }
                ItemKind::Array
            }
            MAJOR_MAP => {
                if info == INFO_INDEFINITE {
                    return Err(CborError::Unsupported);
                }
                ItemKind::Map
            }
            MAJOR_TAG => return Err(CborError::Unsupported),
            MAJOR_SIMPLE => match info {
                SIMPLE_FALSE | SIMPLE_TRUE => ItemKind::Bool,
                SIMPLE_NULL => ItemKind::Null,
                SIMPLE_F32 | SIMPLE_F64 => ItemKind::Float,
                _ => return Err(CborError::Unsupported),
            },
            _ => return Err(CborError::Malformed),
        })
    }

    /// Consume an unsigned integer.
    pub fn uint(&mut self) -> CborResult<u64> {
        if self.peek_kind()? != ItemKind::UInt {
            return Err(CborError::TypeMismatch);
        }
        let (_, info, arg) = self.head()?;
        if info == INFO_INDEFINITE {
            return Err(CborError::Malformed);
        }
        Ok(arg)
    }

    /// Consume a negative integer, returning `n` where the value is `-(n + 1)`.
    pub fn negative(&mut self) -> CborResult<u64> {
        if self.peek_kind()? != ItemKind::NInt {
            return Err(CborError::TypeMismatch);
        }
        let (_, info, arg) = self.head()?;
        if info == INFO_INDEFINITE {
            return Err(CborError::Malformed);
        }
        Ok(arg)
    }

    /// Consume a float (32- or 64-bit; 32-bit widens).
    pub fn float(&mut self) -> CborResult<f64> {
        if self.peek_kind()? != ItemKind::Float {
            return Err(CborError::TypeMismatch);
        }
        let initial = self.peek_byte()?;
        self.pos += 1;
        match initial & 0x1F {
            SIMPLE_F32 => {
                let raw = u32::from_be_bytes(
                    self.take(4)?.try_into().map_err(|_| CborError::Truncated)?,
                );
                Ok(f64::from(f32::from_bits(raw)))
            }
            SIMPLE_F64 => {
                let raw = u64::from_be_bytes(
                    self.take(8)?.try_into().map_err(|_| CborError::Truncated)?,
                );
                Ok(f64::from_bits(raw))
            }
            _ => Err(CborError::Unsupported),
        }
    }

    /// Consume a boolean.
    pub fn bool(&mut self) -> CborResult<bool> {
        if self.peek_kind()? != ItemKind::Bool {
            return Err(CborError::TypeMismatch);
        }
        let initial = self.peek_byte()?;
        self.pos += 1;
        Ok(initial & 0x1F == SIMPLE_TRUE)
    }

    /// Consume `null`.
    pub fn null(&mut self) -> CborResult<()> {
        if self.peek_kind()? != ItemKind::Null {
            return Err(CborError::TypeMismatch);
        }
        self.pos += 1;
        Ok(())
    }

    fn string(&mut self, major: u8) -> CborResult<Vec<u8>> {
        let (m, info, arg) = self.head()?;
        if m != major {
            return Err(CborError::TypeMismatch);
        }
        if info != INFO_INDEFINITE {
            return Ok(self.take(usize::try_from(arg).map_err(|_| CborError::Malformed)?)?.to_vec());
        }
        // Indefinite: coalesce definite segments of the same major type
        // until the break byte.
        let mut out = Vec::new();
        loop {
            if self.peek_byte()? == BREAK {
                self.pos += 1;
                return Ok(out);
            }
            let (seg_major, seg_info, seg_len) = self.head()?;
            if seg_major != major || seg_info == INFO_INDEFINITE {
                return Err(CborError::Malformed);
            }
            out.extend_from_slice(
                self.take(usize::try_from(seg_len).map_err(|_| CborError::Malformed)?)?,
            );
        }
    }

    /// Consume a byte string, coalescing indefinite segments.
    pub fn bytes(&mut self) -> CborResult<Vec<u8>> {
        if self.peek_kind()? != ItemKind::Bytes {
            return Err(CborError::TypeMismatch);
        }
        self.string(MAJOR_BYTES)
    }

    /// Consume a text string, coalescing indefinite segments.
    pub fn text(&mut self) -> CborResult<String> {
        if self.peek_kind()? != ItemKind::Text {
            return Err(CborError::TypeMismatch);
        }
        String::from_utf8(self.string(MAJOR_TEXT)?).map_err(|_| CborError::Malformed)
    }

    /// Consume an array header, returning the element count.
    pub fn array_len(&mut self) -> CborResult<u64> {
        if self.peek_kind()? != ItemKind::Array {
            return Err(CborError::TypeMismatch);
        }
        let (_, _, arg) = self.head()?;
        Ok(arg)
    }

    /// Consume a map header, returning the pair count.
    pub fn map_len(&mut self) -> CborResult<u64> {
        if self.peek_kind()? != ItemKind::Map {
            return Err(CborError::TypeMismatch);
        }
        let (_, _, arg) = self.head()?;
        Ok(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_widths() {
        for v in [0u64, 23, 24, 255, 256, 65_535, 65_536, u64::from(u32::MAX), u64::MAX] {
            let mut e = Encoder::new();
            e.uint(v);
            let bytes = e.into_bytes();
            assert_eq!(Decoder::new(&bytes).uint(), Ok(v), "v = {v}");
        }
    }

    #[test]
    fn negative_round_trip() {
        let mut e = Encoder::new();
        e.negative(0); // -1
        e.negative(999); // -1000
        let bytes = e.into_bytes();
        let mut d = Decoder::new(&bytes);
        assert_eq!(d.negative(), Ok(0));
        assert_eq!(d.negative(), Ok(999));
    }

    #[test]
    fn indefinite_bytes_coalesce() {
        let mut e = Encoder::new();
        e.begin_indefinite_bytes();
        e.bytes(b"ab");
        e.bytes(b"cd");
        e.finish_indefinite();
        let bytes = e.into_bytes();
        assert_eq!(Decoder::new(&bytes).bytes(), Ok(b"abcd".to_vec()));
    }

    #[test]
    fn tag_is_unsupported() {
        // 0xC1: tag(1)
        let mut d = Decoder::new(&[0xC1, 0x00]);
        assert_eq!(d.peek_kind(), Err(CborError::Unsupported));
    }

    #[test]
    fn undefined_simple_is_unsupported() {
        // 0xF7: undefined
        let d = Decoder::new(&[0xF7]);
        assert_eq!(d.peek_kind(), Err(CborError::Unsupported));
    }

    #[test]
    fn truncated_head_is_detected() {
        let mut d = Decoder::new(&[0x19, 0x01]); // uint16 missing a byte
        assert_eq!(d.uint(), Err(CborError::Truncated));
    }

    #[test]
    fn stray_break_is_visible_to_peek() {
        let d = Decoder::new(&[0xFF]);
        assert_eq!(d.peek_kind(), Ok(ItemKind::Break));
    }

    #[test]
    fn f32_widens_on_decode() {
        // 0xFA 3F800000 = 1.0f32
        let mut d = Decoder::new(&[0xFA, 0x3F, 0x80, 0x00, 0x00]);
        assert_eq!(d.float(), Ok(1.0));
    }
}
