//! Host-value marshalling over the native CBOR item codec.
//!
//! [`Value`] is the host-side shape; encoding drives the native
//! [`Encoder`](tether_core::cbor::Encoder) item by item and decoding
//! pulls items back out. Numeric equality is cross-variant: an unsigned
//! value compares equal to a non-negative signed value of the same
//! magnitude, so a value survives `decode(encode(v))` regardless of which
//! integer variant it was built with.
//!
//! Indefinite-length strings decode to their coalesced definite form;
//! [`encode_indefinite_bytes`] / [`encode_indefinite_text`] produce the
//! segmented wire shape.

use tether_core::cbor::{Decoder, Encoder, ItemKind};

use crate::error::{Error, Result};

/// A CBOR-encodable host value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Unsigned integer.
    UInt(u64),
    /// Signed integer; negative values use the negative-integer wire form.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Null.
    Null,
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string.
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map with text keys, preserving insertion order.
    Map(Vec<(String, Value)>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // Cross-variant numeric equality.
            (Self::UInt(a), Self::Int(b)) | (Self::Int(b), Self::UInt(a)) => {
                u64::try_from(*b).is_ok_and(|b| *a == b)
            }
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

fn codec_err(e: tether_core::cbor::CborError) -> Error {
    Error::from_native(e.code())
}

fn encode_into(value: &Value, enc: &mut Encoder) -> Result<()> {
    match value {
        Value::UInt(v) => enc.uint(*v),
        Value::Int(v) => {
            if *v < 0 {
                // Wire form carries -(n + 1).
                enc.negative(v.unsigned_abs() - 1);
            } else {
                enc.uint(*v as u64);
            }
        }
        Value::Float(v) => enc.float(*v),
        Value::Bool(v) => enc.bool(*v),
        Value::Null => enc.null(),
        Value::Bytes(v) => enc.bytes(v),
        Value::Text(v) => enc.text(v),
        Value::Array(items) => {
            enc.array(items.len() as u64);
            for item in items {
                encode_into(item, enc)?;
            }
        }
        Value::Map(pairs) => {
            enc.map(pairs.len() as u64);
            for (key, item) in pairs {
                enc.text(key);
                encode_into(item, enc)?;
            }
        }
    }
    Ok(())
}

/// Encode `value` to CBOR bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_into(value, &mut enc)?;
    Ok(enc.into_bytes())
}

/// Encode `segments` as one indefinite-length byte string.
#[must_use]
pub fn encode_indefinite_bytes(segments: &[&[u8]]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.begin_indefinite_bytes();
    for segment in segments {
        enc.bytes(segment);
    }
    enc.finish_indefinite();
    enc.into_bytes()
}

/// Encode `segments` as one indefinite-length text string.
#[must_use]
pub fn encode_indefinite_text(segments: &[&str]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.begin_indefinite_text();
    for segment in segments {
        enc.text(segment);
    }
    enc.finish_indefinite();
    enc.into_bytes()
}

fn decode_item(dec: &mut Decoder<'_>) -> Result<Value> {
    let kind = dec.peek_kind().map_err(codec_err)?;
    Ok(match kind {
        ItemKind::UInt => Value::UInt(dec.uint().map_err(codec_err)?),
        ItemKind::NInt => {
            let n = dec.negative().map_err(codec_err)?;
            let magnitude = n
                .checked_add(1)
                .ok_or(Error::Overflow("negative integer"))?;
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(Error::Overflow("negative integer"));
            }
            Value::Int((magnitude as i64).wrapping_neg())
        }
        ItemKind::Float => Value::Float(dec.float().map_err(codec_err)?),
        ItemKind::Bool => Value::Bool(dec.bool().map_err(codec_err)?),
        ItemKind::Null => {
            dec.null().map_err(codec_err)?;
            Value::Null
        }
        ItemKind::Bytes => Value::Bytes(dec.bytes().map_err(codec_err)?),
        ItemKind::Text => Value::Text(dec.text().map_err(codec_err)?),
        ItemKind::Array => {
            let len = dec.array_len().map_err(codec_err)?;
            let mut items =
                Vec::with_capacity(usize::try_from(len.min(1024)).unwrap_or_default());
            for _ in 0..len {
                items.push(decode_item(dec)?);
            }
            Value::Array(items)
        }
        ItemKind::Map => {
            let len = dec.map_len().map_err(codec_err)?;
            let mut pairs =
                Vec::with_capacity(usize::try_from(len.min(1024)).unwrap_or_default());
            for _ in 0..len {
                let key = dec.text().map_err(codec_err)?;
                pairs.push((key, decode_item(dec)?));
            }
            Value::Map(pairs)
        }
        ItemKind::Break => {
            return Err(Error::InvalidArgument("unexpected break item".into()));
        }
    })
}

/// Decode one value from `input`, requiring the input to be fully consumed.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(input);
    let value = decode_item(&mut dec)?;
    if dec.remaining() != 0 {
        return Err(Error::InvalidArgument(format!(
            "{} trailing bytes after value",
            dec.remaining()
        )));
    }
    Ok(value)
}
