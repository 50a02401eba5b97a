//! Stable content fingerprints
//!
//! A fingerprint is a short hex digest of a value's canonical encoding. The
//! encoding is explicit rather than derived from `Hash`, so two logically
//! equal values always produce the same fingerprint, across restarts and
//! across toolchain versions.
//!
//! Encoding rules, applied to the value's JSON form:
//! - every value starts with a one-byte type tag
//! - strings and object keys are length-prefixed (u64, big endian)
//! - arrays keep their order
//! - object entries are sorted by key bytes before encoding

use std::fmt::Write as _;

use aws_lc_rs::digest;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::Error;

/// Length of a rendered fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 16;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_UINT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;

/// Compute the fingerprint of any serializable value.
///
/// Returns [`Error::Fingerprint`] if the value cannot be represented as JSON
/// (e.g. a map with non-string keys); never an empty digest.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, Error> {
    let value = serde_json::to_value(value).map_err(|e| Error::fingerprint(e.to_string()))?;
    fingerprint_value(&value)
}

/// Compute the fingerprint of an already-serialized JSON value
pub fn fingerprint_value(value: &Value) -> Result<String, Error> {
    let bytes = canonical_bytes(value)?;
    let hash = digest::digest(&digest::SHA256, &bytes);
    Ok(hash.as_ref()[..FINGERPRINT_LEN / 2]
        .iter()
        .fold(String::with_capacity(FINGERPRINT_LEN), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        }))
}

/// Canonical byte encoding of a JSON value
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode(value, &mut out)?;
    Ok(out)
}

fn encode(value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => encode_number(n, out)?,
        Value::String(s) => {
            out.push(TAG_STRING);
            encode_bytes(s.as_bytes(), out);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            encode_len(items.len(), out);
            for item in items {
                encode(item, out)?;
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(TAG_OBJECT);
            encode_len(entries.len(), out);
            for (key, value) in entries {
                encode_bytes(key.as_bytes(), out);
                encode(value, out)?;
            }
        }
    }
    Ok(())
}

fn encode_number(n: &Number, out: &mut Vec<u8>) -> Result<(), Error> {
    if let Some(i) = n.as_i64() {
        out.push(TAG_INT);
        out.extend_from_slice(&i.to_be_bytes());
    } else if let Some(u) = n.as_u64() {
        out.push(TAG_UINT);
        out.extend_from_slice(&u.to_be_bytes());
    } else {
        match n.as_f64() {
            Some(f) if f.is_finite() => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            _ => {
                return Err(Error::fingerprint(format!(
                    "number {} has no canonical encoding",
                    n
                )))
            }
        }
    }
    Ok(())
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_len(bytes.len(), out);
    out.extend_from_slice(bytes);
}
