//! # Canonical encoding and the change-event wire format
//!
//! One deterministic binary encoding, not a buffet of interchangeable
//! formats: independently written readers must produce the **same bytes**
//! for the same semantic fields, which rules out format negotiation.
//! `CanonicalValue` below is a small self-describing value model with one
//! deterministic encoding; it backs both the change-event wire format and
//! the Merkle hash inputs, which both lean on "canonically encode a
//! structure of typed values".
//!
//! ## Wire shape
//!
//! Every encoded value starts with a one-byte type tag:
//!
//! | tag | type  | payload |
//! |-----|-------|---------|
//! | 0x01 | Bool | 1 byte, 0 or 1 |
//! | 0x02 | Int  | LEB128 varint of the zigzag-encoded `i64` (minimal width, no sign byte) |
//! | 0x03 | Text | u32 BE byte length + UTF-8 bytes |
//! | 0x04 | Bytes | u32 BE byte length + raw bytes |
//! | 0x05 | Array | u32 BE element count + each element, self-tagged |
//! | 0x06 | Map  | u32 BE pair count + (key, value) pairs, keys pre-sorted ascending by their own encoded bytes |
//! | 0x07 | Float | 8 bytes, big-endian bits of a NaN/inf-normalized `f64` |
//!
//! A `Map`'s pairs are ordered by each key's own fully-encoded bytes (tag
//! byte, then length prefix, then content), not by the field name text
//! itself, so the resulting field order isn't alphabetical. It is still
//! fixed and deterministic for a given field set, which is all the
//! change-event wire format and the Merkle sorted-map rule need: one
//! canonical-map encoder satisfies both without separate code paths.

use crate::model::{StorageEntry, MAX_EVENT_BYTES};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<CanonicalValue>),
    Map(Vec<(CanonicalValue, CanonicalValue)>),
    Float(f64),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encoded payload of {0} bytes exceeds the {1} byte cap")]
    PayloadTooLarge(usize, usize),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("tombstone event carried a value")]
    TombstoneWithValue,
    #[error("truncated or malformed canonical encoding")]
    Truncated,
}

impl From<CodecError> for crate::error::MerkleKvError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::PayloadTooLarge(got, cap) => {
                crate::error::MerkleKvError::PayloadTooLarge(format!("{got} bytes exceeds {cap}"))
            }
            CodecError::TombstoneWithValue => crate::error::MerkleKvError::TombstoneWithValue,
            CodecError::Schema(msg) => crate::error::MerkleKvError::SchemaError(msg),
            CodecError::Truncated => crate::error::MerkleKvError::SchemaError("truncated payload".into()),
        }
    }
}

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_BYTES: u8 = 0x04;
const TAG_ARRAY: u8 = 0x05;
const TAG_MAP: u8 = 0x06;
const TAG_FLOAT: u8 = 0x07;

/// Canonicalizes NaN and infinities to fixed bit patterns so that
/// bitwise-distinct NaNs (which are not even self-equal under IEEE 754)
/// still hash identically across implementations.
fn normalize_float(f: f64) -> f64 {
    if f.is_nan() {
        f64::from_bits(0x7ff8_0000_0000_0000)
    } else if f.is_infinite() {
        if f > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    } else {
        f
    }
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf.get(*pos).ok_or(CodecError::Truncated)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::Truncated);
        }
    }
}

/// Deterministic byte encoding of `value`, appended to `out`.
pub fn encode_into(out: &mut Vec<u8>, value: &CanonicalValue) {
    match value {
        CanonicalValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        CanonicalValue::Int(i) => {
            out.push(TAG_INT);
            write_varint(out, zigzag_encode(*i));
        }
        CanonicalValue::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        CanonicalValue::Bytes(b) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        CanonicalValue::Array(items) => {
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_into(out, item);
            }
        }
        CanonicalValue::Map(pairs) => {
            // Sort by each key's own encoded bytes, not the key's raw text,
            // so ordering is independent of the key's logical type.
            let mut encoded_pairs: Vec<(Vec<u8>, &CanonicalValue)> = pairs
                .iter()
                .map(|(k, v)| {
                    let mut kb = Vec::new();
                    encode_into(&mut kb, k);
                    (kb, v)
                })
                .collect();
            encoded_pairs.sort_by(|a, b| a.0.cmp(&b.0));
            out.push(TAG_MAP);
            out.extend_from_slice(&(encoded_pairs.len() as u32).to_be_bytes());
            for (kb, v) in &encoded_pairs {
                out.extend_from_slice(kb);
                encode_into(out, v);
            }
        }
        CanonicalValue::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&normalize_float(*f).to_bits().to_be_bytes());
        }
    }
}

pub fn encode(value: &CanonicalValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(&mut out, value);
    out
}

pub fn decode(buf: &[u8]) -> Result<CanonicalValue, CodecError> {
    let mut pos = 0;
    let value = decode_at(buf, &mut pos)?;
    if pos != buf.len() {
        return Err(CodecError::Truncated);
    }
    Ok(value)
}

fn decode_at(buf: &[u8], pos: &mut usize) -> Result<CanonicalValue, CodecError> {
    let tag = *buf.get(*pos).ok_or(CodecError::Truncated)?;
    *pos += 1;
    match tag {
        TAG_BOOL => {
            let b = *buf.get(*pos).ok_or(CodecError::Truncated)?;
            *pos += 1;
            Ok(CanonicalValue::Bool(b != 0))
        }
        TAG_INT => Ok(CanonicalValue::Int(zigzag_decode(read_varint(buf, pos)?))),
        TAG_TEXT => {
            let len = read_u32(buf, pos)? as usize;
            let bytes = read_bytes(buf, pos, len)?;
            let s = String::from_utf8(bytes).map_err(|_| CodecError::Schema("text field is not valid UTF-8".into()))?;
            Ok(CanonicalValue::Text(s))
        }
        TAG_BYTES => {
            let len = read_u32(buf, pos)? as usize;
            Ok(CanonicalValue::Bytes(read_bytes(buf, pos, len)?))
        }
        TAG_ARRAY => {
            let count = read_u32(buf, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_at(buf, pos)?);
            }
            Ok(CanonicalValue::Array(items))
        }
        TAG_MAP => {
            let count = read_u32(buf, pos)? as usize;
            let mut pairs = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let k = decode_at(buf, pos)?;
                let v = decode_at(buf, pos)?;
                pairs.push((k, v));
            }
            Ok(CanonicalValue::Map(pairs))
        }
        TAG_FLOAT => {
            let bytes = read_bytes(buf, pos, 8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&bytes);
            Ok(CanonicalValue::Float(f64::from_bits(u64::from_be_bytes(arr))))
        }
        _ => Err(CodecError::Schema(format!("unknown type tag {tag}"))),
    }
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    let bytes = read_bytes(buf, pos, 4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes);
    Ok(u32::from_be_bytes(arr))
}

fn read_bytes(buf: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>, CodecError> {
    let end = pos.checked_add(len).ok_or(CodecError::Truncated)?;
    let slice = buf.get(*pos..end).ok_or(CodecError::Truncated)?;
    *pos = end;
    Ok(slice.to_vec())
}

impl CanonicalValue {
    fn field_map(fields: Vec<(&str, CanonicalValue)>) -> CanonicalValue {
        CanonicalValue::Map(fields.into_iter().map(|(k, v)| (CanonicalValue::Text(k.to_string()), v)).collect())
    }

    fn as_map(&self) -> Option<&[(CanonicalValue, CanonicalValue)]> {
        match self {
            CanonicalValue::Map(pairs) => Some(pairs),
            _ => None,
        }
    }
}

fn map_field<'a>(pairs: &'a [(CanonicalValue, CanonicalValue)], name: &str) -> Option<&'a CanonicalValue> {
    pairs.iter().find_map(|(k, v)| match k {
        CanonicalValue::Text(s) if s == name => Some(v),
        _ => None,
    })
}

/// Encodes a `StorageEntry` as a replication event and checks the 300 KiB
/// cap before returning.
pub fn encode_change_event(entry: &StorageEntry) -> Result<Vec<u8>, CodecError> {
    let mut fields = vec![
        ("key", CanonicalValue::Text(entry.key.clone())),
        ("node_id", CanonicalValue::Text(entry.node_id.clone())),
        ("seq", CanonicalValue::Int(entry.seq)),
        ("timestamp_ms", CanonicalValue::Int(entry.timestamp_ms)),
        ("tombstone", CanonicalValue::Bool(entry.is_tombstone)),
    ];
    if !entry.is_tombstone {
        let value = entry
            .value
            .clone()
            .ok_or_else(|| CodecError::Schema("live entry missing a value".into()))?;
        fields.push(("value", CanonicalValue::Text(value)));
    }
    let encoded = encode(&CanonicalValue::field_map(fields));
    if encoded.len() > MAX_EVENT_BYTES {
        return Err(CodecError::PayloadTooLarge(encoded.len(), MAX_EVENT_BYTES));
    }
    Ok(encoded)
}

/// Decodes a replication event back into a `StorageEntry`, applying the same
/// size cap and schema checks as encoding.
pub fn decode_change_event(bytes: &[u8]) -> Result<StorageEntry, CodecError> {
    if bytes.len() > MAX_EVENT_BYTES {
        return Err(CodecError::PayloadTooLarge(bytes.len(), MAX_EVENT_BYTES));
    }
    let value = decode(bytes)?;
    let pairs = value.as_map().ok_or_else(|| CodecError::Schema("top-level value is not a map".into()))?;

    let key = match map_field(pairs, "key") {
        Some(CanonicalValue::Text(s)) => s.clone(),
        Some(_) => return Err(CodecError::Schema("key field has the wrong type".into())),
        None => return Err(CodecError::Schema("missing key field".into())),
    };
    let node_id = match map_field(pairs, "node_id") {
        Some(CanonicalValue::Text(s)) => s.clone(),
        Some(_) => return Err(CodecError::Schema("node_id field has the wrong type".into())),
        None => return Err(CodecError::Schema("missing node_id field".into())),
    };
    let seq = match map_field(pairs, "seq") {
        Some(CanonicalValue::Int(i)) => *i,
        Some(_) => return Err(CodecError::Schema("seq field has the wrong type".into())),
        None => return Err(CodecError::Schema("missing seq field".into())),
    };
    let timestamp_ms = match map_field(pairs, "timestamp_ms") {
        Some(CanonicalValue::Int(i)) => *i,
        Some(_) => return Err(CodecError::Schema("timestamp_ms field has the wrong type".into())),
        None => return Err(CodecError::Schema("missing timestamp_ms field".into())),
    };
    let is_tombstone = match map_field(pairs, "tombstone") {
        Some(CanonicalValue::Bool(b)) => *b,
        Some(_) => return Err(CodecError::Schema("tombstone field has the wrong type".into())),
        None => return Err(CodecError::Schema("missing tombstone field".into())),
    };
    let value_field = map_field(pairs, "value");

    if is_tombstone && value_field.is_some() {
        return Err(CodecError::TombstoneWithValue);
    }
    let value = if is_tombstone {
        None
    } else {
        match value_field {
            Some(CanonicalValue::Text(s)) => Some(s.clone()),
            Some(_) => return Err(CodecError::Schema("value field has the wrong type".into())),
            None => return Err(CodecError::Schema("missing value field for a non-tombstone event".into())),
        }
    };

    Ok(StorageEntry {
        key,
        value,
        timestamp_ms,
        node_id,
        seq,
        is_tombstone,
    })
}

/// Total order used only to keep `Map` encoding deterministic when two
/// `CanonicalValue`s of different variants would otherwise be incomparable;
/// not used outside this module.
impl PartialOrd for CanonicalValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(encode(self).cmp(&encode(other)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> StorageEntry {
        StorageEntry::live("user:1", "alice", 1_700_000_000_000, "node-a", 42)
    }

    #[test]
    fn encode_decode_round_trip_is_identity() {
        let entry = sample_entry();
        let encoded = encode_change_event(&entry).unwrap();
        let decoded = decode_change_event(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn tombstone_round_trips_without_a_value() {
        let entry = StorageEntry::tombstone("user:1", 1_700_000_000_000, "node-a", 43);
        let encoded = encode_change_event(&entry).unwrap();
        let decoded = decode_change_event(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn encoding_is_deterministic_regardless_of_struct_field_order() {
        // Two logically identical entries built through different code paths
        // must produce byte-identical encodings.
        let a = encode_change_event(&sample_entry()).unwrap();
        let b = encode_change_event(&sample_entry()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_rejects_missing_field() {
        let fields = vec![
            ("key", CanonicalValue::Text("k".into())),
            ("node_id", CanonicalValue::Text("n".into())),
            ("seq", CanonicalValue::Int(1)),
            // timestamp_ms missing
            ("tombstone", CanonicalValue::Bool(false)),
            ("value", CanonicalValue::Text("v".into())),
        ];
        let bytes = encode(&CanonicalValue::field_map(fields));
        assert!(matches!(decode_change_event(&bytes), Err(CodecError::Schema(_))));
    }

    #[test]
    fn decode_rejects_tombstone_with_value() {
        let fields = vec![
            ("key", CanonicalValue::Text("k".into())),
            ("node_id", CanonicalValue::Text("n".into())),
            ("seq", CanonicalValue::Int(1)),
            ("timestamp_ms", CanonicalValue::Int(1)),
            ("tombstone", CanonicalValue::Bool(true)),
            ("value", CanonicalValue::Text("should not be here".into())),
        ];
        let bytes = encode(&CanonicalValue::field_map(fields));
        assert_eq!(decode_change_event(&bytes), Err(CodecError::TombstoneWithValue));
    }

    #[test]
    fn decode_never_panics_on_fuzzed_bytes() {
        for seed in 0u8..=255 {
            let bytes: Vec<u8> = (0..32).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            let _ = decode_change_event(&bytes);
        }
    }

    #[test]
    fn payload_over_cap_is_rejected() {
        let huge_value = "x".repeat(MAX_EVENT_BYTES);
        let entry = StorageEntry::live("k", huge_value, 1, "n", 1);
        assert!(matches!(
            encode_change_event(&entry),
            Err(CodecError::PayloadTooLarge(_, _))
        ));
    }

    #[test]
    fn float_normalization_is_stable_for_nan_and_infinities() {
        let a = CanonicalValue::Float(f64::NAN);
        let b = CanonicalValue::Float(-f64::NAN);
        assert_eq!(encode(&a), encode(&b));
        let pos_inf = CanonicalValue::Float(f64::INFINITY);
        let also_pos_inf = CanonicalValue::Float(1.0 / 0.0);
        assert_eq!(encode(&pos_inf), encode(&also_pos_inf));
    }

    #[test]
    fn map_keys_are_sorted_by_encoded_bytes_regardless_of_insertion_order() {
        let m1 = CanonicalValue::Map(vec![
            (CanonicalValue::Text("b".into()), CanonicalValue::Int(2)),
            (CanonicalValue::Text("a".into()), CanonicalValue::Int(1)),
        ]);
        let m2 = CanonicalValue::Map(vec![
            (CanonicalValue::Text("a".into()), CanonicalValue::Int(1)),
            (CanonicalValue::Text("b".into()), CanonicalValue::Int(2)),
        ]);
        assert_eq!(encode(&m1), encode(&m2));
    }
}
