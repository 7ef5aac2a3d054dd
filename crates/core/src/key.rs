//! Index segments and composite search keys
//!
//! An `IndexSeg` describes one column of a class index: which property it
//! reads, the type values are converted to, and ordering flags. A
//! `SearchKey` is the composite key built from one value per segment.
//!
//! ## Key Encoding
//!
//! Keys are stored in a byte-comparable form so the tree orders them with a
//! plain byte comparison. Each part starts with a tag:
//!
//! - `0x00` null, ordered first
//! - `0x01` value
//! - `0xFF` null, ordered last
//!
//! Value bytes follow the tag: sign-flipped big-endian integers, IEEE
//! floats with the usual sign transform, and zero-escaped strings/bytes
//! (`0x00` becomes `0x00 0xFF`, terminated by `0x00 0x00`). Descending
//! segments invert the value bytes.

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;
use crate::types::{PinId, PropertyId};
use crate::value::{Value, ValueType};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::io::Cursor;

const TAG_NULL_FIRST: u8 = 0x00;
const TAG_VALUE: u8 = 0x01;
const TAG_NULL_LAST: u8 = 0xFF;

/// Ordering and prefix flags of an index segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SegFlags(u8);

impl SegFlags {
    /// Ascending, nulls not indexed
    pub const NONE: SegFlags = SegFlags(0);
    /// Descending order
    pub const DESC: SegFlags = SegFlags(0x01);
    /// Index absent values as a null sentinel ordered before all values
    pub const NULLS_FIRST: SegFlags = SegFlags(0x02);
    /// Index absent values as a null sentinel ordered after all values
    pub const NULLS_LAST: SegFlags = SegFlags(0x04);
    /// Only the first `prefix_len` bytes of strings/bytes are indexed
    pub const PREFIX: SegFlags = SegFlags(0x08);

    /// Raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Build from raw bits
    pub fn from_bits(bits: u8) -> Self {
        SegFlags(bits)
    }

    /// Check whether all bits of `other` are set
    pub fn contains(&self, other: SegFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    pub fn union(self, other: SegFlags) -> SegFlags {
        SegFlags(self.0 | other.0)
    }
}

/// Descriptor of one composite-key column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSeg {
    /// Property the segment reads
    pub prop: PropertyId,
    /// Type values are converted to
    pub ty: ValueType,
    /// Ordering/prefix flags
    pub flags: SegFlags,
    /// Prefix length in bytes when `PREFIX` is set
    pub prefix_len: u16,
}

impl IndexSeg {
    /// Ascending segment without null ordering
    pub fn new(prop: PropertyId, ty: ValueType) -> Self {
        Self {
            prop,
            ty,
            flags: SegFlags::NONE,
            prefix_len: 0,
        }
    }

    /// Builder: add flags
    pub fn with_flags(mut self, flags: SegFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Builder: index only a prefix of string/bytes values
    pub fn with_prefix(mut self, len: u16) -> Self {
        self.flags = self.flags.union(SegFlags::PREFIX);
        self.prefix_len = len;
        self
    }

    /// True if absent values are indexed as a null sentinel
    pub fn orders_nulls(&self) -> bool {
        self.flags.contains(SegFlags::NULLS_FIRST) || self.flags.contains(SegFlags::NULLS_LAST)
    }

    fn null_tag(&self) -> u8 {
        if self.flags.contains(SegFlags::NULLS_LAST) {
            TAG_NULL_LAST
        } else {
            TAG_NULL_FIRST
        }
    }

    /// Convert a value to this segment's type
    pub fn convert(&self, value: &Value) -> Result<Value> {
        let mismatch = || Error::TypeMismatch {
            expected: self.ty.name(),
            actual: value.type_name(),
        };
        let v = match (self.ty, value) {
            (ValueType::Bool, Value::Bool(b)) => Value::Bool(*b),
            (ValueType::Int, Value::Int(i)) => Value::Int(*i),
            (ValueType::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Value::Int(*f as i64)
            }
            (ValueType::Int, Value::Timestamp(t)) => Value::Int(t.as_micros() as i64),
            (ValueType::Float, Value::Float(f)) if !f.is_nan() => Value::Float(*f),
            (ValueType::Float, Value::Int(i)) => Value::Float(*i as f64),
            (ValueType::String, Value::String(s)) => Value::String(self.truncate_str(s)),
            (ValueType::Bytes, Value::Bytes(b)) => Value::Bytes(self.truncate_bytes(b)),
            (ValueType::Bytes, Value::String(s)) => Value::Bytes(self.truncate_bytes(s.as_bytes())),
            (ValueType::Timestamp, v) => Value::Timestamp(v.as_timestamp().ok_or_else(mismatch)?),
            (ValueType::Ref, Value::Ref(id)) => Value::Ref(*id),
            _ => return Err(mismatch()),
        };
        Ok(v)
    }

    fn prefix(&self) -> Option<usize> {
        if self.flags.contains(SegFlags::PREFIX) && self.prefix_len > 0 {
            Some(self.prefix_len as usize)
        } else {
            None
        }
    }

    fn truncate_str(&self, s: &str) -> String {
        match self.prefix() {
            Some(mut n) if n < s.len() => {
                while !s.is_char_boundary(n) {
                    n -= 1;
                }
                s[..n].to_string()
            }
            _ => s.to_string(),
        }
    }

    fn truncate_bytes(&self, b: &[u8]) -> Vec<u8> {
        match self.prefix() {
            Some(n) if n < b.len() => b[..n].to_vec(),
            _ => b.to_vec(),
        }
    }

    /// Key-format descriptor of a segment list
    pub fn encode_format(segs: &[IndexSeg]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + segs.len() * 8);
        let _ = buf.write_u16::<BigEndian>(segs.len() as u16);
        for seg in segs {
            let _ = buf.write_u32::<BigEndian>(seg.prop.0);
            buf.push(seg.ty.as_byte());
            buf.push(seg.flags.bits());
            let _ = buf.write_u16::<BigEndian>(seg.prefix_len);
        }
        buf
    }

    /// Inverse of [`IndexSeg::encode_format`]
    pub fn decode_format(bytes: &[u8]) -> Result<Vec<IndexSeg>> {
        let bad = |what: &str| Error::Serialization(format!("key format: {}", what));
        let mut cur = Cursor::new(bytes);
        let n = cur.read_u16::<BigEndian>().map_err(|_| bad("truncated"))? as usize;
        let mut segs = Vec::with_capacity(n);
        for _ in 0..n {
            let prop = cur.read_u32::<BigEndian>().map_err(|_| bad("truncated"))?;
            let ty = ValueType::from_byte(cur.read_u8().map_err(|_| bad("truncated"))?)
                .ok_or_else(|| bad("unknown value type"))?;
            let flags = SegFlags::from_bits(cur.read_u8().map_err(|_| bad("truncated"))?);
            let prefix_len = cur.read_u16::<BigEndian>().map_err(|_| bad("truncated"))?;
            segs.push(IndexSeg {
                prop: PropertyId(prop),
                ty,
                flags,
                prefix_len,
            });
        }
        if cur.position() as usize != bytes.len() {
            return Err(bad("trailing bytes"));
        }
        Ok(segs)
    }
}

/// Typed, possibly multi-segment index key in byte-comparable form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchKey {
    bytes: SmallVec<[u8; 32]>,
    nsegs: u16,
    has_nulls: bool,
}

impl SearchKey {
    /// Build a key from one optional value per segment
    ///
    /// Returns `Ok(None)` when the tuple is not indexable: every part is
    /// null, or a part is null for a segment that does not order nulls.
    /// Returns `TypeMismatch` when a value cannot be converted to its
    /// segment's type.
    pub fn build(segs: &[IndexSeg], values: &[Option<&Value>]) -> Result<Option<SearchKey>> {
        if segs.len() != values.len() || segs.is_empty() {
            return Err(Error::invalid(format!(
                "{} values for {} key segments",
                values.len(),
                segs.len()
            )));
        }
        let mut bytes = SmallVec::new();
        let mut nulls = 0;
        for (seg, value) in segs.iter().zip(values) {
            match value {
                None | Some(Value::Null) => {
                    if !seg.orders_nulls() {
                        return Ok(None);
                    }
                    nulls += 1;
                    bytes.push(seg.null_tag());
                }
                Some(v) => {
                    let converted = seg.convert(v)?;
                    bytes.push(TAG_VALUE);
                    let start = bytes.len();
                    encode_value(&mut bytes, &converted);
                    if seg.flags.contains(SegFlags::DESC) {
                        for b in &mut bytes[start..] {
                            *b = !*b;
                        }
                    }
                }
            }
        }
        if nulls == segs.len() {
            return Ok(None);
        }
        Ok(Some(SearchKey {
            bytes,
            nsegs: segs.len() as u16,
            has_nulls: nulls > 0,
        }))
    }

    /// Build a single-segment key
    pub fn single(seg: &IndexSeg, value: &Value) -> Result<Option<SearchKey>> {
        Self::build(std::slice::from_ref(seg), &[Some(value)])
    }

    /// Rehydrate a key from stored bytes
    pub fn from_bytes(bytes: &[u8], segs: &[IndexSeg]) -> Result<SearchKey> {
        let key = SearchKey {
            bytes: SmallVec::from_slice(bytes),
            nsegs: segs.len() as u16,
            has_nulls: false,
        };
        let parts = key.decode(segs)?;
        Ok(SearchKey {
            has_nulls: parts.iter().any(Value::is_null),
            ..key
        })
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.nsegs as usize
    }

    /// True if at least one part is a null sentinel
    pub fn has_nulls(&self) -> bool {
        self.has_nulls
    }

    /// Decode the key back into one value per segment (`Null` for sentinels)
    pub fn decode(&self, segs: &[IndexSeg]) -> Result<Vec<Value>> {
        let bad = || Error::Serialization("malformed search key".to_string());
        let mut out = Vec::with_capacity(segs.len());
        let mut pos = 0;
        for seg in segs {
            let tag = *self.bytes.get(pos).ok_or_else(bad)?;
            pos += 1;
            if tag != TAG_VALUE {
                out.push(Value::Null);
                continue;
            }
            let desc = seg.flags.contains(SegFlags::DESC);
            let rest: Vec<u8> = if desc {
                self.bytes[pos..].iter().map(|b| !*b).collect()
            } else {
                self.bytes[pos..].to_vec()
            };
            let (v, used) = decode_value(seg.ty, &rest).ok_or_else(bad)?;
            out.push(v);
            pos += used;
        }
        if pos != self.bytes.len() {
            return Err(bad());
        }
        Ok(out)
    }
}

fn encode_escaped(buf: &mut SmallVec<[u8; 32]>, data: &[u8]) {
    for b in data {
        buf.push(*b);
        if *b == 0 {
            buf.push(0xFF);
        }
    }
    buf.push(0);
    buf.push(0);
}

fn encode_value(buf: &mut SmallVec<[u8; 32]>, v: &Value) {
    match v {
        Value::Bool(b) => buf.push(*b as u8),
        Value::Int(i) => buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes()),
        Value::Float(f) => {
            let bits = f.to_bits();
            let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::Timestamp(t) => buf.extend_from_slice(&t.to_be_bytes()),
        Value::Ref(id) => buf.extend_from_slice(&id.0.to_be_bytes()),
        Value::String(s) => encode_escaped(buf, s.as_bytes()),
        Value::Bytes(b) => encode_escaped(buf, b),
        // convert() never yields these
        Value::Null | Value::Array(_) => {}
    }
}

fn decode_escaped(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let b = *data.get(i)?;
        if b == 0 {
            match *data.get(i + 1)? {
                0x00 => return Some((out, i + 2)),
                0xFF => {
                    out.push(0);
                    i += 2;
                }
                _ => return None,
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
}

fn read_u64(data: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn decode_value(ty: ValueType, data: &[u8]) -> Option<(Value, usize)> {
    match ty {
        ValueType::Bool => Some((Value::Bool(*data.first()? != 0), 1)),
        ValueType::Int => Some((Value::Int((read_u64(data)? ^ (1 << 63)) as i64), 8)),
        ValueType::Float => {
            let ordered = read_u64(data)?;
            let bits = if ordered >> 63 == 1 {
                ordered ^ (1 << 63)
            } else {
                !ordered
            };
            Some((Value::Float(f64::from_bits(bits)), 8))
        }
        ValueType::Timestamp => Some((Value::Timestamp(Timestamp::from_micros(read_u64(data)?)), 8)),
        ValueType::Ref => Some((Value::Ref(PinId(read_u64(data)?)), 8)),
        ValueType::String => {
            let (raw, used) = decode_escaped(data)?;
            Some((Value::String(String::from_utf8(raw).ok()?), used))
        }
        ValueType::Bytes => {
            let (raw, used) = decode_escaped(data)?;
            Some((Value::Bytes(raw), used))
        }
    }
}
