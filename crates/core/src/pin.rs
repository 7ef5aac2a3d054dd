//! Pins and pin references
//!
//! A `Pin` is the unit of storage: an id, a physical address and a set of
//! typed properties. A `PinRef` is the compact locator written into class
//! indices as the stored value.
//!
//! ## PinRef Encoding
//!
//! ```text
//! +---------+------------------+---------+-----------------+----------+---------+
//! | id_len  | id (big-endian,  | pg_len  | page (BE,       | slot u16 | flags   |
//! | 1 byte  | minimal bytes)   | 1 byte  | minimal bytes)  | BE       | 1 byte  |
//! +---------+------------------+---------+-----------------+----------+---------+
//! ```
//!
//! Length-prefixed minimal big-endian integers compare bytewise in numeric
//! order, so encoded refs sort by pin id. Count windows rely on this.

use crate::error::{Error, Result};
use crate::types::{PageId, PinAddr, PinId, PropertyId};
use crate::value::Value;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Flags carried by a stored pin reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RefFlags(u8);

impl RefFlags {
    /// No flags
    pub const NONE: RefFlags = RefFlags(0);
    /// Key was produced from one element of a collection
    pub const COLL_ELEMENT: RefFlags = RefFlags(0x01);
    /// Pin is hidden from regular queries
    pub const HIDDEN: RefFlags = RefFlags(0x02);
    /// Pin is a special (class-defining, system) pin
    pub const SPECIAL: RefFlags = RefFlags(0x04);

    /// Raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Build from raw bits
    pub fn from_bits(bits: u8) -> Self {
        RefFlags(bits)
    }

    /// Check whether all bits of `other` are set
    pub fn contains(&self, other: RefFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    pub fn union(self, other: RefFlags) -> RefFlags {
        RefFlags(self.0 | other.0)
    }
}

/// Compact locator of an indexed pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinRef {
    /// Pin identity
    pub id: PinId,
    /// Physical address at the time the entry was written
    pub addr: PinAddr,
    /// Entry flags
    pub flags: RefFlags,
}

fn write_minimal(buf: &mut Vec<u8>, v: u64) {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.push((8 - skip) as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

fn read_minimal(cur: &mut Cursor<&[u8]>, max: usize) -> Result<u64> {
    let len = cur.read_u8().map_err(truncated)? as usize;
    if len > max {
        return Err(Error::Serialization(format!(
            "integer length {} exceeds {}",
            len, max
        )));
    }
    let mut v = 0u64;
    for _ in 0..len {
        v = (v << 8) | cur.read_u8().map_err(truncated)? as u64;
    }
    Ok(v)
}

fn truncated(_: std::io::Error) -> Error {
    Error::Serialization("truncated pin reference".to_string())
}

impl PinRef {
    /// Create a reference
    pub fn new(id: PinId, addr: PinAddr, flags: RefFlags) -> Self {
        Self { id, addr, flags }
    }

    /// Same reference with additional flags
    pub fn with_flags(self, flags: RefFlags) -> Self {
        Self {
            flags: self.flags.union(flags),
            ..self
        }
    }

    /// Append the encoding of this reference to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_minimal(buf, self.id.0);
        write_minimal(buf, self.addr.page.0 as u64);
        // Writes into a Vec cannot fail
        let _ = buf.write_u16::<BigEndian>(self.addr.slot);
        buf.push(self.flags.bits());
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        self.encode_into(&mut buf);
        buf
    }

    /// Decode a reference from the front of `bytes`
    ///
    /// Returns the reference and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(PinRef, usize)> {
        let mut cur = Cursor::new(bytes);
        let id = read_minimal(&mut cur, 8)?;
        let page = read_minimal(&mut cur, 4)? as u32;
        let slot = cur.read_u16::<BigEndian>().map_err(truncated)?;
        let flags = RefFlags::from_bits(cur.read_u8().map_err(truncated)?);
        let r = PinRef::new(PinId(id), PinAddr::new(PageId(page), slot), flags);
        Ok((r, cur.position() as usize))
    }

    /// Decode a buffer that must contain exactly one reference
    pub fn decode_exact(bytes: &[u8]) -> Result<PinRef> {
        let (r, used) = Self::decode(bytes)?;
        if used != bytes.len() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after pin reference",
                bytes.len() - used
            )));
        }
        Ok(r)
    }
}

/// A semi-structured record with typed properties
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    id: PinId,
    addr: PinAddr,
    props: BTreeMap<PropertyId, Value>,
    flags: RefFlags,
    deleted: bool,
    partial: bool,
}

impl Pin {
    /// Create an empty pin
    pub fn new(id: PinId, addr: PinAddr) -> Self {
        Self {
            id,
            addr,
            props: BTreeMap::new(),
            flags: RefFlags::NONE,
            deleted: false,
            partial: false,
        }
    }

    /// Builder: set a property
    pub fn with(mut self, prop: PropertyId, value: impl Into<Value>) -> Self {
        self.set(prop, value.into());
        self
    }

    /// Builder: set pin flags
    pub fn with_flags(mut self, flags: RefFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Pin id
    pub fn id(&self) -> PinId {
        self.id
    }

    /// Current address
    pub fn addr(&self) -> PinAddr {
        self.addr
    }

    /// Move the pin to a new address
    pub fn set_addr(&mut self, addr: PinAddr) {
        self.addr = addr;
    }

    /// Pin flags
    pub fn flags(&self) -> RefFlags {
        self.flags
    }

    /// Get a property value
    pub fn get(&self, prop: PropertyId) -> Option<&Value> {
        self.props.get(&prop)
    }

    /// Set a property; setting `Null` removes it
    pub fn set(&mut self, prop: PropertyId, value: Value) -> Option<Value> {
        if value.is_null() {
            self.props.remove(&prop)
        } else {
            self.props.insert(prop, value)
        }
    }

    /// Remove a property
    pub fn remove(&mut self, prop: PropertyId) -> Option<Value> {
        self.props.remove(&prop)
    }

    /// Property ids in ascending order
    pub fn property_ids(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.props.keys().copied()
    }

    /// Properties in ascending id order
    pub fn properties(&self) -> impl Iterator<Item = (PropertyId, &Value)> + '_ {
        self.props.iter().map(|(k, v)| (*k, v))
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Check if the pin has no properties
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Tombstone flag
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Mark or unmark as deleted
    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    /// True if this is a projection holding only some properties
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Projection of this pin onto `props`
    pub fn project(&self, props: &[PropertyId]) -> Pin {
        let mut out = Pin::new(self.id, self.addr).with_flags(self.flags);
        for p in props {
            if let Some(v) = self.props.get(p) {
                out.props.insert(*p, v.clone());
            }
        }
        out.partial = true;
        out
    }

    /// Reference to this pin at its current address
    pub fn to_ref(&self) -> PinRef {
        PinRef::new(self.id, self.addr, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(page: u32, slot: u16) -> PinAddr {
        PinAddr::new(PageId(page), slot)
    }

    #[test]
    fn test_ref_roundtrip() {
        let r = PinRef::new(PinId(0x1234_5678_9a), addr(70_000, 3), RefFlags::COLL_ELEMENT);
        let bytes = r.encode();
        assert_eq!(PinRef::decode_exact(&bytes).unwrap(), r);
    }

    #[test]
    fn test_ref_is_compact() {
        let r = PinRef::new(PinId(5), addr(1, 0), RefFlags::NONE);
        // 2 (id) + 2 (page) + 2 (slot) + 1 (flags)
        assert_eq!(r.encode().len(), 7);
        let zero = PinRef::new(PinId(0), addr(0, 0), RefFlags::NONE);
        assert_eq!(zero.encode().len(), 5);
    }

    #[test]
    fn test_ref_encoding_sorts_by_id() {
        let ids = [0u64, 1, 255, 256, 65_535, 65_536, u64::MAX];
        let encoded: Vec<Vec<u8>> = ids
            .iter()
            .map(|id| PinRef::new(PinId(*id), addr(9, 9), RefFlags::NONE).encode())
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_ref_decode_truncated() {
        let bytes = PinRef::new(PinId(300), addr(2, 1), RefFlags::HIDDEN).encode();
        assert!(PinRef::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut long = bytes.clone();
        long.push(0);
        assert!(PinRef::decode_exact(&long).is_err());
        let (_, used) = PinRef::decode(&long).unwrap();
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_flags() {
        let f = RefFlags::COLL_ELEMENT.union(RefFlags::SPECIAL);
        assert!(f.contains(RefFlags::COLL_ELEMENT));
        assert!(f.contains(RefFlags::SPECIAL));
        assert!(!f.contains(RefFlags::HIDDEN));
    }

    #[test]
    fn test_set_null_removes() {
        let mut pin = Pin::new(PinId(1), addr(0, 0)).with(PropertyId(300), 4);
        assert_eq!(pin.len(), 1);
        pin.set(PropertyId(300), Value::Null);
        assert!(pin.is_empty());
    }

    #[test]
    fn test_project() {
        let pin = Pin::new(PinId(1), addr(0, 0))
            .with(PropertyId(300), 1)
            .with(PropertyId(301), 2)
            .with(PropertyId(302), 3);
        let p = pin.project(&[PropertyId(301), PropertyId(999)]);
        assert!(p.is_partial());
        assert_eq!(p.property_ids().collect::<Vec<_>>(), vec![PropertyId(301)]);
        assert_eq!(p.to_ref(), pin.to_ref());
    }
}
