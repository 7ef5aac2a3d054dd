//! Class definitions and their persisted form
//!
//! A class is defined by a pin (its owner) carrying three reserved
//! properties:
//!
//! | Property | Contents |
//! |---|---|
//! | `CLASS_ID` | class id as an integer |
//! | `CLASS_SPEC` | `ClassSpec`, bincode-encoded |
//! | `INDEX_INFO` | `IndexDescriptor`: root, anchor, height, key format |
//!
//! `INDEX_INFO` is absent until the class's index tree is first written.

use crate::index_tree::ClassIndexTree;
use crate::registry::ClassRef;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use pinstore_core::{
    ClassId, Condition, Error, IndexSeg, PageId, Pin, PinId, PropertyId, Result, Value,
};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Definition flags of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClassFlags(u16);

impl ClassFlags {
    /// No flags
    pub const NONE: ClassFlags = ClassFlags(0);
    /// Maintain a membership list (implied by index segments)
    pub const INDEXED: ClassFlags = ClassFlags(0x1);
    /// Members carry access-control data
    pub const ACL: ClassFlags = ClassFlags(0x2);

    /// Raw bits
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub fn contains(&self, other: ClassFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets
    pub fn union(self, other: ClassFlags) -> ClassFlags {
        ClassFlags(self.0 | other.0)
    }
}

/// Retention window of a membership list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Window {
    /// Keep at most this many members
    Count(u32),
    /// Keep members whose timestamp is within `range_us` of now
    Interval {
        /// Window length in microseconds
        range_us: u64,
        /// Property holding the member's timestamp; insertion time if absent
        prop: Option<PropertyId>,
    },
}

/// Compiled class descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSpec {
    /// Optional display name
    pub name: Option<String>,
    /// Membership predicate
    pub cond: Condition,
    /// Definition flags
    pub flags: ClassFlags,
    /// Composite index columns; empty for membership-only classes
    pub segs: Vec<IndexSeg>,
    /// Retention window of the membership list
    pub window: Option<Window>,
    /// Class this one is derived from
    pub base: Option<ClassId>,
}

impl ClassSpec {
    /// Class with a predicate and nothing else
    pub fn new(cond: Condition) -> Self {
        Self {
            name: None,
            cond,
            flags: ClassFlags::NONE,
            segs: Vec::new(),
            window: None,
            base: None,
        }
    }

    /// Builder: set a name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder: maintain a membership list
    pub fn indexed(mut self) -> Self {
        self.flags = self.flags.union(ClassFlags::INDEXED);
        self
    }

    /// Builder: add flags
    pub fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Builder: append an index segment
    pub fn with_segment(mut self, seg: IndexSeg) -> Self {
        self.segs.push(seg);
        self
    }

    /// Builder: set a retention window
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    /// Builder: derive from `base`
    pub fn derived_from(mut self, base: ClassId) -> Self {
        self.base = Some(base);
        self
    }

    /// True if the class has index segments
    pub fn is_family(&self) -> bool {
        !self.segs.is_empty()
    }

    /// True if the class maintains an index or a membership list
    pub fn is_indexed(&self) -> bool {
        self.is_family() || self.flags.contains(ClassFlags::INDEXED)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.segs.len() > u16::MAX as usize {
            return Err(Error::invalid("too many index segments"));
        }
        if self.window.is_some() && self.is_family() {
            return Err(Error::invalid(
                "retention windows apply to membership lists only",
            ));
        }
        if let Some(Window::Count(0)) = self.window {
            return Err(Error::invalid("count window must hold at least one member"));
        }
        for seg in &self.segs {
            if seg.prop.is_reserved() {
                return Err(Error::invalid(format!(
                    "index segment on reserved property {}",
                    seg.prop
                )));
            }
        }
        Ok(())
    }

    /// Serialize for the owning pin
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the owning pin; `Corruption` on failure
    pub fn decode(cid: ClassId, bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Corruption {
            cid,
            reason: format!("class spec: {}", e),
        })
    }
}

/// Persisted placement of a class index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Current root page
    pub root: PageId,
    /// Page the tree is addressed by; fixed for the tree's lifetime
    pub anchor: PageId,
    /// Number of levels
    pub height: u16,
    /// Key format (see [`IndexSeg::encode_format`])
    pub format: Vec<u8>,
}

const DESCRIPTOR_VERSION: u8 = 1;

impl IndexDescriptor {
    /// Descriptor of a freshly created single-level tree
    pub fn new(anchor: PageId, format: Vec<u8>) -> Self {
        Self {
            root: anchor,
            anchor,
            height: 1,
            format,
        }
    }

    /// Fixed binary layout: version, root, anchor, height, format length, format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + self.format.len());
        buf.push(DESCRIPTOR_VERSION);
        // Writes into a Vec cannot fail
        let _ = buf.write_u32::<BigEndian>(self.root.0);
        let _ = buf.write_u32::<BigEndian>(self.anchor.0);
        let _ = buf.write_u16::<BigEndian>(self.height);
        let _ = buf.write_u16::<BigEndian>(self.format.len() as u16);
        buf.extend_from_slice(&self.format);
        buf
    }

    /// Decode; `Corruption` on any inconsistency
    pub fn decode(cid: ClassId, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| Error::Corruption {
            cid,
            reason: format!("index descriptor: {}", reason),
        };
        let mut cur = Cursor::new(bytes);
        let version = cur.read_u8().map_err(|_| corrupt("empty"))?;
        if version != DESCRIPTOR_VERSION {
            return Err(corrupt(&format!("unknown version {}", version)));
        }
        let mut fixed = || cur.read_u32::<BigEndian>().map_err(|_| corrupt("truncated"));
        let root = PageId(fixed()?);
        let anchor = PageId(fixed()?);
        let height = cur.read_u16::<BigEndian>().map_err(|_| corrupt("truncated"))?;
        let len = cur.read_u16::<BigEndian>().map_err(|_| corrupt("truncated"))? as usize;
        let mut format = vec![0u8; len];
        cur.read_exact(&mut format)
            .map_err(|_| corrupt("truncated key format"))?;
        if cur.position() as usize != bytes.len() {
            return Err(corrupt("trailing bytes"));
        }
        if height == 0 || !root.is_valid() || !anchor.is_valid() {
            return Err(corrupt("invalid placement"));
        }
        if height == 1 && root != anchor {
            return Err(corrupt("single-level tree rooted away from its anchor"));
        }
        Ok(Self {
            root,
            anchor,
            height,
            format,
        })
    }
}

/// Decoded, cached class
#[derive(Debug)]
pub struct Class {
    class_ref: Arc<ClassRef>,
    spec: ClassSpec,
    tree: Option<Arc<ClassIndexTree>>,
}

impl Class {
    pub(crate) fn new(
        class_ref: Arc<ClassRef>,
        spec: ClassSpec,
        tree: Option<Arc<ClassIndexTree>>,
    ) -> Self {
        Self {
            class_ref,
            spec,
            tree,
        }
    }

    /// Class id
    pub fn cid(&self) -> ClassId {
        self.class_ref.cid()
    }

    /// Pin the class is defined by
    pub fn owner(&self) -> PinId {
        self.class_ref.owner()
    }

    /// Registry entry
    pub fn class_ref(&self) -> &Arc<ClassRef> {
        &self.class_ref
    }

    /// Definition
    pub fn spec(&self) -> &ClassSpec {
        &self.spec
    }

    /// Index segments
    pub fn segments(&self) -> &[IndexSeg] {
        &self.spec.segs
    }

    /// Composite index tree; `None` for membership-only classes
    pub fn tree(&self) -> Option<&Arc<ClassIndexTree>> {
        self.tree.as_ref()
    }
}

/// Class handle plus approximate cardinality
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// The class
    pub class: Arc<Class>,
    /// Index entries or membership-list length; 0 for unindexed classes
    pub cardinality: usize,
    /// Whether the index build has committed
    pub materialized: bool,
}

/// Reserved properties of a class-defining pin
pub(crate) fn owner_properties(cid: ClassId, spec: &ClassSpec) -> Result<Vec<(PropertyId, Value)>> {
    Ok(vec![
        (PropertyId::CLASS_ID, Value::Int(cid.0 as i64)),
        (PropertyId::CLASS_SPEC, Value::Bytes(spec.encode()?)),
    ])
}

/// Class id and spec stored on a pin, if it defines a class
pub(crate) fn read_owner(pin: &Pin) -> Option<Result<(ClassId, ClassSpec)>> {
    let cid = match pin.get(PropertyId::CLASS_ID)?.as_int() {
        Some(id) if (0..=u32::MAX as i64).contains(&id) => ClassId(id as u32),
        _ => {
            return Some(Err(Error::Serialization(format!(
                "pin {} has a malformed class id",
                pin.id()
            ))))
        }
    };
    let spec = match pin.get(PropertyId::CLASS_SPEC) {
        Some(Value::Bytes(bytes)) => ClassSpec::decode(cid, bytes),
        _ => Err(Error::Corruption {
            cid,
            reason: "class spec missing".into(),
        }),
    };
    Some(spec.map(|s| (cid, s)))
}

/// Index descriptor stored on a class's owning pin
pub(crate) fn read_descriptor(cid: ClassId, pin: &Pin) -> Result<Option<IndexDescriptor>> {
    match pin.get(PropertyId::INDEX_INFO) {
        None => Ok(None),
        Some(Value::Bytes(bytes)) => IndexDescriptor::decode(cid, bytes).map(Some),
        Some(other) => Err(Error::Corruption {
            cid,
            reason: format!("index descriptor stored as {}", other.type_name()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinstore_core::{PinAddr, SegFlags, ValueType};

    const SIZE: PropertyId = PropertyId(301);

    #[test]
    fn test_spec_round_trips_through_bincode() {
        let spec = ClassSpec::new(Condition::Eq(PropertyId(300), "red".into()))
            .named("red things")
            .with_segment(IndexSeg::new(SIZE, ValueType::Int).with_flags(SegFlags::DESC));
        let bytes = spec.encode().unwrap();
        assert_eq!(ClassSpec::decode(ClassId(7), &bytes).unwrap(), spec);
    }

    #[test]
    fn test_spec_decode_failure_is_corruption() {
        let err = ClassSpec::decode(ClassId(7), &[0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Corruption { cid: ClassId(7), .. }));
    }

    #[test]
    fn test_spec_validation() {
        let family = ClassSpec::new(Condition::True).with_segment(IndexSeg::new(SIZE, ValueType::Int));
        assert!(family.validate().is_ok());
        assert!(family.clone().with_window(Window::Count(3)).validate().is_err());
        assert!(ClassSpec::new(Condition::True)
            .indexed()
            .with_window(Window::Count(0))
            .validate()
            .is_err());
        assert!(ClassSpec::new(Condition::True)
            .with_segment(IndexSeg::new(PropertyId::CLASS_ID, ValueType::Int))
            .validate()
            .is_err());
    }

    #[test]
    fn test_descriptor_layout() {
        let desc = IndexDescriptor {
            root: PageId(9),
            anchor: PageId(4),
            height: 3,
            format: vec![1, 2, 3],
        };
        let bytes = desc.encode();
        assert_eq!(bytes.len(), 1 + 4 + 4 + 2 + 2 + 3);
        assert_eq!(IndexDescriptor::decode(ClassId(1), &bytes).unwrap(), desc);
    }

    #[test]
    fn test_descriptor_corruption_detected() {
        let good = IndexDescriptor::new(PageId(4), vec![1]).encode();
        for bad in [
            Vec::new(),
            good[..5].to_vec(),
            [good.clone(), vec![0]].concat(),
            {
                let mut b = good.clone();
                b[0] = 99;
                b
            },
        ] {
            let err = IndexDescriptor::decode(ClassId(2), &bad).unwrap_err();
            assert!(matches!(err, Error::Corruption { cid: ClassId(2), .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_owner_pin_round_trip() {
        let spec = ClassSpec::new(Condition::Exists(SIZE)).indexed();
        let mut pin = Pin::new(PinId(1), PinAddr::new(PageId(0), 0));
        for (p, v) in owner_properties(ClassId(12), &spec).unwrap() {
            pin.set(p, v);
        }
        let (cid, decoded) = read_owner(&pin).unwrap().unwrap();
        assert_eq!(cid, ClassId(12));
        assert_eq!(decoded, spec);
        assert!(read_descriptor(cid, &pin).unwrap().is_none());

        pin.set(PropertyId::INDEX_INFO, Value::Int(3));
        assert!(read_descriptor(cid, &pin).is_err());
        let plain = Pin::new(PinId(2), PinAddr::new(PageId(0), 1));
        assert!(read_owner(&plain).is_none());
    }
}
