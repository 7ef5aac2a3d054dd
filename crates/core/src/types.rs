//! Core identifier types for pinstore
//!
//! This module defines the foundational identifiers:
//! - PropertyId: identifies a typed property of a pin
//! - ClassId: identifies a registered class (predicate)
//! - PinId: identifies a pin; assigned monotonically by the pin store
//! - PageId: identifies a page handed out by the page allocator
//! - PinAddr: physical location of a pin (page + slot)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a pin property
///
/// Property ids order the keys of every property set handled by the
/// classifier; clauses and pin property lists are always sorted by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

impl PropertyId {
    /// First id available to user properties; lower ids are reserved
    pub const FIRST_USER: PropertyId = PropertyId(256);

    /// Class id stored on a class-defining pin
    pub const CLASS_ID: PropertyId = PropertyId(1);
    /// Serialized `ClassSpec` stored on a class-defining pin
    pub const CLASS_SPEC: PropertyId = PropertyId(2);
    /// Binary index descriptor (root/anchor/height/format)
    pub const INDEX_INFO: PropertyId = PropertyId(3);

    /// Check whether this id belongs to the reserved range
    pub fn is_reserved(&self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifier of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Big-endian bytes, used as the class map key
    pub fn to_key(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinId(pub u64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pin:{}", self.0)
    }
}

/// Identifier of a storage page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel for "no page"; never handed out by the allocator
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Check that the id is not the sentinel
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Physical address of a pin
///
/// A pin keeps its `PinId` forever but may migrate between pages when it
/// grows; index entries carry the address so migration rewrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinAddr {
    /// Page holding the pin
    pub page: PageId,
    /// Slot within the page
    pub slot: u16,
}

impl PinAddr {
    /// Create an address
    pub fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }
}

impl fmt::Display for PinAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page.0, self.slot)
    }
}
