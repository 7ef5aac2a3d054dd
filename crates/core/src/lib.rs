//! Core types for pinstore
//!
//! This crate defines the foundational types used throughout the system:
//! - PropertyId, ClassId, PinId, PageId, PinAddr: identifiers
//! - Value / ValueType: typed property values
//! - Pin / PinRef: records and their compact stored locators
//! - IndexSeg / SearchKey: composite index columns and byte-comparable keys
//! - Condition: class predicates with evaluation and property DNF
//! - Timestamp: microsecond time used by retention windows
//! - Error: error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod expr;
pub mod key;
pub mod pin;
pub mod timestamp;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use expr::{Condition, EvalContext};
pub use key::{IndexSeg, SearchKey, SegFlags};
pub use pin::{Pin, PinRef, RefFlags};
pub use timestamp::Timestamp;
pub use types::{ClassId, PageId, PinAddr, PinId, PropertyId};
pub use value::{Value, ValueType};
