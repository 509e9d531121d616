//! Template building for remote calls.
//!
//! This module turns desired configuration into the two payload formats the
//! API accepts:
//! - attribute-per-line blocks (`KEY="VALUE"`) for network and update calls
//! - structured markup for allocate calls with nested sub-entities

mod attributes;
mod markup;

pub use attributes::{
    address_range, address_range_update, lease, reservation, AttributeTemplate, VectorAttribute,
};
pub use markup::{decode_string_map, encode_string_map, Element, MarkupBuilder};

use crate::one::Value;

/// How an update call applies a template fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace the whole template.
    Replace,
    /// Merge the fragment into the existing template.
    Merge,
}

impl UpdateMode {
    /// Returns the wire code (`0` replace, `1` merge).
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Replace => 0,
            Self::Merge => 1,
        }
    }
}

impl From<UpdateMode> for Value {
    fn from(mode: UpdateMode) -> Self {
        Self::Int(mode.code())
    }
}
