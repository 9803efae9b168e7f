//! Field descriptors.

use std::fmt;

use crate::{
    metadata::{flags::FieldAttributes, token::Token},
    typesystem::types::TypeId,
};

/// Identity of an interned field.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub(crate) u32);

impl FieldId {
    /// Arena index of this field.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldId({})", self.0)
    }
}

/// A field of a (possibly instantiated) type.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    /// Defining row
    pub token: Token,
    /// Owning type
    pub owner: TypeId,
    /// Field name
    pub name: String,
    /// Declared type, substituted with the owner's instantiation
    pub field_type: TypeId,
    /// Field attributes
    pub flags: FieldAttributes,
    /// Byte offset from `FieldLayout`, explicit layout only
    pub explicit_offset: Option<u32>,
    /// Carries `ThreadStaticAttribute`
    pub is_thread_static: bool,
}

impl FieldDesc {
    /// Stored per type rather than per instance.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }

    /// Compile-time constant without storage.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.flags.contains(FieldAttributes::LITERAL)
    }
}
