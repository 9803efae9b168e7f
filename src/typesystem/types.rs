//! Type descriptors and the structural keys they are interned under.

use std::{fmt, sync::OnceLock};

use crate::{
    metadata::{flags::TypeAttributes, token::Token},
    typesystem::{fields::FieldId, layout::TypeLayout, methods::MethodId, signature::MethodSignature},
};

/// Identity of an interned type. Two equal ids always denote the same type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    /// Arena index of this type.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// The primitive types of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveKind {
    /// `System.Void`
    Void,
    /// `System.Boolean`
    Boolean,
    /// `System.Char`
    Char,
    /// `System.SByte`
    I1,
    /// `System.Byte`
    U1,
    /// `System.Int16`
    I2,
    /// `System.UInt16`
    U2,
    /// `System.Int32`
    I4,
    /// `System.UInt32`
    U4,
    /// `System.Int64`
    I8,
    /// `System.UInt64`
    U8,
    /// `System.Single`
    R4,
    /// `System.Double`
    R8,
    /// `System.IntPtr`
    I,
    /// `System.UIntPtr`
    U,
}

impl PrimitiveKind {
    /// All primitive kinds.
    pub const ALL: [PrimitiveKind; 15] = [
        PrimitiveKind::Void,
        PrimitiveKind::Boolean,
        PrimitiveKind::Char,
        PrimitiveKind::I1,
        PrimitiveKind::U1,
        PrimitiveKind::I2,
        PrimitiveKind::U2,
        PrimitiveKind::I4,
        PrimitiveKind::U4,
        PrimitiveKind::I8,
        PrimitiveKind::U8,
        PrimitiveKind::R4,
        PrimitiveKind::R8,
        PrimitiveKind::I,
        PrimitiveKind::U,
    ];

    /// Name of the `System` type backing this primitive.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            PrimitiveKind::Void => "Void",
            PrimitiveKind::Boolean => "Boolean",
            PrimitiveKind::Char => "Char",
            PrimitiveKind::I1 => "SByte",
            PrimitiveKind::U1 => "Byte",
            PrimitiveKind::I2 => "Int16",
            PrimitiveKind::U2 => "UInt16",
            PrimitiveKind::I4 => "Int32",
            PrimitiveKind::U4 => "UInt32",
            PrimitiveKind::I8 => "Int64",
            PrimitiveKind::U8 => "UInt64",
            PrimitiveKind::R4 => "Single",
            PrimitiveKind::R8 => "Double",
            PrimitiveKind::I => "IntPtr",
            PrimitiveKind::U => "UIntPtr",
        }
    }

    /// Reverse of [`PrimitiveKind::type_name`].
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        PrimitiveKind::ALL.into_iter().find(|kind| kind.type_name() == name)
    }

    /// Storage size in bytes.
    #[must_use]
    pub fn size(self, pointer_size: u32) -> u32 {
        match self {
            PrimitiveKind::Void => 0,
            PrimitiveKind::Boolean | PrimitiveKind::I1 | PrimitiveKind::U1 => 1,
            PrimitiveKind::Char | PrimitiveKind::I2 | PrimitiveKind::U2 => 2,
            PrimitiveKind::I4 | PrimitiveKind::U4 | PrimitiveKind::R4 => 4,
            PrimitiveKind::I8 | PrimitiveKind::U8 | PrimitiveKind::R8 => 8,
            PrimitiveKind::I | PrimitiveKind::U => pointer_size,
        }
    }

    /// `true` for the signed and unsigned integer kinds, including `Boolean` and `Char`.
    #[must_use]
    pub fn is_integer(self) -> bool {
        !matches!(self, PrimitiveKind::Void | PrimitiveKind::R4 | PrimitiveKind::R8)
    }

    /// `true` for the unsigned integer kinds, including `Boolean` and `Char`.
    #[must_use]
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Boolean
                | PrimitiveKind::Char
                | PrimitiveKind::U1
                | PrimitiveKind::U2
                | PrimitiveKind::U4
                | PrimitiveKind::U8
                | PrimitiveKind::U
        )
    }

    /// `true` for `Single` and `Double`.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::R4 | PrimitiveKind::R8)
    }
}

/// Owner of a generic parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericParameterKind {
    /// `!n`, declared on a type
    Type,
    /// `!!n`, declared on a method
    Method,
}

/// Structural identity of a type. Two types with equal keys are the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// A primitive value type
    Primitive(PrimitiveKind),
    /// A `TypeDef`, optionally instantiated; an empty instantiation on a generic definition
    /// denotes the open definition
    Definition(Token, Vec<TypeId>),
    /// Single-dimensional zero-based array
    SzArray(TypeId),
    /// Multi-dimensional array of the given rank
    Array(TypeId, u32),
    /// Unmanaged pointer
    Pointer(TypeId),
    /// Managed reference
    ByRef(TypeId),
    /// Function pointer
    FunctionPointer(MethodSignature),
    /// Unresolved generic parameter
    GenericParameter(GenericParameterKind, u32),
    /// The universal canonical placeholder standing in for any type argument
    UniversalCanon,
}

/// Broad classification driving layout, dispatch and method-table shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    /// Primitive value type
    Primitive,
    /// Reference type other than string, array or delegate
    Class,
    /// `System.String`
    String,
    /// User value type
    ValueType,
    /// Value type deriving from `System.Enum`
    Enum,
    /// Interface
    Interface,
    /// Type deriving from `System.MulticastDelegate`
    Delegate,
    /// Single-dimensional or multi-dimensional array
    Array,
    /// Unmanaged pointer
    Pointer,
    /// Managed reference
    ByRef,
    /// Function pointer
    FunctionPointer,
    /// Generic parameter or canonical placeholder
    GenericParameter,
}

/// Field layout mode of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayoutKind {
    /// Runtime chooses, lowered like sequential
    #[default]
    Auto,
    /// Declaration order with natural alignment
    Sequential,
    /// Offsets given by metadata, fields may overlap
    Explicit,
}

/// A canonical managed type.
///
/// Descriptors are immutable once created; the lazily computed parts (base type, fields,
/// layout, virtual slots) are filled once on first query and never change afterwards.
pub struct TypeDesc {
    /// Structural identity
    pub key: TypeKey,
    /// Classification
    pub category: TypeCategory,
    /// Namespace, empty for constructed types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Definition flags, empty for constructed types
    pub flags: TypeAttributes,
    /// Layout mode
    pub layout_kind: LayoutKind,
    pub(crate) base: OnceLock<Option<TypeId>>,
    pub(crate) fields: OnceLock<Vec<FieldId>>,
    pub(crate) layout: OnceLock<TypeLayout>,
    pub(crate) vtable: OnceLock<Vec<MethodId>>,
    pub(crate) methods: OnceLock<Vec<MethodId>>,
    pub(crate) mangled: OnceLock<String>,
}

impl TypeDesc {
    pub(crate) fn new(
        key: TypeKey,
        category: TypeCategory,
        namespace: String,
        name: String,
        flags: TypeAttributes,
        layout_kind: LayoutKind,
    ) -> Self {
        TypeDesc {
            key,
            category,
            namespace,
            name,
            flags,
            layout_kind,
            base: OnceLock::new(),
            fields: OnceLock::new(),
            layout: OnceLock::new(),
            vtable: OnceLock::new(),
            methods: OnceLock::new(),
            mangled: OnceLock::new(),
        }
    }

    /// `true` for primitive, enum and user value types.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        matches!(
            self.category,
            TypeCategory::Primitive | TypeCategory::ValueType | TypeCategory::Enum
        )
    }

    /// `true` if a value of this type is a GC-tracked object reference.
    #[must_use]
    pub fn is_gc_pointer(&self) -> bool {
        matches!(
            self.category,
            TypeCategory::Class
                | TypeCategory::String
                | TypeCategory::Interface
                | TypeCategory::Delegate
                | TypeCategory::Array
        )
    }

    /// `true` for single- and multi-dimensional arrays.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self.key, TypeKey::SzArray(_) | TypeKey::Array(..))
    }

    /// `true` for interfaces.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.category == TypeCategory::Interface
    }

    /// The primitive kind, if this is a primitive.
    #[must_use]
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self.key {
            TypeKey::Primitive(kind) => Some(kind),
            _ => None,
        }
    }

    /// Element type of arrays, pointers and by-refs.
    #[must_use]
    pub fn element_type(&self) -> Option<TypeId> {
        match self.key {
            TypeKey::SzArray(element)
            | TypeKey::Array(element, _)
            | TypeKey::Pointer(element)
            | TypeKey::ByRef(element) => Some(element),
            _ => None,
        }
    }

    /// Array rank; 1 for single-dimensional arrays, 0 for non-arrays.
    #[must_use]
    pub fn rank(&self) -> u32 {
        match self.key {
            TypeKey::SzArray(_) => 1,
            TypeKey::Array(_, rank) => rank,
            _ => 0,
        }
    }

    /// The defining token, for definitions and their instantiations.
    #[must_use]
    pub fn definition_token(&self) -> Option<Token> {
        match self.key {
            TypeKey::Definition(token, _) => Some(token),
            _ => None,
        }
    }

    /// Type arguments of an instantiated generic type.
    #[must_use]
    pub fn instantiation(&self) -> &[TypeId] {
        match &self.key {
            TypeKey::Definition(_, args) => args,
            _ => &[],
        }
    }

    /// `Namespace.Name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// `true` if this is `namespace.name`.
    #[must_use]
    pub fn is_named(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDesc")
            .field("key", &self.key)
            .field("category", &self.category)
            .field("name", &self.full_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_names_roundtrip() {
        for kind in PrimitiveKind::ALL {
            assert_eq!(PrimitiveKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(PrimitiveKind::from_type_name("String"), None);
    }

    #[test]
    fn primitive_sizes_follow_pointer_width() {
        assert_eq!(PrimitiveKind::I.size(8), 8);
        assert_eq!(PrimitiveKind::U.size(4), 4);
        assert_eq!(PrimitiveKind::Char.size(8), 2);
        assert!(PrimitiveKind::Char.is_unsigned());
        assert!(!PrimitiveKind::R8.is_integer());
    }
}
