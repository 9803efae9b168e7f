//! Method descriptors.

use std::{fmt, sync::OnceLock};

use crate::{
    metadata::{
        flags::{MethodAttributes, MethodImplAttributes, PInvokeInfo},
        token::Token,
    },
    typesystem::{signature::MethodSignature, types::TypeId},
};

/// Identity of an interned method.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub(crate) u32);

impl MethodId {
    /// Arena index of this method.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({})", self.0)
    }
}

/// Accessors the runtime provides on every multi-dimensional array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayMethodKind {
    /// `T Get(int32, ...)`
    Get,
    /// `void Set(int32, ..., T)`
    Set,
    /// `T& Address(int32, ...)`
    Address,
    /// `.ctor(int32, ...)`, the constructor `newobj` uses for rank-N arrays
    Ctor,
}

impl ArrayMethodKind {
    /// Map an array member name to its accessor.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Get" => Some(ArrayMethodKind::Get),
            "Set" => Some(ArrayMethodKind::Set),
            "Address" => Some(ArrayMethodKind::Address),
            ".ctor" => Some(ArrayMethodKind::Ctor),
            _ => None,
        }
    }

    /// The member name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ArrayMethodKind::Get => "Get",
            ArrayMethodKind::Set => "Set",
            ArrayMethodKind::Address => "Address",
            ArrayMethodKind::Ctor => ".ctor",
        }
    }
}

/// Where a method comes from. Each variant gets its body from a different source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// A `MethodDef` on a non-generic type or on an open generic definition
    Ecma(Token),
    /// A `MethodDef` viewed through an instantiated owning type
    OnInstantiatedType {
        /// The method on the open definition
        typical: MethodId,
    },
    /// A generic method instantiated with method type arguments
    Instantiated {
        /// The generic method definition (possibly itself on an instantiated type)
        definition: MethodId,
    },
    /// A runtime-provided accessor of a multi-dimensional array
    Array(ArrayMethodKind),
    /// The raw native import a marshaling stub calls into
    PInvokeTarget {
        /// The managed P/Invoke declaration
        declaration: MethodId,
    },
    /// Adjusts a boxed `this` and forwards to a value-type instance method
    UnboxingStub {
        /// The value-type method being forwarded to
        target: MethodId,
    },
}

/// Interning key of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MethodKey {
    Definition(TypeId, Token),
    Instantiated(MethodId, Vec<TypeId>),
    Array(TypeId, ArrayMethodKind),
    PInvokeTarget(MethodId),
    UnboxingStub(MethodId),
}

/// A canonical method.
pub struct MethodDesc {
    /// Origin of the method
    pub kind: MethodKind,
    /// Owning type
    pub owner: TypeId,
    /// Simple name
    pub name: String,
    /// Resolved signature, with the owner's and the method's instantiation substituted
    pub signature: MethodSignature,
    /// Method attributes
    pub flags: MethodAttributes,
    /// Implementation attributes
    pub impl_flags: MethodImplAttributes,
    /// Import information of P/Invoke methods
    pub pinvoke: Option<PInvokeInfo>,
    /// Method type arguments
    pub instantiation: Vec<TypeId>,
    pub(crate) mangled: OnceLock<String>,
}

impl MethodDesc {
    pub(crate) fn new(
        kind: MethodKind,
        owner: TypeId,
        name: String,
        signature: MethodSignature,
        flags: MethodAttributes,
        impl_flags: MethodImplAttributes,
    ) -> Self {
        MethodDesc {
            kind,
            owner,
            name,
            signature,
            flags,
            impl_flags,
            pinvoke: None,
            instantiation: Vec::new(),
            mangled: OnceLock::new(),
        }
    }

    /// No implicit `this`.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.signature.is_static
    }

    /// Occupies a virtual slot.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodAttributes::VIRTUAL)
    }

    /// Has no implementation.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodAttributes::ABSTRACT)
    }

    /// Introduces a new slot.
    #[must_use]
    pub fn is_new_slot(&self) -> bool {
        self.flags.contains(MethodAttributes::NEW_SLOT)
    }

    /// Platform-invoke import.
    #[must_use]
    pub fn is_pinvoke(&self) -> bool {
        self.flags.contains(MethodAttributes::PINVOKE_IMPL)
    }

    /// Body supplied by the runtime (delegate members).
    #[must_use]
    pub fn is_runtime_implemented(&self) -> bool {
        (self.impl_flags.bits() & crate::metadata::flags::METHOD_IMPL_CODE_TYPE_MASK)
            == MethodImplAttributes::RUNTIME.bits()
    }

    /// Implemented inside the runtime.
    #[must_use]
    pub fn is_internal_call(&self) -> bool {
        self.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL)
    }

    /// `.ctor`.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    /// The `MethodDef` token of an [`MethodKind::Ecma`] method.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.kind {
            MethodKind::Ecma(token) => Some(token),
            _ => None,
        }
    }
}

impl fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDesc")
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
