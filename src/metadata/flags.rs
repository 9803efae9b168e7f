//! Attribute bitflags for type, method and field definitions (ECMA-335 II.23.1).

use bitflags::bitflags;

bitflags! {
    /// `TypeAttributes` subset used by layout and dispatch decisions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeAttributes: u32 {
        /// Fields are laid out sequentially, in declaration order
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Field offsets are supplied explicitly
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// The type is an interface
        const INTERFACE = 0x0000_0020;
        /// The type is abstract
        const ABSTRACT = 0x0000_0080;
        /// The type cannot be derived from
        const SEALED = 0x0000_0100;
        /// Static fields may be initialized lazily
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

/// Mask selecting the layout bits of [`TypeAttributes`].
pub const TYPE_LAYOUT_MASK: u32 = 0x0000_0018;

bitflags! {
    /// `MethodAttributes` subset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodAttributes: u32 {
        /// Defined on the type rather than per instance
        const STATIC = 0x0010;
        /// Cannot be overridden
        const FINAL = 0x0020;
        /// Occupies a virtual slot
        const VIRTUAL = 0x0040;
        /// Always introduces a new slot instead of reusing the base slot
        const NEW_SLOT = 0x0100;
        /// No implementation provided
        const ABSTRACT = 0x0400;
        /// Name is special
        const SPECIAL_NAME = 0x0800;
        /// Implemented through platform invoke
        const PINVOKE_IMPL = 0x2000;
        /// Runtime should check the name encoding
        const RT_SPECIAL_NAME = 0x1000;
    }
}

bitflags! {
    /// `MethodImplAttributes` subset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodImplAttributes: u32 {
        /// Native code
        const NATIVE = 0x0001;
        /// Implemented by the runtime
        const RUNTIME = 0x0003;
        /// Signature must not be altered by marshaling
        const PRESERVE_SIG = 0x0080;
        /// Implemented inside the runtime
        const INTERNAL_CALL = 0x1000;
    }
}

/// Mask selecting the code-type bits of [`MethodImplAttributes`].
pub const METHOD_IMPL_CODE_TYPE_MASK: u32 = 0x0003;

bitflags! {
    /// `FieldAttributes` subset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldAttributes: u32 {
        /// Defined on the type rather than per instance
        const STATIC = 0x0010;
        /// Only assignable during initialization
        const INIT_ONLY = 0x0020;
        /// Compile-time constant, no storage
        const LITERAL = 0x0040;
        /// Initial value comes from an RVA
        const HAS_FIELD_RVA = 0x0100;
    }
}

/// Native calling convention of a P/Invoke import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NativeCallingConvention {
    /// Platform default
    #[default]
    Winapi,
    /// `__cdecl`
    Cdecl,
    /// `__stdcall`
    Stdcall,
}

/// Platform-invoke import information for a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PInvokeInfo {
    /// Module the import lives in
    pub module: String,
    /// Native entry point name
    pub entry_point: String,
    /// Calling convention of the native function
    pub calling_convention: NativeCallingConvention,
}
