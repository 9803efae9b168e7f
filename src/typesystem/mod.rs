//! The managed type-system model.
//!
//! Types, methods and fields are interned by a [`TypeSystemContext`] and referred to by the
//! small copyable ids [`TypeId`], [`MethodId`] and [`FieldId`]. Structurally equal keys (the
//! same definition with the same type arguments, the same array element and rank, ...) always
//! resolve to the same id, so id equality is type identity throughout the compiler.
//!
//! # Key Components
//!
//! - [`TypeSystemContext`] - Interning, token resolution, generic instantiation
//! - [`TypeDesc`], [`MethodDesc`], [`FieldDesc`] - Immutable descriptors with lazily computed parts
//! - [`TypeLayout`] - Instance layout; see also [`TypeSystemContext::static_pools`] and
//!   [`TypeSystemContext::base_size`]
//! - [`TypeSystemContext::vtable`] - Virtual slot assignment
//! - [`TypeSystemContext::mangled_type_name`] - Flat C symbol names
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use cilaot::metadata::{StoreBuilder, TypeAttributes, TypeSig};
//! use cilaot::typesystem::{GenericContext, TargetDetails, TypeSystemContext};
//!
//! let mut builder = StoreBuilder::new().with_core_library();
//! let object = builder.core_type("Object");
//! let list = builder.add_type("App", "List`1", TypeAttributes::empty(), object);
//! builder.set_generic_params(list, 1);
//!
//! let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
//! let sig = TypeSig::GenericInst(list, vec![TypeSig::I4]);
//! let a = ctx.resolve_sig(&sig, &GenericContext::empty())?;
//! let b = ctx.resolve_sig(&sig, &GenericContext::empty())?;
//! assert_eq!(a, b);
//! # Ok::<(), cilaot::Error>(())
//! ```

mod context;
mod fields;
mod layout;
mod mangling;
mod methods;
mod signature;
mod target;
mod types;
mod vtable;

pub use context::{TypeSystemContext, WellKnownType};
pub use fields::{FieldDesc, FieldId};
pub use layout::{align_up, StaticPool, StaticPoolKind, TypeLayout};
pub use mangling::sanitize;
pub use methods::{ArrayMethodKind, MethodDesc, MethodId, MethodKind};
pub use signature::{GenericContext, MethodSignature};
pub use target::{TargetArchitecture, TargetDetails};
pub use types::{
    GenericParameterKind, LayoutKind, PrimitiveKind, TypeCategory, TypeDesc, TypeId, TypeKey,
};
