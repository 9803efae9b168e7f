//! The metadata seam: tokens, decoded signatures, row records and the store they come from.
//!
//! The compiler never parses an image itself. It queries a [`MetadataStore`] by token and works
//! with the already-decoded records defined here. Method bodies are the one exception: they are
//! handed out as raw bytes and parsed by [`method::MethodBody`], the same way a loader would see
//! them in the file.
//!
//! # Key Components
//!
//! - [`token`] - Metadata table row references used throughout the IL stream
//! - [`signatures`] - Type and method signature shapes
//! - [`flags`] - Type, method and field attribute bitflags
//! - [`method`] - Method-body header and exception-clause parsing
//! - [`MetadataStore`] / [`MemoryStore`] / [`StoreBuilder`] - The store trait and its in-memory form

/// Fluent construction of an in-memory store
pub mod builder;
/// Attribute flags of metadata rows
pub mod flags;
/// Method bodies and exception clauses
pub mod method;
/// Decoded table rows
pub mod records;
/// Type and method signatures
pub mod signatures;
/// The read-only store trait
pub mod store;
/// Metadata tokens
pub mod token;

pub use builder::StoreBuilder;
pub use flags::{
    FieldAttributes, MethodAttributes, MethodImplAttributes, NativeCallingConvention, PInvokeInfo,
    TypeAttributes,
};
pub use records::{FieldDefRecord, MemberRefRecord, MethodDefRecord, MethodSpecRecord, TypeDefRecord};
pub use signatures::{CallingConvention, MemberRefSig, MethodSig, StandAloneSig, TypeSig};
pub use store::{MemoryStore, MetadataStore};
pub use token::{Token, TokenTable};
