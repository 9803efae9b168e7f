//! # cilaot Prelude
//!
//! The types most programs driving the compiler need, for glob import.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilaot operations
pub use crate::Error;

/// The result type used throughout cilaot
pub use crate::Result;

// ================================================================================================
// Compilation
// ================================================================================================

/// Sessions, configuration, nodes and output
pub use crate::compilation::{
    Artifact, CompilationOutput, CompilationSession, CompilerConfig, MethodDiagnostic, Node, NodeKind,
    OutputFormat,
};

// ================================================================================================
// Metadata Input
// ================================================================================================

/// The store and the builder used to fill it
pub use crate::metadata::{
    FieldAttributes, MemoryStore, MetadataStore, MethodAttributes, MethodSig, StoreBuilder, Token, TokenTable,
    TypeAttributes, TypeSig,
};

// ================================================================================================
// Type System
// ================================================================================================

/// Canonical descriptors and target description
pub use crate::typesystem::{
    GenericContext, MethodId, TargetArchitecture, TargetDetails, TypeId, TypeKey, TypeSystemContext,
};

// ================================================================================================
// Code Generation and Output
// ================================================================================================

/// Method lowering and the C++ writer
pub use crate::codegen::{lower_method, CppWriter, LoweredMethod, MethodTable};

/// Bodies
pub use crate::il::{ILProvider, MethodIL};

/// Object output
pub use crate::object::{NodeSection, ObjectContainer, ObjectDataBuilder, ObjectNode, ObjectWriter};
