//! C++ code generation.
//!
//! This module turns decoded method bodies and type-system descriptors into C++ source. Method
//! bodies are lowered one at a time and independently of each other by the importer; the
//! [`CppWriter`] then assembles the results with the type bodies, static pools, slot accessors
//! and method tables they reference into one translation unit.
//!
//! # Key Components
//!
//! - [`lower_method`] - Lower one IL body to a C++ function
//! - [`trap_stub`] / [`lower_unboxing_stub`] - Bodies that do not come from IL
//! - [`MethodTable`] - The runtime's per-type record, as source and as an object node
//! - [`CppWriter`] - Assembly of the translation unit
//! - [`EvaluationStack`], [`StackEntry`] - The abstract evaluation stack
//! - [`find_blocks`] - Basic-block discovery
//!
//! # Thread Safety
//!
//! Lowering only reads the [`crate::typesystem::TypeSystemContext`], so distinct methods can be
//! lowered on different threads. The writer is single-threaded and owns every lowered method
//! handed to it.

mod blocks;
mod buffer;
mod cppwriter;
mod ctypes;
mod importer;
mod methodtable;
mod stack;

pub use blocks::{find_blocks, BasicBlock, BlockFlags, BlockGraph, BlockState};
pub use buffer::CppBuffer;
pub use cppwriter::{static_pool_symbol, CppWriter, EmissionPlan};
pub use ctypes::{cpp_type_name, method_declaration, StructMember};
pub use importer::{lower_method, lower_unboxing_stub, trap_stub, LoweredMethod, MethodReferences};
pub use methodtable::{header_size, method_table_symbol, MethodTable, MethodTableFlags};
pub use stack::{EvaluationStack, StackEntry, StackShape, StackValueKind};
