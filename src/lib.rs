// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
//#![deny(unsafe_code)]
// - 'object/output.rs' maps the output file into memory

//! # cilaot
//!
//! An ahead-of-time compiler backend for .NET. `cilaot` lowers CIL method bodies, together with
//! the type-system records the runtime needs to interpret the objects those methods create, into
//! a native compilation unit: a single C++ translation unit, or a relocatable object file
//! carrying the data next to the C++ code.
//!
//! ## Features
//!
//! - **Canonical type system** - Interned types and methods, generic instantiation, field
//!   layout (auto, sequential and explicit), static pools and virtual slot assignment
//! - **IL decoding** - Complete ECMA-335 opcode table, branch normalization, method-body and
//!   exception-section parsing
//! - **Synthetic bodies** - Intrinsics, delegate members, P/Invoke marshaling stubs and array
//!   accessors generated as IL and lowered like any other body
//! - **Method lowering** - Basic-block discovery and an abstract evaluation stack validated at
//!   every control-flow join
//! - **Runtime ABI** - Method-table records, slot accessors and static pools laid out the way
//!   the runtime reads them
//! - **Object output** - ELF, COFF and Mach-O relocatable objects, verified after writing
//! - **Isolated failures** - A method that cannot be lowered becomes a trap stub; the rest of the
//!   program still compiles
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cilaot::prelude::*;
//!
//! let mut builder = StoreBuilder::new().with_core_library();
//! let object = builder.core_type("Object");
//! let program = builder.add_type("App", "Program", TypeAttributes::empty(), object);
//! let add = builder.add_method(
//!     program,
//!     "Add",
//!     MethodAttributes::STATIC,
//!     MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
//! );
//! builder.set_body(add, &[0x02, 0x03, 0x58, 0x2A]); // ldarg.0 ldarg.1 add ret
//!
//! let session = CompilationSession::new(Arc::new(builder.build()), CompilerConfig::default());
//! let method = session.context().resolve_method_token(add, &GenericContext::empty())?;
//! let output = session.compile(&[Node::method(method)])?;
//! println!("{}", output.source());
//! # Ok::<(), cilaot::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The modules follow the pipeline from input to artifact:
//!
//! - [`metadata`] - The read-only metadata store the compiler queries by token
//! - [`typesystem`] - Canonical descriptors, layout and dispatch
//! - [`il`] - Decoding, encoding, and the provider of method bodies
//! - [`codegen`] - Method lowering and assembly of the C++ unit
//! - [`object`] - Relocatable object output
//! - [`compilation`] - Sessions, configuration and the per-method failure boundary
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade and installs no logger. Every compiled method is
//! reported at `info`, every method replaced by a trap stub and every relocation resolved to
//! null at `warn`.
//!
//! ## Thread Safety
//!
//! [`typesystem::TypeSystemContext`] and [`il::ILProvider`] are `Send + Sync`. Concurrent first
//! lookups of the same key converge on one canonical descriptor or body, so methods can be
//! lowered on the rayon pool without coordination.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use cilaot::prelude::*;
///
/// let config = CompilerConfig::new().with_target(TargetArchitecture::X86);
/// assert_eq!(config.pointer_size(), 4);
/// ```
pub mod prelude;

/// Method lowering and C++ unit assembly.
pub mod codegen;

/// Compilation sessions, configuration and output.
pub mod compilation;

/// Method bodies: decoding, encoding and synthesis.
pub mod il;

/// Bounds-checked little-endian access to byte buffers.
pub mod io;

/// The metadata store the compiler reads from.
///
/// The compiler treats metadata as an opaque keyed store: every lookup goes through
/// [`metadata::MetadataStore`] by [`metadata::Token`]. [`metadata::MemoryStore`], built with
/// [`metadata::StoreBuilder`], is the in-memory implementation.
pub mod metadata;

/// Relocatable object-file output.
pub mod object;

/// The canonical type system.
pub mod typesystem;

/// `cilaot` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilaot` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use cilaot::Error;
///
/// fn report(error: &Error) {
///     if error.is_method_local() {
///         println!("method replaced by a trap stub: {error}");
///     } else {
///         println!("compilation aborted: {error}");
///     }
/// }
/// ```
pub use error::Error;
