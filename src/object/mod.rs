//! Relocatable object-file output.
//!
//! Data that the source writer would otherwise render as initialized C++ globals (method
//! tables, static pools, frozen data blobs) can instead be emitted directly into a relocatable
//! object file that is linked next to the compiled translation unit.
//!
//! # Key Components
//!
//! - [`ObjectDataBuilder`] / [`ObjectNode`] - Byte blobs with symbols and relocations
//! - [`ObjectWriter`] - Section layout, symbol table and relocation records
//! - [`verify`] - Structural check of a written file
//! - [`Output`] - Memory-mapped output file, removed unless finalized
//!
//! # Supported Containers
//!
//! ELF, COFF and Mach-O, for x86, x64 and arm64. Symbols are emitted with the container's C
//! mangling, so Mach-O and 32-bit COFF names carry a leading underscore.

mod node;
mod output;
mod writer;

pub use node::{DefinedSymbol, NodeSection, ObjectDataBuilder, ObjectNode, Relocation, RelocationKind};
pub use output::Output;
pub use writer::{verify, ObjectContainer, ObjectWriter};
