//! Compilation sessions.
//!
//! A [`CompilationSession`] takes the reachable node set computed by the caller and produces
//! the output artifact: a C++ translation unit, or a relocatable object file with its
//! companion source.
//!
//! ```text
//! nodes ──► compile_method (per method, rayon) ──► CppWriter ──► source
//!                     │                                 │
//!                     └─ trap stub + diagnostic          └─► ObjectWriter ──► .o / .obj
//!                        on method-local failure              (object mode)
//! ```

mod config;
mod driver;
mod nodes;
mod session;

pub use config::{CompilerConfig, OutputFormat};
pub use driver::{Artifact, CompilationOutput, MethodDiagnostic, MethodOutcome};
pub use nodes::{Node, NodeKind};
pub use session::CompilationSession;
