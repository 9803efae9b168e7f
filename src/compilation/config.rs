//! Configuration for a compilation session.

use strum::{Display, EnumString};

use crate::{metadata::Token, object::ObjectContainer, typesystem::TargetArchitecture};

/// What a compilation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    /// One C++ translation unit holding code and data
    #[default]
    Source,
    /// A relocatable object file with the data, plus C++ source with the code
    Object,
}

/// Configuration for a compilation session.
///
/// # Examples
///
/// ```rust
/// use cilaot::compilation::{CompilerConfig, OutputFormat};
/// use cilaot::object::ObjectContainer;
/// use cilaot::typesystem::TargetArchitecture;
///
/// let config = CompilerConfig::new()
///     .with_target(TargetArchitecture::Arm64)
///     .with_output_format(OutputFormat::Object)
///     .with_container(ObjectContainer::MachO)
///     .with_parallel(false);
///
/// assert_eq!(config.pointer_size(), 8);
/// assert!(config.emit_main);
/// ```
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Target architecture (default: x64).
    pub target: TargetArchitecture,

    /// Output format (default: source).
    pub output_format: OutputFormat,

    /// Container of the object file in [`OutputFormat::Object`] mode (default: ELF).
    pub container: ObjectContainer,

    /// `MethodDef` token of the managed entry point.
    pub entry_point: Option<Token>,

    /// Emit the `main` stub when an entry point is set (default: true).
    pub emit_main: bool,

    /// Lower methods on the rayon thread pool (default: true).
    pub parallel: bool,

    /// Whether the runtime stores method-table references as relative pointers. Answers the
    /// `EEType.SupportsRelativePointers` intrinsic (default: false).
    pub supports_relative_pointers: bool,

    /// Header included at the top of the generated source (default: `runtime.h`).
    pub runtime_header: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            target: TargetArchitecture::X64,
            output_format: OutputFormat::Source,
            container: ObjectContainer::Elf,
            entry_point: None,
            emit_main: true,
            parallel: true,
            supports_relative_pointers: false,
            runtime_header: "runtime.h".to_string(),
        }
    }
}

impl CompilerConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pointer size of the target in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        self.target.pointer_size()
    }

    /// Sets the target architecture.
    #[must_use]
    pub fn with_target(mut self, target: TargetArchitecture) -> Self {
        self.target = target;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Sets the object container.
    #[must_use]
    pub fn with_container(mut self, container: ObjectContainer) -> Self {
        self.container = container;
        self
    }

    /// Sets the managed entry point.
    #[must_use]
    pub fn with_entry_point(mut self, token: Token) -> Self {
        self.entry_point = Some(token);
        self
    }

    /// Enables or disables the `main` stub.
    #[must_use]
    pub fn with_main(mut self, emit_main: bool) -> Self {
        self.emit_main = emit_main;
        self
    }

    /// Enables or disables parallel lowering.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets relative-pointer support of the runtime.
    #[must_use]
    pub fn with_relative_pointers(mut self, supported: bool) -> Self {
        self.supports_relative_pointers = supported;
        self
    }

    /// Sets the runtime header.
    #[must_use]
    pub fn with_runtime_header(mut self, header: &str) -> Self {
        self.runtime_header = header.to_string();
        self
    }
}
