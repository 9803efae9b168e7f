//! The compilation session: one type-system context, one body cache, one configuration.

use std::sync::Arc;

use crate::{
    compilation::{
        config::CompilerConfig,
        driver::{self, CompilationOutput, MethodOutcome},
        nodes::Node,
    },
    il::ILProvider,
    metadata::MetadataStore,
    typesystem::{GenericContext, MethodId, TargetDetails, TypeSystemContext},
    Result,
};

/// Everything a compilation shares.
///
/// The session owns the interned type system and the method-body cache, so descriptors and
/// bodies stay canonical across every compilation run through it. Both are safe to query from
/// several threads; per-method lowering borrows the session immutably.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cilaot::compilation::{CompilationSession, CompilerConfig};
/// use cilaot::metadata::StoreBuilder;
///
/// let store = Arc::new(StoreBuilder::new().with_core_library().build());
/// let session = CompilationSession::new(store, CompilerConfig::default());
/// let output = session.compile(&[])?;
/// println!("{}", output.source());
/// # Ok::<(), cilaot::Error>(())
/// ```
pub struct CompilationSession {
    ctx: TypeSystemContext,
    provider: ILProvider,
    config: CompilerConfig,
}

impl CompilationSession {
    /// A session over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, config: CompilerConfig) -> Self {
        CompilationSession {
            ctx: TypeSystemContext::new(store, TargetDetails::new(config.target)),
            provider: ILProvider::new(config.supports_relative_pointers),
            config,
        }
    }

    /// The type system.
    #[must_use]
    pub fn context(&self) -> &TypeSystemContext {
        &self.ctx
    }

    /// The method-body cache.
    #[must_use]
    pub fn provider(&self) -> &ILProvider {
        &self.provider
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// The configured entry point, resolved.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the token names no method.
    pub fn entry_point(&self) -> Result<Option<MethodId>> {
        self.config
            .entry_point
            .map(|token| self.ctx.resolve_method_token(token, &GenericContext::empty()))
            .transpose()
    }

    /// Lower a single method, converting method-local failures into a trap stub.
    ///
    /// # Errors
    /// Returns whole-run failures only.
    pub fn compile_method(&self, method: MethodId) -> Result<MethodOutcome> {
        driver::compile_method(self, method)
    }

    /// Compile the nodes not compiled yet and mark them compiled.
    ///
    /// # Errors
    /// Returns whole-run failures; method-local failures are reported in
    /// [`CompilationOutput::diagnostics`].
    pub fn compile(&self, nodes: &[Node]) -> Result<CompilationOutput> {
        driver::compile(self, nodes)
    }
}
