//! The per-method compilation boundary and assembly of the output.
//!
//! Methods are lowered independently, in parallel when configured. A failure caused by a
//! method's own body is caught here: the method is replaced by a trap stub, a diagnostic is
//! recorded and logged, and the rest of the program is still emitted. Every other failure aborts
//! the compilation.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::{
    codegen::{
        lower_method, lower_unboxing_stub, method_table_symbol, static_pool_symbol, trap_stub, CppWriter,
        EmissionPlan, LoweredMethod, MethodTable,
    },
    compilation::{
        config::OutputFormat,
        nodes::{Node, NodeKind},
        session::CompilationSession,
    },
    object::{NodeSection, ObjectDataBuilder, ObjectNode, ObjectWriter},
    typesystem::{MethodId, MethodKind, TypeId, TypeSystemContext},
    Result,
};

/// A method that failed to lower and was replaced by a trap stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDiagnostic {
    /// The method
    pub method: MethodId,
    /// Its display name
    pub name: String,
    /// Why lowering failed
    pub message: String,
}

/// How one method node ends up in the output.
#[derive(Debug)]
pub enum MethodOutcome {
    /// Lowered to a definition
    Lowered(LoweredMethod),
    /// Lowering failed; the trap stub stands in for the body
    Failed {
        /// Body that faults when called. `None` if the signature itself has no C++ spelling, in
        /// which case nothing is emitted for the method.
        stub: Option<LoweredMethod>,
        /// What went wrong
        diagnostic: MethodDiagnostic,
    },
    /// Bound to a native import
    Extern(MethodId),
    /// Defined by the runtime; only declared
    Declared(MethodId),
    /// Abstract; nothing to emit
    Skipped(MethodId),
}

/// The artifact of a compilation.
#[derive(Debug)]
pub enum Artifact {
    /// A complete translation unit
    Source(String),
    /// Method code as source, data as a relocatable object
    Object {
        /// Translation unit holding the method code
        source: String,
        /// Writer holding the method tables, static pools and data nodes
        object: ObjectWriter,
    },
}

/// Result of [`CompilationSession::compile`].
#[derive(Debug)]
pub struct CompilationOutput {
    /// What was produced
    pub artifact: Artifact,
    /// One entry per method replaced by a trap stub, ordered by name
    pub diagnostics: Vec<MethodDiagnostic>,
    /// Number of methods given a definition, trap stubs included
    pub methods_compiled: usize,
}

impl CompilationOutput {
    /// The generated C++ source.
    #[must_use]
    pub fn source(&self) -> &str {
        match &self.artifact {
            Artifact::Source(source) | Artifact::Object { source, .. } => source,
        }
    }

    /// The object writer, in object mode.
    #[must_use]
    pub fn object(&self) -> Option<&ObjectWriter> {
        match &self.artifact {
            Artifact::Source(_) => None,
            Artifact::Object { object, .. } => Some(object),
        }
    }
}

/// Decide what `method` becomes and lower it if it has a body.
///
/// # Errors
/// Returns whole-run failures. Method-local failures come back as [`MethodOutcome::Failed`].
pub fn compile_method(session: &CompilationSession, method: MethodId) -> Result<MethodOutcome> {
    let ctx = session.context();
    match classify(session, method) {
        Ok(outcome) => {
            if let MethodOutcome::Lowered(lowered) = &outcome {
                log::info!("compiled {} as {}", ctx.method_name(method), lowered.name);
            }
            Ok(outcome)
        }
        Err(error) if error.is_method_local() => {
            let name = ctx.method_name(method);
            log::warn!("{error} ({name})");
            let stub = match trap_stub(ctx, method) {
                Ok(stub) => Some(stub),
                Err(stub_error) if stub_error.is_method_local() => {
                    log::warn!("no trap stub for {name}: {stub_error}");
                    None
                }
                Err(stub_error) => return Err(stub_error),
            };
            Ok(MethodOutcome::Failed {
                stub,
                diagnostic: MethodDiagnostic {
                    method,
                    name,
                    message: error.to_string(),
                },
            })
        }
        Err(error) => Err(error),
    }
}

fn classify(session: &CompilationSession, method: MethodId) -> Result<MethodOutcome> {
    let ctx = session.context();
    let desc = ctx.method(method);
    if desc.is_abstract() {
        return Ok(MethodOutcome::Skipped(method));
    }
    if let MethodKind::UnboxingStub { .. } = desc.kind {
        return Ok(MethodOutcome::Lowered(lower_unboxing_stub(ctx, method)?));
    }

    match session.provider().method_il(ctx, method)? {
        Some(il) => Ok(MethodOutcome::Lowered(lower_method(ctx, method, &il)?)),
        None if desc.pinvoke.is_some() || matches!(desc.kind, MethodKind::PInvokeTarget { .. }) => {
            Ok(MethodOutcome::Extern(method))
        }
        None => Ok(MethodOutcome::Declared(method)),
    }
}

/// Compile every node of `nodes` that is not compiled yet.
///
/// # Errors
/// Returns whole-run failures: unresolvable entry points, type-system failures of emitted
/// types, unrepresentable data nodes.
pub fn compile(session: &CompilationSession, nodes: &[Node]) -> Result<CompilationOutput> {
    let ctx = session.context();
    let config = session.config();

    let mut methods = Vec::new();
    let mut seen = BTreeSet::new();
    let mut types = Vec::new();
    let mut data = Vec::new();
    for node in nodes.iter().filter(|node| !node.is_compiled()) {
        match node.kind() {
            NodeKind::Method(method) => {
                if seen.insert(*method) {
                    methods.push(*method);
                }
            }
            NodeKind::Type(ty) => types.push(*ty),
            NodeKind::Data(blob) => data.push(blob.clone()),
        }
    }

    let outcomes: Vec<MethodOutcome> = if config.parallel {
        methods
            .par_iter()
            .map(|method| compile_method(session, *method))
            .collect::<Result<_>>()?
    } else {
        methods
            .iter()
            .map(|method| compile_method(session, *method))
            .collect::<Result<_>>()?
    };

    let object_mode = config.output_format == OutputFormat::Object;
    let mut writer = CppWriter::new(ctx, &config.runtime_header);
    if object_mode {
        writer = writer.with_external_records();
    }

    let mut diagnostics = Vec::new();
    let mut methods_compiled = 0;
    let mut referenced = BTreeSet::new();
    for outcome in outcomes {
        match outcome {
            MethodOutcome::Lowered(lowered) => {
                methods_compiled += 1;
                referenced.extend(lowered.references.methods.iter().copied());
                writer.add_method(lowered);
            }
            MethodOutcome::Failed { stub, diagnostic } => {
                methods_compiled += 1;
                if let Some(stub) = stub {
                    writer.add_method(stub);
                }
                diagnostics.push(diagnostic);
            }
            MethodOutcome::Extern(method) => writer.add_extern(method),
            MethodOutcome::Declared(method) => writer.add_declaration(method),
            MethodOutcome::Skipped(method) => {
                log::debug!("{} is abstract, nothing emitted", ctx.method_name(method));
            }
        }
    }
    diagnostics.sort_by(|a, b| a.name.cmp(&b.name));

    // native imports reached only through calls are bound here
    for method in referenced.difference(&seen) {
        if is_native_import(session, *method) {
            writer.add_extern(*method);
        }
    }

    for ty in &types {
        writer.add_type(*ty);
    }
    if config.emit_main {
        writer.set_entry_point(session.entry_point()?);
    }

    let artifact = if object_mode {
        let plan = writer.plan()?;
        let object = object_records(ctx, session, &plan, data)?;
        Artifact::Object {
            source: writer.render()?,
            object,
        }
    } else {
        for blob in data {
            writer.add_data(blob);
        }
        Artifact::Source(writer.render()?)
    };

    for node in nodes {
        node.mark_compiled();
    }
    log::info!(
        "compiled {} methods, {} failed, {} types",
        methods_compiled,
        diagnostics.len(),
        types.len()
    );

    Ok(CompilationOutput {
        artifact,
        diagnostics,
        methods_compiled,
    })
}

fn is_native_import(session: &CompilationSession, method: MethodId) -> bool {
    let ctx = session.context();
    let desc = ctx.method(method);
    match desc.kind {
        MethodKind::PInvokeTarget { .. } => true,
        _ => desc.pinvoke.is_some() && matches!(session.provider().method_il(ctx, method), Ok(None)),
    }
}

/// Method tables, static pools and data nodes as object nodes.
fn object_records(
    ctx: &TypeSystemContext,
    session: &CompilationSession,
    plan: &EmissionPlan,
    data: Vec<ObjectNode>,
) -> Result<ObjectWriter> {
    let config = session.config();
    let mut object = ObjectWriter::new(config.container, config.target);

    for method in &plan.declared {
        object.declare_external(ctx.mangled_method_name(*method)?);
    }

    for ty in &plan.method_tables {
        let table = MethodTable::build(ctx, *ty)?;
        let node = table.to_node(ctx, |method| {
            Ok(if plan.declared.contains(&method) {
                Some(ctx.mangled_method_name(method)?.to_string())
            } else {
                log::warn!(
                    "slot of {} left null, {} is not part of the program",
                    method_table_symbol(ctx, *ty),
                    ctx.method_name(method)
                );
                None
            })
        })?;
        object.add_node(node);
    }

    for ty in &plan.statics {
        object_static_pools(ctx, *ty, &mut object)?;
    }

    for blob in data {
        object.add_node(blob);
    }
    Ok(object)
}

fn object_static_pools(ctx: &TypeSystemContext, ty: TypeId, object: &mut ObjectWriter) -> Result<()> {
    for pool in ctx.static_pools(ty)? {
        if pool.is_empty() {
            continue;
        }
        let mut builder = ObjectDataBuilder::new(ctx.pointer_size());
        builder.require_alignment(pool.alignment);
        builder.emit_zeros(pool.size);
        object.add_node(builder.finish(&static_pool_symbol(ctx, ty, pool.kind), NodeSection::Statics(pool.kind)));
    }
    Ok(())
}
