//! Synthesized method bodies.
//!
//! Every generator here builds its body with an [`ILEmitter`] and returns a plain [`ILBody`];
//! the provider attaches the generic context. A generator returns `Ok(None)` when it does not
//! recognize the method, so the provider falls through to the next source.

mod array;
mod delegate;
mod interop;
mod intrinsics;
mod pinvoke;

pub(crate) use array::emit_array_accessor;
pub(crate) use delegate::emit_delegate_member;
pub(crate) use interop::emit_interop_intrinsic;
pub(crate) use intrinsics::{emit_intrinsic, emit_per_instantiation_intrinsic, is_intrinsic};
pub(crate) use pinvoke::emit_pinvoke;

use crate::{
    il::{emitter::ILEmitter, opcodes::OpCode},
    typesystem::{
        FieldId, GenericParameterKind, MethodId, TypeId, TypeKey, TypeSystemContext, WellKnownType,
    },
    Result,
};

/// First field of `ty` named `name`.
pub(crate) fn find_field(ctx: &TypeSystemContext, ty: TypeId, name: &str) -> Result<FieldId> {
    ctx.fields(ty)?
        .into_iter()
        .find(|field| ctx.field(*field).name == name)
        .ok_or_else(|| missing_metadata!("Field {} on {}", name, ctx.type_name(ty)))
}

/// `!!index`.
pub(crate) fn method_parameter(ctx: &TypeSystemContext, index: u32) -> Result<TypeId> {
    ctx.intern(TypeKey::GenericParameter(GenericParameterKind::Method, index))
}

/// `System.Exception::.ctor(string)`.
fn exception_constructor(ctx: &TypeSystemContext) -> Result<MethodId> {
    let exception = ctx.well_known(WellKnownType::Exception)?;
    let string = ctx.well_known(WellKnownType::String)?;
    ctx.type_methods(exception)?
        .into_iter()
        .find(|method| {
            let desc = ctx.method(*method);
            desc.is_constructor() && desc.signature.params == [string]
        })
        .ok_or_else(|| missing_metadata!("System.Exception::.ctor(string)"))
}

/// Append `ldstr message; newobj Exception::.ctor(string); throw`.
pub(crate) fn emit_throw(ctx: &TypeSystemContext, emitter: &mut ILEmitter, message: &str) -> Result<()> {
    let constructor = exception_constructor(ctx)?;
    let message = emitter.string_token(message);
    emitter.emit_token(OpCode::Ldstr, message);
    let constructor = emitter.method_token(constructor);
    emitter.emit_token(OpCode::Newobj, constructor);
    emitter.emit(OpCode::Throw);
    Ok(())
}
