//! Runtime-implemented members of delegate types.
//!
//! A delegate instance is a closed pair: `m_firstParameter` holds the target object and
//! `m_functionPointer` the code address. The constructor stores both and `Invoke` calls the
//! code address with the stored object as `this`.

use crate::{
    il::{
        body::ILBody,
        emitter::ILEmitter,
        opcodes::OpCode,
        stubs::find_field,
    },
    typesystem::{MethodId, MethodSignature, TypeCategory, TypeSystemContext, WellKnownType},
    Result,
};

const FIRST_PARAMETER: &str = "m_firstParameter";
const FUNCTION_POINTER: &str = "m_functionPointer";

/// Body of a runtime-implemented delegate member, `None` for members without a template
/// (`BeginInvoke`, `EndInvoke`).
pub(crate) fn emit_delegate_member(ctx: &TypeSystemContext, method: MethodId) -> Result<Option<ILBody>> {
    let desc = ctx.method(method);
    if ctx.type_desc(desc.owner).category != TypeCategory::Delegate {
        return Ok(None);
    }

    let delegate = ctx.well_known(WellKnownType::Delegate)?;
    let first_parameter = find_field(ctx, delegate, FIRST_PARAMETER)?;
    let function_pointer = find_field(ctx, delegate, FUNCTION_POINTER)?;

    let mut emitter = ILEmitter::new();
    let first_parameter = emitter.field_token(first_parameter);
    let function_pointer = emitter.field_token(function_pointer);

    match desc.name.as_str() {
        ".ctor" => {
            if desc.signature.params.len() != 2 {
                return Err(unsupported!(
                    "Delegate constructor {} with {} parameters",
                    ctx.method_name(method),
                    desc.signature.params.len()
                ));
            }
            emitter.ldarg(0);
            emitter.ldarg(1);
            emitter.emit_token(OpCode::Stfld, first_parameter);
            emitter.ldarg(0);
            emitter.ldarg(2);
            emitter.emit_token(OpCode::Stfld, function_pointer);
        }
        "Invoke" => {
            emitter.ldarg(0);
            emitter.emit_token(OpCode::Ldfld, first_parameter);
            for index in 1..=desc.signature.params.len() {
                #[allow(clippy::cast_possible_truncation)]
                emitter.ldarg(index as u16);
            }
            emitter.ldarg(0);
            emitter.emit_token(OpCode::Ldfld, function_pointer);
            let target = emitter.signature_token(MethodSignature {
                is_static: false,
                ..desc.signature.clone()
            });
            emitter.emit_token(OpCode::Calli, target);
        }
        _ => return Ok(None),
    }

    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}
