//! Calling-convention helpers on types marked `McgIntrinsicsAttribute`.
//!
//! `Call(pfn, args...)` and `StdCall*(pfn, args...)` become an indirect call through their first
//! argument, the latter with the unmanaged stdcall convention. `AddrOf(delegate)` reads the code
//! address out of the delegate.

use crate::{
    il::{body::ILBody, emitter::ILEmitter, opcodes::OpCode, stubs::find_field},
    metadata::CallingConvention,
    typesystem::{MethodId, MethodSignature, TypeSystemContext, WellKnownType},
    Result,
};

/// Namespace of the marker attribute.
pub(crate) const INTEROP_NAMESPACE: &str = "System.Runtime.InteropServices";
/// Name of the marker attribute.
pub(crate) const MCG_INTRINSICS_ATTRIBUTE: &str = "McgIntrinsicsAttribute";

/// Body of an interop helper, `None` for other members of the marked type.
pub(crate) fn emit_interop_intrinsic(ctx: &TypeSystemContext, method: MethodId) -> Result<Option<ILBody>> {
    let desc = ctx.method(method);
    if !ctx.type_has_attribute(desc.owner, INTEROP_NAMESPACE, MCG_INTRINSICS_ATTRIBUTE) {
        return Ok(None);
    }

    let mut emitter = ILEmitter::new();
    if desc.name == "Call" || desc.name.starts_with("StdCall") {
        let Some((_, forwarded)) = desc.signature.params.split_first() else {
            return Err(malformed_error!(
                "{} has no function pointer parameter",
                ctx.method_name(method)
            ));
        };
        for index in 1..desc.signature.params.len() {
            #[allow(clippy::cast_possible_truncation)]
            emitter.ldarg(index as u16);
        }
        emitter.ldarg(0);
        let calling_convention = if desc.name == "Call" {
            CallingConvention::Default
        } else {
            CallingConvention::UnmanagedStdcall
        };
        let target = emitter.signature_token(MethodSignature {
            is_static: true,
            calling_convention,
            generic_param_count: 0,
            return_type: desc.signature.return_type,
            params: forwarded.to_vec(),
        });
        emitter.emit_token(OpCode::Calli, target);
    } else if desc.name == "AddrOf" {
        let delegate = ctx.well_known(WellKnownType::Delegate)?;
        let function_pointer = find_field(ctx, delegate, "m_functionPointer")?;
        let function_pointer = emitter.field_token(function_pointer);
        emitter.ldarg(0);
        emitter.emit_token(OpCode::Ldfld, function_pointer);
    } else {
        return Ok(None);
    }

    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}
