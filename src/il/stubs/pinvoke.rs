//! Platform-invoke marshaling stubs.
//!
//! A P/Invoke whose signature is entirely blittable needs no stub: call sites bind straight to
//! the native import. Anything else gets a managed body that converts each argument into its
//! native form, calls the raw import (a [`MethodKind::PInvokeTarget`] carrying the native
//! signature) and converts the result back. Only simple cases are marshaled: `bool`, blittable
//! single-dimensional arrays (pinned, passed as a pointer to the first element) and by-refs to
//! blittable values. Every other signature compiles to a stub that throws.
//!
//! [`MethodKind::PInvokeTarget`]: crate::typesystem::MethodKind::PInvokeTarget

use crate::{
    il::{body::ILBody, emitter::ILEmitter, opcodes::OpCode, stubs::emit_throw},
    metadata::{CallingConvention, NativeCallingConvention},
    typesystem::{MethodId, MethodSignature, PrimitiveKind, TypeCategory, TypeId, TypeKey, TypeSystemContext},
    Result,
};

/// How one value crosses the managed/native boundary.
enum Marshaler {
    Blittable,
    Boolean,
    BlittableArray(TypeId),
    BlittableByRef,
}

/// `true` if values of the type have the same representation on both sides.
fn is_blittable(ctx: &TypeSystemContext, ty: TypeId) -> Result<bool> {
    let desc = ctx.type_desc(ty);
    match desc.category {
        TypeCategory::Primitive => Ok(!matches!(
            desc.primitive(),
            Some(PrimitiveKind::Boolean | PrimitiveKind::Char | PrimitiveKind::Void)
        )),
        TypeCategory::Pointer | TypeCategory::FunctionPointer => Ok(true),
        TypeCategory::Enum => is_blittable(ctx, ctx.enum_underlying_type(ty)?),
        TypeCategory::ValueType => {
            for field in ctx.instance_fields(ty)? {
                if !is_blittable(ctx, ctx.field(field).field_type)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn marshaler(ctx: &TypeSystemContext, ty: TypeId) -> Result<Option<Marshaler>> {
    if is_blittable(ctx, ty)? {
        return Ok(Some(Marshaler::Blittable));
    }
    let desc = ctx.type_desc(ty);
    Ok(match desc.key {
        TypeKey::Primitive(PrimitiveKind::Boolean) => Some(Marshaler::Boolean),
        TypeKey::SzArray(element) if is_blittable(ctx, element)? => Some(Marshaler::BlittableArray(element)),
        TypeKey::ByRef(element) if is_blittable(ctx, element)? => Some(Marshaler::BlittableByRef),
        _ => None,
    })
}

/// `true` unless the import can be called directly with the managed signature.
///
/// # Errors
/// Propagates field resolution failures of value-type parameters.
pub(crate) fn is_stub_required(ctx: &TypeSystemContext, method: MethodId) -> Result<bool> {
    let signature = &ctx.method(method).signature;
    let void = ctx.primitive(PrimitiveKind::Void)?;
    if signature.return_type != void && !is_blittable(ctx, signature.return_type)? {
        return Ok(true);
    }
    for param in &signature.params {
        if !is_blittable(ctx, *param)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The marshaling stub of a P/Invoke, `None` if the import is called directly.
pub(crate) fn emit_pinvoke(ctx: &TypeSystemContext, method: MethodId) -> Result<Option<ILBody>> {
    if !is_stub_required(ctx, method)? {
        return Ok(None);
    }

    let desc = ctx.method(method);
    let signature = &desc.signature;
    let void = ctx.primitive(PrimitiveKind::Void)?;
    let int32 = ctx.primitive(PrimitiveKind::I4)?;
    let native_int = ctx.primitive(PrimitiveKind::I)?;

    let mut marshalers = Vec::with_capacity(signature.params.len());
    for param in &signature.params {
        match marshaler(ctx, *param)? {
            Some(marshaler) => marshalers.push(marshaler),
            None => return emit_unsupported(ctx, method, *param),
        }
    }
    let return_marshaler = if signature.return_type == void {
        Marshaler::Blittable
    } else {
        match marshaler(ctx, signature.return_type)? {
            Some(Marshaler::Blittable) => Marshaler::Blittable,
            Some(Marshaler::Boolean) => Marshaler::Boolean,
            _ => return emit_unsupported(ctx, method, signature.return_type),
        }
    };

    let mut emitter = ILEmitter::new();
    let mut native_params = Vec::with_capacity(marshalers.len());
    let mut native_locals = Vec::with_capacity(marshalers.len());
    for (index, (param, marshaler)) in signature.params.iter().zip(&marshalers).enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let argument = index as u16;
        let native = match marshaler {
            Marshaler::Blittable => {
                emitter.ldarg(argument);
                *param
            }
            Marshaler::Boolean => {
                emitter.ldarg(argument);
                emitter.ldc_i4(0);
                emitter.emit(OpCode::Ceq);
                emitter.ldc_i4(0);
                emitter.emit(OpCode::Ceq);
                int32
            }
            Marshaler::BlittableArray(element) => {
                let first_element = emitter.new_local(ctx.intern(TypeKey::ByRef(*element))?);
                let array = emitter.new_local(*param);
                let empty = emitter.define_label();
                let element = emitter.type_token(*element);

                emitter.ldarg(argument);
                emitter.emit(OpCode::Dup);
                emitter.stloc(array);
                emitter.branch(OpCode::Brfalse, empty);
                emitter.ldloc(array);
                emitter.emit(OpCode::Ldlen);
                emitter.emit(OpCode::ConvI4);
                emitter.branch(OpCode::Brfalse, empty);
                emitter.ldloc(array);
                emitter.ldc_i4(0);
                emitter.emit_token(OpCode::Ldelema, element);
                emitter.stloc(first_element);
                emitter.mark_label(empty);
                emitter.ldloc(first_element);
                emitter.emit(OpCode::ConvI);
                native_int
            }
            Marshaler::BlittableByRef => {
                let pinned = emitter.new_local(*param);
                emitter.ldarg(argument);
                emitter.stloc(pinned);
                emitter.ldloc(pinned);
                emitter.emit(OpCode::ConvI);
                native_int
            }
        };
        let local = emitter.new_local(native);
        emitter.stloc(local);
        native_locals.push(local);
        native_params.push(native);
    }

    for local in native_locals {
        emitter.ldloc(local);
    }

    let native_return = match return_marshaler {
        Marshaler::Boolean => int32,
        _ => signature.return_type,
    };
    let calling_convention = match desc.pinvoke.as_ref().map(|info| info.calling_convention) {
        Some(NativeCallingConvention::Stdcall) => CallingConvention::UnmanagedStdcall,
        Some(NativeCallingConvention::Cdecl) => CallingConvention::UnmanagedCdecl,
        _ => CallingConvention::Default,
    };
    let target = ctx.pinvoke_target(
        method,
        MethodSignature {
            is_static: true,
            calling_convention,
            generic_param_count: 0,
            return_type: native_return,
            params: native_params,
        },
    );
    let target = emitter.method_token(target);
    emitter.emit_token(OpCode::Call, target);

    if let Marshaler::Boolean = return_marshaler {
        emitter.ldc_i4(0);
        emitter.emit(OpCode::Ceq);
        emitter.ldc_i4(0);
        emitter.emit(OpCode::Ceq);
    }
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

fn emit_unsupported(ctx: &TypeSystemContext, method: MethodId, ty: TypeId) -> Result<Option<ILBody>> {
    log::debug!(
        "Marshaling {} is not supported, {} will throw",
        ctx.type_name(ty),
        ctx.method_name(method)
    );
    let mut emitter = ILEmitter::new();
    emit_throw(
        ctx,
        &mut emitter,
        &format!(
            "Marshaling {} is not supported for {}",
            ctx.type_name(ty),
            ctx.method_name(method)
        ),
    )?;
    emitter.finish().map(Some)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        il::decode_stream,
        metadata::{MethodAttributes, MethodSig, PInvokeInfo, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::{MethodKind, TargetDetails},
    };

    fn import(params: Vec<TypeSig>, return_type: TypeSig) -> (TypeSystemContext, MethodId) {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let native = builder.add_type("App", "Native", TypeAttributes::ABSTRACT, object);
        let method = builder.add_method(
            native,
            "Import",
            MethodAttributes::STATIC,
            MethodSig::new_static(return_type, params),
        );
        builder.set_pinvoke(
            method,
            PInvokeInfo {
                module: "libc".to_string(),
                entry_point: "import".to_string(),
                calling_convention: NativeCallingConvention::Cdecl,
            },
        );
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let native = ctx.definition_type(native).unwrap();
        let method = ctx.method_for_definition(native, method).unwrap();
        (ctx, method)
    }

    #[test]
    fn blittable_import_needs_no_stub() {
        let (ctx, method) = import(vec![TypeSig::I4, TypeSig::ptr(TypeSig::U1)], TypeSig::I8);
        assert!(!is_stub_required(&ctx, method).unwrap());
        assert!(emit_pinvoke(&ctx, method).unwrap().is_none());
    }

    #[test]
    fn bool_parameters_are_normalized() {
        let (ctx, method) = import(vec![TypeSig::Boolean], TypeSig::Boolean);
        let body = emit_pinvoke(&ctx, method).unwrap().unwrap();
        let opcodes: Vec<OpCode> = decode_stream(&body.code)
            .unwrap()
            .into_iter()
            .map(|instruction| instruction.opcode)
            .collect();
        assert_eq!(&opcodes[..5], &[
            OpCode::Ldarg0,
            OpCode::LdcI40,
            OpCode::Ceq,
            OpCode::LdcI40,
            OpCode::Ceq
        ]);
        assert!(opcodes.contains(&OpCode::Call));

        let target = ctx.pinvoke_target(method, ctx.method(method).signature.clone());
        assert!(matches!(ctx.method(target).kind, MethodKind::PInvokeTarget { .. }));
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        assert_eq!(ctx.method(target).signature.params, vec![int32]);
        assert_eq!(ctx.method(target).signature.return_type, int32);
    }

    #[test]
    fn blittable_array_is_pinned() {
        let (ctx, method) = import(vec![TypeSig::sz_array(TypeSig::I4)], TypeSig::Void);
        let body = emit_pinvoke(&ctx, method).unwrap().unwrap();
        let instructions = decode_stream(&body.code).unwrap();
        assert!(instructions.iter().any(|instruction| instruction.opcode == OpCode::Ldelema));
        assert_eq!(body.locals.len(), 3);
    }

    #[test]
    fn strings_throw() {
        let (ctx, method) = import(vec![TypeSig::String], TypeSig::Void);
        let body = emit_pinvoke(&ctx, method).unwrap().unwrap();
        let instructions = decode_stream(&body.code).unwrap();
        assert_eq!(instructions[0].opcode, OpCode::Ldstr);
        assert_eq!(instructions.last().unwrap().opcode, OpCode::Throw);
    }
}
