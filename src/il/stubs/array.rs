//! `Get`, `Set` and `Address` of array types.
//!
//! The element address is computed from the array header:
//!
//! ```text
//! rank-N array:  [method table][length][lengths: int32 x N][lower bounds: int32 x N][data]
//! szarray:       [method table][length][data]
//! ```
//!
//! Every index is rebased on its lower bound and checked against its dimension length before
//! it is folded into the flat row-major index.

use crate::{
    il::{body::ILBody, emitter::ILEmitter, opcodes::OpCode, stubs::emit_throw},
    typesystem::{ArrayMethodKind, MethodId, PrimitiveKind, TypeKey, TypeSystemContext},
    Result,
};

const OUT_OF_RANGE: &str = "Index was outside the bounds of the array.";

/// Body of an array accessor. The constructor has none; `newobj` on it is lowered directly.
pub(crate) fn emit_array_accessor(
    ctx: &TypeSystemContext,
    method: MethodId,
    kind: ArrayMethodKind,
) -> Result<Option<ILBody>> {
    if kind == ArrayMethodKind::Ctor {
        return Ok(None);
    }

    let array = ctx.method(method).owner;
    let desc = ctx.type_desc(array);
    let element = ctx.element_type(array)?;
    let pointer_size = ctx.pointer_size();
    let rank = desc.rank();
    let multi_dimensional = matches!(desc.key, TypeKey::Array(..));

    let (lengths, lower_bounds, data) = if multi_dimensional {
        let lengths = 2 * pointer_size;
        (lengths, Some(lengths + rank * 4), lengths + rank * 8)
    } else {
        (pointer_size, None, 2 * pointer_size)
    };

    let int32 = ctx.primitive(PrimitiveKind::I4)?;
    let mut emitter = ILEmitter::new();
    let flat = emitter.new_local(int32);
    let index = emitter.new_local(int32);
    let element_token = emitter.type_token(element);

    emitter.ldc_i4(0);
    emitter.stloc(flat);
    for dimension in 0..rank {
        #[allow(clippy::cast_possible_truncation)]
        emitter.ldarg(dimension as u16 + 1);
        if let Some(lower_bounds) = lower_bounds {
            load_header_int(&mut emitter, lower_bounds + dimension * 4);
            emitter.emit(OpCode::Sub);
        }
        emitter.stloc(index);

        let in_range = emitter.define_label();
        emitter.ldloc(index);
        load_header_int(&mut emitter, lengths + dimension * 4);
        emitter.branch(OpCode::BltUn, in_range);
        emit_throw(ctx, &mut emitter, OUT_OF_RANGE)?;
        emitter.mark_label(in_range);

        emitter.ldloc(flat);
        load_header_int(&mut emitter, lengths + dimension * 4);
        emitter.emit(OpCode::Mul);
        emitter.ldloc(index);
        emitter.emit(OpCode::Add);
        emitter.stloc(flat);
    }

    emitter.ldarg(0);
    emitter.emit(OpCode::ConvI);
    emitter.ldc_i4(i32::try_from(data).map_err(|_| malformed_error!("Array header too large"))?);
    emitter.emit(OpCode::Add);
    emitter.ldloc(flat);
    emitter.emit(OpCode::ConvI);
    emitter.emit_token(OpCode::Sizeof, element_token);
    emitter.emit(OpCode::ConvI);
    emitter.emit(OpCode::Mul);
    emitter.emit(OpCode::Add);

    match kind {
        ArrayMethodKind::Get => emitter.emit_token(OpCode::Ldobj, element_token),
        ArrayMethodKind::Set => {
            #[allow(clippy::cast_possible_truncation)]
            emitter.ldarg(rank as u16 + 1);
            emitter.emit_token(OpCode::Stobj, element_token);
        }
        ArrayMethodKind::Address | ArrayMethodKind::Ctor => {}
    }
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

/// Push the `int32` at `offset` bytes into the array object in argument 0.
fn load_header_int(emitter: &mut ILEmitter, offset: u32) {
    emitter.ldarg(0);
    emitter.emit(OpCode::ConvI);
    #[allow(clippy::cast_possible_wrap)]
    emitter.ldc_i4(offset as i32);
    emitter.emit(OpCode::Add);
    emitter.emit(OpCode::LdindI4);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        il::{decode_stream, Operand},
        metadata::StoreBuilder,
        typesystem::TargetDetails,
    };

    fn context() -> TypeSystemContext {
        TypeSystemContext::new(
            Arc::new(StoreBuilder::new().with_core_library().build()),
            TargetDetails::default(),
        )
    }

    #[test]
    fn rank_two_get_reads_bounds_and_data() {
        let ctx = context();
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        let matrix = ctx.intern(TypeKey::Array(int32, 2)).unwrap();
        let get = ctx.array_method(matrix, ArrayMethodKind::Get).unwrap();

        let body = emit_array_accessor(&ctx, get, ArrayMethodKind::Get).unwrap().unwrap();
        let instructions = decode_stream(&body.code).unwrap();
        let constants: Vec<i64> = instructions
            .iter()
            .filter(|instruction| {
                matches!(instruction.opcode, OpCode::LdcI4S | OpCode::LdcI4)
            })
            .filter_map(|instruction| instruction.immediate())
            .collect();

        // lower bound 0 at 24, length 0 at 16, lower bound 1 at 28, length 1 at 20, data at 32
        assert!(constants.contains(&24));
        assert!(constants.contains(&28));
        assert!(constants.contains(&20));
        assert!(constants.contains(&32));
        assert_eq!(instructions.last().unwrap().opcode, OpCode::Ret);
        assert!(instructions
            .iter()
            .any(|instruction| instruction.opcode == OpCode::Ldobj));
        assert_eq!(body.locals.len(), 2);
    }

    #[test]
    fn set_stores_trailing_argument() {
        let ctx = context();
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        let matrix = ctx.intern(TypeKey::Array(int32, 2)).unwrap();
        let set = ctx.array_method(matrix, ArrayMethodKind::Set).unwrap();

        let body = emit_array_accessor(&ctx, set, ArrayMethodKind::Set).unwrap().unwrap();
        let instructions = decode_stream(&body.code).unwrap();
        let store = instructions.len() - 2;
        assert_eq!(instructions[store].opcode, OpCode::Stobj);
        assert_eq!(instructions[store - 1].opcode, OpCode::Ldarg3);
        assert!(matches!(instructions[store].operand, Operand::Token(_)));
    }

    #[test]
    fn constructor_has_no_body() {
        let ctx = context();
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        let matrix = ctx.intern(TypeKey::Array(int32, 2)).unwrap();
        let ctor = ctx.array_method(matrix, ArrayMethodKind::Ctor).unwrap();
        assert!(emit_array_accessor(&ctx, ctor, ArrayMethodKind::Ctor).unwrap().is_none());
    }
}
