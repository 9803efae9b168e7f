//! Tests for the method importer.

use std::sync::Arc;

use super::*;
use crate::{
    il::ILProvider,
    metadata::{
        method::{ExceptionHandlerFlags, ExceptionRegion},
        MethodAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig,
    },
    typesystem::TargetDetails,
};

struct Fixture {
    ctx: TypeSystemContext,
    provider: ILProvider,
}

impl Fixture {
    fn method(&self, owner: Token, method: Token) -> MethodId {
        let owner = self.ctx.definition_type(owner).unwrap();
        self.ctx.method_for_definition(owner, method).unwrap()
    }

    fn lower(&self, method: MethodId) -> Result<LoweredMethod> {
        let il = self.provider.method_il(&self.ctx, method)?.unwrap();
        lower_method(&self.ctx, method, &il)
    }
}

fn fixture(builder: StoreBuilder) -> Fixture {
    Fixture {
        ctx: TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default()),
        provider: ILProvider::new(false),
    }
}

fn static_method(builder: &mut StoreBuilder, owner: Token, name: &str, ret: TypeSig, params: Vec<TypeSig>) -> Token {
    builder.add_method(owner, name, MethodAttributes::STATIC, MethodSig::new_static(ret, params))
}

#[test]
fn add_uses_one_temporary() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
    let add = static_method(&mut builder, math, "Add", TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]);
    // ldarg.0; ldarg.1; add; ret
    builder.set_body(add, &[0x02, 0x03, 0x58, 0x2A]);
    let fixture = fixture(builder);

    let add = fixture.method(math, add);
    let lowered = fixture.lower(add).unwrap();
    assert!(lowered
        .code
        .starts_with(&format!("int32_t {}(int32_t _a0, int32_t _a1)", lowered.name)));
    assert!(lowered.code.contains("int32_t _1 = _a0 + _a1;"));
    assert!(lowered.code.contains("return _1;"));
    assert_eq!(lowered.code.matches(" + ").count(), 1);
    assert!(lowered.references.methods.is_empty());
}

#[test]
fn stores_materialize_and_locals_start_zeroed() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
    let inc = static_method(&mut builder, math, "Inc", TypeSig::I4, vec![TypeSig::I4]);
    let locals = builder.add_locals(vec![TypeSig::I4]);
    // ldarg.0; stloc.0; ldloc.0; ldc.i4.1; add; ret
    builder.set_method_body(inc, &[0x02, 0x0A, 0x06, 0x17, 0x58, 0x2A], 8, locals, true, &[]);
    let fixture = fixture(builder);

    let lowered = fixture.lower(fixture.method(math, inc)).unwrap();
    assert!(lowered.code.contains("int32_t _l0 = 0;"));
    assert!(lowered.code.contains("_l0 = _a0;"));
    assert!(lowered.code.contains("int32_t _1 = _l0 + 1;"));
}

#[test]
fn diverging_stacks_conflict_at_the_join() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
    let pick = static_method(&mut builder, math, "Pick", TypeSig::I4, vec![TypeSig::Boolean]);
    // 0: ldarg.0; 1: brfalse.s 6; 3: ldc.i4.1; 4: br.s 15; 6: ldc.i8 1; 15: ret
    builder.set_body(
        pick,
        &[0x02, 0x2C, 0x03, 0x17, 0x2B, 0x09, 0x21, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x2A],
    );
    let fixture = fixture(builder);

    let error = fixture.lower(fixture.method(math, pick)).unwrap_err();
    assert!(matches!(error, Error::StackMergeConflict { offset: 15, .. }));
    assert!(error.is_method_local());
}

#[test]
fn matching_stacks_share_spill_slots() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
    let pick = static_method(&mut builder, math, "Pick", TypeSig::I4, vec![TypeSig::Boolean]);
    // 0: ldarg.0; 1: brfalse.s 6; 3: ldc.i4.1; 4: br.s 7; 6: ldc.i4.2; 7: ret
    builder.set_body(pick, &[0x02, 0x2C, 0x03, 0x17, 0x2B, 0x01, 0x18, 0x2A]);
    let fixture = fixture(builder);

    let lowered = fixture.lower(fixture.method(math, pick)).unwrap();
    assert!(lowered.code.contains("int32_t _s0;"));
    assert!(lowered.code.contains("_s0 = 1;"));
    assert!(lowered.code.contains("_s0 = 2;"));
    assert!(lowered.code.contains("if (!(_a0)) goto _bb6;"));
    assert!(lowered.code.contains("return _s0;"));
}

#[test]
fn branch_past_the_end_fails_the_method() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Broken", TypeAttributes::empty(), object);
    let run = static_method(&mut builder, app, "Run", TypeSig::Void, vec![]);
    // br.s +16
    builder.set_body(run, &[0x2B, 0x10]);
    let fixture = fixture(builder);

    let run = fixture.method(app, run);
    let error = fixture.lower(run).unwrap_err();
    assert!(matches!(error, Error::Malformed { .. }));
    assert!(error.is_method_local());

    let stub = trap_stub(&fixture.ctx, run).unwrap();
    assert!(stub.code.starts_with(&format!("void {}()", stub.name)));
    assert!(stub.code.contains("throw 0xC000C000;"));
}

#[test]
fn leave_runs_the_finally_and_comes_back() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Guarded", TypeAttributes::empty(), object);
    let run = static_method(&mut builder, app, "Run", TypeSig::Void, vec![]);
    // 0: nop; 1: leave.s 5; 3: nop; 4: endfinally; 5: ret
    let finally = ExceptionRegion::from_raw(ExceptionHandlerFlags::FINALLY, 0, 3, 3, 2, 0);
    builder.set_method_body(run, &[0x00, 0xDE, 0x02, 0x00, 0xDC, 0x2A], 8, Token::new(0), false, &[finally]);
    let fixture = fixture(builder);

    let code = fixture.lower(fixture.method(app, run)).unwrap().code;
    assert!(code.contains("int __finallyReturn0 = 0;"));
    assert!(code.contains("__finallyReturn0 = 1;"));
    assert!(code.contains("goto _bb3;"));
    assert!(code.contains("\n__returnFromFinally0_1: ;"));
    assert!(code.contains("goto _bb5;"));
    assert!(code.contains("goto __endFinally0;"));
    assert!(code.contains("\n__endFinally0:"));
    assert!(code.contains("case 1: goto __returnFromFinally0_1;"));
    assert!(code.contains("default: __builtin_trap();"));
}

#[test]
fn callvirt_goes_through_the_slot() {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let animal = builder.add_type("App", "Animal", TypeAttributes::empty(), object);
    let speak = builder.add_method(
        animal,
        "Speak",
        MethodAttributes::VIRTUAL,
        MethodSig::new_instance(TypeSig::I4, vec![]),
    );
    builder.set_body(speak, &[0x16, 0x2A]);
    let run = static_method(&mut builder, animal, "Run", TypeSig::I4, vec![TypeSig::Named(animal)]);
    let mut body = vec![0x02, 0x6F];
    body.extend_from_slice(&speak.value().to_le_bytes());
    body.push(0x2A);
    builder.set_body(run, &body);
    let fixture = fixture(builder);

    let speak = fixture.method(animal, speak);
    let lowered = fixture.lower(fixture.method(animal, run)).unwrap();
    let slot = fixture.ctx.mangled_method_name(speak).unwrap();
    assert!(lowered
        .code
        .contains(&format!("int32_t _1 = ((__slot__{slot})__getslot__{slot}(_a0))(_a0);")));
    assert!(lowered.references.virtual_slots.contains(&speak));
    assert!(!lowered.references.methods.contains(&speak));
}

#[test]
fn unboxing_stub_skips_the_method_table() {
    let mut builder = StoreBuilder::new().with_core_library();
    let value_type = builder.core_type("ValueType");
    let point = builder.add_type("App", "Point", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
    let get = builder.add_method(
        point,
        "Get",
        MethodAttributes::VIRTUAL,
        MethodSig::new_instance(TypeSig::I4, vec![]),
    );
    builder.set_body(get, &[0x16, 0x2A]);
    let fixture = fixture(builder);

    let get = fixture.method(point, get);
    let stub = fixture.ctx.unboxing_stub(get);
    let lowered = lower_unboxing_stub(&fixture.ctx, stub).unwrap();
    let target = fixture.ctx.mangled_method_name(get).unwrap();
    assert!(lowered
        .code
        .contains(&format!("return {target}((void*)((uint8_t*)_a0 + sizeof(void*)));")));
    assert!(lowered.references.methods.contains(&get));
    assert!(lower_unboxing_stub(&fixture.ctx, get).is_err());
}

#[test]
fn string_literals_escape_outside_ascii() {
    assert_eq!(handlers::string_literal("hi"), "u\"hi\"");
    assert_eq!(handlers::string_literal("a\"b"), "u\"a\\\"b\"");
    assert_eq!(handlers::string_literal("\u{1}b"), "u\"\\x0001\" u\"b\"");
    assert_eq!(handlers::string_literal("\u{e9}z"), "u\"\\x00e9z\"");
}
