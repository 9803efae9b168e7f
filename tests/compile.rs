//! End-to-end compilation of small programs through a session.

use std::sync::Arc;

use cilaot::{
    codegen::{header_size, MethodTable},
    metadata::{NativeCallingConvention, PInvokeInfo},
    prelude::*,
};

fn session(builder: StoreBuilder, config: CompilerConfig) -> CompilationSession {
    CompilationSession::new(Arc::new(builder.build()), config)
}

fn method(session: &CompilationSession, token: Token) -> Result<MethodId> {
    session.context().resolve_method_token(token, &GenericContext::empty())
}

fn call(body: &mut Vec<u8>, target: Token) {
    body.push(0x28);
    body.extend_from_slice(&target.value().to_le_bytes());
}

#[test]
fn add_lowers_to_one_addition() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
    let add = builder.add_method(
        math,
        "Add",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
    );
    // ldarg.0; ldarg.1; add; ret
    builder.set_body(add, &[0x02, 0x03, 0x58, 0x2A]);
    let session = session(builder, CompilerConfig::default());

    let add = method(&session, add)?;
    let output = session.compile(&[Node::method(add)])?;
    let source = output.source();
    assert!(source.contains("int32_t App_Math__Add(int32_t _a0, int32_t _a1)"));
    assert_eq!(source.matches("_a0 + _a1").count(), 1);
    assert!(source.contains("return _1;"));
    assert!(output.diagnostics.is_empty());
    assert_eq!(output.methods_compiled, 1);
    Ok(())
}

#[test]
fn invalid_branch_becomes_a_trap_stub() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Program", TypeAttributes::empty(), object);
    let broken = builder.add_method(
        app,
        "Broken",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::Void, vec![]),
    );
    // br.s +16, past the end of the body
    builder.set_body(broken, &[0x2B, 0x10]);
    let twice = builder.add_method(
        app,
        "Twice",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]),
    );
    // ldarg.0; ldarg.0; add; ret
    builder.set_body(twice, &[0x02, 0x02, 0x58, 0x2A]);
    let session = session(builder, CompilerConfig::default());

    let broken = method(&session, broken)?;
    let twice = method(&session, twice)?;
    let nodes = [Node::method(broken), Node::method(twice)];
    let output = session.compile(&nodes)?;

    assert_eq!(output.diagnostics.len(), 1);
    assert_eq!(output.diagnostics[0].method, broken);
    assert!(!output.diagnostics[0].message.is_empty());
    assert_eq!(output.methods_compiled, 2);

    let source = output.source();
    assert!(source.contains("void App_Program__Broken()\n{\n    throw 0xC000C000;\n}"));
    assert!(source.contains("int32_t App_Program__Twice(int32_t _a0)"));
    assert!(source.contains("_a0 + _a0"));
    assert!(nodes.iter().all(Node::is_compiled));
    Ok(())
}

#[test]
fn open_signature_fails_without_a_stub() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Program", TypeAttributes::empty(), object);
    let identity = builder.add_method(
        app,
        "Identity",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::MVar(0)]).with_generic_params(1),
    );
    // ldarg.0; ret
    builder.set_body(identity, &[0x02, 0x2A]);
    let one = builder.add_method(
        app,
        "One",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![]),
    );
    // ldc.i4.1; ret
    builder.set_body(one, &[0x17, 0x2A]);
    let session = session(builder, CompilerConfig::default());

    // the uninstantiated definition: its parameter type has no C++ spelling
    let identity = method(&session, identity)?;
    let one = method(&session, one)?;
    let output = session.compile(&[Node::method(identity), Node::method(one)])?;

    assert_eq!(output.diagnostics.len(), 1);
    assert_eq!(output.diagnostics[0].method, identity);
    let source = output.source();
    assert!(!source.contains("App_Program__Identity"));
    assert!(source.contains("int32_t App_Program__One()"));
    Ok(())
}

#[test]
fn compiled_nodes_are_skipped() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Program", TypeAttributes::empty(), object);
    let zero = builder.add_method(
        app,
        "Zero",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![]),
    );
    // ldc.i4.0; ret
    builder.set_body(zero, &[0x16, 0x2A]);
    let session = session(builder, CompilerConfig::default().with_parallel(false));

    let nodes = [Node::method(method(&session, zero)?)];
    let first = session.compile(&nodes)?;
    assert_eq!(first.methods_compiled, 1);

    let second = session.compile(&nodes)?;
    assert_eq!(second.methods_compiled, 0);
    assert!(!second.source().contains("App_Program__Zero()\n{"));
    Ok(())
}

#[test]
fn override_fills_the_base_slot() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let animal = builder.add_type("App", "Animal", TypeAttributes::empty(), object);
    let animal_speak = builder.add_method(
        animal,
        "Speak",
        MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
        MethodSig::new_instance(TypeSig::I4, vec![]),
    );
    builder.set_body(animal_speak, &[0x16, 0x2A]);
    let dog = builder.add_type("App", "Dog", TypeAttributes::empty(), Some(TypeSig::Named(animal)));
    let dog_speak = builder.add_method(
        dog,
        "Speak",
        MethodAttributes::VIRTUAL,
        MethodSig::new_instance(TypeSig::I4, vec![]),
    );
    builder.set_body(dog_speak, &[0x17, 0x2A]);
    let talk = builder.add_method(
        animal,
        "Talk",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::Named(animal)]),
    );
    // ldarg.0; callvirt Animal::Speak; ret
    let mut body = vec![0x02, 0x6F];
    body.extend_from_slice(&animal_speak.value().to_le_bytes());
    body.push(0x2A);
    builder.set_body(talk, &body);
    let session = session(builder, CompilerConfig::default());
    let ctx = session.context();

    let dog_type = ctx.definition_type(dog)?;
    let animal_speak = method(&session, animal_speak)?;
    let dog_speak = method(&session, dog_speak)?;
    let talk = method(&session, talk)?;

    let slot = ctx.virtual_slot(animal_speak)?;
    assert_eq!(ctx.virtual_slot(dog_speak)?, slot);

    let table = MethodTable::build(ctx, dog_type)?;
    assert_eq!(table.slots[slot as usize], Some(dog_speak));

    // the accessor skips the header and indexes the slot array; on Dog's table that lands on
    // the relocation naming Dog.Speak
    let node = table.to_node(ctx, |method| Ok(Some(ctx.mangled_method_name(method)?.to_string())))?;
    let pointer_size = ctx.pointer_size();
    let offset = header_size(pointer_size) + slot * pointer_size;
    let target = node
        .relocations
        .iter()
        .find(|relocation| relocation.offset == offset)
        .map(|relocation| relocation.target.as_str());
    assert_eq!(target, Some("App_Dog__Speak"));

    let nodes = [
        Node::ty(dog_type),
        Node::method(animal_speak),
        Node::method(dog_speak),
        Node::method(talk),
    ];
    let output = session.compile(&nodes)?;
    let source = output.source();
    assert!(source.contains(&format!(
        "static inline void* __getslot__App_Animal__Speak(void* pThis) {{ return *((void**)(*((RawMethodTable**)pThis) + 1) + {slot}); }}"
    )));
    assert!(source.contains("((__slot__App_Animal__Speak)__getslot__App_Animal__Speak(_a0))(_a0)"));
    assert!(source.contains("(void*)&App_Dog__Speak"));
    assert!(source.contains("(RawMethodTable*)&App_Animal__MethodTable"));
    let animal_table = source.find("App_Animal__MT App_Animal__MethodTable = {");
    let dog_table = source.find("App_Dog__MT App_Dog__MethodTable = {");
    assert!(animal_table.is_some() && dog_table.is_some());
    assert!(animal_table < dog_table);
    Ok(())
}

#[test]
fn aliased_import_gets_one_declaration_and_a_cast_forwarder() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let native = builder.add_type("App", "Native", TypeAttributes::empty(), object);
    let narrow = builder.add_method(
        native,
        "WriteNarrow",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4]),
    );
    let wide = builder.add_method(
        native,
        "WriteWide",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![TypeSig::I8]),
    );
    for import in [narrow, wide] {
        builder.set_pinvoke(
            import,
            PInvokeInfo {
                module: "libc".to_string(),
                entry_point: "write_value".to_string(),
                calling_convention: NativeCallingConvention::Cdecl,
            },
        );
    }
    let main = builder.add_method(
        native,
        "Run",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::Void, vec![]),
    );
    // ldc.i4.1; call WriteNarrow; pop; ldc.i4.2; conv.i8; call WriteWide; pop; ret
    let mut body = vec![0x17];
    call(&mut body, narrow);
    body.extend_from_slice(&[0x26, 0x18, 0x6A]);
    call(&mut body, wide);
    body.extend_from_slice(&[0x26, 0x2A]);
    builder.set_body(main, &body);
    let session = session(builder, CompilerConfig::default());

    let nodes = [
        Node::method(method(&session, main)?),
        Node::method(method(&session, narrow)?),
        Node::method(method(&session, wide)?),
    ];
    let output = session.compile(&nodes)?;
    let source = output.source();

    assert_eq!(source.matches("extern \"C\" int32_t write_value(").count(), 1);
    assert!(source.contains("extern \"C\" int32_t write_value(int32_t);"));
    assert!(source.contains("int32_t App_Native__WriteNarrow(int32_t _a0) { return write_value(_a0); }"));
    assert!(source.contains(
        "int32_t App_Native__WriteWide(int64_t _a0) { return ((__slot__App_Native__WriteWide)(void*)&write_value)(_a0); }"
    ));
    assert!(output.diagnostics.is_empty());
    Ok(())
}

#[test]
fn entry_point_gets_a_main_stub() -> Result<()> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let app = builder.add_type("App", "Program", TypeAttributes::empty(), object);
    let main = builder.add_method(
        app,
        "Main",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::I4, vec![]),
    );
    // ldc.i4.7; ret
    builder.set_body(main, &[0x1D, 0x2A]);
    let config = CompilerConfig::default().with_entry_point(main).with_runtime_header("gc.h");
    let session = session(builder, config);

    let output = session.compile(&[Node::method(method(&session, main)?)])?;
    let source = output.source();
    assert!(source.starts_with("#include \"gc.h\"\n"));
    assert!(source.contains("int main(int argc, char* argv[])"));
    assert!(source.contains("int ret = App_Program__Main();"));
    Ok(())
}
