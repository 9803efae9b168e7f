//! Object-mode sessions written to disk and read back.

use std::sync::Arc;

use cilaot::{object::verify, prelude::*, typesystem::TargetArchitecture};
use goblin::elf::Elf;

struct Program {
    session: CompilationSession,
    nodes: Vec<Node>,
}

/// `App.Counter` with a static `total`, a static `Increment` and a virtual `Bump`, plus a data
/// blob pointing at the counter's method table.
fn program(config: CompilerConfig) -> Result<Program> {
    let mut builder = StoreBuilder::new().with_core_library();
    let object = builder.core_type("Object");
    let counter = builder.add_type("App", "Counter", TypeAttributes::empty(), object);
    let total = builder.add_field(counter, "total", FieldAttributes::STATIC, TypeSig::I4);
    let increment = builder.add_method(
        counter,
        "Increment",
        MethodAttributes::STATIC,
        MethodSig::new_static(TypeSig::Void, vec![]),
    );
    // ldsfld total; ldc.i4.1; add; stsfld total; ret
    let mut body = vec![0x7E];
    body.extend_from_slice(&total.value().to_le_bytes());
    body.extend_from_slice(&[0x17, 0x58, 0x80]);
    body.extend_from_slice(&total.value().to_le_bytes());
    body.push(0x2A);
    builder.set_body(increment, &body);
    let bump = builder.add_method(
        counter,
        "Bump",
        MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
        MethodSig::new_instance(TypeSig::Void, vec![]),
    );
    builder.set_body(bump, &[0x2A]);

    let session = CompilationSession::new(Arc::new(builder.build()), config);
    let ctx = session.context();
    let counter = ctx.definition_type(counter)?;
    let increment = ctx.resolve_method_token(increment, &GenericContext::empty())?;
    let bump = ctx.resolve_method_token(bump, &GenericContext::empty())?;

    let mut banner = ObjectDataBuilder::new(session.config().pointer_size());
    banner.emit_pointer("App_Counter__MethodTable", 0);
    banner.emit_u32(0x00C0_FFEE);
    let banner = banner.finish("app_banner", NodeSection::ReadOnlyData);

    let nodes = vec![
        Node::ty(counter),
        Node::method(increment),
        Node::method(bump),
        Node::data(banner),
    ];
    Ok(Program { session, nodes })
}

fn object_config(container: ObjectContainer, target: TargetArchitecture) -> CompilerConfig {
    CompilerConfig::default()
        .with_output_format(OutputFormat::Object)
        .with_container(container)
        .with_target(target)
}

#[test]
fn elf_object_carries_tables_statics_and_data() -> Result<()> {
    let Program { session, nodes } = program(object_config(ObjectContainer::Elf, TargetArchitecture::X64))?;
    let output = session.compile(&nodes)?;
    assert!(output.diagnostics.is_empty());

    let writer = output.object().ok_or_else(|| Error::Verification("no object".to_string()))?;
    let defined = writer.defined_symbols();
    for expected in ["App_Counter__MethodTable", "App_Counter_statics", "app_banner"] {
        assert!(defined.iter().any(|name| name == expected), "{expected} not defined");
    }

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("app.o");
    writer.emit(&path)?;
    let bytes = std::fs::read(&path)?;
    verify(ObjectContainer::Elf, &bytes, &defined)?;

    // methods live in the companion source, so the table's slot refers to an undefined symbol
    let elf = Elf::parse(&bytes)?;
    let undefined: Vec<&str> = elf
        .syms
        .iter()
        .filter(|sym| sym.st_shndx == 0 && sym.st_name != 0)
        .filter_map(|sym| elf.strtab.get_at(sym.st_name))
        .collect();
    assert!(undefined.contains(&"App_Counter__Bump"));

    let source = output.source();
    assert!(source.contains("extern \"C\" App_Counter__MT App_Counter__MethodTable;"));
    assert!(source.contains("App_Counter_statics"));
    assert!(source.contains("void App_Counter__Increment()"));
    Ok(())
}

#[test]
fn slot_of_method_outside_the_program_stays_null() -> Result<()> {
    let Program { session, mut nodes } = program(object_config(ObjectContainer::Elf, TargetArchitecture::X64))?;
    // drop `Bump`; the counter's method table still has its slot
    nodes.remove(2);
    let output = session.compile(&nodes)?;
    assert!(output.diagnostics.is_empty());

    let writer = output.object().ok_or_else(|| Error::Verification("no object".to_string()))?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("partial.o");
    writer.emit(&path)?;
    let bytes = std::fs::read(&path)?;
    verify(ObjectContainer::Elf, &bytes, &writer.defined_symbols())?;

    let elf = Elf::parse(&bytes)?;
    let names: Vec<&str> = elf.syms.iter().filter_map(|sym| elf.strtab.get_at(sym.st_name)).collect();
    assert!(names.contains(&"App_Counter__MethodTable"));
    assert!(!names.contains(&"App_Counter__Bump"));
    Ok(())
}

#[test]
fn every_container_emits_a_verified_object() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let targets = [
        (ObjectContainer::Elf, TargetArchitecture::X86, "x86.o"),
        (ObjectContainer::Coff, TargetArchitecture::X64, "x64.obj"),
        (ObjectContainer::MachO, TargetArchitecture::Arm64, "arm64.o"),
    ];
    for (container, target, file) in targets {
        let Program { session, nodes } = program(object_config(container, target))?;
        let output = session.compile(&nodes)?;
        let writer = output.object().ok_or_else(|| Error::Verification("no object".to_string()))?;
        let path = dir.path().join(file);
        writer.emit(&path)?;
        assert!(path.exists());
    }
    Ok(())
}

#[test]
fn source_mode_produces_no_object() -> Result<()> {
    let Program { session, nodes } = program(CompilerConfig::default())?;
    let output = session.compile(&nodes)?;
    assert!(output.object().is_none());
    assert!(output.source().contains("App_Counter__MT App_Counter__MethodTable = {"));
    Ok(())
}
