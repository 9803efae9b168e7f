//! Canonical identity and layout of generic instantiations seen through the public API.

use std::sync::Arc;

use cilaot::{prelude::*, typesystem::PrimitiveKind};
use rayon::prelude::*;

struct Generics {
    ctx: TypeSystemContext,
    cell: Token,
    get: Token,
}

/// `App.Cell<T>`: a value type holding a `T` and an `int32` tag, with `T Get()`.
fn generics() -> Generics {
    let mut builder = StoreBuilder::new().with_core_library();
    let value_type = builder.core_type("ValueType");
    let cell = builder.add_type("App", "Cell`1", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
    builder.set_generic_params(cell, 1);
    builder.add_field(cell, "Value", FieldAttributes::empty(), TypeSig::Var(0));
    builder.add_field(cell, "Tag", FieldAttributes::empty(), TypeSig::I4);
    let get = builder.add_method(
        cell,
        "Get",
        MethodAttributes::empty(),
        MethodSig::new_instance(TypeSig::Var(0), vec![]),
    );
    // ldnull; ret
    builder.set_body(get, &[0x14, 0x2A]);

    let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
    Generics { ctx, cell, get }
}

#[test]
fn concurrent_instantiation_converges_on_one_type() -> Result<()> {
    let Generics { ctx, cell, .. } = generics();
    let sig = TypeSig::GenericInst(cell, vec![TypeSig::I8]);

    let ids = (0..64)
        .into_par_iter()
        .map(|_| ctx.resolve_sig(&sig, &GenericContext::empty()))
        .collect::<Result<Vec<_>>>()?;
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));

    let definition = ctx.definition_type(cell)?;
    let int64 = ctx.primitive(PrimitiveKind::I8)?;
    assert_eq!(ctx.instantiate(definition, &[int64])?, ids[0]);

    let arrays = (0..64)
        .into_par_iter()
        .map(|_| ctx.intern(TypeKey::SzArray(ids[0])))
        .collect::<Result<Vec<_>>>()?;
    assert!(arrays.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}

#[test]
fn instantiation_layout_follows_the_argument() -> Result<()> {
    let Generics { ctx, cell, .. } = generics();
    let definition = ctx.definition_type(cell)?;
    let wide = ctx.instantiate(definition, &[ctx.primitive(PrimitiveKind::I8)?])?;
    let narrow = ctx.instantiate(definition, &[ctx.primitive(PrimitiveKind::U1)?])?;
    assert_ne!(wide, narrow);

    let wide_layout = ctx.layout(wide)?;
    let offsets: Vec<u32> = wide_layout.field_offsets.iter().map(|(_, offset)| *offset).collect();
    assert_eq!(offsets, vec![0, 8]);
    assert_eq!(wide_layout.instance_size, 16);
    assert_eq!(wide_layout.alignment, 8);

    let narrow_layout = ctx.layout(narrow)?;
    let offsets: Vec<u32> = narrow_layout.field_offsets.iter().map(|(_, offset)| *offset).collect();
    assert_eq!(offsets, vec![0, 4]);
    assert_eq!(narrow_layout.instance_size, 8);
    assert_eq!(narrow_layout.alignment, 4);
    Ok(())
}

#[test]
fn methods_on_instantiations_are_distinct_and_substituted() -> Result<()> {
    let Generics { ctx, cell, get } = generics();
    let definition = ctx.definition_type(cell)?;
    let int64 = ctx.primitive(PrimitiveKind::I8)?;
    let uint8 = ctx.primitive(PrimitiveKind::U1)?;
    let wide = ctx.instantiate(definition, &[int64])?;
    let narrow = ctx.instantiate(definition, &[uint8])?;

    let wide_get = ctx.method_for_definition(wide, get)?;
    let narrow_get = ctx.method_for_definition(narrow, get)?;
    assert_ne!(wide_get, narrow_get);
    assert_eq!(ctx.method_for_definition(wide, get)?, wide_get);
    assert_eq!(ctx.find_method(wide, "Get")?, Some(wide_get));

    assert_eq!(ctx.method(wide_get).signature.return_type, int64);
    assert_eq!(ctx.method(narrow_get).signature.return_type, uint8);
    assert_ne!(ctx.mangled_method_name(wide_get)?, ctx.mangled_method_name(narrow_get)?);
    Ok(())
}

#[test]
fn void_and_wrong_arity_are_rejected() -> Result<()> {
    let Generics { ctx, cell, .. } = generics();
    let definition = ctx.definition_type(cell)?;
    let void = ctx.primitive(PrimitiveKind::Void)?;
    let int32 = ctx.primitive(PrimitiveKind::I4)?;

    assert!(matches!(
        ctx.instantiate(definition, &[void]),
        Err(Error::InvalidGenericInstantiation(_))
    ));
    assert!(matches!(
        ctx.instantiate(definition, &[int32, int32]),
        Err(Error::InvalidGenericInstantiation(_))
    ));
    assert!(matches!(
        ctx.instantiate(definition, &[]),
        Err(Error::InvalidGenericInstantiation(_))
    ));
    Ok(())
}
