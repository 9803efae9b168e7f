//! Bodies of methods the compiler implements itself.
//!
//! Two tables: intrinsics whose body is the same for every instantiation (the `Unsafe`
//! primitives, `Debug.DebugBreak`, ...) are emitted once on the generic definition and shared
//! through the usual substitution view. Intrinsics whose body depends on the type argument
//! (`RuntimeHelpers.IsReference`, `EqualityComparerHelpers.EnumOnlyEquals`, `Comparer<T>.Create`,
//! ...) are emitted per instantiation and return `None` whenever the argument is not concrete enough to decide,
//! which makes the provider fall back to the general body.

use crate::{
    il::{body::ILBody, emitter::ILEmitter, opcodes::OpCode, stubs::method_parameter},
    typesystem::{GenericContext, MethodId, TypeCategory, TypeId, TypeSystemContext},
    Result,
};

const INTRINSIC_NAMESPACE: &str = "System.Runtime.CompilerServices";
const INTRINSIC_ATTRIBUTE: &str = "IntrinsicAttribute";
const COLLECTIONS_NAMESPACE: &str = "System.Collections.Generic";

/// `true` if the method's definition carries `IntrinsicAttribute`.
pub(crate) fn is_intrinsic(ctx: &TypeSystemContext, method: MethodId) -> bool {
    ctx.method_has_attribute(method, INTRINSIC_NAMESPACE, INTRINSIC_ATTRIBUTE)
}

/// Intrinsics with one body for all instantiations.
pub(crate) fn emit_intrinsic(
    ctx: &TypeSystemContext,
    method: MethodId,
    supports_relative_pointers: bool,
) -> Result<Option<ILBody>> {
    let desc = ctx.method(method);
    let owner = ctx.type_desc(desc.owner);

    if owner.is_named("Internal.Runtime.CompilerServices", "Unsafe") {
        return emit_unsafe(ctx, &desc.name);
    }
    if owner.is_named("System.Diagnostics", "Debug") && desc.name == "DebugBreak" {
        let mut emitter = ILEmitter::new();
        emitter.emit(OpCode::Break);
        emitter.emit(OpCode::Ret);
        return emitter.finish().map(Some);
    }
    if owner.is_named("System", "EETypePtr") && desc.name == "EETypePtrOf" {
        return emit_type_handle_of(ctx, desc.signature.return_type);
    }
    if owner.is_named("Internal.Runtime", "EEType") && desc.name == "get_SupportsRelativePointers" {
        let mut emitter = ILEmitter::new();
        emitter.ldc_i4(i32::from(supports_relative_pointers));
        emitter.emit(OpCode::Ret);
        return emitter.finish().map(Some);
    }
    Ok(None)
}

fn emit_unsafe(ctx: &TypeSystemContext, name: &str) -> Result<Option<ILBody>> {
    let mut emitter = ILEmitter::new();
    match name {
        "AsPointer" => {
            emitter.ldarg(0);
            emitter.emit(OpCode::ConvU);
        }
        "As" | "AsRef" => emitter.ldarg(0),
        "SizeOf" => {
            let element = emitter.type_token(method_parameter(ctx, 0)?);
            emitter.emit_token(OpCode::Sizeof, element);
        }
        "Add" => {
            let element = emitter.type_token(method_parameter(ctx, 0)?);
            emitter.ldarg(0);
            emitter.ldarg(1);
            emitter.emit_token(OpCode::Sizeof, element);
            emitter.emit(OpCode::Mul);
            emitter.emit(OpCode::ConvI);
            emitter.emit(OpCode::Add);
        }
        "AreSame" => {
            emitter.ldarg(0);
            emitter.ldarg(1);
            emitter.emit(OpCode::Ceq);
        }
        "Read" => {
            let element = emitter.type_token(method_parameter(ctx, 0)?);
            emitter.ldarg(0);
            emitter.emit_token(OpCode::Ldobj, element);
        }
        "Write" => {
            let element = emitter.type_token(method_parameter(ctx, 0)?);
            emitter.ldarg(0);
            emitter.ldarg(1);
            emitter.emit_token(OpCode::Stobj, element);
        }
        "InitBlock" | "CopyBlock" => {
            emitter.ldarg(0);
            emitter.ldarg(1);
            emitter.ldarg(2);
            emitter.emit(if name == "InitBlock" {
                OpCode::Initblk
            } else {
                OpCode::Cpblk
            });
        }
        _ => return Ok(None),
    }
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

/// `EETypePtrOf<T>()`: a handle struct whose single field holds `T`'s method table.
fn emit_type_handle_of(ctx: &TypeSystemContext, handle: TypeId) -> Result<Option<ILBody>> {
    let Some(value_field) = ctx.instance_fields(handle)?.first().copied() else {
        return Ok(None);
    };

    let mut emitter = ILEmitter::new();
    let result = emitter.new_local(handle);
    let element = emitter.type_token(method_parameter(ctx, 0)?);
    let value_field = emitter.field_token(value_field);
    emitter.ldloca(result);
    emitter.emit_token(OpCode::Ldtoken, element);
    emitter.emit_token(OpCode::Stfld, value_field);
    emitter.ldloc(result);
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

/// Intrinsics whose body depends on the instantiation. `None` means "use the general body".
pub(crate) fn emit_per_instantiation_intrinsic(
    ctx: &TypeSystemContext,
    method: MethodId,
) -> Result<Option<ILBody>> {
    let desc = ctx.method(method);
    let owner = ctx.type_desc(desc.owner);

    if desc.name == "Create" {
        if owner.is_named(COLLECTIONS_NAMESPACE, "Comparer`1") {
            return emit_comparer_create(ctx, desc.owner, ComparerFamily::Ordering);
        }
        if owner.is_named(COLLECTIONS_NAMESPACE, "EqualityComparer`1") {
            return emit_comparer_create(ctx, desc.owner, ComparerFamily::Equality);
        }
    }

    let Some(&element) = desc.instantiation.first() else {
        return Ok(None);
    };
    if owner.is_named("System.Runtime.CompilerServices", "RuntimeHelpers") {
        return emit_runtime_helpers(ctx, &desc.name, element);
    }
    if owner.is_named("Internal.IntrinsicSupport", "EqualityComparerHelpers") {
        return match desc.name.as_str() {
            "EnumOnlyEquals" => emit_enum_only_equals(ctx, element),
            "GetComparerForReferenceTypesOnly" => {
                if !is_exact(ctx, element) || ctx.type_desc(element).is_gc_pointer() {
                    return Ok(None);
                }
                let mut emitter = ILEmitter::new();
                emitter.emit(OpCode::Ldnull);
                emitter.emit(OpCode::Ret);
                emitter.finish().map(Some)
            }
            "StructOnlyEquals" => emit_struct_only_equals(ctx, desc.owner, element),
            _ => Ok(None),
        };
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComparerFamily {
    /// `Comparer<T>`, specialized on `IComparable<T>`
    Ordering,
    /// `EqualityComparer<T>`, specialized on `IEquatable<T>`
    Equality,
}

impl ComparerFamily {
    fn interface(self) -> &'static str {
        match self {
            ComparerFamily::Ordering => "IComparable`1",
            ComparerFamily::Equality => "IEquatable`1",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ComparerFamily::Ordering => "Comparer`1",
            ComparerFamily::Equality => "EqualityComparer`1",
        }
    }
}

/// `Create()` on `Comparer<T>` or `EqualityComparer<T>`: construct the specialized comparer for
/// `T` directly. `Nullable<U>` over a comparable `U` picks the nullable comparer, enums the enum
/// comparer, self-comparable types the generic one and everything else the object comparer.
fn emit_comparer_create(
    ctx: &TypeSystemContext,
    comparer: TypeId,
    family: ComparerFamily,
) -> Result<Option<ILBody>> {
    let Some(&element) = ctx.type_desc(comparer).instantiation().first() else {
        return Ok(None);
    };
    if !is_exact(ctx, element) {
        return Ok(None);
    }

    let desc = ctx.type_desc(element);
    let nullable_of = match desc.instantiation().first() {
        Some(&inner)
            if desc.is_named("System", "Nullable`1") && implements_self_interface(ctx, inner, family.interface())? =>
        {
            Some(inner)
        }
        _ => None,
    };
    let (prefix, argument) = if let Some(inner) = nullable_of {
        ("Nullable", inner)
    } else if desc.category == TypeCategory::Enum {
        ("Enum", element)
    } else if implements_self_interface(ctx, element, family.interface())? {
        ("Generic", element)
    } else {
        ("Object", element)
    };

    let name = format!("{prefix}{}", family.suffix());
    let Some(definition) = ctx.store().find_type(COLLECTIONS_NAMESPACE, &name) else {
        return Ok(None);
    };
    let specialized = ctx.instantiate(ctx.definition_type(definition)?, &[argument])?;
    let Some(ctor) = ctx.find_method(specialized, ".ctor")? else {
        return Ok(None);
    };

    let mut emitter = ILEmitter::new();
    let ctor = emitter.method_token(ctor);
    emitter.emit_token(OpCode::Newobj, ctor);
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

/// Not a generic parameter and not a canonical placeholder.
fn is_exact(ctx: &TypeSystemContext, ty: TypeId) -> bool {
    !ctx.has_open_parameters(ty) && !ctx.is_universal_canon(ty)
}

fn emit_runtime_helpers(ctx: &TypeSystemContext, name: &str, element: TypeId) -> Result<Option<ILBody>> {
    if !matches!(name, "IsReferenceOrContainsReferences" | "IsReference" | "IsBitwiseEquatable") {
        return Ok(None);
    }
    if !is_exact(ctx, element) {
        return Ok(None);
    }

    let is_reference = ctx.type_desc(element).is_gc_pointer();
    let result = match name {
        // Value types compare through their Equals overload, so only the general body knows.
        "IsBitwiseEquatable" if !is_reference => return Ok(None),
        "IsBitwiseEquatable" => false,
        "IsReference" => is_reference,
        _ => ctx.contains_gc_pointers(element)?,
    };

    let mut emitter = ILEmitter::new();
    emitter.ldc_i4(i32::from(result));
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

fn emit_enum_only_equals(ctx: &TypeSystemContext, element: TypeId) -> Result<Option<ILBody>> {
    if ctx.type_desc(element).category != TypeCategory::Enum {
        return Ok(None);
    }
    let underlying = ctx.enum_underlying_type(element)?;
    let (size, _) = ctx.field_size_and_alignment(underlying)?;
    let widen = if size <= 4 { OpCode::ConvI4 } else { OpCode::ConvI8 };

    let mut emitter = ILEmitter::new();
    emitter.ldarg(0);
    emitter.emit(widen);
    emitter.ldarg(1);
    emitter.emit(widen);
    emitter.emit(OpCode::Ceq);
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

fn emit_struct_only_equals(
    ctx: &TypeSystemContext,
    helpers: TypeId,
    element: TypeId,
) -> Result<Option<ILBody>> {
    if !is_exact(ctx, element) || ctx.type_desc(element).is_gc_pointer() {
        return Ok(None);
    }

    let desc = ctx.type_desc(element);
    let nullable_of = match desc.instantiation().first() {
        Some(&inner)
            if desc.is_named("System", "Nullable`1") && implements_self_interface(ctx, inner, "IEquatable`1")? =>
        {
            Some(inner)
        }
        _ => None,
    };
    let (helper, argument) = if desc.category == TypeCategory::Enum {
        ("EnumOnlyEquals", element)
    } else if let Some(inner) = nullable_of {
        ("StructOnlyEqualsNullable", inner)
    } else if implements_self_interface(ctx, element, "IEquatable`1")? {
        ("StructOnlyEqualsIEquatable", element)
    } else {
        ("StructOnlyNormalEquals", element)
    };

    let Some(definition) = ctx.find_method(helpers, helper)? else {
        return Ok(None);
    };
    let target = ctx.instantiate_method(definition, &[argument])?;

    let mut emitter = ILEmitter::new();
    let target = emitter.method_token(target);
    emitter.ldarg(0);
    emitter.ldarg(1);
    emitter.emit_token(OpCode::Call, target);
    emitter.emit(OpCode::Ret);
    emitter.finish().map(Some)
}

/// `true` if `ty` declares `System.<interface><ty>`, e.g. `IEquatable<ty>`.
fn implements_self_interface(ctx: &TypeSystemContext, ty: TypeId, interface: &str) -> Result<bool> {
    let Some(open) = ctx.store().find_type("System", interface) else {
        return Ok(false);
    };
    let Some(definition) = ctx.type_definition(ty) else {
        return Ok(false);
    };
    let wanted = ctx.instantiate(ctx.definition_type(open)?, &[ty])?;
    let context = GenericContext::for_type(ctx.type_desc(ty).instantiation());
    for implemented in &ctx.type_record(definition)?.interfaces {
        if ctx.resolve_sig(implemented, &context)? == wanted {
            return Ok(true);
        }
    }
    Ok(false)
}
