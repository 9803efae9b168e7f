//! Managed types and members as C++ spellings.
//!
//! Object references and managed pointers are `void*`, unmanaged pointers and function pointers
//! `intptr_t` so they match their stack kind; field access casts to the owner's struct. Enums
//! take the spelling of their underlying integer, other value types the mangled name of their
//! struct.

use crate::{
    codegen::stack::StackValueKind,
    typesystem::{
        sanitize, FieldId, MethodId, MethodKind, MethodSignature, PrimitiveKind, StaticPool,
        TypeCategory, TypeId, TypeKey, TypeSystemContext,
    },
    Result,
};

const RESERVED: &[&str] = &[
    "auto", "bool", "break", "case", "catch", "char", "class", "const", "continue", "default",
    "delete", "do", "double", "else", "enum", "explicit", "extern", "false", "float", "for",
    "friend", "goto", "if", "inline", "int", "long", "namespace", "new", "operator", "private",
    "protected", "public", "register", "return", "short", "signed", "sizeof", "static", "struct",
    "switch", "template", "this", "throw", "true", "try", "typedef", "typename", "union",
    "unsigned", "using", "virtual", "void", "volatile", "while",
];

/// C++ spelling of a primitive.
#[must_use]
pub fn primitive_name(kind: PrimitiveKind) -> &'static str {
    match kind {
        PrimitiveKind::Void => "void",
        PrimitiveKind::Boolean | PrimitiveKind::U1 => "uint8_t",
        PrimitiveKind::Char | PrimitiveKind::U2 => "uint16_t",
        PrimitiveKind::I1 => "int8_t",
        PrimitiveKind::I2 => "int16_t",
        PrimitiveKind::I4 => "int32_t",
        PrimitiveKind::U4 => "uint32_t",
        PrimitiveKind::I8 => "int64_t",
        PrimitiveKind::U8 => "uint64_t",
        PrimitiveKind::R4 => "float",
        PrimitiveKind::R8 => "double",
        PrimitiveKind::I => "intptr_t",
        PrimitiveKind::U => "uintptr_t",
    }
}

/// Name of the struct emitted for a value type.
#[must_use]
pub fn value_type_name(ctx: &TypeSystemContext, ty: TypeId) -> String {
    ctx.mangled_type_name(ty).to_string()
}

/// C++ spelling of a managed type in signatures, locals and fields.
///
/// # Errors
/// Returns [`crate::Error::UnsupportedConstruct`] for open generic types.
pub fn cpp_type_name(ctx: &TypeSystemContext, ty: TypeId) -> Result<String> {
    let desc = ctx.type_desc(ty);
    match &desc.key {
        TypeKey::Primitive(kind) => Ok(primitive_name(*kind).to_string()),
        TypeKey::GenericParameter(..) | TypeKey::UniversalCanon => {
            Err(unsupported!("open type {} has no native spelling", ctx.type_name(ty)))
        }
        TypeKey::Definition(..) => match desc.category {
            TypeCategory::Enum => cpp_type_name(ctx, ctx.enum_underlying_type(ty)?),
            TypeCategory::ValueType => Ok(value_type_name(ctx, ty)),
            _ => Ok("void*".to_string()),
        },
        TypeKey::Pointer(_) | TypeKey::FunctionPointer(_) => Ok("intptr_t".to_string()),
        _ => Ok("void*".to_string()),
    }
}

/// `true` if `ty` is `void`.
#[must_use]
pub fn is_void(ctx: &TypeSystemContext, ty: TypeId) -> bool {
    ctx.type_desc(ty).primitive() == Some(PrimitiveKind::Void)
}

/// Make `name` usable as a C++ identifier.
#[must_use]
pub fn identifier(name: &str) -> String {
    let mut name = sanitize(name);
    if RESERVED.contains(&name.as_str()) {
        name.push('_');
    }
    name
}

/// One data member of an emitted struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructMember {
    /// The field
    pub field: FieldId,
    /// Member name, unique within the struct
    pub name: String,
    /// Byte offset
    pub offset: u32,
    /// C++ type
    pub cpp_type: String,
    /// Storage size
    pub size: u32,
}

fn members_from(ctx: &TypeSystemContext, fields: &[(FieldId, u32)]) -> Result<Vec<StructMember>> {
    let mut members: Vec<StructMember> = Vec::with_capacity(fields.len());
    for (index, (field, offset)) in fields.iter().enumerate() {
        let desc = ctx.field(*field);
        let mut name = identifier(&desc.name);
        if name == "__mt" || members.iter().any(|member| member.name == name) {
            name = format!("{name}_{index}");
        }
        let (size, _) = ctx.field_size_and_alignment(desc.field_type)?;
        members.push(StructMember {
            field: *field,
            name,
            offset: *offset,
            cpp_type: cpp_type_name(ctx, desc.field_type)?,
            size,
        });
    }
    Ok(members)
}

/// Instance data members of a type's struct, including inherited ones, in layout order.
///
/// # Errors
/// Propagates layout failures.
pub fn instance_members(ctx: &TypeSystemContext, ty: TypeId) -> Result<Vec<StructMember>> {
    let layout = ctx.layout(ty)?;
    members_from(ctx, &layout.field_offsets)
}

/// Members of one static storage pool.
///
/// # Errors
/// Propagates layout failures of value-type statics.
pub fn static_members(ctx: &TypeSystemContext, pool: &StaticPool) -> Result<Vec<StructMember>> {
    members_from(ctx, &pool.fields)
}

/// Name of `field` as a member of its owner's struct.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the field is not laid out in its owner.
pub fn member_name(ctx: &TypeSystemContext, field: FieldId) -> Result<String> {
    let owner = ctx.field(field).owner;
    let members = if ctx.field(field).is_static() {
        let (kind, _) = ctx.static_field_location(field)?;
        let pools = ctx.static_pools(owner)?;
        static_members(ctx, &pools[kind as usize])?
    } else {
        instance_members(ctx, owner)?
    };
    members
        .into_iter()
        .find(|member| member.field == field)
        .map(|member| member.name)
        .ok_or_else(|| malformed_error!("{} is not laid out in its owner", ctx.field(field).name))
}

/// Type of the implicit `this` parameter: a by-ref for value-type owners, the owner otherwise.
///
/// # Errors
/// Propagates interning failures.
pub fn this_type(ctx: &TypeSystemContext, method: MethodId) -> Result<TypeId> {
    let desc = ctx.method(method);
    if matches!(desc.kind, MethodKind::UnboxingStub { .. }) {
        return ctx.well_known(crate::typesystem::WellKnownType::Object);
    }
    if ctx.type_desc(desc.owner).is_value_type() {
        ctx.intern(TypeKey::ByRef(desc.owner))
    } else {
        Ok(desc.owner)
    }
}

/// Parameter types of a method as called, `this` first for instance methods.
///
/// # Errors
/// Propagates interning failures.
pub fn call_params(ctx: &TypeSystemContext, method: MethodId) -> Result<Vec<TypeId>> {
    let desc = ctx.method(method);
    let mut params = Vec::with_capacity(desc.signature.params.len() + 1);
    if !desc.signature.is_static {
        params.push(this_type(ctx, method)?);
    }
    params.extend(desc.signature.params.iter().copied());
    Ok(params)
}

/// `ret name(T0 _a0, T1 _a1)` for a method, without linkage.
///
/// # Errors
/// Returns [`crate::Error::UnsupportedConstruct`] for signatures mentioning open types.
pub fn method_declaration(ctx: &TypeSystemContext, method: MethodId, name: &str) -> Result<String> {
    let params = call_params(ctx, method)?;
    let mut rendered = Vec::with_capacity(params.len());
    for (index, param) in params.iter().enumerate() {
        rendered.push(format!("{} _a{}", cpp_type_name(ctx, *param)?, index));
    }
    Ok(format!(
        "{} {}({})",
        cpp_type_name(ctx, ctx.method(method).signature.return_type)?,
        name,
        rendered.join(", ")
    ))
}

/// `ret (*name)(params)`, the declarator of a pointer to a function with `signature`.
///
/// The explicit `this` of instance signatures is spelled as `void*`.
///
/// # Errors
/// Returns [`crate::Error::UnsupportedConstruct`] for signatures mentioning open types.
pub fn function_pointer_declarator(
    ctx: &TypeSystemContext,
    signature: &MethodSignature,
    name: &str,
) -> Result<String> {
    let mut params = Vec::with_capacity(signature.params.len() + 1);
    if !signature.is_static {
        params.push("void*".to_string());
    }
    for param in &signature.params {
        params.push(cpp_type_name(ctx, *param)?);
    }
    Ok(format!(
        "{} (*{})({})",
        cpp_type_name(ctx, signature.return_type)?,
        name,
        params.join(", ")
    ))
}

/// Stack kind and C++ type of a store destination.
///
/// # Errors
/// See [`StackValueKind::of`] and [`cpp_type_name`].
pub fn destination(ctx: &TypeSystemContext, ty: TypeId) -> Result<(StackValueKind, String)> {
    Ok((StackValueKind::of(ctx, ty)?, cpp_type_name(ctx, ty)?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        metadata::{FieldAttributes, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::TargetDetails,
    };

    #[test]
    fn spellings() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let point = builder.add_type("App", "Point", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
        builder.add_field(point, "x", FieldAttributes::empty(), TypeSig::I4);
        builder.add_field(point, "class", FieldAttributes::empty(), TypeSig::I4);
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let point = ctx.definition_type(point).unwrap();

        assert_eq!(cpp_type_name(&ctx, point).unwrap(), "App_Point");
        let string = ctx.well_known(crate::typesystem::WellKnownType::String).unwrap();
        assert_eq!(cpp_type_name(&ctx, string).unwrap(), "void*");
        let boolean = ctx.primitive(PrimitiveKind::Boolean).unwrap();
        assert_eq!(cpp_type_name(&ctx, boolean).unwrap(), "uint8_t");

        let members = instance_members(&ctx, point).unwrap();
        assert_eq!(members[0].name, "x");
        assert_eq!(members[1].name, "class_");
        assert_eq!(members[1].offset, 4);
        assert_eq!(member_name(&ctx, members[1].field).unwrap(), "class_");
    }
}
