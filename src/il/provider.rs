//! Method-body provisioning.
//!
//! [`ILProvider`] decides where the body of a method comes from and caches the answer per
//! [`MethodId`]. The sources are tried in priority order:
//!
//! 1. Interop helpers on types marked `McgIntrinsicsAttribute`
//! 2. Compiler intrinsics
//! 3. P/Invoke marshaling stubs
//! 4. Array accessors and runtime-implemented delegate members
//! 5. The literal body from the metadata store
//!
//! Methods on instantiated types and instantiated generic methods first try the
//! per-instantiation intrinsics and otherwise reuse the body of their generic definition through
//! a substitution view ([`MethodIL::instantiate`]), so all instantiations share one decoded body.

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::{
    il::{
        body::{ILBody, MethodIL, TokenScope},
        stubs,
    },
    metadata::{method::MethodBody, signatures::StandAloneSig, token::Token},
    typesystem::{GenericContext, MethodId, MethodKind, TypeSystemContext},
    Result,
};

/// Resolves methods to their bodies, caching one result per method.
///
/// Concurrent first requests for the same method may both build a body; only the first to
/// publish is kept and every caller receives that one.
pub struct ILProvider {
    cache: DashMap<MethodId, Option<MethodIL>, FxBuildHasher>,
    supports_relative_pointers: bool,
}

impl ILProvider {
    /// An empty provider. `supports_relative_pointers` is the answer compiled into
    /// `EEType.SupportsRelativePointers`.
    #[must_use]
    pub fn new(supports_relative_pointers: bool) -> Self {
        ILProvider {
            cache: DashMap::with_hasher(FxBuildHasher),
            supports_relative_pointers,
        }
    }

    /// The body of `method`, or `None` for methods that have none (abstract methods, direct
    /// P/Invoke imports, array constructors, runtime-implemented members without a template).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] or [`crate::Error::OutOfBounds`] if the stored body
    /// cannot be parsed and propagates resolution failures of stub generators. Failures are not
    /// cached.
    pub fn method_il(&self, ctx: &TypeSystemContext, method: MethodId) -> Result<Option<MethodIL>> {
        if let Some(cached) = self.cache.get(&method) {
            return Ok(cached.clone());
        }

        let produced = self.produce(ctx, method)?;
        Ok(self.cache.entry(method).or_insert(produced).clone())
    }

    /// Number of methods with a cached answer.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn produce(&self, ctx: &TypeSystemContext, method: MethodId) -> Result<Option<MethodIL>> {
        let desc = ctx.method(method);
        let context = ctx.method_context(method);
        let wrap = |body: Option<ILBody>| body.map(|body| MethodIL::new(body, context.clone()));

        match &desc.kind {
            MethodKind::Ecma(token) => {
                if let Some(body) = stubs::emit_interop_intrinsic(ctx, method)? {
                    return Ok(wrap(Some(body)));
                }
                if stubs::is_intrinsic(ctx, method) {
                    if let Some(body) = stubs::emit_intrinsic(ctx, method, self.supports_relative_pointers)? {
                        return Ok(wrap(Some(body)));
                    }
                }
                if desc.is_pinvoke() {
                    return Ok(wrap(stubs::emit_pinvoke(ctx, method)?));
                }
                if desc.is_runtime_implemented() {
                    if let Some(body) = stubs::emit_delegate_member(ctx, method)? {
                        return Ok(wrap(Some(body)));
                    }
                    return Ok(None);
                }
                Ok(wrap(ecma_body(ctx, *token)?))
            }
            MethodKind::OnInstantiatedType { typical: definition }
            | MethodKind::Instantiated { definition } => {
                if stubs::is_intrinsic(ctx, method) {
                    if let Some(body) = stubs::emit_per_instantiation_intrinsic(ctx, method)? {
                        return Ok(wrap(Some(body)));
                    }
                }
                Ok(self
                    .method_il(ctx, *definition)?
                    .map(|definition_il| definition_il.instantiate(context.clone())))
            }
            MethodKind::Array(kind) => Ok(wrap(stubs::emit_array_accessor(ctx, method, *kind)?)),
            MethodKind::UnboxingStub { .. } | MethodKind::PInvokeTarget { .. } => Ok(None),
        }
    }
}

/// Parse the stored body of a `MethodDef`. Locals are resolved open; the view's context closes
/// them.
fn ecma_body(ctx: &TypeSystemContext, token: Token) -> Result<Option<ILBody>> {
    let Some(raw) = ctx.store().method_body(token) else {
        return Ok(None);
    };
    let body = MethodBody::parse(raw)?;

    let locals = if body.local_var_sig_token.is_null() {
        Vec::new()
    } else {
        match ctx.store().standalone_sig(body.local_var_sig_token) {
            Some(StandAloneSig::Locals(locals)) => locals
                .iter()
                .map(|local| ctx.resolve_sig(local, &GenericContext::empty()))
                .collect::<Result<Vec<_>>>()?,
            Some(StandAloneSig::Method(_)) => {
                return Err(malformed_error!(
                    "{} is not a locals signature",
                    body.local_var_sig_token
                ))
            }
            None => return Err(missing_metadata!("Locals signature {}", body.local_var_sig_token)),
        }
    };

    Ok(Some(ILBody {
        code: body.code,
        max_stack: u16::try_from(body.max_stack).unwrap_or(u16::MAX),
        init_locals: body.is_init_local,
        locals,
        exception_regions: body.exception_regions,
        scope: TokenScope::Metadata,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        il::{decode_stream, opcodes::OpCode},
        metadata::{
            FieldAttributes, MethodAttributes, MethodImplAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig,
        },
        typesystem::{TargetDetails, TypeId, TypeKey},
    };

    struct Comparers {
        ctx: TypeSystemContext,
        comparer: Token,
        equality: Token,
        nullable: Token,
        score: Token,
        plain: Token,
    }

    fn generic_class(builder: &mut StoreBuilder, namespace: &str, name: &str) -> Token {
        let object = builder.core_type("Object");
        let class = builder.add_type(namespace, name, TypeAttributes::empty(), object);
        builder.set_generic_params(class, 1);
        let ctor = builder.add_method(
            class,
            ".ctor",
            MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
            MethodSig::new_instance(TypeSig::Void, vec![]),
        );
        builder.set_body(ctor, &[0x2A]);
        class
    }

    /// `Comparer<T>` and `EqualityComparer<T>` with intrinsic `Create` methods, their
    /// specializations, `App.Score : IComparable<Score>, IEquatable<Score>` and `App.Plain`.
    fn comparers() -> Comparers {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let interface = |builder: &mut StoreBuilder, name: &str| {
            let interface = builder.add_type(
                "System",
                name,
                TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
                None,
            );
            builder.set_generic_params(interface, 1);
            interface
        };
        let comparable = interface(&mut builder, "IComparable`1");
        let equatable = interface(&mut builder, "IEquatable`1");

        let nullable = builder.add_type(
            "System",
            "Nullable`1",
            TypeAttributes::SEQUENTIAL_LAYOUT | TypeAttributes::SEALED,
            value_type.clone(),
        );
        builder.set_generic_params(nullable, 1);
        builder.add_field(nullable, "hasValue", FieldAttributes::empty(), TypeSig::Boolean);
        builder.add_field(nullable, "value", FieldAttributes::empty(), TypeSig::Var(0));

        let collections = "System.Collections.Generic";
        let comparer = generic_class(&mut builder, collections, "Comparer`1");
        let equality = generic_class(&mut builder, collections, "EqualityComparer`1");
        for owner in [comparer, equality] {
            let create = builder.add_method(
                owner,
                "Create",
                MethodAttributes::STATIC,
                MethodSig::new_static(TypeSig::Object, vec![]),
            );
            // ldnull; ret
            builder.set_body(create, &[0x14, 0x2A]);
            builder.add_custom_attribute(create, "System.Runtime.CompilerServices", "IntrinsicAttribute");
        }
        for name in [
            "GenericComparer`1",
            "ObjectComparer`1",
            "GenericEqualityComparer`1",
            "NullableEqualityComparer`1",
            "ObjectEqualityComparer`1",
        ] {
            generic_class(&mut builder, collections, name);
        }

        let score = builder.add_type("App", "Score", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
        builder.add_field(score, "points", FieldAttributes::empty(), TypeSig::I4);
        builder.add_interface_impl(score, TypeSig::GenericInst(comparable, vec![TypeSig::Named(score)]));
        builder.add_interface_impl(score, TypeSig::GenericInst(equatable, vec![TypeSig::Named(score)]));
        let object = builder.core_type("Object");
        let plain = builder.add_type("App", "Plain", TypeAttributes::empty(), object);

        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        Comparers { ctx, comparer, equality, nullable, score, plain }
    }

    /// The type whose constructor the body of `Create` on `owner<argument>` calls.
    fn created_by(provider: &ILProvider, ctx: &TypeSystemContext, owner: Token, argument: TypeId) -> Option<TypeId> {
        let owner = ctx.instantiate(ctx.definition_type(owner).unwrap(), &[argument]).unwrap();
        let create = ctx.find_method(owner, "Create").unwrap().unwrap();
        let body = provider.method_il(ctx, create).unwrap().unwrap();
        let instructions = decode_stream(body.code()).unwrap();
        let newobj = instructions.iter().find(|instruction| instruction.opcode == OpCode::Newobj)?;
        let ctor = body.resolve_method(ctx, newobj.token().unwrap()).unwrap();
        Some(ctx.method(ctor).owner)
    }

    fn specialization(ctx: &TypeSystemContext, name: &str, argument: TypeId) -> TypeId {
        let definition = ctx.store().find_type("System.Collections.Generic", name).unwrap();
        ctx.instantiate(ctx.definition_type(definition).unwrap(), &[argument]).unwrap()
    }

    #[test]
    fn comparer_create_picks_the_specialization() {
        let Comparers { ctx, comparer, score, plain, .. } = comparers();
        let score = ctx.definition_type(score).unwrap();
        let plain = ctx.definition_type(plain).unwrap();
        let provider = ILProvider::new(false);

        assert_eq!(
            created_by(&provider, &ctx, comparer, score),
            Some(specialization(&ctx, "GenericComparer`1", score))
        );
        assert_eq!(
            created_by(&provider, &ctx, comparer, plain),
            Some(specialization(&ctx, "ObjectComparer`1", plain))
        );

        let canon = ctx.universal_canon().unwrap();
        assert_eq!(created_by(&provider, &ctx, comparer, canon), None);
    }

    #[test]
    fn equality_comparer_create_unwraps_nullable() {
        let Comparers { ctx, equality, nullable, score, plain, .. } = comparers();
        let score = ctx.definition_type(score).unwrap();
        let plain = ctx.definition_type(plain).unwrap();
        let nullable_score = ctx.instantiate(ctx.definition_type(nullable).unwrap(), &[score]).unwrap();
        let provider = ILProvider::new(false);

        assert_eq!(
            created_by(&provider, &ctx, equality, nullable_score),
            Some(specialization(&ctx, "NullableEqualityComparer`1", score))
        );
        assert_eq!(
            created_by(&provider, &ctx, equality, score),
            Some(specialization(&ctx, "GenericEqualityComparer`1", score))
        );
        assert_eq!(
            created_by(&provider, &ctx, equality, plain),
            Some(specialization(&ctx, "ObjectEqualityComparer`1", plain))
        );

        // the shared form keeps the general body
        let canon = ctx.universal_canon().unwrap();
        let shared = ctx.instantiate(ctx.definition_type(equality).unwrap(), &[canon]).unwrap();
        let create = ctx.find_method(shared, "Create").unwrap().unwrap();
        let body = provider.method_il(&ctx, create).unwrap().unwrap();
        assert_eq!(decode_stream(body.code()).unwrap()[0].opcode, OpCode::Ldnull);
    }

    #[test]
    fn instantiations_share_the_definition_body() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let boxed = builder.add_type("App", "Box`1", TypeAttributes::empty(), object);
        builder.set_generic_params(boxed, 1);
        let get = builder.add_method(
            boxed,
            "Get",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::Var(0), vec![TypeSig::Var(0)]),
        );
        builder.set_body(get, &[0x02, 0x2A]);
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());

        let open = ctx.definition_type(boxed).unwrap();
        let int32 = ctx.primitive(crate::typesystem::PrimitiveKind::I4).unwrap();
        let string = ctx.well_known(crate::typesystem::WellKnownType::String).unwrap();
        let on_int = ctx.instantiate(open, &[int32]).unwrap();
        let on_string = ctx.instantiate(open, &[string]).unwrap();
        let get_int = ctx.method_for_definition(on_int, get).unwrap();
        let get_string = ctx.method_for_definition(on_string, get).unwrap();

        let provider = ILProvider::new(false);
        let a = provider.method_il(&ctx, get_int).unwrap().unwrap();
        let b = provider.method_il(&ctx, get_string).unwrap().unwrap();
        assert!(a.shares_body_with(&b));
        assert_eq!(a.context().type_args, vec![int32]);
        assert_eq!(b.context().type_args, vec![string]);

        let again = provider.method_il(&ctx, get_int).unwrap().unwrap();
        assert!(again.shares_body_with(&a));
    }

    #[test]
    fn delegate_members_are_synthesized() {
        let mut builder = StoreBuilder::new().with_core_library();
        let multicast = builder.core_type("MulticastDelegate");
        let callback = builder.add_type("App", "Callback", TypeAttributes::SEALED, multicast);
        let ctor = builder.add_method(
            callback,
            ".ctor",
            MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
            MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Object, TypeSig::I]),
        );
        let invoke = builder.add_method(
            callback,
            "Invoke",
            MethodAttributes::VIRTUAL,
            MethodSig::new_instance(TypeSig::I4, vec![TypeSig::I4]),
        );
        builder.set_impl_flags(ctor, MethodImplAttributes::RUNTIME);
        builder.set_impl_flags(invoke, MethodImplAttributes::RUNTIME);
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let callback = ctx.definition_type(callback).unwrap();
        let provider = ILProvider::new(false);

        let ctor = ctx.method_for_definition(callback, ctor).unwrap();
        let body = provider.method_il(&ctx, ctor).unwrap().unwrap();
        let stores = decode_stream(body.code())
            .unwrap()
            .into_iter()
            .filter(|instruction| instruction.opcode == OpCode::Stfld)
            .count();
        assert_eq!(stores, 2);

        let invoke = ctx.method_for_definition(callback, invoke).unwrap();
        let body = provider.method_il(&ctx, invoke).unwrap().unwrap();
        let instructions = decode_stream(body.code()).unwrap();
        let calli = instructions
            .iter()
            .find(|instruction| instruction.opcode == OpCode::Calli)
            .unwrap();
        let signature = body.resolve_signature(&ctx, calli.token().unwrap()).unwrap();
        assert!(!signature.is_static);
        assert_eq!(signature.params.len(), 1);
    }

    #[test]
    fn array_accessors_come_before_runtime_members() {
        let ctx = TypeSystemContext::new(
            Arc::new(StoreBuilder::new().with_core_library().build()),
            TargetDetails::default(),
        );
        let int32 = ctx.primitive(crate::typesystem::PrimitiveKind::I4).unwrap();
        let matrix = ctx.intern(TypeKey::Array(int32, 2)).unwrap();
        let address = ctx
            .array_method(matrix, crate::typesystem::ArrayMethodKind::Address)
            .unwrap();
        let provider = ILProvider::new(false);
        assert!(provider.method_il(&ctx, address).unwrap().is_some());
    }

    #[test]
    fn truncated_body_fails_without_caching() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let broken = builder.add_type("App", "Broken", TypeAttributes::empty(), object);
        let method = builder.add_method(
            broken,
            "Run",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::Void, vec![]),
        );
        // tiny header announcing 4 code bytes, only one present
        builder.set_raw_body(method, vec![0x12, 0x2A]);
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let broken = ctx.definition_type(broken).unwrap();
        let method = ctx.method_for_definition(broken, method).unwrap();

        let provider = ILProvider::new(false);
        assert!(provider.method_il(&ctx, method).is_err());
        assert_eq!(provider.cached(), 0);
    }
}
