//! The type-system context: interning, token resolution and generic instantiation.
//!
//! A [`TypeSystemContext`] owns every type, method and field descriptor of one compilation.
//! Descriptors live in append-only [`boxcar::Vec`] arenas and are addressed by small ids;
//! structural keys map to ids through [`DashMap`]s so that concurrent lookups of the same key
//! always converge on the same id. Descriptors are built outside the map lock (building one may
//! intern others) and only the first builder to reach the vacant entry publishes its result.

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::{
    metadata::{
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes, TYPE_LAYOUT_MASK},
        records::TypeDefRecord,
        signatures::{MemberRefSig, MethodSig, TypeSig},
        store::MetadataStore,
        token::{Token, TokenTable},
    },
    typesystem::{
        fields::{FieldDesc, FieldId},
        methods::{ArrayMethodKind, MethodDesc, MethodId, MethodKey, MethodKind},
        signature::{GenericContext, MethodSignature},
        target::TargetDetails,
        types::{GenericParameterKind, LayoutKind, PrimitiveKind, TypeCategory, TypeDesc, TypeId, TypeKey},
    },
    Result,
};

/// Core library types the compiler refers to by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownType {
    /// `System.Object`
    Object,
    /// `System.String`
    String,
    /// `System.ValueType`
    ValueType,
    /// `System.Enum`
    Enum,
    /// `System.Array`
    Array,
    /// `System.Delegate`
    Delegate,
    /// `System.MulticastDelegate`
    MulticastDelegate,
    /// `System.Exception`
    Exception,
}

impl WellKnownType {
    /// Simple name in the `System` namespace.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            WellKnownType::Object => "Object",
            WellKnownType::String => "String",
            WellKnownType::ValueType => "ValueType",
            WellKnownType::Enum => "Enum",
            WellKnownType::Array => "Array",
            WellKnownType::Delegate => "Delegate",
            WellKnownType::MulticastDelegate => "MulticastDelegate",
            WellKnownType::Exception => "Exception",
        }
    }
}

/// Owner of all descriptors of one compilation.
pub struct TypeSystemContext {
    store: Arc<dyn MetadataStore>,
    target: TargetDetails,
    pub(crate) types: boxcar::Vec<TypeDesc>,
    type_map: DashMap<TypeKey, TypeId, FxBuildHasher>,
    pub(crate) methods: boxcar::Vec<MethodDesc>,
    method_map: DashMap<MethodKey, MethodId, FxBuildHasher>,
    pub(crate) fields: boxcar::Vec<FieldDesc>,
    field_map: DashMap<(TypeId, Token), FieldId, FxBuildHasher>,
}

impl TypeSystemContext {
    /// A context over `store` for `target`.
    pub fn new(store: Arc<dyn MetadataStore>, target: TargetDetails) -> Self {
        TypeSystemContext {
            store,
            target,
            types: boxcar::Vec::new(),
            type_map: DashMap::with_hasher(FxBuildHasher),
            methods: boxcar::Vec::new(),
            method_map: DashMap::with_hasher(FxBuildHasher),
            fields: boxcar::Vec::new(),
            field_map: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// The metadata store.
    #[must_use]
    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    /// Target properties.
    #[must_use]
    pub fn target(&self) -> TargetDetails {
        self.target
    }

    /// Pointer size of the target in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        self.target.pointer_size
    }

    /// Descriptor of an interned type.
    #[must_use]
    pub fn type_desc(&self, id: TypeId) -> &TypeDesc {
        &self.types[id.index()]
    }

    /// Descriptor of an interned method.
    #[must_use]
    pub fn method(&self, id: MethodId) -> &MethodDesc {
        &self.methods[id.index()]
    }

    /// Descriptor of an interned field.
    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldDesc {
        &self.fields[id.index()]
    }

    /// Number of interned types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.count()
    }

    /// The id of a structural key, creating the descriptor on first use.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if a definition key names an unknown row.
    pub fn intern(&self, key: TypeKey) -> Result<TypeId> {
        if let Some(existing) = self.type_map.get(&key) {
            return Ok(*existing);
        }

        let desc = self.build_type(&key)?;
        let id = *self
            .type_map
            .entry(key)
            .or_insert_with(|| TypeId(self.types.push(desc) as u32));
        Ok(id)
    }

    fn build_type(&self, key: &TypeKey) -> Result<TypeDesc> {
        let desc = match key {
            TypeKey::Primitive(kind) => TypeDesc::new(
                key.clone(),
                TypeCategory::Primitive,
                "System".to_string(),
                kind.type_name().to_string(),
                TypeAttributes::SEQUENTIAL_LAYOUT | TypeAttributes::SEALED,
                LayoutKind::Sequential,
            ),
            TypeKey::Definition(token, _) => {
                let record = self.type_record(*token)?;
                let layout_kind = match record.flags.bits() & TYPE_LAYOUT_MASK {
                    0x08 => LayoutKind::Sequential,
                    0x10 => LayoutKind::Explicit,
                    _ => LayoutKind::Auto,
                };
                TypeDesc::new(
                    key.clone(),
                    self.categorize(record),
                    record.namespace.clone(),
                    record.name.clone(),
                    record.flags,
                    layout_kind,
                )
            }
            TypeKey::SzArray(element) | TypeKey::Array(element, _) => {
                let suffix = match key {
                    TypeKey::Array(_, rank) => format!("[{}]", ",".repeat(rank.saturating_sub(1) as usize)),
                    _ => "[]".to_string(),
                };
                self.constructed(key, TypeCategory::Array, *element, &suffix)
            }
            TypeKey::Pointer(element) => self.constructed(key, TypeCategory::Pointer, *element, "*"),
            TypeKey::ByRef(element) => self.constructed(key, TypeCategory::ByRef, *element, "&"),
            TypeKey::FunctionPointer(_) => TypeDesc::new(
                key.clone(),
                TypeCategory::FunctionPointer,
                String::new(),
                "method*".to_string(),
                TypeAttributes::empty(),
                LayoutKind::Auto,
            ),
            TypeKey::GenericParameter(kind, index) => TypeDesc::new(
                key.clone(),
                TypeCategory::GenericParameter,
                String::new(),
                match kind {
                    GenericParameterKind::Type => format!("!{index}"),
                    GenericParameterKind::Method => format!("!!{index}"),
                },
                TypeAttributes::empty(),
                LayoutKind::Auto,
            ),
            TypeKey::UniversalCanon => TypeDesc::new(
                key.clone(),
                TypeCategory::GenericParameter,
                "System".to_string(),
                "__UniversalCanon".to_string(),
                TypeAttributes::empty(),
                LayoutKind::Auto,
            ),
        };
        Ok(desc)
    }

    fn constructed(&self, key: &TypeKey, category: TypeCategory, element: TypeId, suffix: &str) -> TypeDesc {
        let element = self.type_desc(element);
        TypeDesc::new(
            key.clone(),
            category,
            element.namespace.clone(),
            format!("{}{}", element.name, suffix),
            TypeAttributes::empty(),
            LayoutKind::Auto,
        )
    }

    fn categorize(&self, record: &TypeDefRecord) -> TypeCategory {
        if record.flags.contains(TypeAttributes::INTERFACE) {
            return TypeCategory::Interface;
        }
        if record.namespace == "System" {
            match record.name.as_str() {
                "String" => return TypeCategory::String,
                "ValueType" | "Enum" => return TypeCategory::Class,
                _ => {}
            }
        }

        let base_name = record
            .extends
            .as_ref()
            .and_then(|base| match base {
                TypeSig::Named(token) | TypeSig::GenericInst(token, _) => self.definition_token(*token),
                _ => None,
            })
            .and_then(|token| self.store.type_def(token))
            .map(|base| (base.namespace.as_str(), base.name.as_str()));

        match base_name {
            Some(("System", "ValueType")) => TypeCategory::ValueType,
            Some(("System", "Enum")) => TypeCategory::Enum,
            Some(("System", "MulticastDelegate")) => TypeCategory::Delegate,
            _ => TypeCategory::Class,
        }
    }

    /// The `TypeDef` row for a token.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the row does not exist.
    pub fn type_record(&self, token: Token) -> Result<&TypeDefRecord> {
        self.store
            .type_def(token)
            .ok_or_else(|| missing_metadata!("TypeDef {}", token))
    }

    /// Follow a `TypeRef` to its `TypeDef`; `TypeDef` tokens are returned unchanged.
    #[must_use]
    pub fn definition_token(&self, token: Token) -> Option<Token> {
        match token.kind() {
            Some(TokenTable::TypeDef) => Some(token),
            Some(TokenTable::TypeRef) => self.store.resolve_type_ref(token),
            _ => None,
        }
    }

    /// The `TypeDef` behind an interned type, including the `System` rows behind primitives.
    #[must_use]
    pub fn type_definition(&self, id: TypeId) -> Option<Token> {
        let desc = self.type_desc(id);
        match &desc.key {
            TypeKey::Definition(token, _) => Some(*token),
            TypeKey::Primitive(kind) => self.store.find_type("System", kind.type_name()),
            _ => None,
        }
    }

    /// The id of a primitive type.
    ///
    /// # Errors
    /// Never fails in practice; interning a primitive needs no metadata.
    pub fn primitive(&self, kind: PrimitiveKind) -> Result<TypeId> {
        self.intern(TypeKey::Primitive(kind))
    }

    /// The id of a core library type.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the store does not define it.
    pub fn well_known(&self, which: WellKnownType) -> Result<TypeId> {
        let token = self
            .store
            .find_type("System", which.name())
            .ok_or_else(|| missing_metadata!("System.{}", which.name()))?;
        self.definition_type(token)
    }

    /// The universal canonical placeholder.
    ///
    /// # Errors
    /// Never fails in practice.
    pub fn universal_canon(&self) -> Result<TypeId> {
        self.intern(TypeKey::UniversalCanon)
    }

    /// The type defined by a `TypeDef` row, open if it is generic.
    ///
    /// `System` rows named like a primitive resolve to the primitive itself so that both
    /// spellings share one identity.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the row does not exist.
    pub fn definition_type(&self, token: Token) -> Result<TypeId> {
        let record = self.type_record(token)?;
        if record.namespace == "System" {
            if let Some(kind) = PrimitiveKind::from_type_name(&record.name) {
                return self.primitive(kind);
            }
        }
        self.intern(TypeKey::Definition(token, Vec::new()))
    }

    /// `true` for an uninstantiated generic type definition.
    #[must_use]
    pub fn is_generic_definition(&self, id: TypeId) -> bool {
        match &self.type_desc(id).key {
            TypeKey::Definition(token, args) => {
                args.is_empty()
                    && self
                        .store
                        .type_def(*token)
                        .is_some_and(|record| record.generic_params > 0)
            }
            _ => false,
        }
    }

    /// `true` if the type is, or is instantiated over, the universal canonical placeholder.
    #[must_use]
    pub fn is_universal_canon(&self, id: TypeId) -> bool {
        match &self.type_desc(id).key {
            TypeKey::UniversalCanon => true,
            TypeKey::Definition(_, args) => args.iter().any(|arg| self.is_universal_canon(*arg)),
            TypeKey::SzArray(element)
            | TypeKey::Array(element, _)
            | TypeKey::Pointer(element)
            | TypeKey::ByRef(element) => self.is_universal_canon(*element),
            _ => false,
        }
    }

    /// `true` if the type mentions an unresolved generic parameter.
    #[must_use]
    pub fn has_open_parameters(&self, id: TypeId) -> bool {
        match &self.type_desc(id).key {
            TypeKey::GenericParameter(..) => true,
            TypeKey::Definition(_, args) => args.iter().any(|arg| self.has_open_parameters(*arg)),
            TypeKey::SzArray(element)
            | TypeKey::Array(element, _)
            | TypeKey::Pointer(element)
            | TypeKey::ByRef(element) => self.has_open_parameters(*element),
            TypeKey::FunctionPointer(sig) => {
                self.has_open_parameters(sig.return_type)
                    || sig.params.iter().any(|param| self.has_open_parameters(*param))
            }
            _ => false,
        }
    }

    /// Instantiate a generic type definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidGenericInstantiation`] if `definition` is not an open
    /// generic definition, if the argument count differs from its arity, or if an argument is
    /// `void`, a by-ref, a pointer or itself an open generic definition.
    pub fn instantiate(&self, definition: TypeId, args: &[TypeId]) -> Result<TypeId> {
        let desc = self.type_desc(definition);
        let TypeKey::Definition(token, existing) = &desc.key else {
            return Err(crate::Error::InvalidGenericInstantiation(format!(
                "{} is not a generic type definition",
                self.type_name(definition)
            )));
        };
        if !existing.is_empty() {
            return Err(crate::Error::InvalidGenericInstantiation(format!(
                "{} is already instantiated",
                self.type_name(definition)
            )));
        }

        let arity = self.type_record(*token)?.generic_params as usize;
        if arity == 0 || arity != args.len() {
            return Err(crate::Error::InvalidGenericInstantiation(format!(
                "{} expects {} type arguments, got {}",
                self.type_name(definition),
                arity,
                args.len()
            )));
        }
        self.check_type_arguments(args)?;

        self.intern(TypeKey::Definition(*token, args.to_vec()))
    }

    fn check_type_arguments(&self, args: &[TypeId]) -> Result<()> {
        for arg in args {
            let arg_desc = self.type_desc(*arg);
            let illegal = matches!(
                arg_desc.category,
                TypeCategory::ByRef | TypeCategory::Pointer
            ) || arg_desc.primitive() == Some(PrimitiveKind::Void)
                || self.is_generic_definition(*arg);
            if illegal {
                return Err(crate::Error::InvalidGenericInstantiation(format!(
                    "{} cannot be used as a type argument",
                    self.type_name(*arg)
                )));
            }
        }
        Ok(())
    }

    /// Resolve a signature type under a generic context.
    ///
    /// # Errors
    /// Propagates resolution and instantiation failures.
    pub fn resolve_sig(&self, sig: &TypeSig, context: &GenericContext) -> Result<TypeId> {
        let primitive = |kind| self.primitive(kind);
        match sig {
            TypeSig::Void => primitive(PrimitiveKind::Void),
            TypeSig::Boolean => primitive(PrimitiveKind::Boolean),
            TypeSig::Char => primitive(PrimitiveKind::Char),
            TypeSig::I1 => primitive(PrimitiveKind::I1),
            TypeSig::U1 => primitive(PrimitiveKind::U1),
            TypeSig::I2 => primitive(PrimitiveKind::I2),
            TypeSig::U2 => primitive(PrimitiveKind::U2),
            TypeSig::I4 => primitive(PrimitiveKind::I4),
            TypeSig::U4 => primitive(PrimitiveKind::U4),
            TypeSig::I8 => primitive(PrimitiveKind::I8),
            TypeSig::U8 => primitive(PrimitiveKind::U8),
            TypeSig::R4 => primitive(PrimitiveKind::R4),
            TypeSig::R8 => primitive(PrimitiveKind::R8),
            TypeSig::I => primitive(PrimitiveKind::I),
            TypeSig::U => primitive(PrimitiveKind::U),
            TypeSig::String => self.well_known(WellKnownType::String),
            TypeSig::Object => self.well_known(WellKnownType::Object),
            TypeSig::Named(token) => self.resolve_type_token(*token, context),
            TypeSig::GenericInst(token, args) => {
                let definition = self.resolve_type_token(*token, context)?;
                let args = args
                    .iter()
                    .map(|arg| self.resolve_sig(arg, context))
                    .collect::<Result<Vec<_>>>()?;
                self.instantiate(definition, &args)
            }
            TypeSig::SzArray(element) => {
                let element = self.resolve_sig(element, context)?;
                self.intern(TypeKey::SzArray(element))
            }
            TypeSig::Array(element, rank) => {
                if *rank == 0 {
                    return Err(malformed_error!("Array rank must be at least 1"));
                }
                let element = self.resolve_sig(element, context)?;
                self.intern(TypeKey::Array(element, *rank))
            }
            TypeSig::Ptr(element) => {
                let element = self.resolve_sig(element, context)?;
                self.intern(TypeKey::Pointer(element))
            }
            TypeSig::ByRef(element) => {
                let element = self.resolve_sig(element, context)?;
                self.intern(TypeKey::ByRef(element))
            }
            TypeSig::FnPtr(signature) => {
                let signature = self.resolve_method_sig(signature, context)?;
                self.intern(TypeKey::FunctionPointer(signature))
            }
            TypeSig::Var(index) => match context.type_args.get(*index as usize) {
                Some(arg) => Ok(*arg),
                None => self.intern(TypeKey::GenericParameter(GenericParameterKind::Type, *index)),
            },
            TypeSig::MVar(index) => match context.method_args.get(*index as usize) {
                Some(arg) => Ok(*arg),
                None => self.intern(TypeKey::GenericParameter(GenericParameterKind::Method, *index)),
            },
        }
    }

    /// Resolve a method signature under a generic context.
    ///
    /// # Errors
    /// Propagates type resolution failures.
    pub fn resolve_method_sig(&self, sig: &MethodSig, context: &GenericContext) -> Result<MethodSignature> {
        Ok(MethodSignature {
            is_static: !sig.has_this,
            calling_convention: sig.calling_convention,
            generic_param_count: sig.generic_param_count,
            return_type: self.resolve_sig(&sig.return_type, context)?,
            params: sig
                .params
                .iter()
                .map(|param| self.resolve_sig(param, context))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// Resolve a `TypeDef`, `TypeRef` or `TypeSpec` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for tokens of other tables and
    /// [`crate::Error::MissingMetadata`] for rows the store does not know.
    pub fn resolve_type_token(&self, token: Token, context: &GenericContext) -> Result<TypeId> {
        match token.kind() {
            Some(TokenTable::TypeDef) => self.definition_type(token),
            Some(TokenTable::TypeRef) => {
                let target = self
                    .store
                    .resolve_type_ref(token)
                    .ok_or_else(|| missing_metadata!("TypeRef {} does not resolve", token))?;
                self.definition_type(target)
            }
            Some(TokenTable::TypeSpec) => {
                let sig = self
                    .store
                    .type_spec(token)
                    .ok_or_else(|| missing_metadata!("TypeSpec {}", token))?;
                self.resolve_sig(sig, context)
            }
            _ => Err(malformed_error!("Token {} is not a type token", token)),
        }
    }

    /// Replace generic parameters in an already-resolved type.
    ///
    /// # Errors
    /// Propagates instantiation failures.
    pub fn substitute(&self, id: TypeId, context: &GenericContext) -> Result<TypeId> {
        if context.is_empty() {
            return Ok(id);
        }

        let key = self.type_desc(id).key.clone();
        match key {
            TypeKey::GenericParameter(GenericParameterKind::Type, index) => {
                Ok(context.type_args.get(index as usize).copied().unwrap_or(id))
            }
            TypeKey::GenericParameter(GenericParameterKind::Method, index) => {
                Ok(context.method_args.get(index as usize).copied().unwrap_or(id))
            }
            TypeKey::Definition(token, args) if !args.is_empty() => {
                let args = args
                    .iter()
                    .map(|arg| self.substitute(*arg, context))
                    .collect::<Result<Vec<_>>>()?;
                self.intern(TypeKey::Definition(token, args))
            }
            TypeKey::SzArray(element) => {
                let element = self.substitute(element, context)?;
                self.intern(TypeKey::SzArray(element))
            }
            TypeKey::Array(element, rank) => {
                let element = self.substitute(element, context)?;
                self.intern(TypeKey::Array(element, rank))
            }
            TypeKey::Pointer(element) => {
                let element = self.substitute(element, context)?;
                self.intern(TypeKey::Pointer(element))
            }
            TypeKey::ByRef(element) => {
                let element = self.substitute(element, context)?;
                self.intern(TypeKey::ByRef(element))
            }
            TypeKey::FunctionPointer(signature) => {
                let signature = self.substitute_signature(&signature, context)?;
                self.intern(TypeKey::FunctionPointer(signature))
            }
            _ => Ok(id),
        }
    }

    /// Replace generic parameters in a resolved signature.
    ///
    /// # Errors
    /// Propagates instantiation failures.
    pub fn substitute_signature(
        &self,
        signature: &MethodSignature,
        context: &GenericContext,
    ) -> Result<MethodSignature> {
        Ok(MethodSignature {
            return_type: self.substitute(signature.return_type, context)?,
            params: signature
                .params
                .iter()
                .map(|param| self.substitute(*param, context))
                .collect::<Result<Vec<_>>>()?,
            ..signature.clone()
        })
    }

    /// Element type of arrays, pointers and by-refs.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for any other type.
    pub fn element_type(&self, id: TypeId) -> Result<TypeId> {
        self.type_desc(id)
            .element_type()
            .ok_or_else(|| malformed_error!("{} has no element type", self.type_name(id)))
    }

    /// The base type, resolved under the type's own instantiation.
    ///
    /// # Errors
    /// Propagates resolution failures of the `extends` signature.
    pub fn base_type(&self, id: TypeId) -> Result<Option<TypeId>> {
        let desc = self.type_desc(id);
        if let Some(base) = desc.base.get() {
            return Ok(*base);
        }

        let base = match &desc.key {
            TypeKey::Definition(token, args) => {
                let record = self.type_record(*token)?;
                match &record.extends {
                    Some(extends) => Some(self.resolve_sig(extends, &GenericContext::for_type(args))?),
                    None => None,
                }
            }
            TypeKey::Primitive(_) => Some(self.well_known(WellKnownType::ValueType)?),
            TypeKey::SzArray(_) | TypeKey::Array(..) => Some(self.well_known(WellKnownType::Array)?),
            _ => None,
        };
        Ok(*desc.base.get_or_init(|| base))
    }

    /// `true` if `derived` is `ancestor` or inherits from it.
    ///
    /// # Errors
    /// Propagates base-type resolution failures.
    pub fn is_subclass_of(&self, derived: TypeId, ancestor: TypeId) -> Result<bool> {
        let mut current = Some(derived);
        while let Some(ty) = current {
            if ty == ancestor {
                return Ok(true);
            }
            current = self.base_type(ty)?;
        }
        Ok(false)
    }

    /// Instance and static fields, in declaration order.
    ///
    /// A field whose type cannot be resolved is given `System.IntPtr` so layout can proceed;
    /// the substitution is logged.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the owning row or a field row is missing.
    pub fn fields(&self, id: TypeId) -> Result<Vec<FieldId>> {
        let desc = self.type_desc(id);
        if let Some(fields) = desc.fields.get() {
            return Ok(fields.clone());
        }

        let mut fields = Vec::new();
        if let Some(token) = self.type_definition(id) {
            let record = self.type_record(token)?;
            for field in record.fields.clone() {
                fields.push(self.field_for_definition(id, field)?);
            }
        }
        Ok(desc.fields.get_or_init(|| fields).clone())
    }

    /// Instance (non-static) fields, in declaration order.
    ///
    /// # Errors
    /// See [`TypeSystemContext::fields`].
    pub fn instance_fields(&self, id: TypeId) -> Result<Vec<FieldId>> {
        Ok(self
            .fields(id)?
            .into_iter()
            .filter(|field| !self.field(*field).is_static())
            .collect())
    }

    fn field_for_definition(&self, owner: TypeId, token: Token) -> Result<FieldId> {
        let key = (owner, token);
        if let Some(existing) = self.field_map.get(&key) {
            return Ok(*existing);
        }

        let record = self
            .store
            .field_def(token)
            .ok_or_else(|| missing_metadata!("Field {}", token))?;
        let context = GenericContext::for_type(self.type_desc(owner).instantiation());
        let field_type = match self.resolve_sig(&record.signature, &context) {
            Ok(field_type) => field_type,
            Err(error) if error.is_method_local() => {
                log::warn!(
                    "Field {}.{} has unresolvable type, using System.IntPtr: {}",
                    self.type_name(owner),
                    record.name,
                    error
                );
                self.primitive(PrimitiveKind::I)?
            }
            Err(error) => return Err(error),
        };

        let desc = FieldDesc {
            token,
            owner,
            name: record.name.clone(),
            field_type,
            flags: record.flags,
            explicit_offset: record.offset,
            is_thread_static: self
                .store
                .has_custom_attribute(token, "System", "ThreadStaticAttribute"),
        };
        let id = *self
            .field_map
            .entry(key)
            .or_insert_with(|| FieldId(self.fields.push(desc) as u32));
        Ok(id)
    }

    /// Resolve a `Field` or field `MemberRef` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the field cannot be found and
    /// [`crate::Error::Malformed`] for tokens that do not name a field.
    pub fn resolve_field_token(&self, token: Token, context: &GenericContext) -> Result<FieldId> {
        match token.kind() {
            Some(TokenTable::Field) => {
                let record = self
                    .store
                    .field_def(token)
                    .ok_or_else(|| missing_metadata!("Field {}", token))?;
                let owner = self.definition_type(record.owner)?;
                self.field_for_definition(owner, token)
            }
            Some(TokenTable::MemberRef) => {
                let member = self
                    .store
                    .member_ref(token)
                    .ok_or_else(|| missing_metadata!("MemberRef {}", token))?;
                if !matches!(member.signature, MemberRefSig::Field(_)) {
                    return Err(malformed_error!("MemberRef {} is not a field", token));
                }
                let owner = self.resolve_sig(&member.parent, context)?;
                let mut current = Some(owner);
                while let Some(ty) = current {
                    for field in self.fields(ty)? {
                        if self.field(field).name == member.name {
                            return Ok(field);
                        }
                    }
                    current = self.base_type(ty)?;
                }
                Err(missing_metadata!(
                    "Field {} not found on {}",
                    member.name,
                    self.type_name(owner)
                ))
            }
            _ => Err(malformed_error!("Token {} is not a field token", token)),
        }
    }

    /// Methods declared by a type, in declaration order.
    ///
    /// # Errors
    /// Propagates signature resolution failures.
    pub fn type_methods(&self, id: TypeId) -> Result<Vec<MethodId>> {
        let desc = self.type_desc(id);
        if let Some(methods) = desc.methods.get() {
            return Ok(methods.clone());
        }

        let mut methods = Vec::new();
        if let Some(token) = self.type_definition(id) {
            let record = self.type_record(token)?;
            for method in record.methods.clone() {
                methods.push(self.method_for_definition(id, method)?);
            }
        }
        Ok(desc.methods.get_or_init(|| methods).clone())
    }

    /// First method of a type with the given name.
    ///
    /// # Errors
    /// Propagates signature resolution failures.
    pub fn find_method(&self, id: TypeId, name: &str) -> Result<Option<MethodId>> {
        Ok(self
            .type_methods(id)?
            .into_iter()
            .find(|method| self.method(*method).name == name))
    }

    /// The method for a `MethodDef` row viewed through `owner`, which may be an instantiation of
    /// the row's declaring type.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the row is missing.
    pub fn method_for_definition(&self, owner: TypeId, token: Token) -> Result<MethodId> {
        let key = MethodKey::Definition(owner, token);
        if let Some(existing) = self.method_map.get(&key) {
            return Ok(*existing);
        }

        let record = self
            .store
            .method_def(token)
            .ok_or_else(|| missing_metadata!("MethodDef {}", token))?;
        let owner_args = self.type_desc(owner).instantiation().to_vec();
        let signature = self.resolve_method_sig(&record.signature, &GenericContext::for_type(&owner_args))?;

        let kind = if owner_args.is_empty() {
            MethodKind::Ecma(token)
        } else {
            let typical_owner = self.definition_type(record.owner)?;
            MethodKind::OnInstantiatedType {
                typical: self.method_for_definition(typical_owner, token)?,
            }
        };

        let mut desc = MethodDesc::new(
            kind,
            owner,
            record.name.clone(),
            signature,
            record.flags,
            record.impl_flags,
        );
        desc.pinvoke = record.pinvoke.clone();
        Ok(self.publish_method(key, desc))
    }

    fn publish_method(&self, key: MethodKey, desc: MethodDesc) -> MethodId {
        *self
            .method_map
            .entry(key)
            .or_insert_with(|| MethodId(self.methods.push(desc) as u32))
    }

    /// Instantiate a generic method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidGenericInstantiation`] on arity mismatch or illegal
    /// arguments.
    pub fn instantiate_method(&self, definition: MethodId, args: &[TypeId]) -> Result<MethodId> {
        let key = MethodKey::Instantiated(definition, args.to_vec());
        if let Some(existing) = self.method_map.get(&key) {
            return Ok(*existing);
        }

        let generic = self.method(definition);
        let arity = generic.signature.generic_param_count as usize;
        if arity == 0 || arity != args.len() {
            return Err(crate::Error::InvalidGenericInstantiation(format!(
                "{} expects {} method type arguments, got {}",
                self.method_name(definition),
                arity,
                args.len()
            )));
        }
        self.check_type_arguments(args)?;

        let context = GenericContext {
            type_args: Vec::new(),
            method_args: args.to_vec(),
        };
        let signature = self.substitute_signature(&generic.signature, &context)?;
        let mut desc = MethodDesc::new(
            MethodKind::Instantiated { definition },
            generic.owner,
            generic.name.clone(),
            signature,
            generic.flags,
            generic.impl_flags,
        );
        desc.instantiation = args.to_vec();
        Ok(self.publish_method(key, desc))
    }

    /// The typical (open) definition of a method, and the `MethodDef` token behind it.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for synthetic methods, which have no definition.
    pub fn method_definition_token(&self, id: MethodId) -> Result<Token> {
        match &self.method(id).kind {
            MethodKind::Ecma(token) => Ok(*token),
            MethodKind::OnInstantiatedType { typical } => self.method_definition_token(*typical),
            MethodKind::Instantiated { definition } => self.method_definition_token(*definition),
            _ => Err(malformed_error!(
                "{} has no metadata definition",
                self.method_name(id)
            )),
        }
    }

    /// The generic context a method body is resolved under.
    #[must_use]
    pub fn method_context(&self, id: MethodId) -> GenericContext {
        let method = self.method(id);
        GenericContext {
            type_args: self.type_desc(method.owner).instantiation().to_vec(),
            method_args: method.instantiation.clone(),
        }
    }

    /// Resolve a `MethodDef`, method `MemberRef` or `MethodSpec` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if no matching method exists.
    pub fn resolve_method_token(&self, token: Token, context: &GenericContext) -> Result<MethodId> {
        match token.kind() {
            Some(TokenTable::MethodDef) => {
                let record = self
                    .store
                    .method_def(token)
                    .ok_or_else(|| missing_metadata!("MethodDef {}", token))?;
                let owner = self.definition_type(record.owner)?;
                self.method_for_definition(owner, token)
            }
            Some(TokenTable::MemberRef) => {
                let member = self
                    .store
                    .member_ref(token)
                    .ok_or_else(|| missing_metadata!("MemberRef {}", token))?;
                let MemberRefSig::Method(sig) = &member.signature else {
                    return Err(malformed_error!("MemberRef {} is not a method", token));
                };
                let owner = self.resolve_sig(&member.parent, context)?;

                if self.type_desc(owner).is_array() {
                    let kind = ArrayMethodKind::from_name(&member.name).ok_or_else(|| {
                        missing_metadata!("Array method {} on {}", member.name, self.type_name(owner))
                    })?;
                    return self.array_method(owner, kind);
                }

                let owner_context = GenericContext::for_type(self.type_desc(owner).instantiation());
                let wanted = self.resolve_method_sig(sig, &owner_context)?;
                let mut current = Some(owner);
                while let Some(ty) = current {
                    for method in self.type_methods(ty)? {
                        let candidate = self.method(method);
                        if candidate.name == member.name && candidate.signature == wanted {
                            return Ok(method);
                        }
                    }
                    current = self.base_type(ty)?;
                }
                Err(missing_metadata!(
                    "Method {} not found on {}",
                    member.name,
                    self.type_name(owner)
                ))
            }
            Some(TokenTable::MethodSpec) => {
                let spec = self
                    .store
                    .method_spec(token)
                    .ok_or_else(|| missing_metadata!("MethodSpec {}", token))?;
                let definition = self.resolve_method_token(spec.method, context)?;
                let args = spec
                    .instantiation
                    .iter()
                    .map(|arg| self.resolve_sig(arg, context))
                    .collect::<Result<Vec<_>>>()?;
                self.instantiate_method(definition, &args)
            }
            _ => Err(malformed_error!("Token {} is not a method token", token)),
        }
    }

    /// A runtime-provided accessor of an array type.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `array` is not an array type.
    pub fn array_method(&self, array: TypeId, kind: ArrayMethodKind) -> Result<MethodId> {
        let key = MethodKey::Array(array, kind);
        if let Some(existing) = self.method_map.get(&key) {
            return Ok(*existing);
        }

        let desc = self.type_desc(array);
        if !desc.is_array() {
            return Err(malformed_error!("{} is not an array", self.type_name(array)));
        }
        let element = self.element_type(array)?;
        let int32 = self.primitive(PrimitiveKind::I4)?;
        let void = self.primitive(PrimitiveKind::Void)?;
        let mut params = vec![int32; desc.rank() as usize];
        let return_type = match kind {
            ArrayMethodKind::Get => element,
            ArrayMethodKind::Address => self.intern(TypeKey::ByRef(element))?,
            ArrayMethodKind::Set => {
                params.push(element);
                void
            }
            ArrayMethodKind::Ctor => void,
        };

        let method = MethodDesc::new(
            MethodKind::Array(kind),
            array,
            kind.name().to_string(),
            MethodSignature {
                is_static: false,
                calling_convention: Default::default(),
                generic_param_count: 0,
                return_type,
                params,
            },
            MethodAttributes::empty(),
            MethodImplAttributes::RUNTIME,
        );
        Ok(self.publish_method(key, method))
    }

    /// The native import a P/Invoke marshaling stub calls, with its native signature.
    pub fn pinvoke_target(&self, declaration: MethodId, signature: MethodSignature) -> MethodId {
        let key = MethodKey::PInvokeTarget(declaration);
        if let Some(existing) = self.method_map.get(&key) {
            return *existing;
        }

        let managed = self.method(declaration);
        let mut desc = MethodDesc::new(
            MethodKind::PInvokeTarget { declaration },
            managed.owner,
            managed.name.clone(),
            signature,
            managed.flags | MethodAttributes::STATIC,
            managed.impl_flags,
        );
        desc.pinvoke = managed.pinvoke.clone();
        self.publish_method(key, desc)
    }

    /// The stub placed in a value type's virtual slot, adjusting the boxed `this`.
    pub fn unboxing_stub(&self, target: MethodId) -> MethodId {
        let key = MethodKey::UnboxingStub(target);
        if let Some(existing) = self.method_map.get(&key) {
            return *existing;
        }

        let method = self.method(target);
        let desc = MethodDesc::new(
            MethodKind::UnboxingStub { target },
            method.owner,
            method.name.clone(),
            method.signature.clone(),
            method.flags,
            method.impl_flags,
        );
        self.publish_method(key, desc)
    }

    /// `true` if a type owns a custom attribute named `namespace.name`.
    #[must_use]
    pub fn type_has_attribute(&self, id: TypeId, namespace: &str, name: &str) -> bool {
        self.type_definition(id)
            .is_some_and(|token| self.store.has_custom_attribute(token, namespace, name))
    }

    /// `true` if a method's definition carries a custom attribute named `namespace.name`.
    #[must_use]
    pub fn method_has_attribute(&self, id: MethodId, namespace: &str, name: &str) -> bool {
        self.method_definition_token(id)
            .is_ok_and(|token| self.store.has_custom_attribute(token, namespace, name))
    }

    /// `true` if values of the type are or contain GC-tracked references.
    ///
    /// # Errors
    /// Propagates field resolution failures.
    pub fn contains_gc_pointers(&self, id: TypeId) -> Result<bool> {
        let desc = self.type_desc(id);
        if desc.is_gc_pointer() {
            return Ok(true);
        }
        if !matches!(desc.category, TypeCategory::ValueType | TypeCategory::Enum) {
            return Ok(false);
        }
        for field in self.instance_fields(id)? {
            if self.contains_gc_pointers(self.field(field).field_type)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Underlying integer type of an enum.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the enum has no instance field.
    pub fn enum_underlying_type(&self, id: TypeId) -> Result<TypeId> {
        self.instance_fields(id)?
            .first()
            .map(|field| self.field(*field).field_type)
            .ok_or_else(|| malformed_error!("Enum {} has no value field", self.type_name(id)))
    }

    /// A readable name, `Namespace.Name<Args>` for instantiations.
    #[must_use]
    pub fn type_name(&self, id: TypeId) -> String {
        let desc = self.type_desc(id);
        match &desc.key {
            TypeKey::Definition(_, args) if !args.is_empty() => {
                let args: Vec<String> = args.iter().map(|arg| self.type_name(*arg)).collect();
                format!("{}<{}>", desc.full_name(), args.join(","))
            }
            TypeKey::SzArray(element) => format!("{}[]", self.type_name(*element)),
            TypeKey::Array(element, rank) => format!(
                "{}[{}]",
                self.type_name(*element),
                ",".repeat(rank.saturating_sub(1) as usize)
            ),
            TypeKey::Pointer(element) => format!("{}*", self.type_name(*element)),
            TypeKey::ByRef(element) => format!("{}&", self.type_name(*element)),
            _ => desc.full_name(),
        }
    }

    /// A readable method identity, `Owner.Name`, used in diagnostics.
    #[must_use]
    pub fn method_name(&self, id: MethodId) -> String {
        let method = self.method(id);
        let mut name = format!("{}.{}", self.type_name(method.owner), method.name);
        if !method.instantiation.is_empty() {
            let args: Vec<String> = method.instantiation.iter().map(|arg| self.type_name(*arg)).collect();
            name.push_str(&format!("<{}>", args.join(",")));
        }
        match method.kind {
            MethodKind::PInvokeTarget { .. } => name.push_str(" [native]"),
            MethodKind::UnboxingStub { .. } => name.push_str(" [unbox]"),
            _ => {}
        }
        name
    }

    /// `true` for literal fields that occupy no storage.
    #[must_use]
    pub fn field_has_storage(&self, id: FieldId) -> bool {
        !self.field(id).flags.contains(FieldAttributes::LITERAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MethodSig, StoreBuilder};

    fn context(builder: StoreBuilder) -> TypeSystemContext {
        TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default())
    }

    #[test]
    fn primitive_definitions_share_identity() {
        let builder = StoreBuilder::new().with_core_library();
        let int32 = builder.find_type("System", "Int32").unwrap();
        let ctx = context(builder);

        let from_row = ctx.definition_type(int32).unwrap();
        let from_sig = ctx.resolve_sig(&TypeSig::I4, &GenericContext::empty()).unwrap();
        assert_eq!(from_row, from_sig);
        assert!(ctx.type_desc(from_row).is_value_type());
    }

    #[test]
    fn instantiation_is_interned_once() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let list = builder.add_type("App", "List`1", TypeAttributes::empty(), object);
        builder.set_generic_params(list, 1);
        let ctx = context(builder);

        let sig = TypeSig::GenericInst(list, vec![TypeSig::I4]);
        let first = ctx.resolve_sig(&sig, &GenericContext::empty()).unwrap();
        let second = ctx.resolve_sig(&sig, &GenericContext::empty()).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.type_name(first), "App.List`1<System.Int32>");
    }

    #[test]
    fn instantiation_rejects_bad_arguments() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let pair = builder.add_type("App", "Pair`2", TypeAttributes::empty(), object.clone());
        builder.set_generic_params(pair, 2);
        let plain = builder.add_type("App", "Plain", TypeAttributes::empty(), object);
        let ctx = context(builder);

        let definition = ctx.definition_type(pair).unwrap();
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        let by_ref = ctx.intern(TypeKey::ByRef(int32)).unwrap();

        assert!(matches!(
            ctx.instantiate(definition, &[int32]),
            Err(crate::Error::InvalidGenericInstantiation(_))
        ));
        assert!(matches!(
            ctx.instantiate(definition, &[int32, by_ref]),
            Err(crate::Error::InvalidGenericInstantiation(_))
        ));
        assert!(matches!(
            ctx.instantiate(definition, &[int32, definition]),
            Err(crate::Error::InvalidGenericInstantiation(_))
        ));
        let plain = ctx.definition_type(plain).unwrap();
        assert!(ctx.instantiate(plain, &[int32]).is_err());
        assert!(ctx.instantiate(definition, &[int32, int32]).is_ok());
    }

    #[test]
    fn categories_follow_base_type() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let delegate = builder.core_type("MulticastDelegate");
        let point = builder.add_type("App", "Point", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
        let callback = builder.add_type("App", "Callback", TypeAttributes::SEALED, delegate);
        let ctx = context(builder);

        let point = ctx.definition_type(point).unwrap();
        let callback = ctx.definition_type(callback).unwrap();
        assert_eq!(ctx.type_desc(point).category, TypeCategory::ValueType);
        assert_eq!(ctx.type_desc(callback).category, TypeCategory::Delegate);
        assert!(ctx.type_desc(callback).is_gc_pointer());
    }

    #[test]
    fn generic_method_instantiation_substitutes_signature() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let util = builder.add_type("App", "Util", TypeAttributes::empty(), object);
        let identity = builder.add_method(
            util,
            "Identity",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::MVar(0), vec![TypeSig::MVar(0)]).with_generic_params(1),
        );
        let spec = builder.add_method_spec(identity, vec![TypeSig::String]);
        let ctx = context(builder);

        let method = ctx.resolve_method_token(spec, &GenericContext::empty()).unwrap();
        let string = ctx.well_known(WellKnownType::String).unwrap();
        assert_eq!(ctx.method(method).signature.return_type, string);
        assert_eq!(ctx.method(method).signature.params, vec![string]);
        assert_eq!(ctx.method_definition_token(method).unwrap(), identity);
    }

    #[test]
    fn missing_field_type_falls_back_to_intptr() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let holder = builder.add_type("App", "Holder", TypeAttributes::empty(), object);
        builder.add_field(
            holder,
            "dangling",
            FieldAttributes::empty(),
            TypeSig::Named(Token::from_parts(TokenTable::TypeDef, 0x7FFF)),
        );
        let ctx = context(builder);

        let holder = ctx.definition_type(holder).unwrap();
        let fields = ctx.fields(holder).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(
            ctx.field(fields[0]).field_type,
            ctx.primitive(PrimitiveKind::I).unwrap()
        );
    }
}
