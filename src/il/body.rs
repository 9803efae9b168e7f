//! Method bodies ready for lowering.
//!
//! A [`MethodIL`] pairs a shared, immutable [`ILBody`] with the generic context its tokens are
//! resolved under. Instantiating a generic method does not copy or rewrite its body: the
//! instantiation gets a new `MethodIL` that shares the definition's `ILBody` and carries the
//! instantiation's context, so every type the body mentions is substituted on lookup.

use std::sync::Arc;

use crate::{
    metadata::{
        method::{ExceptionRegion, ExceptionRegionKind},
        signatures::StandAloneSig,
        token::Token,
    },
    typesystem::{FieldId, GenericContext, MethodId, MethodSignature, TypeId, TypeSystemContext},
    Result,
};

/// Table byte of the tokens synthetic bodies hand out.
pub const STUB_TOKEN_TABLE: u32 = 0x7F;

/// An entity referenced from a synthetic body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StubToken {
    /// A type, possibly mentioning generic parameters of the stub's owner
    Type(TypeId),
    /// A closed method
    Method(MethodId),
    /// A field
    Field(FieldId),
    /// A string literal for `ldstr`
    String(String),
    /// A call-site signature for `calli`
    Signature(MethodSignature),
}

/// Where the tokens of a body are resolved.
#[derive(Debug, Clone)]
pub enum TokenScope {
    /// Tokens index the metadata store
    Metadata,
    /// Tokens index a table built alongside a synthetic body
    Stub(Vec<StubToken>),
}

/// An immutable method body.
#[derive(Debug, Clone)]
pub struct ILBody {
    /// IL bytes
    pub code: Vec<u8>,
    /// Declared maximum stack depth
    pub max_stack: u16,
    /// Locals are zero-initialized
    pub init_locals: bool,
    /// Local variable types, open if the body belongs to a generic definition
    pub locals: Vec<TypeId>,
    /// Protected regions
    pub exception_regions: Vec<ExceptionRegion>,
    /// Token resolution table
    pub scope: TokenScope,
}

/// A body viewed under a generic context.
#[derive(Debug, Clone)]
pub struct MethodIL {
    body: Arc<ILBody>,
    context: GenericContext,
}

impl MethodIL {
    /// A body with its resolution context.
    #[must_use]
    pub fn new(body: ILBody, context: GenericContext) -> Self {
        MethodIL {
            body: Arc::new(body),
            context,
        }
    }

    /// The same body seen through another generic context.
    #[must_use]
    pub fn instantiate(&self, context: GenericContext) -> Self {
        MethodIL {
            body: Arc::clone(&self.body),
            context,
        }
    }

    /// `true` if both views share one underlying body.
    #[must_use]
    pub fn shares_body_with(&self, other: &MethodIL) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// IL bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.body.code
    }

    /// The underlying body.
    #[must_use]
    pub fn body(&self) -> &ILBody {
        &self.body
    }

    /// Generic context tokens are resolved under.
    #[must_use]
    pub fn context(&self) -> &GenericContext {
        &self.context
    }

    /// Protected regions.
    #[must_use]
    pub fn exception_regions(&self) -> &[ExceptionRegion] {
        &self.body.exception_regions
    }

    /// `true` if locals start zeroed.
    #[must_use]
    pub fn init_locals(&self) -> bool {
        self.body.init_locals
    }

    /// Local variable types under this view's context.
    ///
    /// # Errors
    /// Propagates substitution failures.
    pub fn locals(&self, ctx: &TypeSystemContext) -> Result<Vec<TypeId>> {
        self.body
            .locals
            .iter()
            .map(|local| ctx.substitute(*local, &self.context))
            .collect()
    }

    fn stub_token(&self, token: Token) -> Result<&StubToken> {
        let TokenScope::Stub(tokens) = &self.body.scope else {
            return Err(malformed_error!("{} is not a stub token", token));
        };
        if u32::from(token.table()) != STUB_TOKEN_TABLE {
            return Err(malformed_error!("{} is not a stub token", token));
        }
        tokens
            .get((token.row() as usize).wrapping_sub(1))
            .ok_or_else(|| malformed_error!("Stub token {} out of range", token))
    }

    fn is_stub(&self) -> bool {
        matches!(self.body.scope, TokenScope::Stub(_))
    }

    /// Resolve a type token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not name a type.
    pub fn resolve_type(&self, ctx: &TypeSystemContext, token: Token) -> Result<TypeId> {
        if !self.is_stub() {
            return ctx.resolve_type_token(token, &self.context);
        }
        match self.stub_token(token)? {
            StubToken::Type(ty) => ctx.substitute(*ty, &self.context),
            other => Err(malformed_error!("Expected a type token, found {:?}", other)),
        }
    }

    /// Resolve a method token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not name a method.
    pub fn resolve_method(&self, ctx: &TypeSystemContext, token: Token) -> Result<MethodId> {
        if !self.is_stub() {
            return ctx.resolve_method_token(token, &self.context);
        }
        match self.stub_token(token)? {
            StubToken::Method(method) => Ok(*method),
            other => Err(malformed_error!("Expected a method token, found {:?}", other)),
        }
    }

    /// Resolve a field token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not name a field.
    pub fn resolve_field(&self, ctx: &TypeSystemContext, token: Token) -> Result<FieldId> {
        if !self.is_stub() {
            return ctx.resolve_field_token(token, &self.context);
        }
        match self.stub_token(token)? {
            StubToken::Field(field) => Ok(*field),
            other => Err(malformed_error!("Expected a field token, found {:?}", other)),
        }
    }

    /// Resolve an `ldstr` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingMetadata`] if the string does not exist.
    pub fn resolve_string(&self, ctx: &TypeSystemContext, token: Token) -> Result<String> {
        if !self.is_stub() {
            return ctx
                .store()
                .user_string(token)
                .map(str::to_string)
                .ok_or_else(|| missing_metadata!("User string {}", token));
        }
        match self.stub_token(token)? {
            StubToken::String(value) => Ok(value.clone()),
            other => Err(malformed_error!("Expected a string token, found {:?}", other)),
        }
    }

    /// Resolve a `calli` call-site signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not name a method signature.
    pub fn resolve_signature(&self, ctx: &TypeSystemContext, token: Token) -> Result<MethodSignature> {
        if !self.is_stub() {
            return match ctx.store().standalone_sig(token) {
                Some(StandAloneSig::Method(sig)) => ctx.resolve_method_sig(sig, &self.context),
                Some(StandAloneSig::Locals(_)) => {
                    Err(malformed_error!("{} is a locals signature", token))
                }
                None => Err(missing_metadata!("StandAloneSig {}", token)),
            };
        }
        match self.stub_token(token)? {
            StubToken::Signature(signature) => ctx.substitute_signature(signature, &self.context),
            other => Err(malformed_error!("Expected a signature token, found {:?}", other)),
        }
    }

    /// Catch type of a typed handler.
    ///
    /// # Errors
    /// Propagates type resolution failures.
    pub fn catch_type(&self, ctx: &TypeSystemContext, region: &ExceptionRegion) -> Result<Option<TypeId>> {
        match region.kind {
            ExceptionRegionKind::Catch(token) => Ok(Some(self.resolve_type(ctx, token)?)),
            _ => Ok(None),
        }
    }
}
