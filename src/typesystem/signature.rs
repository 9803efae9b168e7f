//! Resolved method signatures and the generic substitution context.

use crate::{metadata::signatures::CallingConvention, typesystem::types::TypeId};

/// A method signature whose types have been resolved to canonical ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// No implicit `this`
    pub is_static: bool,
    /// Calling convention
    pub calling_convention: CallingConvention,
    /// Number of method generic parameters
    pub generic_param_count: u32,
    /// Return type
    pub return_type: TypeId,
    /// Parameter types, excluding `this`
    pub params: Vec<TypeId>,
}

impl MethodSignature {
    /// Number of values a call pops, counting `this`.
    #[must_use]
    pub fn arity_with_this(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }
}

/// Type arguments in scope while resolving signatures.
///
/// `!n` resolves against `type_args`, `!!n` against `method_args`. Out-of-range indices stay
/// as open generic parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GenericContext {
    /// Arguments of the enclosing type
    pub type_args: Vec<TypeId>,
    /// Arguments of the enclosing method
    pub method_args: Vec<TypeId>,
}

impl GenericContext {
    /// An empty context.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A context with only type arguments.
    #[must_use]
    pub fn for_type(type_args: &[TypeId]) -> Self {
        GenericContext {
            type_args: type_args.to_vec(),
            method_args: Vec::new(),
        }
    }

    /// `true` if no arguments are in scope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.type_args.is_empty() && self.method_args.is_empty()
    }
}
