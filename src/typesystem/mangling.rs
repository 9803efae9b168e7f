//! Symbol names for types and methods.
//!
//! Names are flat C identifiers. A definition becomes `Namespace_Name`; an instantiation wraps
//! its arguments as `Def_I_Arg1__Arg2_E`. Methods append `__Name` to their owner, plus an
//! ordinal when the name is overloaded within the owner.

use crate::{
    typesystem::{
        context::TypeSystemContext,
        methods::{MethodId, MethodKind},
        types::{GenericParameterKind, TypeId, TypeKey},
    },
    Result,
};

/// Replace every character that is not valid in a C identifier with `_`.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

impl TypeSystemContext {
    /// The mangled name of a type, computed once.
    #[must_use]
    pub fn mangled_type_name(&self, id: TypeId) -> &str {
        let desc = self.type_desc(id);
        if let Some(name) = desc.mangled.get() {
            return name;
        }

        let name = match &desc.key {
            TypeKey::Primitive(_) | TypeKey::Definition(_, _) => {
                let mut name = if desc.namespace.is_empty() {
                    sanitize(&desc.name)
                } else {
                    format!("{}_{}", sanitize(&desc.namespace), sanitize(&desc.name))
                };
                let args = desc.instantiation();
                if !args.is_empty() {
                    let args: Vec<&str> = args.iter().map(|arg| self.mangled_type_name(*arg)).collect();
                    name.push_str(&format!("_I_{}_E", args.join("__")));
                }
                name
            }
            TypeKey::SzArray(element) => format!("{}_Arr", self.mangled_type_name(*element)),
            TypeKey::Array(element, rank) => format!("{}_Arr{}", self.mangled_type_name(*element), rank),
            TypeKey::Pointer(element) => format!("{}_Ptr", self.mangled_type_name(*element)),
            TypeKey::ByRef(element) => format!("{}_Ref", self.mangled_type_name(*element)),
            TypeKey::FunctionPointer(signature) => {
                let mut name = format!("__FnPtr_{}", self.mangled_type_name(signature.return_type));
                for param in &signature.params {
                    name.push_str("__");
                    name.push_str(self.mangled_type_name(*param));
                }
                name
            }
            TypeKey::GenericParameter(GenericParameterKind::Type, index) => format!("__T{index}"),
            TypeKey::GenericParameter(GenericParameterKind::Method, index) => format!("__M{index}"),
            TypeKey::UniversalCanon => "__UniversalCanon".to_string(),
        };
        desc.mangled.get_or_init(|| name)
    }

    /// The mangled name of a method, computed once.
    ///
    /// # Errors
    /// Propagates method enumeration failures of the owner.
    pub fn mangled_method_name(&self, id: MethodId) -> Result<&str> {
        let method = self.method(id);
        if let Some(name) = method.mangled.get() {
            return Ok(name);
        }

        let name = match method.kind {
            MethodKind::PInvokeTarget { declaration } => {
                format!("{}_PInvokeTarget", self.mangled_method_name(declaration)?)
            }
            MethodKind::UnboxingStub { target } => format!("{}_Unbox", self.mangled_method_name(target)?),
            MethodKind::Instantiated { definition } => {
                let args: Vec<&str> = method
                    .instantiation
                    .iter()
                    .map(|arg| self.mangled_type_name(*arg))
                    .collect();
                format!("{}_I_{}_E", self.mangled_method_name(definition)?, args.join("__"))
            }
            MethodKind::Array(kind) => {
                format!("{}__{}", self.mangled_type_name(method.owner), sanitize(kind.name()))
            }
            MethodKind::Ecma(_) | MethodKind::OnInstantiatedType { .. } => {
                let mut name = format!("{}__{}", self.mangled_type_name(method.owner), sanitize(&method.name));
                let overloads: Vec<MethodId> = self
                    .type_methods(method.owner)?
                    .into_iter()
                    .filter(|candidate| self.method(*candidate).name == method.name)
                    .collect();
                if overloads.len() > 1 {
                    if let Some(ordinal) = overloads.iter().position(|candidate| *candidate == id) {
                        name.push_str(&format!("_{ordinal}"));
                    }
                }
                name
            }
        };
        Ok(method.mangled.get_or_init(|| name))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        metadata::{MethodAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::{signature::GenericContext, target::TargetDetails},
    };

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize("List`1"), "List_1");
        assert_eq!(sanitize(".ctor"), "_ctor");
        assert_eq!(sanitize("1st"), "_1st");
    }

    #[test]
    fn names_of_constructed_types() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let list = builder.add_type("App.Collections", "List`1", TypeAttributes::empty(), object);
        builder.set_generic_params(list, 1);
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());

        let sig = TypeSig::sz_array(TypeSig::GenericInst(list, vec![TypeSig::I4]));
        let id = ctx.resolve_sig(&sig, &GenericContext::empty()).unwrap();
        assert_eq!(
            ctx.mangled_type_name(id),
            "App_Collections_List_1_I_System_Int32_E_Arr"
        );
    }

    #[test]
    fn overloads_get_ordinals() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let math = builder.add_type("App", "Math", TypeAttributes::empty(), object);
        let first = builder.add_method(
            math,
            "Max",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
        );
        let second = builder.add_method(
            math,
            "Max",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::R8, vec![TypeSig::R8, TypeSig::R8]),
        );
        let min = builder.add_method(
            math,
            "Min",
            MethodAttributes::STATIC,
            MethodSig::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
        );
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());

        let resolve = |token| ctx.resolve_method_token(token, &GenericContext::empty()).unwrap();
        assert_eq!(ctx.mangled_method_name(resolve(first)).unwrap(), "App_Math__Max_0");
        assert_eq!(ctx.mangled_method_name(resolve(second)).unwrap(), "App_Math__Max_1");
        assert_eq!(ctx.mangled_method_name(resolve(min)).unwrap(), "App_Math__Min");
    }
}
