//! Virtual slot assignment.
//!
//! A type's slot list starts with a copy of its base type's slots. Each virtual method the type
//! declares either replaces the base slot with the same name and signature, or, when it is
//! marked `newslot` or nothing matches, appends a new slot. Interfaces own no slots.

use crate::{
    typesystem::{context::TypeSystemContext, methods::MethodId, types::TypeId},
    Result,
};

impl TypeSystemContext {
    /// The virtual slots of a type, in slot order.
    ///
    /// # Errors
    /// Propagates base-type and method resolution failures.
    pub fn vtable(&self, id: TypeId) -> Result<&[MethodId]> {
        let desc = self.type_desc(id);
        if let Some(slots) = desc.vtable.get() {
            return Ok(slots);
        }

        let slots = if desc.is_interface() {
            Vec::new()
        } else {
            self.compute_vtable(id)?
        };
        Ok(desc.vtable.get_or_init(|| slots))
    }

    fn compute_vtable(&self, id: TypeId) -> Result<Vec<MethodId>> {
        let mut slots = match self.base_type(id)? {
            Some(base) => self.vtable(base)?.to_vec(),
            None => Vec::new(),
        };

        for method in self.type_methods(id)? {
            let desc = self.method(method);
            if !desc.is_virtual() {
                continue;
            }

            let overridden = if desc.is_new_slot() {
                None
            } else {
                slots.iter().position(|slot| {
                    let candidate = self.method(*slot);
                    candidate.name == desc.name && candidate.signature == desc.signature
                })
            };

            match overridden {
                Some(index) => slots[index] = method,
                None => slots.push(method),
            }
        }

        Ok(slots)
    }

    /// Slot index of a virtual method within its owner's slot list.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] for interface methods and generic virtual
    /// methods, and [`crate::Error::Malformed`] if the method owns no slot.
    pub fn virtual_slot(&self, method: MethodId) -> Result<u32> {
        let desc = self.method(method);
        if !desc.instantiation.is_empty() {
            return Err(unsupported!("generic virtual method {}", self.method_name(method)));
        }
        if self.type_desc(desc.owner).is_interface() {
            return Err(unsupported!("interface dispatch to {}", self.method_name(method)));
        }

        self.vtable(desc.owner)?
            .iter()
            .position(|slot| *slot == method)
            .map(|index| index as u32)
            .ok_or_else(|| malformed_error!("{} occupies no virtual slot", self.method_name(method)))
    }

    /// The implementation a virtual call to `method` dispatches to on an instance of `ty`.
    ///
    /// # Errors
    /// See [`TypeSystemContext::virtual_slot`].
    pub fn resolve_virtual(&self, ty: TypeId, method: MethodId) -> Result<MethodId> {
        let slot = self.virtual_slot(method)? as usize;
        self.vtable(ty)?
            .get(slot)
            .copied()
            .ok_or_else(|| malformed_error!("{} has no slot {}", self.type_name(ty), slot))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        metadata::{MethodAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::{context::TypeSystemContext, target::TargetDetails},
    };

    #[test]
    fn override_replaces_base_slot() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let animal = builder.add_type("App", "Animal", TypeAttributes::empty(), object);
        let speak = builder.add_method(
            animal,
            "Speak",
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
            MethodSig::new_instance(TypeSig::String, vec![]),
        );
        let dog = builder.add_type("App", "Dog", TypeAttributes::empty(), Some(TypeSig::Named(animal)));
        let dog_speak = builder.add_method(
            dog,
            "Speak",
            MethodAttributes::VIRTUAL,
            MethodSig::new_instance(TypeSig::String, vec![]),
        );
        let fetch = builder.add_method(
            dog,
            "Fetch",
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
            MethodSig::new_instance(TypeSig::Void, vec![]),
        );
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());

        let animal = ctx.definition_type(animal).unwrap();
        let dog = ctx.definition_type(dog).unwrap();
        let speak = ctx.method_for_definition(animal, speak).unwrap();
        let dog_speak = ctx.method_for_definition(dog, dog_speak).unwrap();
        let fetch = ctx.method_for_definition(dog, fetch).unwrap();

        assert_eq!(ctx.vtable(animal).unwrap(), &[speak]);
        assert_eq!(ctx.vtable(dog).unwrap(), &[dog_speak, fetch]);
        assert_eq!(ctx.virtual_slot(speak).unwrap(), 0);
        assert_eq!(ctx.resolve_virtual(dog, speak).unwrap(), dog_speak);
        assert_eq!(ctx.resolve_virtual(animal, speak).unwrap(), speak);
    }

    #[test]
    fn newslot_hides_base_slot() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let base = builder.add_type("App", "Base", TypeAttributes::empty(), object);
        builder.add_method(
            base,
            "Run",
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
            MethodSig::new_instance(TypeSig::Void, vec![]),
        );
        let derived = builder.add_type("App", "Derived", TypeAttributes::empty(), Some(TypeSig::Named(base)));
        builder.add_method(
            derived,
            "Run",
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT,
            MethodSig::new_instance(TypeSig::Void, vec![]),
        );
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());

        let derived = ctx.definition_type(derived).unwrap();
        assert_eq!(ctx.vtable(derived).unwrap().len(), 2);
    }
}
