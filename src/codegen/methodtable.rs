//! Method-table records.
//!
//! Every object starts with a pointer to its type's method table. The runtime's allocator, GC
//! and dispatch code read the record directly, so its layout is fixed:
//!
//! ```text
//! offset 0   uint16_t componentSize   element size of arrays, code-unit size of strings
//! offset 2   uint16_t flags           MethodTableFlags
//! offset 4   uint32_t baseSize        allocation size without component data
//! offset 8   RawMethodTable* related  base type, or element type of arrays
//! offset 8+p void* slots[]            virtual slot implementations, in slot order
//! ```

use bitflags::bitflags;

use crate::{
    codegen::buffer::CppBuffer,
    object::{NodeSection, ObjectDataBuilder, ObjectNode},
    typesystem::{MethodId, TypeId, TypeKey, TypeSystemContext},
    Result,
};

bitflags! {
    /// Flags word of a method table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodTableFlags: u16 {
        /// Instances are arrays; `related` is the element type
        const IS_ARRAY = 0x0004;
    }
}

/// Symbol of a type's method table.
#[must_use]
pub fn method_table_symbol(ctx: &TypeSystemContext, ty: TypeId) -> String {
    format!("{}__MethodTable", ctx.mangled_type_name(ty))
}

/// Name of the C++ struct holding a type's method table.
#[must_use]
pub fn method_table_struct(ctx: &TypeSystemContext, ty: TypeId) -> String {
    format!("{}__MT", ctx.mangled_type_name(ty))
}

/// Size of the fixed header, `related` included.
#[must_use]
pub fn header_size(pointer_size: u32) -> u32 {
    8 + pointer_size
}

/// The method-table record of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTable {
    /// The type described
    pub ty: TypeId,
    /// `componentSize`
    pub component_size: u16,
    /// `flags`
    pub flags: MethodTableFlags,
    /// `baseSize`
    pub base_size: u32,
    /// Type whose table `related` points to
    pub related: Option<TypeId>,
    /// Implementation of each virtual slot; `None` for abstract slots
    pub slots: Vec<Option<MethodId>>,
}

impl MethodTable {
    /// Compute the record of `ty`.
    ///
    /// Slots of value types point at unboxing stubs, since virtual calls reach them with a boxed
    /// `this`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for component sizes that do not fit 16 bits, and
    /// propagates layout and slot assignment failures.
    pub fn build(ctx: &TypeSystemContext, ty: TypeId) -> Result<Self> {
        let desc = ctx.type_desc(ty);
        let component_size = ctx.component_size(ty)?;
        let component_size = u16::try_from(component_size)
            .map_err(|_| malformed_error!("{} has {} byte components", ctx.type_name(ty), component_size))?;

        let (flags, related) = match desc.key {
            TypeKey::SzArray(element) | TypeKey::Array(element, _) => (MethodTableFlags::IS_ARRAY, Some(element)),
            _ => (MethodTableFlags::empty(), ctx.base_type(ty)?),
        };

        let mut slots = Vec::new();
        for method in ctx.vtable(ty)? {
            let implementation = ctx.method(*method);
            if implementation.is_abstract() {
                slots.push(None);
            } else if ctx.type_desc(implementation.owner).is_value_type() {
                slots.push(Some(ctx.unboxing_stub(*method)));
            } else {
                slots.push(Some(*method));
            }
        }

        Ok(MethodTable {
            ty,
            component_size,
            flags,
            base_size: ctx.base_size(ty)?,
            related,
            slots,
        })
    }

    /// Size of the record in bytes.
    #[must_use]
    pub fn size(&self, pointer_size: u32) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let slots = self.slots.len() as u32;
        header_size(pointer_size) + slots * pointer_size
    }

    /// `struct X__MT { RawMethodTable mt; void* slots[N]; };`
    #[must_use]
    pub fn struct_declaration(&self, ctx: &TypeSystemContext) -> String {
        if self.slots.is_empty() {
            format!("struct {} {{ RawMethodTable mt; }};", method_table_struct(ctx, self.ty))
        } else {
            format!(
                "struct {} {{ RawMethodTable mt; void* slots[{}]; }};",
                method_table_struct(ctx, self.ty),
                self.slots.len()
            )
        }
    }

    /// The initialized definition of the record.
    ///
    /// `slot_target` spells the address of a slot implementation, or returns `None` when the
    /// implementation is not part of the program and the slot stays null.
    ///
    /// # Errors
    /// Propagates failures of `slot_target`.
    pub fn definition<F>(&self, ctx: &TypeSystemContext, mut slot_target: F) -> Result<String>
    where
        F: FnMut(MethodId) -> Result<Option<String>>,
    {
        let related = match self.related {
            Some(related) => format!("(RawMethodTable*)&{}", method_table_symbol(ctx, related)),
            None => "0".to_string(),
        };

        let mut out = CppBuffer::new();
        out.append_fmt(format_args!(
            "{} {} = {{",
            method_table_struct(ctx, self.ty),
            method_table_symbol(ctx, self.ty)
        ));
        out.indent();
        out.append_line();
        out.append_fmt(format_args!(
            "{{ {}, {}, {}, {} }}",
            self.component_size,
            self.flags.bits(),
            self.base_size,
            related
        ));

        if !self.slots.is_empty() {
            out.append(",");
            out.append_line();
            out.append("{");
            out.indent();
            for (index, slot) in self.slots.iter().enumerate() {
                let target = match slot {
                    Some(method) => slot_target(*method)?,
                    None => None,
                };
                out.append_line();
                match target {
                    Some(target) => out.append(&target),
                    None => out.append("0"),
                }
                if index + 1 < self.slots.len() {
                    out.append(",");
                }
            }
            out.exdent();
            out.append_line();
            out.append("}");
        }

        out.exdent();
        out.append_line();
        out.append("};");
        Ok(out.into_string())
    }

    /// The record as an object node in the method-table section.
    ///
    /// `slot_symbol` names the symbol of a slot implementation, or returns `None` for a null
    /// slot.
    ///
    /// # Errors
    /// Propagates failures of `slot_symbol`.
    pub fn to_node<F>(&self, ctx: &TypeSystemContext, mut slot_symbol: F) -> Result<ObjectNode>
    where
        F: FnMut(MethodId) -> Result<Option<String>>,
    {
        let pointer_size = ctx.pointer_size();
        let mut builder = ObjectDataBuilder::new(pointer_size);
        builder.require_alignment(pointer_size);
        builder.emit_u16(self.component_size);
        builder.emit_u16(self.flags.bits());
        builder.emit_u32(self.base_size);
        match self.related {
            Some(related) => builder.emit_pointer(&method_table_symbol(ctx, related), 0),
            None => builder.emit_null_pointer(),
        }
        for slot in &self.slots {
            let symbol = match slot {
                Some(method) => slot_symbol(*method)?,
                None => None,
            };
            match symbol {
                Some(symbol) => builder.emit_pointer(&symbol, 0),
                None => builder.emit_null_pointer(),
            }
        }
        Ok(builder.finish(&method_table_symbol(ctx, self.ty), NodeSection::MethodTables))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        metadata::{FieldAttributes, MethodAttributes, MethodSig, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::{PrimitiveKind, TargetArchitecture, TargetDetails, WellKnownType},
    };

    #[test]
    fn array_records_follow_rank() {
        let builder = StoreBuilder::new().with_core_library();
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let int32 = ctx.primitive(PrimitiveKind::I4).unwrap();
        let pointer = ctx.pointer_size();

        let vector = ctx.intern(TypeKey::SzArray(int32)).unwrap();
        let table = MethodTable::build(&ctx, vector).unwrap();
        assert_eq!(table.component_size, 4);
        assert_eq!(table.flags, MethodTableFlags::IS_ARRAY);
        assert_eq!(table.base_size, 3 * pointer);
        assert_eq!(table.related, Some(int32));

        let matrix = ctx.intern(TypeKey::Array(int32, 2)).unwrap();
        let table = MethodTable::build(&ctx, matrix).unwrap();
        assert_eq!(table.base_size, 3 * pointer + 2 * 2 * 4);
    }

    #[test]
    fn string_record_uses_code_units() {
        let builder = StoreBuilder::new().with_core_library();
        let ctx = TypeSystemContext::new(
            Arc::new(builder.build()),
            TargetDetails::new(TargetArchitecture::X86),
        );
        let string = ctx.well_known(WellKnownType::String).unwrap();
        let table = MethodTable::build(&ctx, string).unwrap();
        assert_eq!(table.component_size, 2);
        assert_eq!(table.base_size, 2 * 4 + 4 + 2);
        assert!(table.flags.is_empty());
    }

    #[test]
    fn class_record_and_node_agree() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let shape = builder.add_type("App", "Shape", TypeAttributes::ABSTRACT, object);
        builder.add_field(shape, "Id", FieldAttributes::empty(), TypeSig::I4);
        let area = builder.add_method(
            shape,
            "Area",
            MethodAttributes::VIRTUAL | MethodAttributes::NEW_SLOT | MethodAttributes::ABSTRACT,
            MethodSig::new_instance(TypeSig::R8, vec![]),
        );
        let ctx = TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default());
        let shape = ctx.definition_type(shape).unwrap();
        let base_slots = ctx.vtable(ctx.base_type(shape).unwrap().unwrap()).unwrap().len();
        let area = ctx.method_for_definition(shape, area).unwrap();

        let table = MethodTable::build(&ctx, shape).unwrap();
        assert_eq!(table.slots.len(), base_slots + 1);
        assert_eq!(table.slots.last(), Some(&None));
        assert_eq!(table.base_size, 8 + 8 + 8);
        assert!(ctx.vtable(shape).unwrap().contains(&area));

        let node = table
            .to_node(&ctx, |method| Ok(Some(ctx.mangled_method_name(method)?.to_string())))
            .unwrap();
        assert_eq!(node.name, "App_Shape__MethodTable");
        assert_eq!(node.section, NodeSection::MethodTables);
        assert_eq!(node.data.len() as u32, table.size(8));
        assert_eq!(&node.data[4..8], &table.base_size.to_le_bytes());
        assert_eq!(node.relocations[0].offset, 8);
        assert_eq!(node.relocations[0].target, "System_Object__MethodTable");
        assert_eq!(node.relocations.len(), 1 + base_slots);

        let definition = table.definition(&ctx, |_| Ok(None)).unwrap();
        assert!(definition.starts_with("App_Shape__MT App_Shape__MethodTable = {"));
        assert!(definition.contains("{ 0, 0, 24, (RawMethodTable*)&System_Object__MethodTable }"));
    }
}
