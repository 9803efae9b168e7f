//! Instance, static and method-table layout.
//!
//! Reference types lay out their fields after the base type's fields, starting right behind
//! the method-table pointer. Value types lay out only their data. Explicit layout takes offsets
//! verbatim from metadata, so fields may overlap; sequential and auto layout walk fields in
//! declaration order at their natural alignment, capped by the declared packing.

use crate::{
    typesystem::{
        context::TypeSystemContext,
        fields::FieldId,
        types::{LayoutKind, PrimitiveKind, TypeCategory, TypeId, TypeKey},
    },
    Result,
};

/// Computed instance layout of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLayout {
    /// Instance size in bytes; for reference types this counts the method-table pointer and is
    /// not rounded, for value types it is the rounded data size
    pub instance_size: u32,
    /// Alignment of the instance data
    pub alignment: u32,
    /// Byte offset of every instance field, in declaration order
    pub field_offsets: Vec<(FieldId, u32)>,
}

impl TypeLayout {
    /// Offset of a field, if it is an instance field of this layout.
    #[must_use]
    pub fn offset_of(&self, field: FieldId) -> Option<u32> {
        self.field_offsets
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, offset)| *offset)
    }
}

/// The four static storage pools of a type.
///
/// The garbage collector scans only the pools that can hold references, and thread-local
/// pools are instantiated per thread by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StaticPoolKind {
    /// Primitive and reference-free value-type statics
    NonGc,
    /// Statics that are or contain references
    Gc,
    /// Reference-free thread statics
    ThreadNonGc,
    /// Thread statics that are or contain references
    ThreadGc,
}

impl StaticPoolKind {
    /// All pools, in emission order.
    pub const ALL: [StaticPoolKind; 4] = [
        StaticPoolKind::NonGc,
        StaticPoolKind::Gc,
        StaticPoolKind::ThreadNonGc,
        StaticPoolKind::ThreadGc,
    ];

    /// The pool a static with these properties belongs to.
    #[must_use]
    pub fn classify(contains_gc: bool, thread_static: bool) -> Self {
        match (contains_gc, thread_static) {
            (false, false) => StaticPoolKind::NonGc,
            (true, false) => StaticPoolKind::Gc,
            (false, true) => StaticPoolKind::ThreadNonGc,
            (true, true) => StaticPoolKind::ThreadGc,
        }
    }

    /// Suffix used in pool symbol names.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            StaticPoolKind::NonGc => "statics",
            StaticPoolKind::Gc => "gcstatics",
            StaticPoolKind::ThreadNonGc => "threadstatics",
            StaticPoolKind::ThreadGc => "gcthreadstatics",
        }
    }
}

/// One static storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPool {
    /// Which pool this is
    pub kind: StaticPoolKind,
    /// Offset of each static within the pool
    pub fields: Vec<(FieldId, u32)>,
    /// Pool size in bytes
    pub size: u32,
    /// Pool alignment
    pub alignment: u32,
}

impl StaticPool {
    fn new(kind: StaticPoolKind) -> Self {
        StaticPool {
            kind,
            fields: Vec::new(),
            size: 0,
            alignment: 1,
        }
    }

    fn push(&mut self, field: FieldId, size: u32, alignment: u32) {
        let offset = align_up(self.size, alignment);
        self.fields.push((field, offset));
        self.size = offset + size;
        self.alignment = self.alignment.max(alignment);
    }

    /// `true` if no static lives in this pool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Round `value` up to a multiple of `alignment`.
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

impl TypeSystemContext {
    /// Storage size and alignment of a value of `ty` when held in a field, local or array slot.
    ///
    /// # Errors
    /// Propagates layout failures of value types.
    pub fn field_size_and_alignment(&self, ty: TypeId) -> Result<(u32, u32)> {
        let pointer = self.pointer_size();
        let desc = self.type_desc(ty);
        match desc.category {
            TypeCategory::Primitive => {
                let size = desc
                    .primitive()
                    .map_or(pointer, |kind| kind.size(pointer));
                Ok((size, size.max(1)))
            }
            TypeCategory::ValueType | TypeCategory::Enum => {
                let layout = self.layout(ty)?;
                Ok((layout.instance_size, layout.alignment))
            }
            _ => Ok((pointer, pointer)),
        }
    }

    /// Instance layout of a type, computed once.
    ///
    /// # Errors
    /// Propagates field resolution failures.
    pub fn layout(&self, id: TypeId) -> Result<&TypeLayout> {
        let desc = self.type_desc(id);
        if let Some(layout) = desc.layout.get() {
            return Ok(layout);
        }

        let layout = self.compute_layout(id)?;
        Ok(desc.layout.get_or_init(|| layout))
    }

    fn compute_layout(&self, id: TypeId) -> Result<TypeLayout> {
        let pointer = self.pointer_size();
        let desc = self.type_desc(id);

        match &desc.key {
            TypeKey::SzArray(_) => {
                return Ok(TypeLayout {
                    instance_size: 2 * pointer,
                    alignment: pointer,
                    field_offsets: Vec::new(),
                })
            }
            TypeKey::Array(_, rank) => {
                return Ok(TypeLayout {
                    instance_size: 2 * pointer + rank * 4 * 2,
                    alignment: pointer,
                    field_offsets: Vec::new(),
                })
            }
            TypeKey::Primitive(kind) => {
                let size = kind.size(pointer).max(1);
                return Ok(TypeLayout {
                    instance_size: size,
                    alignment: size,
                    field_offsets: Vec::new(),
                });
            }
            _ => {}
        }

        let (packing, class_size) = match self.type_definition(id) {
            Some(token) => {
                let record = self.type_record(token)?;
                (u32::from(record.packing_size), record.class_size)
            }
            None => (0, 0),
        };
        let max_alignment = if packing == 0 { 8 } else { packing };

        if desc.is_value_type() {
            self.value_type_layout(id, desc.layout_kind, max_alignment, class_size)
        } else {
            self.reference_type_layout(id, desc.layout_kind, max_alignment)
        }
    }

    fn value_type_layout(
        &self,
        id: TypeId,
        kind: LayoutKind,
        max_alignment: u32,
        class_size: u32,
    ) -> Result<TypeLayout> {
        let mut offsets = Vec::new();
        let mut end = 0;
        let mut alignment = 1;

        for field in self.instance_fields(id)? {
            let (size, natural) = self.field_size_and_alignment(self.field(field).field_type)?;
            let field_alignment = natural.min(max_alignment).max(1);
            alignment = alignment.max(field_alignment);

            let offset = match (kind, self.field(field).explicit_offset) {
                (LayoutKind::Explicit, Some(explicit)) => explicit,
                _ => align_up(end, field_alignment),
            };
            offsets.push((field, offset));
            end = end.max(offset + size);
        }

        let instance_size = align_up(end.max(class_size), alignment).max(1);
        Ok(TypeLayout {
            instance_size,
            alignment,
            field_offsets: offsets,
        })
    }

    fn reference_type_layout(&self, id: TypeId, kind: LayoutKind, max_alignment: u32) -> Result<TypeLayout> {
        let pointer = self.pointer_size();
        let (start, mut offsets) = match self.base_type(id)? {
            Some(base) => {
                let base_layout = self.layout(base)?;
                (base_layout.instance_size, base_layout.field_offsets.clone())
            }
            None => (pointer, Vec::new()),
        };

        let mut end = start;
        for field in self.instance_fields(id)? {
            let (size, natural) = self.field_size_and_alignment(self.field(field).field_type)?;
            let field_alignment = natural.min(max_alignment).min(pointer).max(1);

            let offset = match (kind, self.field(field).explicit_offset) {
                (LayoutKind::Explicit, Some(explicit)) => start + explicit,
                _ => align_up(end, field_alignment),
            };
            offsets.push((field, offset));
            end = end.max(offset + size);
        }

        Ok(TypeLayout {
            instance_size: end,
            alignment: pointer,
            field_offsets: offsets,
        })
    }

    /// Offset of an instance field within its owner.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `field` is not an instance field of its owner.
    pub fn field_offset(&self, field: FieldId) -> Result<u32> {
        let owner = self.field(field).owner;
        self.layout(owner)?
            .offset_of(field)
            .ok_or_else(|| malformed_error!("{} is not an instance field", self.field(field).name))
    }

    /// Split a type's static fields into the four storage pools. Literal fields have no storage.
    ///
    /// # Errors
    /// Propagates field resolution and layout failures.
    pub fn static_pools(&self, id: TypeId) -> Result<[StaticPool; 4]> {
        let mut pools = StaticPoolKind::ALL.map(StaticPool::new);
        for field in self.fields(id)? {
            let desc = self.field(field);
            if !desc.is_static() || desc.is_literal() {
                continue;
            }
            let contains_gc = self.contains_gc_pointers(desc.field_type)?;
            let kind = StaticPoolKind::classify(contains_gc, desc.is_thread_static);
            let (size, alignment) = self.field_size_and_alignment(desc.field_type)?;
            pools[kind as usize].push(field, size, alignment);
        }
        Ok(pools)
    }

    /// The pool and offset of a static field.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `field` has no static storage.
    pub fn static_field_location(&self, field: FieldId) -> Result<(StaticPoolKind, u32)> {
        let owner = self.field(field).owner;
        for pool in self.static_pools(owner)? {
            if let Some((_, offset)) = pool.fields.iter().find(|(candidate, _)| *candidate == field) {
                return Ok((pool.kind, *offset));
            }
        }
        Err(malformed_error!("{} has no static storage", self.field(field).name))
    }

    /// Size in bytes of one array element of `element`.
    ///
    /// # Errors
    /// Propagates layout failures of value types.
    pub fn element_size(&self, element: TypeId) -> Result<u32> {
        Ok(self.field_size_and_alignment(element)?.0)
    }

    /// `componentSize` of a method table: code-unit size for strings, element size for arrays.
    ///
    /// # Errors
    /// Propagates layout failures of the element type.
    pub fn component_size(&self, id: TypeId) -> Result<u32> {
        let desc = self.type_desc(id);
        match desc.category {
            TypeCategory::String => Ok(PrimitiveKind::Char.size(self.pointer_size())),
            TypeCategory::Array => self.element_size(self.element_type(id)?),
            _ => Ok(0),
        }
    }

    /// `baseSize` of a method table, the allocation size of an instance without its
    /// variable-length component data.
    ///
    /// Plain objects: header word plus instance size, rounded to pointer alignment. Boxed value
    /// types additionally carry the method-table pointer. Strings: header, method table, length
    /// and the terminating code unit. Arrays: three pointers, plus two 32-bit bounds per
    /// dimension for multi-dimensional arrays.
    ///
    /// # Errors
    /// Propagates layout failures.
    pub fn base_size(&self, id: TypeId) -> Result<u32> {
        let pointer = self.pointer_size();
        let desc = self.type_desc(id);
        match &desc.key {
            TypeKey::SzArray(_) => return Ok(3 * pointer),
            TypeKey::Array(_, rank) => return Ok(3 * pointer + rank * 4 * 2),
            _ => {}
        }

        match desc.category {
            TypeCategory::String => Ok(2 * pointer + 4 + 2),
            TypeCategory::Primitive | TypeCategory::ValueType | TypeCategory::Enum => {
                let data = self.layout(id)?.instance_size;
                Ok(align_up(2 * pointer + data, pointer))
            }
            TypeCategory::Class | TypeCategory::Delegate => {
                let instance = self.layout(id)?.instance_size;
                Ok(align_up(pointer + instance, pointer))
            }
            _ => Ok(2 * pointer),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        metadata::{FieldAttributes, StoreBuilder, TypeAttributes, TypeSig},
        typesystem::{signature::GenericContext, target::TargetDetails},
    };

    fn context(builder: StoreBuilder) -> TypeSystemContext {
        TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default())
    }

    #[test]
    fn explicit_layout_uses_declared_offsets() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let union = builder.add_type("App", "Union", TypeAttributes::EXPLICIT_LAYOUT, value_type);
        let as_int = builder.add_field(union, "AsInt", FieldAttributes::empty(), TypeSig::I4);
        let as_float = builder.add_field(union, "AsFloat", FieldAttributes::empty(), TypeSig::R4);
        let high = builder.add_field(union, "High", FieldAttributes::empty(), TypeSig::U2);
        builder.set_field_offset(as_int, 0);
        builder.set_field_offset(as_float, 0);
        builder.set_field_offset(high, 2);
        let ctx = context(builder);

        let union = ctx.definition_type(union).unwrap();
        let layout = ctx.layout(union).unwrap();
        let offsets: Vec<u32> = layout.field_offsets.iter().map(|(_, offset)| *offset).collect();
        assert_eq!(offsets, vec![0, 0, 2]);
        assert_eq!(layout.instance_size, 4);
    }

    #[test]
    fn sequential_value_type_aligns_fields() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let pair = builder.add_type("App", "Pair", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
        builder.add_field(pair, "Small", FieldAttributes::empty(), TypeSig::U1);
        builder.add_field(pair, "Large", FieldAttributes::empty(), TypeSig::I8);
        let ctx = context(builder);

        let pair = ctx.definition_type(pair).unwrap();
        let layout = ctx.layout(pair).unwrap();
        assert_eq!(layout.field_offsets[1].1, 8);
        assert_eq!(layout.instance_size, 16);
        assert_eq!(layout.alignment, 8);
    }

    #[test]
    fn packing_caps_alignment() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let packed = builder.add_type("App", "Packed", TypeAttributes::SEQUENTIAL_LAYOUT, value_type);
        builder.add_field(packed, "Tag", FieldAttributes::empty(), TypeSig::U1);
        builder.add_field(packed, "Value", FieldAttributes::empty(), TypeSig::I4);
        builder.set_layout(packed, 1, 0);
        let ctx = context(builder);

        let packed = ctx.definition_type(packed).unwrap();
        let layout = ctx.layout(packed).unwrap();
        assert_eq!(layout.field_offsets[1].1, 1);
        assert_eq!(layout.instance_size, 5);
    }

    #[test]
    fn class_fields_follow_base() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let animal = builder.add_type("App", "Animal", TypeAttributes::empty(), object);
        builder.add_field(animal, "legs", FieldAttributes::empty(), TypeSig::I4);
        let dog = builder.add_type("App", "Dog", TypeAttributes::empty(), Some(TypeSig::Named(animal)));
        builder.add_field(dog, "name", FieldAttributes::empty(), TypeSig::String);
        let ctx = context(builder);

        let dog = ctx.definition_type(dog).unwrap();
        let layout = ctx.layout(dog).unwrap();
        let offsets: Vec<u32> = layout.field_offsets.iter().map(|(_, offset)| *offset).collect();
        assert_eq!(offsets, vec![8, 16]);
        assert_eq!(layout.instance_size, 24);
        assert_eq!(ctx.base_size(dog).unwrap(), 32);
    }

    #[test]
    fn array_base_sizes_depend_on_rank() {
        let ctx = context(StoreBuilder::new().with_core_library());
        let int32 = TypeSig::I4;
        let vector = ctx
            .resolve_sig(&TypeSig::sz_array(int32.clone()), &GenericContext::empty())
            .unwrap();
        let matrix = ctx
            .resolve_sig(&TypeSig::Array(Box::new(int32), 2), &GenericContext::empty())
            .unwrap();

        assert_eq!(ctx.base_size(vector).unwrap(), 3 * 8);
        assert_eq!(ctx.base_size(matrix).unwrap(), 3 * 8 + 2 * 2 * 4);
        assert_eq!(ctx.component_size(vector).unwrap(), 4);
    }

    #[test]
    fn statics_split_by_gc_and_thread() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let holder = builder.add_type("App", "Holder", TypeAttributes::empty(), object);
        builder.add_field(holder, "count", FieldAttributes::STATIC, TypeSig::I4);
        builder.add_field(holder, "name", FieldAttributes::STATIC, TypeSig::String);
        let tls = builder.add_field(holder, "cache", FieldAttributes::STATIC, TypeSig::Object);
        builder.add_custom_attribute(tls, "System", "ThreadStaticAttribute");
        builder.add_field(
            holder,
            "Max",
            FieldAttributes::STATIC | FieldAttributes::LITERAL,
            TypeSig::I4,
        );
        let ctx = context(builder);

        let holder = ctx.definition_type(holder).unwrap();
        let pools = ctx.static_pools(holder).unwrap();
        assert_eq!(pools[StaticPoolKind::NonGc as usize].fields.len(), 1);
        assert_eq!(pools[StaticPoolKind::Gc as usize].fields.len(), 1);
        assert!(pools[StaticPoolKind::ThreadNonGc as usize].is_empty());
        assert_eq!(pools[StaticPoolKind::ThreadGc as usize].fields.len(), 1);
    }
}
