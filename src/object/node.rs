//! Data blobs with symbol definitions and relocations.
//!
//! An [`ObjectNode`] is the unit both output formats consume: the source writer renders it as a
//! packed struct of byte arrays and pointer members, the object writer copies it into a section.
//! Relocation sites hold zeroed placeholders of the target's pointer width; the value to add to
//! the target's address is carried in [`Relocation::delta`].

use crate::{io::write_le_at, typesystem::StaticPoolKind, Result};

/// How a relocation site is patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// Absolute 64-bit address
    Dir64,
    /// Absolute 32-bit address
    HighLow,
    /// 32-bit displacement relative to the end of the site
    Rel32,
}

impl RelocationKind {
    /// The absolute pointer relocation for a target with `pointer_size` byte pointers.
    #[must_use]
    pub fn pointer(pointer_size: u32) -> Self {
        if pointer_size == 8 {
            RelocationKind::Dir64
        } else {
            RelocationKind::HighLow
        }
    }

    /// Width of the patched site in bytes.
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            RelocationKind::Dir64 => 8,
            RelocationKind::HighLow | RelocationKind::Rel32 => 4,
        }
    }
}

/// A reference from a node to a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the site within the node
    pub offset: u32,
    /// Name of the referenced symbol
    pub target: String,
    /// How the site is patched
    pub kind: RelocationKind,
    /// Added to the target's address
    pub delta: i64,
}

/// Output section a node is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeSection {
    /// Writable data
    Data,
    /// Read-only data
    ReadOnlyData,
    /// Method-table records
    MethodTables,
    /// One of the four static storage pools
    Statics(StaticPoolKind),
}

impl NodeSection {
    /// Section name in the object file.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            NodeSection::Data => ".data",
            NodeSection::ReadOnlyData => ".rdata",
            NodeSection::MethodTables => ".methodtables",
            NodeSection::Statics(StaticPoolKind::NonGc) => ".statics",
            NodeSection::Statics(StaticPoolKind::Gc) => ".gcstatics",
            NodeSection::Statics(StaticPoolKind::ThreadNonGc) => ".threadstatics",
            NodeSection::Statics(StaticPoolKind::ThreadGc) => ".gcthreadstatics",
        }
    }
}

/// A symbol defined inside a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedSymbol {
    /// Symbol name
    pub name: String,
    /// Offset from the start of the node
    pub offset: u32,
}

/// One blob of output data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNode {
    /// Symbol naming the start of the node
    pub name: String,
    /// Section the node lives in
    pub section: NodeSection,
    /// Required alignment
    pub alignment: u32,
    /// Contents, with zeroed placeholders at relocation sites
    pub data: Vec<u8>,
    /// Relocations, ordered by offset
    pub relocations: Vec<Relocation>,
    /// Symbols defined at interior offsets, recorded relative to [`ObjectNode::name`]
    pub based_symbols: Vec<DefinedSymbol>,
}

impl ObjectNode {
    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The node's own name and every based symbol, with offsets.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, u32)> {
        std::iter::once((self.name.as_str(), 0)).chain(
            self.based_symbols
                .iter()
                .map(|symbol| (symbol.name.as_str(), symbol.offset)),
        )
    }
}

/// Incrementally builds an [`ObjectNode`].
///
/// # Examples
///
/// ```rust
/// use cilaot::object::{NodeSection, ObjectDataBuilder};
///
/// let mut builder = ObjectDataBuilder::new(8);
/// builder.emit_u32(42);
/// builder.emit_pointer("Other", 0);
/// builder.define_symbol("Blob_Tail");
/// builder.emit_u8(1);
/// let node = builder.finish("Blob", NodeSection::Data);
///
/// assert_eq!(node.data.len(), 17);
/// assert_eq!(node.relocations[0].offset, 8);
/// assert_eq!(node.based_symbols[0].offset, 16);
/// ```
#[derive(Debug, Clone)]
pub struct ObjectDataBuilder {
    pointer_size: u32,
    alignment: u32,
    data: Vec<u8>,
    relocations: Vec<Relocation>,
    symbols: Vec<DefinedSymbol>,
}

impl ObjectDataBuilder {
    /// A builder for a target with `pointer_size` byte pointers.
    #[must_use]
    pub fn new(pointer_size: u32) -> Self {
        ObjectDataBuilder {
            pointer_size,
            alignment: 1,
            data: Vec::new(),
            relocations: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Current offset.
    #[must_use]
    pub fn offset(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.data.len() as u32;
        offset
    }

    /// Raise the node's alignment to at least `alignment`.
    pub fn require_alignment(&mut self, alignment: u32) {
        self.alignment = self.alignment.max(alignment);
    }

    /// Pad with zeros to a multiple of `alignment` and require it for the node.
    pub fn align(&mut self, alignment: u32) {
        self.require_alignment(alignment);
        let target = crate::typesystem::align_up(self.offset(), alignment);
        self.emit_zeros(target - self.offset());
    }

    /// Append one byte.
    pub fn emit_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Append a little-endian `u16`.
    pub fn emit_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a little-endian `u32`.
    pub fn emit_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a little-endian `u64`.
    pub fn emit_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `count` zero bytes.
    pub fn emit_zeros(&mut self, count: u32) {
        self.data.resize(self.data.len() + count as usize, 0);
    }

    /// Align to the pointer size, then append a placeholder that resolves to `target + delta`.
    pub fn emit_pointer(&mut self, target: &str, delta: i64) {
        self.align(self.pointer_size);
        self.emit_reloc(target, RelocationKind::pointer(self.pointer_size), delta);
    }

    /// Align to the pointer size, then append a null pointer.
    pub fn emit_null_pointer(&mut self) {
        self.align(self.pointer_size);
        self.emit_zeros(self.pointer_size);
    }

    /// Append a placeholder of `kind` that resolves to `target + delta`, at the current offset.
    pub fn emit_reloc(&mut self, target: &str, kind: RelocationKind, delta: i64) {
        self.relocations.push(Relocation {
            offset: self.offset(),
            target: target.to_string(),
            kind,
            delta,
        });
        self.emit_zeros(kind.size());
    }

    /// Overwrite a previously emitted `u32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` is not inside the emitted data.
    pub fn patch_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        let mut position = offset as usize;
        write_le_at(&mut self.data, &mut position, value)
    }

    /// Define `name` at the current offset.
    pub fn define_symbol(&mut self, name: &str) {
        self.symbols.push(DefinedSymbol {
            name: name.to_string(),
            offset: self.offset(),
        });
    }

    /// Finish the node. A symbol defined at offset zero under the node's own name is dropped.
    #[must_use]
    pub fn finish(self, name: &str, section: NodeSection) -> ObjectNode {
        ObjectNode {
            name: name.to_string(),
            section,
            alignment: self.alignment,
            data: self.data,
            relocations: self.relocations,
            based_symbols: self
                .symbols
                .into_iter()
                .filter(|symbol| !(symbol.offset == 0 && symbol.name == name))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_width_follows_target() {
        let mut narrow = ObjectDataBuilder::new(4);
        narrow.emit_pointer("Target", 8);
        let narrow = narrow.finish("Narrow", NodeSection::Data);
        assert_eq!(narrow.data, vec![0; 4]);
        assert_eq!(narrow.relocations[0].kind, RelocationKind::HighLow);
        assert_eq!(narrow.relocations[0].delta, 8);

        let mut wide = ObjectDataBuilder::new(8);
        wide.emit_pointer("Target", 0);
        assert_eq!(wide.finish("Wide", NodeSection::Data).relocations[0].kind, RelocationKind::Dir64);
    }

    #[test]
    fn pointer_sites_are_naturally_aligned() {
        let mut builder = ObjectDataBuilder::new(8);
        builder.emit_u32(42);
        builder.emit_pointer("Other", 0);
        builder.emit_u8(1);
        builder.emit_null_pointer();
        let node = builder.finish("Blob", NodeSection::Data);
        assert_eq!(node.relocations[0].offset, 8);
        assert_eq!(node.data.len(), 24);
        assert_eq!(node.alignment, 8);

        let mut narrow = ObjectDataBuilder::new(4);
        narrow.emit_u16(7);
        narrow.emit_pointer("Other", 0);
        let narrow = narrow.finish("Narrow", NodeSection::Data);
        assert_eq!(narrow.relocations[0].offset, 4);
        assert_eq!(narrow.data.len(), 8);

        let mut unaligned = ObjectDataBuilder::new(8);
        unaligned.emit_u8(0xE8);
        unaligned.emit_reloc("Callee", RelocationKind::Rel32, 0);
        assert_eq!(unaligned.finish("Call", NodeSection::Data).relocations[0].offset, 1);
    }

    #[test]
    fn align_pads_and_raises_alignment() {
        let mut builder = ObjectDataBuilder::new(8);
        builder.emit_u8(1);
        builder.align(8);
        builder.emit_u16(0xBEEF);
        builder.patch_u32(0, 0x0403_0201).unwrap();
        assert!(builder.patch_u32(8, 0).is_err());

        let node = builder.finish("Aligned", NodeSection::ReadOnlyData);
        assert_eq!(node.alignment, 8);
        assert_eq!(node.data, vec![1, 2, 3, 4, 0, 0, 0, 0, 0xEF, 0xBE]);
    }

    #[test]
    fn symbols_iterate_base_first() {
        let mut builder = ObjectDataBuilder::new(8);
        builder.define_symbol("Pool");
        builder.emit_u32(0);
        builder.define_symbol("Pool_Second");
        builder.emit_u32(0);
        let node = builder.finish("Pool", NodeSection::Statics(StaticPoolKind::Gc));

        let symbols: Vec<(&str, u32)> = node.symbols().collect();
        assert_eq!(symbols, vec![("Pool", 0), ("Pool_Second", 4)]);
        assert_eq!(node.section.name(), ".gcstatics");
    }
}
