//! Object-file serialization and verification.
//!
//! [`ObjectWriter`] places every [`ObjectNode`] in the section its [`NodeSection`] names,
//! defines the node's symbols at their section offsets and turns each [`Relocation`] into a
//! relocation record of the container format. The finished file is re-parsed with `goblin` and
//! checked to define every symbol the nodes define before it is kept.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use object::{
    write::{self, Object, SectionId, StandardSegment, Symbol, SymbolId, SymbolSection},
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};
use strum::{Display, EnumString};

use crate::{
    object::{NodeSection, ObjectNode, Output, RelocationKind},
    typesystem::TargetArchitecture,
    Error, Result,
};

/// Container format of an object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ObjectContainer {
    /// ELF relocatable object
    #[default]
    Elf,
    /// COFF object, as consumed by the MSVC linker
    Coff,
    /// Mach-O `MH_OBJECT`
    #[strum(serialize = "macho")]
    MachO,
}

impl ObjectContainer {
    fn binary_format(self) -> BinaryFormat {
        match self {
            ObjectContainer::Elf => BinaryFormat::Elf,
            ObjectContainer::Coff => BinaryFormat::Coff,
            ObjectContainer::MachO => BinaryFormat::MachO,
        }
    }
}

fn object_architecture(architecture: TargetArchitecture) -> Architecture {
    match architecture {
        TargetArchitecture::X64 => Architecture::X86_64,
        TargetArchitecture::X86 => Architecture::I386,
        TargetArchitecture::Arm64 => Architecture::Aarch64,
    }
}

/// Collects data nodes and writes them as one relocatable object file.
///
/// # Examples
///
/// ```rust,no_run
/// use cilaot::object::{NodeSection, ObjectContainer, ObjectDataBuilder, ObjectWriter};
/// use cilaot::typesystem::TargetArchitecture;
///
/// let mut builder = ObjectDataBuilder::new(8);
/// builder.emit_u32(7);
/// builder.emit_pointer("Other", 0);
///
/// let mut writer = ObjectWriter::new(ObjectContainer::Elf, TargetArchitecture::X64);
/// writer.add_node(builder.finish("Blob", NodeSection::Data));
/// writer.emit("blob.o")?;
/// # Ok::<(), cilaot::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ObjectWriter {
    container: ObjectContainer,
    architecture: TargetArchitecture,
    nodes: Vec<ObjectNode>,
    externals: BTreeSet<String>,
}

impl ObjectWriter {
    /// An empty writer.
    #[must_use]
    pub fn new(container: ObjectContainer, architecture: TargetArchitecture) -> Self {
        ObjectWriter {
            container,
            architecture,
            nodes: Vec::new(),
            externals: BTreeSet::new(),
        }
    }

    /// The container format written.
    #[must_use]
    pub fn container(&self) -> ObjectContainer {
        self.container
    }

    /// Add a node. Nodes keep their insertion order within a section.
    pub fn add_node(&mut self, node: ObjectNode) {
        self.nodes.push(node);
    }

    /// Nodes added so far.
    #[must_use]
    pub fn nodes(&self) -> &[ObjectNode] {
        &self.nodes
    }

    /// Declare `name` as defined outside this object, by the companion source or the runtime.
    ///
    /// Relocations against declared names are emitted against undefined symbols. Relocations
    /// against names that are neither defined by a node nor declared stay null.
    pub fn declare_external(&mut self, name: &str) {
        self.externals.insert(name.to_string());
    }

    /// Every symbol the nodes define, in node order.
    #[must_use]
    pub fn defined_symbols(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|node| node.symbols().map(|(name, _)| name.to_string()))
            .collect()
    }

    /// Serialize into memory.
    ///
    /// # Errors
    /// Returns [`Error::RelocationResolution`] when two nodes define the same symbol or a
    /// relocation lies outside its node, and [`Error::ObjectWrite`] when the container rejects a
    /// relocation.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut obj = Object::new(
            self.container.binary_format(),
            object_architecture(self.architecture),
            Endianness::Little,
        );

        let mut sections: BTreeMap<NodeSection, SectionId> = BTreeMap::new();
        let mut defined: HashMap<&str, SymbolId> = HashMap::new();
        let mut placed = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let section = *sections.entry(node.section).or_insert_with(|| {
                let kind = match node.section {
                    NodeSection::ReadOnlyData => SectionKind::ReadOnlyData,
                    _ => SectionKind::Data,
                };
                let segment = obj.segment_name(StandardSegment::Data).to_vec();
                obj.add_section(segment, node.section.name().as_bytes().to_vec(), kind)
            });

            let base = obj.append_section_data(section, &node.data, u64::from(node.alignment.max(1)));
            for (name, offset) in node.symbols() {
                let symbol = obj.add_symbol(Symbol {
                    name: name.as_bytes().to_vec(),
                    value: base + u64::from(offset),
                    size: node.size() - u64::from(offset),
                    kind: SymbolKind::Data,
                    scope: SymbolScope::Linkage,
                    weak: false,
                    section: SymbolSection::Section(section),
                    flags: SymbolFlags::None,
                });
                if defined.insert(name, symbol).is_some() {
                    return Err(Error::RelocationResolution(format!("{name} is defined twice")));
                }
            }
            placed.push((node, section, base));
        }

        let mut undefined: HashMap<&str, SymbolId> = HashMap::new();
        for (node, section, base) in placed {
            for relocation in &node.relocations {
                if u64::from(relocation.offset) + u64::from(relocation.kind.size()) > node.size() {
                    return Err(Error::RelocationResolution(format!(
                        "relocation at {} runs past the end of {}",
                        relocation.offset, node.name
                    )));
                }

                let target = relocation.target.as_str();
                let symbol = if let Some(symbol) = defined.get(target) {
                    *symbol
                } else if self.externals.contains(target) {
                    *undefined.entry(target).or_insert_with(|| {
                        obj.add_symbol(Symbol {
                            name: target.as_bytes().to_vec(),
                            value: 0,
                            size: 0,
                            kind: SymbolKind::Text,
                            scope: SymbolScope::Linkage,
                            weak: false,
                            section: SymbolSection::Undefined,
                            flags: SymbolFlags::None,
                        })
                    })
                } else {
                    log::warn!("{} references unknown symbol {}, left null", node.name, target);
                    continue;
                };

                let (kind, size, addend) = match relocation.kind {
                    RelocationKind::Dir64 => (object::RelocationKind::Absolute, 64, relocation.delta),
                    RelocationKind::HighLow => (object::RelocationKind::Absolute, 32, relocation.delta),
                    RelocationKind::Rel32 => (object::RelocationKind::Relative, 32, relocation.delta - 4),
                };
                obj.add_relocation(
                    section,
                    write::Relocation {
                        offset: base + u64::from(relocation.offset),
                        symbol,
                        addend,
                        flags: RelocationFlags::Generic {
                            kind,
                            encoding: RelocationEncoding::Generic,
                            size,
                        },
                    },
                )?;
            }
        }

        Ok(obj.write()?)
    }

    /// Write the object file to `path` and verify it.
    ///
    /// The file is removed again if writing or verification fails.
    ///
    /// # Errors
    /// Propagates [`ObjectWriter::build`] failures, I/O errors and [`Error::Verification`].
    pub fn emit<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let container = self.container;
        self.emit_with(path, |bytes, expected| verify(container, bytes, expected))
    }

    pub(crate) fn emit_with<P, F>(&self, path: P, verifier: F) -> Result<()>
    where
        P: AsRef<Path>,
        F: FnOnce(&[u8], &[String]) -> Result<()>,
    {
        let bytes = self.build()?;
        let mut output = Output::create(path, bytes.len() as u64)?;
        output.write_at(0, &bytes)?;
        verifier(output.as_slice(), &self.defined_symbols())?;
        log::debug!(
            "wrote {} ({} bytes, {} nodes)",
            output.target_path().display(),
            output.size(),
            self.nodes.len()
        );
        output.finalize()
    }
}

/// Check that `bytes` parses as `container` and defines every name in `expected`.
///
/// Names match exactly or behind the `_` prefix that Mach-O and 32-bit COFF add.
///
/// # Errors
/// Returns [`Error::Verification`] naming the first missing symbol, or the parse failure.
pub fn verify(container: ObjectContainer, bytes: &[u8], expected: &[String]) -> Result<()> {
    let defined = match container {
        ObjectContainer::Elf => elf_defined_symbols(bytes)?,
        ObjectContainer::MachO => macho_defined_symbols(bytes)?,
        ObjectContainer::Coff => coff_defined_symbols(bytes)?,
    };

    for name in expected {
        let prefixed = format!("_{name}");
        if !defined.contains(name) && !defined.contains(&prefixed) {
            return Err(Error::Verification(format!(
                "{container} object does not define {name}"
            )));
        }
    }
    Ok(())
}

fn elf_defined_symbols(bytes: &[u8]) -> Result<BTreeSet<String>> {
    let elf = goblin::elf::Elf::parse(bytes)?;
    let mut names = BTreeSet::new();
    for sym in elf.syms.iter() {
        if sym.st_shndx == 0 {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if !name.is_empty() {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

fn macho_defined_symbols(bytes: &[u8]) -> Result<BTreeSet<String>> {
    let macho = goblin::mach::MachO::parse(bytes, 0)?;
    let mut names = BTreeSet::new();
    for symbol in macho.symbols() {
        let (name, nlist) = symbol?;
        if !nlist.is_undefined() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

fn coff_defined_symbols(bytes: &[u8]) -> Result<BTreeSet<String>> {
    let coff = goblin::pe::Coff::parse(bytes)?;
    let symbols = coff
        .symbols
        .as_ref()
        .ok_or_else(|| Error::Verification("COFF object has no symbol table".to_string()))?;

    let mut names = BTreeSet::new();
    for (_, inline, symbol) in symbols.iter() {
        if symbol.section_number <= 0 {
            continue;
        }
        let name = match (inline, coff.strings.as_ref()) {
            (Some(name), _) => name,
            (None, Some(strings)) => symbol.name(strings)?,
            (None, None) => continue,
        };
        if !name.is_empty() {
            names.insert(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectDataBuilder;
    use tempfile::tempdir;

    fn sample_writer(container: ObjectContainer, architecture: TargetArchitecture) -> ObjectWriter {
        let pointer_size = architecture.pointer_size();

        let mut table = ObjectDataBuilder::new(pointer_size);
        table.require_alignment(pointer_size);
        table.emit_u16(0);
        table.emit_u16(0);
        table.emit_u32(24);
        table.emit_null_pointer();
        table.emit_pointer("App_Shape__Area", 0);
        table.emit_pointer("Missing_Method", 0);

        let mut blob = ObjectDataBuilder::new(pointer_size);
        blob.emit_pointer("App_Shape__MethodTable", 8);
        blob.define_symbol("Blob_Payload");
        blob.emit_bytes(b"payload");

        let mut writer = ObjectWriter::new(container, architecture);
        writer.declare_external("App_Shape__Area");
        writer.add_node(table.finish("App_Shape__MethodTable", NodeSection::MethodTables));
        writer.add_node(blob.finish("Blob", NodeSection::ReadOnlyData));
        writer
    }

    #[test]
    fn elf_object_defines_node_and_based_symbols() {
        let writer = sample_writer(ObjectContainer::Elf, TargetArchitecture::X64);
        assert_eq!(
            writer.defined_symbols(),
            vec!["App_Shape__MethodTable", "Blob", "Blob_Payload"]
        );

        let bytes = writer.build().unwrap();
        let elf = goblin::elf::Elf::parse(&bytes).unwrap();
        let undefined: Vec<&str> = elf
            .syms
            .iter()
            .filter(|sym| sym.st_shndx == 0)
            .filter_map(|sym| elf.strtab.get_at(sym.st_name))
            .filter(|name| !name.is_empty())
            .collect();
        assert_eq!(undefined, vec!["App_Shape__Area"]);

        let payload = elf
            .syms
            .iter()
            .find(|sym| elf.strtab.get_at(sym.st_name) == Some("Blob_Payload"))
            .unwrap();
        let blob = elf
            .syms
            .iter()
            .find(|sym| elf.strtab.get_at(sym.st_name) == Some("Blob"))
            .unwrap();
        assert_eq!(payload.st_value - blob.st_value, 8);

        verify(ObjectContainer::Elf, &bytes, &writer.defined_symbols()).unwrap();
    }

    #[test]
    fn every_container_round_trips_through_verification() {
        let dir = tempdir().unwrap();
        for (container, architecture) in [
            (ObjectContainer::Elf, TargetArchitecture::X86),
            (ObjectContainer::Coff, TargetArchitecture::X64),
            (ObjectContainer::Coff, TargetArchitecture::X86),
            (ObjectContainer::MachO, TargetArchitecture::Arm64),
        ] {
            let writer = sample_writer(container, architecture);
            let path = dir.path().join(format!("{container}-{architecture}.o"));
            writer.emit(&path).unwrap();
            assert!(path.exists());
        }
    }

    #[test]
    fn missing_symbol_fails_verification() {
        let writer = sample_writer(ObjectContainer::Elf, TargetArchitecture::X64);
        let bytes = writer.build().unwrap();
        let result = verify(ObjectContainer::Elf, &bytes, &["Nowhere".to_string()]);
        assert!(matches!(result, Err(Error::Verification(_))));
    }

    #[test]
    fn truncated_coff_is_an_error() {
        let writer = sample_writer(ObjectContainer::Coff, TargetArchitecture::X64);
        let bytes = writer.build().unwrap();
        let expected = writer.defined_symbols();
        assert!(verify(ObjectContainer::Coff, &bytes, &expected).is_ok());

        let symbol_table = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        for cut in [10, symbol_table + 9] {
            assert!(verify(ObjectContainer::Coff, &bytes[..cut], &expected).is_err());
        }
    }

    #[test]
    fn failed_verification_deletes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rejected.o");
        let writer = sample_writer(ObjectContainer::Elf, TargetArchitecture::X64);

        let result = writer.emit_with(&path, |_, _| Err(Error::Verification("rejected".into())));
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let mut writer = ObjectWriter::new(ObjectContainer::Elf, TargetArchitecture::X64);
        for _ in 0..2 {
            let mut builder = ObjectDataBuilder::new(8);
            builder.emit_u32(1);
            writer.add_node(builder.finish("Twice", NodeSection::Data));
        }
        assert!(matches!(writer.build(), Err(Error::RelocationResolution(_))));
    }

    #[test]
    fn container_names_parse() {
        assert_eq!("macho".parse::<ObjectContainer>().unwrap(), ObjectContainer::MachO);
        assert_eq!(ObjectContainer::Coff.to_string(), "coff");
    }
}
