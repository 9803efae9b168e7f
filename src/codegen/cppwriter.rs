//! Assembly of the C++ compilation unit.
//!
//! The writer collects lowered methods, type nodes, native imports and data nodes, works out
//! everything they reference, and renders a single translation unit in this order:
//!
//! 1. prologue: runtime header, `RawMethodTable`, literal helpers, runtime helper prototypes
//! 2. forward declarations: structs, method-table records, method prototypes
//! 3. type bodies, every type after its base type and the value types it embeds
//! 4. static pools
//! 5. slot typedefs and slot accessors
//! 6. method-table records, every record after the record its `related` field points to
//! 7. data nodes
//! 8. native import declarations and forwarders
//! 9. method implementations
//! 10. per-method accessors
//! 11. the `main` stub, when an entry point is set
//!
//! With external records (object output) method tables, static pools and data nodes are only
//! declared; their storage lives in the object file.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    codegen::{
        buffer::CppBuffer,
        ctypes::{self, StructMember},
        importer::{LoweredMethod, MethodReferences},
        methodtable::{method_table_struct, method_table_symbol, MethodTable},
    },
    object::{ObjectNode, RelocationKind},
    typesystem::{
        LayoutKind, MethodId, StaticPool, StaticPoolKind, TypeCategory, TypeId, TypeKey, TypeSystemContext,
    },
    Error, Result,
};

/// Imports the C runtime headers already declare.
const CRT_IMPORTS: &[&str] = &["memmove", "memset", "malloc"];

const PROLOGUE: &str = r#"#include <stdint.h>
#include <stddef.h>
#include <string.h>
#include <stdlib.h>

#define INT64VAL(x) (x##LL)
#define ARRAY_BASE (2 * sizeof(void*))

static inline double __uint64_to_double(uint64_t bits) { double value; memcpy(&value, &bits, sizeof(value)); return value; }
static inline float __uint32_to_float(uint32_t bits) { float value; memcpy(&value, &bits, sizeof(value)); return value; }

struct RawMethodTable
{
    uint16_t componentSize;
    uint16_t flags;
    uint32_t baseSize;
    RawMethodTable* related;
};

extern "C" {
void* __allocate_object(void* pMT);
void* __allocate_array(intptr_t count, void* pMT);
void* __allocate_mdarray(void* pMT, int32_t rank, int32_t* pDimensions);
void* __load_string_literal(const char16_t* value);
void* __castclass(void* obj, void* pMT);
void* __isinst(void* obj, void* pMT);
void __range_check(void* array, intptr_t index);
[[noreturn]] void __throw_exception(void* exception);
[[noreturn]] void __rethrow();
void __end_filter(int32_t verdict);
void __debug_break();
}"#;

/// Symbol of one static pool of a type.
#[must_use]
pub fn static_pool_symbol(ctx: &TypeSystemContext, ty: TypeId, kind: StaticPoolKind) -> String {
    format!("{}_{}", ctx.mangled_type_name(ty), kind.suffix())
}

fn static_pool_struct(ctx: &TypeSystemContext, ty: TypeId, kind: StaticPoolKind) -> String {
    format!("{}__T", static_pool_symbol(ctx, ty, kind))
}

/// `true` if the type is rendered as a struct with a body.
fn has_body(ctx: &TypeSystemContext, ty: TypeId) -> bool {
    let desc = ctx.type_desc(ty);
    matches!(
        desc.category,
        TypeCategory::Class | TypeCategory::String | TypeCategory::Delegate | TypeCategory::ValueType
    ) && matches!(desc.key, TypeKey::Definition(..))
        && !ctx.has_open_parameters(ty)
}

/// `true` if the type gets a method-table record.
fn has_method_table(ctx: &TypeSystemContext, ty: TypeId) -> bool {
    let desc = ctx.type_desc(ty);
    !matches!(desc.category, TypeCategory::ByRef | TypeCategory::GenericParameter) && !ctx.has_open_parameters(ty)
}

/// Number of base types above `ty`.
fn depth(ctx: &TypeSystemContext, ty: TypeId) -> Result<usize> {
    let mut depth = 0;
    let mut current = ctx.base_type(ty)?;
    while let Some(base) = current {
        depth += 1;
        current = ctx.base_type(base)?;
    }
    Ok(depth)
}

/// Everything one unit emits, derived from its nodes.
#[derive(Debug, Clone, Default)]
pub struct EmissionPlan {
    /// Union of the references of all lowered methods
    pub references: MethodReferences,
    /// Methods that get a prototype
    pub declared: BTreeSet<MethodId>,
    /// Types with a struct body, dependencies first
    pub bodies: Vec<TypeId>,
    /// Types with a method-table record, `related` types first
    pub method_tables: Vec<TypeId>,
    /// Types with at least one non-empty static pool
    pub statics: Vec<TypeId>,
    /// Virtual methods called through their slot
    pub slots: Vec<MethodId>,
}

/// Renders one C++ translation unit.
///
/// # Examples
///
/// ```rust,no_run
/// use cilaot::codegen::{lower_method, CppWriter};
/// use cilaot::{il::ILProvider, typesystem::{MethodId, TypeSystemContext}};
///
/// fn unit(ctx: &TypeSystemContext, provider: &ILProvider, method: MethodId) -> cilaot::Result<String> {
///     let mut writer = CppWriter::new(ctx, "runtime.h");
///     if let Some(il) = provider.method_il(ctx, method)? {
///         writer.add_method(lower_method(ctx, method, &il)?);
///     }
///     writer.render()
/// }
/// ```
pub struct CppWriter<'a> {
    ctx: &'a TypeSystemContext,
    runtime_header: String,
    external_records: bool,
    types: BTreeSet<TypeId>,
    methods: Vec<LoweredMethod>,
    externs: BTreeSet<MethodId>,
    declarations: BTreeSet<MethodId>,
    data: Vec<ObjectNode>,
    entry_point: Option<MethodId>,
}

impl<'a> CppWriter<'a> {
    /// An empty unit including `runtime_header`.
    #[must_use]
    pub fn new(ctx: &'a TypeSystemContext, runtime_header: &str) -> Self {
        CppWriter {
            ctx,
            runtime_header: runtime_header.to_string(),
            external_records: false,
            types: BTreeSet::new(),
            methods: Vec::new(),
            externs: BTreeSet::new(),
            declarations: BTreeSet::new(),
            data: Vec::new(),
            entry_point: None,
        }
    }

    /// Only declare method tables, static pools and data nodes.
    #[must_use]
    pub fn with_external_records(mut self) -> Self {
        self.external_records = true;
        self
    }

    /// Emit the type's method table, statics and body.
    pub fn add_type(&mut self, ty: TypeId) {
        self.types.insert(ty);
    }

    /// Emit a method definition.
    pub fn add_method(&mut self, method: LoweredMethod) {
        self.methods.push(method);
    }

    /// Bind a method without body to its native import.
    pub fn add_extern(&mut self, method: MethodId) {
        self.externs.insert(method);
    }

    /// Declare a method another unit or the runtime defines.
    pub fn add_declaration(&mut self, method: MethodId) {
        self.declarations.insert(method);
    }

    /// Emit a data node.
    pub fn add_data(&mut self, node: ObjectNode) {
        self.data.push(node);
    }

    /// Emit a `main` stub calling `method`.
    pub fn set_entry_point(&mut self, method: Option<MethodId>) {
        self.entry_point = method;
    }

    /// Work out what the unit contains.
    ///
    /// # Errors
    /// Propagates type-system failures of referenced types.
    pub fn plan(&self) -> Result<EmissionPlan> {
        let ctx = self.ctx;
        let mut plan = EmissionPlan::default();
        for method in &self.methods {
            plan.references.merge(&method.references);
            plan.declared.insert(method.method);
        }
        plan.declared.extend(self.externs.iter().copied());
        plan.declared.extend(self.declarations.iter().copied());
        plan.declared.extend(plan.references.methods.iter().copied());
        if let Some(entry) = self.entry_point {
            plan.declared.insert(entry);
        }
        plan.slots = plan.references.virtual_slots.iter().copied().collect();

        let mut visited = FxHashSet::default();
        let roots: BTreeSet<TypeId> = self
            .types
            .iter()
            .chain(plan.references.method_tables.iter())
            .copied()
            .collect();
        for ty in roots {
            self.visit_method_table(ty, &mut visited, &mut plan.method_tables)?;
        }

        let statics: BTreeSet<TypeId> = self
            .types
            .iter()
            .chain(plan.references.statics.iter())
            .copied()
            .filter(|ty| !ctx.has_open_parameters(*ty))
            .collect();
        let mut body_roots: BTreeSet<TypeId> = plan.references.types.clone();
        for ty in statics {
            let pools = ctx.static_pools(ty)?;
            if pools.iter().all(StaticPool::is_empty) {
                continue;
            }
            for pool in &pools {
                for (field, _) in &pool.fields {
                    body_roots.insert(ctx.field(*field).field_type);
                }
            }
            plan.statics.push(ty);
        }

        body_roots.extend(self.types.iter().copied());
        for method in plan.declared.iter().chain(plan.slots.iter()) {
            let desc = ctx.method(*method);
            body_roots.extend(ctypes::call_params(ctx, *method)?);
            body_roots.insert(desc.signature.return_type);
        }
        let mut visited = FxHashSet::default();
        for ty in body_roots {
            self.visit_body(ty, &mut visited, &mut plan.bodies)?;
        }

        Ok(plan)
    }

    fn visit_method_table(&self, ty: TypeId, visited: &mut FxHashSet<TypeId>, order: &mut Vec<TypeId>) -> Result<()> {
        if !has_method_table(self.ctx, ty) || !visited.insert(ty) {
            return Ok(());
        }
        let related = match self.ctx.type_desc(ty).key {
            TypeKey::SzArray(element) | TypeKey::Array(element, _) => Some(element),
            _ => self.ctx.base_type(ty)?,
        };
        if let Some(related) = related {
            self.visit_method_table(related, visited, order)?;
        }
        order.push(ty);
        Ok(())
    }

    fn visit_body(&self, ty: TypeId, visited: &mut FxHashSet<TypeId>, order: &mut Vec<TypeId>) -> Result<()> {
        if !has_body(self.ctx, ty) || !visited.insert(ty) {
            return Ok(());
        }
        if let Some(base) = self.ctx.base_type(ty)? {
            self.visit_body(base, visited, order)?;
        }
        for (field, _) in &self.ctx.layout(ty)?.field_offsets {
            let field_type = self.ctx.field(*field).field_type;
            if self.ctx.type_desc(field_type).category == TypeCategory::ValueType {
                self.visit_body(field_type, visited, order)?;
            }
        }
        order.push(ty);
        Ok(())
    }

    /// Render the unit.
    ///
    /// # Errors
    /// Returns [`Error::RelocationResolution`] for data-node relocations that cannot be
    /// expressed in source, and propagates type-system failures.
    pub fn render(&self) -> Result<String> {
        let ctx = self.ctx;
        let plan = self.plan()?;
        let mut tables = Vec::with_capacity(plan.method_tables.len());
        for ty in &plan.method_tables {
            tables.push(MethodTable::build(ctx, *ty)?);
        }

        let mut out = CppBuffer::new();
        out.append_fmt(format_args!("#include \"{}\"", self.runtime_header));
        out.append_line();
        out.append(PROLOGUE);
        out.append_line();

        self.forward_declarations(&mut out, &plan, &tables)?;
        for ty in &plan.bodies {
            out.append_empty_line();
            self.type_body(&mut out, *ty)?;
        }
        for ty in &plan.statics {
            self.static_pools(&mut out, *ty)?;
        }
        for method in &plan.slots {
            out.append_empty_line();
            self.slot_accessor(&mut out, *method)?;
        }
        if !self.external_records {
            for table in &tables {
                out.append_empty_line();
                let definition = table.definition(ctx, |method| {
                    Ok(if plan.declared.contains(&method) {
                        Some(format!("(void*)&{}", ctx.mangled_method_name(method)?))
                    } else {
                        log::debug!(
                            "slot of {} left null, {} is not part of the program",
                            ctx.type_name(table.ty),
                            ctx.method_name(method)
                        );
                        None
                    })
                })?;
                out.append(&definition);
                out.append_line();
            }
            self.data_nodes(&mut out, &plan)?;
        }
        self.externs(&mut out)?;

        let mut methods: Vec<&LoweredMethod> = self.methods.iter().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        for method in &methods {
            out.append_empty_line();
            out.append(&method.code);
            out.append_line();
        }
        out.append_empty_line();
        for method in &methods {
            out.append_fmt(format_args!(
                "static inline void* __getmethod__{0}() {{ return (void*)&{0}; }}",
                method.name
            ));
            out.append_line();
        }

        if let Some(entry) = self.entry_point {
            out.append_empty_line();
            self.main_stub(&mut out, entry, &plan)?;
        }

        log::debug!(
            "rendered {} methods, {} type bodies, {} method tables, {} static owners",
            self.methods.len(),
            plan.bodies.len(),
            plan.method_tables.len(),
            plan.statics.len()
        );
        Ok(out.into_string())
    }

    fn forward_declarations(&self, out: &mut CppBuffer, plan: &EmissionPlan, tables: &[MethodTable]) -> Result<()> {
        let ctx = self.ctx;
        out.append_empty_line();
        for ty in &plan.bodies {
            out.append_fmt(format_args!("struct {};", ctypes::value_type_name(ctx, *ty)));
            out.append_line();
        }
        for table in tables {
            out.append(&table.struct_declaration(ctx));
            out.append_line();
            out.append_fmt(format_args!(
                "extern \"C\" {} {};",
                method_table_struct(ctx, table.ty),
                method_table_symbol(ctx, table.ty)
            ));
            out.append_line();
        }
        for method in &plan.declared {
            let name = ctx.mangled_method_name(*method)?;
            out.append_fmt(format_args!(
                "extern \"C\" {};",
                ctypes::method_declaration(ctx, *method, name)?
            ));
            out.append_line();
        }
        Ok(())
    }

    fn type_body(&self, out: &mut CppBuffer, ty: TypeId) -> Result<()> {
        let ctx = self.ctx;
        let desc = ctx.type_desc(ty);
        let layout = ctx.layout(ty)?;
        let members = ctypes::instance_members(ctx, ty)?;
        let explicit = desc.layout_kind == LayoutKind::Explicit;
        let start = if desc.is_value_type() { 0 } else { ctx.pointer_size() };

        if explicit {
            out.append("#pragma pack(push, 1)");
            out.append_line();
        }
        out.append_fmt(format_args!("struct {}", ctypes::value_type_name(ctx, ty)));
        out.append_line();
        out.append("{");
        out.indent();
        if !desc.is_value_type() {
            out.append_line();
            out.append("void* __mt;");
        }
        render_members(out, &members, start, layout.instance_size);
        out.exdent();
        out.append_line();
        out.append("};");
        if explicit {
            out.append_line();
            out.append("#pragma pack(pop)");
        }
        out.append_line();
        Ok(())
    }

    fn static_pools(&self, out: &mut CppBuffer, ty: TypeId) -> Result<()> {
        let ctx = self.ctx;
        for pool in ctx.static_pools(ty)? {
            if pool.is_empty() {
                continue;
            }
            let members = ctypes::static_members(ctx, &pool)?;
            let type_name = static_pool_struct(ctx, ty, pool.kind);
            let symbol = static_pool_symbol(ctx, ty, pool.kind);

            out.append_empty_line();
            out.append_fmt(format_args!("struct {type_name}"));
            out.append_line();
            out.append("{");
            out.indent();
            render_members(out, &members, 0, pool.size);
            out.exdent();
            out.append_line();
            out.append("};");
            out.append_line();

            let thread_local = matches!(pool.kind, StaticPoolKind::ThreadNonGc | StaticPoolKind::ThreadGc);
            if self.external_records {
                out.append_fmt(format_args!("extern \"C\" {type_name} {symbol};"));
            } else if thread_local {
                out.append_fmt(format_args!("thread_local {type_name} {symbol};"));
            } else {
                out.append_fmt(format_args!("{type_name} {symbol};"));
            }
            out.append_line();
        }
        Ok(())
    }

    fn slot_accessor(&self, out: &mut CppBuffer, method: MethodId) -> Result<()> {
        let ctx = self.ctx;
        let name = ctx.mangled_method_name(method)?;
        let slot = ctx.virtual_slot(method)?;
        let declarator =
            ctypes::function_pointer_declarator(ctx, &ctx.method(method).signature, &format!("__slot__{name}"))?;
        out.append_fmt(format_args!("typedef {declarator};"));
        out.append_line();
        out.append_fmt(format_args!(
            "static inline void* __getslot__{name}(void* pThis) {{ return *((void**)(*((RawMethodTable**)pThis) + 1) + {slot}); }}"
        ));
        out.append_line();
        Ok(())
    }

    /// C++ address expressions of every symbol a data-node relocation may target.
    fn symbol_addresses(&self, plan: &EmissionPlan) -> Result<FxHashMap<String, String>> {
        let ctx = self.ctx;
        let mut symbols = FxHashMap::default();
        for ty in &plan.method_tables {
            let symbol = method_table_symbol(ctx, *ty);
            symbols.insert(symbol.clone(), format!("&{symbol}"));
        }
        for method in &plan.declared {
            let name = ctx.mangled_method_name(*method)?;
            symbols.insert(name.to_string(), format!("(void*)&{name}"));
        }
        for ty in &plan.statics {
            for pool in ctx.static_pools(*ty)? {
                if !pool.is_empty() {
                    let symbol = static_pool_symbol(ctx, *ty, pool.kind);
                    symbols.insert(symbol.clone(), format!("&{symbol}"));
                }
            }
        }
        for node in &self.data {
            for (symbol, offset) in node.symbols() {
                let address = if offset == 0 {
                    format!("&{}", node.name)
                } else {
                    format!("(char*)&{} + {offset}", node.name)
                };
                symbols.insert(symbol.to_string(), address);
            }
        }
        Ok(symbols)
    }

    fn data_nodes(&self, out: &mut CppBuffer, plan: &EmissionPlan) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }
        let symbols = self.symbol_addresses(plan)?;
        let pointer_size = self.ctx.pointer_size();

        for node in &self.data {
            out.append_empty_line();
            out.append("#pragma pack(push, 1)");
            out.append_line();
            out.append_fmt(format_args!("struct {}__Data", node.name));
            out.append_line();
            out.append("{");
            out.indent();
            for (index, part) in data_parts(node, pointer_size)?.iter().enumerate() {
                out.append_line();
                match part {
                    DataPart::Bytes(bytes) => {
                        out.append_fmt(format_args!("unsigned char data{index}[{}];", bytes.len().max(1)));
                    }
                    DataPart::Pointer(_) => out.append_fmt(format_args!("void* reloc{index};")),
                }
            }
            out.exdent();
            out.append_line();
            out.append("};");
            out.append_line();
            out.append("#pragma pack(pop)");
            out.append_line();
            out.append_fmt(format_args!("extern {0}__Data {0};", node.name));
            out.append_line();
        }

        for node in &self.data {
            out.append_empty_line();
            out.append_fmt(format_args!("{0}__Data {0} = {{", node.name));
            out.indent();
            for part in data_parts(node, pointer_size)? {
                out.append_line();
                match part {
                    DataPart::Bytes([]) => out.append("{ 0 },"),
                    DataPart::Bytes(bytes) => {
                        let bytes: Vec<String> = bytes.iter().map(|byte| format!("0x{byte:02X}")).collect();
                        out.append_fmt(format_args!("{{ {} }},", bytes.join(",")));
                    }
                    DataPart::Pointer(relocation) => match symbols.get(&relocation.target) {
                        Some(address) => {
                            out.append_fmt(format_args!("(char*)({address}) + {},", relocation.delta));
                        }
                        None => {
                            log::warn!(
                                "relocation to {} resolved to null ({}+{:#x})",
                                relocation.target,
                                node.name,
                                relocation.offset
                            );
                            out.append("NULL,");
                        }
                    },
                }
            }
            out.exdent();
            out.append_line();
            out.append("};");
            out.append_line();
        }
        Ok(())
    }

    fn externs(&self, out: &mut CppBuffer) -> Result<()> {
        let ctx = self.ctx;
        let mut imports: BTreeMap<String, Vec<(String, MethodId)>> = BTreeMap::new();
        for method in &self.externs {
            let desc = ctx.method(*method);
            let import = match &desc.pinvoke {
                Some(info) if !info.entry_point.is_empty() => info.entry_point.clone(),
                _ => desc.name.clone(),
            };
            let name = ctx.mangled_method_name(*method)?.to_string();
            imports.entry(import).or_default().push((name, *method));
        }

        for (import, mut callers) in imports {
            callers.sort();
            let Some((_, canonical)) = callers.first() else {
                continue;
            };
            let canonical_signature = native_signature(ctx, *canonical)?;

            out.append_empty_line();
            if !CRT_IMPORTS.contains(&import.as_str()) {
                out.append_fmt(format_args!(
                    "extern \"C\" {} {import}({});",
                    canonical_signature.0,
                    canonical_signature.1.join(", ")
                ));
                out.append_line();
            }

            for (name, method) in &callers {
                let signature = native_signature(ctx, *method)?;
                let arguments: Vec<String> = (0..signature.1.len()).map(|index| format!("_a{index}")).collect();
                let callee = if signature == canonical_signature {
                    import.clone()
                } else {
                    let declarator = ctypes::function_pointer_declarator(
                        ctx,
                        &ctx.method(*method).signature,
                        &format!("__slot__{name}"),
                    )?;
                    out.append_fmt(format_args!("typedef {declarator};"));
                    out.append_line();
                    format!("((__slot__{name})(void*)&{import})")
                };
                let call = format!("{callee}({})", arguments.join(", "));
                let body = if signature.0 == "void" {
                    format!("{call};")
                } else {
                    format!("return {call};")
                };
                out.append_fmt(format_args!(
                    "{} {{ {body} }}",
                    ctypes::method_declaration(ctx, *method, name)?
                ));
                out.append_line();
            }
        }
        Ok(())
    }

    fn main_stub(&self, out: &mut CppBuffer, entry: MethodId, plan: &EmissionPlan) -> Result<()> {
        let ctx = self.ctx;
        let desc = ctx.method(entry);
        let name = ctx.mangled_method_name(entry)?;
        let returns_value = !ctypes::is_void(ctx, desc.signature.return_type);

        let mut cctors = Vec::new();
        for method in &self.methods {
            let cctor = ctx.method(method.method);
            if cctor.name == ".cctor" && cctor.is_static() {
                cctors.push((depth(ctx, cctor.owner)?, method.name.as_str()));
            }
        }
        cctors.sort();

        out.append("static void* __module[] = {");
        out.indent();
        for ty in &plan.method_tables {
            out.append_line();
            out.append_fmt(format_args!("(void*)&{},", method_table_symbol(ctx, *ty)));
        }
        out.append_line();
        out.append("0");
        out.exdent();
        out.append_line();
        out.append("};");
        out.append_line();
        out.append_empty_line();

        out.append("int main(int argc, char* argv[])");
        out.append_line();
        out.append("{");
        out.indent();
        out.append_line();
        out.append("if (__initialize_runtime() != 0) return -1;");
        out.append_line();
        out.append("__register_module(__module);");
        out.append_line();
        out.append("ReversePInvokeFrame frame;");
        out.append_line();
        out.append("__reverse_pinvoke(&frame);");
        out.append_line();
        for (_, cctor) in &cctors {
            out.append_fmt(format_args!("{cctor}();"));
            out.append_line();
        }

        let arguments = match desc.signature.params.len() {
            0 => String::new(),
            1 => "(void*)__get_commandline_args(argc - 1, argv + 1)".to_string(),
            count => {
                return Err(unsupported!(
                    "entry point {} takes {} parameters",
                    ctx.method_name(entry),
                    count
                ))
            }
        };
        if returns_value {
            out.append_fmt(format_args!("int ret = {name}({arguments});"));
        } else {
            out.append_fmt(format_args!("{name}({arguments});"));
        }
        out.append_line();
        out.append("__reverse_pinvoke_return(&frame);");
        out.append_line();
        out.append("__shutdown_runtime();");
        out.append_line();
        out.append(if returns_value { "return ret;" } else { "return 0;" });
        out.exdent();
        out.append_line();
        out.append("}");
        out.append_line();
        Ok(())
    }
}

/// Return type and parameter types of a native import, as spelled in C++.
fn native_signature(ctx: &TypeSystemContext, method: MethodId) -> Result<(String, Vec<String>)> {
    let mut params = Vec::new();
    for param in ctypes::call_params(ctx, method)? {
        params.push(ctypes::cpp_type_name(ctx, param)?);
    }
    Ok((
        ctypes::cpp_type_name(ctx, ctx.method(method).signature.return_type)?,
        params,
    ))
}

/// Struct members between `start` and `size`, padded to their offsets.
///
/// Members that overlap are rendered as a union of anonymous structs, each padded to its own
/// offset, plus a byte array spanning the whole range.
fn render_members(out: &mut CppBuffer, members: &[StructMember], start: u32, size: u32) {
    let mut sorted: Vec<&StructMember> = members.iter().collect();
    sorted.sort_by_key(|member| member.offset);
    let overlapping = sorted
        .windows(2)
        .any(|pair| pair[0].offset + pair[0].size > pair[1].offset)
        || sorted.first().is_some_and(|member| member.offset < start);
    let mut pads = 0;

    if !overlapping {
        let mut cursor = start;
        for member in sorted {
            if member.offset > cursor {
                out.append_line();
                out.append_fmt(format_args!("uint8_t __pad{pads}[{}];", member.offset - cursor));
                pads += 1;
            }
            out.append_line();
            out.append_fmt(format_args!("{} {};", member.cpp_type, member.name));
            cursor = member.offset + member.size;
        }
        if size > cursor {
            out.append_line();
            out.append_fmt(format_args!("uint8_t __pad{pads}[{}];", size - cursor));
        }
        return;
    }

    out.append_line();
    out.append("union");
    out.append_line();
    out.append("{");
    out.indent();
    for member in members {
        out.append_line();
        let offset = member.offset.saturating_sub(start);
        if offset > 0 {
            out.append_fmt(format_args!(
                "struct {{ uint8_t __pad{pads}[{offset}]; {} {}; }};",
                member.cpp_type, member.name
            ));
            pads += 1;
        } else {
            out.append_fmt(format_args!("struct {{ {} {}; }};", member.cpp_type, member.name));
        }
    }
    if size > start {
        out.append_line();
        out.append_fmt(format_args!("uint8_t __size[{}];", size - start));
    }
    out.exdent();
    out.append_line();
    out.append("};");
}

/// A run of plain bytes or one pointer relocation within a data node.
enum DataPart<'n> {
    Bytes(&'n [u8]),
    Pointer(&'n crate::object::Relocation),
}

fn data_parts(node: &ObjectNode, pointer_size: u32) -> Result<Vec<DataPart<'_>>> {
    let mut parts = Vec::new();
    let mut cursor = 0_usize;
    for relocation in &node.relocations {
        if relocation.kind == RelocationKind::Rel32 || relocation.kind.size() != pointer_size {
            return Err(Error::RelocationResolution(format!(
                "{:?} relocation at {}+{:#x} has no source form",
                relocation.kind, node.name, relocation.offset
            )));
        }
        let offset = relocation.offset as usize;
        let end = offset + pointer_size as usize;
        if offset < cursor || end > node.data.len() {
            return Err(Error::RelocationResolution(format!(
                "relocation at {}+{:#x} overlaps another or leaves the node",
                node.name, relocation.offset
            )));
        }
        if offset > cursor {
            parts.push(DataPart::Bytes(&node.data[cursor..offset]));
        }
        parts.push(DataPart::Pointer(relocation));
        cursor = end;
    }
    if cursor < node.data.len() || parts.is_empty() {
        parts.push(DataPart::Bytes(&node.data[cursor..]));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        codegen::importer::trap_stub,
        metadata::{FieldAttributes, StoreBuilder, TypeAttributes, TypeSig},
        object::{NodeSection, ObjectDataBuilder},
        typesystem::TargetDetails,
    };

    fn context(builder: StoreBuilder) -> TypeSystemContext {
        TypeSystemContext::new(Arc::new(builder.build()), TargetDetails::default())
    }

    #[test]
    fn explicit_layout_renders_a_union() {
        let mut builder = StoreBuilder::new().with_core_library();
        let value_type = builder.core_type("ValueType");
        let union = builder.add_type("App", "Bits", TypeAttributes::EXPLICIT_LAYOUT, value_type);
        let as_int = builder.add_field(union, "AsInt", FieldAttributes::empty(), TypeSig::I4);
        let as_float = builder.add_field(union, "AsFloat", FieldAttributes::empty(), TypeSig::R4);
        let high = builder.add_field(union, "High", FieldAttributes::empty(), TypeSig::U2);
        builder.set_field_offset(as_int, 0);
        builder.set_field_offset(as_float, 0);
        builder.set_field_offset(high, 2);
        let ctx = context(builder);
        let union = ctx.definition_type(union).unwrap();

        let mut writer = CppWriter::new(&ctx, "runtime.h");
        writer.add_type(union);
        let unit = writer.render().unwrap();
        assert!(unit.contains("#pragma pack(push, 1)\nstruct App_Bits\n{\n    union"));
        assert!(unit.contains("struct { int32_t AsInt; };"));
        assert!(unit.contains("struct { float AsFloat; };"));
        assert!(unit.contains("struct { uint8_t __pad0[2]; uint16_t High; };"));
        assert!(unit.contains("uint8_t __size[4];"));
    }

    #[test]
    fn sequential_class_pads_and_leads_with_method_table() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let node = builder.add_type("App", "Node", TypeAttributes::empty(), object);
        builder.add_field(node, "Tag", FieldAttributes::empty(), TypeSig::U1);
        builder.add_field(node, "Next", FieldAttributes::empty(), TypeSig::Named(node));
        builder.add_field(node, "Count", FieldAttributes::STATIC, TypeSig::I4);
        builder.add_field(node, "Head", FieldAttributes::STATIC, TypeSig::Named(node));
        let ctx = context(builder);
        let node = ctx.definition_type(node).unwrap();

        let mut writer = CppWriter::new(&ctx, "runtime.h");
        writer.add_type(node);
        let unit = writer.render().unwrap();
        assert!(unit.starts_with("#include \"runtime.h\"\n"));
        assert!(unit.contains("struct App_Node\n{\n    void* __mt;\n    uint8_t Tag;\n    uint8_t __pad0[7];\n    void* Next;\n};"));
        assert!(unit.contains("App_Node_statics__T App_Node_statics;"));
        assert!(unit.contains("App_Node_gcstatics__T App_Node_gcstatics;"));
        assert!(unit.contains("extern \"C\" App_Node__MT App_Node__MethodTable;"));
        let object_table = unit.find("System_Object__MT System_Object__MethodTable = {").unwrap();
        let node_table = unit.find("App_Node__MT App_Node__MethodTable = {").unwrap();
        assert!(object_table < node_table);

        let mut external = CppWriter::new(&ctx, "runtime.h").with_external_records();
        external.add_type(node);
        let unit = external.render().unwrap();
        assert!(unit.contains("extern \"C\" App_Node_gcstatics__T App_Node_gcstatics;"));
        assert!(!unit.contains("App_Node__MT App_Node__MethodTable = {"));
    }

    #[test]
    fn data_nodes_split_at_relocations() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let app = builder.add_type("App", "Holder", TypeAttributes::empty(), object);
        let ctx = context(builder);
        let app = ctx.definition_type(app).unwrap();

        let mut data = ObjectDataBuilder::new(8);
        data.emit_u16(0x1234);
        data.align(8);
        data.emit_pointer("App_Holder__MethodTable", 16);
        data.emit_pointer("Stripped", 0);
        data.define_symbol("Blob_Tail");
        data.emit_u8(0xFF);

        let mut writer = CppWriter::new(&ctx, "runtime.h");
        writer.add_type(app);
        writer.add_data(data.finish("Blob", NodeSection::Data));
        let unit = writer.render().unwrap();
        assert!(unit.contains("unsigned char data0[8];\n    void* reloc1;\n    void* reloc2;\n    unsigned char data3[1];"));
        assert!(unit.contains("{ 0x34,0x12,0x00,0x00,0x00,0x00,0x00,0x00 },"));
        assert!(unit.contains("(char*)(&App_Holder__MethodTable) + 16,"));
        assert!(unit.contains("NULL,"));
    }

    #[test]
    fn trap_stubs_get_accessors() {
        let mut builder = StoreBuilder::new().with_core_library();
        let object = builder.core_type("Object");
        let app = builder.add_type("App", "Program", TypeAttributes::empty(), object);
        let main = builder.add_method(
            app,
            "Main",
            crate::metadata::MethodAttributes::STATIC,
            crate::metadata::MethodSig::new_static(TypeSig::I4, vec![]),
        );
        let ctx = context(builder);
        let app = ctx.definition_type(app).unwrap();
        let main = ctx.method_for_definition(app, main).unwrap();

        let mut writer = CppWriter::new(&ctx, "runtime.h");
        writer.add_method(trap_stub(&ctx, main).unwrap());
        writer.set_entry_point(Some(main));
        let unit = writer.render().unwrap();
        assert!(unit.contains("extern \"C\" int32_t App_Program__Main();"));
        assert!(unit.contains("static inline void* __getmethod__App_Program__Main() { return (void*)&App_Program__Main; }"));
        assert!(unit.contains("int ret = App_Program__Main();"));
        assert!(unit.contains("return ret;"));
    }
}
