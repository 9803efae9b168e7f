//! Lowering of one method body to C++.
//!
//! The importer splits the body into basic blocks and imports them in layout order while it
//! tracks an abstract [`EvaluationStack`]. Every value that is not a constant or a plain variable
//! read is computed into a block-local temporary, so the entries left on the stack are free of
//! side effects and can be duplicated or dropped. Values still on the stack at the end of a block
//! are copied into the spill slots of each successor. The first predecessor to be imported fixes
//! a successor's entry shape and every later predecessor must match it.
//!
//! Each block is rendered as a labelled scope `_bbN: { ... }`, so temporaries never outlive the
//! block that computed them and no `goto` skips an initialization.
//!
//! Exception regions are lowered without native unwinding. `leave` out of a `try` with a
//! `finally` records a continuation number, runs the handler and comes back through a dispatch
//! `switch` placed after the last block. Catch and filter handlers start with the exception
//! object in `__exceptionN`, which the runtime fills in before it transfers control.

mod handlers;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    codegen::{
        blocks::{find_blocks, BlockGraph, BlockState},
        buffer::CppBuffer,
        ctypes,
        stack::{EvaluationStack, StackEntry, StackShape, StackValueKind},
    },
    il::{decode_stream, Immediate, Instruction, MethodIL, OpCode, Operand},
    metadata::{
        method::{ExceptionRegion, ExceptionRegionKind},
        token::Token,
    },
    typesystem::{MethodId, MethodKind, PrimitiveKind, TypeCategory, TypeId, TypeSystemContext, WellKnownType},
    Error, Result,
};

/// What a lowered method needs from the rest of the program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodReferences {
    /// Methods called or whose address is taken
    pub methods: BTreeSet<MethodId>,
    /// Virtual methods dispatched through their slot
    pub virtual_slots: BTreeSet<MethodId>,
    /// Types whose struct body must be visible
    pub types: BTreeSet<TypeId>,
    /// Types whose method table is referenced
    pub method_tables: BTreeSet<TypeId>,
    /// Types whose static pools are accessed
    pub statics: BTreeSet<TypeId>,
}

impl MethodReferences {
    /// Add everything `other` references.
    pub fn merge(&mut self, other: &MethodReferences) {
        self.methods.extend(other.methods.iter().copied());
        self.virtual_slots.extend(other.virtual_slots.iter().copied());
        self.types.extend(other.types.iter().copied());
        self.method_tables.extend(other.method_tables.iter().copied());
        self.statics.extend(other.statics.iter().copied());
    }
}

/// The C++ definition of one method.
#[derive(Debug, Clone)]
pub struct LoweredMethod {
    /// The method
    pub method: MethodId,
    /// Its mangled name
    pub name: String,
    /// Complete definition, header and body
    pub code: String,
    /// Entities the definition refers to
    pub references: MethodReferences,
}

/// Lower `method` from its body.
///
/// # Errors
/// Returns the failure that stopped the import. Every failure caused by the body itself is
/// method-local, see [`Error::is_method_local`].
///
/// # Examples
///
/// ```rust,no_run
/// use cilaot::{codegen::lower_method, il::ILProvider, typesystem::{MethodId, TypeSystemContext}};
///
/// fn lower(ctx: &TypeSystemContext, provider: &ILProvider, method: MethodId) -> cilaot::Result<()> {
///     if let Some(il) = provider.method_il(ctx, method)? {
///         let lowered = lower_method(ctx, method, &il)?;
///         println!("{}", lowered.code);
///     }
///     Ok(())
/// }
/// ```
pub fn lower_method(ctx: &TypeSystemContext, method: MethodId, il: &MethodIL) -> Result<LoweredMethod> {
    MethodImporter::new(ctx, method, il)?.import()
}

/// The body emitted in place of a method that failed to lower. It faults when called.
///
/// # Errors
/// Fails only if the method's signature has no C++ spelling.
pub fn trap_stub(ctx: &TypeSystemContext, method: MethodId) -> Result<LoweredMethod> {
    let name = ctx.mangled_method_name(method)?.to_string();
    let mut references = MethodReferences::default();
    signature_types(ctx, method, &mut references)?;

    let mut code = CppBuffer::new();
    code.append(&ctypes::method_declaration(ctx, method, &name)?);
    code.append_line();
    code.append("{");
    code.indent();
    code.append_line();
    code.append("throw 0xC000C000;");
    code.exdent();
    code.append_line();
    code.append("}");

    Ok(LoweredMethod {
        method,
        name,
        code: code.into_string(),
        references,
    })
}

/// Body of an unboxing stub: step `this` over the method table pointer and forward.
///
/// # Errors
/// Returns [`Error::Malformed`] if `method` is not an unboxing stub.
pub fn lower_unboxing_stub(ctx: &TypeSystemContext, method: MethodId) -> Result<LoweredMethod> {
    let MethodKind::UnboxingStub { target } = ctx.method(method).kind else {
        return Err(malformed_error!("{} is not an unboxing stub", ctx.method_name(method)));
    };
    let name = ctx.mangled_method_name(method)?.to_string();
    let target_name = ctx.mangled_method_name(target)?;
    let mut references = MethodReferences::default();
    signature_types(ctx, method, &mut references)?;
    references.methods.insert(target);

    let params = ctypes::call_params(ctx, method)?;
    let mut args = vec!["(void*)((uint8_t*)_a0 + sizeof(void*))".to_string()];
    args.extend((1..params.len()).map(|index| format!("_a{index}")));
    let call = format!("{target_name}({})", args.join(", "));

    let mut code = CppBuffer::new();
    code.append(&ctypes::method_declaration(ctx, method, &name)?);
    code.append_line();
    code.append("{");
    code.indent();
    code.append_line();
    if ctypes::is_void(ctx, ctx.method(method).signature.return_type) {
        code.append_fmt(format_args!("{call};"));
    } else {
        code.append_fmt(format_args!("return {call};"));
    }
    code.exdent();
    code.append_line();
    code.append("}");

    Ok(LoweredMethod {
        method,
        name,
        code: code.into_string(),
        references,
    })
}

/// Value types a method's declaration spells by name.
fn signature_types(ctx: &TypeSystemContext, method: MethodId, references: &mut MethodReferences) -> Result<()> {
    let mut types = ctypes::call_params(ctx, method)?;
    types.push(ctx.method(method).signature.return_type);
    for ty in types {
        if ctx.type_desc(ty).category == TypeCategory::ValueType {
            references.types.insert(ty);
        }
    }
    Ok(())
}

fn argument_name(index: usize) -> String {
    format!("_a{index}")
}

fn local_name(index: usize) -> String {
    format!("_l{index}")
}

/// Import state of one method.
struct MethodImporter<'a> {
    ctx: &'a TypeSystemContext,
    method: MethodId,
    il: &'a MethodIL,
    instructions: Vec<Instruction>,
    graph: BlockGraph,
    regions: Vec<ExceptionRegion>,
    params: Vec<TypeId>,
    locals: Vec<TypeId>,
    /// Variables whose address escapes, read eagerly
    address_taken: FxHashSet<String>,
    stack: EvaluationStack,
    /// Entry slots of every block whose shape is fixed, by block index
    entry_slots: FxHashMap<usize, Vec<StackEntry>>,
    /// Declared spill slots as (C++ type, name)
    spill_slots: Vec<(String, String)>,
    /// Continuations allocated per `finally` region
    finally_returns: Vec<u32>,
    /// Regions whose `endfinally` was imported
    end_finally_used: Vec<bool>,
    code: CppBuffer,
    temp_count: u32,
    constrained: Option<TypeId>,
    current_offset: u32,
    terminated: bool,
    references: MethodReferences,
}

impl<'a> MethodImporter<'a> {
    fn new(ctx: &'a TypeSystemContext, method: MethodId, il: &'a MethodIL) -> Result<Self> {
        let instructions = decode_stream(il.code())?;
        let code_len = u32::try_from(il.code().len())
            .map_err(|_| malformed_error!("Method body of {} bytes", il.code().len()))?;
        let regions = il.exception_regions().to_vec();
        let graph = find_blocks(&instructions, code_len, &regions)?;
        if graph.is_empty() {
            return Err(malformed_error!("{} has an empty body", ctx.method_name(method)));
        }

        let mut address_taken = FxHashSet::default();
        for instruction in &instructions {
            let name = match instruction.opcode {
                OpCode::LdargaS | OpCode::Ldarga => argument_name,
                OpCode::LdlocaS | OpCode::Ldloca => local_name,
                _ => continue,
            };
            if let Some(index) = instruction.immediate().and_then(|value| usize::try_from(value).ok()) {
                address_taken.insert(name(index));
            }
        }

        let region_count = regions.len();
        Ok(MethodImporter {
            ctx,
            method,
            il,
            instructions,
            graph,
            regions,
            params: ctypes::call_params(ctx, method)?,
            locals: il.locals(ctx)?,
            address_taken,
            stack: EvaluationStack::new(),
            entry_slots: FxHashMap::default(),
            spill_slots: Vec::new(),
            finally_returns: vec![0; region_count],
            end_finally_used: vec![false; region_count],
            code: CppBuffer::new(),
            temp_count: 0,
            constrained: None,
            current_offset: 0,
            terminated: false,
            references: MethodReferences::default(),
        })
    }

    fn import(mut self) -> Result<LoweredMethod> {
        self.prepare_handlers()?;
        for index in 0..self.graph.len() {
            self.import_block(index)?;
        }
        self.finish()
    }

    /// Fix the entry stacks of handler and filter blocks.
    fn prepare_handlers(&mut self) -> Result<()> {
        for (index, region) in self.regions.clone().iter().enumerate() {
            let entry = if region.handler_takes_exception() {
                vec![StackEntry::Spilled {
                    kind: StackValueKind::ObjRef,
                    name: format!("__exception{index}"),
                    ty: self.il.catch_type(self.ctx, region)?,
                }]
            } else {
                Vec::new()
            };

            let mut starts = vec![region.handler_offset];
            if let ExceptionRegionKind::Filter(filter) = region.kind {
                starts.push(filter);
            }
            for start in starts {
                let block = self.block_index(start)?;
                self.preset_entry(block, entry.clone());
            }
        }
        Ok(())
    }

    fn preset_entry(&mut self, block: usize, entry: Vec<StackEntry>) {
        if let Some(target) = self.graph.block_mut(block) {
            target.entry_stack = Some(entry.iter().map(StackShape::of).collect());
            target.state = BlockState::Reached;
        }
        self.entry_slots.insert(block, entry);
    }

    fn block_index(&self, offset: u32) -> Result<usize> {
        self.graph
            .index_at(offset)
            .ok_or_else(|| malformed_error!("IL_{:04x} does not start a block", offset))
    }

    fn import_block(&mut self, index: usize) -> Result<()> {
        let (start, first, last, state) = {
            let block = &self.graph.blocks()[index];
            (block.start, block.first, block.last, block.state)
        };
        if state == BlockState::Unreached {
            self.preset_entry(index, Vec::new());
        }
        if let Some(block) = self.graph.block_mut(index) {
            block.state = BlockState::Importing;
        }

        self.stack.clear();
        for entry in self.entry_slots.get(&index).cloned().unwrap_or_default() {
            self.stack.push(entry);
        }

        self.code.append_empty_line();
        self.code.append_fmt(format_args!("_bb{start}: {{"));
        self.code.indent();
        self.terminated = false;

        for position in first..last {
            let instruction = self.instructions[position].clone();
            self.current_offset = instruction.offset;
            self.import_instruction(&instruction)?;
        }

        if !self.terminated {
            if index + 1 >= self.graph.len() {
                return Err(malformed_error!(
                    "IL_{:04x} falls through past the end of the body",
                    self.current_offset
                ));
            }
            self.transfer(index + 1)?;
        }

        self.code.exdent();
        self.code.append_line();
        self.code.append("}");
        if let Some(block) = self.graph.block_mut(index) {
            block.state = BlockState::Closed;
        }
        Ok(())
    }

    /// Carry the current stack into block `target`, fixing its entry shape if this is the first
    /// path into it.
    fn transfer(&mut self, target: usize) -> Result<()> {
        let shape = self.stack.shape();
        let (start, expected) = {
            let block = &self.graph.blocks()[target];
            (block.start, block.entry_stack.clone())
        };

        match expected {
            Some(expected) if expected != shape => {
                return Err(Error::StackMergeConflict {
                    offset: start,
                    message: format!(
                        "IL_{:04x} arrives with {} but the block expects {}",
                        self.current_offset,
                        describe(&shape),
                        describe(&expected)
                    ),
                });
            }
            Some(_) => {}
            None => {
                let mut slots = Vec::with_capacity(shape.len());
                for (entry, slot_shape) in self.stack.iter().zip(&shape) {
                    let name = format!("_s{}", self.spill_slots.len());
                    self.spill_slots.push((slot_shape.cpp_type(self.ctx), name.clone()));
                    slots.push(StackEntry::Spilled {
                        kind: slot_shape.kind,
                        name,
                        ty: entry.ty(),
                    });
                }
                if let Some(block) = self.graph.block_mut(target) {
                    block.entry_stack = Some(shape);
                    if block.state == BlockState::Unreached {
                        block.state = BlockState::Reached;
                    }
                }
                self.entry_slots.insert(target, slots);
            }
        }

        let slots = self.entry_slots.get(&target).cloned().unwrap_or_default();
        if slots.is_empty() {
            return Ok(());
        }

        let slot_names: Vec<String> = slots.iter().map(ToString::to_string).collect();
        let clobbered = self.stack.iter().any(|entry| {
            matches!(entry, StackEntry::Spilled { name, .. } if slot_names.contains(name))
        });
        if clobbered {
            self.materialize_spilled()?;
        }

        let sources: Vec<StackEntry> = self.stack.iter().cloned().collect();
        for (slot, source) in slot_names.iter().zip(&sources) {
            if *slot != source.to_string() {
                self.emit(&format!("{slot} = {source};"));
            }
        }
        Ok(())
    }

    /// Copy every spill-slot entry on the stack into a temporary.
    fn materialize_spilled(&mut self) -> Result<()> {
        let pending: Vec<(usize, StackEntry)> = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, entry)| matches!(entry, StackEntry::Spilled { .. }))
            .map(|(position, entry)| (position, entry.clone()))
            .collect();
        for (position, entry) in pending {
            let copy = self.temporary(entry.kind(), entry.ty(), &entry.to_string())?;
            if let Some(slot) = self.stack.iter_mut().nth(position) {
                *slot = copy;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<LoweredMethod> {
        let ctx = self.ctx;
        let name = ctx.mangled_method_name(self.method)?.to_string();
        let mut references = self.references;
        signature_types(ctx, self.method, &mut references)?;

        let mut out = CppBuffer::new();
        out.append(&ctypes::method_declaration(ctx, self.method, &name)?);
        out.append_line();
        out.append("{");
        out.indent();

        for (index, ty) in self.locals.iter().enumerate() {
            let ctype = ctypes::cpp_type_name(ctx, *ty)?;
            let local = local_name(index);
            let is_struct = ctx.type_desc(*ty).category == TypeCategory::ValueType;
            if is_struct {
                references.types.insert(*ty);
            }
            out.append_line();
            match (self.il.init_locals(), is_struct) {
                (true, true) => out.append_fmt(format_args!(
                    "{ctype} {local}; memset(&{local}, 0, sizeof({ctype}));"
                )),
                (true, false) => out.append_fmt(format_args!("{ctype} {local} = 0;")),
                (false, _) => out.append_fmt(format_args!("{ctype} {local};")),
            }
        }
        for (ctype, slot) in &self.spill_slots {
            out.append_line();
            out.append_fmt(format_args!("{ctype} {slot};"));
        }
        for (index, region) in self.regions.iter().enumerate() {
            if region.handler_takes_exception() {
                out.append_line();
                out.append_fmt(format_args!("void* __exception{index} = 0;"));
            }
            if self.finally_returns[index] > 0 || self.end_finally_used[index] {
                out.append_line();
                out.append_fmt(format_args!("int __finallyReturn{index} = 0;"));
            }
        }

        out.exdent();
        out.append(self.code.as_str());

        for (index, returns) in self.finally_returns.iter().enumerate() {
            if *returns == 0 && !self.end_finally_used[index] {
                continue;
            }
            out.append_empty_line();
            out.append_fmt(format_args!("__endFinally{index}:"));
            out.indent();
            out.append_line();
            out.append_fmt(format_args!("switch (__finallyReturn{index}) {{"));
            out.indent();
            for continuation in 1..=*returns {
                out.append_line();
                out.append_fmt(format_args!(
                    "case {continuation}: goto __returnFromFinally{index}_{continuation};"
                ));
            }
            out.append_line();
            out.append("default: __builtin_trap();");
            out.exdent();
            out.append_line();
            out.append("}");
            out.exdent();
        }
        out.append_empty_line();
        out.append("}");

        Ok(LoweredMethod {
            method: self.method,
            name,
            code: out.into_string(),
            references,
        })
    }

    fn emit(&mut self, statement: &str) {
        self.code.append_line();
        self.code.append(statement);
    }

    /// Emit a label at column zero.
    fn emit_label(&mut self, label: &str) {
        self.code.append_empty_line();
        self.code.append_fmt(format_args!("{label}: ;"));
    }

    fn import_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        let opcode = instruction.opcode.long_form();
        if opcode == OpCode::Constrained {
            self.constrained = Some(self.il.resolve_type(self.ctx, token_operand(instruction)?)?);
            return Ok(());
        }
        if opcode.flow() == crate::il::FlowType::Prefix {
            return Ok(());
        }
        let constrained = self.constrained.take();

        match opcode {
            // ================================================================
            // Stack operations
            // ================================================================
            OpCode::Nop => Ok(()),
            OpCode::Break => {
                self.emit("__debug_break();");
                Ok(())
            }
            OpCode::Dup => {
                let top = self.stack.pop()?;
                self.stack.push(top.clone());
                self.stack.push(top);
                Ok(())
            }
            OpCode::Pop => self.stack.pop().map(|_| ()),

            // ================================================================
            // Arguments and locals
            // ================================================================
            OpCode::Ldarg0 => self.load_argument(0),
            OpCode::Ldarg1 => self.load_argument(1),
            OpCode::Ldarg2 => self.load_argument(2),
            OpCode::Ldarg3 => self.load_argument(3),
            OpCode::LdargS | OpCode::Ldarg => self.load_argument(index_operand(instruction)?),
            OpCode::LdargaS | OpCode::Ldarga => self.argument_address(index_operand(instruction)?),
            OpCode::StargS | OpCode::Starg => self.store_argument(index_operand(instruction)?),
            OpCode::Ldloc0 => self.load_local(0),
            OpCode::Ldloc1 => self.load_local(1),
            OpCode::Ldloc2 => self.load_local(2),
            OpCode::Ldloc3 => self.load_local(3),
            OpCode::LdlocS | OpCode::Ldloc => self.load_local(index_operand(instruction)?),
            OpCode::LdlocaS | OpCode::Ldloca => self.local_address(index_operand(instruction)?),
            OpCode::Stloc0 => self.store_local(0),
            OpCode::Stloc1 => self.store_local(1),
            OpCode::Stloc2 => self.store_local(2),
            OpCode::Stloc3 => self.store_local(3),
            OpCode::StlocS | OpCode::Stloc => self.store_local(index_operand(instruction)?),

            // ================================================================
            // Constants
            // ================================================================
            OpCode::Ldnull => {
                self.stack.push(StackEntry::expression(StackValueKind::ObjRef, "0"));
                Ok(())
            }
            OpCode::LdcI4M1
            | OpCode::LdcI40
            | OpCode::LdcI41
            | OpCode::LdcI42
            | OpCode::LdcI43
            | OpCode::LdcI44
            | OpCode::LdcI45
            | OpCode::LdcI46
            | OpCode::LdcI47
            | OpCode::LdcI48 => {
                let value = i32::from(opcode.value() as u8) - i32::from(OpCode::LdcI40.value() as u8);
                self.stack.push(StackEntry::Int32Const(value));
                Ok(())
            }
            OpCode::LdcI4S | OpCode::LdcI4 => {
                let value = immediate_operand(instruction)?;
                let value = i32::try_from(value)
                    .map_err(|_| malformed_error!("IL_{:04x}: {} is not an int32", instruction.offset, value))?;
                self.stack.push(StackEntry::Int32Const(value));
                Ok(())
            }
            OpCode::LdcI8 => {
                self.stack.push(StackEntry::Int64Const(immediate_operand(instruction)?));
                Ok(())
            }
            OpCode::LdcR4 | OpCode::LdcR8 => {
                let (value, single) = match instruction.operand {
                    Operand::Immediate(Immediate::Float32(value)) => (f64::from(value), true),
                    Operand::Immediate(Immediate::Float64(value)) => (value, false),
                    _ => return Err(invalid_operand(instruction, "a floating point immediate")),
                };
                self.stack.push(StackEntry::FloatConst { value, single });
                Ok(())
            }

            // ================================================================
            // Control flow
            // ================================================================
            OpCode::Br => self.branch(target_operand(instruction)?),
            OpCode::Brfalse | OpCode::Brtrue => self.branch_on_value(opcode == OpCode::Brtrue, instruction),
            OpCode::Beq
            | OpCode::Bge
            | OpCode::Bgt
            | OpCode::Ble
            | OpCode::Blt
            | OpCode::BneUn
            | OpCode::BgeUn
            | OpCode::BgtUn
            | OpCode::BleUn
            | OpCode::BltUn => self.branch_on_comparison(opcode, instruction),
            OpCode::Switch => self.switch(instruction),
            OpCode::Ret => self.return_value(),
            OpCode::Throw => {
                let exception = self.stack.pop()?;
                self.emit(&format!("__throw_exception({exception});"));
                self.stack.clear();
                self.terminated = true;
                Ok(())
            }
            OpCode::Rethrow => {
                self.emit("__rethrow();");
                self.stack.clear();
                self.terminated = true;
                Ok(())
            }
            OpCode::Leave => self.leave(target_operand(instruction)?),
            OpCode::Endfinally => self.end_finally(),
            OpCode::Endfilter => {
                let verdict = self.stack.pop()?;
                self.emit(&format!("__end_filter({verdict});"));
                self.stack.clear();
                self.terminated = true;
                Ok(())
            }

            // ================================================================
            // Calls
            // ================================================================
            OpCode::Call | OpCode::Callvirt => self.call(opcode, token_operand(instruction)?, constrained),
            OpCode::Newobj => self.new_object(token_operand(instruction)?),
            OpCode::Calli => self.call_indirect(token_operand(instruction)?),
            OpCode::Ldftn => self.load_function(token_operand(instruction)?),
            OpCode::Ldvirtftn => self.load_virtual_function(token_operand(instruction)?),

            // ================================================================
            // Indirect access
            // ================================================================
            OpCode::LdindI1 => self.load_indirect_primitive(PrimitiveKind::I1),
            OpCode::LdindU1 => self.load_indirect_primitive(PrimitiveKind::U1),
            OpCode::LdindI2 => self.load_indirect_primitive(PrimitiveKind::I2),
            OpCode::LdindU2 => self.load_indirect_primitive(PrimitiveKind::U2),
            OpCode::LdindI4 => self.load_indirect_primitive(PrimitiveKind::I4),
            OpCode::LdindU4 => self.load_indirect_primitive(PrimitiveKind::U4),
            OpCode::LdindI8 => self.load_indirect_primitive(PrimitiveKind::I8),
            OpCode::LdindI => self.load_indirect_primitive(PrimitiveKind::I),
            OpCode::LdindR4 => self.load_indirect_primitive(PrimitiveKind::R4),
            OpCode::LdindR8 => self.load_indirect_primitive(PrimitiveKind::R8),
            OpCode::LdindRef => self.load_indirect(self.ctx.well_known(WellKnownType::Object)?),
            OpCode::StindRef => self.store_indirect(self.ctx.well_known(WellKnownType::Object)?),
            OpCode::StindI1 => self.store_indirect_primitive(PrimitiveKind::I1),
            OpCode::StindI2 => self.store_indirect_primitive(PrimitiveKind::I2),
            OpCode::StindI4 => self.store_indirect_primitive(PrimitiveKind::I4),
            OpCode::StindI8 => self.store_indirect_primitive(PrimitiveKind::I8),
            OpCode::StindR4 => self.store_indirect_primitive(PrimitiveKind::R4),
            OpCode::StindR8 => self.store_indirect_primitive(PrimitiveKind::R8),
            OpCode::StindI => self.store_indirect_primitive(PrimitiveKind::I),
            OpCode::Ldobj => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                self.load_indirect(ty)
            }
            OpCode::Stobj => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                self.store_indirect(ty)
            }
            OpCode::Cpobj => self.copy_object(token_operand(instruction)?),
            OpCode::Initobj => self.init_object(token_operand(instruction)?),
            OpCode::Cpblk => self.copy_block(),
            OpCode::Initblk => self.init_block(),
            OpCode::Localloc => self.local_alloc(),

            // ================================================================
            // Arithmetic, logic and comparison
            // ================================================================
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::DivUn
            | OpCode::Rem
            | OpCode::RemUn
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::AddOvf
            | OpCode::AddOvfUn
            | OpCode::MulOvf
            | OpCode::MulOvfUn
            | OpCode::SubOvf
            | OpCode::SubOvfUn => self.binary(opcode),
            OpCode::Shl | OpCode::Shr | OpCode::ShrUn => self.shift(opcode),
            OpCode::Neg | OpCode::Not => self.unary(opcode),
            OpCode::Ceq | OpCode::Cgt | OpCode::CgtUn | OpCode::Clt | OpCode::CltUn => self.compare(opcode),

            // ================================================================
            // Conversions
            // ================================================================
            OpCode::ConvI1 | OpCode::ConvOvfI1 => self.convert(PrimitiveKind::I1, false),
            OpCode::ConvI2 | OpCode::ConvOvfI2 => self.convert(PrimitiveKind::I2, false),
            OpCode::ConvI4 | OpCode::ConvOvfI4 => self.convert(PrimitiveKind::I4, false),
            OpCode::ConvI8 | OpCode::ConvOvfI8 => self.convert(PrimitiveKind::I8, false),
            OpCode::ConvI | OpCode::ConvOvfI => self.convert(PrimitiveKind::I, false),
            OpCode::ConvU1 | OpCode::ConvOvfU1 => self.convert(PrimitiveKind::U1, false),
            OpCode::ConvU2 | OpCode::ConvOvfU2 => self.convert(PrimitiveKind::U2, false),
            OpCode::ConvU4 | OpCode::ConvOvfU4 => self.convert(PrimitiveKind::U4, false),
            OpCode::ConvU8 | OpCode::ConvOvfU8 => self.convert(PrimitiveKind::U8, false),
            OpCode::ConvU | OpCode::ConvOvfU => self.convert(PrimitiveKind::U, false),
            OpCode::ConvR4 => self.convert(PrimitiveKind::R4, false),
            OpCode::ConvR8 => self.convert(PrimitiveKind::R8, false),
            OpCode::ConvRUn => self.convert(PrimitiveKind::R8, true),
            OpCode::ConvOvfI1Un => self.convert(PrimitiveKind::I1, true),
            OpCode::ConvOvfI2Un => self.convert(PrimitiveKind::I2, true),
            OpCode::ConvOvfI4Un => self.convert(PrimitiveKind::I4, true),
            OpCode::ConvOvfI8Un => self.convert(PrimitiveKind::I8, true),
            OpCode::ConvOvfIUn => self.convert(PrimitiveKind::I, true),
            OpCode::ConvOvfU1Un => self.convert(PrimitiveKind::U1, true),
            OpCode::ConvOvfU2Un => self.convert(PrimitiveKind::U2, true),
            OpCode::ConvOvfU4Un => self.convert(PrimitiveKind::U4, true),
            OpCode::ConvOvfU8Un => self.convert(PrimitiveKind::U8, true),
            OpCode::ConvOvfUUn => self.convert(PrimitiveKind::U, true),

            // ================================================================
            // Objects and fields
            // ================================================================
            OpCode::Ldstr => self.load_string(token_operand(instruction)?),
            OpCode::Ldfld => self.load_field(token_operand(instruction)?, false),
            OpCode::Ldsfld => self.load_field(token_operand(instruction)?, true),
            OpCode::Ldflda => self.field_address(token_operand(instruction)?, false),
            OpCode::Ldsflda => self.field_address(token_operand(instruction)?, true),
            OpCode::Stfld => self.store_field(token_operand(instruction)?, false),
            OpCode::Stsfld => self.store_field(token_operand(instruction)?, true),
            OpCode::Box => self.box_top(token_operand(instruction)?),
            OpCode::Unbox => self.unbox(token_operand(instruction)?),
            OpCode::UnboxAny => self.unbox_any(token_operand(instruction)?),
            OpCode::Castclass => self.cast(token_operand(instruction)?, "__castclass"),
            OpCode::Isinst => self.cast(token_operand(instruction)?, "__isinst"),
            OpCode::Ldtoken => self.load_token(token_operand(instruction)?),
            OpCode::Sizeof => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
                self.note_type(ty);
                self.stack.push(StackEntry::expression(
                    StackValueKind::Int32,
                    format!("(int32_t)sizeof({ctype})"),
                ));
                Ok(())
            }

            // ================================================================
            // Arrays
            // ================================================================
            OpCode::Newarr => self.new_array(token_operand(instruction)?),
            OpCode::Ldlen => {
                let array = self.stack.pop()?;
                self.push_temporary(StackValueKind::NativeInt, None, &format!("*((intptr_t*){array} + 1)"))
            }
            OpCode::Ldelema => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                self.element_address(ty)
            }
            OpCode::LdelemI1 => self.load_element_primitive(PrimitiveKind::I1),
            OpCode::LdelemU1 => self.load_element_primitive(PrimitiveKind::U1),
            OpCode::LdelemI2 => self.load_element_primitive(PrimitiveKind::I2),
            OpCode::LdelemU2 => self.load_element_primitive(PrimitiveKind::U2),
            OpCode::LdelemI4 => self.load_element_primitive(PrimitiveKind::I4),
            OpCode::LdelemU4 => self.load_element_primitive(PrimitiveKind::U4),
            OpCode::LdelemI8 => self.load_element_primitive(PrimitiveKind::I8),
            OpCode::LdelemI => self.load_element_primitive(PrimitiveKind::I),
            OpCode::LdelemR4 => self.load_element_primitive(PrimitiveKind::R4),
            OpCode::LdelemR8 => self.load_element_primitive(PrimitiveKind::R8),
            OpCode::LdelemRef => self.load_element(self.ctx.well_known(WellKnownType::Object)?),
            OpCode::Ldelem => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                self.load_element(ty)
            }
            OpCode::StelemI => self.store_element_primitive(PrimitiveKind::I),
            OpCode::StelemI1 => self.store_element_primitive(PrimitiveKind::I1),
            OpCode::StelemI2 => self.store_element_primitive(PrimitiveKind::I2),
            OpCode::StelemI4 => self.store_element_primitive(PrimitiveKind::I4),
            OpCode::StelemI8 => self.store_element_primitive(PrimitiveKind::I8),
            OpCode::StelemR4 => self.store_element_primitive(PrimitiveKind::R4),
            OpCode::StelemR8 => self.store_element_primitive(PrimitiveKind::R8),
            OpCode::StelemRef => self.store_element(self.ctx.well_known(WellKnownType::Object)?),
            OpCode::Stelem => {
                let ty = self.il.resolve_type(self.ctx, token_operand(instruction)?)?;
                self.store_element(ty)
            }

            other => Err(unsupported!("`{}` at IL_{:04x}", other.mnemonic(), instruction.offset)),
        }
    }
}

/// `[Int32, ObjRef]`
fn describe(shape: &[StackShape]) -> String {
    let kinds: Vec<String> = shape.iter().map(|slot| format!("{:?}", slot.kind)).collect();
    format!("[{}]", kinds.join(", "))
}

fn invalid_operand(instruction: &Instruction, expected: &str) -> Error {
    malformed_error!(
        "IL_{:04x}: `{}` expects {}",
        instruction.offset,
        instruction.opcode.mnemonic(),
        expected
    )
}

fn token_operand(instruction: &Instruction) -> Result<Token> {
    instruction
        .token()
        .ok_or_else(|| invalid_operand(instruction, "a token"))
}

fn immediate_operand(instruction: &Instruction) -> Result<i64> {
    instruction
        .immediate()
        .ok_or_else(|| invalid_operand(instruction, "an immediate"))
}

fn index_operand(instruction: &Instruction) -> Result<usize> {
    usize::try_from(immediate_operand(instruction)?).map_err(|_| invalid_operand(instruction, "an index"))
}

fn target_operand(instruction: &Instruction) -> Result<u32> {
    instruction
        .branch_targets()
        .first()
        .copied()
        .ok_or_else(|| invalid_operand(instruction, "a branch target"))
}
