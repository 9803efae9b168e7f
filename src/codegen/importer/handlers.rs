//! Instruction handlers of the method importer.
//!
//! Handlers are grouped the way the dispatch in `mod.rs` is:
//!
//! - **Temporaries and operands**: `temporary`, `push_typed`, `operand`
//! - **Variables**: `load_argument`, `store_local`, `local_address`, ...
//! - **Control flow**: `branch`, `branch_on_comparison`, `switch`, `leave`, `end_finally`
//! - **Calls**: `call`, `new_object`, `call_indirect`, `load_function`
//! - **Arithmetic**: `binary`, `shift`, `unary`, `compare`, `convert`
//! - **Objects, fields and arrays**: `load_field`, `box_top`, `cast`, `new_array`, ...

use crate::{
    codegen::{
        ctypes,
        importer::{argument_name, local_name, MethodImporter},
        stack::{StackEntry, StackShape, StackValueKind},
    },
    il::{Instruction, OpCode},
    metadata::{method::ExceptionRegionKind, token::Token, MethodAttributes, TypeAttributes},
    typesystem::{FieldId, MethodId, PrimitiveKind, TypeCategory, TypeId, TypeKey, WellKnownType},
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl Relation {
    fn symbol(self) -> &'static str {
        match self {
            Relation::Eq => "==",
            Relation::Ne => "!=",
            Relation::Ge => ">=",
            Relation::Gt => ">",
            Relation::Le => "<=",
            Relation::Lt => "<",
        }
    }

    fn inverse(self) -> Relation {
        match self {
            Relation::Eq => Relation::Ne,
            Relation::Ne => Relation::Eq,
            Relation::Ge => Relation::Lt,
            Relation::Gt => Relation::Le,
            Relation::Le => Relation::Gt,
            Relation::Lt => Relation::Ge,
        }
    }

    /// Relation and unsignedness of a comparison or compare-and-branch opcode.
    fn of(opcode: OpCode) -> Option<(Relation, bool)> {
        Some(match opcode {
            OpCode::Beq | OpCode::Ceq => (Relation::Eq, false),
            OpCode::BneUn => (Relation::Ne, true),
            OpCode::Bge => (Relation::Ge, false),
            OpCode::BgeUn => (Relation::Ge, true),
            OpCode::Bgt | OpCode::Cgt => (Relation::Gt, false),
            OpCode::BgtUn | OpCode::CgtUn => (Relation::Gt, true),
            OpCode::Ble => (Relation::Le, false),
            OpCode::BleUn => (Relation::Le, true),
            OpCode::Blt | OpCode::Clt => (Relation::Lt, false),
            OpCode::BltUn | OpCode::CltUn => (Relation::Lt, true),
            _ => return None,
        })
    }
}

/// Operator and unsignedness of a binary arithmetic opcode. Overflow checks are not emitted.
fn arithmetic_operator(opcode: OpCode) -> Option<(&'static str, bool)> {
    Some(match opcode {
        OpCode::Add | OpCode::AddOvf => ("+", false),
        OpCode::AddOvfUn => ("+", true),
        OpCode::Sub | OpCode::SubOvf => ("-", false),
        OpCode::SubOvfUn => ("-", true),
        OpCode::Mul | OpCode::MulOvf => ("*", false),
        OpCode::MulOvfUn => ("*", true),
        OpCode::Div => ("/", false),
        OpCode::DivUn => ("/", true),
        OpCode::Rem => ("%", false),
        OpCode::RemUn => ("%", true),
        OpCode::And => ("&", false),
        OpCode::Or => ("|", false),
        OpCode::Xor => ("^", false),
        _ => return None,
    })
}

/// C++ type an operand of `kind` is computed in.
fn numeric_type(kind: StackValueKind, unsigned: bool) -> &'static str {
    match (kind, unsigned) {
        (StackValueKind::Int32, false) => "int32_t",
        (StackValueKind::Int32, true) => "uint32_t",
        (StackValueKind::Int64, false) => "int64_t",
        (StackValueKind::Int64, true) => "uint64_t",
        (StackValueKind::Float, _) => "double",
        (_, false) => "intptr_t",
        (_, true) => "uintptr_t",
    }
}

fn is_unsigned_integer(kind: PrimitiveKind) -> bool {
    matches!(
        kind,
        PrimitiveKind::U1 | PrimitiveKind::U2 | PrimitiveKind::U4 | PrimitiveKind::U8 | PrimitiveKind::U
    )
}

/// `u"..."` with everything outside printable ASCII as `\x` escapes.
pub(super) fn string_literal(value: &str) -> String {
    let mut literal = String::from("u\"");
    let mut after_escape = false;
    for unit in value.encode_utf16() {
        match char::from_u32(u32::from(unit)) {
            Some(c @ ('"' | '\\')) => {
                literal.push('\\');
                literal.push(c);
                after_escape = false;
            }
            Some(c) if (' '..='~').contains(&c) => {
                // a hex digit would extend the preceding escape
                if after_escape && c.is_ascii_hexdigit() {
                    literal.push_str("\" u\"");
                }
                literal.push(c);
                after_escape = false;
            }
            _ => {
                literal.push_str(&format!("\\x{unit:04x}"));
                after_escape = true;
            }
        }
    }
    literal.push('"');
    literal
}

impl MethodImporter<'_> {
    // ================================================================
    // Temporaries and operands
    // ================================================================

    pub(super) fn next_temp(&mut self) -> String {
        self.temp_count += 1;
        format!("_{}", self.temp_count)
    }

    /// Declare a temporary initialized with `value` and return its stack entry.
    pub(super) fn temporary(
        &mut self,
        kind: StackValueKind,
        ty: Option<TypeId>,
        value: &str,
    ) -> Result<StackEntry> {
        let ctype = match (kind, ty) {
            (StackValueKind::ValueType, Some(ty)) => ctypes::cpp_type_name(self.ctx, ty)?,
            (StackValueKind::ValueType, None) => {
                return Err(malformed_error!(
                    "IL_{:04x}: value type temporary without a type",
                    self.current_offset
                ))
            }
            (kind, _) => kind.cpp_type().to_string(),
        };
        let name = self.next_temp();
        self.emit(&format!("{ctype} {name} = {value};"));
        Ok(StackEntry::Expression { kind, text: name, ty })
    }

    pub(super) fn push_temporary(&mut self, kind: StackValueKind, ty: Option<TypeId>, value: &str) -> Result<()> {
        let entry = self.temporary(kind, ty, value)?;
        self.stack.push(entry);
        Ok(())
    }

    /// Compute a value of managed type `ty` into a temporary.
    pub(super) fn push_typed(&mut self, ty: TypeId, value: &str) -> Result<()> {
        let kind = StackValueKind::of(self.ctx, ty)?;
        self.note_type(ty);
        self.push_temporary(kind, Some(ty), value)
    }

    /// Record that the struct of `ty` must be visible.
    pub(super) fn note_type(&mut self, ty: TypeId) {
        if self.ctx.type_desc(ty).category == TypeCategory::ValueType {
            self.references.types.insert(ty);
        }
    }

    pub(super) fn method_table(&mut self, ty: TypeId) -> String {
        self.references.method_tables.insert(ty);
        format!("(void*)&{}__MethodTable", self.ctx.mangled_type_name(ty))
    }

    /// The C++ type an entry evaluates to.
    fn natural_type(&self, entry: &StackEntry) -> Result<String> {
        Ok(match entry {
            StackEntry::Load { ty: Some(ty), .. } => ctypes::cpp_type_name(self.ctx, *ty)?,
            StackEntry::FloatConst { single: true, .. } => "float".to_string(),
            StackEntry::AddressOf { .. } => "void*".to_string(),
            other => StackShape::of(other).cpp_type(self.ctx),
        })
    }

    /// `entry` as an operand computed in `kind`, cast when its own type differs.
    pub(super) fn operand(&self, entry: &StackEntry, kind: StackValueKind, unsigned: bool) -> Result<String> {
        let target = numeric_type(kind, unsigned);
        if self.natural_type(entry)? == target {
            Ok(entry.to_string())
        } else {
            Ok(format!("(({target}){entry})"))
        }
    }

    /// Copy a spill-slot entry into a temporary so later slot writes cannot change it.
    fn stabilize(&mut self, entry: StackEntry) -> Result<StackEntry> {
        match entry {
            StackEntry::Spilled { kind, ref name, ty } => {
                let name = name.clone();
                self.temporary(kind, ty, &name)
            }
            other => Ok(other),
        }
    }

    // ================================================================
    // Arguments and locals
    // ================================================================

    fn argument_type(&self, index: usize) -> Result<TypeId> {
        self.params.get(index).copied().ok_or_else(|| {
            malformed_error!(
                "IL_{:04x}: argument {} out of range, the method takes {}",
                self.current_offset,
                index,
                self.params.len()
            )
        })
    }

    fn local_type(&self, index: usize) -> Result<TypeId> {
        self.locals.get(index).copied().ok_or_else(|| {
            malformed_error!(
                "IL_{:04x}: local {} out of range, the method declares {}",
                self.current_offset,
                index,
                self.locals.len()
            )
        })
    }

    fn load_variable(&mut self, variable: String, ty: TypeId) -> Result<()> {
        let kind = StackValueKind::of(self.ctx, ty)?;
        self.note_type(ty);
        if self.address_taken.contains(&variable) {
            return self.push_temporary(kind, Some(ty), &variable);
        }
        self.stack.push(StackEntry::Load {
            kind,
            variable,
            ty: Some(ty),
        });
        Ok(())
    }

    fn store_variable(&mut self, variable: String, ty: TypeId) -> Result<()> {
        let value = self.stack.pop()?;
        self.materialize(&variable)?;
        let (kind, ctype) = ctypes::destination(self.ctx, ty)?;
        self.emit(&format!("{variable} = {};", value.coerced(kind, &ctype)));
        Ok(())
    }

    /// Replace pending reads of `variable` with temporaries holding its current value.
    fn materialize(&mut self, variable: &str) -> Result<()> {
        let pending: Vec<(usize, StackEntry)> = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.reads(variable))
            .map(|(position, entry)| (position, entry.clone()))
            .collect();
        for (position, entry) in pending {
            let copy = self.temporary(entry.kind(), entry.ty(), variable)?;
            if let Some(slot) = self.stack.iter_mut().nth(position) {
                *slot = copy;
            }
        }
        Ok(())
    }

    pub(super) fn load_argument(&mut self, index: usize) -> Result<()> {
        let ty = self.argument_type(index)?;
        self.load_variable(argument_name(index), ty)
    }

    pub(super) fn store_argument(&mut self, index: usize) -> Result<()> {
        let ty = self.argument_type(index)?;
        self.store_variable(argument_name(index), ty)
    }

    pub(super) fn argument_address(&mut self, index: usize) -> Result<()> {
        let ty = self.argument_type(index)?;
        self.note_type(ty);
        self.stack.push(StackEntry::AddressOf {
            lvalue: argument_name(index),
            ty: Some(ty),
        });
        Ok(())
    }

    pub(super) fn load_local(&mut self, index: usize) -> Result<()> {
        let ty = self.local_type(index)?;
        self.load_variable(local_name(index), ty)
    }

    pub(super) fn store_local(&mut self, index: usize) -> Result<()> {
        let ty = self.local_type(index)?;
        self.store_variable(local_name(index), ty)
    }

    pub(super) fn local_address(&mut self, index: usize) -> Result<()> {
        let ty = self.local_type(index)?;
        self.note_type(ty);
        self.stack.push(StackEntry::AddressOf {
            lvalue: local_name(index),
            ty: Some(ty),
        });
        Ok(())
    }

    // ================================================================
    // Control flow
    // ================================================================

    pub(super) fn branch(&mut self, target: u32) -> Result<()> {
        let block = self.block_index(target)?;
        self.transfer(block)?;
        self.emit(&format!("goto _bb{target};"));
        self.terminated = true;
        Ok(())
    }

    /// Both successors receive the stack before the test, the fallthrough is the next block.
    fn branch_if(&mut self, condition: &str, instruction: &Instruction) -> Result<()> {
        let target = instruction
            .branch_targets()
            .first()
            .copied()
            .ok_or_else(|| malformed_error!("IL_{:04x}: branch without a target", instruction.offset))?;
        let taken = self.block_index(target)?;
        let fallthrough = self.block_index(instruction.next_offset())?;
        self.transfer(taken)?;
        self.transfer(fallthrough)?;
        self.emit(&format!("if ({condition}) goto _bb{target};"));
        self.terminated = true;
        Ok(())
    }

    pub(super) fn branch_on_value(&mut self, when_true: bool, instruction: &Instruction) -> Result<()> {
        let value = self.stack.pop()?;
        if value.kind() == StackValueKind::ValueType {
            return Err(malformed_error!("IL_{:04x}: branch on a value type", instruction.offset));
        }
        let value = self.stabilize(value)?;
        let condition = if when_true {
            value.to_string()
        } else {
            format!("!({value})")
        };
        self.branch_if(&condition, instruction)
    }

    pub(super) fn branch_on_comparison(&mut self, opcode: OpCode, instruction: &Instruction) -> Result<()> {
        let right = self.stack.pop()?;
        let left = self.stack.pop()?;
        let right = self.stabilize(right)?;
        let left = self.stabilize(left)?;
        let condition = self.condition(opcode, &left, &right)?;
        self.branch_if(&condition, instruction)
    }

    fn condition(&self, opcode: OpCode, left: &StackEntry, right: &StackEntry) -> Result<String> {
        let (relation, unsigned) = Relation::of(opcode)
            .ok_or_else(|| malformed_error!("`{}` is not a comparison", opcode.mnemonic()))?;
        let kind = left.kind().widen(right.kind());
        match kind {
            StackValueKind::ValueType => Err(malformed_error!(
                "IL_{:04x}: `{}` on value types",
                self.current_offset,
                opcode.mnemonic()
            )),
            StackValueKind::Float => {
                let a = self.operand(left, kind, false)?;
                let b = self.operand(right, kind, false)?;
                // unordered: true when either side is NaN
                if unsigned && !matches!(relation, Relation::Eq | Relation::Ne) {
                    Ok(format!("!({a} {} {b})", relation.inverse().symbol()))
                } else {
                    Ok(format!("{a} {} {b}", relation.symbol()))
                }
            }
            _ => Ok(format!(
                "{} {} {}",
                self.operand(left, kind, unsigned)?,
                relation.symbol(),
                self.operand(right, kind, unsigned)?
            )),
        }
    }

    pub(super) fn switch(&mut self, instruction: &Instruction) -> Result<()> {
        let targets = instruction.branch_targets().to_vec();
        let value = self.stack.pop()?;
        let value = self.stabilize(value)?;
        let selector = self.operand(&value, StackValueKind::Int32, true)?;

        for target in &targets {
            let block = self.block_index(*target)?;
            self.transfer(block)?;
        }
        let fallthrough = self.block_index(instruction.next_offset())?;
        self.transfer(fallthrough)?;

        self.emit(&format!("switch ({selector}) {{"));
        self.code.indent();
        for (case, target) in targets.iter().enumerate() {
            self.emit(&format!("case {case}: goto _bb{target};"));
        }
        self.emit("default: break;");
        self.code.exdent();
        self.emit("}");
        self.terminated = true;
        Ok(())
    }

    pub(super) fn return_value(&mut self) -> Result<()> {
        let return_type = self.ctx.method(self.method).signature.return_type;
        if ctypes::is_void(self.ctx, return_type) {
            self.emit("return;");
        } else {
            let value = self.stack.pop()?;
            let (kind, ctype) = ctypes::destination(self.ctx, return_type)?;
            self.emit(&format!("return {};", value.coerced(kind, &ctype)));
        }
        self.stack.clear();
        self.terminated = true;
        Ok(())
    }

    /// Run every `finally` between here and `target`, innermost first, then jump.
    pub(super) fn leave(&mut self, target: u32) -> Result<()> {
        self.stack.clear();
        // labels below must not see the block's temporaries
        self.code.exdent();
        self.emit("}");
        self.emit("{");
        self.code.indent();

        let current = self.current_offset;
        for index in 0..self.regions.len() {
            let region = self.regions[index];
            if region.kind != ExceptionRegionKind::Finally
                || !region.try_contains(current)
                || region.try_contains(target)
            {
                continue;
            }
            self.finally_returns[index] += 1;
            let continuation = self.finally_returns[index];
            let handler = self.block_index(region.handler_offset)?;
            self.transfer(handler)?;
            self.emit(&format!("__finallyReturn{index} = {continuation};"));
            self.emit(&format!("goto _bb{};", region.handler_offset));
            self.emit_label(&format!("__returnFromFinally{index}_{continuation}"));
        }

        let block = self.block_index(target)?;
        self.transfer(block)?;
        self.emit(&format!("goto _bb{target};"));
        self.terminated = true;
        Ok(())
    }

    pub(super) fn end_finally(&mut self) -> Result<()> {
        self.stack.clear();
        let current = self.current_offset;
        let innermost = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, region)| {
                matches!(region.kind, ExceptionRegionKind::Finally | ExceptionRegionKind::Fault)
                    && region.handler_contains(current)
            })
            .max_by_key(|(_, region)| region.handler_offset)
            .map(|(index, region)| (index, region.kind));

        match innermost {
            Some((index, ExceptionRegionKind::Finally)) => {
                self.end_finally_used[index] = true;
                self.emit(&format!("goto __endFinally{index};"));
            }
            Some(_) => self.emit("__rethrow();"),
            None => {
                return Err(malformed_error!(
                    "IL_{:04x}: endfinally outside a finally or fault handler",
                    current
                ))
            }
        }
        self.terminated = true;
        Ok(())
    }

    // ================================================================
    // Calls
    // ================================================================

    /// `true` if a `callvirt` to `method` must go through the method table.
    fn dispatches_virtually(&self, method: MethodId) -> bool {
        let desc = self.ctx.method(method);
        let owner = self.ctx.type_desc(desc.owner);
        desc.is_virtual()
            && !desc.flags.contains(MethodAttributes::FINAL)
            && !owner.flags.contains(TypeAttributes::SEALED)
            && !owner.is_value_type()
    }

    fn arguments(&mut self, args: &[StackEntry], params: &[TypeId]) -> Result<Vec<String>> {
        if args.len() != params.len() {
            return Err(malformed_error!(
                "IL_{:04x}: {} arguments for {} parameters",
                self.current_offset,
                args.len(),
                params.len()
            ));
        }
        let mut rendered = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(params) {
            let (kind, ctype) = ctypes::destination(self.ctx, *param)?;
            self.note_type(*param);
            rendered.push(arg.coerced(kind, &ctype));
        }
        Ok(rendered)
    }

    fn emit_call(&mut self, function: &str, args: &[String], return_type: TypeId) -> Result<()> {
        let call = format!("{function}({})", args.join(", "));
        if ctypes::is_void(self.ctx, return_type) {
            self.emit(&format!("{call};"));
            Ok(())
        } else {
            self.push_typed(return_type, &call)
        }
    }

    pub(super) fn call(&mut self, opcode: OpCode, token: Token, constrained: Option<TypeId>) -> Result<()> {
        let ctx = self.ctx;
        let target = self.il.resolve_method(ctx, token)?;
        let desc = ctx.method(target);
        let mut args = self.stack.pop_many(desc.signature.arity_with_this())?;

        let mut callee = target;
        let mut dispatch = opcode == OpCode::Callvirt && self.dispatches_virtually(target);
        if let Some(constrained) = constrained {
            let Some(this) = args.first_mut() else {
                return Err(malformed_error!(
                    "IL_{:04x}: constrained call to static {}",
                    self.current_offset,
                    ctx.method_name(target)
                ));
            };
            (callee, dispatch) = self.resolve_constrained(constrained, target, this)?;
        }

        let params = ctypes::call_params(ctx, callee)?;
        let rendered = self.arguments(&args, &params)?;
        let function = if dispatch {
            ctx.virtual_slot(target)?;
            self.references.virtual_slots.insert(target);
            let slot = ctx.mangled_method_name(target)?;
            let this = rendered.first().cloned().unwrap_or_default();
            format!("((__slot__{slot})__getslot__{slot}({this}))")
        } else {
            self.references.methods.insert(callee);
            ctx.mangled_method_name(callee)?.to_string()
        };
        self.emit_call(&function, &rendered, desc.signature.return_type)
    }

    /// Turn the managed pointer `this` of a `constrained.` call into what the callee expects.
    fn resolve_constrained(
        &mut self,
        constrained: TypeId,
        target: MethodId,
        this: &mut StackEntry,
    ) -> Result<(MethodId, bool)> {
        let ctx = self.ctx;
        if !ctx.type_desc(constrained).is_value_type() {
            *this = self.temporary(StackValueKind::ObjRef, Some(constrained), &format!("*(void**){this}"))?;
            return Ok((target, self.dispatches_virtually(target)));
        }
        if let Some(implementation) = self.constrained_implementation(constrained, target)? {
            return Ok((implementation, false));
        }
        let ctype = ctypes::cpp_type_name(ctx, constrained)?;
        *this = self.box_value(constrained, &format!("*({ctype}*){this}"))?;
        Ok((target, self.dispatches_virtually(target)))
    }

    /// The method `constrained` itself declares for a virtual or interface `target`.
    fn constrained_implementation(&self, constrained: TypeId, target: MethodId) -> Result<Option<MethodId>> {
        let ctx = self.ctx;
        let desc = ctx.method(target);
        if !desc.is_virtual() {
            return Ok(None);
        }
        let found = if ctx.type_desc(desc.owner).is_interface() {
            ctx.type_methods(constrained)?.into_iter().find(|candidate| {
                let candidate = ctx.method(*candidate);
                !candidate.is_static()
                    && candidate.name == desc.name
                    && candidate.signature.params == desc.signature.params
                    && candidate.signature.return_type == desc.signature.return_type
            })
        } else {
            ctx.resolve_virtual(constrained, target).ok()
        };
        Ok(found.filter(|method| ctx.method(*method).owner == constrained))
    }

    pub(super) fn new_object(&mut self, token: Token) -> Result<()> {
        let ctx = self.ctx;
        let ctor = self.il.resolve_method(ctx, token)?;
        let desc = ctx.method(ctor);
        let owner = desc.owner;
        let owner_desc = ctx.type_desc(owner);
        let mut args = self.stack.pop_many(desc.signature.params.len())?;

        if owner_desc.is_array() {
            let mut bounds = Vec::with_capacity(args.len());
            for arg in &args {
                bounds.push(self.operand(arg, StackValueKind::Int32, false)?);
            }
            self.temp_count += 1;
            let dimensions = format!("_d{}", self.temp_count);
            self.emit(&format!("int32_t {dimensions}[] = {{ {} }};", bounds.join(", ")));
            let table = self.method_table(owner);
            return self.push_temporary(
                StackValueKind::ObjRef,
                Some(owner),
                &format!("__allocate_mdarray({table}, {}, {dimensions})", bounds.len()),
            );
        }
        if owner_desc.category == TypeCategory::String {
            return Err(unsupported!("string constructor {}", ctx.method_name(ctor)));
        }

        let params = ctypes::call_params(ctx, ctor)?;
        let function = ctx.mangled_method_name(ctor)?.to_string();
        self.references.methods.insert(ctor);

        if owner_desc.is_value_type() {
            let ctype = ctypes::cpp_type_name(ctx, owner)?;
            self.note_type(owner);
            let name = self.next_temp();
            self.emit(&format!("{ctype} {name}; memset(&{name}, 0, sizeof({ctype}));"));
            args.insert(
                0,
                StackEntry::AddressOf {
                    lvalue: name.clone(),
                    ty: Some(owner),
                },
            );
            let rendered = self.arguments(&args, &params)?;
            self.emit(&format!("{function}({});", rendered.join(", ")));
            self.stack.push(StackEntry::Expression {
                kind: StackValueKind::of(ctx, owner)?,
                text: name,
                ty: Some(owner),
            });
        } else {
            let table = self.method_table(owner);
            let object = self.temporary(
                StackValueKind::ObjRef,
                Some(owner),
                &format!("__allocate_object({table})"),
            )?;
            args.insert(0, object.clone());
            let rendered = self.arguments(&args, &params)?;
            self.emit(&format!("{function}({});", rendered.join(", ")));
            self.stack.push(object);
        }
        Ok(())
    }

    pub(super) fn call_indirect(&mut self, token: Token) -> Result<()> {
        let ctx = self.ctx;
        let signature = self.il.resolve_signature(ctx, token)?;
        let pointer = self.stack.pop()?;
        let args = self.stack.pop_many(signature.arity_with_this())?;

        let mut rendered = Vec::with_capacity(args.len());
        let mut rest = args.iter();
        if !signature.is_static {
            if let Some(this) = rest.next() {
                rendered.push(this.coerced(StackValueKind::ObjRef, "void*"));
            }
        }
        for (arg, param) in rest.zip(&signature.params) {
            let (kind, ctype) = ctypes::destination(ctx, *param)?;
            self.note_type(*param);
            rendered.push(arg.coerced(kind, &ctype));
        }

        let declarator = ctypes::function_pointer_declarator(ctx, &signature, "")?;
        self.emit_call(&format!("(({declarator}){pointer})"), &rendered, signature.return_type)
    }

    pub(super) fn load_function(&mut self, token: Token) -> Result<()> {
        let method = self.il.resolve_method(self.ctx, token)?;
        self.push_function(method)
    }

    fn push_function(&mut self, method: MethodId) -> Result<()> {
        let name = self.ctx.mangled_method_name(method)?;
        self.references.methods.insert(method);
        self.stack.push(StackEntry::FunctionPointer {
            method,
            is_virtual: false,
            text: format!("(intptr_t)&{name}"),
        });
        Ok(())
    }

    pub(super) fn load_virtual_function(&mut self, token: Token) -> Result<()> {
        let ctx = self.ctx;
        let method = self.il.resolve_method(ctx, token)?;
        let object = self.stack.pop()?;
        if !self.dispatches_virtually(method) {
            return self.push_function(method);
        }
        ctx.virtual_slot(method)?;
        self.references.virtual_slots.insert(method);
        let slot = ctx.mangled_method_name(method)?;
        let name = self.next_temp();
        self.emit(&format!("intptr_t {name} = (intptr_t)__getslot__{slot}({object});"));
        self.stack.push(StackEntry::FunctionPointer {
            method,
            is_virtual: true,
            text: name,
        });
        Ok(())
    }

    // ================================================================
    // Indirect access
    // ================================================================

    pub(super) fn load_indirect(&mut self, ty: TypeId) -> Result<()> {
        let address = self.stack.pop()?;
        let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
        self.push_typed(ty, &format!("*({ctype}*){address}"))
    }

    pub(super) fn load_indirect_primitive(&mut self, kind: PrimitiveKind) -> Result<()> {
        self.load_indirect(self.ctx.primitive(kind)?)
    }

    pub(super) fn store_indirect(&mut self, ty: TypeId) -> Result<()> {
        let value = self.stack.pop()?;
        let address = self.stack.pop()?;
        let (kind, ctype) = ctypes::destination(self.ctx, ty)?;
        self.note_type(ty);
        self.emit(&format!("*({ctype}*){address} = {};", value.coerced(kind, &ctype)));
        Ok(())
    }

    pub(super) fn store_indirect_primitive(&mut self, kind: PrimitiveKind) -> Result<()> {
        self.store_indirect(self.ctx.primitive(kind)?)
    }

    pub(super) fn copy_object(&mut self, token: Token) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        let source = self.stack.pop()?;
        let destination = self.stack.pop()?;
        let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
        self.note_type(ty);
        self.emit(&format!("*({ctype}*){destination} = *({ctype}*){source};"));
        Ok(())
    }

    pub(super) fn init_object(&mut self, token: Token) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        let address = self.stack.pop()?;
        let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
        self.note_type(ty);
        self.emit(&format!("memset((void*){address}, 0, sizeof({ctype}));"));
        Ok(())
    }

    pub(super) fn copy_block(&mut self) -> Result<()> {
        let size = self.stack.pop()?;
        let source = self.stack.pop()?;
        let destination = self.stack.pop()?;
        self.emit(&format!("memmove((void*){destination}, (void*){source}, (size_t){size});"));
        Ok(())
    }

    pub(super) fn init_block(&mut self) -> Result<()> {
        let size = self.stack.pop()?;
        let value = self.stack.pop()?;
        let address = self.stack.pop()?;
        self.emit(&format!("memset((void*){address}, {value}, (size_t){size});"));
        Ok(())
    }

    pub(super) fn local_alloc(&mut self) -> Result<()> {
        let size = self.stack.pop()?;
        let name = self.next_temp();
        self.emit(&format!("intptr_t {name} = (intptr_t)alloca((size_t){size});"));
        if self.il.init_locals() {
            self.emit(&format!("memset((void*){name}, 0, (size_t){size});"));
        }
        self.stack
            .push(StackEntry::expression(StackValueKind::NativeInt, name));
        Ok(())
    }

    // ================================================================
    // Arithmetic, logic and comparison
    // ================================================================

    pub(super) fn binary(&mut self, opcode: OpCode) -> Result<()> {
        let (operator, unsigned) = arithmetic_operator(opcode)
            .ok_or_else(|| malformed_error!("`{}` is not an arithmetic operator", opcode.mnemonic()))?;
        let right = self.stack.pop()?;
        let left = self.stack.pop()?;

        if left.kind() == StackValueKind::ByRef || right.kind() == StackValueKind::ByRef {
            return self.pointer_arithmetic(operator, &left, &right);
        }

        let kind = left.kind().widen(right.kind());
        match kind {
            StackValueKind::ObjRef | StackValueKind::ValueType => Err(malformed_error!(
                "IL_{:04x}: `{}` on {:?} operands",
                self.current_offset,
                opcode.mnemonic(),
                kind
            )),
            StackValueKind::Float => {
                let a = self.operand(&left, kind, false)?;
                let b = self.operand(&right, kind, false)?;
                let value = if operator == "%" {
                    format!("fmod({a}, {b})")
                } else {
                    format!("{a} {operator} {b}")
                };
                self.push_temporary(kind, None, &value)
            }
            _ => {
                let a = self.operand(&left, kind, unsigned)?;
                let b = self.operand(&right, kind, unsigned)?;
                let value = if unsigned {
                    format!("({})({a} {operator} {b})", kind.cpp_type())
                } else {
                    format!("{a} {operator} {b}")
                };
                self.push_temporary(kind, None, &value)
            }
        }
    }

    fn pointer_arithmetic(&mut self, operator: &str, left: &StackEntry, right: &StackEntry) -> Result<()> {
        match (left.kind(), right.kind(), operator) {
            (StackValueKind::ByRef, StackValueKind::ByRef, "-") => self.push_temporary(
                StackValueKind::NativeInt,
                None,
                &format!("(intptr_t)((uint8_t*){left} - (uint8_t*){right})"),
            ),
            (StackValueKind::ByRef, _, "+" | "-") => {
                let offset = self.operand(right, StackValueKind::NativeInt, false)?;
                self.push_temporary(
                    StackValueKind::ByRef,
                    None,
                    &format!("(void*)((uint8_t*){left} {operator} {offset})"),
                )
            }
            (_, StackValueKind::ByRef, "+") => {
                let offset = self.operand(left, StackValueKind::NativeInt, false)?;
                self.push_temporary(
                    StackValueKind::ByRef,
                    None,
                    &format!("(void*)((uint8_t*){right} + {offset})"),
                )
            }
            _ => Err(unsupported!(
                "`{}` on a managed pointer at IL_{:04x}",
                operator,
                self.current_offset
            )),
        }
    }

    pub(super) fn shift(&mut self, opcode: OpCode) -> Result<()> {
        let amount = self.stack.pop()?;
        let value = self.stack.pop()?;
        let kind = value.kind();
        if !matches!(
            kind,
            StackValueKind::Int32 | StackValueKind::Int64 | StackValueKind::NativeInt
        ) {
            return Err(malformed_error!(
                "IL_{:04x}: `{}` on a {:?} value",
                self.current_offset,
                opcode.mnemonic(),
                kind
            ));
        }
        let amount = self.operand(&amount, StackValueKind::Int32, false)?;
        let shifted = match opcode {
            OpCode::Shl => format!("{} << {amount}", self.operand(&value, kind, false)?),
            OpCode::Shr => format!("{} >> {amount}", self.operand(&value, kind, false)?),
            _ => format!(
                "({})({} >> {amount})",
                kind.cpp_type(),
                self.operand(&value, kind, true)?
            ),
        };
        self.push_temporary(kind, None, &shifted)
    }

    pub(super) fn unary(&mut self, opcode: OpCode) -> Result<()> {
        let value = self.stack.pop()?;
        let kind = value.kind();
        let operator = match (opcode, kind) {
            (OpCode::Neg, StackValueKind::Int32 | StackValueKind::Int64 | StackValueKind::NativeInt | StackValueKind::Float) => "-",
            (OpCode::Not, StackValueKind::Int32 | StackValueKind::Int64 | StackValueKind::NativeInt) => "~",
            _ => {
                return Err(malformed_error!(
                    "IL_{:04x}: `{}` on a {:?} value",
                    self.current_offset,
                    opcode.mnemonic(),
                    kind
                ))
            }
        };
        let operand = self.operand(&value, kind, false)?;
        self.push_temporary(kind, None, &format!("{operator}{operand}"))
    }

    pub(super) fn compare(&mut self, opcode: OpCode) -> Result<()> {
        let right = self.stack.pop()?;
        let left = self.stack.pop()?;
        let condition = self.condition(opcode, &left, &right)?;
        self.push_temporary(StackValueKind::Int32, None, &condition)
    }

    /// `conv.*`; `unsigned_source` reinterprets an integer source as unsigned first.
    pub(super) fn convert(&mut self, target: PrimitiveKind, unsigned_source: bool) -> Result<()> {
        let value = self.stack.pop()?;
        let operand = match value.kind() {
            StackValueKind::ValueType => {
                return Err(malformed_error!(
                    "IL_{:04x}: conversion of a value type",
                    self.current_offset
                ))
            }
            StackValueKind::Float => self.operand(&value, StackValueKind::Float, false)?,
            kind => self.operand(&value, kind, unsigned_source || is_unsigned_integer(target))?,
        };
        let kind = StackValueKind::of(self.ctx, self.ctx.primitive(target)?)?;
        self.push_temporary(kind, None, &format!("({})({operand})", ctypes::primitive_name(target)))
    }

    // ================================================================
    // Objects and fields
    // ================================================================

    pub(super) fn load_string(&mut self, token: Token) -> Result<()> {
        let value = self.il.resolve_string(self.ctx, token)?;
        let string = self.ctx.well_known(WellKnownType::String)?;
        self.push_typed(string, &format!("__load_string_literal({})", string_literal(&value)))
    }

    fn instance_lvalue(&mut self, field: FieldId, object: &StackEntry) -> Result<String> {
        let ctx = self.ctx;
        let owner = ctx.field(field).owner;
        let member = ctypes::member_name(ctx, field)?;
        self.references.types.insert(owner);
        if object.kind() == StackValueKind::ValueType {
            Ok(format!("{object}.{member}"))
        } else {
            Ok(format!("(({}*){object})->{member}", ctypes::value_type_name(ctx, owner)))
        }
    }

    fn static_lvalue(&mut self, field: FieldId) -> Result<String> {
        let ctx = self.ctx;
        let owner = ctx.field(field).owner;
        let (pool, _) = ctx.static_field_location(field)?;
        let member = ctypes::member_name(ctx, field)?;
        self.references.statics.insert(owner);
        Ok(format!("{}_{}.{member}", ctx.mangled_type_name(owner), pool.suffix()))
    }

    /// The lvalue of a field access, popping the object for instance fields.
    fn field_lvalue(&mut self, field: FieldId, is_static: bool) -> Result<String> {
        let desc = self.ctx.field(field);
        match (desc.is_static(), is_static) {
            (true, true) => self.static_lvalue(field),
            (true, false) => {
                // instance form on a static field still consumes the object
                self.stack.pop()?;
                self.static_lvalue(field)
            }
            (false, false) => {
                let object = self.stack.pop()?;
                self.instance_lvalue(field, &object)
            }
            (false, true) => Err(malformed_error!(
                "IL_{:04x}: static access to instance field {}",
                self.current_offset,
                desc.name
            )),
        }
    }

    pub(super) fn load_field(&mut self, token: Token, is_static: bool) -> Result<()> {
        let field = self.il.resolve_field(self.ctx, token)?;
        let lvalue = self.field_lvalue(field, is_static)?;
        self.push_typed(self.ctx.field(field).field_type, &lvalue)
    }

    pub(super) fn field_address(&mut self, token: Token, is_static: bool) -> Result<()> {
        let field = self.il.resolve_field(self.ctx, token)?;
        let field_type = self.ctx.field(field).field_type;
        let lvalue = self.field_lvalue(field, is_static)?;
        if self.ctx.field(field).is_static() {
            self.stack.push(StackEntry::AddressOf {
                lvalue,
                ty: Some(field_type),
            });
            Ok(())
        } else {
            self.push_temporary(StackValueKind::ByRef, Some(field_type), &format!("(void*)&{lvalue}"))
        }
    }

    pub(super) fn store_field(&mut self, token: Token, is_static: bool) -> Result<()> {
        let field = self.il.resolve_field(self.ctx, token)?;
        let value = self.stack.pop()?;
        let lvalue = self.field_lvalue(field, is_static)?;
        let (kind, ctype) = ctypes::destination(self.ctx, self.ctx.field(field).field_type)?;
        self.emit(&format!("{lvalue} = {};", value.coerced(kind, &ctype)));
        Ok(())
    }

    /// Allocate a box of `ty` holding `value`.
    fn box_value(&mut self, ty: TypeId, value: &str) -> Result<StackEntry> {
        let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
        self.note_type(ty);
        let table = self.method_table(ty);
        let object = self.temporary(StackValueKind::ObjRef, None, &format!("__allocate_object({table})"))?;
        self.emit(&format!("*({ctype}*)((uint8_t*){object} + sizeof(void*)) = {value};"));
        Ok(object)
    }

    pub(super) fn box_top(&mut self, token: Token) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        let value = self.stack.pop()?;
        if !self.ctx.type_desc(ty).is_value_type() {
            self.stack.push(value);
            return Ok(());
        }
        let (kind, ctype) = ctypes::destination(self.ctx, ty)?;
        let boxed = self.box_value(ty, &value.coerced(kind, &ctype))?;
        self.stack.push(boxed);
        Ok(())
    }

    pub(super) fn unbox(&mut self, token: Token) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        let object = self.stack.pop()?;
        self.note_type(ty);
        self.push_temporary(
            StackValueKind::ByRef,
            Some(ty),
            &format!("(void*)((uint8_t*){object} + sizeof(void*))"),
        )
    }

    pub(super) fn unbox_any(&mut self, token: Token) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        if !self.ctx.type_desc(ty).is_value_type() {
            return self.cast_to(ty, "__castclass");
        }
        let object = self.stack.pop()?;
        let ctype = ctypes::cpp_type_name(self.ctx, ty)?;
        self.push_typed(ty, &format!("*({ctype}*)((uint8_t*){object} + sizeof(void*))"))
    }

    pub(super) fn cast(&mut self, token: Token, helper: &str) -> Result<()> {
        let ty = self.il.resolve_type(self.ctx, token)?;
        self.cast_to(ty, helper)
    }

    fn cast_to(&mut self, ty: TypeId, helper: &str) -> Result<()> {
        let object = self.stack.pop()?;
        let table = self.method_table(ty);
        self.push_temporary(StackValueKind::ObjRef, Some(ty), &format!("{helper}({object}, {table})"))
    }

    pub(super) fn load_token(&mut self, token: Token) -> Result<()> {
        match token.table() {
            0x06 | 0x0A | 0x2B => return Err(unsupported!("ldtoken of member {}", token)),
            0x04 => return Err(unsupported!("ldtoken of field {}", token)),
            _ => {}
        }
        let ty = self.il.resolve_type(self.ctx, token)?;
        let table = self.method_table(ty);
        self.stack.push(StackEntry::expression(
            StackValueKind::NativeInt,
            format!("(intptr_t){table}"),
        ));
        Ok(())
    }

    // ================================================================
    // Arrays
    // ================================================================

    pub(super) fn new_array(&mut self, token: Token) -> Result<()> {
        let element = self.il.resolve_type(self.ctx, token)?;
        let count = self.stack.pop()?;
        let array = self.ctx.intern(TypeKey::SzArray(element))?;
        let table = self.method_table(array);
        let count = self.operand(&count, StackValueKind::NativeInt, false)?;
        self.push_temporary(
            StackValueKind::ObjRef,
            Some(array),
            &format!("__allocate_array({count}, {table})"),
        )
    }

    /// Pop index and array, emit the range check and return the element's address.
    fn element_location(&mut self, element: TypeId) -> Result<String> {
        let index = self.stack.pop()?;
        let array = self.stack.pop()?;
        let size = self.ctx.element_size(element)?;
        self.emit(&format!("__range_check({array}, {index});"));
        Ok(format!("((uint8_t*){array} + ARRAY_BASE + {size} * {index})"))
    }

    pub(super) fn element_address(&mut self, element: TypeId) -> Result<()> {
        let location = self.element_location(element)?;
        self.note_type(element);
        self.push_temporary(StackValueKind::ByRef, Some(element), &format!("(void*){location}"))
    }

    pub(super) fn load_element(&mut self, element: TypeId) -> Result<()> {
        let location = self.element_location(element)?;
        let ctype = ctypes::cpp_type_name(self.ctx, element)?;
        self.push_typed(element, &format!("*({ctype}*){location}"))
    }

    pub(super) fn load_element_primitive(&mut self, kind: PrimitiveKind) -> Result<()> {
        self.load_element(self.ctx.primitive(kind)?)
    }

    pub(super) fn store_element(&mut self, element: TypeId) -> Result<()> {
        let value = self.stack.pop()?;
        let location = self.element_location(element)?;
        let (kind, ctype) = ctypes::destination(self.ctx, element)?;
        self.note_type(element);
        self.emit(&format!("*({ctype}*){location} = {};", value.coerced(kind, &ctype)));
        Ok(())
    }

    pub(super) fn store_element_primitive(&mut self, kind: PrimitiveKind) -> Result<()> {
        self.store_element(self.ctx.primitive(kind)?)
    }
}
