//! Label-based IL emission for synthetic bodies.
//!
//! ```rust
//! use cilaot::il::{ILEmitter, OpCode};
//!
//! let mut emitter = ILEmitter::new();
//! let done = emitter.define_label();
//! emitter.ldarg(0);
//! emitter.branch(OpCode::Brfalse, done);
//! emitter.ldc_i4(1);
//! emitter.emit(OpCode::Ret);
//! emitter.mark_label(done);
//! emitter.ldc_i4(0);
//! emitter.emit(OpCode::Ret);
//! let body = emitter.finish()?;
//! assert_eq!(body.code.len(), 10);
//! # Ok::<(), cilaot::Error>(())
//! ```

use crate::{
    il::{
        body::{ILBody, StubToken, TokenScope, STUB_TOKEN_TABLE},
        encoder::write_opcode,
        opcodes::OpCode,
    },
    metadata::token::Token,
    typesystem::{FieldId, MethodId, MethodSignature, TypeId},
    Result,
};

/// A jump target inside an [`ILEmitter`] body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ILLabel(usize);

struct Fixup {
    position: usize,
    instruction_end: usize,
    label: ILLabel,
}

/// Builds a synthetic [`ILBody`] with its own token table.
///
/// Branches are always emitted in their long form and patched when the body is finished.
#[derive(Default)]
pub struct ILEmitter {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    tokens: Vec<StubToken>,
    locals: Vec<TypeId>,
    max_stack: u16,
}

impl ILEmitter {
    /// An empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit an opcode without operand.
    pub fn emit(&mut self, opcode: OpCode) {
        write_opcode(opcode, &mut self.code);
    }

    /// Emit an opcode with a one-byte operand.
    pub fn emit_u8(&mut self, opcode: OpCode, value: u8) {
        self.emit(opcode);
        self.code.push(value);
    }

    /// Emit an opcode with a two-byte operand.
    pub fn emit_u16(&mut self, opcode: OpCode, value: u16) {
        self.emit(opcode);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit an opcode with a four-byte operand.
    pub fn emit_i32(&mut self, opcode: OpCode, value: i32) {
        self.emit(opcode);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit `ldc.i8`.
    pub fn ldc_i8(&mut self, value: i64) {
        self.emit(OpCode::LdcI8);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit an opcode with a token operand.
    pub fn emit_token(&mut self, opcode: OpCode, token: Token) {
        self.emit(opcode);
        self.code.extend_from_slice(&token.value().to_le_bytes());
    }

    /// Load a 32-bit constant with the shortest encoding.
    pub fn ldc_i4(&mut self, value: i32) {
        match value {
            -1 => self.emit(OpCode::LdcI4M1),
            0..=8 => {
                let short = OpCode::LdcI40.value() + value as u16;
                if let Some(opcode) = OpCode::from_value(short) {
                    self.emit(opcode);
                }
            }
            -128..=127 => self.emit_u8(OpCode::LdcI4S, value as u8),
            _ => self.emit_i32(OpCode::LdcI4, value),
        }
    }

    /// Load an argument.
    pub fn ldarg(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Ldarg0),
            1 => self.emit(OpCode::Ldarg1),
            2 => self.emit(OpCode::Ldarg2),
            3 => self.emit(OpCode::Ldarg3),
            4..=255 => self.emit_u8(OpCode::LdargS, index as u8),
            _ => self.emit_u16(OpCode::Ldarg, index),
        }
    }

    /// Load an argument's address.
    pub fn ldarga(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.emit_u8(OpCode::LdargaS, short),
            Err(_) => self.emit_u16(OpCode::Ldarga, index),
        }
    }

    /// Load a local.
    pub fn ldloc(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Ldloc0),
            1 => self.emit(OpCode::Ldloc1),
            2 => self.emit(OpCode::Ldloc2),
            3 => self.emit(OpCode::Ldloc3),
            4..=255 => self.emit_u8(OpCode::LdlocS, index as u8),
            _ => self.emit_u16(OpCode::Ldloc, index),
        }
    }

    /// Load a local's address.
    pub fn ldloca(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.emit_u8(OpCode::LdlocaS, short),
            Err(_) => self.emit_u16(OpCode::Ldloca, index),
        }
    }

    /// Store into a local.
    pub fn stloc(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::Stloc0),
            1 => self.emit(OpCode::Stloc1),
            2 => self.emit(OpCode::Stloc2),
            3 => self.emit(OpCode::Stloc3),
            4..=255 => self.emit_u8(OpCode::StlocS, index as u8),
            _ => self.emit_u16(OpCode::Stloc, index),
        }
    }

    /// Declare a local and return its index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new_local(&mut self, ty: TypeId) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// A fresh, unplaced label.
    pub fn define_label(&mut self) -> ILLabel {
        self.labels.push(None);
        ILLabel(self.labels.len() - 1)
    }

    /// Place a label at the current offset.
    pub fn mark_label(&mut self, label: ILLabel) {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.code.len());
        }
    }

    /// Emit a branch to `label`; short forms are widened.
    pub fn branch(&mut self, opcode: OpCode, label: ILLabel) {
        let opcode = opcode.long_form();
        self.emit(opcode);
        let position = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup {
            position,
            instruction_end: self.code.len(),
            label,
        });
    }

    /// Emit `switch` over the given labels.
    #[allow(clippy::cast_possible_truncation)]
    pub fn switch(&mut self, labels: &[ILLabel]) {
        self.emit(OpCode::Switch);
        self.code.extend_from_slice(&(labels.len() as u32).to_le_bytes());
        let table = self.code.len();
        let end = table + 4 * labels.len();
        for (index, label) in labels.iter().enumerate() {
            self.fixups.push(Fixup {
                position: table + 4 * index,
                instruction_end: end,
                label: *label,
            });
        }
        self.code.resize(end, 0);
    }

    fn token(&mut self, entry: StubToken) -> Token {
        let index = match self.tokens.iter().position(|existing| *existing == entry) {
            Some(index) => index,
            None => {
                self.tokens.push(entry);
                self.tokens.len() - 1
            }
        };
        Token::new((STUB_TOKEN_TABLE << 24) | (index as u32 + 1))
    }

    /// Token for a type.
    pub fn type_token(&mut self, ty: TypeId) -> Token {
        self.token(StubToken::Type(ty))
    }

    /// Token for a method.
    pub fn method_token(&mut self, method: MethodId) -> Token {
        self.token(StubToken::Method(method))
    }

    /// Token for a field.
    pub fn field_token(&mut self, field: FieldId) -> Token {
        self.token(StubToken::Field(field))
    }

    /// Token for a string literal.
    pub fn string_token(&mut self, value: &str) -> Token {
        self.token(StubToken::String(value.to_string()))
    }

    /// Token for a `calli` signature.
    pub fn signature_token(&mut self, signature: MethodSignature) -> Token {
        self.token(StubToken::Signature(signature))
    }

    /// Record the stack depth the body needs.
    pub fn require_stack(&mut self, depth: u16) {
        self.max_stack = self.max_stack.max(depth);
    }

    /// Patch all branches and produce the body.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a branch targets a label that was never placed.
    pub fn finish(mut self) -> Result<ILBody> {
        for fixup in &self.fixups {
            let target = self
                .labels
                .get(fixup.label.0)
                .copied()
                .flatten()
                .ok_or_else(|| malformed_error!("Label {} was never placed", fixup.label.0))?;
            let delta = i32::try_from(target as i64 - fixup.instruction_end as i64)
                .map_err(|_| malformed_error!("Branch delta out of range"))?;
            self.code[fixup.position..fixup.position + 4].copy_from_slice(&delta.to_le_bytes());
        }

        Ok(ILBody {
            code: self.code,
            max_stack: self.max_stack.max(8),
            init_locals: true,
            locals: self.locals,
            exception_regions: Vec::new(),
            scope: TokenScope::Stub(self.tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{decode_stream, Operand};

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut emitter = ILEmitter::new();
        let top = emitter.define_label();
        let bottom = emitter.define_label();
        emitter.mark_label(top);
        emitter.ldarg(0);
        emitter.branch(OpCode::BrtrueS, bottom);
        emitter.branch(OpCode::Br, top);
        emitter.mark_label(bottom);
        emitter.emit(OpCode::Ret);
        let body = emitter.finish().unwrap();

        let instructions = decode_stream(&body.code).unwrap();
        assert_eq!(instructions[1].opcode, OpCode::Brtrue);
        assert_eq!(instructions[1].operand, Operand::Target(11));
        assert_eq!(instructions[2].operand, Operand::Target(0));
    }

    #[test]
    fn switch_targets_are_patched() {
        let mut emitter = ILEmitter::new();
        let first = emitter.define_label();
        let second = emitter.define_label();
        emitter.ldarg(0);
        emitter.switch(&[first, second]);
        emitter.mark_label(first);
        emitter.emit(OpCode::Ret);
        emitter.mark_label(second);
        emitter.emit(OpCode::Ret);
        let body = emitter.finish().unwrap();

        let instructions = decode_stream(&body.code).unwrap();
        assert_eq!(instructions[1].branch_targets(), &[14, 15]);
    }

    #[test]
    fn unplaced_label_fails() {
        let mut emitter = ILEmitter::new();
        let nowhere = emitter.define_label();
        emitter.branch(OpCode::Br, nowhere);
        assert!(emitter.finish().is_err());
    }

    #[test]
    fn tokens_are_deduplicated() {
        let mut emitter = ILEmitter::new();
        let a = emitter.string_token("boom");
        let b = emitter.string_token("boom");
        let c = emitter.string_token("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(u32::from(a.table()), STUB_TOKEN_TABLE);
    }
}
