//! Decoded instructions.

use std::fmt;

use crate::{il::opcodes::OpCode, metadata::token::Token};

/// An immediate operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// `ldc.i4.s`
    Int8(i8),
    /// Short argument or local index, `unaligned.`, `no.`
    UInt8(u8),
    /// Long argument or local index
    UInt16(u16),
    /// `ldc.i4`
    Int32(i32),
    /// `ldc.i8`
    Int64(i64),
    /// `ldc.r4`
    Float32(f32),
    /// `ldc.r8`
    Float64(f64),
}

impl Immediate {
    /// The value as a signed 64-bit integer; floats are truncated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(self) -> i64 {
        match self {
            Immediate::Int8(value) => i64::from(value),
            Immediate::UInt8(value) => i64::from(value),
            Immediate::UInt16(value) => i64::from(value),
            Immediate::Int32(value) => i64::from(value),
            Immediate::Int64(value) => value,
            Immediate::Float32(value) => value as i64,
            Immediate::Float64(value) => value as i64,
        }
    }
}

/// The operand of a decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Immediate value or index
    Immediate(Immediate),
    /// Metadata token
    Token(Token),
    /// Absolute target offset of a branch or `leave`
    Target(u32),
    /// Absolute target offsets of a `switch`, in case order
    Switch(Vec<u32>),
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the first opcode byte within the method body
    pub offset: u32,
    /// Encoded size, opcode and operand
    pub size: u32,
    /// The opcode
    pub opcode: OpCode,
    /// The operand, branch deltas already resolved to absolute offsets
    pub operand: Operand,
}

impl Instruction {
    /// Offset of the instruction that follows.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }

    /// Branch targets, in order: the single target of a branch or `leave`, or the switch table.
    #[must_use]
    pub fn branch_targets(&self) -> &[u32] {
        match &self.operand {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }

    /// The token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// The immediate operand as an integer, if any.
    #[must_use]
    pub fn immediate(&self) -> Option<i64> {
        match self.operand {
            Operand::Immediate(value) => Some(value.as_i64()),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode.mnemonic())?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(value) => match value {
                Immediate::Float32(v) => write!(f, " {v}"),
                Immediate::Float64(v) => write!(f, " {v}"),
                other => write!(f, " {}", other.as_i64()),
            },
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Target(target) => write!(f, " IL_{target:04x}"),
            Operand::Switch(targets) => {
                let targets: Vec<String> = targets.iter().map(|t| format!("IL_{t:04x}")).collect();
                write!(f, " ({})", targets.join(", "))
            }
        }
    }
}
