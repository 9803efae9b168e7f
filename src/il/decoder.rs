//! CIL instruction decoding.
//!
//! Branch operands are resolved to absolute offsets while decoding: the signed delta is added
//! to the offset of the following instruction (for `switch`, the offset right after the jump
//! table). Running past the end of the buffer fails the whole body.
//!
//! # Example
//!
//! ```rust
//! use cilaot::il::{decode_stream, OpCode};
//!
//! let code = [0x02, 0x03, 0x58, 0x2A]; // ldarg.0, ldarg.1, add, ret
//! let instructions = decode_stream(&code)?;
//! assert_eq!(instructions.len(), 4);
//! assert_eq!(instructions[2].opcode, OpCode::Add);
//! # Ok::<(), cilaot::Error>(())
//! ```

use crate::{
    il::{
        instruction::{Immediate, Instruction, Operand},
        opcodes::{OpCode, OperandType},
    },
    io::parser::Parser,
    metadata::token::Token,
    Result,
};

/// Decode every instruction of a method body, in offset order.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if an operand is truncated and
/// [`crate::Error::Malformed`] for unknown opcodes or branches before the start of the body.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser)?);
    }
    Ok(instructions)
}

/// Decode the instruction at the parser's position and advance past it.
///
/// # Errors
/// See [`decode_stream`].
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = parser.pos();
    let first = parser.read_le::<u8>()?;
    let value = if first == 0xFE {
        0xFE00 | u16::from(parser.read_le::<u8>()?)
    } else {
        u16::from(first)
    };
    let opcode = OpCode::from_value(value)
        .ok_or_else(|| malformed_error!("Invalid opcode {:#x} at IL_{:04x}", value, offset))?;

    let operand = match opcode.operand_type() {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::ShortBranch => {
            let delta = i64::from(parser.read_le::<i8>()?);
            Operand::Target(branch_target(parser.pos(), delta, offset)?)
        }
        OperandType::Branch => {
            let delta = i64::from(parser.read_le::<i32>()?);
            Operand::Target(branch_target(parser.pos(), delta, offset)?)
        }
        OperandType::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count.saturating_mul(4) > parser.remaining() {
                return Err(crate::Error::OutOfBounds);
            }
            let mut deltas = Vec::with_capacity(count);
            for _ in 0..count {
                deltas.push(i64::from(parser.read_le::<i32>()?));
            }
            let base = parser.pos();
            let targets = deltas
                .into_iter()
                .map(|delta| branch_target(base, delta, offset))
                .collect::<Result<Vec<_>>>()?;
            Operand::Switch(targets)
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    Ok(Instruction {
        offset: offset as u32,
        size: (parser.pos() - offset) as u32,
        opcode,
        operand,
    })
}

fn branch_target(base: usize, delta: i64, offset: usize) -> Result<u32> {
    let target = base as i64 + delta;
    u32::try_from(target)
        .map_err(|_| malformed_error!("Branch at IL_{:04x} targets {} before the method start", offset, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::encoder::encode_instructions;

    #[test]
    fn decode_short_and_long_branches() {
        // br.s +2; nop; nop; br -7
        let code = [0x2B, 0x02, 0x00, 0x00, 0x38, 0xF9, 0xFF, 0xFF, 0xFF];
        let instructions = decode_stream(&code).unwrap();

        assert_eq!(instructions[0].operand, Operand::Target(4));
        assert_eq!(instructions[3].opcode, OpCode::Br);
        assert_eq!(instructions[3].operand, Operand::Target(2));
    }

    #[test]
    fn decode_switch_relative_to_table_end() {
        // switch (2 cases: +0, +1); nop; ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A,
        ];
        let instructions = decode_stream(&code).unwrap();

        assert_eq!(instructions[0].size, 13);
        assert_eq!(instructions[0].branch_targets(), &[13, 14]);
    }

    #[test]
    fn decode_extended_opcode() {
        let code = [0xFE, 0x01, 0xFE, 0x0C, 0x05, 0x00];
        let instructions = decode_stream(&code).unwrap();

        assert_eq!(instructions[0].opcode, OpCode::Ceq);
        assert_eq!(instructions[1].opcode, OpCode::Ldloc);
        assert_eq!(instructions[1].immediate(), Some(5));
    }

    #[test]
    fn truncated_operand_fails() {
        assert!(matches!(
            decode_stream(&[0x20, 0x01, 0x02]),
            Err(crate::Error::OutOfBounds)
        ));
        assert!(decode_stream(&[0x45, 0xFF, 0xFF, 0xFF, 0x0F]).is_err());
    }

    #[test]
    fn invalid_opcode_fails() {
        assert!(matches!(
            decode_stream(&[0x24]),
            Err(crate::Error::Malformed { .. })
        ));
        assert!(decode_stream(&[0x2B, 0x80]).is_err());
    }

    #[test]
    fn reencoding_reproduces_bytes() {
        let code = [
            0x02, // ldarg.0
            0x2C, 0x05, // brfalse.s +5
            0x20, 0x10, 0x00, 0x00, 0x00, // ldc.i4 16
            0x2A, // ret
            0x28, 0x01, 0x00, 0x00, 0x06, // call 0x06000001
            0x3A, 0xF1, 0xFF, 0xFF, 0xFF, // brtrue -15
            0x45, 0x01, 0x00, 0x00, 0x00, 0xFA, 0xFF, 0xFF, 0xFF, // switch (-6)
            0xFE, 0x0E, 0x02, 0x00, // stloc 2
            0x2A, // ret
        ];
        let instructions = decode_stream(&code).unwrap();
        assert_eq!(encode_instructions(&instructions).unwrap(), code.to_vec());
    }
}
