//! CIL instruction encoding, the inverse of [`crate::il::decode_instruction`].

use crate::{
    il::{
        instruction::{Immediate, Instruction, Operand},
        opcodes::{OpCode, OperandType},
    },
    Result,
};

/// Append the encoding of one instruction to `out`.
///
/// Branch targets are converted back into deltas relative to the end of the instruction as it
/// is encoded at `instruction.offset`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the operand does not match the opcode's operand shape
/// or a short branch target is out of range.
pub fn encode_instruction(instruction: &Instruction, out: &mut Vec<u8>) -> Result<()> {
    let opcode = instruction.opcode;
    write_opcode(opcode, out);

    match (opcode.operand_type(), &instruction.operand) {
        (OperandType::None, Operand::None) => {}
        (OperandType::Int8, Operand::Immediate(Immediate::Int8(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::UInt8, Operand::Immediate(Immediate::UInt8(v))) => out.push(*v),
        (OperandType::UInt16, Operand::Immediate(Immediate::UInt16(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::Int32, Operand::Immediate(Immediate::Int32(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::Int64, Operand::Immediate(Immediate::Int64(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::Float32, Operand::Immediate(Immediate::Float32(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::Float64, Operand::Immediate(Immediate::Float64(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (OperandType::Token, Operand::Token(token)) => out.extend_from_slice(&token.value().to_le_bytes()),
        (OperandType::ShortBranch, Operand::Target(target)) => {
            let end = i64::from(instruction.offset) + i64::from(opcode.size()) + 1;
            let delta = i8::try_from(i64::from(*target) - end).map_err(|_| {
                malformed_error!("Short branch at IL_{:04x} cannot reach IL_{:04x}", instruction.offset, target)
            })?;
            out.extend_from_slice(&delta.to_le_bytes());
        }
        (OperandType::Branch, Operand::Target(target)) => {
            let end = i64::from(instruction.offset) + i64::from(opcode.size()) + 4;
            out.extend_from_slice(&relative(*target, end)?.to_le_bytes());
        }
        (OperandType::Switch, Operand::Switch(targets)) => {
            let count = u32::try_from(targets.len())
                .map_err(|_| malformed_error!("Switch table too large"))?;
            out.extend_from_slice(&count.to_le_bytes());
            let end = i64::from(instruction.offset) + i64::from(opcode.size()) + 4 + 4 * i64::from(count);
            for target in targets {
                out.extend_from_slice(&relative(*target, end)?.to_le_bytes());
            }
        }
        (expected, actual) => {
            return Err(malformed_error!(
                "{} expects a {} operand, got {:?}",
                opcode.mnemonic(),
                expected,
                actual
            ))
        }
    }
    Ok(())
}

/// Encode a sequence of instructions.
///
/// # Errors
/// See [`encode_instruction`].
pub fn encode_instructions(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for instruction in instructions {
        encode_instruction(instruction, &mut out)?;
    }
    Ok(out)
}

pub(crate) fn write_opcode(opcode: OpCode, out: &mut Vec<u8>) {
    let value = opcode.value();
    if opcode.is_extended() {
        out.push(0xFE);
    }
    #[allow(clippy::cast_possible_truncation)]
    out.push(value as u8);
}

fn relative(target: u32, end: i64) -> Result<i32> {
    i32::try_from(i64::from(target) - end).map_err(|_| malformed_error!("Branch delta out of range"))
}
