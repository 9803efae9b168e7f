//! IL decoding, encoding and method-body provisioning.
//!
//! This module is everything between a [`crate::typesystem::MethodId`] and the instruction
//! stream the lowering engine walks:
//!
//! - [`opcodes`] / [`Instruction`] - The CIL opcode table and decoded instruction shapes
//! - [`decode_stream`] / [`encode_instructions`] - Bit-exact conversion between bytes and
//!   [`Instruction`]s, with branch deltas normalized to absolute offsets
//! - [`ILEmitter`] - Label-based construction of synthetic bodies
//! - [`ILProvider`] - Resolves a method to its metadata body or a synthesized one and caches the
//!   result per method
//!
//! # Examples
//!
//! ```rust
//! use cilaot::il::{decode_stream, Operand};
//!
//! // br.s +0; ret
//! let instructions = decode_stream(&[0x2B, 0x00, 0x2A])?;
//! assert_eq!(instructions[0].operand, Operand::Target(2));
//! # Ok::<(), cilaot::Error>(())
//! ```

mod body;
mod decoder;
mod emitter;
mod encoder;
mod instruction;
mod provider;
mod stubs;

/// The CIL opcode table
pub mod opcodes;

pub use body::{ILBody, MethodIL, StubToken, TokenScope, STUB_TOKEN_TABLE};
pub use decoder::{decode_instruction, decode_stream};
pub use emitter::{ILEmitter, ILLabel};
pub use encoder::{encode_instruction, encode_instructions};
pub use instruction::{Immediate, Instruction, Operand};
pub use opcodes::{FlowType, OpCode, OperandType};
pub use provider::ILProvider;
