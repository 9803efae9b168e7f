//! The CIL opcode table (ECMA-335 III).
//!
//! Single-byte opcodes use their byte as value; opcodes behind the `0xFE` extension prefix use
//! `0xFE00 | second_byte`.

use strum::Display;

/// Shape of the operand that follows an opcode in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate
    Int8,
    /// Unsigned 8-bit index or immediate
    UInt8,
    /// Unsigned 16-bit index
    UInt16,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// 32-bit metadata token
    Token,
    /// Signed 8-bit branch delta
    ShortBranch,
    /// Signed 32-bit branch delta
    Branch,
    /// Case count followed by that many signed 32-bit deltas
    Switch,
}

impl OperandType {
    /// Encoded size in bytes; the switch table size depends on its case count.
    #[must_use]
    pub fn size(self) -> Option<u32> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 | OperandType::ShortBranch => Some(1),
            OperandType::UInt16 => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token | OperandType::Branch => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// How an instruction transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Always jumps
    UnconditionalBranch,
    /// Jumps or falls through
    ConditionalBranch,
    /// Jumps through a table or falls through
    Switch,
    /// Leaves the method normally
    Return,
    /// Leaves the method with an exception
    Throw,
    /// Leaves a protected region
    Leave,
    /// Ends a finally, fault or filter handler
    EndHandler,
    /// Calls, returning afterwards
    Call,
    /// Modifies the next instruction
    Prefix,
}

impl FlowType {
    /// `true` if the instruction never falls through to the next one.
    #[must_use]
    pub fn ends_block(self) -> bool {
        !matches!(
            self,
            FlowType::Sequential | FlowType::Call | FlowType::Prefix
        )
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:literal, $mnemonic:literal, $operand:ident, $flow:ident;)*) => {
        /// A CIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum OpCode {
            $(
                #[doc = $mnemonic]
                $name = $value,
            )*
        }

        impl OpCode {
            /// Look up an opcode by its value, `0xFE00 | byte` for extended opcodes.
            #[must_use]
            pub fn from_value(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(OpCode::$name),)*
                    _ => None,
                }
            }

            /// The assembler mnemonic.
            #[must_use]
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => $mnemonic,)*
                }
            }

            /// Shape of the operand.
            #[must_use]
            pub fn operand_type(self) -> OperandType {
                match self {
                    $(OpCode::$name => OperandType::$operand,)*
                }
            }

            /// Control-flow behavior.
            #[must_use]
            pub fn flow(self) -> FlowType {
                match self {
                    $(OpCode::$name => FlowType::$flow,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None, Sequential;
    Break = 0x01, "break", None, Sequential;
    Ldarg0 = 0x02, "ldarg.0", None, Sequential;
    Ldarg1 = 0x03, "ldarg.1", None, Sequential;
    Ldarg2 = 0x04, "ldarg.2", None, Sequential;
    Ldarg3 = 0x05, "ldarg.3", None, Sequential;
    Ldloc0 = 0x06, "ldloc.0", None, Sequential;
    Ldloc1 = 0x07, "ldloc.1", None, Sequential;
    Ldloc2 = 0x08, "ldloc.2", None, Sequential;
    Ldloc3 = 0x09, "ldloc.3", None, Sequential;
    Stloc0 = 0x0A, "stloc.0", None, Sequential;
    Stloc1 = 0x0B, "stloc.1", None, Sequential;
    Stloc2 = 0x0C, "stloc.2", None, Sequential;
    Stloc3 = 0x0D, "stloc.3", None, Sequential;
    LdargS = 0x0E, "ldarg.s", UInt8, Sequential;
    LdargaS = 0x0F, "ldarga.s", UInt8, Sequential;
    StargS = 0x10, "starg.s", UInt8, Sequential;
    LdlocS = 0x11, "ldloc.s", UInt8, Sequential;
    LdlocaS = 0x12, "ldloca.s", UInt8, Sequential;
    StlocS = 0x13, "stloc.s", UInt8, Sequential;
    Ldnull = 0x14, "ldnull", None, Sequential;
    LdcI4M1 = 0x15, "ldc.i4.m1", None, Sequential;
    LdcI40 = 0x16, "ldc.i4.0", None, Sequential;
    LdcI41 = 0x17, "ldc.i4.1", None, Sequential;
    LdcI42 = 0x18, "ldc.i4.2", None, Sequential;
    LdcI43 = 0x19, "ldc.i4.3", None, Sequential;
    LdcI44 = 0x1A, "ldc.i4.4", None, Sequential;
    LdcI45 = 0x1B, "ldc.i4.5", None, Sequential;
    LdcI46 = 0x1C, "ldc.i4.6", None, Sequential;
    LdcI47 = 0x1D, "ldc.i4.7", None, Sequential;
    LdcI48 = 0x1E, "ldc.i4.8", None, Sequential;
    LdcI4S = 0x1F, "ldc.i4.s", Int8, Sequential;
    LdcI4 = 0x20, "ldc.i4", Int32, Sequential;
    LdcI8 = 0x21, "ldc.i8", Int64, Sequential;
    LdcR4 = 0x22, "ldc.r4", Float32, Sequential;
    LdcR8 = 0x23, "ldc.r8", Float64, Sequential;
    Dup = 0x25, "dup", None, Sequential;
    Pop = 0x26, "pop", None, Sequential;
    Jmp = 0x27, "jmp", Token, Return;
    Call = 0x28, "call", Token, Call;
    Calli = 0x29, "calli", Token, Call;
    Ret = 0x2A, "ret", None, Return;
    BrS = 0x2B, "br.s", ShortBranch, UnconditionalBranch;
    BrfalseS = 0x2C, "brfalse.s", ShortBranch, ConditionalBranch;
    BrtrueS = 0x2D, "brtrue.s", ShortBranch, ConditionalBranch;
    BeqS = 0x2E, "beq.s", ShortBranch, ConditionalBranch;
    BgeS = 0x2F, "bge.s", ShortBranch, ConditionalBranch;
    BgtS = 0x30, "bgt.s", ShortBranch, ConditionalBranch;
    BleS = 0x31, "ble.s", ShortBranch, ConditionalBranch;
    BltS = 0x32, "blt.s", ShortBranch, ConditionalBranch;
    BneUnS = 0x33, "bne.un.s", ShortBranch, ConditionalBranch;
    BgeUnS = 0x34, "bge.un.s", ShortBranch, ConditionalBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortBranch, ConditionalBranch;
    BleUnS = 0x36, "ble.un.s", ShortBranch, ConditionalBranch;
    BltUnS = 0x37, "blt.un.s", ShortBranch, ConditionalBranch;
    Br = 0x38, "br", Branch, UnconditionalBranch;
    Brfalse = 0x39, "brfalse", Branch, ConditionalBranch;
    Brtrue = 0x3A, "brtrue", Branch, ConditionalBranch;
    Beq = 0x3B, "beq", Branch, ConditionalBranch;
    Bge = 0x3C, "bge", Branch, ConditionalBranch;
    Bgt = 0x3D, "bgt", Branch, ConditionalBranch;
    Ble = 0x3E, "ble", Branch, ConditionalBranch;
    Blt = 0x3F, "blt", Branch, ConditionalBranch;
    BneUn = 0x40, "bne.un", Branch, ConditionalBranch;
    BgeUn = 0x41, "bge.un", Branch, ConditionalBranch;
    BgtUn = 0x42, "bgt.un", Branch, ConditionalBranch;
    BleUn = 0x43, "ble.un", Branch, ConditionalBranch;
    BltUn = 0x44, "blt.un", Branch, ConditionalBranch;
    Switch = 0x45, "switch", Switch, Switch;
    LdindI1 = 0x46, "ldind.i1", None, Sequential;
    LdindU1 = 0x47, "ldind.u1", None, Sequential;
    LdindI2 = 0x48, "ldind.i2", None, Sequential;
    LdindU2 = 0x49, "ldind.u2", None, Sequential;
    LdindI4 = 0x4A, "ldind.i4", None, Sequential;
    LdindU4 = 0x4B, "ldind.u4", None, Sequential;
    LdindI8 = 0x4C, "ldind.i8", None, Sequential;
    LdindI = 0x4D, "ldind.i", None, Sequential;
    LdindR4 = 0x4E, "ldind.r4", None, Sequential;
    LdindR8 = 0x4F, "ldind.r8", None, Sequential;
    LdindRef = 0x50, "ldind.ref", None, Sequential;
    StindRef = 0x51, "stind.ref", None, Sequential;
    StindI1 = 0x52, "stind.i1", None, Sequential;
    StindI2 = 0x53, "stind.i2", None, Sequential;
    StindI4 = 0x54, "stind.i4", None, Sequential;
    StindI8 = 0x55, "stind.i8", None, Sequential;
    StindR4 = 0x56, "stind.r4", None, Sequential;
    StindR8 = 0x57, "stind.r8", None, Sequential;
    Add = 0x58, "add", None, Sequential;
    Sub = 0x59, "sub", None, Sequential;
    Mul = 0x5A, "mul", None, Sequential;
    Div = 0x5B, "div", None, Sequential;
    DivUn = 0x5C, "div.un", None, Sequential;
    Rem = 0x5D, "rem", None, Sequential;
    RemUn = 0x5E, "rem.un", None, Sequential;
    And = 0x5F, "and", None, Sequential;
    Or = 0x60, "or", None, Sequential;
    Xor = 0x61, "xor", None, Sequential;
    Shl = 0x62, "shl", None, Sequential;
    Shr = 0x63, "shr", None, Sequential;
    ShrUn = 0x64, "shr.un", None, Sequential;
    Neg = 0x65, "neg", None, Sequential;
    Not = 0x66, "not", None, Sequential;
    ConvI1 = 0x67, "conv.i1", None, Sequential;
    ConvI2 = 0x68, "conv.i2", None, Sequential;
    ConvI4 = 0x69, "conv.i4", None, Sequential;
    ConvI8 = 0x6A, "conv.i8", None, Sequential;
    ConvR4 = 0x6B, "conv.r4", None, Sequential;
    ConvR8 = 0x6C, "conv.r8", None, Sequential;
    ConvU4 = 0x6D, "conv.u4", None, Sequential;
    ConvU8 = 0x6E, "conv.u8", None, Sequential;
    Callvirt = 0x6F, "callvirt", Token, Call;
    Cpobj = 0x70, "cpobj", Token, Sequential;
    Ldobj = 0x71, "ldobj", Token, Sequential;
    Ldstr = 0x72, "ldstr", Token, Sequential;
    Newobj = 0x73, "newobj", Token, Call;
    Castclass = 0x74, "castclass", Token, Sequential;
    Isinst = 0x75, "isinst", Token, Sequential;
    ConvRUn = 0x76, "conv.r.un", None, Sequential;
    Unbox = 0x79, "unbox", Token, Sequential;
    Throw = 0x7A, "throw", None, Throw;
    Ldfld = 0x7B, "ldfld", Token, Sequential;
    Ldflda = 0x7C, "ldflda", Token, Sequential;
    Stfld = 0x7D, "stfld", Token, Sequential;
    Ldsfld = 0x7E, "ldsfld", Token, Sequential;
    Ldsflda = 0x7F, "ldsflda", Token, Sequential;
    Stsfld = 0x80, "stsfld", Token, Sequential;
    Stobj = 0x81, "stobj", Token, Sequential;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None, Sequential;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None, Sequential;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None, Sequential;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None, Sequential;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None, Sequential;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None, Sequential;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None, Sequential;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None, Sequential;
    ConvOvfIUn = 0x8A, "conv.ovf.i.un", None, Sequential;
    ConvOvfUUn = 0x8B, "conv.ovf.u.un", None, Sequential;
    Box = 0x8C, "box", Token, Sequential;
    Newarr = 0x8D, "newarr", Token, Sequential;
    Ldlen = 0x8E, "ldlen", None, Sequential;
    Ldelema = 0x8F, "ldelema", Token, Sequential;
    LdelemI1 = 0x90, "ldelem.i1", None, Sequential;
    LdelemU1 = 0x91, "ldelem.u1", None, Sequential;
    LdelemI2 = 0x92, "ldelem.i2", None, Sequential;
    LdelemU2 = 0x93, "ldelem.u2", None, Sequential;
    LdelemI4 = 0x94, "ldelem.i4", None, Sequential;
    LdelemU4 = 0x95, "ldelem.u4", None, Sequential;
    LdelemI8 = 0x96, "ldelem.i8", None, Sequential;
    LdelemI = 0x97, "ldelem.i", None, Sequential;
    LdelemR4 = 0x98, "ldelem.r4", None, Sequential;
    LdelemR8 = 0x99, "ldelem.r8", None, Sequential;
    LdelemRef = 0x9A, "ldelem.ref", None, Sequential;
    StelemI = 0x9B, "stelem.i", None, Sequential;
    StelemI1 = 0x9C, "stelem.i1", None, Sequential;
    StelemI2 = 0x9D, "stelem.i2", None, Sequential;
    StelemI4 = 0x9E, "stelem.i4", None, Sequential;
    StelemI8 = 0x9F, "stelem.i8", None, Sequential;
    StelemR4 = 0xA0, "stelem.r4", None, Sequential;
    StelemR8 = 0xA1, "stelem.r8", None, Sequential;
    StelemRef = 0xA2, "stelem.ref", None, Sequential;
    Ldelem = 0xA3, "ldelem", Token, Sequential;
    Stelem = 0xA4, "stelem", Token, Sequential;
    UnboxAny = 0xA5, "unbox.any", Token, Sequential;
    ConvOvfI1 = 0xB3, "conv.ovf.i1", None, Sequential;
    ConvOvfU1 = 0xB4, "conv.ovf.u1", None, Sequential;
    ConvOvfI2 = 0xB5, "conv.ovf.i2", None, Sequential;
    ConvOvfU2 = 0xB6, "conv.ovf.u2", None, Sequential;
    ConvOvfI4 = 0xB7, "conv.ovf.i4", None, Sequential;
    ConvOvfU4 = 0xB8, "conv.ovf.u4", None, Sequential;
    ConvOvfI8 = 0xB9, "conv.ovf.i8", None, Sequential;
    ConvOvfU8 = 0xBA, "conv.ovf.u8", None, Sequential;
    Refanyval = 0xC2, "refanyval", Token, Sequential;
    Ckfinite = 0xC3, "ckfinite", None, Sequential;
    Mkrefany = 0xC6, "mkrefany", Token, Sequential;
    Ldtoken = 0xD0, "ldtoken", Token, Sequential;
    ConvU2 = 0xD1, "conv.u2", None, Sequential;
    ConvU1 = 0xD2, "conv.u1", None, Sequential;
    ConvI = 0xD3, "conv.i", None, Sequential;
    ConvOvfI = 0xD4, "conv.ovf.i", None, Sequential;
    ConvOvfU = 0xD5, "conv.ovf.u", None, Sequential;
    AddOvf = 0xD6, "add.ovf", None, Sequential;
    AddOvfUn = 0xD7, "add.ovf.un", None, Sequential;
    MulOvf = 0xD8, "mul.ovf", None, Sequential;
    MulOvfUn = 0xD9, "mul.ovf.un", None, Sequential;
    SubOvf = 0xDA, "sub.ovf", None, Sequential;
    SubOvfUn = 0xDB, "sub.ovf.un", None, Sequential;
    Endfinally = 0xDC, "endfinally", None, EndHandler;
    Leave = 0xDD, "leave", Branch, Leave;
    LeaveS = 0xDE, "leave.s", ShortBranch, Leave;
    StindI = 0xDF, "stind.i", None, Sequential;
    ConvU = 0xE0, "conv.u", None, Sequential;
    Arglist = 0xFE00, "arglist", None, Sequential;
    Ceq = 0xFE01, "ceq", None, Sequential;
    Cgt = 0xFE02, "cgt", None, Sequential;
    CgtUn = 0xFE03, "cgt.un", None, Sequential;
    Clt = 0xFE04, "clt", None, Sequential;
    CltUn = 0xFE05, "clt.un", None, Sequential;
    Ldftn = 0xFE06, "ldftn", Token, Sequential;
    Ldvirtftn = 0xFE07, "ldvirtftn", Token, Sequential;
    Ldarg = 0xFE09, "ldarg", UInt16, Sequential;
    Ldarga = 0xFE0A, "ldarga", UInt16, Sequential;
    Starg = 0xFE0B, "starg", UInt16, Sequential;
    Ldloc = 0xFE0C, "ldloc", UInt16, Sequential;
    Ldloca = 0xFE0D, "ldloca", UInt16, Sequential;
    Stloc = 0xFE0E, "stloc", UInt16, Sequential;
    Localloc = 0xFE0F, "localloc", None, Sequential;
    Endfilter = 0xFE11, "endfilter", None, EndHandler;
    Unaligned = 0xFE12, "unaligned.", UInt8, Prefix;
    Volatile = 0xFE13, "volatile.", None, Prefix;
    Tail = 0xFE14, "tail.", None, Prefix;
    Initobj = 0xFE15, "initobj", Token, Sequential;
    Constrained = 0xFE16, "constrained.", Token, Prefix;
    Cpblk = 0xFE17, "cpblk", None, Sequential;
    Initblk = 0xFE18, "initblk", None, Sequential;
    No = 0xFE19, "no.", UInt8, Prefix;
    Rethrow = 0xFE1A, "rethrow", None, Throw;
    Sizeof = 0xFE1C, "sizeof", Token, Sequential;
    Refanytype = 0xFE1D, "refanytype", None, Sequential;
    Readonly = 0xFE1E, "readonly.", None, Prefix;
}

impl OpCode {
    /// The numeric value, `0xFE00 | byte` for extended opcodes.
    #[must_use]
    pub fn value(self) -> u16 {
        self as u16
    }

    /// `true` for opcodes behind the `0xFE` prefix.
    #[must_use]
    pub fn is_extended(self) -> bool {
        self.value() >= 0xFE00
    }

    /// Encoded size of the opcode itself.
    #[must_use]
    pub fn size(self) -> u32 {
        if self.is_extended() {
            2
        } else {
            1
        }
    }

    /// The long form of a short branch, or the opcode itself.
    #[must_use]
    pub fn long_form(self) -> OpCode {
        if self.operand_type() != OperandType::ShortBranch {
            return self;
        }
        match self {
            OpCode::LeaveS => OpCode::Leave,
            short => OpCode::from_value(short.value() + 0x0D).unwrap_or(short),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_value() {
        assert_eq!(OpCode::from_value(0x2A), Some(OpCode::Ret));
        assert_eq!(OpCode::from_value(0xFE01), Some(OpCode::Ceq));
        assert_eq!(OpCode::from_value(0x24), None);
        assert_eq!(OpCode::Ceq.mnemonic(), "ceq");
        assert!(OpCode::Ceq.is_extended());
    }

    #[test]
    fn short_branches_map_to_long_forms() {
        assert_eq!(OpCode::BrS.long_form(), OpCode::Br);
        assert_eq!(OpCode::BltUnS.long_form(), OpCode::BltUn);
        assert_eq!(OpCode::LeaveS.long_form(), OpCode::Leave);
        assert_eq!(OpCode::Add.long_form(), OpCode::Add);
    }

    #[test]
    fn flow_classification() {
        assert!(OpCode::Ret.flow().ends_block());
        assert!(OpCode::Switch.flow().ends_block());
        assert!(!OpCode::Call.flow().ends_block());
        assert_eq!(OperandType::Branch.size(), Some(4));
    }
}
