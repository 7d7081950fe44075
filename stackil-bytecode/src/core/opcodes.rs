//! Opcode table for the stackil instruction set
//!
//! Each opcode knows its mnemonic and its encoded size. The sizes follow the
//! CLI encoding: one-byte opcodes, `0xFE`-prefixed two-byte opcodes, and
//! operands sized by kind. Branches come in a long form (32-bit displacement)
//! and a short form (8-bit displacement); which one is used is decided by the
//! branch-shortening pass, never by the caller.

use bitflags::bitflags;

/// Prefix byte shared by all two-byte opcodes
pub const TWO_BYTE_PREFIX: u8 = 0xFE;

/// Encoded size of the `tail.` prefix
pub const TAIL_PREFIX_SIZE: u32 = 2;

/// Inclusive range of displacements a short branch can encode
pub const SHORT_BRANCH_RANGE: std::ops::RangeInclusive<i64> = (i8::MIN as i64)..=(i8::MAX as i64);

/// Opcode enumeration. Discriminants are the CLI encodings; two-byte
/// opcodes carry the `0xFE` prefix in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[allow(non_camel_case_types)] // Opcodes follow assembly/bytecode naming convention
pub enum Opcode {
    NOP = 0x00,
    LDARG_S = 0x0E,
    LDARGA_S = 0x0F,
    STARG_S = 0x10,
    LDLOC_S = 0x11,
    LDLOCA_S = 0x12,
    STLOC_S = 0x13,
    LDNULL = 0x14,
    LDC_I4 = 0x20,
    LDC_I8 = 0x21,
    LDC_R4 = 0x22,
    LDC_R8 = 0x23,
    DUP = 0x25,
    POP = 0x26,
    CALL = 0x28,
    CALLI = 0x29,
    RET = 0x2A,

    // Short branches (0x2B - 0x33)
    BR_S = 0x2B,
    BRFALSE_S = 0x2C,
    BRTRUE_S = 0x2D,
    BEQ_S = 0x2E,
    BGE_S = 0x2F,
    BGT_S = 0x30,
    BLE_S = 0x31,
    BLT_S = 0x32,
    BNE_UN_S = 0x33,

    // Long branches (0x38 - 0x40)
    BR = 0x38,
    BRFALSE = 0x39,
    BRTRUE = 0x3A,
    BEQ = 0x3B,
    BGE = 0x3C,
    BGT = 0x3D,
    BLE = 0x3E,
    BLT = 0x3F,
    BNE_UN = 0x40,
    SWITCH = 0x45,

    // Arithmetic and bitwise
    ADD = 0x58,
    SUB = 0x59,
    MUL = 0x5A,
    DIV = 0x5B,
    REM = 0x5D,
    AND = 0x5F,
    OR = 0x60,
    XOR = 0x61,
    SHL = 0x62,
    SHR = 0x63,
    SHR_UN = 0x64,
    NEG = 0x65,
    NOT = 0x66,

    // Conversions
    CONV_I4 = 0x69,
    CONV_I8 = 0x6A,
    CONV_R4 = 0x6B,
    CONV_R8 = 0x6C,
    CONV_I = 0xD3,

    // Objects, fields, arrays
    CALLVIRT = 0x6F,
    LDOBJ = 0x71,
    LDSTR = 0x72,
    NEWOBJ = 0x73,
    CASTCLASS = 0x74,
    ISINST = 0x75,
    THROW = 0x7A,
    LDFLD = 0x7B,
    STFLD = 0x7D,
    LDSFLD = 0x7E,
    STSFLD = 0x80,
    STOBJ = 0x81,
    BOX = 0x8C,
    NEWARR = 0x8D,
    LDLEN = 0x8E,
    LDELEM = 0xA3,
    STELEM = 0xA4,
    UNBOX_ANY = 0xA5,

    // Exception handling
    ENDFINALLY = 0xDC,
    LEAVE = 0xDD,
    LEAVE_S = 0xDE,

    // Two-byte opcodes (0xFE prefix)
    CEQ = 0xFE01,
    CGT = 0xFE02,
    CLT = 0xFE04,
    LDFTN = 0xFE06,
    LDARG = 0xFE09,
    LDARGA = 0xFE0A,
    STARG = 0xFE0B,
    LDLOC = 0xFE0C,
    LDLOCA = 0xFE0D,
    STLOC = 0xFE0E,
    TAIL = 0xFE14,
    INITOBJ = 0xFE15,
    RETHROW = 0xFE1A,
}

/// Width of the operand that follows the opcode bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// 8-bit slot index or branch displacement
    Short,
    /// 16-bit slot index
    Slot,
    /// 32-bit literal, token or branch displacement
    Word,
    /// 64-bit literal
    Wide,
    /// `switch` jump table: count followed by one 32-bit displacement per target
    JumpTable,
}

impl Opcode {
    /// Raw encoding: `(prefix, byte)`
    pub fn encoding(self) -> (Option<u8>, u8) {
        let raw = self as u16;
        if raw > 0xFF {
            (Some((raw >> 8) as u8), (raw & 0xFF) as u8)
        } else {
            (None, raw as u8)
        }
    }

    /// Size of the opcode itself, excluding operands
    pub fn opcode_size(self) -> u32 {
        match self.encoding() {
            (Some(_), _) => 2,
            (None, _) => 1,
        }
    }

    pub fn operand_kind(self) -> OperandKind {
        use Opcode::*;
        match self {
            LDARG_S | LDARGA_S | STARG_S | LDLOC_S | LDLOCA_S | STLOC_S => OperandKind::Short,
            BR_S | BRFALSE_S | BRTRUE_S | BEQ_S | BGE_S | BGT_S | BLE_S | BLT_S | BNE_UN_S
            | LEAVE_S => OperandKind::Short,
            LDARG | LDARGA | STARG | LDLOC | LDLOCA | STLOC => OperandKind::Slot,
            LDC_I4 | LDC_R4 | LDSTR | CALL | CALLI | CALLVIRT | NEWOBJ | LDFTN | CASTCLASS
            | ISINST | BOX | UNBOX_ANY | NEWARR | LDELEM | STELEM | LDOBJ | STOBJ | LDFLD
            | STFLD | LDSFLD | STSFLD | INITOBJ => OperandKind::Word,
            BR | BRFALSE | BRTRUE | BEQ | BGE | BGT | BLE | BLT | BNE_UN | LEAVE => {
                OperandKind::Word
            }
            LDC_I8 | LDC_R8 => OperandKind::Wide,
            SWITCH => OperandKind::JumpTable,
            NOP | LDNULL | DUP | POP | RET | ADD | SUB | MUL | DIV | REM | AND | OR | XOR | SHL
            | SHR | SHR_UN | NEG | NOT | CONV_I4 | CONV_I8 | CONV_R4 | CONV_R8 | CONV_I | LDLEN
            | THROW | ENDFINALLY | CEQ | CGT | CLT | TAIL | RETHROW => OperandKind::None,
        }
    }

    /// Encoded size in bytes. `targets` is only consulted for `switch`.
    pub fn size(self, targets: usize) -> u32 {
        let operand = match self.operand_kind() {
            OperandKind::None => 0,
            OperandKind::Short => 1,
            OperandKind::Slot => 2,
            OperandKind::Word => 4,
            OperandKind::Wide => 8,
            OperandKind::JumpTable => 4 + 4 * targets as u32,
        };
        self.opcode_size() + operand
    }

    /// Short-form counterpart of a long branch or slot access, if any
    pub fn short_form(self) -> Option<Opcode> {
        use Opcode::*;
        Some(match self {
            BR => BR_S,
            BRFALSE => BRFALSE_S,
            BRTRUE => BRTRUE_S,
            BEQ => BEQ_S,
            BGE => BGE_S,
            BGT => BGT_S,
            BLE => BLE_S,
            BLT => BLT_S,
            BNE_UN => BNE_UN_S,
            LEAVE => LEAVE_S,
            LDARG => LDARG_S,
            LDARGA => LDARGA_S,
            STARG => STARG_S,
            LDLOC => LDLOC_S,
            LDLOCA => LDLOCA_S,
            STLOC => STLOC_S,
            _ => return None,
        })
    }

    /// Check if this opcode transfers control to a label
    pub fn is_branch(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            BR | BR_S
                | BRFALSE
                | BRFALSE_S
                | BRTRUE
                | BRTRUE_S
                | BEQ
                | BEQ_S
                | BGE
                | BGE_S
                | BGT
                | BGT_S
                | BLE
                | BLE_S
                | BLT
                | BLT_S
                | BNE_UN
                | BNE_UN_S
                | LEAVE
                | LEAVE_S
        )
    }

    /// Check if control never falls through to the next instruction
    pub fn is_unconditional_terminal(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            BR | BR_S | LEAVE | LEAVE_S | RET | THROW | RETHROW | ENDFINALLY
        )
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            NOP => "nop",
            LDARG_S => "ldarg.s",
            LDARGA_S => "ldarga.s",
            STARG_S => "starg.s",
            LDLOC_S => "ldloc.s",
            LDLOCA_S => "ldloca.s",
            STLOC_S => "stloc.s",
            LDNULL => "ldnull",
            LDC_I4 => "ldc.i4",
            LDC_I8 => "ldc.i8",
            LDC_R4 => "ldc.r4",
            LDC_R8 => "ldc.r8",
            DUP => "dup",
            POP => "pop",
            CALL => "call",
            CALLI => "calli",
            RET => "ret",
            BR_S => "br.s",
            BRFALSE_S => "brfalse.s",
            BRTRUE_S => "brtrue.s",
            BEQ_S => "beq.s",
            BGE_S => "bge.s",
            BGT_S => "bgt.s",
            BLE_S => "ble.s",
            BLT_S => "blt.s",
            BNE_UN_S => "bne.un.s",
            BR => "br",
            BRFALSE => "brfalse",
            BRTRUE => "brtrue",
            BEQ => "beq",
            BGE => "bge",
            BGT => "bgt",
            BLE => "ble",
            BLT => "blt",
            BNE_UN => "bne.un",
            SWITCH => "switch",
            ADD => "add",
            SUB => "sub",
            MUL => "mul",
            DIV => "div",
            REM => "rem",
            AND => "and",
            OR => "or",
            XOR => "xor",
            SHL => "shl",
            SHR => "shr",
            SHR_UN => "shr.un",
            NEG => "neg",
            NOT => "not",
            CONV_I4 => "conv.i4",
            CONV_I8 => "conv.i8",
            CONV_R4 => "conv.r4",
            CONV_R8 => "conv.r8",
            CONV_I => "conv.i",
            CALLVIRT => "callvirt",
            LDOBJ => "ldobj",
            LDSTR => "ldstr",
            NEWOBJ => "newobj",
            CASTCLASS => "castclass",
            ISINST => "isinst",
            THROW => "throw",
            LDFLD => "ldfld",
            STFLD => "stfld",
            LDSFLD => "ldsfld",
            STSFLD => "stsfld",
            STOBJ => "stobj",
            BOX => "box",
            NEWARR => "newarr",
            LDLEN => "ldlen",
            LDELEM => "ldelem",
            STELEM => "stelem",
            UNBOX_ANY => "unbox.any",
            ENDFINALLY => "endfinally",
            LEAVE => "leave",
            LEAVE_S => "leave.s",
            CEQ => "ceq",
            CGT => "cgt",
            CLT => "clt",
            LDFTN => "ldftn",
            LDARG => "ldarg",
            LDARGA => "ldarga",
            STARG => "starg",
            LDLOC => "ldloc",
            LDLOCA => "ldloca",
            STLOC => "stloc",
            TAIL => "tail.",
            INITOBJ => "initobj",
            RETHROW => "rethrow",
        }
    }
}

bitflags! {
    /// Per-instruction metadata set by the emitter and the optimizer.
    /// Instruction data itself is never rewritten; passes only toggle these.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstructionFlags: u8 {
        /// Branch or slot access uses its short encoding
        const SHORT_FORM = 0b0000_0001;

        /// Call is emitted with the `tail.` prefix
        const TAIL_CALL = 0b0000_0010;

        /// Instruction is omitted from the finalized stream
        const ELIDED = 0b0000_0100;

        /// Instruction is the target of at least one branch
        const BRANCH_TARGET = 0b0000_1000;

        /// Instruction was appended by the emitter itself (implicit leave,
        /// endfinally, or local reinitialisation)
        const IMPLICIT = 0b0001_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_encoding() {
        assert_eq!(Opcode::ADD.encoding(), (None, 0x58));
        assert_eq!(Opcode::CEQ.encoding(), (Some(TWO_BYTE_PREFIX), 0x01));
        assert_eq!(Opcode::RETHROW.opcode_size(), 2);
        assert_eq!(Opcode::RET.opcode_size(), 1);
    }

    #[test]
    fn test_opcode_sizes() {
        assert_eq!(Opcode::NOP.size(0), 1);
        assert_eq!(Opcode::BR.size(0), 5);
        assert_eq!(Opcode::BR_S.size(0), 2);
        assert_eq!(Opcode::LDC_I8.size(0), 9);
        assert_eq!(Opcode::LDLOC.size(0), 4);
        assert_eq!(Opcode::LDLOC_S.size(0), 2);
        assert_eq!(Opcode::SWITCH.size(3), 1 + 4 + 12);
    }

    #[test]
    fn test_short_forms() {
        assert_eq!(Opcode::BRTRUE.short_form(), Some(Opcode::BRTRUE_S));
        assert_eq!(Opcode::LEAVE.short_form(), Some(Opcode::LEAVE_S));
        assert_eq!(Opcode::SWITCH.short_form(), None);
        assert!(Opcode::BLT_S.is_branch());
        assert!(!Opcode::SWITCH.is_branch());
        assert!(Opcode::BR_S.is_unconditional_terminal());
        assert!(!Opcode::BRTRUE.is_unconditional_terminal());
    }

    #[test]
    fn test_instruction_flags() {
        let mut flags = InstructionFlags::empty();
        assert!(!flags.contains(InstructionFlags::TAIL_CALL));

        flags |= InstructionFlags::TAIL_CALL | InstructionFlags::SHORT_FORM;
        assert!(flags.contains(InstructionFlags::TAIL_CALL));
        assert!(flags.contains(InstructionFlags::SHORT_FORM));
        assert!(!flags.contains(InstructionFlags::ELIDED));
    }
}
