//! JVM opcode constants and operand sizes.
//!
//! Only the opcodes the instrumentor emits or inspects are named; the operand
//! table covers the whole instruction set so any code array can be walked.

pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;

pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const LLOAD_0: u8 = 0x1e;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;

pub const AASTORE: u8 = 0x53;
pub const DUP: u8 = 0x59;
pub const IINC: u8 = 0x84;

pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const IFLE: u8 = 0x9e;
pub const IF_ICMPEQ: u8 = 0x9f;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;

pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;

pub const INVOKESTATIC: u8 = 0xb8;
pub const NEW: u8 = 0xbb;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const WIDE: u8 = 0xc4;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// How an opcode's operands are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// A fixed number of operand bytes with no code offsets in them.
    Fixed(usize),
    /// A signed 16-bit branch offset.
    Branch16,
    /// A signed 32-bit branch offset.
    Branch32,
    TableSwitch,
    LookupSwitch,
    Wide,
}

/// Operand layout for `opcode`, or `None` if it may not appear in a class file.
pub fn operand_shape(opcode: u8) -> Option<OperandShape> {
    use OperandShape::*;
    let shape = match opcode {
        0x00..=0x0f => Fixed(0),
        BIPUSH => Fixed(1),
        SIPUSH => Fixed(2),
        LDC => Fixed(1),
        LDC_W | 0x14 => Fixed(2),
        0x15..=0x19 => Fixed(1),
        0x1a..=0x35 => Fixed(0),
        0x36..=0x3a => Fixed(1),
        0x3b..=0x83 => Fixed(0),
        IINC => Fixed(2),
        0x85..=0x98 => Fixed(0),
        IFEQ..=JSR => Branch16,
        0xa9 => Fixed(1),
        TABLESWITCH => TableSwitch,
        LOOKUPSWITCH => LookupSwitch,
        IRETURN..=RETURN => Fixed(0),
        0xb2..=0xb8 => Fixed(2),
        0xb9 | 0xba => Fixed(4),
        NEW => Fixed(2),
        0xbc => Fixed(1),
        ANEWARRAY => Fixed(2),
        0xbe | ATHROW => Fixed(0),
        0xc0 | 0xc1 => Fixed(2),
        0xc2 | 0xc3 => Fixed(0),
        WIDE => Wide,
        0xc5 => Fixed(3),
        IFNULL | IFNONNULL => Branch16,
        GOTO_W | JSR_W => Branch32,
        _ => return None,
    };
    Some(shape)
}

/// Whether `opcode` terminates the method, normally or abruptly.
pub fn is_exit(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN | ATHROW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_cover_returns_and_athrow() {
        let exits: Vec<u8> = (0..=255u8).filter(|op| is_exit(*op)).collect();
        assert_eq!(exits, vec![IRETURN, LRETURN, FRETURN, DRETURN, ARETURN, RETURN, ATHROW]);
    }

    #[test]
    fn reserved_opcodes_are_rejected() {
        assert_eq!(operand_shape(0xca), None);
        assert_eq!(operand_shape(0xfe), None);
        assert_eq!(operand_shape(0xff), None);
    }
}
