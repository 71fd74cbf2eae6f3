//! Encodes an [`Insn`] stream into bytecode against a class's constant pool.

use crate::classfile::ConstantPool;
use crate::insn::{Insn, InsnSink};
use crate::opcodes;
use crate::Result;

/// Bytes produced by an [`Assembler`] together with the operand stack depth
/// they need on top of whatever is already on the stack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    pub max_stack: u16,
}

/// An [`InsnSink`] that writes real bytecode, interning constants as it goes.
///
/// Encodings are always the shortest form for the operand, so the output
/// depends only on the instruction stream and the pool's existing contents.
pub struct Assembler<'cp> {
    pool: &'cp mut ConstantPool,
    bytes: Vec<u8>,
    depth: i32,
    max_depth: i32,
}

impl<'cp> Assembler<'cp> {
    pub fn new(pool: &'cp mut ConstantPool) -> Self {
        Self { pool, bytes: Vec::new(), depth: 0, max_depth: 0 }
    }

    pub fn finish(self) -> Assembled {
        Assembled {
            bytes: self.bytes,
            max_stack: self.max_depth.clamp(0, u16::MAX as i32) as u16,
        }
    }

    fn op_u1(&mut self, opcode: u8, operand: u8) {
        self.bytes.push(opcode);
        self.bytes.push(operand);
    }

    fn op_u2(&mut self, opcode: u8, operand: u16) {
        self.bytes.push(opcode);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
    }

    fn ldc(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.op_u1(opcodes::LDC, short),
            Err(_) => self.op_u2(opcodes::LDC_W, index),
        }
    }
}

impl InsnSink for Assembler<'_> {
    fn emit(&mut self, insn: Insn) -> Result<()> {
        let delta = insn.stack_delta()?;
        match insn {
            Insn::PushString(value) => {
                let index = self.pool.string(&value)?;
                self.ldc(index);
            }
            Insn::PushInt(value) => match value {
                -1..=5 => self.bytes.push((opcodes::ICONST_0 as i32 + value) as u8),
                v if i8::try_from(v).is_ok() => self.op_u1(opcodes::BIPUSH, v as i8 as u8),
                v if i16::try_from(v).is_ok() => self.op_u2(opcodes::SIPUSH, v as i16 as u16),
                v => {
                    let index = self.pool.integer(v)?;
                    self.ldc(index);
                }
            },
            Insn::Load(kind, slot) => match slot {
                0..=3 => self.bytes.push(kind.short_opcode_base() + slot as u8),
                4..=255 => self.op_u1(kind.opcode(), slot as u8),
                _ => {
                    self.bytes.push(opcodes::WIDE);
                    self.op_u2(kind.opcode(), slot);
                }
            },
            Insn::InvokeStatic(method) => {
                let index = self.pool.method_ref(&method.owner, &method.name, &method.descriptor)?;
                self.op_u2(opcodes::INVOKESTATIC, index);
            }
            Insn::NewObjectArray(element) => {
                let index = self.pool.class(&element)?;
                self.op_u2(opcodes::ANEWARRAY, index);
            }
            Insn::Dup => self.bytes.push(opcodes::DUP),
            Insn::ArrayStoreRef => self.bytes.push(opcodes::AASTORE),
        }
        self.depth += delta;
        self.max_depth = self.max_depth.max(self.depth);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::MethodRef;
    use crate::kind::LoadKind;
    use crate::opcodes::*;

    fn assemble(insns: Vec<Insn>) -> (Assembled, ConstantPool) {
        let mut pool = ConstantPool::new();
        let mut asm = Assembler::new(&mut pool);
        for insn in insns {
            asm.emit(insn).unwrap();
        }
        (asm.finish(), pool)
    }

    #[test]
    fn int_pushes_use_shortest_form() {
        let (out, pool) = assemble(vec![
            Insn::PushInt(-1),
            Insn::PushInt(5),
            Insn::PushInt(100),
            Insn::PushInt(177),
            Insn::PushInt(70_000),
        ]);
        assert_eq!(&out.bytes[..7], &[ICONST_M1, ICONST_0 + 5, BIPUSH, 100, SIPUSH, 0, 177]);
        assert_eq!(out.bytes[7], LDC);
        assert!(matches!(pool.get(out.bytes[8] as u16), Ok(crate::classfile::CpInfo::Integer(70_000))));
        assert_eq!(out.max_stack, 5);
    }

    #[test]
    fn loads_pick_short_normal_and_wide_forms() {
        let (out, _) = assemble(vec![
            Insn::Load(LoadKind::Long, 1),
            Insn::Load(LoadKind::Reference, 7),
            Insn::Load(LoadKind::Int, 300),
        ]);
        assert_eq!(out.bytes, vec![LLOAD_0 + 1, ALOAD, 7, WIDE, ILOAD, 0x01, 0x2c]);
        assert_eq!(out.max_stack, 4);
    }

    #[test]
    fn invoke_tracks_descriptor_stack_effect() {
        let (out, pool) = assemble(vec![
            Insn::Load(LoadKind::Double, 0),
            Insn::InvokeStatic(MethodRef::new("java/lang/Double", "valueOf", "(D)Ljava/lang/Double;")),
        ]);
        assert_eq!(out.max_stack, 2);
        let index = u16::from_be_bytes([out.bytes[2], out.bytes[3]]);
        assert_eq!(pool.member_ref(index).unwrap().owner, "java/lang/Double");
    }
}
