//! The instruction vocabulary the instrumentor emits, and the sink it emits into.
//!
//! Generated code only ever needs this handful of operations. Keeping them
//! symbolic lets tests record and inspect what would be woven into a method,
//! while [`crate::assembler::Assembler`] turns the same stream into bytecode.

use crate::descriptor::MethodDescriptor;
use crate::kind::LoadKind;
use crate::Result;

/// A static method reference by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self { owner: owner.into(), name: name.into(), descriptor: descriptor.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// `ldc` of a string constant.
    PushString(String),
    /// Smallest of `iconst_*`, `bipush`, `sipush` or `ldc` that fits.
    PushInt(i32),
    Load(LoadKind, u16),
    InvokeStatic(MethodRef),
    /// `anewarray` of the given element class; pops the length.
    NewObjectArray(String),
    Dup,
    /// `aastore`
    ArrayStoreRef,
}

impl Insn {
    /// Net operand stack change in words.
    pub fn stack_delta(&self) -> Result<i32> {
        let delta = match self {
            Insn::PushString(_) | Insn::PushInt(_) | Insn::Dup => 1,
            Insn::Load(kind, _) => kind.stack_words() as i32,
            Insn::InvokeStatic(m) => {
                let d = MethodDescriptor::parse(&m.descriptor)?;
                d.ret.map_or(0, |k| k.slot_width() as i32) - d.param_slots() as i32
            }
            Insn::NewObjectArray(_) => 0,
            Insn::ArrayStoreRef => -3,
        };
        Ok(delta)
    }
}

/// Append-only destination for generated instructions.
pub trait InsnSink {
    fn emit(&mut self, insn: Insn) -> Result<()>;
}

impl InsnSink for Vec<Insn> {
    fn emit(&mut self, insn: Insn) -> Result<()> {
        self.push(insn);
        Ok(())
    }
}

impl<S: InsnSink + ?Sized> InsnSink for &mut S {
    fn emit(&mut self, insn: Insn) -> Result<()> {
        (**self).emit(insn)
    }
}
