//! Entry and exit probe emission for one method.
//!
//! [`EntryExitInstrumentor`] is a two-state machine. The rewriter calls
//! [`on_method_enter`](EntryExitInstrumentor::on_method_enter) once for the
//! method entry, then [`on_method_exit`](EntryExitInstrumentor::on_method_exit)
//! once per exit instruction, in code order.
//!
//! ```text
//! NotEntered --on_method_enter--> Entered --on_method_exit--> Entered
//! ```

use crate::context::MethodContext;
use crate::insn::{Insn, InsnSink};
use crate::opcodes;
use crate::probe::ProbeInterface;
use crate::snapshot::{emit_snapshot, ArgumentLayout, EmptyArgs, SlotCursor};
use crate::{Error, Result};

/// An instruction that leaves the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    IntReturn,
    LongReturn,
    FloatReturn,
    DoubleReturn,
    ReferenceReturn,
    VoidReturn,
    /// `athrow`, the abrupt exit.
    Throw,
}

impl ExitKind {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        let kind = match opcode {
            opcodes::IRETURN => ExitKind::IntReturn,
            opcodes::LRETURN => ExitKind::LongReturn,
            opcodes::FRETURN => ExitKind::FloatReturn,
            opcodes::DRETURN => ExitKind::DoubleReturn,
            opcodes::ARETURN => ExitKind::ReferenceReturn,
            opcodes::RETURN => ExitKind::VoidReturn,
            opcodes::ATHROW => ExitKind::Throw,
            _ => return None,
        };
        Some(kind)
    }

    /// The raw opcode reported to the exit probe.
    pub fn opcode(self) -> u8 {
        match self {
            ExitKind::IntReturn => opcodes::IRETURN,
            ExitKind::LongReturn => opcodes::LRETURN,
            ExitKind::FloatReturn => opcodes::FRETURN,
            ExitKind::DoubleReturn => opcodes::DRETURN,
            ExitKind::ReferenceReturn => opcodes::ARETURN,
            ExitKind::VoidReturn => opcodes::RETURN,
            ExitKind::Throw => opcodes::ATHROW,
        }
    }

    pub fn is_abrupt(self) -> bool {
        self == ExitKind::Throw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotEntered,
    Entered,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::NotEntered => "not entered",
            Phase::Entered => "entered",
        }
    }
}

pub struct EntryExitInstrumentor<'a> {
    context: &'a MethodContext,
    probes: &'a ProbeInterface,
    layout: ArgumentLayout,
    empty_args: EmptyArgs,
    phase: Phase,
}

impl<'a> EntryExitInstrumentor<'a> {
    /// Classifies the method's parameters up front; a bad descriptor fails here,
    /// before anything is emitted.
    pub fn new(context: &'a MethodContext, probes: &'a ProbeInterface, empty_args: EmptyArgs) -> Result<Self> {
        let layout = ArgumentLayout::for_method(context)?;
        Ok(Self { context, probes, layout, empty_args, phase: Phase::NotEntered })
    }

    pub fn context(&self) -> &MethodContext {
        self.context
    }

    pub fn layout(&self) -> &ArgumentLayout {
        &self.layout
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Emits the allocation probe (constructors only), the argument snapshot and
    /// the enter probe. Returns the slot cursor after the last argument.
    pub fn on_method_enter<S: InsnSink + ?Sized>(&mut self, sink: &mut S) -> Result<SlotCursor> {
        self.expect(Phase::NotEntered)?;
        let ctx = self.context;

        if ctx.is_constructor() {
            sink.emit(Insn::PushString(ctx.owner().to_string()))?;
            sink.emit(Insn::InvokeStatic(self.probes.allocation_probe()))?;
        }

        self.push_identity(sink)?;
        let end = emit_snapshot(&self.layout, self.empty_args, sink)?;
        sink.emit(Insn::InvokeStatic(self.probes.enter_probe()))?;

        self.phase = Phase::Entered;
        Ok(end)
    }

    /// Emits the exit probe for one exit instruction. The instruction itself is
    /// not emitted; the caller keeps it in place right after this sequence.
    pub fn on_method_exit<S: InsnSink + ?Sized>(&mut self, exit: ExitKind, sink: &mut S) -> Result<()> {
        self.expect(Phase::Entered)?;
        self.push_identity(sink)?;
        sink.emit(Insn::PushInt(exit.opcode() as i32))?;
        sink.emit(Insn::InvokeStatic(self.probes.exit_probe()))
    }

    fn push_identity<S: InsnSink + ?Sized>(&self, sink: &mut S) -> Result<()> {
        let ctx = self.context;
        sink.emit(Insn::PushString(ctx.owner().to_string()))?;
        sink.emit(Insn::PushString(ctx.name().to_string()))?;
        sink.emit(Insn::PushString(ctx.descriptor().to_string()))
    }

    fn expect(&self, expected: Phase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::InvalidPhase { expected: expected.name(), actual: self.phase.name() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_kinds_round_trip_their_opcodes() {
        for opcode in 0..=u8::MAX {
            match ExitKind::from_opcode(opcode) {
                Some(kind) => {
                    assert_eq!(kind.opcode(), opcode);
                    assert!(opcodes::is_exit(opcode));
                }
                None => assert!(!opcodes::is_exit(opcode)),
            }
        }
        assert!(ExitKind::Throw.is_abrupt());
        assert!(!ExitKind::VoidReturn.is_abrupt());
    }

    #[test]
    fn phases_only_move_forward() {
        let ctx = MethodContext::new("a/B", "run", "()V", 0).unwrap();
        let probes = ProbeInterface::default();
        let mut inst = EntryExitInstrumentor::new(&ctx, &probes, EmptyArgs::default()).unwrap();
        let mut out = Vec::new();

        assert!(matches!(
            inst.on_method_exit(ExitKind::VoidReturn, &mut out),
            Err(Error::InvalidPhase { expected: "entered", .. })
        ));
        assert!(out.is_empty());

        inst.on_method_enter(&mut out).unwrap();
        assert_eq!(inst.phase(), Phase::Entered);
        assert!(matches!(inst.on_method_enter(&mut out), Err(Error::InvalidPhase { .. })));
        inst.on_method_exit(ExitKind::VoidReturn, &mut out).unwrap();
        inst.on_method_exit(ExitKind::Throw, &mut out).unwrap();
    }
}
