//! Builds the `Object[]` of boxed arguments passed to the enter probe.
//!
//! Arguments are read straight out of their local slots in declaration
//! order. The array is left on the operand stack, so no local is allocated.

use crate::context::MethodContext;
use crate::descriptor::MethodDescriptor;
use crate::insn::{Insn, InsnSink, MethodRef};
use crate::kind::ValueKind;
use crate::probe::OBJECT_CLASS;
use crate::{Error, Result};

/// Largest slot index, plus one, an argument may occupy.
pub const MAX_ARGUMENT_SLOTS: u32 = 255;

/// Array length used for methods that take no parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyArgs {
    /// A one-element array holding `null`.
    #[default]
    SingleSlot,
    /// A zero-length array.
    Empty,
}

impl EmptyArgs {
    pub fn len(self) -> usize {
        match self {
            EmptyArgs::SingleSlot => 1,
            EmptyArgs::Empty => 0,
        }
    }
}

/// Next local slot to read an argument from.
///
/// Only ever advanced, never reset: each step yields a new cursor moved by the
/// width of the parameter just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotCursor(u16);

impl SlotCursor {
    pub fn starting_at(slot: u16) -> Self {
        Self(slot)
    }

    pub fn slot(self) -> u16 {
        self.0
    }

    pub fn advance(self, kind: ValueKind) -> Self {
        Self(self.0 + kind.slot_width())
    }
}

/// Parameter kinds of one method and the slot the first one lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    kinds: Vec<ValueKind>,
    first_slot: u16,
}

impl ArgumentLayout {
    /// Parses the context's descriptor and checks the slot total against the
    /// JVM's 255-slot argument limit.
    pub fn for_method(context: &MethodContext) -> Result<Self> {
        let descriptor = MethodDescriptor::parse(context.descriptor())?;
        let first_slot = context.first_argument_slot();
        let slots = first_slot as u32 + descriptor.param_slots();
        if slots > MAX_ARGUMENT_SLOTS {
            return Err(Error::TooManyParameterSlots {
                descriptor: context.descriptor().to_string(),
                slots,
            });
        }
        Ok(Self { kinds: descriptor.params, first_slot })
    }

    pub fn kinds(&self) -> &[ValueKind] {
        &self.kinds
    }

    pub fn start(&self) -> SlotCursor {
        SlotCursor::starting_at(self.first_slot)
    }

    /// One past the last slot any argument occupies.
    pub fn end(&self) -> SlotCursor {
        self.kinds.iter().fold(self.start(), |cursor, kind| cursor.advance(*kind))
    }
}

/// Emits `anewarray java/lang/Object` and one `dup; push i; load; box; aastore`
/// group per parameter. Returns the cursor after the last parameter.
pub fn emit_snapshot<S: InsnSink + ?Sized>(
    layout: &ArgumentLayout,
    empty_args: EmptyArgs,
    sink: &mut S,
) -> Result<SlotCursor> {
    let len = match layout.kinds.len() {
        0 => empty_args.len(),
        n => n,
    };
    sink.emit(Insn::PushInt(len as i32))?;
    sink.emit(Insn::NewObjectArray(OBJECT_CLASS.to_string()))?;

    layout
        .kinds
        .iter()
        .enumerate()
        .try_fold(layout.start(), |cursor, (index, kind)| {
            sink.emit(Insn::Dup)?;
            sink.emit(Insn::PushInt(index as i32))?;
            sink.emit(Insn::Load(kind.load(), cursor.slot()))?;
            if let Some(boxing) = kind.boxing() {
                sink.emit(Insn::InvokeStatic(MethodRef::new(
                    boxing.owner,
                    boxing.name,
                    boxing.descriptor,
                )))?;
            }
            sink.emit(Insn::ArrayStoreRef)?;
            Ok(cursor.advance(*kind))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ACC_STATIC;
    use crate::kind::LoadKind;

    fn loads(insns: &[Insn]) -> Vec<(LoadKind, u16)> {
        insns
            .iter()
            .filter_map(|i| match i {
                Insn::Load(kind, slot) => Some((*kind, *slot)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wide_parameters_skew_later_slots() {
        let ctx = MethodContext::new("a/B", "m", "(JID)V", ACC_STATIC).unwrap();
        let layout = ArgumentLayout::for_method(&ctx).unwrap();
        let mut out = Vec::new();
        let end = emit_snapshot(&layout, EmptyArgs::default(), &mut out).unwrap();

        assert_eq!(out[0], Insn::PushInt(3));
        assert_eq!(
            loads(&out),
            vec![(LoadKind::Long, 0), (LoadKind::Int, 2), (LoadKind::Double, 3)]
        );
        assert_eq!(end.slot(), 5);
        assert_eq!(end, layout.end());
    }

    #[test]
    fn instance_methods_skip_the_receiver() {
        let ctx = MethodContext::new("a/B", "m", "(Ljava/lang/String;)V", 0).unwrap();
        let layout = ArgumentLayout::for_method(&ctx).unwrap();
        let mut out = Vec::new();
        emit_snapshot(&layout, EmptyArgs::default(), &mut out).unwrap();
        assert_eq!(loads(&out), vec![(LoadKind::Reference, 1)]);
        assert!(!out.iter().any(|i| matches!(i, Insn::InvokeStatic(_))));
    }

    #[test]
    fn empty_parameter_lists_follow_the_policy() {
        let ctx = MethodContext::new("a/B", "m", "()V", ACC_STATIC).unwrap();
        let layout = ArgumentLayout::for_method(&ctx).unwrap();
        for (policy, len) in [(EmptyArgs::SingleSlot, 1), (EmptyArgs::Empty, 0)] {
            let mut out = Vec::new();
            emit_snapshot(&layout, policy, &mut out).unwrap();
            assert_eq!(out, vec![Insn::PushInt(len), Insn::NewObjectArray(OBJECT_CLASS.into())]);
        }
    }

    #[test]
    fn rejects_more_than_255_argument_slots() {
        let descriptor = format!("({})V", "J".repeat(128));
        let ctx = MethodContext::new("a/B", "m", descriptor.as_str(), 0).unwrap();
        assert!(matches!(
            ArgumentLayout::for_method(&ctx),
            Err(Error::TooManyParameterSlots { slots: 257, .. })
        ));

        let descriptor = format!("({})V", "I".repeat(255));
        let ctx = MethodContext::new("a/B", "m", descriptor.as_str(), ACC_STATIC).unwrap();
        assert!(ArgumentLayout::for_method(&ctx).is_ok());
    }
}
