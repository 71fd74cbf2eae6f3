//! Weaves probe code into a method's `Code` attribute.
//!
//! The new code array is laid out as
//!
//! ```text
//! entry  (exit-probe? insn)*
//! ```
//!
//! Every original instruction keeps its bytes except branches and switches,
//! which are re-encoded at their new position. Each old offset maps to the
//! *prefix start* of its instruction: the first byte of its exit probe if it
//! has one, otherwise the instruction itself. Branch targets, exception
//! ranges, line numbers, local variable ranges and stack map frames all move
//! through that one mapping, so a jump to a `return` also runs its probe.
//!
//! A 16-bit branch pushed out of range by the inserted code is widened:
//! `goto` and `jsr` become `goto_w` and `jsr_w`, a conditional becomes the
//! opposite test skipping over a `goto_w`. Widening moves later code, so
//! placement repeats until no further branch needs it. The instruction after
//! a widened conditional is now a jump target and gets a full stack map frame
//! from [`frames::with_join_frames`].
//!
//! Nothing in `code` changes unless the whole rewrite succeeds. Constants
//! interned before a failure stay in the pool unused.

use tracing::{debug, trace};

use crate::assembler::{Assembled, Assembler};
use crate::bytecode::{self, Instruction, InstructionKind};
use crate::classfile::{
    CodeAttribute, CodeSubAttribute, ConstantPool, ExceptionTableEntry, StackMapFrame,
    VerificationTypeInfo,
};
use crate::frames;
use crate::instrument::{EntryExitInstrumentor, ExitKind};
use crate::{Error, Result};

/// Largest code array the JVM accepts.
pub const MAX_CODE_LENGTH: usize = 65_535;

const TYPE_ANNOTATION_ATTRIBUTES: [&str; 2] =
    ["RuntimeVisibleTypeAnnotations", "RuntimeInvisibleTypeAnnotations"];

/// What a successful rewrite did to one method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteSummary {
    pub entry_len: u32,
    pub exit_probes: usize,
    pub original_len: usize,
    pub code_len: usize,
    pub max_stack: u16,
    pub dropped_attributes: usize,
}

/// Old offset to prefix start, with one extra slot for the end of the code.
struct Layout {
    prefix: Vec<Option<u32>>,
}

impl Layout {
    fn at(&self, old: u32) -> Result<u32> {
        self.prefix
            .get(old as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidBranchTarget { target: old as i64 })
    }

    /// Like [`Layout::at`] but keeps ranges that began at 0 covering the entry code.
    fn range_start(&self, old: u32) -> Result<u32> {
        if old == 0 {
            Ok(0)
        } else {
            self.at(old)
        }
    }

    fn range_end(&self, old_start: u32, old_len: u32) -> Result<u32> {
        self.at(old_start + old_len)
    }
}

/// Where every instruction lands, and which branches use their 32-bit form.
struct Placement {
    layout: Layout,
    starts: Vec<u32>,
    widened: Vec<bool>,
    len: usize,
}

/// Lays out `entry (exit? insn)*`, widening out-of-range branches until
/// every remaining 16-bit branch reaches its target.
fn place(
    insns: &[Instruction<'_>],
    exits: &[Option<Assembled>],
    entry_len: usize,
    code_len: usize,
) -> Result<Placement> {
    let mut widened = vec![false; insns.len()];
    loop {
        // Switch padding depends on the final position, so sizes are taken
        // where each instruction lands.
        let mut prefix = vec![None; code_len + 1];
        let mut starts = Vec::with_capacity(insns.len());
        let mut pos = entry_len;
        for ((insn, exit), wide) in insns.iter().zip(exits).zip(&widened) {
            prefix[insn.offset as usize] = Some(pos as u32);
            if let Some(blob) = exit {
                pos += blob.bytes.len();
            }
            starts.push(pos as u32);
            pos += match insn.widened_size() {
                Some(size) if *wide => size,
                _ => insn.size_at(pos as u32),
            };
            if pos > MAX_CODE_LENGTH {
                return Err(Error::CodeTooLarge { len: pos });
            }
        }
        prefix[code_len] = Some(pos as u32);
        let layout = Layout { prefix };

        let mut grew = false;
        for ((insn, at), wide) in insns.iter().zip(&starts).zip(widened.iter_mut()) {
            if let InstructionKind::Branch { target } = insn.kind {
                let delta = layout.at(target)? as i64 - *at as i64;
                if !*wide && i16::try_from(delta).is_err() {
                    *wide = true;
                    grew = true;
                }
            }
        }
        if !grew {
            return Ok(Placement { layout, starts, widened, len: pos });
        }
    }
}

fn assemble<F>(pool: &mut ConstantPool, emit: F) -> Result<Assembled>
where
    F: FnOnce(&mut Assembler<'_>) -> Result<()>,
{
    let mut asm = Assembler::new(pool);
    emit(&mut asm)?;
    Ok(asm.finish())
}

fn to_u16(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::CodeTooLarge { len: value as usize })
}

/// Rewrites `code` in place with entry and exit probes from `instrumentor`.
pub fn instrument_code(
    code: &mut CodeAttribute,
    pool: &mut ConstantPool,
    instrumentor: &mut EntryExitInstrumentor<'_>,
) -> Result<RewriteSummary> {
    let end = instrumentor.layout().end().slot();
    if end > code.max_locals {
        return Err(Error::SlotOutOfRange { slot: end as u32 - 1, max_locals: code.max_locals });
    }

    let insns = bytecode::decode(&code.code)?;

    let entry = assemble(pool, |asm| instrumentor.on_method_enter(asm).map(|_| ()))?;
    let mut exits: Vec<Option<Assembled>> = Vec::with_capacity(insns.len());
    for insn in &insns {
        let blob = match ExitKind::from_opcode(insn.opcode) {
            Some(kind) => Some(assemble(pool, |asm| instrumentor.on_method_exit(kind, asm))?),
            None => None,
        };
        exits.push(blob);
    }

    let Placement { layout, starts, widened, len } = place(&insns, &exits, entry.bytes.len(), code.code.len())?;
    let joins: Vec<&Instruction<'_>> = insns
        .iter()
        .zip(&widened)
        .filter(|(insn, wide)| **wide && insn.is_conditional())
        .map(|(insn, _)| insn)
        .collect();
    let widened_count = widened.iter().filter(|w| **w).count();
    if widened_count > 0 {
        debug!(method = %instrumentor.context(), branches = widened_count, "widened branches past the 16-bit range");
    }

    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&entry.bytes);
    for (((insn, exit), at), wide) in insns.iter().zip(&exits).zip(&starts).zip(&widened) {
        if let Some(blob) = exit {
            out.extend_from_slice(&blob.bytes);
        }
        if *wide {
            insn.encode_widened(*at, |target| layout.at(target), &mut out)?;
        } else {
            insn.encode(*at, |target| layout.at(target), &mut out)?;
        }
    }
    debug_assert_eq!(out.len(), len);

    let exception_table = code
        .exception_table
        .iter()
        .map(|e| {
            Ok(ExceptionTableEntry {
                start_pc: to_u16(layout.at(e.start_pc as u32)?)?,
                end_pc: to_u16(layout.at(e.end_pc as u32)?)?,
                handler_pc: to_u16(layout.at(e.handler_pc as u32)?)?,
                catch_type: e.catch_type,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut dropped = 0;
    let mut attributes = Vec::with_capacity(code.attributes.len());
    for attr in &code.attributes {
        let mut attr = attr.clone();
        match &mut attr {
            CodeSubAttribute::StackMapTable { entries, .. } => {
                let mut absolute = frames::absolute_offsets(std::mem::take(entries));
                if !joins.is_empty() {
                    absolute = frames::with_join_frames(absolute, &joins, &insns, instrumentor.context(), pool)?;
                }
                *entries = remap_frames(absolute, &layout)?;
            }
            CodeSubAttribute::LineNumberTable { entries, .. } => {
                for e in entries.iter_mut() {
                    e.start_pc = to_u16(layout.range_start(e.start_pc as u32)?)?;
                }
            }
            CodeSubAttribute::LocalVariableTable { entries, .. } => {
                for e in entries.iter_mut() {
                    let start = layout.range_start(e.start_pc as u32)?;
                    let end = layout.range_end(e.start_pc as u32, e.length as u32)?;
                    e.start_pc = to_u16(start)?;
                    e.length = to_u16(end - start)?;
                }
            }
            CodeSubAttribute::LocalVariableTypeTable { entries, .. } => {
                for e in entries.iter_mut() {
                    let start = layout.range_start(e.start_pc as u32)?;
                    let end = layout.range_end(e.start_pc as u32, e.length as u32)?;
                    e.start_pc = to_u16(start)?;
                    e.length = to_u16(end - start)?;
                }
            }
            CodeSubAttribute::Other(raw) => {
                let name = pool.get_utf8(raw.name_index)?;
                if TYPE_ANNOTATION_ATTRIBUTES.contains(&name) {
                    debug!(attribute = name, method = %instrumentor.context(), "dropping code attribute with stale offsets");
                    dropped += 1;
                    continue;
                }
            }
        }
        attributes.push(attr);
    }

    let exit_need = exits.iter().flatten().map(|b| b.max_stack).max().unwrap_or(0) as u32;
    let max_stack = (code.max_stack as u32 + exit_need)
        .max(entry.max_stack as u32)
        .min(u16::MAX as u32) as u16;

    let summary = RewriteSummary {
        entry_len: entry.bytes.len() as u32,
        exit_probes: exits.iter().flatten().count(),
        original_len: code.code.len(),
        code_len: out.len(),
        max_stack,
        dropped_attributes: dropped,
    };

    code.code = out;
    code.max_stack = max_stack;
    code.exception_table = exception_table;
    code.attributes = attributes;

    trace!(method = %instrumentor.context(), ?summary, "rewrote method body");
    Ok(summary)
}

/// Moves each frame from its old absolute offset to the prefix start of the
/// instruction it described and re-derives the deltas.
fn remap_frames(frames: Vec<(u32, StackMapFrame)>, layout: &Layout) -> Result<Vec<StackMapFrame>> {
    let mut new_prev: Option<u32> = None;
    frames
        .into_iter()
        .map(|(old, mut frame)| {
            let new = layout.at(old)?;
            let new_delta = new_prev.map_or(new, |p| new - p - 1);
            new_prev = Some(new);

            for info in frame.verification_types_mut() {
                if let VerificationTypeInfo::Uninitialized(offset) = info {
                    *offset = to_u16(layout.at(*offset as u32)?)?;
                }
            }
            Ok(frame.with_offset_delta(to_u16(new_delta)?))
        })
        .collect()
}

/// Offsets of the exit instructions in `code`, in order.
pub fn exit_offsets(code: &[u8]) -> Result<Vec<u32>> {
    Ok(bytecode::decode(code)?
        .into_iter()
        .filter(Instruction::is_exit)
        .map(|insn| insn.offset)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MethodContext, ACC_STATIC};
    use crate::opcodes::*;
    use crate::probe::ProbeInterface;
    use crate::snapshot::EmptyArgs;

    fn code(bytes: Vec<u8>, max_stack: u16, max_locals: u16) -> CodeAttribute {
        CodeAttribute {
            name_index: 1,
            max_stack,
            max_locals,
            code: bytes,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn backward_jump_to_a_return_runs_its_probe() {
        // 0: goto 3 ; 3: return
        let mut attr = code(vec![GOTO, 0x00, 0x03, RETURN], 0, 0);
        let mut pool = ConstantPool::new();
        let ctx = MethodContext::new("a/B", "run", "()V", ACC_STATIC).unwrap();
        let probes = ProbeInterface::default();
        let mut inst = EntryExitInstrumentor::new(&ctx, &probes, EmptyArgs::default()).unwrap();

        let summary = instrument_code(&mut attr, &mut pool, &mut inst).unwrap();
        assert_eq!(summary.exit_probes, 1);

        let entry = summary.entry_len as usize;
        assert_eq!(attr.code[entry], GOTO);
        let delta = i16::from_be_bytes([attr.code[entry + 1], attr.code[entry + 2]]);
        assert_eq!(delta, 3, "goto lands on the exit probe, not the return");
        assert_eq!(*attr.code.last().unwrap(), RETURN);
        assert_eq!(attr.max_stack, 4);
    }

    #[test]
    fn arguments_past_max_locals_are_rejected() {
        let mut attr = code(vec![RETURN], 0, 1);
        let mut pool = ConstantPool::new();
        let ctx = MethodContext::new("a/B", "run", "(J)V", ACC_STATIC).unwrap();
        let probes = ProbeInterface::default();
        let mut inst = EntryExitInstrumentor::new(&ctx, &probes, EmptyArgs::default()).unwrap();

        let err = instrument_code(&mut attr, &mut pool, &mut inst).unwrap_err();
        assert!(matches!(err, Error::SlotOutOfRange { slot: 1, max_locals: 1 }));
        assert_eq!(attr.code, vec![RETURN]);
    }
}
