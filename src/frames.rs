//! Stack map frames for join points the rewriter creates.
//!
//! Widening a conditional branch turns it into `if!cond +8; goto_w target`,
//! which makes the instruction after it a jump target that needs its own
//! frame. The state there is found by replaying the straight-line code from
//! the closest existing frame, at the level of verification types.

use crate::bytecode::{Instruction, InstructionKind};
use crate::classfile::{ConstantPool, CpInfo, StackMapFrame, VerificationTypeInfo as V};
use crate::context::MethodContext;
use crate::descriptor::field_types;
use crate::opcodes;
use crate::{Error, Result};

/// Result types of the `int`, `long`, `float`, `double` opcode groups.
const NUMERIC: [V; 4] = [V::Integer, V::Long, V::Float, V::Double];

/// Results of `i2l` through `i2s`.
const CONVERSIONS: [V; 15] = [
    V::Long,
    V::Float,
    V::Double,
    V::Integer,
    V::Float,
    V::Double,
    V::Integer,
    V::Long,
    V::Double,
    V::Integer,
    V::Long,
    V::Float,
    V::Integer,
    V::Integer,
    V::Integer,
];

fn is_wide(v: V) -> bool {
    matches!(v, V::Long | V::Double)
}

/// Locals and operand stack in frame form: a `long` or `double` is one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameState {
    pub locals: Vec<V>,
    pub stack: Vec<V>,
}

impl FrameState {
    /// The implicit frame at offset 0.
    pub fn initial(context: &MethodContext, pool: &mut ConstantPool) -> Result<Self> {
        let mut locals = Vec::new();
        if !context.is_static() {
            if context.is_constructor() && context.owner() != "java/lang/Object" {
                locals.push(V::UninitializedThis);
            } else {
                locals.push(V::Object(pool.class(context.owner())?));
            }
        }
        let (params, _) = field_types(context.descriptor())?;
        for param in params {
            locals.push(type_of(param.text, pool)?);
        }
        Ok(Self { locals, stack: Vec::new() })
    }

    /// The state described by `frame` at absolute `offset`, with `self` as the
    /// previous frame's state.
    pub fn apply(&self, frame: &StackMapFrame, offset: u32) -> Result<Self> {
        let mut locals = self.locals.clone();
        let stack = match frame {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => Vec::new(),
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => vec![*stack],
            StackMapFrame::Chop { k, .. } => {
                let k = *k as usize;
                if k > locals.len() {
                    return Err(Error::FrameInference { offset, reason: "chop frame removes missing locals" });
                }
                locals.truncate(locals.len() - k);
                Vec::new()
            }
            StackMapFrame::Append { locals: added, .. } => {
                locals.extend_from_slice(added);
                Vec::new()
            }
            StackMapFrame::Full { locals: full, stack, .. } => {
                locals = full.clone();
                stack.clone()
            }
        };
        Ok(Self { locals, stack })
    }

    pub fn to_full_frame(&self) -> StackMapFrame {
        StackMapFrame::Full { offset_delta: 0, locals: self.locals.clone(), stack: self.stack.clone() }
    }
}

/// Pairs each frame with its absolute code offset.
pub fn absolute_offsets(frames: Vec<StackMapFrame>) -> Vec<(u32, StackMapFrame)> {
    let mut prev: Option<u32> = None;
    frames
        .into_iter()
        .map(|frame| {
            let delta = frame.offset_delta() as u32;
            let at = prev.map_or(delta, |p| p + delta + 1);
            prev = Some(at);
            (at, frame)
        })
        .collect()
}

/// Adds a frame after every branch in `branches` that lacks one.
///
/// Frames are in absolute old offsets. The original frame that follows an
/// inserted one is rewritten as a full frame, since compact frames are
/// relative to whatever frame precedes them.
pub fn with_join_frames(
    frames: Vec<(u32, StackMapFrame)>,
    branches: &[&Instruction<'_>],
    insns: &[Instruction<'_>],
    context: &MethodContext,
    pool: &mut ConstantPool,
) -> Result<Vec<(u32, StackMapFrame)>> {
    let missing: Vec<&Instruction<'_>> = branches
        .iter()
        .copied()
        .filter(|b| !frames.iter().any(|(at, _)| *at == fallthrough(b)))
        .collect();
    if missing.is_empty() {
        return Ok(frames);
    }

    let initial = FrameState::initial(context, pool)?;
    let mut states = Vec::with_capacity(frames.len());
    let mut state = initial.clone();
    for (at, frame) in &frames {
        state = state.apply(frame, *at)?;
        states.push(state.clone());
    }

    let this_class = pool.class(context.owner())?;
    let mut joins = Vec::with_capacity(missing.len());
    for branch in missing {
        let (from, start) = match frames.iter().rposition(|(at, _)| *at <= branch.offset) {
            Some(i) => (frames[i].0, &states[i]),
            None => (0, &initial),
        };
        let mut machine = Machine::new(start, insns, this_class, pool);
        for insn in insns.iter().filter(|i| i.offset >= from && i.offset <= branch.offset) {
            machine.execute(insn)?;
        }
        joins.push((fallthrough(branch), machine.into_state()));
    }

    let mut merged: Vec<(u32, StackMapFrame, Option<FrameState>)> = frames
        .into_iter()
        .zip(states)
        .map(|((at, frame), state)| (at, frame, Some(state)))
        .chain(joins.into_iter().map(|(at, state)| (at, state.to_full_frame(), None)))
        .collect();
    merged.sort_by_key(|(at, _, _)| *at);

    let mut after_join = false;
    Ok(merged
        .into_iter()
        .map(|(at, frame, original)| match original {
            None => {
                after_join = true;
                (at, frame)
            }
            Some(state) => {
                let frame = if after_join { state.to_full_frame() } else { frame };
                after_join = false;
                (at, frame)
            }
        })
        .collect())
}

/// Old offset of the instruction after a 16-bit branch.
fn fallthrough(branch: &Instruction<'_>) -> u32 {
    branch.offset + 3
}

/// Internal name for a field type: `La/B;` is `a/B`, arrays keep their descriptor.
fn class_name(text: &str) -> &str {
    text.strip_prefix('L').and_then(|t| t.strip_suffix(';')).unwrap_or(text)
}

fn type_of(text: &str, pool: &mut ConstantPool) -> Result<V> {
    let v = match text.as_bytes().first() {
        Some(b'Z' | b'B' | b'C' | b'S' | b'I') => V::Integer,
        Some(b'F') => V::Float,
        Some(b'J') => V::Long,
        Some(b'D') => V::Double,
        Some(b'L' | b'[') => V::Object(pool.class(class_name(text))?),
        _ => return Err(Error::malformed(text, 0, "not a field type")),
    };
    Ok(v)
}

/// Verification-type interpreter over straight-line code.
///
/// Locals are held one entry per slot and the stack one entry per word; the
/// second half of a `long` or `double` is `Top`.
struct Machine<'a, 'p> {
    pool: &'p mut ConstantPool,
    insns: &'a [Instruction<'a>],
    this_class: u16,
    locals: Vec<V>,
    stack: Vec<V>,
    offset: u32,
}

impl<'a, 'p> Machine<'a, 'p> {
    fn new(start: &FrameState, insns: &'a [Instruction<'a>], this_class: u16, pool: &'p mut ConstantPool) -> Self {
        let spread = |entries: &[V]| {
            let mut words = Vec::with_capacity(entries.len());
            for v in entries {
                words.push(*v);
                if is_wide(*v) {
                    words.push(V::Top);
                }
            }
            words
        };
        Self {
            pool,
            insns,
            this_class,
            locals: spread(&start.locals),
            stack: spread(&start.stack),
            offset: 0,
        }
    }

    fn into_state(self) -> FrameState {
        let pack = |words: &[V]| {
            let mut entries = Vec::with_capacity(words.len());
            let mut i = 0;
            while i < words.len() {
                entries.push(words[i]);
                i += if is_wide(words[i]) { 2 } else { 1 };
            }
            entries
        };
        let mut locals = pack(&self.locals);
        while locals.last() == Some(&V::Top) {
            locals.pop();
        }
        FrameState { locals, stack: pack(&self.stack) }
    }

    fn fail(&self, reason: &'static str) -> Error {
        Error::FrameInference { offset: self.offset, reason }
    }

    fn push(&mut self, v: V) {
        self.stack.push(v);
        if is_wide(v) {
            self.stack.push(V::Top);
        }
    }

    fn pop(&mut self) -> Result<V> {
        match self.stack.pop() {
            Some(V::Top) => self.stack.pop().ok_or_else(|| self.fail("operand stack underflow")),
            Some(v) => Ok(v),
            None => Err(self.fail("operand stack underflow")),
        }
    }

    fn pop_words(&mut self, n: usize) -> Result<()> {
        if self.stack.len() < n {
            return Err(self.fail("operand stack underflow"));
        }
        self.stack.truncate(self.stack.len() - n);
        Ok(())
    }

    /// Copies the top `words` and inserts them `depth` words down.
    fn dup(&mut self, words: usize, depth: usize) -> Result<()> {
        let len = self.stack.len();
        if len < depth {
            return Err(self.fail("operand stack underflow"));
        }
        let copied = self.stack[len - words..].to_vec();
        self.stack.splice(len - depth..len - depth, copied);
        Ok(())
    }

    fn replace(&mut self, pops: usize, result: V) -> Result<()> {
        for _ in 0..pops {
            self.pop()?;
        }
        self.push(result);
        Ok(())
    }

    fn load(&mut self, slot: usize) -> Result<()> {
        let v = *self.locals.get(slot).ok_or_else(|| self.fail("load from an unset local"))?;
        self.push(v);
        Ok(())
    }

    fn store(&mut self, slot: usize) -> Result<()> {
        let v = self.pop()?;
        let width = if is_wide(v) { 2 } else { 1 };
        if self.locals.len() < slot + width {
            self.locals.resize(slot + width, V::Top);
        }
        if slot > 0 && is_wide(self.locals[slot - 1]) {
            self.locals[slot - 1] = V::Top;
        }
        self.locals[slot] = v;
        if width == 2 {
            self.locals[slot + 1] = V::Top;
        }
        Ok(())
    }

    fn class(&mut self, name: &str) -> Result<V> {
        Ok(V::Object(self.pool.class(name)?))
    }

    fn name_and_type_descriptor(&self, index: u16) -> Result<String> {
        match self.pool.get(index)? {
            CpInfo::NameAndType { descriptor_index, .. } => Ok(self.pool.get_utf8(*descriptor_index)?.to_string()),
            _ => Err(self.fail("expected a NameAndType constant")),
        }
    }

    fn constant(&mut self, index: u16) -> Result<V> {
        let name = match self.pool.get(index)?.clone() {
            CpInfo::Integer(_) => return Ok(V::Integer),
            CpInfo::Float(_) => return Ok(V::Float),
            CpInfo::Long(_) => return Ok(V::Long),
            CpInfo::Double(_) => return Ok(V::Double),
            CpInfo::String { .. } => "java/lang/String",
            CpInfo::Class { .. } => "java/lang/Class",
            CpInfo::MethodType { .. } => "java/lang/invoke/MethodType",
            CpInfo::MethodHandle { .. } => "java/lang/invoke/MethodHandle",
            CpInfo::Dynamic { name_and_type_index, .. } => {
                let descriptor = self.name_and_type_descriptor(name_and_type_index)?;
                return type_of(&descriptor, self.pool);
            }
            _ => return Err(self.fail("ldc of a constant that cannot be loaded")),
        };
        self.class(name)
    }

    fn field(&mut self, index: u16) -> Result<V> {
        let descriptor = self.pool.member_ref(index)?.descriptor.to_string();
        type_of(&descriptor, self.pool)
    }

    fn invoke(&mut self, index: u16, has_receiver: bool) -> Result<()> {
        let (name, descriptor) = match self.pool.get(index)? {
            CpInfo::InvokeDynamic { name_and_type_index, .. } => {
                let nat = *name_and_type_index;
                (String::new(), self.name_and_type_descriptor(nat)?)
            }
            _ => {
                let m = self.pool.member_ref(index)?;
                (m.name.to_string(), m.descriptor.to_string())
            }
        };
        let (params, ret) = field_types(&descriptor)?;
        self.pop_words(params.iter().map(|p| p.kind.slot_width() as usize).sum())?;

        if has_receiver {
            let receiver = self.pop()?;
            if name == "<init>" {
                let initialized = match receiver {
                    V::UninitializedThis => V::Object(self.this_class),
                    V::Uninitialized(at) => V::Object(self.allocated_class(at as u32)?),
                    _ => return Err(self.fail("constructor call on an initialized value")),
                };
                for v in self.locals.iter_mut().chain(self.stack.iter_mut()) {
                    if *v == receiver {
                        *v = initialized;
                    }
                }
            }
        }
        if let Some(ret) = ret {
            let v = type_of(ret.text, self.pool)?;
            self.push(v);
        }
        Ok(())
    }

    /// Class operand of the `new` instruction at `offset`.
    fn allocated_class(&self, offset: u32) -> Result<u16> {
        self.insns
            .iter()
            .find(|i| i.offset == offset && i.opcode == opcodes::NEW)
            .and_then(|i| match i.kind {
                InstructionKind::Plain(bytes) => Some(u16::from_be_bytes([bytes[1], bytes[2]])),
                _ => None,
            })
            .ok_or_else(|| self.fail("uninitialized value without its `new`"))
    }

    fn execute(&mut self, insn: &Instruction<'_>) -> Result<()> {
        self.offset = insn.offset;
        let bytes = match insn.kind {
            InstructionKind::Plain(bytes) => bytes,
            InstructionKind::Branch { .. } => {
                return match insn.opcode {
                    opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => self.pop_words(1),
                    opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => self.pop_words(2),
                    _ => Err(self.fail("jump inside straight-line code")),
                };
            }
            _ => return Err(self.fail("jump inside straight-line code")),
        };
        let u1 = || bytes[1] as usize;
        let u2 = || u16::from_be_bytes([bytes[1], bytes[2]]);

        let op = insn.opcode;
        match op {
            0x00 => {}
            0x01 => self.push(V::Null),
            0x02..=0x08 | opcodes::BIPUSH | opcodes::SIPUSH => self.push(V::Integer),
            0x09 | 0x0a => self.push(V::Long),
            0x0b..=0x0d => self.push(V::Float),
            0x0e | 0x0f => self.push(V::Double),
            opcodes::LDC => {
                let v = self.constant(bytes[1] as u16)?;
                self.push(v);
            }
            opcodes::LDC_W | 0x14 => {
                let v = self.constant(u2())?;
                self.push(v);
            }
            opcodes::ILOAD..=opcodes::ALOAD => self.load(u1())?,
            0x1a..=0x2d => self.load(((op - opcodes::ILOAD_0) % 4) as usize)?,
            // iaload .. saload
            0x2e..=0x31 | 0x33..=0x35 => {
                let element = match op {
                    0x2e | 0x33..=0x35 => V::Integer,
                    0x2f => V::Long,
                    0x30 => V::Float,
                    _ => V::Double,
                };
                self.replace(2, element)?;
            }
            // aaload
            0x32 => {
                self.pop()?;
                let element = match self.pop()? {
                    V::Null => V::Null,
                    V::Object(index) => {
                        let name = self.pool.class_name(index)?.to_string();
                        let component = name.strip_prefix('[').ok_or_else(|| self.fail("aaload from a non-array"))?;
                        type_of(component, self.pool)?
                    }
                    _ => return Err(self.fail("aaload from a non-array")),
                };
                self.push(element);
            }
            0x36..=0x3a => self.store(u1())?,
            0x3b..=0x4e => self.store(((op - 0x3b) % 4) as usize)?,
            // iastore .. sastore
            0x4f..=0x56 => {
                for _ in 0..3 {
                    self.pop()?;
                }
            }
            0x57 => self.pop_words(1)?,
            0x58 => self.pop_words(2)?,
            opcodes::DUP => self.dup(1, 1)?,
            0x5a => self.dup(1, 2)?,
            0x5b => self.dup(1, 3)?,
            0x5c => self.dup(2, 2)?,
            0x5d => self.dup(2, 3)?,
            0x5e => self.dup(2, 4)?,
            0x5f => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.fail("operand stack underflow"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            0x60..=0x73 => self.replace(2, NUMERIC[((op - 0x60) % 4) as usize])?,
            0x74..=0x77 => self.replace(1, NUMERIC[((op - 0x74) % 4) as usize])?,
            // shifts take an int count on top of the value
            0x78..=0x7d => self.replace(2, NUMERIC[((op - 0x78) % 2) as usize])?,
            0x7e..=0x83 => self.replace(2, NUMERIC[((op - 0x7e) % 2) as usize])?,
            opcodes::IINC => {}
            0x85..=0x93 => self.replace(1, CONVERSIONS[(op - 0x85) as usize])?,
            0x94..=0x98 => self.replace(2, V::Integer)?,
            0xb2 => {
                let v = self.field(u2())?;
                self.push(v);
            }
            0xb3 => {
                self.pop()?;
            }
            0xb4 => {
                self.pop()?;
                let v = self.field(u2())?;
                self.push(v);
            }
            0xb5 => {
                self.pop()?;
                self.pop()?;
            }
            0xb6 | 0xb7 | 0xb9 => self.invoke(u2(), true)?,
            opcodes::INVOKESTATIC | 0xba => self.invoke(u2(), false)?,
            opcodes::NEW => self.push(V::Uninitialized(insn.offset as u16)),
            // newarray
            0xbc => {
                let name = match bytes[1] {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    _ => return Err(self.fail("unknown newarray type")),
                };
                self.pop()?;
                let v = self.class(name)?;
                self.push(v);
            }
            opcodes::ANEWARRAY => {
                let element = self.pool.class_name(u2())?.to_string();
                let name = if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                };
                self.pop()?;
                let v = self.class(&name)?;
                self.push(v);
            }
            0xbe | 0xc1 => self.replace(1, V::Integer)?,
            0xc0 => self.replace(1, V::Object(u2()))?,
            0xc2 | 0xc3 => {
                self.pop()?;
            }
            opcodes::WIDE => {
                let slot = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
                match bytes[1] {
                    opcodes::ILOAD..=opcodes::ALOAD => self.load(slot)?,
                    0x36..=0x3a => self.store(slot)?,
                    opcodes::IINC => {}
                    _ => return Err(self.fail("wide ret inside straight-line code")),
                }
            }
            0xc5 => {
                self.pop_words(bytes[3] as usize)?;
                self.push(V::Object(u2()));
            }
            _ => return Err(self.fail("control transfer inside straight-line code")),
        }
        Ok(())
    }
}
