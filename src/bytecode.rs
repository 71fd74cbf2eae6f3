//! Decoding and re-encoding of method code arrays.
//!
//! [`decode`] turns a `Code` attribute's byte array into [`Instruction`]s with
//! absolute offsets. Branch and switch targets are resolved to absolute
//! offsets so the rewriter can move instructions and re-encode them with
//! [`Instruction::encode`] at their new position.

use crate::opcodes::{self, OperandShape};
use crate::{Error, Result};

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub offset: u32,
    pub opcode: u8,
    pub kind: InstructionKind<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionKind<'a> {
    /// Position-independent instruction; holds its full encoding, opcode included.
    Plain(&'a [u8]),
    Branch { target: u32 },
    WideBranch { target: u32 },
    TableSwitch { default: u32, low: i32, high: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

impl Instruction<'_> {
    pub fn is_exit(&self) -> bool {
        opcodes::is_exit(self.opcode)
    }

    /// Size in bytes when placed at `offset`. Only switches depend on it.
    pub fn size_at(&self, offset: u32) -> usize {
        match &self.kind {
            InstructionKind::Plain(bytes) => bytes.len(),
            InstructionKind::Branch { .. } => 3,
            InstructionKind::WideBranch { .. } => 5,
            InstructionKind::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len()
            }
            InstructionKind::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len()
            }
        }
    }

    /// Size of the 32-bit form of a 16-bit branch: `goto_w`, `jsr_w`, or an
    /// inverted condition jumping over a `goto_w`. `None` for anything else.
    pub fn widened_size(&self) -> Option<usize> {
        match self.kind {
            InstructionKind::Branch { .. } if self.is_conditional() => Some(8),
            InstructionKind::Branch { .. } => Some(5),
            _ => None,
        }
    }

    /// A two-way branch; widening one adds a join point after it.
    pub fn is_conditional(&self) -> bool {
        inverted_condition(self.opcode).is_some()
    }

    /// Every code offset this instruction can transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match &self.kind {
            InstructionKind::Plain(_) => Vec::new(),
            InstructionKind::Branch { target } | InstructionKind::WideBranch { target } => vec![*target],
            InstructionKind::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            InstructionKind::LookupSwitch { default, pairs } => {
                std::iter::once(*default).chain(pairs.iter().map(|(_, t)| *t)).collect()
            }
        }
    }

    /// Appends this instruction as placed at `at`, translating every old
    /// target offset through `resolve`.
    pub fn encode(
        &self,
        at: u32,
        resolve: impl Fn(u32) -> Result<u32>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let relative = |target: u32| -> Result<i64> { Ok(resolve(target)? as i64 - at as i64) };
        match &self.kind {
            InstructionKind::Plain(bytes) => out.extend_from_slice(bytes),
            InstructionKind::Branch { target } => {
                let delta = i16::try_from(relative(*target)?).map_err(|_| Error::BranchOutOfRange {
                    offset: at,
                    target: resolve(*target).unwrap_or(*target),
                })?;
                out.push(self.opcode);
                out.extend_from_slice(&delta.to_be_bytes());
            }
            InstructionKind::WideBranch { target } => {
                out.push(self.opcode);
                out.extend_from_slice(&(relative(*target)? as i32).to_be_bytes());
            }
            InstructionKind::TableSwitch { default, low, high, targets } => {
                out.push(self.opcode);
                out.extend(std::iter::repeat(0).take(switch_padding(at)));
                out.extend_from_slice(&(relative(*default)? as i32).to_be_bytes());
                out.extend_from_slice(&low.to_be_bytes());
                out.extend_from_slice(&high.to_be_bytes());
                for target in targets {
                    out.extend_from_slice(&(relative(*target)? as i32).to_be_bytes());
                }
            }
            InstructionKind::LookupSwitch { default, pairs } => {
                out.push(self.opcode);
                out.extend(std::iter::repeat(0).take(switch_padding(at)));
                out.extend_from_slice(&(relative(*default)? as i32).to_be_bytes());
                out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                for (key, target) in pairs {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&(relative(*target)? as i32).to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Appends the widened form of a 16-bit branch placed at `at`.
    pub fn encode_widened(
        &self,
        at: u32,
        resolve: impl Fn(u32) -> Result<u32>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let InstructionKind::Branch { target } = self.kind else {
            return self.encode(at, resolve, out);
        };
        let target = resolve(target)? as i64;
        match inverted_condition(self.opcode) {
            Some(inverted) => {
                // if!cond +8; goto_w target
                out.push(inverted);
                out.extend_from_slice(&8i16.to_be_bytes());
                out.push(opcodes::GOTO_W);
                out.extend_from_slice(&((target - (at as i64 + 3)) as i32).to_be_bytes());
            }
            None => {
                let wide = if self.opcode == opcodes::JSR { opcodes::JSR_W } else { opcodes::GOTO_W };
                out.push(wide);
                out.extend_from_slice(&((target - at as i64) as i32).to_be_bytes());
            }
        }
        Ok(())
    }
}

/// The opposite test for a conditional branch opcode.
fn inverted_condition(opcode: u8) -> Option<u8> {
    match opcode {
        // ifeq/ifne, iflt/ifge, ... if_acmpeq/if_acmpne come in adjacent pairs
        opcodes::IFEQ..=opcodes::IF_ACMPNE if (opcode - opcodes::IFEQ) % 2 == 0 => Some(opcode + 1),
        opcodes::IFEQ..=opcodes::IF_ACMPNE => Some(opcode - 1),
        opcodes::IFNULL => Some(opcodes::IFNONNULL),
        opcodes::IFNONNULL => Some(opcodes::IFNULL),
        _ => None,
    }
}

/// Zero bytes between a switch opcode at `offset` and its 4-byte aligned operands.
fn switch_padding(offset: u32) -> usize {
    (3 - (offset as usize % 4)) % 4
}

struct Cursor<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(Error::TruncatedInstruction { offset: self.start })?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    fn target(&self, delta: i64) -> Result<u32> {
        let target = self.start as i64 + delta;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(Error::InvalidBranchTarget { target });
        }
        Ok(target as u32)
    }
}

/// Decodes a whole code array.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction<'_>>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        let opcode = code[pos];
        let shape = opcodes::operand_shape(opcode).ok_or(Error::UnknownOpcode { opcode, offset: pos })?;
        let mut c = Cursor { code, start: pos, pos: pos + 1 };

        let kind = match shape {
            OperandShape::Fixed(n) => {
                c.pos += n;
                if c.pos > code.len() {
                    return Err(Error::TruncatedInstruction { offset: pos });
                }
                InstructionKind::Plain(&code[pos..c.pos])
            }
            OperandShape::Wide => {
                let [inner] = c.take::<1>()?;
                c.pos += if inner == opcodes::IINC { 4 } else { 2 };
                if c.pos > code.len() {
                    return Err(Error::TruncatedInstruction { offset: pos });
                }
                InstructionKind::Plain(&code[pos..c.pos])
            }
            OperandShape::Branch16 => {
                let delta = c.i16()?;
                InstructionKind::Branch { target: c.target(delta as i64)? }
            }
            OperandShape::Branch32 => {
                let delta = c.i32()?;
                InstructionKind::WideBranch { target: c.target(delta as i64)? }
            }
            OperandShape::TableSwitch => {
                c.pos += switch_padding(pos as u32);
                let default_delta = c.i32()?;
                let default = c.target(default_delta as i64)?;
                let low = c.i32()?;
                let high = c.i32()?;
                if high < low {
                    return Err(Error::MalformedSwitch { offset: pos });
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count > code.len() {
                    return Err(Error::TruncatedInstruction { offset: pos });
                }
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let delta = c.i32()?;
                    targets.push(c.target(delta as i64)?);
                }
                InstructionKind::TableSwitch { default, low, high, targets }
            }
            OperandShape::LookupSwitch => {
                c.pos += switch_padding(pos as u32);
                let default_delta = c.i32()?;
                let default = c.target(default_delta as i64)?;
                let npairs = c.i32()?;
                if npairs < 0 {
                    return Err(Error::MalformedSwitch { offset: pos });
                }
                if npairs as usize > code.len() {
                    return Err(Error::TruncatedInstruction { offset: pos });
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = c.i32()?;
                    let delta = c.i32()?;
                    pairs.push((key, c.target(delta as i64)?));
                }
                InstructionKind::LookupSwitch { default, pairs }
            }
        };

        out.push(Instruction { offset: pos as u32, opcode, kind });
        pos = c.pos;
    }
    Ok(out)
}
