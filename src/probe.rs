//! The static probe interface instrumented code calls into.
//!
//! Rewritten methods call three static methods on one class:
//!
//! ```text
//! objectAllocationProbe(String owner)
//! methodEnterProbe(String owner, String method, String descriptor, Object[] args)
//! methodExitProbe(String owner, String method, String descriptor, int exitOpcode)
//! ```
//!
//! The class and method names are injected through [`ProbeInterface`], so the
//! same rewriter can target any implementation. The probes must tolerate
//! reentrant and concurrent calls and must not throw into the caller.
//!
//! [`decode_events`] reads a generated [`Insn`] stream back into the
//! [`ProbeEvent`]s it would report.

use crate::insn::{Insn, MethodRef};
use crate::kind::{LoadKind, ValueKind};
use crate::{Error, Result};

pub const DEFAULT_PROBE_CLASS: &str = "instrumentj/StaticProfilerInterface";
pub const DEFAULT_ALLOCATION_PROBE: &str = "objectAllocationProbe";
pub const DEFAULT_ENTER_PROBE: &str = "methodEnterProbe";
pub const DEFAULT_EXIT_PROBE: &str = "methodExitProbe";

pub const ALLOCATION_PROBE_DESC: &str = "(Ljava/lang/String;)V";
pub const ENTER_PROBE_DESC: &str =
    "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;[Ljava/lang/Object;)V";
pub const EXIT_PROBE_DESC: &str = "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;I)V";

/// Element class of the argument snapshot array.
pub const OBJECT_CLASS: &str = "java/lang/Object";

/// Names of the probe class and its three entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInterface {
    owner: String,
    allocation: String,
    enter: String,
    exit: String,
}

impl Default for ProbeInterface {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_CLASS)
    }
}

impl ProbeInterface {
    /// Probe class `owner` with the default method names.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            allocation: DEFAULT_ALLOCATION_PROBE.to_string(),
            enter: DEFAULT_ENTER_PROBE.to_string(),
            exit: DEFAULT_EXIT_PROBE.to_string(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_allocation_probe(mut self, name: impl Into<String>) -> Self {
        self.allocation = name.into();
        self
    }

    pub fn with_enter_probe(mut self, name: impl Into<String>) -> Self {
        self.enter = name.into();
        self
    }

    pub fn with_exit_probe(mut self, name: impl Into<String>) -> Self {
        self.exit = name.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn allocation_probe(&self) -> MethodRef {
        MethodRef::new(&self.owner, &self.allocation, ALLOCATION_PROBE_DESC)
    }

    pub fn enter_probe(&self) -> MethodRef {
        MethodRef::new(&self.owner, &self.enter, ENTER_PROBE_DESC)
    }

    pub fn exit_probe(&self) -> MethodRef {
        MethodRef::new(&self.owner, &self.exit, EXIT_PROBE_DESC)
    }
}

/// Where one element of an argument snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentSource {
    pub slot: u16,
    pub kind: ValueKind,
}

/// One probe call as the instrumented code would make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Allocation {
        owner: String,
    },
    Enter {
        owner: String,
        method: String,
        descriptor: String,
        /// One entry per array element; `None` for elements left null.
        args: Vec<Option<ArgumentSource>>,
    },
    Exit {
        owner: String,
        method: String,
        descriptor: String,
        exit_opcode: i32,
    },
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i32),
    Local(LoadKind, u16),
    Arg(ArgumentSource),
    Array(usize),
}

/// Symbolically executes `insns` and returns the probe calls they make, in order.
///
/// Only the vocabulary the instrumentor emits is understood; anything else is
/// an [`Error::UndecodableProbeSequence`].
pub fn decode_events(insns: &[Insn], probes: &ProbeInterface) -> Result<Vec<ProbeEvent>> {
    let allocation = probes.allocation_probe();
    let enter = probes.enter_probe();
    let exit = probes.exit_probe();

    let mut stack: Vec<Value> = Vec::new();
    let mut arrays: Vec<Vec<Option<ArgumentSource>>> = Vec::new();
    let mut events = Vec::new();

    for (index, insn) in insns.iter().enumerate() {
        let fail = |reason| Error::UndecodableProbeSequence { index, reason };
        let pop = |stack: &mut Vec<Value>| stack.pop().ok_or_else(|| fail("operand stack underflow"));
        let string = |v: Value| match v {
            Value::Str(s) => Ok(s),
            _ => Err(fail("expected a string constant")),
        };

        match insn {
            Insn::PushString(s) => stack.push(Value::Str(s.clone())),
            Insn::PushInt(v) => stack.push(Value::Int(*v)),
            Insn::Load(kind, slot) => stack.push(Value::Local(*kind, *slot)),
            Insn::Dup => {
                let top = stack.last().cloned().ok_or_else(|| fail("operand stack underflow"))?;
                stack.push(top);
            }
            Insn::NewObjectArray(_) => match pop(&mut stack)? {
                Value::Int(len) if len >= 0 => {
                    arrays.push(vec![None; len as usize]);
                    stack.push(Value::Array(arrays.len() - 1));
                }
                _ => return Err(fail("array length is not a constant")),
            },
            Insn::ArrayStoreRef => {
                let value = pop(&mut stack)?;
                let (Value::Int(i), Value::Array(id)) = (pop(&mut stack)?, pop(&mut stack)?) else {
                    return Err(fail("aastore without constant index and array"));
                };
                let source = match value {
                    Value::Arg(source) => source,
                    Value::Local(LoadKind::Reference, slot) => ArgumentSource { slot, kind: ValueKind::Reference },
                    _ => return Err(fail("stored value is not a boxed argument")),
                };
                let cell = arrays[id].get_mut(i as usize).ok_or_else(|| fail("array index out of bounds"))?;
                *cell = Some(source);
            }
            Insn::InvokeStatic(m) if *m == allocation => {
                let owner = string(pop(&mut stack)?)?;
                events.push(ProbeEvent::Allocation { owner });
            }
            Insn::InvokeStatic(m) if *m == enter => {
                let Value::Array(id) = pop(&mut stack)? else {
                    return Err(fail("enter probe without argument array"));
                };
                let descriptor = string(pop(&mut stack)?)?;
                let method = string(pop(&mut stack)?)?;
                let owner = string(pop(&mut stack)?)?;
                events.push(ProbeEvent::Enter { owner, method, descriptor, args: arrays[id].clone() });
            }
            Insn::InvokeStatic(m) if *m == exit => {
                let Value::Int(exit_opcode) = pop(&mut stack)? else {
                    return Err(fail("exit probe without opcode constant"));
                };
                let descriptor = string(pop(&mut stack)?)?;
                let method = string(pop(&mut stack)?)?;
                let owner = string(pop(&mut stack)?)?;
                events.push(ProbeEvent::Exit { owner, method, descriptor, exit_opcode });
            }
            Insn::InvokeStatic(m) => {
                let kind = boxed_kind(m).ok_or_else(|| fail("call is neither a probe nor a boxing call"))?;
                match pop(&mut stack)? {
                    Value::Local(load, slot) if load == kind.load() => {
                        stack.push(Value::Arg(ArgumentSource { slot, kind }));
                    }
                    _ => return Err(fail("boxing call applied to a mismatched value")),
                }
            }
        }
    }

    Ok(events)
}

fn boxed_kind(m: &MethodRef) -> Option<ValueKind> {
    [
        ValueKind::Boolean,
        ValueKind::Byte,
        ValueKind::Char,
        ValueKind::Short,
        ValueKind::Int,
        ValueKind::Long,
        ValueKind::Float,
        ValueKind::Double,
    ]
    .into_iter()
    .find(|k| {
        k.boxing()
            .is_some_and(|b| b.owner == m.owner && b.name == m.name && b.descriptor == m.descriptor)
    })
}
