//! Byte-level class file builders and probe-event lifting shared by the
//! integration tests.
#![allow(dead_code)]

use jvm_probe_weaver::bytecode::{self, InstructionKind};
use jvm_probe_weaver::classfile::{ClassFile, CodeAttribute, CpInfo, MethodInfo};
use jvm_probe_weaver::insn::{Insn, MethodRef};
use jvm_probe_weaver::kind::LoadKind;
use jvm_probe_weaver::opcodes::*;
use jvm_probe_weaver::probe::{decode_events, ProbeEvent, ProbeInterface};

pub struct CpBuilder {
    pub entries: Vec<Vec<u8>>,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, entry: Vec<u8>) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    /// Test strings are ASCII apart from NUL, which takes its two-byte form.
    pub fn utf8(&mut self, s: &str) -> u16 {
        let encoded: Vec<u8> = s
            .bytes()
            .flat_map(|b| if b == 0 { vec![0xC0, 0x80] } else { vec![b] })
            .collect();
        let mut entry = Vec::new();
        entry.push(1);
        entry.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        entry.extend_from_slice(&encoded);
        self.push(entry)
    }

    /// A Utf8 entry with exactly `encoded` as its body.
    pub fn raw_utf8(&mut self, encoded: &[u8]) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        entry.extend_from_slice(encoded);
        self.push(entry)
    }

    pub fn string(&mut self, utf8_index: u16) -> u16 {
        let mut entry = vec![8];
        entry.extend_from_slice(&utf8_index.to_be_bytes());
        self.push(entry)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut entry = Vec::new();
        entry.push(7);
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry)
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut entry = Vec::new();
        entry.push(12);
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push(entry)
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let nat_index = self.name_and_type(name, descriptor);
        let mut entry = Vec::new();
        entry.push(10);
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&nat_index.to_be_bytes());
        self.push(entry)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = Vec::new();
        entry.push(3);
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = Vec::new();
        entry.push(5);
        entry.extend_from_slice(&value.to_be_bytes());
        let index = self.push(entry);
        // Longs take two slots; the second is never written.
        self.entries.push(Vec::new());
        index
    }
}

pub fn u1(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn push_attr(out: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    u2(out, name_index);
    u4(out, info.len() as u32);
    out.extend_from_slice(info);
}

/// A `Code` attribute body before its name and length are added.
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    /// `(start_pc, end_pc, handler_pc, catch_type)`
    pub exceptions: Vec<(u16, u16, u16, u16)>,
    /// `(name_index, info)`
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl Code {
    pub fn new(max_stack: u16, max_locals: u16, bytes: Vec<u8>) -> Self {
        Self { max_stack, max_locals, bytes, exceptions: Vec::new(), attributes: Vec::new() }
    }

    fn encode(&self) -> Vec<u8> {
        let mut info = Vec::new();
        u2(&mut info, self.max_stack);
        u2(&mut info, self.max_locals);
        u4(&mut info, self.bytes.len() as u32);
        info.extend_from_slice(&self.bytes);
        u2(&mut info, self.exceptions.len() as u16);
        for (start, end, handler, catch) in &self.exceptions {
            u2(&mut info, *start);
            u2(&mut info, *end);
            u2(&mut info, *handler);
            u2(&mut info, *catch);
        }
        u2(&mut info, self.attributes.len() as u16);
        for (name_index, attr) in &self.attributes {
            push_attr(&mut info, *name_index, attr);
        }
        info
    }
}

/// Builds a class with `java/lang/Object` as its superclass.
pub struct ClassBuilder {
    pub cp: CpBuilder,
    this_class: u16,
    super_class: u16,
    code_name: u16,
    methods: Vec<u8>,
    method_count: u16,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let mut cp = CpBuilder::new();
        let this_class = cp.class(name);
        let super_class = cp.class("java/lang/Object");
        let code_name = cp.utf8("Code");
        Self { cp, this_class, super_class, code_name, methods: Vec::new(), method_count: 0 }
    }

    pub fn method(&mut self, access: u16, name: &str, descriptor: &str, code: Option<Code>) -> &mut Self {
        let name_index = self.cp.utf8(name);
        let descriptor_index = self.cp.utf8(descriptor);
        u2(&mut self.methods, access);
        u2(&mut self.methods, name_index);
        u2(&mut self.methods, descriptor_index);
        match code {
            Some(code) => {
                u2(&mut self.methods, 1);
                push_attr(&mut self.methods, self.code_name, &code.encode());
            }
            None => u2(&mut self.methods, 0),
        }
        self.method_count += 1;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        u4(&mut bytes, 0xCAFEBABE);
        u2(&mut bytes, 0);
        u2(&mut bytes, 52);
        u2(&mut bytes, (self.cp.entries.len() + 1) as u16);
        for entry in &self.cp.entries {
            bytes.extend_from_slice(entry);
        }
        u2(&mut bytes, 0x0021);
        u2(&mut bytes, self.this_class);
        u2(&mut bytes, self.super_class);
        u2(&mut bytes, 0);
        u2(&mut bytes, 0);
        u2(&mut bytes, self.method_count);
        bytes.extend_from_slice(&self.methods);
        u2(&mut bytes, 0);
        bytes
    }
}

pub fn find_method<'a>(class: &'a ClassFile, name: &str, descriptor: &str) -> &'a MethodInfo {
    class
        .methods
        .iter()
        .find(|m| {
            class.method_name(m).unwrap() == name && class.method_descriptor(m).unwrap() == descriptor
        })
        .expect("method present")
}

pub fn code_of<'a>(class: &'a ClassFile, name: &str, descriptor: &str) -> &'a CodeAttribute {
    find_method(class, name, descriptor).code().expect("method has code")
}

fn lift(class: &ClassFile, kind: &InstructionKind<'_>, opcode: u8) -> Option<Insn> {
    let InstructionKind::Plain(bytes) = kind else {
        return None;
    };
    let cp = &class.constant_pool;
    let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
    let constant = |index: u16| match cp.get(index).ok()? {
        CpInfo::String { string_index } => Some(Insn::PushString(cp.get_utf8(*string_index).ok()?.to_string())),
        CpInfo::Integer(v) => Some(Insn::PushInt(*v)),
        _ => None,
    };
    const LOADS: [LoadKind; 5] =
        [LoadKind::Int, LoadKind::Long, LoadKind::Float, LoadKind::Double, LoadKind::Reference];

    match opcode {
        0x02..=0x08 => Some(Insn::PushInt(opcode as i32 - ICONST_0 as i32)),
        BIPUSH => Some(Insn::PushInt(bytes[1] as i8 as i32)),
        SIPUSH => Some(Insn::PushInt(u16_at(1) as i16 as i32)),
        LDC => constant(bytes[1] as u16),
        LDC_W => constant(u16_at(1)),
        ILOAD..=ALOAD => Some(Insn::Load(LOADS[(opcode - ILOAD) as usize], bytes[1] as u16)),
        0x1a..=0x2d => {
            let n = opcode - ILOAD_0;
            Some(Insn::Load(LOADS[(n / 4) as usize], (n % 4) as u16))
        }
        WIDE if (ILOAD..=ALOAD).contains(&bytes[1]) => {
            Some(Insn::Load(LOADS[(bytes[1] - ILOAD) as usize], u16_at(2)))
        }
        INVOKESTATIC => {
            let m = cp.member_ref(u16_at(1)).ok()?;
            let probe = m.owner == ProbeInterface::default().owner();
            let boxing = m.owner.starts_with("java/lang/") && m.name == "valueOf";
            (probe || boxing).then(|| Insn::InvokeStatic(MethodRef::new(m.owner, m.name, m.descriptor)))
        }
        ANEWARRAY => Some(Insn::NewObjectArray(cp.class_name(u16_at(1)).ok()?.to_string())),
        DUP => Some(Insn::Dup),
        AASTORE => Some(Insn::ArrayStoreRef),
        _ => None,
    }
}

/// Reads the probe calls a rewritten method makes, in code order.
///
/// Runs of instructions the instrumentor could have emitted are lifted back
/// to [`Insn`]s and decoded; any other instruction ends a run.
pub fn probe_events(class: &ClassFile, code: &[u8]) -> Vec<ProbeEvent> {
    let probes = ProbeInterface::default();
    let mut events = Vec::new();
    let mut run = Vec::new();
    for insn in bytecode::decode(code).expect("decodable code") {
        match lift(class, &insn.kind, insn.opcode) {
            Some(lifted) => run.push(lifted),
            None => {
                events.extend(decode_events(&run, &probes).expect("decodable probe run"));
                run.clear();
            }
        }
    }
    events.extend(decode_events(&run, &probes).expect("decodable probe run"));
    events
}

/// Offsets of `invokestatic` calls to the exit probe.
pub fn exit_probe_calls(class: &ClassFile, code: &[u8]) -> Vec<u32> {
    bytecode::decode(code)
        .unwrap()
        .iter()
        .filter(|insn| insn.opcode == INVOKESTATIC)
        .filter(|insn| {
            let InstructionKind::Plain(bytes) = &insn.kind else { return false };
            let index = u16::from_be_bytes([bytes[1], bytes[2]]);
            class.constant_pool.member_ref(index).unwrap().name == "methodExitProbe"
        })
        .map(|insn| insn.offset)
        .collect()
}
