//! Class file codec for Java 1.1 through 27.
//!
//! This module reads a `.class` file into a structure the rewriter can edit and
//! writes it back. Only what instrumentation touches is decoded: the constant
//! pool, method `Code` attributes and the offset-bearing attributes nested in
//! them. Everything else is carried as raw bytes, so an unmodified class
//! round-trips byte for byte.

use thiserror::Error;

/// First four bytes of every class file.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Largest number of entries a constant pool can hold (index 0 included).
const MAX_CONSTANT_POOL_COUNT: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<MethodAttribute>,
}

impl MethodInfo {
    /// The method's `Code` attribute, absent for abstract and native methods.
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|a| match a {
            MethodAttribute::Code(code) => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|a| match a {
            MethodAttribute::Code(code) => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }
}

/// An attribute kept as its undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodAttribute {
    Code(CodeAttribute),
    Other(RawAttribute),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub name_index: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<CodeSubAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// Attributes nested in `Code`. The decoded ones all carry bytecode offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeSubAttribute {
    StackMapTable { name_index: u16, entries: Vec<StackMapFrame> },
    LineNumberTable { name_index: u16, entries: Vec<LineNumberEntry> },
    LocalVariableTable { name_index: u16, entries: Vec<LocalVariableTableEntry> },
    LocalVariableTypeTable { name_index: u16, entries: Vec<LocalVariableTypeTableEntry> },
    Other(RawAttribute),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }

    /// Returns the same frame with a new delta, switching between the compact
    /// and extended encodings as the delta requires.
    pub fn with_offset_delta(self, offset_delta: u16) -> Self {
        match self {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => {
                if offset_delta <= 63 {
                    StackMapFrame::Same { offset_delta }
                } else {
                    StackMapFrame::SameExtended { offset_delta }
                }
            }
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => {
                if offset_delta <= 63 {
                    StackMapFrame::SameLocals1StackItem { offset_delta, stack }
                } else {
                    StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
                }
            }
            StackMapFrame::Chop { k, .. } => StackMapFrame::Chop { offset_delta, k },
            StackMapFrame::Append { locals, .. } => StackMapFrame::Append { offset_delta, locals },
            StackMapFrame::Full { locals, stack, .. } => StackMapFrame::Full { offset_delta, locals, stack },
        }
    }

    pub fn verification_types_mut(&mut self) -> impl Iterator<Item = &mut VerificationTypeInfo> {
        let (locals, stack): (&mut [VerificationTypeInfo], &mut [VerificationTypeInfo]) = match self {
            StackMapFrame::Same { .. }
            | StackMapFrame::SameExtended { .. }
            | StackMapFrame::Chop { .. } => (&mut [], &mut []),
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => {
                (&mut [], std::slice::from_mut(stack))
            }
            StackMapFrame::Append { locals, .. } => (locals.as_mut_slice(), &mut []),
            StackMapFrame::Full { locals, stack, .. } => (locals.as_mut_slice(), stack.as_mut_slice()),
        };
        locals.iter_mut().chain(stack.iter_mut())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Carries the offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableTypeTableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub signature_index: u16,
    pub index: u16,
}

// =============================================================================
// CONSTANT POOL
// =============================================================================

/// A `CONSTANT_Utf8` value.
///
/// The exact modified UTF-8 bytes are kept and written back as read, so lone
/// surrogates and overlong forms survive a round trip. The text replaces
/// unpaired surrogates with U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utf8Constant {
    text: String,
    bytes: Vec<u8>,
}

impl Utf8Constant {
    pub fn new(text: &str) -> Self {
        let mut bytes = Vec::with_capacity(text.len());
        encode_modified_utf8(text, &mut bytes);
        Self { text: text.to_string(), bytes }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ClassFileError> {
        Ok(Self { text: decode_modified_utf8(bytes)?, bytes: bytes.to_vec() })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The encoded form as it appears in the class file.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Utf8(Utf8Constant),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl CpInfo {
    fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

/// A resolved `Methodref`, `Fieldref` or `InterfaceMethodref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

/// The constant pool. Slot 0 and the slot after each long/double are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self { entries: vec![None] }
    }

    /// The `constant_pool_count` value: number of slots including slot 0.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(utf8) => Ok(utf8.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Internal name behind a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, ClassFileError> {
        let (class_index, nat_index) = match self.get(index)? {
            CpInfo::Fieldref { class_index, name_and_type_index }
            | CpInfo::Methodref { class_index, name_and_type_index }
            | CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index)
            }
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(index)),
        };
        let (name_index, descriptor_index) = match self.get(nat_index)? {
            CpInfo::NameAndType { name_index, descriptor_index } => (*name_index, *descriptor_index),
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(nat_index)),
        };
        Ok(MemberRef {
            owner: self.class_name(class_index)?,
            name: self.get_utf8(name_index)?,
            descriptor: self.get_utf8(descriptor_index)?,
        })
    }

    /// Iterates over the populated slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &CpInfo)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as u16, e)))
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let constant = Utf8Constant::new(value);
        if let Some(index) = self.position(|e| matches!(e, CpInfo::Utf8(u) if u.bytes == constant.bytes)) {
            return Ok(index);
        }
        self.push(CpInfo::Utf8(constant))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        self.find_or_push(CpInfo::Class { name_index })
    }

    pub fn string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.utf8(value)?;
        self.find_or_push(CpInfo::String { string_index })
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.find_or_push(CpInfo::Integer(value))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        self.find_or_push(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type(name, descriptor)?;
        self.find_or_push(CpInfo::Methodref { class_index, name_and_type_index })
    }

    fn position(&self, pred: impl Fn(&CpInfo) -> bool) -> Option<u16> {
        self.iter().find(|(_, e)| pred(e)).map(|(i, _)| i)
    }

    fn find_or_push(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        match self.position(|e| *e == entry) {
            Some(index) => Ok(index),
            None => self.push(entry),
        }
    }

    fn push(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        let slots = if entry.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > MAX_CONSTANT_POOL_COUNT {
            return Err(ClassFileError::ConstantPoolFull);
        }
        let index = self.entries.len() as u16;
        self.entries.push(Some(entry));
        if slots == 2 {
            self.entries.push(None);
        }
        Ok(index)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("constant pool is full")]
    ConstantPoolFull,
    #[error("{what} is too large to encode ({len})")]
    TooLarge { what: &'static str, len: usize },
    #[error("{0} trailing bytes after class file")]
    TrailingBytes(usize),
}

// =============================================================================
// READING
// =============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        if self.remaining() < 1 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        if self.remaining() < 2 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        if self.remaining() < 4 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_raw_attributes(&mut r)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            methods.push(parse_method(&mut r, &constant_pool)?);
        }

        let attributes = parse_raw_attributes(&mut r)?;

        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Internal name of this class, e.g. `com/acme/Calc`.
    pub fn class_name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Result<&str, ClassFileError> {
        self.constant_pool.get_utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &MethodInfo) -> Result<&str, ClassFileError> {
        self.constant_pool.get_utf8(method.descriptor_index)
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                let bytes = r.read_bytes(len)?;
                CpInfo::Utf8(Utf8Constant::decode(bytes)?)
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
            5 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpInfo::Long(((high << 32) | low) as i64)));
                entries.push(None);
                i += 2;
                continue;
            }
            6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpInfo::Double(f64::from_bits((high << 32) | low))));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        entries.push(Some(entry));
        i += 1;
    }

    Ok(ConstantPool { entries })
}

fn parse_raw_attributes(r: &mut Reader) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attrs.push(RawAttribute { name_index, info });
    }
    Ok(attrs)
}

fn parse_method(r: &mut Reader, cp: &ConstantPool) -> Result<MethodInfo, ClassFileError> {
    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let attributes = parse_raw_attributes(r)?
        .into_iter()
        .map(|raw| match cp.get_utf8(raw.name_index)? {
            "Code" => {
                let mut sub = Reader::new(&raw.info);
                let code = parse_code_attribute(&mut sub, cp, raw.name_index)?;
                expect_consumed(&sub, "Code")?;
                Ok(MethodAttribute::Code(code))
            }
            _ => Ok(MethodAttribute::Other(raw)),
        })
        .collect::<Result<Vec<_>, ClassFileError>>()?;
    Ok(MethodInfo { access_flags, name_index, descriptor_index, attributes })
}

fn expect_consumed(r: &Reader, name: &str) -> Result<(), ClassFileError> {
    if r.remaining() != 0 {
        return Err(ClassFileError::InvalidAttribute(name.to_string()));
    }
    Ok(())
}

fn parse_code_attribute(r: &mut Reader, cp: &ConstantPool, name_index: u16) -> Result<CodeAttribute, ClassFileError> {
    let max_stack = r.read_u2()?;
    let max_locals = r.read_u2()?;
    let code_length = r.read_u4()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let exception_table_length = r.read_u2()? as usize;
    let mut exception_table = Vec::with_capacity(exception_table_length);
    for _ in 0..exception_table_length {
        exception_table.push(ExceptionTableEntry {
            start_pc: r.read_u2()?,
            end_pc: r.read_u2()?,
            handler_pc: r.read_u2()?,
            catch_type: r.read_u2()?,
        });
    }

    let mut attributes = Vec::new();
    for raw in parse_raw_attributes(r)? {
        let name = cp.get_utf8(raw.name_index)?;
        let mut sub = Reader::new(&raw.info);
        let attr = match name {
            "StackMapTable" => CodeSubAttribute::StackMapTable {
                name_index: raw.name_index,
                entries: parse_stack_map_table(&mut sub)?,
            },
            "LineNumberTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LineNumberEntry { start_pc: sub.read_u2()?, line_number: sub.read_u2()? });
                }
                CodeSubAttribute::LineNumberTable { name_index: raw.name_index, entries }
            }
            "LocalVariableTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        descriptor_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                CodeSubAttribute::LocalVariableTable { name_index: raw.name_index, entries }
            }
            "LocalVariableTypeTable" => {
                let num = sub.read_u2()? as usize;
                let mut entries = Vec::with_capacity(num);
                for _ in 0..num {
                    entries.push(LocalVariableTypeTableEntry {
                        start_pc: sub.read_u2()?,
                        length: sub.read_u2()?,
                        name_index: sub.read_u2()?,
                        signature_index: sub.read_u2()?,
                        index: sub.read_u2()?,
                    });
                }
                CodeSubAttribute::LocalVariableTypeTable { name_index: raw.name_index, entries }
            }
            _ => {
                sub.pos = sub.data.len();
                CodeSubAttribute::Other(raw.clone())
            }
        };
        expect_consumed(&sub, name)?;
        attributes.push(attr);
    }

    Ok(CodeAttribute { name_index, max_stack, max_locals, code, exception_table, attributes })
}

fn parse_stack_map_table(r: &mut Reader) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = parse_verification_type_info(r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::Chop { offset_delta, k: 251u8 - frame_type }
            }
            251 => {
                let offset_delta = r.read_u2()?;
                StackMapFrame::SameExtended { offset_delta }
            }
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count { locals.push(parse_verification_type_info(r)?); }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals { locals.push(parse_verification_type_info(r)?); }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack { stack.push(parse_verification_type_info(r)?); }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }
    Ok(entries)
}

fn parse_verification_type_info(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

/// Decodes the JVM's modified UTF-8: NUL is two bytes and supplementary
/// characters are stored as surrogate pairs of three bytes each. Unpaired
/// surrogates, which `javac` emits for literals like `"\uD800"`, become U+FFFD.
fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassFileError> {
    if bytes.iter().all(|b| (0x01..0x80).contains(b)) {
        // All-ASCII fast path; the common case for names and descriptors.
        return std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ClassFileError::InvalidUtf8);
    }

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let continuation = |at: usize| -> Result<u16, ClassFileError> {
            match bytes.get(at) {
                Some(c) if c & 0xC0 == 0x80 => Ok((c & 0x3F) as u16),
                _ => Err(ClassFileError::InvalidUtf8),
            }
        };
        match b {
            0x01..=0x7F => {
                units.push(b as u16);
                i += 1;
            }
            0xC0..=0xDF => {
                units.push(((b & 0x1F) as u16) << 6 | continuation(i + 1)?);
                i += 2;
            }
            0xE0..=0xEF => {
                units.push(((b & 0x0F) as u16) << 12 | continuation(i + 1)? << 6 | continuation(i + 2)?);
                i += 3;
            }
            _ => return Err(ClassFileError::InvalidUtf8),
        }
    }
    Ok(String::from_utf16_lossy(&units))
}

fn encode_modified_utf8(s: &str, out: &mut Vec<u8>) {
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
}

// =============================================================================
// WRITING
// =============================================================================

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u1(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u4(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn count(&mut self, what: &'static str, len: usize) -> Result<(), ClassFileError> {
        let v = u16::try_from(len).map_err(|_| ClassFileError::TooLarge { what, len })?;
        self.u2(v);
        Ok(())
    }

    /// Writes `name_index`, a length placeholder, the body, then patches the length.
    fn attribute(
        &mut self,
        name_index: u16,
        body: impl FnOnce(&mut Writer) -> Result<(), ClassFileError>,
    ) -> Result<(), ClassFileError> {
        self.u2(name_index);
        let len_at = self.buf.len();
        self.u4(0);
        body(self)?;
        let len = self.buf.len() - len_at - 4;
        let len32 = u32::try_from(len).map_err(|_| ClassFileError::TooLarge { what: "attribute", len })?;
        self.buf[len_at..len_at + 4].copy_from_slice(&len32.to_be_bytes());
        Ok(())
    }
}

impl ClassFile {
    /// Serializes the class. An unmodified parse result writes back the exact
    /// input bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut w = Writer::default();
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        write_constant_pool(&mut w, &self.constant_pool)?;
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);

        w.count("interfaces", self.interfaces.len())?;
        for interface in &self.interfaces {
            w.u2(*interface);
        }

        w.count("fields", self.fields.len())?;
        for field in &self.fields {
            w.u2(field.access_flags);
            w.u2(field.name_index);
            w.u2(field.descriptor_index);
            write_raw_attributes(&mut w, &field.attributes)?;
        }

        w.count("methods", self.methods.len())?;
        for method in &self.methods {
            w.u2(method.access_flags);
            w.u2(method.name_index);
            w.u2(method.descriptor_index);
            w.count("attributes", method.attributes.len())?;
            for attr in &method.attributes {
                match attr {
                    MethodAttribute::Code(code) => write_code_attribute(&mut w, code)?,
                    MethodAttribute::Other(raw) => write_raw_attribute(&mut w, raw)?,
                }
            }
        }

        write_raw_attributes(&mut w, &self.attributes)?;
        Ok(w.buf)
    }
}

fn write_constant_pool(w: &mut Writer, cp: &ConstantPool) -> Result<(), ClassFileError> {
    w.count("constant pool", cp.entries.len())?;
    for (_, entry) in cp.iter() {
        match entry {
            CpInfo::Utf8(utf8) => {
                w.u1(1);
                w.count("Utf8 constant", utf8.bytes.len())?;
                w.bytes(&utf8.bytes);
            }
            CpInfo::Integer(v) => { w.u1(3); w.u4(*v as u32); }
            CpInfo::Float(v) => { w.u1(4); w.u4(v.to_bits()); }
            CpInfo::Long(v) => { w.u1(5); w.bytes(&v.to_be_bytes()); }
            CpInfo::Double(v) => { w.u1(6); w.bytes(&v.to_bits().to_be_bytes()); }
            CpInfo::Class { name_index } => { w.u1(7); w.u2(*name_index); }
            CpInfo::String { string_index } => { w.u1(8); w.u2(*string_index); }
            CpInfo::Fieldref { class_index, name_and_type_index } => {
                w.u1(9); w.u2(*class_index); w.u2(*name_and_type_index);
            }
            CpInfo::Methodref { class_index, name_and_type_index } => {
                w.u1(10); w.u2(*class_index); w.u2(*name_and_type_index);
            }
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                w.u1(11); w.u2(*class_index); w.u2(*name_and_type_index);
            }
            CpInfo::NameAndType { name_index, descriptor_index } => {
                w.u1(12); w.u2(*name_index); w.u2(*descriptor_index);
            }
            CpInfo::MethodHandle { reference_kind, reference_index } => {
                w.u1(15); w.u1(*reference_kind); w.u2(*reference_index);
            }
            CpInfo::MethodType { descriptor_index } => { w.u1(16); w.u2(*descriptor_index); }
            CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(17); w.u2(*bootstrap_method_attr_index); w.u2(*name_and_type_index);
            }
            CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(18); w.u2(*bootstrap_method_attr_index); w.u2(*name_and_type_index);
            }
            CpInfo::Module { name_index } => { w.u1(19); w.u2(*name_index); }
            CpInfo::Package { name_index } => { w.u1(20); w.u2(*name_index); }
        }
    }
    Ok(())
}

fn write_raw_attribute(w: &mut Writer, raw: &RawAttribute) -> Result<(), ClassFileError> {
    w.attribute(raw.name_index, |w| {
        w.bytes(&raw.info);
        Ok(())
    })
}

fn write_raw_attributes(w: &mut Writer, attrs: &[RawAttribute]) -> Result<(), ClassFileError> {
    w.count("attributes", attrs.len())?;
    attrs.iter().try_for_each(|raw| write_raw_attribute(w, raw))
}

fn write_code_attribute(w: &mut Writer, code: &CodeAttribute) -> Result<(), ClassFileError> {
    w.attribute(code.name_index, |w| {
        w.u2(code.max_stack);
        w.u2(code.max_locals);
        let len = code.code.len();
        if len == 0 || len > u16::MAX as usize {
            return Err(ClassFileError::TooLarge { what: "code array", len });
        }
        w.u4(len as u32);
        w.bytes(&code.code);

        w.count("exception table", code.exception_table.len())?;
        for e in &code.exception_table {
            w.u2(e.start_pc);
            w.u2(e.end_pc);
            w.u2(e.handler_pc);
            w.u2(e.catch_type);
        }

        w.count("attributes", code.attributes.len())?;
        for attr in &code.attributes {
            write_code_sub_attribute(w, attr)?;
        }
        Ok(())
    })
}

fn write_code_sub_attribute(w: &mut Writer, attr: &CodeSubAttribute) -> Result<(), ClassFileError> {
    match attr {
        CodeSubAttribute::StackMapTable { name_index, entries } => w.attribute(*name_index, |w| {
            w.count("StackMapTable", entries.len())?;
            for frame in entries {
                write_stack_map_frame(w, frame);
            }
            Ok(())
        }),
        CodeSubAttribute::LineNumberTable { name_index, entries } => w.attribute(*name_index, |w| {
            w.count("LineNumberTable", entries.len())?;
            for e in entries {
                w.u2(e.start_pc);
                w.u2(e.line_number);
            }
            Ok(())
        }),
        CodeSubAttribute::LocalVariableTable { name_index, entries } => w.attribute(*name_index, |w| {
            w.count("LocalVariableTable", entries.len())?;
            for e in entries {
                w.u2(e.start_pc);
                w.u2(e.length);
                w.u2(e.name_index);
                w.u2(e.descriptor_index);
                w.u2(e.index);
            }
            Ok(())
        }),
        CodeSubAttribute::LocalVariableTypeTable { name_index, entries } => w.attribute(*name_index, |w| {
            w.count("LocalVariableTypeTable", entries.len())?;
            for e in entries {
                w.u2(e.start_pc);
                w.u2(e.length);
                w.u2(e.name_index);
                w.u2(e.signature_index);
                w.u2(e.index);
            }
            Ok(())
        }),
        CodeSubAttribute::Other(raw) => write_raw_attribute(w, raw),
    }
}

fn write_stack_map_frame(w: &mut Writer, frame: &StackMapFrame) {
    match frame {
        StackMapFrame::Same { offset_delta } => w.u1(*offset_delta as u8),
        StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
            w.u1(64 + *offset_delta as u8);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
            w.u1(247);
            w.u2(*offset_delta);
            write_verification_type_info(w, stack);
        }
        StackMapFrame::Chop { offset_delta, k } => {
            w.u1(251 - *k);
            w.u2(*offset_delta);
        }
        StackMapFrame::SameExtended { offset_delta } => {
            w.u1(251);
            w.u2(*offset_delta);
        }
        StackMapFrame::Append { offset_delta, locals } => {
            w.u1(251 + locals.len() as u8);
            w.u2(*offset_delta);
            locals.iter().for_each(|v| write_verification_type_info(w, v));
        }
        StackMapFrame::Full { offset_delta, locals, stack } => {
            w.u1(255);
            w.u2(*offset_delta);
            w.u2(locals.len() as u16);
            locals.iter().for_each(|v| write_verification_type_info(w, v));
            w.u2(stack.len() as u16);
            stack.iter().for_each(|v| write_verification_type_info(w, v));
        }
    }
}

fn write_verification_type_info(w: &mut Writer, info: &VerificationTypeInfo) {
    match info {
        VerificationTypeInfo::Top => w.u1(0),
        VerificationTypeInfo::Integer => w.u1(1),
        VerificationTypeInfo::Float => w.u1(2),
        VerificationTypeInfo::Double => w.u1(3),
        VerificationTypeInfo::Long => w.u1(4),
        VerificationTypeInfo::Null => w.u1(5),
        VerificationTypeInfo::UninitializedThis => w.u1(6),
        VerificationTypeInfo::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset);
        }
    }
}
