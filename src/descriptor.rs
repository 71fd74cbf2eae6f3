//! Method descriptor parsing.
//!
//! A single left-to-right scan of `(params)return`, e.g. `(IJ[Ljava/lang/String;)V`.

use crate::kind::ValueKind;
use crate::{Error, Result};

/// Parameter kinds in declaration order plus the return kind (`None` for `V`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<ValueKind>,
    pub ret: Option<ValueKind>,
}

/// One field type inside a method descriptor, e.g. `J` or `[Ljava/lang/String;`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldType<'a> {
    pub kind: ValueKind,
    pub text: &'a str,
}

/// Splits `(params)return` into its field types; the return is `None` for `V`.
pub fn field_types(descriptor: &str) -> Result<(Vec<FieldType<'_>>, Option<FieldType<'_>>)> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(Error::malformed(descriptor, 0, "expected `(`"));
    }

    let mut pos = 1;
    let mut params = Vec::new();
    loop {
        match bytes.get(pos) {
            None => return Err(Error::malformed(descriptor, pos, "unterminated parameter list")),
            Some(b')') => {
                pos += 1;
                break;
            }
            Some(_) => {
                let (param, next) = field_at(descriptor, pos)?;
                params.push(param);
                pos = next;
            }
        }
    }

    let ret = match bytes.get(pos) {
        None => return Err(Error::malformed(descriptor, pos, "missing return type")),
        Some(b'V') => {
            pos += 1;
            None
        }
        Some(_) => {
            let (ret, next) = field_at(descriptor, pos)?;
            pos = next;
            Some(ret)
        }
    };

    if pos != bytes.len() {
        return Err(Error::malformed(descriptor, pos, "trailing characters after return type"));
    }
    Ok((params, ret))
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let (params, ret) = field_types(descriptor)?;
        Ok(Self {
            params: params.into_iter().map(|t| t.kind).collect(),
            ret: ret.map(|t| t.kind),
        })
    }

    /// Local slots the parameters occupy, receiver excluded.
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(|k| k.slot_width() as u32).sum()
    }
}

fn field_at(descriptor: &str, pos: usize) -> Result<(FieldType<'_>, usize)> {
    let (kind, next) = scan_field_type(descriptor, pos)?;
    Ok((FieldType { kind, text: &descriptor[pos..next] }, next))
}

/// Scans one field type starting at `pos`; returns its kind and the next position.
fn scan_field_type(descriptor: &str, pos: usize) -> Result<(ValueKind, usize)> {
    let bytes = descriptor.as_bytes();
    let mut at = pos;
    while bytes.get(at) == Some(&b'[') {
        at += 1;
    }
    let is_array = at > pos;
    if at - pos > 255 {
        return Err(Error::malformed(descriptor, pos, "array has more than 255 dimensions"));
    }

    match bytes.get(at) {
        None => Err(Error::malformed(descriptor, at, "missing array component type")),
        Some(b'L') => {
            let end = bytes[at..]
                .iter()
                .position(|b| *b == b';')
                .map(|i| at + i)
                .ok_or_else(|| Error::malformed(descriptor, at, "unterminated class name"))?;
            if end == at + 1 {
                return Err(Error::malformed(descriptor, at, "empty class name"));
            }
            Ok((ValueKind::Reference, end + 1))
        }
        Some(b'V') => Err(Error::malformed(descriptor, at, "`V` is only valid as a return type")),
        Some(code) => match ValueKind::from_code(*code) {
            Some(_) if is_array => Ok((ValueKind::Reference, at + 1)),
            Some(kind) => Ok((kind, at + 1)),
            None => Err(Error::malformed(descriptor, at, "unrecognized type code")),
        },
    }
}
