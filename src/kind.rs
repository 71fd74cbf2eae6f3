//! Value kinds of method parameters and their fixed dispatch table.
//!
//! Each kind maps to a local-slot width, a width-correct load opcode and the
//! wrapper call that boxes it into an `Object`. The table is an exhaustive
//! `match`, so adding a kind without its rules does not compile.

use crate::opcodes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Object or array reference.
    Reference,
}

/// A static `valueOf` call that wraps a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boxing {
    pub owner: &'static str,
    pub name: &'static str,
    pub descriptor: &'static str,
}

impl Boxing {
    const fn value_of(owner: &'static str, descriptor: &'static str) -> Self {
        Self { owner, name: "valueOf", descriptor }
    }
}

/// How a kind is read out of the local-variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl LoadKind {
    /// `iload`-family opcode taking an explicit slot operand.
    pub fn opcode(self) -> u8 {
        match self {
            LoadKind::Int => opcodes::ILOAD,
            LoadKind::Long => opcodes::LLOAD,
            LoadKind::Float => opcodes::FLOAD,
            LoadKind::Double => opcodes::DLOAD,
            LoadKind::Reference => opcodes::ALOAD,
        }
    }

    /// Opcode of the `_0` short form; `_1` to `_3` follow it.
    pub fn short_opcode_base(self) -> u8 {
        match self {
            LoadKind::Int => opcodes::ILOAD_0,
            LoadKind::Long => opcodes::LLOAD_0,
            LoadKind::Float => opcodes::FLOAD_0,
            LoadKind::Double => opcodes::DLOAD_0,
            LoadKind::Reference => opcodes::ALOAD_0,
        }
    }

    /// Operand stack words the loaded value occupies.
    pub fn stack_words(self) -> u16 {
        match self {
            LoadKind::Long | LoadKind::Double => 2,
            LoadKind::Int | LoadKind::Float | LoadKind::Reference => 1,
        }
    }
}

impl ValueKind {
    /// Maps a descriptor type code. Array and object markers are handled by the
    /// descriptor scanner, which reports them as [`ValueKind::Reference`].
    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            b'Z' => ValueKind::Boolean,
            b'B' => ValueKind::Byte,
            b'C' => ValueKind::Char,
            b'S' => ValueKind::Short,
            b'I' => ValueKind::Int,
            b'J' => ValueKind::Long,
            b'F' => ValueKind::Float,
            b'D' => ValueKind::Double,
            b'L' | b'[' => ValueKind::Reference,
            _ => return None,
        };
        Some(kind)
    }

    /// Local-variable slots the value occupies.
    pub fn slot_width(self) -> u16 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            ValueKind::Boolean
            | ValueKind::Byte
            | ValueKind::Char
            | ValueKind::Short
            | ValueKind::Int
            | ValueKind::Float
            | ValueKind::Reference => 1,
        }
    }

    pub fn load(self) -> LoadKind {
        match self {
            ValueKind::Boolean
            | ValueKind::Byte
            | ValueKind::Char
            | ValueKind::Short
            | ValueKind::Int => LoadKind::Int,
            ValueKind::Long => LoadKind::Long,
            ValueKind::Float => LoadKind::Float,
            ValueKind::Double => LoadKind::Double,
            ValueKind::Reference => LoadKind::Reference,
        }
    }

    /// The wrapper call for primitives; `None` for references.
    pub fn boxing(self) -> Option<Boxing> {
        let boxing = match self {
            ValueKind::Boolean => Boxing::value_of("java/lang/Boolean", "(Z)Ljava/lang/Boolean;"),
            ValueKind::Byte => Boxing::value_of("java/lang/Byte", "(B)Ljava/lang/Byte;"),
            ValueKind::Char => Boxing::value_of("java/lang/Character", "(C)Ljava/lang/Character;"),
            ValueKind::Short => Boxing::value_of("java/lang/Short", "(S)Ljava/lang/Short;"),
            ValueKind::Int => Boxing::value_of("java/lang/Integer", "(I)Ljava/lang/Integer;"),
            ValueKind::Long => Boxing::value_of("java/lang/Long", "(J)Ljava/lang/Long;"),
            ValueKind::Float => Boxing::value_of("java/lang/Float", "(F)Ljava/lang/Float;"),
            ValueKind::Double => Boxing::value_of("java/lang/Double", "(D)Ljava/lang/Double;"),
            ValueKind::Reference => return None,
        };
        Some(boxing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_kinds_take_two_slots() {
        let wide: Vec<ValueKind> = b"ZBCSIJFDL"
            .iter()
            .filter_map(|c| ValueKind::from_code(*c))
            .filter(|k| k.slot_width() == 2)
            .collect();
        assert_eq!(wide, vec![ValueKind::Long, ValueKind::Double]);
    }

    #[test]
    fn boxing_descriptor_takes_the_primitive_code() {
        for code in b"ZBCSIJFD" {
            let kind = ValueKind::from_code(*code).unwrap();
            let boxing = kind.boxing().unwrap();
            assert_eq!(boxing.descriptor.as_bytes()[1], *code);
            assert!(boxing.descriptor.ends_with(&format!("L{};", boxing.owner)));
        }
        assert_eq!(ValueKind::Reference.boxing(), None);
    }

    #[test]
    fn sub_int_kinds_load_as_int() {
        assert_eq!(ValueKind::Char.load(), LoadKind::Int);
        assert_eq!(ValueKind::Double.load().stack_words(), 2);
    }
}
