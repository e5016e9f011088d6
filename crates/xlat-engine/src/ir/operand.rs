//! IR operands
//!
//! An operand is a typed reference to a value: a constant, a guest register,
//! an SSA local, a block label, or the undefined sentinel produced when a
//! register is read before any definition reaches it.

use super::types::OperandType;

/// Number of guest integer registers
pub const INT_REGISTER_COUNT: u32 = 32;
/// Number of guest vector registers
pub const VECTOR_REGISTER_COUNT: u32 = 32;
/// Number of guest flag registers
pub const FLAG_REGISTER_COUNT: u32 = 32;

/// Size of the flat register key space used by SSA construction
pub const REGISTER_KEY_COUNT: usize =
    (INT_REGISTER_COUNT + VECTOR_REGISTER_COUNT + FLAG_REGISTER_COUNT) as usize;

/// Register file a guest register belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    Integer,
    Vector,
    Flag,
}

/// A guest register reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub index: u32,
    pub kind: RegisterKind,
}

impl Register {
    pub fn integer(index: u32) -> Self {
        Register { index, kind: RegisterKind::Integer }
    }

    pub fn vector(index: u32) -> Self {
        Register { index, kind: RegisterKind::Vector }
    }

    pub fn flag(index: u32) -> Self {
        Register { index, kind: RegisterKind::Flag }
    }

    /// Type the register is held in across block boundaries
    pub fn natural_type(&self) -> OperandType {
        match self.kind {
            RegisterKind::Integer => OperandType::I64,
            RegisterKind::Vector => OperandType::V128,
            RegisterKind::Flag => OperandType::I32,
        }
    }

    /// Flat key covering integer, vector and flag registers
    pub fn key(&self) -> usize {
        let base = match self.kind {
            RegisterKind::Integer => 0,
            RegisterKind::Vector => INT_REGISTER_COUNT,
            RegisterKind::Flag => INT_REGISTER_COUNT + VECTOR_REGISTER_COUNT,
        };
        (base + self.index) as usize
    }
}

/// SSA local identifier, unique within one translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Label identifying a block that may not have been placed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// What an operand refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Raw constant bits (floats stored by bit pattern)
    Constant(u64),
    /// Guest register, renamed away by SSA construction
    Register(Register),
    /// SSA local
    Local(LocalId),
    /// Block label (branch targets)
    Label(Label),
    /// No reaching definition
    Undefined,
}

/// A typed operand
///
/// Locals are allocated once per translation and never reused, so comparing
/// two local operands compares their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    pub ty: OperandType,
}

impl Operand {
    pub fn const_i32(value: i32) -> Self {
        Operand { kind: OperandKind::Constant(value as u32 as u64), ty: OperandType::I32 }
    }

    pub fn const_i64(value: i64) -> Self {
        Operand { kind: OperandKind::Constant(value as u64), ty: OperandType::I64 }
    }

    pub fn const_u64(value: u64) -> Self {
        Operand { kind: OperandKind::Constant(value), ty: OperandType::I64 }
    }

    pub fn const_f32(value: f32) -> Self {
        Operand { kind: OperandKind::Constant(value.to_bits() as u64), ty: OperandType::F32 }
    }

    pub fn const_f64(value: f64) -> Self {
        Operand { kind: OperandKind::Constant(value.to_bits()), ty: OperandType::F64 }
    }

    pub fn register(reg: Register, ty: OperandType) -> Self {
        Operand { kind: OperandKind::Register(reg), ty }
    }

    pub fn local(id: LocalId, ty: OperandType) -> Self {
        Operand { kind: OperandKind::Local(id), ty }
    }

    pub fn label(label: Label) -> Self {
        Operand { kind: OperandKind::Label(label), ty: OperandType::None }
    }

    pub fn undefined(ty: OperandType) -> Self {
        Operand { kind: OperandKind::Undefined, ty }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, OperandKind::Constant(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, OperandKind::Local(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self.kind, OperandKind::Register(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, OperandKind::Undefined)
    }

    pub fn as_constant(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<Register> {
        match self.kind {
            OperandKind::Register(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn as_local(&self) -> Option<LocalId> {
        match self.kind {
            OperandKind::Local(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<Label> {
        match self.kind {
            OperandKind::Label(label) => Some(label),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            OperandKind::Constant(value) => write!(f, "{:#x}:{}", value, self.ty),
            OperandKind::Register(reg) => match reg.kind {
                RegisterKind::Integer => write!(f, "x{}", reg.index),
                RegisterKind::Vector => write!(f, "v{}", reg.index),
                RegisterKind::Flag => write!(f, "flag{}", reg.index),
            },
            OperandKind::Local(id) => write!(f, "%{}", id.0),
            OperandKind::Label(label) => write!(f, "label{}", label.0),
            OperandKind::Undefined => write!(f, "undef:{}", self.ty),
        }
    }
}
