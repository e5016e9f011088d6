//! IR type system
//!
//! Every operand carries one of these primitive tags. The backend only needs
//! the width and class (integer, float, vector) to pick registers.

/// IR operand type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandType {
    /// No value (void call, branch)
    None,
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// 128-bit vector
    V128,
}

impl OperandType {
    /// Whether this type lives in an integer register
    pub fn is_integer(&self) -> bool {
        matches!(self, OperandType::I32 | OperandType::I64)
    }

    /// Whether this type lives in a floating-point/vector register
    pub fn is_float_or_vector(&self) -> bool {
        matches!(self, OperandType::F32 | OperandType::F64 | OperandType::V128)
    }

    /// Size of a value of this type in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            OperandType::None => 0,
            OperandType::I32 | OperandType::F32 => 4,
            OperandType::I64 | OperandType::F64 => 8,
            OperandType::V128 => 16,
        }
    }
}

impl std::fmt::Display for OperandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperandType::None => write!(f, "none"),
            OperandType::I32 => write!(f, "i32"),
            OperandType::I64 => write!(f, "i64"),
            OperandType::F32 => write!(f, "f32"),
            OperandType::F64 => write!(f, "f64"),
            OperandType::V128 => write!(f, "v128"),
        }
    }
}
