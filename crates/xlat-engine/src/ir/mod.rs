//! Translator IR: typed operands, three-address operations and basic blocks

pub mod types;
pub mod operand;
pub mod instr;
pub mod builder;
pub mod display;

pub use types::OperandType;
pub use operand::{Label, LocalId, Operand, OperandKind, Register, RegisterKind};
pub use instr::{BasicBlock, BlockId, Comparison, Opcode, Operation};
pub use builder::{EmitError, Emitter};
