//! IR operations and basic blocks
//!
//! An `Operation` is an opcode with at most one destination and an ordered
//! list of sources. Blocks own their operations; edges are stored as block
//! index lists so the graph never needs back-pointers.

use super::operand::Operand;

/// Basic block identifier (index into the CFG's block arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Condition used by `Compare`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    LessUI,
    LessOrEqualUI,
    GreaterUI,
    GreaterOrEqualUI,
}

impl Comparison {
    /// Evaluate on constant operands (used by constant folding)
    pub fn evaluate(&self, left: u64, right: u64, is_64: bool) -> bool {
        let (sl, sr) = if is_64 {
            (left as i64, right as i64)
        } else {
            (left as u32 as i32 as i64, right as u32 as i32 as i64)
        };
        let (ul, ur) = if is_64 {
            (left, right)
        } else {
            (left as u32 as u64, right as u32 as u64)
        };
        match self {
            Comparison::Equal => ul == ur,
            Comparison::NotEqual => ul != ur,
            Comparison::Less => sl < sr,
            Comparison::LessOrEqual => sl <= sr,
            Comparison::Greater => sl > sr,
            Comparison::GreaterOrEqual => sl >= sr,
            Comparison::LessUI => ul < ur,
            Comparison::LessOrEqualUI => ul <= ur,
            Comparison::GreaterUI => ul > ur,
            Comparison::GreaterOrEqualUI => ul >= ur,
        }
    }
}

/// IR opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Data movement =====
    Copy,
    LoadArgument,

    // ===== Integer arithmetic =====
    Add,
    Subtract,
    Multiply,
    Divide,
    DivideUI,
    Negate,

    // ===== Bitwise =====
    BitwiseAnd,
    BitwiseOr,
    BitwiseExclusiveOr,
    BitwiseNot,
    ShiftLeft,
    ShiftRightSI,
    ShiftRightUI,
    RotateRight,
    CountLeadingZeros,

    // ===== Compare / select =====
    Compare(Comparison),
    ConditionalSelect,

    // ===== Conversions =====
    SignExtend8,
    SignExtend16,
    SignExtend32,
    ZeroExtend8,
    ZeroExtend16,
    ZeroExtend32,
    ConvertI64ToI32,
    ConvertToFP,

    // ===== Memory =====
    Load,
    Load8,
    Load16,
    Store,
    Store8,
    Store16,
    CompareAndSwap,

    // ===== Vector =====
    VectorInsert,
    VectorExtract,
    VectorZero,

    // ===== Calls =====
    Call,
    Tailcall,

    // ===== Control flow =====
    Branch,
    BranchIfTrue,
    BranchIfFalse,
    Return,

    // ===== Runtime integration =====
    Synchronize,

    // ===== SSA =====
    Phi,
}

impl Opcode {
    /// Mnemonic used by the IR dump
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Copy => "copy",
            Opcode::LoadArgument => "load_arg",
            Opcode::Add => "add",
            Opcode::Subtract => "sub",
            Opcode::Multiply => "mul",
            Opcode::Divide => "div",
            Opcode::DivideUI => "divu",
            Opcode::Negate => "neg",
            Opcode::BitwiseAnd => "and",
            Opcode::BitwiseOr => "or",
            Opcode::BitwiseExclusiveOr => "xor",
            Opcode::BitwiseNot => "not",
            Opcode::ShiftLeft => "shl",
            Opcode::ShiftRightSI => "sar",
            Opcode::ShiftRightUI => "shr",
            Opcode::RotateRight => "ror",
            Opcode::CountLeadingZeros => "clz",
            Opcode::Compare(_) => "cmp",
            Opcode::ConditionalSelect => "select",
            Opcode::SignExtend8 => "sext8",
            Opcode::SignExtend16 => "sext16",
            Opcode::SignExtend32 => "sext32",
            Opcode::ZeroExtend8 => "zext8",
            Opcode::ZeroExtend16 => "zext16",
            Opcode::ZeroExtend32 => "zext32",
            Opcode::ConvertI64ToI32 => "trunc",
            Opcode::ConvertToFP => "cvt.fp",
            Opcode::Load => "load",
            Opcode::Load8 => "load8",
            Opcode::Load16 => "load16",
            Opcode::Store => "store",
            Opcode::Store8 => "store8",
            Opcode::Store16 => "store16",
            Opcode::CompareAndSwap => "cas",
            Opcode::VectorInsert => "vinsert",
            Opcode::VectorExtract => "vextract",
            Opcode::VectorZero => "vzero",
            Opcode::Call => "call",
            Opcode::Tailcall => "tailcall",
            Opcode::Branch => "br",
            Opcode::BranchIfTrue => "br.true",
            Opcode::BranchIfFalse => "br.false",
            Opcode::Return => "ret",
            Opcode::Synchronize => "sync",
            Opcode::Phi => "phi",
        }
    }
}

/// One IR instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub opcode: Opcode,
    pub dest: Option<Operand>,
    pub sources: Vec<Operand>,
}

impl Operation {
    pub fn new(opcode: Opcode, dest: Option<Operand>, sources: Vec<Operand>) -> Self {
        Operation { opcode, dest, sources }
    }

    pub fn copy(dest: Operand, source: Operand) -> Self {
        Operation::new(Opcode::Copy, Some(dest), vec![source])
    }

    /// Merge node with one source slot per predecessor, all undefined until filled
    pub fn phi(dest: Operand, predecessor_count: usize) -> Self {
        Operation::new(
            Opcode::Phi,
            Some(dest),
            vec![Operand::undefined(dest.ty); predecessor_count],
        )
    }

    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::Phi
    }

    /// Whether this operation ends a block
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Branch
                | Opcode::BranchIfTrue
                | Opcode::BranchIfFalse
                | Opcode::Return
                | Opcode::Tailcall
        )
    }

    /// Whether control never falls through past this operation
    pub fn is_unconditional_terminator(&self) -> bool {
        matches!(self.opcode, Opcode::Branch | Opcode::Return | Opcode::Tailcall)
    }

    /// Whether this instruction has side effects (can't be dead-code eliminated)
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Store
                | Opcode::Store8
                | Opcode::Store16
                | Opcode::CompareAndSwap
                | Opcode::Call
                | Opcode::Tailcall
                | Opcode::Branch
                | Opcode::BranchIfTrue
                | Opcode::BranchIfFalse
                | Opcode::Return
                | Opcode::Synchronize
                | Opcode::Load
                | Opcode::Load8
                | Opcode::Load16
        )
    }
}

/// A basic block
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub operations: Vec<Operation>,
    pub predecessors: Vec<BlockId>,
    /// Ordered successors; conditional branches store `[fallthrough, taken]`
    pub successors: Vec<BlockId>,
    /// Filled in by dominance analysis; the entry block dominates itself
    pub immediate_dominator: Option<BlockId>,
    pub dominance_frontier: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        BasicBlock {
            id,
            operations: vec![],
            predecessors: vec![],
            successors: vec![],
            immediate_dominator: None,
            dominance_frontier: vec![],
        }
    }

    /// Number of merge nodes at the head of the block
    pub fn phi_count(&self) -> usize {
        self.operations.iter().take_while(|op| op.is_phi()).count()
    }

    pub fn last_operation(&self) -> Option<&Operation> {
        self.operations.last()
    }

    pub fn ends_with_terminator(&self) -> bool {
        self.operations.last().is_some_and(|op| op.is_terminator())
    }

    pub fn ends_with_unconditional(&self) -> bool {
        self.operations.last().is_some_and(|op| op.is_unconditional_terminator())
    }

    /// Append an operation, keeping a trailing terminator last
    pub fn append(&mut self, op: Operation) {
        if self.ends_with_terminator() {
            let at = self.operations.len() - 1;
            self.operations.insert(at, op);
        } else {
            self.operations.push(op);
        }
    }

    /// Insert a merge node after the merge nodes already at the head
    pub fn insert_phi(&mut self, phi: Operation) {
        let at = self.phi_count();
        self.operations.insert(at, phi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::operand::LocalId;
    use crate::ir::types::OperandType;

    fn local(n: u32) -> Operand {
        Operand::local(LocalId(n), OperandType::I64)
    }

    #[test]
    fn test_append_keeps_terminator_last() {
        let mut block = BasicBlock::new(BlockId(0));
        block.operations.push(Operation::new(Opcode::Branch, None, vec![]));
        block.append(Operation::copy(local(0), Operand::const_i64(1)));
        assert_eq!(block.operations.len(), 2);
        assert!(block.ends_with_unconditional());
        assert_eq!(block.operations[0].opcode, Opcode::Copy);
    }

    #[test]
    fn test_insert_phi_is_stable() {
        let mut block = BasicBlock::new(BlockId(0));
        block.operations.push(Operation::copy(local(9), Operand::const_i64(0)));
        block.insert_phi(Operation::phi(local(1), 2));
        block.insert_phi(Operation::phi(local(2), 2));
        assert_eq!(block.phi_count(), 2);
        assert_eq!(block.operations[0].dest, Some(local(1)));
        assert_eq!(block.operations[1].dest, Some(local(2)));
    }

    #[test]
    fn test_comparison_signedness() {
        let minus_one = (-1i32) as u32 as u64;
        assert!(Comparison::Less.evaluate(minus_one, 0, false));
        assert!(!Comparison::LessUI.evaluate(minus_one, 0, false));
        assert!(Comparison::GreaterUI.evaluate(u64::MAX, 1, true));
    }
}
