//! IR emission layer
//!
//! `Emitter` builds basic blocks while a guest function is being translated.
//! Every value-producing method appends an operation to the current block and
//! returns its destination. Branches resolve against labels that may be
//! placed later; `finish` turns the emitted blocks into a control-flow graph.

use rustc_hash::{FxHashMap, FxHashSet};

use super::instr::{BasicBlock, BlockId, Comparison, Opcode, Operation};
use super::operand::{Label, LocalId, Operand};
use super::types::OperandType;
use crate::analysis::cfg::ControlFlowGraph;
use crate::runtime::native::{self, NativeHelper};

/// Error during IR emission
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("label{0} was marked twice")]
    LabelAlreadyMarked(u32),
    #[error("label{0} is branched to but never marked")]
    UnplacedLabel(u32),
    #[error("no emitter registered for instruction at {address:#x}")]
    MissingEmitter { address: u64 },
}

/// Builder for the blocks of one translation
pub struct Emitter {
    /// Blocks in creation order; renumbered into placement order by `finish`
    blocks: Vec<BasicBlock>,
    placed: Vec<BlockId>,
    current: Option<BlockId>,
    need_new_block: bool,
    label_blocks: FxHashMap<Label, BlockId>,
    address_labels: FxHashMap<u64, Label>,
    marked: FxHashSet<Label>,
    next_label: u32,
    next_local: u32,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter {
            blocks: Vec::new(),
            placed: Vec::new(),
            current: None,
            need_new_block: true,
            label_blocks: FxHashMap::default(),
            address_labels: FxHashMap::default(),
            marked: FxHashSet::default(),
            next_label: 0,
            next_local: 0,
        }
    }

    // ===== Labels and blocks =====

    /// Label for a guest address, memoized so every reference resolves to the same block
    pub fn get_label(&mut self, guest_address: u64) -> Label {
        if let Some(&label) = self.address_labels.get(&guest_address) {
            return label;
        }
        let label = self.new_label();
        self.address_labels.insert(guest_address, label);
        label
    }

    /// Fresh anonymous label
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Close the current block and continue emitting into the label's block
    pub fn mark_label(&mut self, label: Label) -> Result<(), EmitError> {
        if !self.marked.insert(label) {
            return Err(EmitError::LabelAlreadyMarked(label.0));
        }
        let block = self.block_for_label(label);
        self.link_fallthrough(block);
        self.placed.push(block);
        self.current = Some(block);
        self.need_new_block = false;
        Ok(())
    }

    /// Whether a label has been placed
    pub fn is_marked(&self, label: Label) -> bool {
        self.marked.contains(&label)
    }

    /// Allocate a fresh SSA local
    pub fn new_local(&mut self, ty: OperandType) -> Operand {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        Operand::local(id, ty)
    }

    fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    fn block_for_label(&mut self, label: Label) -> BlockId {
        if let Some(&block) = self.label_blocks.get(&label) {
            return block;
        }
        let block = self.create_block();
        self.label_blocks.insert(label, block);
        block
    }

    /// Connect the current block to `next` unless it ends unconditionally
    fn link_fallthrough(&mut self, next: BlockId) {
        let Some(current) = self.current else { return };
        let block = &mut self.blocks[current.index()];
        if block.ends_with_unconditional() {
            return;
        }
        if block.ends_with_terminator() {
            // Conditional branch: taken edge is already recorded
            block.successors.insert(0, next);
        } else {
            block.successors.push(next);
        }
    }

    fn open_block_if_needed(&mut self) {
        if !self.need_new_block {
            return;
        }
        let block = self.create_block();
        self.link_fallthrough(block);
        self.placed.push(block);
        self.current = Some(block);
        self.need_new_block = false;
    }

    /// Append an operation to the current block, opening one if needed
    pub fn add(&mut self, op: Operation) {
        self.open_block_if_needed();
        let terminates = op.is_terminator();
        if let Some(current) = self.current {
            self.blocks[current.index()].operations.push(op);
        }
        if terminates {
            self.need_new_block = true;
        }
    }

    fn unary(&mut self, opcode: Opcode, ty: OperandType, a: Operand) -> Operand {
        let dest = self.new_local(ty);
        self.add(Operation::new(opcode, Some(dest), vec![a]));
        dest
    }

    fn binary(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        let dest = self.new_local(a.ty);
        self.add(Operation::new(opcode, Some(dest), vec![a, b]));
        dest
    }

    fn branch_to_label(&mut self, label: Label, op: Operation) {
        self.add(op);
        let target = self.block_for_label(label);
        if let Some(current) = self.current {
            self.blocks[current.index()].successors.push(target);
        }
    }

    // ===== Data movement =====

    /// Assign `source` to an explicit destination (guest register or local)
    pub fn copy(&mut self, dest: Operand, source: Operand) -> Operand {
        self.add(Operation::copy(dest, source));
        dest
    }

    /// Copy into a fresh local
    pub fn copy_to_local(&mut self, source: Operand) -> Operand {
        self.unary(Opcode::Copy, source.ty, source)
    }

    pub fn load_argument(&mut self, ty: OperandType, index: u32) -> Operand {
        self.unary(Opcode::LoadArgument, ty, Operand::const_i32(index as i32))
    }

    // ===== Arithmetic =====

    pub fn add_values(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::Add, a, b)
    }

    pub fn subtract(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::Subtract, a, b)
    }

    pub fn multiply(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::Multiply, a, b)
    }

    pub fn divide(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::Divide, a, b)
    }

    pub fn divide_ui(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::DivideUI, a, b)
    }

    pub fn negate(&mut self, a: Operand) -> Operand {
        self.unary(Opcode::Negate, a.ty, a)
    }

    // ===== Bitwise =====

    pub fn bitwise_and(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::BitwiseAnd, a, b)
    }

    pub fn bitwise_or(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::BitwiseOr, a, b)
    }

    pub fn bitwise_xor(&mut self, a: Operand, b: Operand) -> Operand {
        self.binary(Opcode::BitwiseExclusiveOr, a, b)
    }

    pub fn bitwise_not(&mut self, a: Operand) -> Operand {
        self.unary(Opcode::BitwiseNot, a.ty, a)
    }

    pub fn shift_left(&mut self, a: Operand, amount: Operand) -> Operand {
        self.binary(Opcode::ShiftLeft, a, amount)
    }

    pub fn shift_right_si(&mut self, a: Operand, amount: Operand) -> Operand {
        self.binary(Opcode::ShiftRightSI, a, amount)
    }

    pub fn shift_right_ui(&mut self, a: Operand, amount: Operand) -> Operand {
        self.binary(Opcode::ShiftRightUI, a, amount)
    }

    pub fn rotate_right(&mut self, a: Operand, amount: Operand) -> Operand {
        self.binary(Opcode::RotateRight, a, amount)
    }

    pub fn count_leading_zeros(&mut self, a: Operand) -> Operand {
        self.unary(Opcode::CountLeadingZeros, a.ty, a)
    }

    // ===== Compare / select =====

    /// Compare two values; the result is an i32 holding 0 or 1
    pub fn compare(&mut self, a: Operand, b: Operand, cond: Comparison) -> Operand {
        let dest = self.new_local(OperandType::I32);
        self.add(Operation::new(Opcode::Compare(cond), Some(dest), vec![a, b]));
        dest
    }

    pub fn conditional_select(&mut self, cond: Operand, a: Operand, b: Operand) -> Operand {
        let dest = self.new_local(a.ty);
        self.add(Operation::new(Opcode::ConditionalSelect, Some(dest), vec![cond, a, b]));
        dest
    }

    // ===== Conversions =====

    pub fn sign_extend8(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::SignExtend8, ty, a)
    }

    pub fn sign_extend16(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::SignExtend16, ty, a)
    }

    pub fn sign_extend32(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::SignExtend32, ty, a)
    }

    pub fn zero_extend8(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::ZeroExtend8, ty, a)
    }

    pub fn zero_extend16(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::ZeroExtend16, ty, a)
    }

    pub fn zero_extend32(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::ZeroExtend32, ty, a)
    }

    pub fn convert_i64_to_i32(&mut self, a: Operand) -> Operand {
        self.unary(Opcode::ConvertI64ToI32, OperandType::I32, a)
    }

    pub fn convert_to_fp(&mut self, ty: OperandType, a: Operand) -> Operand {
        self.unary(Opcode::ConvertToFP, ty, a)
    }

    // ===== Memory =====

    pub fn load(&mut self, ty: OperandType, address: Operand) -> Operand {
        self.unary(Opcode::Load, ty, address)
    }

    /// Zero-extending byte load
    pub fn load8(&mut self, address: Operand) -> Operand {
        self.unary(Opcode::Load8, OperandType::I32, address)
    }

    /// Zero-extending halfword load
    pub fn load16(&mut self, address: Operand) -> Operand {
        self.unary(Opcode::Load16, OperandType::I32, address)
    }

    pub fn store(&mut self, address: Operand, value: Operand) {
        self.add(Operation::new(Opcode::Store, None, vec![address, value]));
    }

    pub fn store8(&mut self, address: Operand, value: Operand) {
        self.add(Operation::new(Opcode::Store8, None, vec![address, value]));
    }

    pub fn store16(&mut self, address: Operand, value: Operand) {
        self.add(Operation::new(Opcode::Store16, None, vec![address, value]));
    }

    /// Store the low 32 bits of `value`
    pub fn store32(&mut self, address: Operand, value: Operand) {
        let value = if value.ty == OperandType::I64 { self.convert_i64_to_i32(value) } else { value };
        self.add(Operation::new(Opcode::Store, None, vec![address, value]));
    }

    /// Atomic compare-and-swap; returns the value previously in memory
    pub fn compare_and_swap(&mut self, address: Operand, expected: Operand, desired: Operand) -> Operand {
        let dest = self.new_local(expected.ty);
        self.add(Operation::new(
            Opcode::CompareAndSwap,
            Some(dest),
            vec![address, expected, desired],
        ));
        dest
    }

    // ===== Vector =====

    pub fn vector_insert(&mut self, vector: Operand, value: Operand, index: u32) -> Operand {
        let dest = self.new_local(OperandType::V128);
        self.add(Operation::new(
            Opcode::VectorInsert,
            Some(dest),
            vec![vector, value, Operand::const_i32(index as i32)],
        ));
        dest
    }

    pub fn vector_extract(&mut self, ty: OperandType, vector: Operand, index: u32) -> Operand {
        let dest = self.new_local(ty);
        self.add(Operation::new(
            Opcode::VectorExtract,
            Some(dest),
            vec![vector, Operand::const_i32(index as i32)],
        ));
        dest
    }

    pub fn vector_zero(&mut self) -> Operand {
        let dest = self.new_local(OperandType::V128);
        self.add(Operation::new(Opcode::VectorZero, Some(dest), vec![]));
        dest
    }

    // ===== Calls =====

    /// Call a native helper from the process-wide table
    pub fn call(&mut self, helper: NativeHelper, args: &[Operand]) -> Option<Operand> {
        let func = native::lookup(helper);
        self.call_indirect(Operand::const_u64(func.address as u64), func.return_type, args)
    }

    pub fn call_indirect(
        &mut self,
        address: Operand,
        return_type: OperandType,
        args: &[Operand],
    ) -> Option<Operand> {
        let dest = (return_type != OperandType::None).then(|| self.new_local(return_type));
        let mut sources = Vec::with_capacity(args.len() + 1);
        sources.push(address);
        sources.extend_from_slice(args);
        self.add(Operation::new(Opcode::Call, dest, sources));
        dest
    }

    /// Jump to host code without growing the stack
    pub fn tail_call(&mut self, address: Operand, args: &[Operand]) {
        let mut sources = Vec::with_capacity(args.len() + 1);
        sources.push(address);
        sources.extend_from_slice(args);
        self.add(Operation::new(Opcode::Tailcall, None, sources));
    }

    // ===== Control flow =====

    pub fn return_value(&mut self, value: Operand) {
        self.add(Operation::new(Opcode::Return, None, vec![value]));
    }

    pub fn return_void(&mut self) {
        self.add(Operation::new(Opcode::Return, None, vec![]));
    }

    pub fn branch(&mut self, label: Label) {
        self.branch_to_label(label, Operation::new(Opcode::Branch, None, vec![]));
    }

    pub fn branch_if_true(&mut self, label: Label, cond: Operand) {
        self.branch_to_label(label, Operation::new(Opcode::BranchIfTrue, None, vec![cond]));
    }

    pub fn branch_if_false(&mut self, label: Label, cond: Operand) {
        self.branch_to_label(label, Operation::new(Opcode::BranchIfFalse, None, vec![cond]));
    }

    /// Cooperative preemption point
    ///
    /// The backend lowers this to a decrement of the context's sync counter;
    /// at zero it calls the synchronization helper and, if execution must
    /// stop, returns `resume_address` to the dispatcher.
    pub fn synchronize(&mut self, context: Operand, resume_address: u64) {
        self.add(Operation::new(
            Opcode::Synchronize,
            None,
            vec![context, Operand::const_u64(resume_address)],
        ));
    }

    // ===== Finalization =====

    /// Whether the current block already ends in a terminator
    pub fn is_block_closed(&self) -> bool {
        self.current.is_some() && self.need_new_block
    }

    /// Whether control cannot fall out of the current block
    pub fn ends_unconditionally(&self) -> bool {
        self.need_new_block
            && self
                .current
                .is_some_and(|block| self.blocks[block.index()].ends_with_unconditional())
    }

    /// Number of blocks created so far (placed or pending)
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Place blocks in marking order and build the control-flow graph
    pub fn finish(mut self) -> Result<ControlFlowGraph, EmitError> {
        if self.placed.is_empty() {
            self.open_block_if_needed();
        }

        if self.placed.len() != self.blocks.len() {
            let placed: FxHashSet<BlockId> = self.placed.iter().copied().collect();
            let unplaced = self
                .label_blocks
                .iter()
                .find(|(_, block)| !placed.contains(block))
                .map(|(label, _)| label.0)
                .unwrap_or(u32::MAX);
            return Err(EmitError::UnplacedLabel(unplaced));
        }

        let mut remap = vec![BlockId(0); self.blocks.len()];
        for (new_index, old) in self.placed.iter().enumerate() {
            remap[old.index()] = BlockId(new_index as u32);
        }

        let mut slots: Vec<Option<BasicBlock>> = self.blocks.into_iter().map(Some).collect();
        let mut blocks: Vec<BasicBlock> = Vec::with_capacity(slots.len());
        for old in &self.placed {
            if let Some(mut block) = slots[old.index()].take() {
                block.id = remap[old.index()];
                for succ in &mut block.successors {
                    *succ = remap[succ.index()];
                }
                blocks.push(block);
            }
        }

        for index in 0..blocks.len() {
            let succs = blocks[index].successors.clone();
            for succ in succs {
                blocks[succ.index()].predecessors.push(BlockId(index as u32));
            }
        }

        Ok(ControlFlowGraph::new(BlockId(0), blocks, self.next_local))
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::operand::Register;

    fn x(n: u32) -> Operand {
        Operand::register(Register::integer(n), OperandType::I64)
    }

    #[test]
    fn test_labels_memoized_by_address() {
        let mut em = Emitter::new();
        let a = em.get_label(0x1000);
        let b = em.get_label(0x1000);
        let c = em.get_label(0x1004);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let mut em = Emitter::new();
        let sum = em.add_values(x(0), x(1));
        em.copy(x(2), sum);
        em.return_void();
        let cfg = em.finish().unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].operations.len(), 3);
    }

    #[test]
    fn test_emission_after_terminator_opens_block() {
        let mut em = Emitter::new();
        let skip = em.new_label();
        em.branch(skip);
        // Dead code after an unconditional branch lands in its own block
        em.copy(x(0), Operand::const_i64(1));
        em.mark_label(skip).unwrap();
        em.return_void();

        let cfg = em.finish().unwrap();
        // The dead block is unreachable and pruned
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.blocks[0].successors, vec![BlockId(1)]);
    }

    #[test]
    fn test_conditional_branch_successor_order() {
        let mut em = Emitter::new();
        let target = em.new_label();
        let cond = em.compare(x(0), Operand::const_i64(0), Comparison::Equal);
        em.branch_if_true(target, cond);
        em.copy(x(1), Operand::const_i64(1));
        em.mark_label(target).unwrap();
        em.return_void();

        let cfg = em.finish().unwrap();
        assert_eq!(cfg.blocks.len(), 3);
        // [fallthrough, taken]
        assert_eq!(cfg.blocks[0].successors, vec![BlockId(1), BlockId(2)]);
        assert_eq!(cfg.blocks[1].successors, vec![BlockId(2)]);
        assert_eq!(cfg.blocks[2].predecessors, vec![BlockId(0), BlockId(1)]);
    }

    #[test]
    fn test_forward_reference_becomes_real_block() {
        let mut em = Emitter::new();
        let exit = em.get_label(0x2000);
        em.branch(exit);
        em.mark_label(exit).unwrap();
        em.return_value(Operand::const_u64(0x2000));

        let cfg = em.finish().unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert_eq!(cfg.blocks[1].predecessors, vec![BlockId(0)]);
    }

    #[test]
    fn test_mark_label_twice_fails() {
        let mut em = Emitter::new();
        let label = em.new_label();
        em.mark_label(label).unwrap();
        assert!(matches!(em.mark_label(label), Err(EmitError::LabelAlreadyMarked(_))));
    }

    #[test]
    fn test_unplaced_label_fails() {
        let mut em = Emitter::new();
        let nowhere = em.new_label();
        em.branch(nowhere);
        assert!(matches!(em.finish(), Err(EmitError::UnplacedLabel(_))));
    }

    #[test]
    fn test_empty_emitter_yields_entry_block() {
        let cfg = Emitter::new().finish().unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.entry, BlockId(0));
    }
}
