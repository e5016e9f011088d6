//! Guest register transfer between the execution context and IR registers
//!
//! Inside a translation guest registers are plain IR registers that SSA
//! construction renames away. This pass makes them agree with the
//! `ExecutionContext`: a new entry block loads every register the function
//! touches, registers the function writes are stored back before every exit,
//! and calls and preemption points are bracketed by a store and a reload
//! because other guest code may run there.

use tracing::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::operand::REGISTER_KEY_COUNT;
use crate::ir::{BasicBlock, BlockId, Opcode, Operand, OperandType, Operation, Register};
use crate::runtime::context::ExecutionContext;

/// Registers touched by a function, in key order
struct RegisterUsage {
    touched: Vec<Register>,
    written: Vec<Register>,
}

impl RegisterUsage {
    fn collect(cfg: &ControlFlowGraph) -> Self {
        let mut seen: Vec<Option<Register>> = vec![None; REGISTER_KEY_COUNT];
        let mut defined = vec![false; REGISTER_KEY_COUNT];

        for block in &cfg.blocks {
            for op in &block.operations {
                for reg in op.sources.iter().filter_map(|s| s.as_register()) {
                    seen[reg.key()] = Some(reg);
                }
                if let Some(reg) = op.dest.and_then(|d| d.as_register()) {
                    seen[reg.key()] = Some(reg);
                    defined[reg.key()] = true;
                }
            }
        }

        let touched: Vec<Register> = seen.iter().flatten().copied().collect();
        let written = touched.iter().copied().filter(|reg| defined[reg.key()]).collect();
        RegisterUsage { touched, written }
    }
}

struct Transfer<'a> {
    cfg: &'a mut ControlFlowGraph,
    context: Operand,
}

impl Transfer<'_> {
    fn field_address(&mut self, reg: Register, out: &mut Vec<Operation>) -> Operand {
        let address = self.cfg.new_local(OperandType::I64);
        let offset = Operand::const_u64(ExecutionContext::register_offset(reg) as u64);
        out.push(Operation::new(Opcode::Add, Some(address), vec![self.context, offset]));
        address
    }

    fn load(&mut self, regs: &[Register], out: &mut Vec<Operation>) {
        for &reg in regs {
            let ty = reg.natural_type();
            let address = self.field_address(reg, out);
            let value = self.cfg.new_local(ty);
            out.push(Operation::new(Opcode::Load, Some(value), vec![address]));
            out.push(Operation::copy(Operand::register(reg, ty), value));
        }
    }

    fn store(&mut self, regs: &[Register], out: &mut Vec<Operation>) {
        for &reg in regs {
            let address = self.field_address(reg, out);
            let value = Operand::register(reg, reg.natural_type());
            out.push(Operation::new(Opcode::Store, None, vec![address, value]));
        }
    }
}

/// Load guest registers on entry and store them back around calls and exits
///
/// Returns the number of registers transferred; the graph is left untouched
/// when the function uses no guest register.
pub fn insert_context_transfers(cfg: &mut ControlFlowGraph) -> usize {
    let usage = RegisterUsage::collect(cfg);
    if usage.touched.is_empty() || cfg.is_empty() {
        return 0;
    }

    let old_entry = cfg.entry;
    let entry = BlockId(cfg.blocks.len() as u32);
    let context = cfg.new_local(OperandType::I64);
    let mut transfer = Transfer { cfg, context };

    let mut prologue = vec![Operation::new(
        Opcode::LoadArgument,
        Some(context),
        vec![Operand::const_i32(0)],
    )];
    transfer.load(&usage.touched, &mut prologue);
    prologue.push(Operation::new(Opcode::Branch, None, vec![]));

    for index in 0..transfer.cfg.blocks.len() {
        let operations = std::mem::take(&mut transfer.cfg.blocks[index].operations);
        let mut rewritten = Vec::with_capacity(operations.len());
        for op in operations {
            match op.opcode {
                Opcode::Call | Opcode::Synchronize => {
                    transfer.store(&usage.written, &mut rewritten);
                    rewritten.push(op);
                    transfer.load(&usage.touched, &mut rewritten);
                }
                Opcode::Return | Opcode::Tailcall => {
                    transfer.store(&usage.written, &mut rewritten);
                    rewritten.push(op);
                }
                _ => rewritten.push(op),
            }
        }
        transfer.cfg.blocks[index].operations = rewritten;
    }

    let cfg = transfer.cfg;
    let mut block = BasicBlock::new(entry);
    block.operations = prologue;
    block.successors.push(old_entry);
    cfg.blocks.push(block);
    cfg.blocks[old_entry.index()].predecessors.push(entry);
    cfg.entry = entry;
    cfg.update();

    trace!(
        touched = usage.touched.len(),
        written = usage.written.len(),
        "inserted context transfers"
    );
    usage.touched.len()
}
