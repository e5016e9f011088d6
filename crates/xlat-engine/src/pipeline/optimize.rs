//! Optimization passes on SSA-form IR
//!
//! Each pass implements the `OptPass` trait and transforms a graph in place.
//! Passes run only for the high-quality tier, between SSA construction and
//! deconstruction, so every local has exactly one definition.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::{LocalId, Opcode, Operand, OperandKind, OperandType, Operation};

/// An optimization pass on SSA IR
pub trait OptPass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, mutating the graph in place
    fn run(&self, cfg: &mut ControlFlowGraph);
}

/// Optimizer that runs a sequence of passes
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    /// Create an optimizer with the default pass pipeline
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(CopyPropagation),
                Box::new(ConstantFolding),
                Box::new(CopyPropagation),
                Box::new(DeadCodeElimination),
            ],
        }
    }

    /// Create an empty optimizer (no passes)
    pub fn empty() -> Self {
        Optimizer { passes: vec![] }
    }

    /// Add a pass to the pipeline
    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    /// Names of the configured passes, in run order
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run all passes in order
    pub fn optimize(&self, cfg: &mut ControlFlowGraph) {
        for pass in &self.passes {
            pass.run(cfg);
            tracing::trace!(pass = pass.name(), "optimization pass finished");
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Pass 1: Copy Propagation =====

/// Replaces uses of `copy %dest, src` with direct use of `src`.
///
/// Only same-typed copies from a local or constant are propagated; widening
/// and narrowing copies carry a conversion the backend has to see.
pub struct CopyPropagation;

impl OptPass for CopyPropagation {
    fn name(&self) -> &str { "copy-propagation" }

    fn run(&self, cfg: &mut ControlFlowGraph) {
        let mut copies: FxHashMap<LocalId, Operand> = FxHashMap::default();
        for block in &cfg.blocks {
            for op in &block.operations {
                if op.opcode != Opcode::Copy {
                    continue;
                }
                let (Some(dest), Some(src)) = (op.dest, op.sources.first()) else {
                    continue;
                };
                let Some(id) = dest.as_local() else { continue };
                if src.ty == dest.ty && (src.is_local() || src.is_constant()) {
                    copies.insert(id, *src);
                }
            }
        }

        if copies.is_empty() {
            return;
        }

        // Resolve transitive chains: a = b, b = c => a = c
        let resolve = |operand: Operand| -> Operand {
            let mut current = operand;
            let mut depth = 0;
            while let Some(next) = current.as_local().and_then(|id| copies.get(&id)) {
                current = *next;
                depth += 1;
                if depth > 100 {
                    break;
                }
            }
            current
        };

        for block in &mut cfg.blocks {
            for op in &mut block.operations {
                for src in &mut op.sources {
                    if src.is_local() {
                        *src = resolve(*src);
                    }
                }
            }
        }
    }
}

// ===== Pass 2: Constant Folding =====

/// Evaluates integer operations whose sources are all constants and replaces
/// them with a copy of the result.
pub struct ConstantFolding;

impl ConstantFolding {
    fn fold(op: &Operation) -> Option<u64> {
        let dest = op.dest?;
        if !dest.ty.is_integer() {
            return None;
        }
        let is_64 = dest.ty == OperandType::I64;
        let bits = if is_64 { 64 } else { 32 };

        let consts: Option<Vec<u64>> = op.sources.iter().map(|s| s.as_constant()).collect();
        let consts = consts?;

        let value = match (op.opcode, consts.as_slice()) {
            (Opcode::Add, [a, b]) => a.wrapping_add(*b),
            (Opcode::Subtract, [a, b]) => a.wrapping_sub(*b),
            (Opcode::Multiply, [a, b]) => a.wrapping_mul(*b),
            (Opcode::Negate, [a]) => a.wrapping_neg(),
            (Opcode::BitwiseAnd, [a, b]) => a & b,
            (Opcode::BitwiseOr, [a, b]) => a | b,
            (Opcode::BitwiseExclusiveOr, [a, b]) => a ^ b,
            (Opcode::BitwiseNot, [a]) => !a,
            (Opcode::ShiftLeft, [a, b]) => a.wrapping_shl((*b % bits) as u32),
            (Opcode::ShiftRightUI, [a, b]) => {
                let a = if is_64 { *a } else { *a as u32 as u64 };
                a.wrapping_shr((*b % bits) as u32)
            }
            (Opcode::Compare(cond), [a, b]) => {
                let wide = op.sources[0].ty == OperandType::I64;
                cond.evaluate(*a, *b, wide) as u64
            }
            _ => return None,
        };

        Some(if is_64 { value } else { value as u32 as u64 })
    }
}

impl OptPass for ConstantFolding {
    fn name(&self) -> &str { "constant-folding" }

    fn run(&self, cfg: &mut ControlFlowGraph) {
        for block in &mut cfg.blocks {
            for op in &mut block.operations {
                if let Some(value) = Self::fold(op) {
                    if let Some(dest) = op.dest {
                        let constant = Operand {
                            kind: OperandKind::Constant(value),
                            ty: dest.ty,
                        };
                        *op = Operation::copy(dest, constant);
                    }
                }
            }
        }
    }
}

// ===== Pass 3: Dead Code Elimination =====

/// Removes operations whose destination local is never read and which have
/// no side effects. Repeats until nothing else becomes dead.
pub struct DeadCodeElimination;

impl OptPass for DeadCodeElimination {
    fn name(&self) -> &str { "dead-code-elimination" }

    fn run(&self, cfg: &mut ControlFlowGraph) {
        loop {
            let mut used: FxHashSet<LocalId> = FxHashSet::default();
            for block in &cfg.blocks {
                for op in &block.operations {
                    used.extend(op.sources.iter().filter_map(|s| s.as_local()));
                }
            }

            let mut removed = 0;
            for block in &mut cfg.blocks {
                let before = block.operations.len();
                block.operations.retain(|op| {
                    if op.has_side_effects() {
                        return true;
                    }
                    match op.dest.and_then(|d| d.as_local()) {
                        Some(id) => used.contains(&id),
                        None => true,
                    }
                });
                removed += before - block.operations.len();
            }

            if removed == 0 {
                break;
            }
        }
    }
}
