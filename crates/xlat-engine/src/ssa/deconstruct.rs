//! SSA deconstruction
//!
//! Merge nodes are lowered to copies placed at the end of each predecessor.
//! Critical edges are split first so a predecessor's copies only run on the
//! path into the merging block.

use tracing::trace;

use super::parallel_copy::ParallelCopy;
use super::SsaError;
use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::instr::{BlockId, Operation};
use crate::ir::types::OperandType;

/// How merge nodes are lowered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeconstructMode {
    /// One temporary per merge node: `tmp = src` in each predecessor and
    /// `dest = tmp` at the head of the block
    Baseline,
    /// One parallel copy per predecessor, sequenced with a scratch local
    Parallel,
}

/// Remove every merge node from `cfg`
pub fn deconstruct(cfg: &mut ControlFlowGraph, mode: DeconstructMode) -> Result<(), SsaError> {
    let split = cfg.split_critical_edges();
    let mut lowered = 0usize;

    for index in 0..cfg.blocks.len() {
        let phi_count = cfg.blocks[index].phi_count();
        if phi_count == 0 {
            continue;
        }
        let phis: Vec<Operation> = cfg.blocks[index].operations.drain(..phi_count).collect();
        let preds = cfg.blocks[index].predecessors.clone();
        lowered += phis.len();

        match mode {
            DeconstructMode::Baseline => lower_with_temporaries(cfg, index, &phis, &preds),
            DeconstructMode::Parallel => lower_with_parallel_copies(cfg, &phis, &preds)?,
        }
    }

    trace!(?mode, split, lowered, "deconstructed ssa");
    Ok(())
}

fn lower_with_temporaries(cfg: &mut ControlFlowGraph, block: usize, phis: &[Operation], preds: &[BlockId]) {
    let mut head = Vec::with_capacity(phis.len());
    for phi in phis {
        let Some(dest) = phi.dest else { continue };
        let temp = cfg.new_local(dest.ty);
        for (slot, pred) in preds.iter().enumerate() {
            let Some(&source) = phi.sources.get(slot) else { continue };
            if source.is_undefined() {
                continue;
            }
            cfg.blocks[pred.index()].append(Operation::copy(temp, source));
        }
        head.push(Operation::copy(dest, temp));
    }
    cfg.blocks[block].operations.splice(0..0, head);
}

fn lower_with_parallel_copies(
    cfg: &mut ControlFlowGraph,
    phis: &[Operation],
    preds: &[BlockId],
) -> Result<(), SsaError> {
    for (slot, pred) in preds.iter().enumerate() {
        // Locals of different types never alias, so each type sequences independently
        let mut groups: Vec<(OperandType, ParallelCopy)> = Vec::new();
        for phi in phis {
            let Some(dest) = phi.dest else { continue };
            let Some(&source) = phi.sources.get(slot) else { continue };
            if source.is_undefined() {
                continue;
            }
            match groups.iter_mut().find(|(ty, _)| *ty == dest.ty) {
                Some((_, copies)) => copies.add_copy(dest, source),
                None => {
                    let mut copies = ParallelCopy::new();
                    copies.add_copy(dest, source);
                    groups.push((dest.ty, copies));
                }
            }
        }

        for (ty, copies) in groups {
            let scratch = cfg.new_local(ty);
            for op in copies.sequence(scratch)? {
                cfg.blocks[pred.index()].append(op);
            }
        }
    }
    Ok(())
}
