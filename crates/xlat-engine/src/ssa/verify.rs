//! SSA form checks used by tests and debug assertions

use rustc_hash::FxHashMap;

use super::SsaError;
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::dominance::{dominates, find_dominators};
use crate::ir::instr::BlockId;
use crate::ir::operand::LocalId;

/// Check single assignment, absence of guest registers and dominance of uses
///
/// A merge-node source counts as a use at the end of the matching predecessor.
pub fn verify(cfg: &ControlFlowGraph) -> Result<(), SsaError> {
    let mut cfg = cfg.clone();
    find_dominators(&mut cfg);

    let mut defs: FxHashMap<LocalId, (BlockId, usize)> = FxHashMap::default();
    for block in &cfg.blocks {
        for (index, op) in block.operations.iter().enumerate() {
            let Some(dest) = op.dest else { continue };
            if dest.is_register() {
                return Err(SsaError::RegisterOperand { block: block.id });
            }
            if let Some(local) = dest.as_local() {
                if defs.insert(local, (block.id, index)).is_some() {
                    return Err(SsaError::MultipleDefinitions(local.0));
                }
            }
        }
    }

    for block in &cfg.blocks {
        for (index, op) in block.operations.iter().enumerate() {
            for (slot, source) in op.sources.iter().enumerate() {
                if source.is_register() {
                    return Err(SsaError::RegisterOperand { block: block.id });
                }
                let Some(local) = source.as_local() else { continue };
                let &(def_block, def_index) = defs.get(&local).ok_or(SsaError::UndefinedLocal(local.0))?;

                let (use_block, use_index) = if op.is_phi() {
                    match block.predecessors.get(slot) {
                        Some(&pred) => (pred, usize::MAX),
                        None => continue,
                    }
                } else {
                    (block.id, index)
                };

                let ok = if def_block == use_block {
                    def_index < use_index
                } else {
                    dominates(&cfg, def_block, use_block)
                };
                if !ok {
                    return Err(SsaError::UndominatedUse { local: local.0, block: use_block });
                }
            }
        }
    }

    Ok(())
}
