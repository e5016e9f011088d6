//! SSA construction
//!
//! Guest registers are renamed to SSA locals in two passes. The local pass
//! renames every definition and rewrites uses that follow a definition in the
//! same block; it also records each block's outgoing definitions and marks
//! merge obligations on the iterated dominance frontier. The global pass
//! resolves the remaining uses by walking up the dominator tree, creating
//! merge nodes only where a use actually reaches one.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::dominance::{find_dominance_frontiers, find_dominators};
use crate::ir::instr::{BlockId, Operation};
use crate::ir::operand::{Operand, Register};

/// Per-block definition state
#[derive(Default)]
struct DefMap {
    /// Register key -> definition live at the end of the block
    defs: FxHashMap<usize, Operand>,
    /// Register keys that need a merge node at the head of the block
    pending_phis: FxHashSet<usize>,
    /// Register key -> merge node destination, once materialized
    phis: FxHashMap<usize, Operand>,
}

struct SsaBuilder<'a> {
    cfg: &'a mut ControlFlowGraph,
    defs: Vec<DefMap>,
}

/// Rewrite `cfg` into SSA form
///
/// Computes dominators and dominance frontiers first. If the entry block has
/// predecessors a fresh entry is added so no merge node is needed there.
pub fn construct(cfg: &mut ControlFlowGraph) {
    cfg.ensure_entry_without_predecessors();
    find_dominators(cfg);
    find_dominance_frontiers(cfg);

    let block_count = cfg.blocks.len();
    let mut builder = SsaBuilder {
        cfg,
        defs: (0..block_count).map(|_| DefMap::default()).collect(),
    };

    for index in 0..block_count {
        builder.rename_local(BlockId(index as u32));
    }
    for index in 0..block_count {
        builder.resolve_global(BlockId(index as u32));
    }

    trace!(blocks = block_count, locals = builder.cfg.local_count(), "constructed ssa");
}

impl SsaBuilder<'_> {
    /// Local pass over one block
    fn rename_local(&mut self, block: BlockId) {
        let b = block.index();
        let mut local_defs: FxHashMap<usize, (Register, Operand)> = FxHashMap::default();

        let mut i = 0;
        while i < self.cfg.blocks[b].operations.len() {
            let source_count = self.cfg.blocks[b].operations[i].sources.len();
            for s in 0..source_count {
                let source = self.cfg.blocks[b].operations[i].sources[s];
                let Some(reg) = source.as_register() else { continue };
                let Some(&(_, mut def)) = local_defs.get(&reg.key()) else { continue };

                if def.ty != source.ty {
                    let temp = self.cfg.new_local(source.ty);
                    self.cfg.blocks[b].operations.insert(i, Operation::copy(temp, def));
                    i += 1;
                    def = temp;
                }
                self.cfg.blocks[b].operations[i].sources[s] = def;
            }

            let dest = self.cfg.blocks[b].operations[i].dest;
            if let Some(reg) = dest.and_then(|d| d.as_register()) {
                let ty = dest.map(|d| d.ty).unwrap_or(reg.natural_type());
                let local = self.cfg.new_local(ty);
                local_defs.insert(reg.key(), (reg, local));
                self.cfg.blocks[b].operations[i].dest = Some(local);
            }
            i += 1;
        }

        let mut outgoing: Vec<(usize, Register, Operand)> =
            local_defs.into_iter().map(|(key, (reg, def))| (key, reg, def)).collect();
        outgoing.sort_by_key(|(key, _, _)| *key);

        for (key, reg, mut def) in outgoing {
            // Values leave the block in the register's natural type
            if def.ty != reg.natural_type() {
                let widened = self.cfg.new_local(reg.natural_type());
                self.cfg.blocks[b].append(Operation::copy(widened, def));
                def = widened;
            }
            self.defs[b].defs.insert(key, def);
            self.propagate_phi_obligation(block, key);
        }
    }

    /// Mark `key` as needing a merge node on the iterated dominance frontier of `block`
    fn propagate_phi_obligation(&mut self, block: BlockId, key: usize) {
        let mut queue = vec![block];
        while let Some(current) = queue.pop() {
            for &frontier in &self.cfg.blocks[current.index()].dominance_frontier {
                if self.defs[frontier.index()].pending_phis.insert(key) {
                    queue.push(frontier);
                }
            }
        }
    }

    /// Global pass over one block: resolve register uses with no local definition
    fn resolve_global(&mut self, block: BlockId) {
        let b = block.index();
        let mut i = 0;
        while i < self.cfg.blocks[b].operations.len() {
            if self.cfg.blocks[b].operations[i].is_phi() {
                i += 1;
                continue;
            }

            let source_count = self.cfg.blocks[b].operations[i].sources.len();
            for s in 0..source_count {
                let source = self.cfg.blocks[b].operations[i].sources[s];
                let Some(reg) = source.as_register() else { continue };

                let phis_before = self.cfg.blocks[b].phi_count();
                let mut def = self.find_def(block, reg);
                // Merge nodes materialized in this block shift the current operation
                i += self.cfg.blocks[b].phi_count() - phis_before;

                if def.is_undefined() {
                    def = Operand::undefined(source.ty);
                } else if def.ty != source.ty {
                    let temp = self.cfg.new_local(source.ty);
                    self.cfg.blocks[b].operations.insert(i, Operation::copy(temp, def));
                    i += 1;
                    def = temp;
                }
                self.cfg.blocks[b].operations[i].sources[s] = def;
            }
            i += 1;
        }
    }

    /// Value of `reg` at the head of `block`
    fn find_def(&mut self, block: BlockId, reg: Register) -> Operand {
        if self.defs[block.index()].pending_phis.contains(&reg.key()) {
            return self.materialize_phi(block, reg);
        }
        match self.cfg.blocks[block.index()].immediate_dominator {
            Some(idom) if idom != block => self.find_def_on_pred(idom, reg),
            _ => Operand::undefined(reg.natural_type()),
        }
    }

    /// Value of `reg` at the end of `block`, walking up the dominator tree
    fn find_def_on_pred(&mut self, block: BlockId, reg: Register) -> Operand {
        let key = reg.key();
        let mut current = block;
        loop {
            let defs = &self.defs[current.index()];
            if let Some(&def) = defs.defs.get(&key) {
                return def;
            }
            if defs.pending_phis.contains(&key) {
                return self.materialize_phi(current, reg);
            }
            match self.cfg.blocks[current.index()].immediate_dominator {
                Some(idom) if idom != current => current = idom,
                _ => return Operand::undefined(reg.natural_type()),
            }
        }
    }

    /// Create the merge node for `reg` in `block`, or return the existing one
    fn materialize_phi(&mut self, block: BlockId, reg: Register) -> Operand {
        let key = reg.key();
        if let Some(&phi) = self.defs[block.index()].phis.get(&key) {
            return phi;
        }

        let local = self.cfg.new_local(reg.natural_type());
        let preds = self.cfg.blocks[block.index()].predecessors.clone();
        self.cfg.blocks[block.index()].insert_phi(Operation::phi(local, preds.len()));
        // Registered before resolving sources so cycles through this block stop here
        self.defs[block.index()].phis.insert(key, local);

        for (slot, pred) in preds.into_iter().enumerate() {
            let source = self.find_def_on_pred(pred, reg);
            let ops = &mut self.cfg.blocks[block.index()].operations;
            if let Some(phi) = ops.iter_mut().find(|op| op.is_phi() && op.dest == Some(local)) {
                phi.sources[slot] = source;
            }
        }
        local
    }
}
