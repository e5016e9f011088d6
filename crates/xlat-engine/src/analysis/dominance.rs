//! Dominator analysis
//!
//! Immediate dominators use the Cooper–Harvey–Kennedy iterative algorithm
//! over the graph's post order; dominance frontiers use the standard
//! runner walk from each join point's predecessors.

use super::cfg::ControlFlowGraph;
use crate::ir::instr::BlockId;

/// Compute the immediate dominator of every block
///
/// The entry block's immediate dominator is itself.
pub fn find_dominators(cfg: &mut ControlFlowGraph) {
    let n = cfg.blocks.len();
    if n == 0 {
        return;
    }

    let entry = cfg.entry;
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    idom[entry.index()] = Some(entry);

    let rpo: Vec<BlockId> = cfg.reverse_post_order().collect();

    let mut changed = true;
    while changed {
        changed = false;
        for &block in rpo.iter().skip(1) {
            let mut new_idom = None;
            for &pred in &cfg.blocks[block.index()].predecessors {
                if idom[pred.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, &cfg.post_order_map, current, pred),
                });
            }

            if new_idom.is_some() && idom[block.index()] != new_idom {
                idom[block.index()] = new_idom;
                changed = true;
            }
        }
    }

    for (block, dom) in cfg.blocks.iter_mut().zip(idom) {
        block.immediate_dominator = dom;
    }
}

/// Walk both fingers up the dominator tree until they meet
fn intersect(idom: &[Option<BlockId>], post_order_map: &[usize], mut a: BlockId, mut b: BlockId) -> BlockId {
    while a != b {
        while post_order_map[a.index()] < post_order_map[b.index()] {
            a = idom[a.index()].unwrap_or(a);
        }
        while post_order_map[b.index()] < post_order_map[a.index()] {
            b = idom[b.index()].unwrap_or(b);
        }
    }
    a
}

/// Compute dominance frontiers; requires `find_dominators` to have run
pub fn find_dominance_frontiers(cfg: &mut ControlFlowGraph) {
    for block in &mut cfg.blocks {
        block.dominance_frontier.clear();
    }

    for index in 0..cfg.blocks.len() {
        if cfg.blocks[index].predecessors.len() < 2 {
            continue;
        }
        let join = BlockId(index as u32);
        let Some(join_idom) = cfg.blocks[index].immediate_dominator else {
            continue;
        };

        let preds = cfg.blocks[index].predecessors.clone();
        for pred in preds {
            let mut runner = pred;
            while runner != join_idom {
                let frontier = &mut cfg.blocks[runner.index()].dominance_frontier;
                if !frontier.contains(&join) {
                    frontier.push(join);
                }
                match cfg.blocks[runner.index()].immediate_dominator {
                    Some(next) if next != runner => runner = next,
                    _ => break,
                }
            }
        }
    }
}

/// Whether `a` dominates `b` (every block dominates itself)
pub fn dominates(cfg: &ControlFlowGraph, a: BlockId, b: BlockId) -> bool {
    let mut current = b;
    loop {
        if current == a {
            return true;
        }
        match cfg.blocks[current.index()].immediate_dominator {
            Some(next) if next != current => current = next,
            _ => return false,
        }
    }
}
