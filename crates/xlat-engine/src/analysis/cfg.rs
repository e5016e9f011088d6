//! Control-flow graph over emitted basic blocks
//!
//! Blocks live in an arena indexed by `BlockId`; edges are index lists on the
//! blocks themselves. The graph keeps a post-order array and its inverse map,
//! rebuilt by `update()` after every structural change.

use tracing::trace;

use crate::ir::instr::{BasicBlock, BlockId, Opcode, Operation};
use crate::ir::operand::{LocalId, Operand};
use crate::ir::types::OperandType;

/// Error during CFG manipulation
#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    #[error("no edge {pred} -> {succ}")]
    EdgeNotFound { pred: BlockId, succ: BlockId },
}

/// A control-flow graph of reachable blocks
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub entry: BlockId,
    pub blocks: Vec<BasicBlock>,
    /// Blocks in post order (entry last)
    pub post_order: Vec<BlockId>,
    /// Inverse of `post_order`: block index -> position
    pub post_order_map: Vec<usize>,
    local_count: u32,
}

impl ControlFlowGraph {
    /// Build a graph, dropping blocks not reachable from `entry`
    ///
    /// Survivors keep their relative order and are renumbered densely.
    pub fn new(entry: BlockId, blocks: Vec<BasicBlock>, local_count: u32) -> Self {
        let (entry, blocks) = remove_unreachable(entry, blocks);
        let mut cfg = ControlFlowGraph {
            entry,
            blocks,
            post_order: Vec::new(),
            post_order_map: Vec::new(),
            local_count,
        };
        cfg.update();
        cfg
    }

    /// Recompute post order and its inverse map
    pub fn update(&mut self) {
        let n = self.blocks.len();
        let mut visited = vec![false; n];
        let mut post_order = Vec::with_capacity(n);
        let mut stack: Vec<(BlockId, usize)> = Vec::new();

        if n > 0 {
            visited[self.entry.index()] = true;
            stack.push((self.entry, 0));
        }

        while let Some(top) = stack.last_mut() {
            let (block, next) = *top;
            let succs = &self.blocks[block.index()].successors;
            if next < succs.len() {
                top.1 += 1;
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                post_order.push(block);
                stack.pop();
            }
        }

        let mut post_order_map = vec![usize::MAX; n];
        for (position, block) in post_order.iter().enumerate() {
            post_order_map[block.index()] = position;
        }

        self.post_order = post_order;
        self.post_order_map = post_order_map;
    }

    /// Blocks in reverse post order (entry first)
    pub fn reverse_post_order(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.post_order.iter().rev().copied()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn successors(&self, id: BlockId) -> &[BlockId] {
        &self.blocks[id.index()].successors
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.blocks[id.index()].predecessors
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of locals allocated so far
    pub fn local_count(&self) -> u32 {
        self.local_count
    }

    /// Allocate a fresh SSA local
    pub fn new_local(&mut self, ty: OperandType) -> Operand {
        let id = LocalId(self.local_count);
        self.local_count += 1;
        Operand::local(id, ty)
    }

    /// Give the graph an entry block with no incoming edges
    ///
    /// When the entry is a loop header a fresh block falling into it becomes
    /// the new entry. Returns whether a block was added.
    pub fn ensure_entry_without_predecessors(&mut self) -> bool {
        if self.blocks.is_empty() || self.blocks[self.entry.index()].predecessors.is_empty() {
            return false;
        }

        let old_entry = self.entry;
        let entry = BlockId(self.blocks.len() as u32);
        let mut block = BasicBlock::new(entry);
        block.operations.push(Operation::new(Opcode::Branch, None, vec![]));
        block.successors.push(old_entry);
        self.blocks.push(block);
        self.blocks[old_entry.index()].predecessors.push(entry);
        self.entry = entry;

        trace!(%entry, %old_entry, "added entry block");
        self.update();
        true
    }

    /// Insert a new block on the edge `pred -> succ`
    ///
    /// The new block takes `pred`'s slot in `succ.predecessors`, so merge-node
    /// sources in `succ` stay aligned with their predecessors.
    pub fn split_edge(&mut self, pred: BlockId, succ: BlockId) -> Result<BlockId, CfgError> {
        let succ_slot = self.blocks[pred.index()]
            .successors
            .iter()
            .position(|&s| s == succ)
            .ok_or(CfgError::EdgeNotFound { pred, succ })?;
        let pred_slot = self.blocks[succ.index()]
            .predecessors
            .iter()
            .position(|&p| p == pred)
            .ok_or(CfgError::EdgeNotFound { pred, succ })?;

        let split = BlockId(self.blocks.len() as u32);
        let mut block = BasicBlock::new(split);
        block.operations.push(Operation::new(Opcode::Branch, None, vec![]));
        block.predecessors.push(pred);
        block.successors.push(succ);
        self.blocks.push(block);

        self.blocks[pred.index()].successors[succ_slot] = split;
        self.blocks[succ.index()].predecessors[pred_slot] = split;

        trace!(%pred, %succ, %split, "split edge");
        self.update();
        Ok(split)
    }

    /// Split every edge from a multi-successor block into a multi-predecessor block
    ///
    /// Returns the number of edges split.
    pub fn split_critical_edges(&mut self) -> usize {
        let mut critical = Vec::new();
        for block in &self.blocks {
            if block.successors.len() < 2 {
                continue;
            }
            for &succ in &block.successors {
                if self.blocks[succ.index()].predecessors.len() > 1 {
                    critical.push((block.id, succ));
                }
            }
        }

        let mut split = 0;
        for (pred, succ) in critical {
            // Each edge was observed in the graph above; a duplicate edge is
            // found again at its next position after the first one is split.
            if self.split_edge(pred, succ).is_ok() {
                split += 1;
            }
        }
        split
    }
}

/// Drop blocks unreachable from `entry` and renumber the survivors
fn remove_unreachable(entry: BlockId, mut blocks: Vec<BasicBlock>) -> (BlockId, Vec<BasicBlock>) {
    if blocks.is_empty() {
        return (entry, blocks);
    }

    let mut reachable = vec![false; blocks.len()];
    let mut stack = vec![entry];
    reachable[entry.index()] = true;
    while let Some(block) = stack.pop() {
        for &succ in &blocks[block.index()].successors {
            if !reachable[succ.index()] {
                reachable[succ.index()] = true;
                stack.push(succ);
            }
        }
    }

    if reachable.iter().all(|&r| r) {
        return (entry, blocks);
    }

    let mut remap = vec![None; blocks.len()];
    let mut next = 0u32;
    for (index, &live) in reachable.iter().enumerate() {
        if live {
            remap[index] = Some(BlockId(next));
            next += 1;
        }
    }

    let removed = blocks.len() - next as usize;
    blocks.retain(|block| reachable[block.id.index()]);
    for block in &mut blocks {
        if let Some(id) = remap[block.id.index()] {
            block.id = id;
        }
        block.predecessors = block
            .predecessors
            .iter()
            .filter_map(|pred| remap[pred.index()])
            .collect();
        block.successors = block
            .successors
            .iter()
            .filter_map(|succ| remap[succ.index()])
            .collect();
    }

    trace!(removed, "removed unreachable blocks");
    let entry = remap[entry.index()].unwrap_or(BlockId(0));
    (entry, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build blocks from an edge list; successor order follows the list
    fn graph(count: usize, edges: &[(u32, u32)]) -> ControlFlowGraph {
        let mut blocks: Vec<BasicBlock> = (0..count).map(|i| BasicBlock::new(BlockId(i as u32))).collect();
        for &(from, to) in edges {
            blocks[from as usize].successors.push(BlockId(to));
            blocks[to as usize].predecessors.push(BlockId(from));
        }
        ControlFlowGraph::new(BlockId(0), blocks, 0)
    }

    #[test]
    fn test_post_order_map_is_inverse() {
        let cfg = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        assert_eq!(cfg.post_order.len(), 4);
        for (position, block) in cfg.post_order.iter().enumerate() {
            assert_eq!(cfg.post_order_map[block.index()], position);
        }
        assert_eq!(*cfg.post_order.last().unwrap(), cfg.entry);
    }

    #[test]
    fn test_unreachable_blocks_removed() {
        // bb2 is unreachable but points at bb1
        let cfg = graph(3, &[(0, 1), (2, 1)]);
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.predecessors(BlockId(1)), &[BlockId(0)]);
        for (i, block) in cfg.blocks.iter().enumerate() {
            assert_eq!(block.id.index(), i);
        }
    }

    #[test]
    fn test_self_loop_post_order() {
        let cfg = graph(1, &[(0, 0)]);
        assert_eq!(cfg.post_order, vec![BlockId(0)]);
        assert_eq!(cfg.predecessors(BlockId(0)), &[BlockId(0)]);
    }

    #[test]
    fn test_split_edge_keeps_predecessor_slot() {
        let mut cfg = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let split = cfg.split_edge(BlockId(2), BlockId(3)).unwrap();
        assert_eq!(cfg.predecessors(BlockId(3)), &[BlockId(1), split]);
        assert_eq!(cfg.successors(BlockId(2)), &[split]);
        assert_eq!(cfg.successors(split), &[BlockId(3)]);
        assert_eq!(cfg.post_order.len(), 5);
    }

    #[test]
    fn test_split_missing_edge_fails() {
        let mut cfg = graph(3, &[(0, 1), (1, 2)]);
        let err = cfg.split_edge(BlockId(0), BlockId(2));
        assert!(matches!(err, Err(CfgError::EdgeNotFound { .. })));
    }

    #[test]
    fn test_split_critical_edges() {
        // bb0 branches to bb1 and bb2; bb2 is also reached from bb1
        let mut cfg = graph(3, &[(0, 1), (0, 2), (1, 2)]);
        assert_eq!(cfg.split_critical_edges(), 1);
        for block in &cfg.blocks {
            if block.successors.len() > 1 {
                for succ in &block.successors {
                    assert!(cfg.predecessors(*succ).len() <= 1);
                }
            }
        }
    }

    #[test]
    fn test_split_duplicate_edges() {
        // Conditional branch whose both arms reach the same block
        let mut cfg = graph(2, &[(0, 1), (0, 1)]);
        assert_eq!(cfg.split_critical_edges(), 2);
        let preds = cfg.predecessors(BlockId(1)).to_vec();
        assert_eq!(preds.len(), 2);
        assert_ne!(preds[0], preds[1]);
        assert!(!preds.contains(&BlockId(0)));
    }

    #[test]
    fn test_entry_loop_header_gets_new_entry() {
        let mut cfg = graph(2, &[(0, 0), (0, 1)]);
        assert!(cfg.ensure_entry_without_predecessors());
        assert!(cfg.predecessors(cfg.entry).is_empty());
        assert_eq!(cfg.successors(cfg.entry), &[BlockId(0)]);
        assert_eq!(*cfg.post_order.last().unwrap(), cfg.entry);
        assert!(!cfg.ensure_entry_without_predecessors());
    }

    #[test]
    fn test_new_local_is_fresh() {
        let mut cfg = graph(1, &[]);
        let a = cfg.new_local(OperandType::I64);
        let b = cfg.new_local(OperandType::I64);
        assert_ne!(a, b);
        assert_eq!(cfg.local_count(), 2);
    }
}
