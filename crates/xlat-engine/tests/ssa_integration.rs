//! Graph analyses and SSA round trips over hand-built IR

use std::collections::HashMap;
use std::sync::Arc;

use xlat_engine::analysis::{dominates, find_dominance_frontiers, find_dominators};
use xlat_engine::ir::{BasicBlock, BlockId, Comparison, LocalId, Opcode, OperandKind, Operation, Register};
use xlat_engine::ssa::{self, DeconstructMode, ParallelCopy};
use xlat_engine::{
    ControlFlowGraph, Emitter, Operand, OperandType, StubBackend, TranslationPipeline, TranslationTier,
};

fn graph(count: usize, edges: &[(u32, u32)]) -> ControlFlowGraph {
    let mut blocks: Vec<BasicBlock> = (0..count).map(|i| BasicBlock::new(BlockId(i as u32))).collect();
    for &(from, to) in edges {
        blocks[from as usize].successors.push(BlockId(to));
        blocks[to as usize].predecessors.push(BlockId(from));
    }
    ControlFlowGraph::new(BlockId(0), blocks, 0)
}

fn x(index: u32) -> Operand {
    Operand::register(Register::integer(index), OperandType::I64)
}

/// Check the defining properties of idom and DF on every block
fn check_dominance(cfg: &mut ControlFlowGraph) {
    find_dominators(cfg);
    find_dominance_frontiers(cfg);

    let entry = cfg.entry;
    assert_eq!(cfg.block(entry).immediate_dominator, Some(entry));

    for block in &cfg.blocks {
        let id = block.id;
        if id != entry {
            let idom = block.immediate_dominator.unwrap();
            assert_ne!(idom, id);
            assert!(dominates(cfg, idom, id));
        }
        for &frontier in &block.dominance_frontier {
            // Dominates a predecessor of the frontier block but not the block itself (strictly)
            assert!(cfg.predecessors(frontier).iter().any(|&p| dominates(cfg, id, p)));
            assert!(frontier == id || !dominates(cfg, id, frontier));
        }
    }
}

#[test]
fn test_dominance_on_diamond() {
    let mut cfg = graph(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
    check_dominance(&mut cfg);
    assert_eq!(cfg.block(BlockId(3)).immediate_dominator, Some(BlockId(0)));
    assert_eq!(cfg.block(BlockId(1)).dominance_frontier, vec![BlockId(3)]);
    assert!(cfg.block(BlockId(0)).dominance_frontier.is_empty());
}

#[test]
fn test_dominance_on_nested_loops() {
    // 0 -> 1 (outer head) -> 2 (inner head) -> 3 -> 2, 3 -> 4 -> 1, 4 -> 5
    let mut cfg = graph(6, &[(0, 1), (1, 2), (2, 3), (3, 2), (3, 4), (4, 1), (4, 5)]);
    check_dominance(&mut cfg);
    assert!(dominates(&cfg, BlockId(1), BlockId(5)));
    assert!(cfg.block(BlockId(3)).dominance_frontier.contains(&BlockId(2)));
    assert!(cfg.block(BlockId(4)).dominance_frontier.contains(&BlockId(1)));
}

#[test]
fn test_dominance_on_irreducible_graph() {
    // Two entries into the 1 <-> 2 cycle
    let mut cfg = graph(4, &[(0, 1), (0, 2), (1, 2), (2, 1), (1, 3)]);
    check_dominance(&mut cfg);
    assert_eq!(cfg.block(BlockId(1)).immediate_dominator, Some(BlockId(0)));
    assert_eq!(cfg.block(BlockId(2)).immediate_dominator, Some(BlockId(0)));
}

/// `x0 = 0; do { x1 = 0; do { x1 += 1; x0 += x1 } while x1 < 4 } while x0 < 100; return x0`
fn nested_loops() -> ControlFlowGraph {
    let mut em = Emitter::new();
    em.copy(x(0), Operand::const_i64(0));

    let outer = em.new_label();
    em.mark_label(outer).unwrap();
    em.copy(x(1), Operand::const_i64(0));

    let inner = em.new_label();
    em.mark_label(inner).unwrap();
    let step = em.add_values(x(1), Operand::const_i64(1));
    em.copy(x(1), step);
    let total = em.add_values(x(0), x(1));
    em.copy(x(0), total);
    let again = em.compare(x(1), Operand::const_i64(4), Comparison::Less);
    em.branch_if_true(inner, again);

    let more = em.compare(x(0), Operand::const_i64(100), Comparison::Less);
    em.branch_if_true(outer, more);
    em.return_value(x(0));
    em.finish().unwrap()
}

fn count(cfg: &ControlFlowGraph, pred: impl Fn(&Operation) -> bool) -> usize {
    cfg.blocks.iter().flat_map(|b| b.operations.iter()).filter(|op| pred(op)).count()
}

fn mentions_register(op: &Operation) -> bool {
    op.sources.iter().any(|s| s.is_register()) || op.dest.is_some_and(|d| d.is_register())
}

#[test]
fn test_construct_produces_valid_ssa() {
    let mut cfg = nested_loops();
    ssa::construct(&mut cfg);

    ssa::verify(&cfg).unwrap();
    assert_eq!(count(&cfg, mentions_register), 0);
    // x0 merges at both loop heads, x1 only at the inner one
    assert_eq!(count(&cfg, |op| op.opcode == Opcode::Phi), 3);
}

#[test]
fn test_round_trip_through_both_lowerings() {
    for mode in [DeconstructMode::Baseline, DeconstructMode::Parallel] {
        let mut cfg = nested_loops();
        ssa::construct(&mut cfg);
        ssa::deconstruct(&mut cfg, mode).unwrap();

        assert_eq!(count(&cfg, |op| op.opcode == Opcode::Phi), 0);
        assert_eq!(count(&cfg, mentions_register), 0);
        for block in &cfg.blocks {
            let body = &block.operations[..block.operations.len().saturating_sub(1)];
            assert!(body.iter().all(|op| !op.is_terminator()), "{mode:?}: terminator mid-block");
        }
    }
}

#[test]
fn test_baseline_lowering_splits_critical_edges() {
    let mut cfg = nested_loops();
    ssa::construct(&mut cfg);
    ssa::deconstruct(&mut cfg, DeconstructMode::Baseline).unwrap();

    for block in &cfg.blocks {
        if block.successors.len() > 1 {
            for &succ in &block.successors {
                assert_eq!(cfg.predecessors(succ).len(), 1, "critical edge {} -> {}", block.id, succ);
            }
        }
    }
}

// ===== Execution =====

const STEP_LIMIT: usize = 100_000;

/// Run a register- or local-based graph to its return value
///
/// Merge nodes at a block head read their sources together, on entry, from
/// the slot of the edge taken.
fn execute(cfg: &ControlFlowGraph) -> u64 {
    let mut values: HashMap<OperandKind, u64> = HashMap::new();
    let read = |values: &HashMap<OperandKind, u64>, operand: &Operand| match operand.kind {
        OperandKind::Constant(value) => value,
        OperandKind::Undefined => 0,
        kind => *values.get(&kind).unwrap_or_else(|| panic!("read of unset {operand}")),
    };

    let mut current = cfg.entry;
    let mut previous: Option<BlockId> = None;
    for _ in 0..STEP_LIMIT {
        let block = cfg.block(current);
        let phis = block.phi_count();
        if phis > 0 {
            let slot = block.predecessors.iter().position(|&p| Some(p) == previous).unwrap();
            let incoming: Vec<_> = block.operations[..phis]
                .iter()
                .map(|phi| (phi.dest.unwrap().kind, read(&values, &phi.sources[slot])))
                .collect();
            values.extend(incoming);
        }

        let mut next = None;
        for op in &block.operations[phis..] {
            let source = |i: usize| read(&values, &op.sources[i]);
            let result = match op.opcode {
                Opcode::Copy => source(0),
                Opcode::Add => source(0).wrapping_add(source(1)),
                Opcode::Subtract => source(0).wrapping_sub(source(1)),
                Opcode::Multiply => source(0).wrapping_mul(source(1)),
                Opcode::Compare(cond) => {
                    cond.evaluate(source(0), source(1), op.sources[0].ty == OperandType::I64) as u64
                }
                Opcode::Return => return source(0),
                Opcode::Branch => {
                    next = Some(block.successors[0]);
                    continue;
                }
                Opcode::BranchIfTrue | Opcode::BranchIfFalse => {
                    let taken = (source(0) != 0) == (op.opcode == Opcode::BranchIfTrue);
                    // [fallthrough, taken]
                    next = Some(block.successors[taken as usize]);
                    continue;
                }
                other => panic!("unexpected {other:?} in {}", block.id),
            };
            values.insert(op.dest.unwrap().kind, result);
        }

        previous = Some(current);
        current = next.unwrap_or_else(|| block.successors[0]);
    }
    panic!("no return within {STEP_LIMIT} blocks");
}

/// `x0, x1 = 1, 2; x3 = 0; do { swap(x0, x1); x3 = x3 * 3 + x0 } while --x2; return x3 * 100 + x0 * 10 + x1`
fn swap_loop() -> ControlFlowGraph {
    let mut em = Emitter::new();
    em.copy(x(0), Operand::const_i64(1));
    em.copy(x(1), Operand::const_i64(2));
    em.copy(x(2), Operand::const_i64(5));
    em.copy(x(3), Operand::const_i64(0));

    let head = em.new_label();
    em.mark_label(head).unwrap();
    let t = em.copy_to_local(x(0));
    em.copy(x(0), x(1));
    em.copy(x(1), t);
    let scaled = em.multiply(x(3), Operand::const_i64(3));
    let acc = em.add_values(scaled, x(0));
    em.copy(x(3), acc);
    let left = em.subtract(x(2), Operand::const_i64(1));
    em.copy(x(2), left);
    let again = em.compare(x(2), Operand::const_i64(0), Comparison::NotEqual);
    em.branch_if_true(head, again);

    let hundreds = em.multiply(x(3), Operand::const_i64(100));
    let tens = em.multiply(x(0), Operand::const_i64(10));
    let partial = em.add_values(hundreds, tens);
    let result = em.add_values(partial, x(1));
    em.return_value(result);
    em.finish().unwrap()
}

/// `x0 = 1; do { x1 = x0; x0 += 1 } while x0 < 10; return x1 * 45`
///
/// The value returned is the merge node's previous-iteration value, live
/// across the back edge that overwrites it.
fn lost_copy() -> ControlFlowGraph {
    let mut em = Emitter::new();
    em.copy(x(0), Operand::const_i64(1));

    let head = em.new_label();
    em.mark_label(head).unwrap();
    em.copy(x(1), x(0));
    let next = em.add_values(x(0), Operand::const_i64(1));
    em.copy(x(0), next);
    let again = em.compare(x(0), Operand::const_i64(10), Comparison::Less);
    em.branch_if_true(head, again);

    let result = em.multiply(x(1), Operand::const_i64(45));
    em.return_value(result);
    em.finish().unwrap()
}

#[test]
fn test_lowered_forms_compute_the_same_value() {
    let pipeline = TranslationPipeline::new(Arc::new(StubBackend));
    let programs: [(&str, fn() -> ControlFlowGraph, u64); 3] =
        [("swap", swap_loop, 21221), ("lost_copy", lost_copy, 405), ("nested", nested_loops, 100)];

    for (name, build, expected) in programs {
        assert_eq!(execute(&build()), expected, "{name}: original");

        let mut in_ssa = build();
        ssa::construct(&mut in_ssa);
        assert_eq!(execute(&in_ssa), expected, "{name}: ssa");

        for mode in [DeconstructMode::Baseline, DeconstructMode::Parallel] {
            let mut cfg = in_ssa.clone();
            ssa::deconstruct(&mut cfg, mode).unwrap();
            assert_eq!(execute(&cfg), expected, "{name}: {mode:?}");
        }

        for tier in [TranslationTier::Baseline, TranslationTier::HighQuality] {
            let mut cfg = build();
            pipeline.lower(&mut cfg, tier).unwrap();
            assert_eq!(execute(&cfg), expected, "{name}: lowered {tier:?}");
        }
    }
}

// ===== Parallel copies =====

fn local(n: u32) -> Operand {
    Operand::local(LocalId(n), OperandType::I64)
}

/// Apply copies in order to `values` (indexed by local id)
fn run(ops: &[Operation], values: &mut [u64]) {
    for op in ops {
        let source = &op.sources[0];
        let value = match source.as_local() {
            Some(id) => values[id.0 as usize],
            None => source.as_constant().unwrap(),
        };
        let dest = op.dest.unwrap().as_local().unwrap();
        values[dest.0 as usize] = value;
    }
}

#[test]
fn test_parallel_copy_rotation() {
    const N: u32 = 5;
    let mut pc = ParallelCopy::new();
    for i in 0..N {
        pc.add_copy(local((i + 1) % N), local(i));
    }
    let ops = pc.sequence(local(N)).unwrap();
    // One cycle costs one extra copy through the scratch
    assert_eq!(ops.len(), N as usize + 1);

    let mut values: Vec<u64> = (0..=N as u64).map(|v| v * 10).collect();
    run(&ops, &mut values);
    for i in 0..N {
        assert_eq!(values[((i + 1) % N) as usize], i as u64 * 10);
    }
}

#[test]
fn test_parallel_copy_two_cycles_and_constants() {
    let mut pc = ParallelCopy::new();
    // (0 1) swap, (2 3 4) rotation, 5 <- 0, 6 <- 42
    pc.add_copy(local(0), local(1));
    pc.add_copy(local(1), local(0));
    pc.add_copy(local(3), local(2));
    pc.add_copy(local(4), local(3));
    pc.add_copy(local(2), local(4));
    pc.add_copy(local(5), local(0));
    pc.add_copy(local(6), Operand::const_i64(42));
    let ops = pc.sequence(local(7)).unwrap();

    let mut values = vec![100, 101, 102, 103, 104, 0, 0, 0];
    run(&ops, &mut values);
    assert_eq!(&values[..7], &[101, 100, 104, 102, 103, 100, 42]);
}

#[test]
fn test_parallel_copy_drops_self_copies() {
    let mut pc = ParallelCopy::new();
    pc.add_copy(local(0), local(0));
    pc.add_copy(local(1), local(1));
    assert!(pc.sequence(local(9)).unwrap().is_empty());
}
