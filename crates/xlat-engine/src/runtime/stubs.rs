//! Dispatch stubs shared by every translation
//!
//! The slow stub resolves `ExecutionContext::dispatch_address` through the
//! `get_function_address` helper, translating on a miss. The fast stub walks
//! the multi-level address table inline and only drops to the slow stub when
//! a level is missing. Both are ordinary IR run through the translation
//! pipeline and placed in the code cache, built on first use.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use super::address_table::AddressTable;
use super::code_cache::{CacheEntry, CacheError, CodeCache};
use super::context::ExecutionContext;
use super::native::NativeHelper;
use crate::analysis::cfg::ControlFlowGraph;
use crate::backend::traits::CompileOptions;
use crate::ir::{Comparison, EmitError, Emitter, Operand, OperandType};
use crate::pipeline::{PipelineError, TranslationPipeline};

/// Error building or using the dispatch stubs
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("dispatch stubs were disposed")]
    Disposed,
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Lifecycle of the stub set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubState {
    Uninitialized,
    Ready,
    Disposed,
}

/// Lazily generated dispatch stubs
pub struct TranslatorStubs {
    cache: Arc<CodeCache>,
    pipeline: Arc<TranslationPipeline>,
    address_table: Arc<AddressTable>,
    state: Mutex<StubState>,
    fast: OnceCell<CacheEntry>,
    slow: OnceCell<CacheEntry>,
}

impl TranslatorStubs {
    pub fn new(
        cache: Arc<CodeCache>,
        pipeline: Arc<TranslationPipeline>,
        address_table: Arc<AddressTable>,
    ) -> Self {
        TranslatorStubs {
            cache,
            pipeline,
            address_table,
            state: Mutex::new(StubState::Uninitialized),
            fast: OnceCell::new(),
            slow: OnceCell::new(),
        }
    }

    pub fn state(&self) -> StubState {
        *self.state.lock()
    }

    /// Host address of the fast dispatch stub
    pub fn dispatch_stub(&self) -> Result<usize, StubError> {
        let slow = self.slow_dispatch_stub()?;
        // Held across the build: `dispose` must see any fast entry that gets mapped
        let mut state = self.state.lock();
        if *state == StubState::Disposed {
            return Err(StubError::Disposed);
        }
        let entry = self.fast.get_or_try_init(|| {
            let cfg = build_fast_dispatch(&self.address_table, slow)?;
            self.place("fast dispatch", cfg)
        })?;
        *state = StubState::Ready;
        Ok(self.cache.host_address(entry.offset))
    }

    /// Host address of the slow dispatch stub
    pub fn slow_dispatch_stub(&self) -> Result<usize, StubError> {
        self.check_live()?;
        let entry = self.slow.get_or_try_init(|| {
            let cfg = build_slow_dispatch()?;
            self.place("slow dispatch", cfg)
        })?;
        let mut state = self.state.lock();
        if *state == StubState::Uninitialized {
            *state = StubState::Ready;
        }
        Ok(self.cache.host_address(entry.offset))
    }

    /// Release the fast stub; the slow stub stays mapped because jump table
    /// slots may still point at it
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if *state == StubState::Disposed {
            return;
        }
        *state = StubState::Disposed;
        if let Some(fast) = self.fast.get() {
            self.cache.unmap(fast.offset);
        }
        debug!("disposed dispatch stubs");
    }

    fn check_live(&self) -> Result<(), StubError> {
        match *self.state.lock() {
            StubState::Disposed => Err(StubError::Disposed),
            _ => Ok(()),
        }
    }

    fn place(&self, name: &str, cfg: ControlFlowGraph) -> Result<CacheEntry, StubError> {
        let unit = self
            .pipeline
            .compile(cfg, &[OperandType::I64], OperandType::I64, CompileOptions::baseline())?;
        let entry = self.cache.map(&unit)?;
        debug!(stub = name, offset = entry.offset, size = entry.size, "built dispatch stub");
        Ok(entry)
    }
}

fn load_dispatch_address(em: &mut Emitter, context: Operand) -> Operand {
    let field = em.add_values(context, Operand::const_u64(ExecutionContext::DISPATCH_ADDRESS_OFFSET as u64));
    em.load(OperandType::I64, field)
}

/// `host = get_function_address(ctx.dispatch_address); tail host(ctx)`
fn build_slow_dispatch() -> Result<ControlFlowGraph, StubError> {
    let mut em = Emitter::new();
    let context = em.load_argument(OperandType::I64, 0);
    let guest = load_dispatch_address(&mut em, context);
    if let Some(host) = em.call(NativeHelper::GetFunctionAddress, &[guest]) {
        em.tail_call(host, &[context]);
    }
    Ok(em.finish()?)
}

/// Inline address-table walk with a tail call to the slow stub on any miss
fn build_fast_dispatch(table: &AddressTable, slow_stub: usize) -> Result<ControlFlowGraph, StubError> {
    let mut em = Emitter::new();
    let slow = em.new_label();

    let context = em.load_argument(OperandType::I64, 0);
    let guest = load_dispatch_address(&mut em, context);

    let outside = em.bitwise_and(guest, Operand::const_u64(!table.mask()));
    let in_range = em.compare(outside, Operand::const_u64(0), Comparison::Equal);
    em.branch_if_false(slow, in_range);

    let mut page = Operand::const_u64(table.root_address() as u64);
    for level in table.levels() {
        let shifted = em.shift_right_ui(guest, Operand::const_i32(level.index as i32));
        let index = em.bitwise_and(shifted, Operand::const_u64(level.mask()));
        let offset = em.shift_left(index, Operand::const_i32(3));
        let slot = em.add_values(page, offset);
        let value = em.load(OperandType::I64, slot);
        let present = em.compare(value, Operand::const_u64(0), Comparison::NotEqual);
        em.branch_if_false(slow, present);
        page = value;
    }
    em.tail_call(page, &[context]);

    em.mark_label(slow)?;
    em.tail_call(Operand::const_u64(slow_stub as u64), &[context]);

    Ok(em.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Opcode;
    use crate::backend::stub::StubBackend;
    use crate::runtime::address_table::LEVELS_64_BIT;
    use std::sync::Barrier;
    use std::thread;

    fn stubs() -> Arc<TranslatorStubs> {
        let cache = Arc::new(CodeCache::new(1 << 20).unwrap());
        let pipeline = Arc::new(TranslationPipeline::new(Arc::new(StubBackend)));
        let table = Arc::new(AddressTable::new(LEVELS_64_BIT).unwrap());
        Arc::new(TranslatorStubs::new(cache, pipeline, table))
    }

    #[test]
    #[cfg(unix)]
    fn test_disposed_before_use_maps_nothing() {
        let stubs = stubs();
        stubs.dispose();
        assert!(matches!(stubs.dispatch_stub(), Err(StubError::Disposed)));
        assert!(matches!(stubs.slow_dispatch_stub(), Err(StubError::Disposed)));
        assert_eq!(stubs.cache.entry_count(), 0);
        assert_eq!(stubs.state(), StubState::Disposed);
    }

    #[test]
    #[cfg(unix)]
    fn test_dispose_racing_build_leaves_no_live_fast_stub() {
        for _ in 0..32 {
            let stubs = stubs();
            stubs.slow_dispatch_stub().unwrap();
            let barrier = Arc::new(Barrier::new(5));

            let builders: Vec<_> = (0..4)
                .map(|_| {
                    let stubs = stubs.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        stubs.dispatch_stub()
                    })
                })
                .collect();
            barrier.wait();
            stubs.dispose();
            for builder in builders {
                let _ = builder.join().unwrap();
            }

            assert_eq!(stubs.state(), StubState::Disposed);
            if let Some(fast) = stubs.fast.get() {
                assert!(stubs.cache.try_find(fast.offset).is_none());
            }
            assert!(matches!(stubs.dispatch_stub(), Err(StubError::Disposed)));
        }
    }

    #[test]
    fn test_fast_dispatch_checks_every_level() {
        let table = AddressTable::new(LEVELS_64_BIT).unwrap();
        let cfg = build_fast_dispatch(&table, 0x1000).unwrap();

        let loads = cfg
            .blocks
            .iter()
            .flat_map(|b| b.operations.iter())
            .filter(|op| op.opcode == Opcode::Load)
            .count();
        // dispatch address plus one per level
        assert_eq!(loads, 1 + LEVELS_64_BIT.len());

        let tail_calls: Vec<_> = cfg
            .blocks
            .iter()
            .filter_map(|b| b.last_operation())
            .filter(|op| op.opcode == Opcode::Tailcall)
            .collect();
        assert_eq!(tail_calls.len(), 2);
        assert!(tail_calls.iter().any(|op| op.sources[0].as_constant() == Some(0x1000)));
    }

    #[test]
    fn test_slow_dispatch_calls_helper() {
        let cfg = build_slow_dispatch().unwrap();
        assert_eq!(cfg.len(), 1);
        let ops: Vec<Opcode> = cfg.blocks[0].operations.iter().map(|op| op.opcode).collect();
        assert_eq!(
            ops,
            vec![Opcode::LoadArgument, Opcode::Add, Opcode::Load, Opcode::Call, Opcode::Tailcall]
        );
    }
}
