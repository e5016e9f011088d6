//! Translation pipeline: guest blocks → IR → SSA → optimized IR → backend
//!
//! The pipeline chains together all compilation stages:
//! 1. Emit IR for the decoded guest blocks (`frontend`)
//! 2. Transfer guest registers to and from the execution context
//! 3. Build SSA form
//! 4. Run optimization passes (high-quality tier only)
//! 5. Lower merge nodes back to copies
//! 6. Generate host code through the backend

pub mod context_transfer;
pub mod frontend;
pub mod optimize;

use std::sync::Arc;

use tracing::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::backend::traits::{CodegenBackend, CodegenError, CompileOptions, CompiledUnit, TranslationTier};
use crate::ir::OperandType;
use crate::ssa::{self, DeconstructMode, SsaError};
use self::context_transfer::insert_context_transfers;
use self::optimize::Optimizer;

/// Errors from the compilation stages after emission
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("SSA error: {0}")]
    Ssa(#[from] SsaError),
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),
}

/// Complete compilation pipeline from an emitted graph to host code
pub struct TranslationPipeline {
    backend: Arc<dyn CodegenBackend>,
    optimizer: Optimizer,
}

impl TranslationPipeline {
    /// Create a new pipeline with the default optimizer
    pub fn new(backend: Arc<dyn CodegenBackend>) -> Self {
        TranslationPipeline { backend, optimizer: Optimizer::new() }
    }

    /// Create a pipeline with a custom optimizer
    pub fn with_optimizer(backend: Arc<dyn CodegenBackend>, optimizer: Optimizer) -> Self {
        TranslationPipeline { backend, optimizer }
    }

    /// Run the IR stages: SSA construction, optimization for the high tier,
    /// and merge-node lowering. The result has no merge nodes left.
    pub fn lower(&self, cfg: &mut ControlFlowGraph, tier: TranslationTier) -> Result<(), PipelineError> {
        ssa::construct(cfg);

        let mode = match tier {
            TranslationTier::Baseline => DeconstructMode::Baseline,
            TranslationTier::HighQuality => {
                self.optimizer.optimize(cfg);
                DeconstructMode::Parallel
            }
        };

        if cfg!(debug_assertions) {
            ssa::verify(cfg)?;
        }

        ssa::deconstruct(cfg, mode)?;
        trace!(?tier, blocks = cfg.len(), locals = cfg.local_count(), "lowered graph");
        Ok(())
    }

    /// Lower and compile a graph with an explicit signature
    pub fn compile(
        &self,
        mut cfg: ControlFlowGraph,
        arg_types: &[OperandType],
        return_type: OperandType,
        options: CompileOptions,
    ) -> Result<CompiledUnit, PipelineError> {
        self.lower(&mut cfg, options.tier)?;
        Ok(self.backend.compile(&cfg, arg_types, return_type, options)?)
    }

    /// Compile a guest function: `(ctx) -> next guest address`
    pub fn compile_guest(&self, mut cfg: ControlFlowGraph, options: CompileOptions) -> Result<CompiledUnit, PipelineError> {
        insert_context_transfers(&mut cfg);
        self.compile(cfg, &[OperandType::I64], OperandType::I64, options)
    }

    /// Get a reference to the backend
    pub fn backend(&self) -> &dyn CodegenBackend {
        self.backend.as_ref()
    }

    /// Get a reference to the optimizer
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }
}
