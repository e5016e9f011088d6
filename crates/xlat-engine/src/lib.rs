//! xlat guest binary translation engine
//!
//! This crate turns guest machine code into host code and keeps it running:
//! - **IR**: typed operands, operations, blocks and the emitter (`ir` module)
//! - **Analysis**: control-flow graph and dominance (`analysis` module)
//! - **SSA**: construction, deconstruction, parallel copies (`ssa` module)
//! - **Pipeline**: guest front end, optimizer and compile driver (`pipeline` module)
//! - **Backend**: host code generation interface (`backend` module)
//! - **Runtime**: code cache, jump tables, dispatch stubs (`runtime` module)
//! - **Translator**: orchestration and tiered rejit (`translator` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xlat_engine::{ExecutionContext, ExecutionMode, Translator, TranslatorConfig};
//!
//! let translator = Translator::new(backend, decoder, TranslatorConfig::default())?;
//! let mut ctx = ExecutionContext::new();
//! let stopped_at = translator.execute(&mut ctx, 0x1000, ExecutionMode::Bits64)?;
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

// ============================================================================
// Core Modules
// ============================================================================

/// Translator IR
pub mod ir;

/// Control-flow graph and dominance
pub mod analysis;

/// SSA form
pub mod ssa;

/// Emission, optimization and compilation driver
pub mod pipeline;

/// Host code generation
pub mod backend;

/// Process-lifetime runtime structures
pub mod runtime;

/// Rejit counters, policy and queue
pub mod profiling;

/// Translation orchestrator
pub mod translator;

// ============================================================================
// Re-exports
// ============================================================================

pub use analysis::{CfgError, ControlFlowGraph};
pub use backend::{CodegenBackend, CodegenError, CompileOptions, CompiledUnit, StubBackend, TranslationTier};
pub use ir::{EmitError, Emitter, Operand, OperandType};
pub use pipeline::frontend::{
    DecodeError, DecodedBlock, DecodedInstruction, ExecutionMode, GuestDecoder, GuestEmitter, InstEmitter,
};
pub use pipeline::{PipelineError, TranslationPipeline};
pub use profiling::{RejitPolicy, TranslationStats};
pub use runtime::{ExecutionContext, GuestEvent, TranslatedFunction};
pub use translator::{TranslateError, Translator, TranslatorConfig};
