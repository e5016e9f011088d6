//! Backend-agnostic code generation traits
//!
//! Defines the `CodegenBackend` trait that host code generators implement,
//! along with the compiled unit and its unwind description.

use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::types::OperandType;

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

impl TargetInfo {
    pub fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo { arch: TargetArch::AArch64, pointer_size: 8 }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }
    }
}

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Register allocation failed: {0}")]
    RegisterAllocationFailed(String),
}

/// Optimization tier of a translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationTier {
    /// Fast to produce; counts calls and asks for rejit when hot
    Baseline,
    /// Optimized; never rejitted
    HighQuality,
}

/// Per-compilation options handed to the backend
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub tier: TranslationTier,
    /// Whether guest calls may be emitted as host tail calls
    pub allow_tail_calls: bool,
}

impl CompileOptions {
    pub fn baseline() -> Self {
        CompileOptions { tier: TranslationTier::Baseline, allow_tail_calls: true }
    }

    pub fn high_quality() -> Self {
        CompileOptions { tier: TranslationTier::HighQuality, allow_tail_calls: true }
    }
}

/// Kind of prologue step recorded for the host unwinder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindPseudoOp {
    PushReg,
    SaveReg,
    SaveXmm128,
    AllocStack,
    SetFrame,
}

/// One prologue step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindPushEntry {
    pub pseudo_op: UnwindPseudoOp,
    /// Offset of the instruction that performs the step
    pub prologue_offset: u32,
    pub reg_index: u32,
    /// Stack offset for saves, allocation size for `AllocStack`
    pub stack_offset_or_size: u32,
}

/// Unwind description of a compiled unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindInfo {
    pub push_entries: Vec<UnwindPushEntry>,
    pub prologue_size: u32,
}

/// Host machine code ready to be copied into the code cache
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub code: Vec<u8>,
    pub unwind_info: UnwindInfo,
}

/// The backend-agnostic code generation trait
///
/// The translation pipeline hands the backend a graph with no merge nodes
/// left; the backend returns position-independent code whose entry is the
/// first byte.
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Compile a graph to host machine code
    fn compile(
        &self,
        cfg: &ControlFlowGraph,
        arg_types: &[OperandType],
        return_type: OperandType,
        options: CompileOptions,
    ) -> Result<CompiledUnit, CodegenError>;

    /// Return target architecture information
    fn target_info(&self) -> TargetInfo {
        TargetInfo::host()
    }
}
