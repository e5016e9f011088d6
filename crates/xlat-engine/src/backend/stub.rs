//! Stub backend for testing the pipeline without real codegen
//!
//! Produces placeholder machine code (INT3 / BRK) so translation, caching and
//! table publication can be exercised end-to-end. The code is never run.

use super::traits::*;
use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::types::OperandType;

/// A stub backend that produces placeholder code (INT3 on x86, BRK on ARM)
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile(
        &self,
        cfg: &ControlFlowGraph,
        _arg_types: &[OperandType],
        _return_type: OperandType,
        _options: CompileOptions,
    ) -> Result<CompiledUnit, CodegenError> {
        if cfg.is_empty() {
            return Err(CodegenError::BackendError("empty graph".to_string()));
        }

        let trap: &[u8] = match self.target_info().arch {
            TargetArch::X86_64 => &[0xCC],                  // INT3
            TargetArch::AArch64 => &[0x00, 0x00, 0x20, 0xD4], // BRK #0
        };

        // One trap per block keeps unit sizes proportional to the graph
        let code = trap.repeat(cfg.len());
        Ok(CompiledUnit { code, unwind_info: UnwindInfo::default() })
    }
}
