//! Backend-agnostic code generation traits and implementations

pub mod traits;
pub mod stub;

pub use traits::{
    CodegenBackend, CodegenError, CompileOptions, CompiledUnit, TargetArch, TargetInfo,
    TranslationTier, UnwindInfo, UnwindPseudoOp, UnwindPushEntry,
};
pub use stub::StubBackend;
