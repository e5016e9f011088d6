//! SSA construction, deconstruction and parallel-copy resolution

pub mod construct;
pub mod deconstruct;
pub mod parallel_copy;
pub mod verify;

pub use construct::construct;
pub use deconstruct::{deconstruct, DeconstructMode};
pub use parallel_copy::{ParallelCopy, ParallelCopyError};
pub use verify::verify;

use crate::ir::instr::BlockId;

/// Error in SSA form or SSA lowering
#[derive(Debug, thiserror::Error)]
pub enum SsaError {
    #[error("local %{0} is defined more than once")]
    MultipleDefinitions(u32),
    #[error("local %{0} is used but never defined")]
    UndefinedLocal(u32),
    #[error("use of local %{local} in {block} is not dominated by its definition")]
    UndominatedUse { local: u32, block: BlockId },
    #[error("guest register operand left in {block}")]
    RegisterOperand { block: BlockId },
    #[error(transparent)]
    ParallelCopy(#[from] ParallelCopyError),
}
