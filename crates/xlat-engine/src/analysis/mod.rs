//! Graph analyses: control-flow graph structure and dominance

pub mod cfg;
pub mod dominance;

pub use cfg::{CfgError, ControlFlowGraph};
pub use dominance::{dominates, find_dominance_frontiers, find_dominators};
