//! Pretty-printing for translator IR
//!
//! Display implementations for debugging and dump output.

use std::fmt;

use super::instr::{BasicBlock, Comparison, Opcode, Operation};
use crate::analysis::cfg::ControlFlowGraph;

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cfg (entry: {}, locals: {}) {{", self.entry, self.local_count())?;

        for block in &self.blocks {
            write!(f, "{}", block)?;
        }

        writeln!(f, "}}")
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {}:", self.id)?;
        if !self.predecessors.is_empty() {
            write!(f, "    ; preds:")?;
            for pred in &self.predecessors {
                write!(f, " {}", pred)?;
            }
            writeln!(f)?;
        }

        for op in &self.operations {
            writeln!(f, "    {}", op)?;
        }

        if !self.successors.is_empty() {
            write!(f, "    ; succs:")?;
            for succ in &self.successors {
                write!(f, " {}", succ)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Comparison::Equal => "eq",
            Comparison::NotEqual => "ne",
            Comparison::Less => "lt",
            Comparison::LessOrEqual => "le",
            Comparison::Greater => "gt",
            Comparison::GreaterOrEqual => "ge",
            Comparison::LessUI => "ltu",
            Comparison::LessOrEqualUI => "leu",
            Comparison::GreaterUI => "gtu",
            Comparison::GreaterOrEqualUI => "geu",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dest) = &self.dest {
            write!(f, "{} = ", dest)?;
        }
        match self.opcode {
            Opcode::Compare(cond) => write!(f, "cmp.{}", cond)?,
            opcode => write!(f, "{}", opcode.mnemonic())?,
        }
        for (i, src) in self.sources.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", src)?;
            } else {
                write!(f, ", {}", src)?;
            }
        }
        Ok(())
    }
}
