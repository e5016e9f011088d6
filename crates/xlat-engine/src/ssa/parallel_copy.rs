//! Parallel-copy resolution
//!
//! A parallel copy assigns every destination from the value its source held
//! before any of the copies ran. `sequence` orders the copies so no source is
//! overwritten before it is read, breaking cycles through a scratch operand.

use crate::ir::instr::Operation;
use crate::ir::operand::Operand;
use crate::ir::types::OperandType;

/// Error while sequencing a parallel copy
#[derive(Debug, thiserror::Error)]
pub enum ParallelCopyError {
    #[error("parallel copy operand is undefined")]
    NullOperand,
    #[error("scratch operand of type {scratch} cannot hold a {value} value")]
    ScratchTypeMismatch {
        scratch: OperandType,
        value: OperandType,
    },
}

/// A set of copies that take effect simultaneously
#[derive(Debug, Default)]
pub struct ParallelCopy {
    copies: Vec<(Operand, Operand)>,
}

impl ParallelCopy {
    pub fn new() -> Self {
        ParallelCopy { copies: Vec::new() }
    }

    /// Add `dest <- source`
    pub fn add_copy(&mut self, dest: Operand, source: Operand) {
        self.copies.push((dest, source));
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    /// Order the copies into a sequence of plain copy operations
    ///
    /// Copies that are ready (their destination is not read by any pending
    /// copy) go first. When only cycles remain, one destination is saved in
    /// `scratch` and its readers are redirected there.
    pub fn sequence(self, scratch: Operand) -> Result<Vec<Operation>, ParallelCopyError> {
        if scratch.is_undefined() {
            return Err(ParallelCopyError::NullOperand);
        }

        let mut pending = Vec::with_capacity(self.copies.len());
        for (dest, source) in self.copies {
            if dest.is_undefined() || source.is_undefined() {
                return Err(ParallelCopyError::NullOperand);
            }
            if dest != source {
                pending.push((dest, source));
            }
        }

        let mut sequence = Vec::with_capacity(pending.len() + 1);
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .position(|(dest, _)| !pending.iter().any(|(_, source)| source == dest));

            match ready {
                Some(index) => {
                    let (dest, source) = pending.remove(index);
                    sequence.push(Operation::copy(dest, source));
                }
                None => {
                    let (blocked, _) = pending[0];
                    if blocked.ty != scratch.ty {
                        return Err(ParallelCopyError::ScratchTypeMismatch {
                            scratch: scratch.ty,
                            value: blocked.ty,
                        });
                    }
                    sequence.push(Operation::copy(scratch, blocked));
                    for (_, source) in pending.iter_mut() {
                        if *source == blocked {
                            *source = scratch;
                        }
                    }
                }
            }
        }

        Ok(sequence)
    }
}
