//! Guest front end
//!
//! A `GuestDecoder` splits a guest function into decoded blocks. Emission
//! walks those blocks in order, hands each instruction to its emitter, and
//! links blocks together: branches inside the function become IR branches,
//! everything else leaves through the jump tables.
//!
//! Preemption points are inserted at the function entry and before every
//! backward branch, except branches back to the entry, which already polls.

use std::ops::{Deref, DerefMut};

use rustc_hash::FxHashSet;

use crate::analysis::cfg::ControlFlowGraph;
use crate::ir::{EmitError, Emitter, Operand, OperandType, Register};
use crate::runtime::dispatch::{self, DispatchError};
use crate::runtime::jump_table::{DynamicTable, JumpTable};
use crate::runtime::native::NativeHelper;

/// Guest instruction-set state a function is decoded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// 32-bit, fixed-width encoding
    Bits32,
    /// 32-bit, compact (mixed 16/32-bit) encoding
    Bits32Compact,
    /// 64-bit
    Bits64,
}

impl ExecutionMode {
    pub fn is_64_bit(&self) -> bool {
        matches!(self, ExecutionMode::Bits64)
    }

    /// Type guest integer registers are read and written as
    pub fn register_type(&self) -> OperandType {
        if self.is_64_bit() { OperandType::I64 } else { OperandType::I32 }
    }
}

/// Decoder failure
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
    #[error("no instructions decoded at {0:#x}")]
    Empty(u64),
    #[error("invalid encoding {raw:#x} at {address:#x}")]
    InvalidEncoding { address: u64, raw: u32 },
}

/// Emits the IR for one decoded instruction
pub type InstEmitter = fn(&mut GuestEmitter<'_>, &DecodedInstruction);

/// One decoded guest instruction
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub address: u64,
    pub size: u32,
    pub raw: u32,
    /// `None` when the decoder has no emitter for this encoding
    pub emitter: Option<InstEmitter>,
}

impl DecodedInstruction {
    pub fn next_address(&self) -> u64 {
        self.address + self.size as u64
    }
}

/// A run of instructions with a single entry
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub address: u64,
    /// First address past the last instruction
    pub end_address: u64,
    pub instructions: Vec<DecodedInstruction>,
    /// Taken target of the final branch, if static
    pub branch: Option<u64>,
    /// Fall-through successor
    pub next: Option<u64>,
    /// The block leaves the function (return, indirect jump, exception)
    pub exit: bool,
}

/// Guest instruction decoder
pub trait GuestDecoder: Send + Sync {
    /// Decode the function starting at `address`; the block at `address` must be present
    fn decode_function(&self, address: u64, mode: ExecutionMode) -> Result<Vec<DecodedBlock>, DecodeError>;
}

/// Error building IR for a guest function
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("emission failed: {0}")]
    Emit(#[from] EmitError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("decoder returned no block for entry {0:#x}")]
    MissingEntry(u64),
}

/// Tables generated code exits through
#[derive(Clone, Copy)]
pub struct Linkage<'a> {
    pub jump_table: &'a JumpTable,
    pub dynamic_table: &'a DynamicTable,
    pub allow_tail_calls: bool,
}

/// Emission state for one guest function, handed to instruction emitters
pub struct GuestEmitter<'a> {
    emitter: Emitter,
    linkage: Linkage<'a>,
    mode: ExecutionMode,
    entry: u64,
    context: Operand,
    blocks: FxHashSet<u64>,
    current_address: u64,
    error: Option<FrontendError>,
}

impl<'a> GuestEmitter<'a> {
    fn new(entry: u64, mode: ExecutionMode, linkage: Linkage<'a>, blocks: FxHashSet<u64>) -> Self {
        GuestEmitter {
            emitter: Emitter::new(),
            linkage,
            mode,
            entry,
            context: Operand::undefined(OperandType::I64),
            blocks,
            current_address: entry,
            error: None,
        }
    }

    /// Pointer to the thread's `ExecutionContext`
    pub fn context(&self) -> Operand {
        self.context
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Guest address of the instruction being emitted
    pub fn current_address(&self) -> u64 {
        self.current_address
    }

    // ===== Guest registers =====

    /// Integer register in the mode's natural width
    pub fn register(&self, index: u32) -> Operand {
        Operand::register(Register::integer(index), self.mode.register_type())
    }

    pub fn set_register(&mut self, index: u32, value: Operand) {
        let value = match (self.mode.register_type(), value.ty) {
            (OperandType::I32, OperandType::I64) => self.emitter.convert_i64_to_i32(value),
            (OperandType::I64, OperandType::I32) => self.emitter.zero_extend32(OperandType::I64, value),
            _ => value,
        };
        self.emitter.copy(Operand::register(Register::integer(index), value.ty), value);
    }

    pub fn flag(&self, index: u32) -> Operand {
        Operand::register(Register::flag(index), OperandType::I32)
    }

    pub fn set_flag(&mut self, index: u32, value: Operand) {
        self.emitter.copy(Operand::register(Register::flag(index), OperandType::I32), value);
    }

    pub fn vector(&self, index: u32) -> Operand {
        Operand::register(Register::vector(index), OperandType::V128)
    }

    pub fn set_vector(&mut self, index: u32, value: Operand) {
        self.emitter.copy(Operand::register(Register::vector(index), OperandType::V128), value);
    }

    // ===== Control flow =====

    fn is_internal(&self, target: u64) -> bool {
        self.blocks.contains(&target)
    }

    fn needs_sync(&self, target: u64) -> bool {
        target <= self.current_address && target != self.entry
    }

    fn record(&mut self, result: Result<(), impl Into<FrontendError>>) {
        if let Err(err) = result {
            if self.error.is_none() {
                self.error = Some(err.into());
            }
        }
    }

    /// Unconditional jump to a static guest address
    pub fn jump_to(&mut self, target: u64) {
        if self.is_internal(target) {
            if self.needs_sync(target) {
                self.emitter.synchronize(self.context, target);
            }
            let label = self.emitter.get_label(target);
            self.emitter.branch(label);
        } else {
            let Linkage { jump_table, allow_tail_calls, .. } = self.linkage;
            let result = dispatch::emit_direct_jump(
                &mut self.emitter,
                self.context,
                jump_table,
                self.entry,
                target,
                allow_tail_calls,
            );
            self.record(result);
        }
    }

    /// Jump to `target` when `cond` is non-zero, otherwise fall through
    pub fn jump_to_if(&mut self, target: u64, cond: Operand) {
        if self.is_internal(target) && !self.needs_sync(target) {
            let label = self.emitter.get_label(target);
            self.emitter.branch_if_true(label, cond);
            return;
        }

        let skip = self.emitter.new_label();
        self.emitter.branch_if_false(skip, cond);
        self.jump_to(target);
        let marked = self.emitter.mark_label(skip);
        self.record(marked);
    }

    /// Call a guest function; execution continues here if it returns to `return_address`
    pub fn call_guest(&mut self, target: u64, return_address: u64) {
        let result = dispatch::emit_direct_call(
            &mut self.emitter,
            self.context,
            self.linkage.jump_table,
            self.entry,
            target,
            return_address,
        );
        self.record(result);
    }

    /// Jump to an address computed at run time
    pub fn jump_dynamic(&mut self, target: Operand) {
        let Linkage { dynamic_table, allow_tail_calls, .. } = self.linkage;
        let result = dispatch::emit_dynamic_jump(
            &mut self.emitter,
            self.context,
            dynamic_table,
            self.entry,
            target,
            allow_tail_calls,
        );
        self.record(result);
    }

    /// Return to the dispatcher, continuing at `address`
    pub fn exit_to(&mut self, address: u64) {
        self.emitter.return_value(Operand::const_u64(address));
    }

    /// Return to the dispatcher with a run-time guest address
    pub fn exit_dynamic(&mut self, address: Operand) {
        let address = if address.ty == OperandType::I64 {
            address
        } else {
            self.emitter.zero_extend32(OperandType::I64, address)
        };
        self.emitter.return_value(address);
    }

    // ===== Exceptions =====

    /// Raise a supervisor call and stop at the following instruction
    pub fn supervisor_call(&mut self, immediate: u32, next_address: u64) {
        self.raise(NativeHelper::SupervisorCall, immediate, next_address);
    }

    /// Raise a breakpoint and stop at the current instruction
    pub fn breakpoint(&mut self, immediate: u32) {
        self.raise(NativeHelper::Breakpoint, immediate, self.current_address);
    }

    /// Raise an undefined-instruction event and stop at the current instruction
    pub fn undefined(&mut self, opcode: u32) {
        self.raise(NativeHelper::Undefined, opcode, self.current_address);
    }

    fn raise(&mut self, helper: NativeHelper, value: u32, resume: u64) {
        let address = Operand::const_u64(self.current_address);
        self.emitter.call(helper, &[self.context, address, Operand::const_i32(value as i32)]);
        self.emitter.return_value(Operand::const_u64(resume));
    }
}

impl Deref for GuestEmitter<'_> {
    type Target = Emitter;

    fn deref(&self) -> &Emitter {
        &self.emitter
    }
}

impl DerefMut for GuestEmitter<'_> {
    fn deref_mut(&mut self) -> &mut Emitter {
        &mut self.emitter
    }
}

/// Emitter for encodings the decoder does not recognize
pub fn emit_undefined(em: &mut GuestEmitter<'_>, inst: &DecodedInstruction) {
    em.undefined(inst.raw);
}

/// A guest function lowered to IR
pub struct EmittedFunction {
    pub cfg: ControlFlowGraph,
    /// Lowest to highest guest byte covered
    pub guest_size: u64,
}

/// Emit IR for the decoded blocks of the function at `entry`
pub fn emit_function(
    decoded: &[DecodedBlock],
    entry: u64,
    mode: ExecutionMode,
    linkage: Linkage<'_>,
) -> Result<EmittedFunction, FrontendError> {
    let mut order: Vec<&DecodedBlock> = decoded.iter().collect();
    order.sort_by_key(|block| (block.address != entry, block.address));
    if order.first().is_none_or(|block| block.address != entry) {
        return Err(FrontendError::MissingEntry(entry));
    }

    let addresses = decoded.iter().map(|block| block.address).collect();
    let mut ge = GuestEmitter::new(entry, mode, linkage, addresses);

    for (i, block) in order.iter().enumerate() {
        let label = ge.emitter.get_label(block.address);
        ge.emitter.mark_label(label)?;
        ge.current_address = block.address;

        if i == 0 {
            ge.context = ge.emitter.load_argument(OperandType::I64, 0);
            ge.emitter.synchronize(ge.context, entry);
        }

        for inst in &block.instructions {
            ge.current_address = inst.address;
            let emit = inst.emitter.ok_or(EmitError::MissingEmitter { address: inst.address })?;
            emit(&mut ge, inst);
            if let Some(err) = ge.error.take() {
                return Err(err);
            }
        }

        if !ge.emitter.ends_unconditionally() {
            match block.next {
                Some(next) if !block.exit => ge.jump_to(next),
                _ => ge.exit_to(block.end_address),
            }
            if let Some(err) = ge.error.take() {
                return Err(err);
            }
        }
    }

    let low = decoded.iter().map(|block| block.address).min().unwrap_or(entry);
    let high = decoded.iter().map(|block| block.end_address).max().unwrap_or(entry);
    let cfg = ge.emitter.finish()?;

    Ok(EmittedFunction { cfg, guest_size: high - low })
}
