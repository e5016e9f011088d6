//! IR sequences that leave a translated function through the jump tables
//!
//! Generated code never calls another translation directly. It loads the
//! host address from a jump table slot, so later translations (and rejits)
//! are picked up by patching the slot instead of the caller's code.

use super::context::ExecutionContext;
use super::jump_table::{DynamicTable, JumpTable, JumpTableError};
use super::native::NativeHelper;
use crate::ir::{Comparison, EmitError, Emitter, Operand, OperandType};

/// Error emitting a table jump
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    JumpTable(#[from] JumpTableError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Store the guest target where the dispatch stubs expect it
pub fn emit_set_dispatch_address(em: &mut Emitter, context: Operand, target: Operand) {
    let field = em.add_values(context, Operand::const_u64(ExecutionContext::DISPATCH_ADDRESS_OFFSET as u64));
    em.store(field, target);
}

/// Leave the function through `host` with the context as the only argument
fn emit_exit_through(em: &mut Emitter, context: Operand, host: Operand, allow_tail_calls: bool) {
    if allow_tail_calls {
        em.tail_call(host, &[context]);
    } else if let Some(next) = em.call_indirect(host, OperandType::I64, &[context]) {
        em.return_value(next);
    }
}

/// Jump to a statically known guest address through a direct table slot
///
/// Until `target` is translated the slot holds the slow dispatch stub, which
/// translates on demand and resolves through `dispatch_address`.
pub fn emit_direct_jump(
    em: &mut Emitter,
    context: Operand,
    table: &JumpTable,
    owner: u64,
    target: u64,
    allow_tail_calls: bool,
) -> Result<(), DispatchError> {
    let slot = table.reserve_entry(owner, target)?;
    emit_set_dispatch_address(em, context, Operand::const_u64(target));
    let host = em.load(OperandType::I64, Operand::const_u64(table.entry_address(slot) as u64));
    emit_exit_through(em, context, host, allow_tail_calls);
    Ok(())
}

/// Call a guest function and continue at `return_address` when it returns there
///
/// The callee returns the next guest address. Anything other than the
/// expected return address (an exception return, a stop request) leaves this
/// function too, handing the address to the dispatcher.
pub fn emit_direct_call(
    em: &mut Emitter,
    context: Operand,
    table: &JumpTable,
    owner: u64,
    target: u64,
    return_address: u64,
) -> Result<(), DispatchError> {
    let slot = table.reserve_entry(owner, target)?;
    emit_set_dispatch_address(em, context, Operand::const_u64(target));
    let host = em.load(OperandType::I64, Operand::const_u64(table.entry_address(slot) as u64));
    let Some(next) = em.call_indirect(host, OperandType::I64, &[context]) else {
        return Ok(());
    };

    let resume = em.new_label();
    let returned = em.compare(next, Operand::const_u64(return_address), Comparison::Equal);
    em.branch_if_true(resume, returned);
    em.return_value(next);
    em.mark_label(resume)?;
    Ok(())
}

/// Jump to a guest address computed at run time
///
/// Each site owns a group of dynamic-table slots. Every slot is tried in
/// order: an empty guest field is claimed with a compare-and-swap, a slot
/// already holding the target is reused, and a missing host address is
/// filled in by calling `get_function_address`. When every slot belongs to
/// another target the jump resolves through the helper on each execution.
pub fn emit_dynamic_jump(
    em: &mut Emitter,
    context: Operand,
    table: &DynamicTable,
    owner: u64,
    target: Operand,
    allow_tail_calls: bool,
) -> Result<(), DispatchError> {
    let base = table.reserve_entry(owner)?;
    let target = if target.ty == OperandType::I64 { target } else { em.zero_extend32(OperandType::I64, target) };
    emit_set_dispatch_address(em, context, target);

    for slot in base..base + table.probe_count() {
        let next_slot = em.new_label();
        let resolved = em.new_label();

        let guest_field = Operand::const_u64(table.guest_entry_address(slot) as u64);
        let host_field = Operand::const_u64(table.host_entry_address(slot) as u64);

        let previous = em.compare_and_swap(guest_field, Operand::const_u64(0), target);
        let claimed = em.compare(previous, Operand::const_u64(0), Comparison::Equal);
        let matched = em.compare(previous, target, Comparison::Equal);
        let usable = em.bitwise_or(claimed, matched);
        em.branch_if_false(next_slot, usable);

        let host = em.load(OperandType::I64, host_field);
        let present = em.compare(host, Operand::const_u64(0), Comparison::NotEqual);
        em.branch_if_true(resolved, present);

        // Slot claimed but not resolved yet
        if let Some(fresh) = em.call(NativeHelper::GetFunctionAddress, &[target]) {
            em.store(host_field, fresh);
            emit_exit_through(em, context, fresh, allow_tail_calls);
        }

        em.mark_label(resolved)?;
        let host = em.load(OperandType::I64, host_field);
        emit_exit_through(em, context, host, allow_tail_calls);

        em.mark_label(next_slot)?;
    }

    if let Some(host) = em.call(NativeHelper::GetFunctionAddress, &[target]) {
        emit_exit_through(em, context, host, allow_tail_calls);
    }
    Ok(())
}
