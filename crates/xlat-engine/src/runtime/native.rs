//! Native helper table
//!
//! Generated code calls back into the runtime through a fixed set of
//! `extern "C"` helpers. Each helper is registered once, with an explicit
//! signature, in a process-wide table keyed by `NativeHelper`.
//!
//! Helpers that need the translator find it through a thread-local binding
//! installed by `Translator::execute`.

use std::cell::RefCell;
use std::sync::{Arc, LazyLock};

use tracing::warn;

use super::context::{ExecutionContext, GuestEvent};
use crate::ir::types::OperandType;
use crate::pipeline::frontend::ExecutionMode;
use crate::translator::{TranslateError, Translator};

/// Runtime helpers callable from generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeHelper {
    /// `(guest_address) -> host_address`, translating on a miss
    GetFunctionAddress,
    /// `(ctx) -> 1 if execution should continue`
    CheckSynchronization,
    /// `(ctx, address, immediate)`
    SupervisorCall,
    /// `(ctx, address, immediate)`
    Breakpoint,
    /// `(ctx, address, opcode)`
    Undefined,
}

impl NativeHelper {
    pub const ALL: [NativeHelper; 5] = [
        NativeHelper::GetFunctionAddress,
        NativeHelper::CheckSynchronization,
        NativeHelper::SupervisorCall,
        NativeHelper::Breakpoint,
        NativeHelper::Undefined,
    ];
}

/// A registered helper: entry address plus signature
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub address: usize,
    pub return_type: OperandType,
    pub arg_types: &'static [OperandType],
}

/// Error looking up a helper
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    #[error("unknown native helper: {0}")]
    Unknown(String),
}

static NATIVE_TABLE: LazyLock<Vec<NativeFunction>> = LazyLock::new(|| {
    use OperandType::*;
    NativeHelper::ALL
        .iter()
        .map(|helper| match helper {
            NativeHelper::GetFunctionAddress => NativeFunction {
                name: "get_function_address",
                address: get_function_address as *const () as usize,
                return_type: I64,
                arg_types: &[I64],
            },
            NativeHelper::CheckSynchronization => NativeFunction {
                name: "check_synchronization",
                address: check_synchronization as *const () as usize,
                return_type: I64,
                arg_types: &[I64],
            },
            NativeHelper::SupervisorCall => NativeFunction {
                name: "supervisor_call",
                address: supervisor_call as *const () as usize,
                return_type: None,
                arg_types: &[I64, I64, I32],
            },
            NativeHelper::Breakpoint => NativeFunction {
                name: "breakpoint",
                address: breakpoint as *const () as usize,
                return_type: None,
                arg_types: &[I64, I64, I32],
            },
            NativeHelper::Undefined => NativeFunction {
                name: "undefined_instruction",
                address: undefined_instruction as *const () as usize,
                return_type: None,
                arg_types: &[I64, I64, I32],
            },
        })
        .collect()
});

/// Table entry for a helper
pub fn lookup(helper: NativeHelper) -> &'static NativeFunction {
    &NATIVE_TABLE[helper as usize]
}

/// Find a helper by its registered name
pub fn lookup_by_name(name: &str) -> Result<NativeHelper, NativeError> {
    NativeHelper::ALL
        .iter()
        .copied()
        .find(|helper| lookup(*helper).name == name)
        .ok_or_else(|| NativeError::Unknown(name.to_string()))
}

// ===== Thread binding =====

struct Binding {
    translator: Arc<Translator>,
    mode: ExecutionMode,
    context: *mut ExecutionContext,
    last_error: Option<TranslateError>,
}

thread_local! {
    static BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// Keeps the current thread bound to a translator; unbinds on drop
pub struct NativeBinding {
    previous: Option<Binding>,
}

/// Bind the current thread so helpers can reach `translator` and `context`
pub fn bind(translator: Arc<Translator>, mode: ExecutionMode, context: *mut ExecutionContext) -> NativeBinding {
    let binding = Binding { translator, mode, context, last_error: None };
    let previous = BINDING.with(|slot| slot.borrow_mut().replace(binding));
    NativeBinding { previous }
}

impl NativeBinding {
    /// Error recorded by the last failed lookup on this thread
    pub fn take_error(&self) -> Option<TranslateError> {
        BINDING.with(|slot| slot.borrow_mut().as_mut().and_then(|binding| binding.last_error.take()))
    }
}

impl Drop for NativeBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        BINDING.with(|slot| *slot.borrow_mut() = previous);
    }
}

// ===== Helpers =====

/// Tail-called instead of a translation that failed: stops the context and
/// hands the failing address back to the execution loop
unsafe extern "C" fn translation_failed(ctx: *mut ExecutionContext) -> u64 {
    // Safety: generated code always passes the live context
    let ctx = unsafe { &*ctx };
    ctx.stop();
    ctx.dispatch_address
}

extern "C" fn get_function_address(guest_address: u64) -> u64 {
    let bound = BINDING.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|binding| (binding.translator.clone(), binding.mode, binding.context))
    });
    let Some((translator, mode, context)) = bound else {
        warn!(address = format_args!("{guest_address:#x}"), "get_function_address on unbound thread");
        return translation_failed as *const () as usize as u64;
    };

    match translator.resolve_entry(guest_address, mode) {
        Ok(entry) => entry as u64,
        Err(err) => {
            warn!(address = format_args!("{guest_address:#x}"), error = %err, "translation failed");
            if !context.is_null() {
                // Safety: the binding's context outlives the execute call
                unsafe { (*context).dispatch_address = guest_address };
            }
            BINDING.with(|slot| {
                if let Some(binding) = slot.borrow_mut().as_mut() {
                    binding.last_error = Some(err);
                }
            });
            translation_failed as *const () as usize as u64
        }
    }
}

extern "C" fn check_synchronization(ctx: *mut ExecutionContext) -> u64 {
    // Safety: generated code always passes the live context
    let ctx = unsafe { &mut *ctx };
    ctx.reset_sync_counter();
    ctx.take_interrupt();
    ctx.is_running() as u64
}

extern "C" fn supervisor_call(ctx: *mut ExecutionContext, address: u64, immediate: u32) {
    // Safety: generated code always passes the live context
    unsafe { &*ctx }.raise(GuestEvent::SupervisorCall { address, immediate });
}

extern "C" fn breakpoint(ctx: *mut ExecutionContext, address: u64, immediate: u32) {
    // Safety: generated code always passes the live context
    unsafe { &*ctx }.raise(GuestEvent::Breakpoint { address, immediate });
}

extern "C" fn undefined_instruction(ctx: *mut ExecutionContext, address: u64, opcode: u32) {
    // Safety: generated code always passes the live context
    unsafe { &*ctx }.raise(GuestEvent::UndefinedInstruction { address, opcode });
}
