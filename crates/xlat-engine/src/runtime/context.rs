//! Guest execution context and the calling convention of translated code
//!
//! Translated functions receive a pointer to the thread's `ExecutionContext`
//! and return the guest address execution should continue at. Guest
//! registers are loaded from the context on function entry and written back
//! before every exit.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::ir::operand::{Register, RegisterKind, FLAG_REGISTER_COUNT, INT_REGISTER_COUNT, VECTOR_REGISTER_COUNT};

/// Entry point signature of translated code and dispatch stubs
pub type GuestFunction = unsafe extern "C" fn(ctx: *mut ExecutionContext) -> u64;

/// Default number of synchronization checks between preemption polls
pub const DEFAULT_SYNC_BUDGET: i32 = 100;

/// Guest-visible event that stopped execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    SupervisorCall { address: u64, immediate: u32 },
    Breakpoint { address: u64, immediate: u32 },
    UndefinedInstruction { address: u64, opcode: u32 },
}

const EVENT_NONE: u32 = 0;
const EVENT_SUPERVISOR_CALL: u32 = 1;
const EVENT_BREAKPOINT: u32 = 2;
const EVENT_UNDEFINED: u32 = 3;

/// Per-thread guest CPU state shared with generated code
#[repr(C)]
pub struct ExecutionContext {
    pub registers: [u64; INT_REGISTER_COUNT as usize],
    pub vectors: [u128; VECTOR_REGISTER_COUNT as usize],
    pub flags: [u32; FLAG_REGISTER_COUNT as usize],
    /// Guest address the dispatch stubs resolve
    pub dispatch_address: u64,
    /// Decremented by every synchronization check; a poll happens at zero
    pub sync_counter: i32,
    sync_budget: i32,
    running: AtomicBool,
    interrupt_requested: AtomicBool,
    event_kind: AtomicU32,
    event_address: AtomicU64,
    event_value: AtomicU32,
}

impl ExecutionContext {
    pub const DISPATCH_ADDRESS_OFFSET: usize = std::mem::offset_of!(ExecutionContext, dispatch_address);
    pub const SYNC_COUNTER_OFFSET: usize = std::mem::offset_of!(ExecutionContext, sync_counter);

    pub fn new() -> Box<Self> {
        Box::new(ExecutionContext {
            registers: [0; INT_REGISTER_COUNT as usize],
            vectors: [0; VECTOR_REGISTER_COUNT as usize],
            flags: [0; FLAG_REGISTER_COUNT as usize],
            dispatch_address: 0,
            sync_counter: DEFAULT_SYNC_BUDGET,
            sync_budget: DEFAULT_SYNC_BUDGET,
            running: AtomicBool::new(true),
            interrupt_requested: AtomicBool::new(false),
            event_kind: AtomicU32::new(EVENT_NONE),
            event_address: AtomicU64::new(0),
            event_value: AtomicU32::new(0),
        })
    }

    /// Byte offset of a guest register inside the context
    pub fn register_offset(reg: Register) -> usize {
        match reg.kind {
            RegisterKind::Integer => {
                std::mem::offset_of!(ExecutionContext, registers) + reg.index as usize * 8
            }
            RegisterKind::Vector => std::mem::offset_of!(ExecutionContext, vectors) + reg.index as usize * 16,
            RegisterKind::Flag => std::mem::offset_of!(ExecutionContext, flags) + reg.index as usize * 4,
        }
    }

    pub fn set_sync_budget(&mut self, budget: i32) {
        self.sync_budget = budget.max(1);
        self.sync_counter = self.sync_budget;
    }

    /// Refill the synchronization counter
    pub fn reset_sync_counter(&mut self) {
        self.sync_counter = self.sync_budget;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop at the next synchronization check
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.interrupt_requested.store(true, Ordering::Release);
    }

    /// Allow execution again after `stop` or a guest event
    pub fn resume(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Ask the thread to poll at its next synchronization check
    pub fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
    }

    /// Clear and return the interrupt flag
    pub fn take_interrupt(&self) -> bool {
        self.interrupt_requested.swap(false, Ordering::AcqRel)
    }

    /// Record a guest event and stop execution
    pub fn raise(&self, event: GuestEvent) {
        let (kind, address, value) = match event {
            GuestEvent::SupervisorCall { address, immediate } => (EVENT_SUPERVISOR_CALL, address, immediate),
            GuestEvent::Breakpoint { address, immediate } => (EVENT_BREAKPOINT, address, immediate),
            GuestEvent::UndefinedInstruction { address, opcode } => (EVENT_UNDEFINED, address, opcode),
        };
        self.event_address.store(address, Ordering::Relaxed);
        self.event_value.store(value, Ordering::Relaxed);
        self.event_kind.store(kind, Ordering::Release);
        self.stop();
    }

    /// Take the pending guest event, if any
    pub fn take_event(&self) -> Option<GuestEvent> {
        let kind = self.event_kind.swap(EVENT_NONE, Ordering::AcqRel);
        let address = self.event_address.load(Ordering::Relaxed);
        let value = self.event_value.load(Ordering::Relaxed);
        match kind {
            EVENT_SUPERVISOR_CALL => Some(GuestEvent::SupervisorCall { address, immediate: value }),
            EVENT_BREAKPOINT => Some(GuestEvent::Breakpoint { address, immediate: value }),
            EVENT_UNDEFINED => Some(GuestEvent::UndefinedInstruction { address, opcode: value }),
            _ => None,
        }
    }
}
