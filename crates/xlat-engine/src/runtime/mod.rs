//! Runtime support for translated code
//!
//! Everything here outlives a single translation: the executable code
//! cache, the jump and address tables generated code dispatches through,
//! the guest execution context, native helpers, dispatch stubs and the
//! registry of published functions.

pub mod address_table;
pub mod code_cache;
pub mod context;
pub mod dispatch;
pub mod function;
pub mod jump_table;
pub mod native;
pub mod registry;
pub mod stubs;

pub use address_table::{AddressTable, AddressTableError, AddressTableLevel, LEVELS_32_BIT, LEVELS_64_BIT};
pub use code_cache::{CacheEntry, CacheError, CodeCache, CODE_ALIGNMENT};
pub use context::{ExecutionContext, GuestEvent, GuestFunction, DEFAULT_SYNC_BUDGET};
pub use dispatch::DispatchError;
pub use function::TranslatedFunction;
pub use jump_table::{DynamicProbe, DynamicTable, JumpTable, JumpTableEntry, JumpTableError};
pub use native::{NativeError, NativeFunction, NativeHelper};
pub use registry::{Published, TranslationRegistry};
pub use stubs::{StubError, StubState, TranslatorStubs};
