//! Translation orchestrator
//!
//! `Translator` owns every process-lifetime structure: the code cache, jump
//! tables, address table, dispatch stubs and the registry of published
//! functions. Any thread may translate; duplicate work is resolved at
//! publication, where the first writer wins and the loser's code is
//! unmapped.
//!
//! Baseline translations count their calls. When one gets hot it is queued
//! for a high-quality recompile, which replaces the registry entry and
//! repatches every jump-table slot that targets it.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::traits::{CodegenBackend, CompileOptions, TranslationTier};
use crate::pipeline::frontend::{self, ExecutionMode, FrontendError, GuestDecoder, Linkage};
use crate::pipeline::{PipelineError, TranslationPipeline};
use crate::profiling::{BackgroundRejit, RejitPolicy, RejitRequest, TranslationCounters, TranslationStats};
use crate::runtime::address_table::{AddressTable, AddressTableError, AddressTableLevel, LEVELS_64_BIT};
use crate::runtime::code_cache::{CacheError, CodeCache};
use crate::runtime::context::ExecutionContext;
use crate::runtime::function::TranslatedFunction;
use crate::runtime::jump_table::{DynamicTable, JumpTable};
use crate::runtime::native;
use crate::runtime::registry::{Published, TranslationRegistry};
use crate::runtime::stubs::{StubError, TranslatorStubs};

/// Translator configuration
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// Bytes reserved for host code (default: 64 MiB)
    pub code_cache_size: usize,
    /// Direct jump table slots (default: 65536)
    pub jump_table_size: usize,
    /// Dynamic jump table slots (default: 65536)
    pub dynamic_table_size: usize,
    /// Slots probed per indirect jump site (default: 4)
    pub dynamic_probe_count: usize,
    /// When hot baseline functions are recompiled
    pub rejit: RejitPolicy,
    /// Background rejit threads; 0 leaves rejits to `process_pending_rejits`
    pub rejit_workers: usize,
    /// Pending rejit requests before new ones are dropped (default: 1024)
    pub rejit_queue_size: usize,
    /// Bit fields of the fast-dispatch address table
    pub address_table_levels: Vec<AddressTableLevel>,
    /// Whether exits may use host tail calls (default: true)
    pub allow_tail_calls: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        TranslatorConfig {
            code_cache_size: 64 * 1024 * 1024,
            jump_table_size: 1 << 16,
            dynamic_table_size: 1 << 16,
            dynamic_probe_count: 4,
            rejit: RejitPolicy::default(),
            rejit_workers: (num_cpus::get() / 4).max(1),
            rejit_queue_size: 1024,
            address_table_levels: LEVELS_64_BIT.to_vec(),
            allow_tail_calls: true,
        }
    }
}

/// Errors from any translation stage
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Frontend error: {0}")]
    Frontend(#[from] FrontendError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Code cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Dispatch stub error: {0}")]
    Stub(#[from] StubError),
    #[error("Address table error: {0}")]
    AddressTable(#[from] AddressTableError),
}

/// Top-level translation engine
pub struct Translator {
    config: TranslatorConfig,
    decoder: Arc<dyn GuestDecoder>,
    pipeline: Arc<TranslationPipeline>,
    cache: Arc<CodeCache>,
    jump_table: JumpTable,
    dynamic_table: DynamicTable,
    address_table: Arc<AddressTable>,
    stubs: TranslatorStubs,
    registry: TranslationRegistry,
    counters: TranslationCounters,
    rejit_queue: BackgroundRejit,
    rejit_rx: crossbeam::channel::Receiver<RejitRequest>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Translator {
    /// Create a translator and its background rejit workers
    ///
    /// The slow dispatch stub is built up front; it is the initial target of
    /// every direct jump table slot.
    pub fn new(
        backend: Arc<dyn CodegenBackend>,
        decoder: Arc<dyn GuestDecoder>,
        config: TranslatorConfig,
    ) -> Result<Arc<Self>, TranslateError> {
        let cache = Arc::new(CodeCache::new(config.code_cache_size)?);
        let address_table = Arc::new(AddressTable::new(&config.address_table_levels)?);
        let pipeline = Arc::new(TranslationPipeline::new(backend));
        let stubs = TranslatorStubs::new(cache.clone(), pipeline.clone(), address_table.clone());

        let jump_table = JumpTable::new(config.jump_table_size);
        jump_table.set_default_host(stubs.slow_dispatch_stub()? as u64);
        let dynamic_table = DynamicTable::new(config.dynamic_table_size, config.dynamic_probe_count);

        let (tx, rx) = crossbeam::channel::bounded(config.rejit_queue_size.max(1));
        let translator = Arc::new(Translator {
            decoder,
            pipeline,
            cache,
            jump_table,
            dynamic_table,
            address_table,
            stubs,
            registry: TranslationRegistry::new(),
            counters: TranslationCounters::new(),
            rejit_queue: BackgroundRejit::new(tx),
            rejit_rx: rx,
            workers: Mutex::new(Vec::new()),
            config,
        });

        if translator.config.rejit.is_enabled() {
            translator.start_workers();
        }
        debug!(
            backend = translator.pipeline.backend().name(),
            workers = translator.workers.lock().len(),
            "translator ready"
        );
        Ok(translator)
    }

    fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for id in 0..self.config.rejit_workers {
            let translator = Arc::downgrade(self);
            let rx = self.rejit_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("xlat-rejit-{}", id))
                .spawn(move || rejit_worker(translator, rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(error = %err, "failed to spawn rejit worker"),
            }
        }
    }

    // ===== Translation =====

    /// Registered translation of `address`, translating it on a miss
    pub fn get_or_translate(&self, address: u64, mode: ExecutionMode) -> Result<Arc<TranslatedFunction>, TranslateError> {
        if let Some(function) = self.registry.get(address) {
            return Ok(function);
        }

        let function = self.translate(address, mode, TranslationTier::Baseline)?;
        match self.registry.publish(address, function.clone(), |f| self.patch(address, f)) {
            Published::Inserted(function) => {
                self.counters.record_translation();
                debug!(
                    address = format_args!("{address:#x}"),
                    guest_size = function.guest_size(),
                    entry = format_args!("{:#x}", function.entry()),
                    "published translation"
                );
                Ok(function)
            }
            Published::Existing(winner) => {
                self.cache.unmap(function.cache_offset());
                self.counters.record_race_lost();
                debug!(address = format_args!("{address:#x}"), "lost publication race");
                Ok(winner)
            }
        }
    }

    /// Host entry of `address`, counting the call toward rejit
    pub fn resolve_entry(&self, address: u64, mode: ExecutionMode) -> Result<usize, TranslateError> {
        let function = self.get_or_translate(address, mode)?;
        self.count_call(&function, mode);
        Ok(function.entry())
    }

    /// Decode, emit, compile and map one function without publishing it
    fn translate(
        &self,
        address: u64,
        mode: ExecutionMode,
        tier: TranslationTier,
    ) -> Result<Arc<TranslatedFunction>, TranslateError> {
        self.try_translate(address, mode, tier).inspect_err(|err| {
            self.counters.record_failure();
            warn!(address = format_args!("{address:#x}"), ?tier, error = %err, "translation failed");
        })
    }

    fn try_translate(
        &self,
        address: u64,
        mode: ExecutionMode,
        tier: TranslationTier,
    ) -> Result<Arc<TranslatedFunction>, TranslateError> {
        let blocks = self.decoder.decode_function(address, mode).map_err(FrontendError::from)?;
        let linkage = Linkage {
            jump_table: &self.jump_table,
            dynamic_table: &self.dynamic_table,
            allow_tail_calls: self.config.allow_tail_calls,
        };
        let emitted = frontend::emit_function(&blocks, address, mode, linkage)?;

        let options = CompileOptions { tier, allow_tail_calls: self.config.allow_tail_calls };
        let unit = self.pipeline.compile_guest(emitted.cfg, options)?;
        let entry = self.cache.map(&unit)?;

        Ok(Arc::new(TranslatedFunction::new(
            address,
            emitted.guest_size,
            self.cache.host_address(entry.offset),
            entry.offset,
            tier,
            self.config.rejit.threshold,
        )))
    }

    /// Point the jump and address tables at a newly published function
    fn patch(&self, address: u64, function: &TranslatedFunction) {
        let host = function.entry() as u64;
        self.jump_table.register_function(address, host);
        if self.address_table.is_valid(address) {
            if let Err(err) = self.address_table.set(address, host) {
                warn!(address = format_args!("{address:#x}"), error = %err, "address table update failed");
            }
        }
    }

    // ===== Rejit =====

    fn count_call(&self, function: &TranslatedFunction, mode: ExecutionMode) {
        if !self.config.rejit.should_rejit(function) {
            return;
        }
        let request = RejitRequest { address: function.guest_address(), mode };
        self.counters.record_rejit_request();
        if !self.rejit_queue.try_submit(request) {
            function.rearm_rejit();
            warn!(address = format_args!("{:#x}", request.address), "rejit queue full, retrying later");
        }
    }

    /// Recompile at high quality, replace the registered function and repatch
    /// its dependents; the previous code stays mapped for threads still in it
    pub fn rejit(&self, request: RejitRequest) -> Result<Arc<TranslatedFunction>, TranslateError> {
        let address = request.address;
        let function = self.translate(address, request.mode, TranslationTier::HighQuality)?;
        let previous = self.registry.replace(address, function.clone(), |f| self.patch(address, f));
        self.counters.record_rejit();
        info!(
            address = format_args!("{address:#x}"),
            previous_calls = previous.map(|f| f.call_count()).unwrap_or(0),
            dependents = self.jump_table.dependents(address).len(),
            "rejitted function"
        );
        Ok(function)
    }

    /// Run queued rejit requests on the calling thread; returns how many ran
    pub fn process_pending_rejits(&self) -> usize {
        let mut processed = 0;
        while let Ok(request) = self.rejit_rx.try_recv() {
            // The baseline stays in place on failure
            if let Err(err) = self.rejit(request) {
                warn!(address = format_args!("{:#x}", request.address), error = %err, "rejit failed");
            }
            processed += 1;
        }
        processed
    }

    // ===== Execution =====

    /// Run guest code from `address` until the context stops
    ///
    /// Returns the guest address execution stopped at.
    pub fn execute(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<u64, TranslateError> {
        let binding = native::bind(self.clone(), mode, ctx as *mut ExecutionContext);
        let mut next = address;
        while ctx.is_running() {
            next = self.run_function(ctx, next, mode)?;
            if let Some(err) = binding.take_error() {
                return Err(err);
            }
        }
        Ok(next)
    }

    /// Run one translated function and return the next guest address
    pub fn execute_single(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<u64, TranslateError> {
        let binding = native::bind(self.clone(), mode, ctx as *mut ExecutionContext);
        let next = self.run_function(ctx, address, mode)?;
        match binding.take_error() {
            Some(err) => Err(err),
            None => Ok(next),
        }
    }

    fn run_function(&self, ctx: &mut ExecutionContext, address: u64, mode: ExecutionMode) -> Result<u64, TranslateError> {
        let function = self.get_or_translate(address, mode)?;
        self.count_call(&function, mode);
        // Safety: entries come from the configured backend for this host
        Ok(unsafe { function.execute(ctx) })
    }

    // ===== Accessors =====

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &TranslationRegistry {
        &self.registry
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn jump_table(&self) -> &JumpTable {
        &self.jump_table
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.dynamic_table
    }

    pub fn address_table(&self) -> &AddressTable {
        &self.address_table
    }

    pub fn stubs(&self) -> &TranslatorStubs {
        &self.stubs
    }

    pub fn pipeline(&self) -> &TranslationPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> TranslationStats {
        self.counters.snapshot()
    }

    /// Number of background rejit threads running
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

/// Background rejit loop; exits once the translator is gone
fn rejit_worker(translator: Weak<Translator>, rx: crossbeam::channel::Receiver<RejitRequest>) {
    while let Ok(request) = rx.recv() {
        let Some(translator) = translator.upgrade() else { break };
        if let Err(err) = translator.rejit(request) {
            warn!(address = format_args!("{:#x}", request.address), error = %err, "rejit failed");
        }
    }
}
