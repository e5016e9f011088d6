//! Profiling infrastructure for hot function detection and rejit

pub mod counters;
pub mod policy;

use crate::pipeline::frontend::ExecutionMode;

pub use counters::{TranslationCounters, TranslationStats};
pub use policy::{RejitPolicy, DEFAULT_REJIT_THRESHOLD};

/// A request to recompile a hot function at high quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejitRequest {
    /// Guest address of the function
    pub address: u64,
    /// Mode it was decoded in
    pub mode: ExecutionMode,
}

/// Handle to the rejit queue.
///
/// Dropping this handle closes the channel, causing background workers to exit.
pub struct BackgroundRejit {
    /// Sender for submitting rejit requests
    tx: crossbeam::channel::Sender<RejitRequest>,
}

impl BackgroundRejit {
    /// Submit a rejit request. Returns false if the channel is full or closed.
    pub fn try_submit(&self, request: RejitRequest) -> bool {
        self.tx.try_send(request).is_ok()
    }

    /// Create a BackgroundRejit from a sender (used internally by Translator).
    pub(crate) fn new(tx: crossbeam::channel::Sender<RejitRequest>) -> Self {
        Self { tx }
    }
}
