//! Translator-wide counters
//!
//! Atomic counters bumped by the orchestrator on every translation, rejit
//! and publication race. Reads are relaxed snapshots, good enough for
//! diagnostics and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one translator
#[derive(Debug, Default)]
pub struct TranslationCounters {
    translations: AtomicU64,
    rejit_requests: AtomicU64,
    rejits: AtomicU64,
    races_lost: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of `TranslationCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationStats {
    /// Baseline translations published
    pub translations: u64,
    /// Hot functions queued for rejit
    pub rejit_requests: u64,
    /// High-quality translations published
    pub rejits: u64,
    /// Translations discarded because another thread published first
    pub races_lost: u64,
    /// Translations that failed at some stage
    pub failures: u64,
}

impl TranslationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a published translation, return new count
    pub fn record_translation(&self) -> u64 {
        self.translations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_rejit_request(&self) -> u64 {
        self.rejit_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_rejit(&self) -> u64 {
        self.rejits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_race_lost(&self) -> u64 {
        self.races_lost.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> TranslationStats {
        TranslationStats {
            translations: self.translations.load(Ordering::Relaxed),
            rejit_requests: self.rejit_requests.load(Ordering::Relaxed),
            rejits: self.rejits.load(Ordering::Relaxed),
            races_lost: self.races_lost.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
