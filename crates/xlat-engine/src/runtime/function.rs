//! Translated functions

use std::sync::atomic::{AtomicU32, Ordering};

use super::context::{ExecutionContext, GuestFunction};
use crate::backend::traits::TranslationTier;

/// A guest function translated to host code and placed in the code cache
#[derive(Debug)]
pub struct TranslatedFunction {
    guest_address: u64,
    guest_size: u64,
    /// Host entry point
    entry: usize,
    cache_offset: usize,
    tier: TranslationTier,
    call_count: AtomicU32,
    rejit_threshold: u32,
    /// Call count at which the next rejit request fires
    rejit_at: AtomicU32,
}

impl TranslatedFunction {
    pub fn new(
        guest_address: u64,
        guest_size: u64,
        entry: usize,
        cache_offset: usize,
        tier: TranslationTier,
        rejit_threshold: u32,
    ) -> Self {
        TranslatedFunction {
            guest_address,
            guest_size,
            entry,
            cache_offset,
            tier,
            call_count: AtomicU32::new(0),
            rejit_threshold,
            rejit_at: AtomicU32::new(rejit_threshold),
        }
    }

    /// Count one call; true once when a baseline function reaches the threshold,
    /// and again only after `rearm_rejit`
    pub fn should_rejit(&self) -> bool {
        if self.tier != TranslationTier::Baseline || self.rejit_threshold == 0 {
            return false;
        }
        let calls = self.call_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        calls == self.rejit_at.load(Ordering::Relaxed)
    }

    /// Fire again after another `rejit_threshold` calls; used when a request
    /// could not be queued
    pub fn rearm_rejit(&self) {
        let next = self.call_count().wrapping_add(self.rejit_threshold);
        self.rejit_at.store(next, Ordering::Relaxed);
    }

    pub fn guest_address(&self) -> u64 {
        self.guest_address
    }

    pub fn guest_size(&self) -> u64 {
        self.guest_size
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn cache_offset(&self) -> usize {
        self.cache_offset
    }

    pub fn tier(&self) -> TranslationTier {
        self.tier
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Entry point as a callable function pointer
    ///
    /// # Safety
    /// The entry must point at code produced for the host by a real backend.
    pub unsafe fn as_guest_function(&self) -> GuestFunction {
        // Safety: upheld by the caller
        unsafe { std::mem::transmute::<usize, GuestFunction>(self.entry) }
    }

    /// Run the function; returns the guest address to continue at
    ///
    /// # Safety
    /// See `as_guest_function`.
    pub unsafe fn execute(&self, ctx: &mut ExecutionContext) -> u64 {
        // Safety: upheld by the caller
        unsafe { (self.as_guest_function())(ctx as *mut ExecutionContext) }
    }
}
