//! Rejit policy: decides whether a hot baseline function is recompiled
//!
//! The call counter on `TranslatedFunction` fires once at the threshold, and
//! again only if the request could not be queued; the policy then filters out
//! functions not worth optimizing.

use crate::backend::traits::TranslationTier;
use crate::runtime::function::TranslatedFunction;

/// Default number of calls before a baseline function is rejitted
pub const DEFAULT_REJIT_THRESHOLD: u32 = 100;

/// Configuration for when to trigger high-quality recompilation
#[derive(Debug, Clone)]
pub struct RejitPolicy {
    /// Calls before a baseline function asks for rejit (0 disables rejit)
    pub threshold: u32,
    /// Largest guest function (in bytes) worth recompiling
    pub max_guest_size: u64,
}

impl RejitPolicy {
    /// Create a policy with default thresholds
    pub fn new() -> Self {
        RejitPolicy { threshold: DEFAULT_REJIT_THRESHOLD, max_guest_size: 64 * 1024 }
    }

    /// Policy that never rejits
    pub fn disabled() -> Self {
        RejitPolicy { threshold: 0, ..Self::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Count a call to `function`; true when it should be recompiled now
    pub fn should_rejit(&self, function: &TranslatedFunction) -> bool {
        if !self.is_enabled() || function.tier() != TranslationTier::Baseline {
            return false;
        }
        if !function.should_rejit() {
            return false;
        }
        function.guest_size() <= self.max_guest_size
    }
}

impl Default for RejitPolicy {
    fn default() -> Self {
        Self::new()
    }
}
