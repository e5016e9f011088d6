//! Registry of published translations
//!
//! Several threads may translate the same guest address at once. The first
//! one to publish wins; publication runs the caller's patch step while the
//! registry entry is locked, so jump tables point at the new code no later
//! than the registry does.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::function::TranslatedFunction;

/// Outcome of `TranslationRegistry::publish`
pub enum Published {
    /// This function is now the registered translation
    Inserted(Arc<TranslatedFunction>),
    /// Another thread published first; its function is returned
    Existing(Arc<TranslatedFunction>),
}

impl Published {
    pub fn function(&self) -> &Arc<TranslatedFunction> {
        match self {
            Published::Inserted(function) | Published::Existing(function) => function,
        }
    }

    pub fn into_function(self) -> Arc<TranslatedFunction> {
        match self {
            Published::Inserted(function) | Published::Existing(function) => function,
        }
    }
}

/// Guest address -> translated function
pub struct TranslationRegistry {
    functions: DashMap<u64, Arc<TranslatedFunction>>,
}

impl TranslationRegistry {
    pub fn new() -> Self {
        Self { functions: DashMap::new() }
    }

    pub fn get(&self, address: u64) -> Option<Arc<TranslatedFunction>> {
        self.functions.get(&address).map(|entry| entry.clone())
    }

    /// Insert unless already present; `patch` runs only for the winner
    pub fn publish(
        &self,
        address: u64,
        function: Arc<TranslatedFunction>,
        patch: impl FnOnce(&TranslatedFunction),
    ) -> Published {
        match self.functions.entry(address) {
            Entry::Occupied(existing) => Published::Existing(existing.get().clone()),
            Entry::Vacant(vacant) => {
                patch(&function);
                vacant.insert(function.clone());
                Published::Inserted(function)
            }
        }
    }

    /// Replace the registered function (rejit); returns the previous one
    pub fn replace(
        &self,
        address: u64,
        function: Arc<TranslatedFunction>,
        patch: impl FnOnce(&TranslatedFunction),
    ) -> Option<Arc<TranslatedFunction>> {
        match self.functions.entry(address) {
            Entry::Occupied(mut existing) => {
                patch(&function);
                Some(existing.insert(function))
            }
            Entry::Vacant(vacant) => {
                patch(&function);
                vacant.insert(function);
                None
            }
        }
    }

    pub fn remove(&self, address: u64) -> Option<Arc<TranslatedFunction>> {
        self.functions.remove(&address).map(|(_, function)| function)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.functions.contains_key(&address)
    }

    pub fn count(&self) -> usize {
        self.functions.len()
    }

    /// All registered guest addresses
    pub fn addresses(&self) -> Vec<u64> {
        self.functions.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for TranslationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
