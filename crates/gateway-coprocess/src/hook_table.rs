//! Process-wide `api_id -> hooks` table
//!
//! Each entry is an immutable [`HookSet`] behind an `Arc`. Replacing an
//! entry swaps the whole `Arc`, so a lookup sees either the old set or the
//! new one and never a mix. Readers clone the `Arc` and release the map
//! guard before running a hook.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::bundle::{Bundle, HookHandler, HookMap};

/// The active hooks of one API, all from the same bundle
#[derive(Debug)]
pub struct HookSet {
    bundle: Arc<Bundle>,
    hooks: HookMap,
}

impl HookSet {
    pub fn new(bundle: Arc<Bundle>, hooks: HookMap) -> Self {
        Self { bundle, hooks }
    }

    /// The bundle every handler in this set belongs to
    pub fn bundle(&self) -> &Arc<Bundle> {
        &self.bundle
    }

    pub fn get(&self, hook_name: &str) -> Option<&Arc<HookHandler>> {
        self.hooks.get(hook_name)
    }

    pub fn hooks(&self) -> &HashMap<String, Arc<HookHandler>> {
        &self.hooks
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Concurrent map from API id to its active hook set
#[derive(Debug, Default)]
pub struct HookTable {
    entries: DashMap<String, Arc<HookSet>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current hook set for `api_id`
    pub fn get(&self, api_id: &str) -> Option<Arc<HookSet>> {
        self.entries.get(api_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `set` for `api_id`, returning the set it replaced
    pub fn install(&self, api_id: &str, set: Arc<HookSet>) -> Option<Arc<HookSet>> {
        self.entries.insert(api_id.to_string(), set)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// API ids with an installed set, sorted
    pub fn api_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
