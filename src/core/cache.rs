//! Purpose: Process-lifetime cache shared by all invocations of one worker.
//! Exports: `ExecutionCache`.
//! Role: Holds the lazily-built plugin handle and the free-form state map that
//! scripts use to persist values between calls.
//! Invariants: The initializer passed to `get_or_init` runs at most once
//! between `clear` calls.
//! Invariants: The cached handle is shared, not copied; callers serialize
//! processing through the handle's own lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::core::error::Error;
use crate::core::plugin::PluginHandle;

#[derive(Default)]
pub struct ExecutionCache {
    plugin: Mutex<Option<Arc<Mutex<PluginHandle>>>>,
    state: Mutex<BTreeMap<String, Value>>,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached plugin handle, building it with `init` on first use.
    /// The slot lock is held across `init`, so two racing first calls cannot
    /// both construct a handle.
    pub fn get_or_init<F>(&self, init: F) -> Result<Arc<Mutex<PluginHandle>>, Error>
    where
        F: FnOnce() -> Result<PluginHandle, Error>,
    {
        let mut slot = self
            .plugin
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = Arc::new(Mutex::new(init()?));
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub fn cached(&self) -> Option<Arc<Mutex<PluginHandle>>> {
        self.plugin
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn state_get(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(name)
            .cloned()
    }

    pub fn state_set(&self, name: &str, value: Value) {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(name.to_string(), value);
    }

    pub fn state_has(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .contains_key(name)
    }

    pub fn state_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    /// Drops the cached handle and empties the state map. The next
    /// `get_or_init` runs its initializer again.
    pub fn clear(&self) {
        self.plugin
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
    }
}
