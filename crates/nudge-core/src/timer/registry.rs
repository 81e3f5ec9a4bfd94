// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback registry: how to rebuild a timer callback from stored data.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::TimerFuture;

/// Builds a timer callback from its stored parameters.
pub type CallbackFactory =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<TimerFuture> + Send + Sync>;

/// Maps a `callback_type` tag to the factory that rebuilds its callback.
///
/// Populated once at startup, then shared read-only behind an `Arc`.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    factories: HashMap<String, CallbackFactory>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for a callback type.
    pub fn register<F>(&mut self, callback_type: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<TimerFuture> + Send + Sync + 'static,
    {
        self.factories
            .insert(callback_type.into(), Arc::new(factory));
    }

    /// Whether a factory exists for the tag.
    pub fn contains(&self, callback_type: &str) -> bool {
        self.factories.contains_key(callback_type)
    }

    /// Registered tags, sorted.
    pub fn callback_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Rebuild the callback for a tag.
    pub fn build(
        &self,
        callback_type: &str,
        params: &HashMap<String, String>,
    ) -> Result<TimerFuture> {
        let factory = self
            .factories
            .get(callback_type)
            .ok_or_else(|| EngineError::not_found("callback type", callback_type))?;
        factory(params)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callback_types", &self.callback_types())
            .finish()
    }
}

/// Fetch a required parameter.
pub fn required_param<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::validation(name, "missing callback parameter"))
}
