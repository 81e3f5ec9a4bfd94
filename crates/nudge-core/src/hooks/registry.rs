// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook factories keyed by hook type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::ResponseAction;

/// Rebuilds a response action from stored hook parameters.
pub type HookFactory =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn ResponseAction>> + Send + Sync>;

/// Maps a `hook_type` tag to its factory. Filled at startup, read-only after.
#[derive(Clone, Default)]
pub struct HookFactoryRegistry {
    factories: HashMap<String, HookFactory>,
}

impl HookFactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for a hook type.
    pub fn register<F>(&mut self, hook_type: impl Into<String>, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<Arc<dyn ResponseAction>> + Send + Sync + 'static,
    {
        self.factories.insert(hook_type.into(), Arc::new(factory));
    }

    /// Whether a factory exists for the tag.
    pub fn contains(&self, hook_type: &str) -> bool {
        self.factories.contains_key(hook_type)
    }

    /// Build the action for a tag.
    pub fn build(
        &self,
        hook_type: &str,
        params: &HashMap<String, String>,
    ) -> Result<Arc<dyn ResponseAction>> {
        let factory = self
            .factories
            .get(hook_type)
            .ok_or_else(|| EngineError::not_found("hook type", hook_type))?;
        factory(params)
    }
}

impl fmt::Debug for HookFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("HookFactoryRegistry")
            .field("hook_types", &types)
            .finish()
    }
}
