// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-participant state and auxiliary data.
//!
//! The manager holds no cache: every call is a fresh round trip to the store,
//! so two events for different participants never contend and two events for
//! the same participant are ordered by the store. Callers that need "only if
//! still in state X" semantics use [`StateManager::transition_state`], which
//! turns a lost race into [`EngineError::Conflict`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::persistence::{FlowStateRecord, Persistence};

/// Reads and writes participant state through the store.
#[derive(Clone)]
pub struct StateManager {
    persistence: Arc<dyn Persistence>,
}

impl StateManager {
    /// Create a manager over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Current state, or `None` when the participant has no state in the flow.
    pub async fn get_current_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<String>> {
        let record = self
            .persistence
            .get_flow_state(participant_id, flow_id)
            .await?;
        Ok(record
            .map(|r| r.current_state)
            .filter(|state| !state.is_empty()))
    }

    /// Current state, falling back to the flow's initial state.
    pub async fn current_state_or(
        &self,
        participant_id: &str,
        flow_id: &str,
        initial: &str,
    ) -> Result<String> {
        Ok(self
            .get_current_state(participant_id, flow_id)
            .await?
            .unwrap_or_else(|| initial.to_string()))
    }

    /// Unconditionally set the current state.
    pub async fn set_current_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        state: &str,
    ) -> Result<()> {
        self.persistence
            .upsert_flow_state(participant_id, flow_id, state)
            .await?;
        debug!(participant_id, flow_id, state, "State set");
        Ok(())
    }

    /// Move from `from` to `to`, failing with `Conflict` if the stored state
    /// is no longer `from`.
    pub async fn transition_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let applied = self
            .persistence
            .update_flow_state_if(participant_id, flow_id, from, to)
            .await?;

        if !applied {
            let actual = self
                .get_current_state(participant_id, flow_id)
                .await?
                .unwrap_or_default();
            return Err(EngineError::Conflict {
                participant: participant_id.to_string(),
                expected: from.to_string(),
                actual,
            });
        }

        debug!(participant_id, flow_id, from, to, "State transitioned");
        Ok(())
    }

    /// One data value, or `None` when missing or empty.
    pub async fn get_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let record = self
            .persistence
            .get_flow_state(participant_id, flow_id)
            .await?;
        Ok(record
            .and_then(|mut r| r.state_data.remove(key))
            .filter(|value| !value.is_empty()))
    }

    /// All non-empty data values.
    pub async fn get_all_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<HashMap<String, String>> {
        let record = self
            .persistence
            .get_flow_state(participant_id, flow_id)
            .await?;
        Ok(record
            .map(|r| {
                r.state_data
                    .into_iter()
                    .filter(|(_, value)| !value.is_empty())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Write one data value.
    pub async fn set_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.persistence
            .set_state_data(participant_id, flow_id, key, value)
            .await
    }

    /// Blank out one data value.
    pub async fn clear_state_data(&self, participant_id: &str, flow_id: &str, key: &str) -> Result<()> {
        self.persistence
            .set_state_data(participant_id, flow_id, key, "")
            .await
    }

    /// Delete the participant's row in the flow, data included.
    pub async fn reset_state(&self, participant_id: &str, flow_id: &str) -> Result<()> {
        self.persistence
            .delete_flow_state(participant_id, flow_id)
            .await?;
        debug!(participant_id, flow_id, "State reset");
        Ok(())
    }

    /// Full record, for inspection.
    pub async fn snapshot(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<FlowStateRecord>> {
        self.persistence.get_flow_state(participant_id, flow_id).await
    }
}
