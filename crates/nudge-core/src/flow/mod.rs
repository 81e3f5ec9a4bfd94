// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow definitions and the flow contract.
//!
//! A flow is a static transition table ([`FlowDefinition`]) plus the code
//! that decides, for each inbound message or timeout, which transition to
//! take. The shared [`executor::FlowExecutor`] validates and applies those
//! transitions, so every flow gets the same conditional-write semantics.

pub mod executor;
pub mod intervention;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::hooks::ResponseAction;
use crate::messaging::InboundMessage;
use crate::persistence::ParticipantRecord;
use crate::timer::CallbackRegistry;

/// A timeout that applies while a participant sits in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    /// Timeout class.
    pub id: &'static str,
    /// Callback type registered for the timeout.
    pub callback_type: &'static str,
    /// State data key holding the pending timer id.
    pub timer_key: &'static str,
}

/// Static configuration of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    /// State tag.
    pub name: &'static str,
    /// What the participant is being asked.
    pub description: &'static str,
    /// States reachable by an ordinary transition.
    pub possible_next_states: &'static [&'static str],
    /// Data keys that must be present on entry.
    pub required_data: &'static [&'static str],
    /// Data keys that may be written while in the state.
    pub optional_data: &'static [&'static str],
    /// Timeouts armed on entry.
    pub timeouts: &'static [TimeoutInfo],
    /// Template sent on entry, if any.
    pub message_template: Option<&'static str>,
}

/// A flow's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDefinition {
    /// Flow identifier.
    pub flow_id: &'static str,
    /// State of a newly enrolled participant.
    pub initial_state: &'static str,
    /// Declared states.
    pub states: &'static [StateInfo],
}

impl FlowDefinition {
    /// Look up a state.
    pub fn state(&self, name: &str) -> Option<&'static StateInfo> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Look up a state, failing with `Validation` for undeclared names.
    pub fn require_state(&self, name: &str) -> Result<&'static StateInfo> {
        self.state(name).ok_or_else(|| {
            EngineError::validation(
                "state",
                format!("'{name}' is not a state of flow {}", self.flow_id),
            )
        })
    }

    /// Whether `to` is in `from`'s allowed next states.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.state(from)
            .is_some_and(|s| s.possible_next_states.contains(&to))
    }

    /// Fail with `InvalidTransition` unless `from -> to` is allowed.
    pub fn validate_transition(&self, from: &str, to: &str) -> Result<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                flow: self.flow_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Every timer slot key used by the flow, without duplicates.
    pub fn timer_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self
            .states
            .iter()
            .flat_map(|s| s.timeouts.iter().map(|t| t.timer_key))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// A conversation flow.
#[async_trait]
pub trait Flow: Send + Sync {
    /// Static transition table.
    fn definition(&self) -> &'static FlowDefinition;

    /// Flow identifier.
    fn flow_id(&self) -> &'static str {
        self.definition().flow_id
    }

    /// Hook type used for the flow's persistent hooks.
    fn hook_type(&self) -> &'static str;

    /// Add the flow's timer callback factories.
    fn register_callbacks(self: Arc<Self>, registry: &mut CallbackRegistry);

    /// Put a newly enrolled participant in the initial state.
    async fn start(&self, participant: &ParticipantRecord) -> Result<()>;

    /// Handle a message from the participant.
    async fn handle_response(&self, participant_id: &str, message: &InboundMessage) -> Result<()>;

    /// Run the entry actions of `state` after an operator moved the
    /// participant there.
    async fn enter_state(&self, participant: &ParticipantRecord, state: &str) -> Result<()>;

    /// Cancel every timer the flow holds for the participant.
    async fn cancel_timers(&self, participant_id: &str) -> Result<()>;

    /// Rebuild schedule-derived reminders for an active participant.
    async fn recover_reminders(&self, participant: &ParticipantRecord) -> Result<()>;
}

/// Routes a participant's messages into a flow.
pub struct FlowHook {
    flow: Arc<dyn Flow>,
    participant_id: String,
}

impl FlowHook {
    /// Hook for one participant.
    pub fn new(flow: Arc<dyn Flow>, participant_id: impl Into<String>) -> Self {
        Self {
            flow,
            participant_id: participant_id.into(),
        }
    }
}

#[async_trait]
impl ResponseAction for FlowHook {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        self.flow
            .handle_response(&self.participant_id, message)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::intervention::INTERVENTION_FLOW;

    #[test]
    fn test_intervention_table() {
        let def = &INTERVENTION_FLOW;
        assert_eq!(def.initial_state, "ORIENTATION");
        assert!(def.can_transition("COMMITMENT_PROMPT", "FEELING_PROMPT"));
        assert!(def.can_transition("END_OF_DAY", "WEEKLY_SUMMARY"));
        assert!(!def.can_transition("ORIENTATION", "END_OF_DAY"));
        assert!(def.validate_transition("FEELING_PROMPT", "MOOD_QUESTION").is_err());
        assert!(def.require_state("NOT_A_STATE").is_err());
    }

    #[test]
    fn test_every_next_state_is_declared() {
        let def = &INTERVENTION_FLOW;
        for state in def.states {
            for next in state.possible_next_states {
                assert!(def.state(next).is_some(), "{} -> {next}", state.name);
            }
        }
    }

    #[test]
    fn test_timer_keys() {
        let keys = INTERVENTION_FLOW.timer_keys();
        assert!(keys.contains(&"commitment_timer_id"));
        assert!(keys.contains(&"feeling_timer_id"));
        let mut deduped = keys.clone();
        deduped.dedup();
        assert_eq!(keys, deduped);
    }
}
