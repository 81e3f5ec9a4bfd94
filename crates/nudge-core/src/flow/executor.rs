// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared transition executor.
//!
//! Flow code decides *what* should happen and describes it as a
//! [`TransitionPlan`]. The executor checks the plan against the flow's table,
//! writes the new state with a compare-and-set on the state the plan was
//! computed from, and only then runs side effects: data writes, timer slot
//! cancellation, new timeouts and the outbound message.
//!
//! A plan computed from a stale state loses the compare-and-set and fails
//! with [`EngineError::Conflict`] before any side effect runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::messaging::MessagingService;
use crate::persistence::ParticipantRecord;
use crate::state_manager::StateManager;
use crate::timer::{DurableTimer, TimerFuture, TimerService};

use super::FlowDefinition;

/// Ordinary transitions follow the table; overrides only need a declared
/// target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Every hop must be an allowed next state.
    Forward,
    /// Operator or participant shortcut that bypasses the table.
    Override,
}

/// A timeout to arm once the transition lands.
pub struct PlannedTimeout {
    /// Data slot that stores the timer id.
    pub slot: &'static str,
    /// Delay before firing.
    pub delay: Duration,
    /// Persistence descriptor.
    pub durable: DurableTimer,
    /// Callback to run.
    pub callback: TimerFuture,
}

/// Everything one event does to a participant.
pub struct TransitionPlan {
    from: String,
    path: Vec<String>,
    kind: TransitionKind,
    data: Vec<(String, String)>,
    cancel: Vec<&'static str>,
    timeouts: Vec<PlannedTimeout>,
    message: Option<String>,
}

impl TransitionPlan {
    /// Forward transition from `from` to `to`.
    pub fn forward(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from.into(), vec![to.into()], TransitionKind::Forward)
    }

    /// Override transition from `from` to `to`.
    pub fn override_to(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from.into(), vec![to.into()], TransitionKind::Override)
    }

    /// No state change; only side effects.
    pub fn stay(state: impl Into<String>) -> Self {
        Self::new(state.into(), Vec::new(), TransitionKind::Forward)
    }

    fn new(from: String, path: Vec<String>, kind: TransitionKind) -> Self {
        Self {
            from,
            path,
            kind,
            data: Vec::new(),
            cancel: Vec::new(),
            timeouts: Vec::new(),
            message: None,
        }
    }

    /// Pass through another state. Each hop is validated.
    pub fn then(mut self, state: impl Into<String>) -> Self {
        self.path.push(state.into());
        self
    }

    /// Write a data value.
    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((key.into(), value.into()));
        self
    }

    /// Cancel the timer whose id is stored in `slot`.
    pub fn cancel(mut self, slot: &'static str) -> Self {
        self.cancel.push(slot);
        self
    }

    /// Arm a durable timeout.
    pub fn timeout(mut self, timeout: PlannedTimeout) -> Self {
        self.timeouts.push(timeout);
        self
    }

    /// Send a message to the participant.
    pub fn message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }

    /// State the participant ends in.
    pub fn target(&self) -> &str {
        self.path.last().unwrap_or(&self.from)
    }

    /// Whether the plan moves the participant.
    pub fn changes_state(&self) -> bool {
        self.target() != self.from
    }
}

/// Applies plans for one flow.
#[derive(Clone)]
pub struct FlowExecutor {
    definition: &'static FlowDefinition,
    state: StateManager,
    timers: TimerService,
    messaging: Arc<dyn MessagingService>,
}

impl FlowExecutor {
    /// Executor for a flow table.
    pub fn new(
        definition: &'static FlowDefinition,
        state: StateManager,
        timers: TimerService,
        messaging: Arc<dyn MessagingService>,
    ) -> Self {
        Self {
            definition,
            state,
            timers,
            messaging,
        }
    }

    /// The flow table.
    pub fn definition(&self) -> &'static FlowDefinition {
        self.definition
    }

    /// Participant's state, or the flow's initial state.
    pub async fn current_state(&self, participant_id: &str) -> Result<String> {
        self.state
            .current_state_or(participant_id, self.definition.flow_id, self.definition.initial_state)
            .await
    }

    /// Validate and apply a plan. Returns the state the participant ends in.
    pub async fn apply(&self, participant: &ParticipantRecord, plan: TransitionPlan) -> Result<String> {
        let flow_id = self.definition.flow_id;
        let participant_id = participant.participant_id.as_str();

        self.validate(&plan)?;
        let target = plan.target().to_string();
        if plan.kind == TransitionKind::Forward && plan.changes_state() {
            let planned: Vec<String> = plan
                .data
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            self.check_required_data(participant_id, &target, &planned)
                .await?;
        }

        if plan.changes_state() {
            self.state
                .transition_state(participant_id, flow_id, &plan.from, &target)
                .await?;
            info!(
                participant_id,
                flow = flow_id,
                from = %plan.from,
                to = %target,
                kind = ?plan.kind,
                "Transition"
            );
        }

        for (key, value) in &plan.data {
            self.state
                .set_state_data(participant_id, flow_id, key, value)
                .await?;
        }

        for slot in &plan.cancel {
            self.cancel_slot(participant_id, slot).await?;
        }

        for timeout in plan.timeouts {
            let durable = timeout.durable.state(target.clone()).data_key(timeout.slot);
            let timer_id = self
                .timers
                .schedule_after_durable(timeout.delay, durable, timeout.callback)
                .await?;
            self.state
                .set_state_data(participant_id, flow_id, timeout.slot, &timer_id)
                .await?;
            debug!(participant_id, slot = timeout.slot, %timer_id, "Timeout armed");
        }

        if let Some(text) = plan.message {
            self.messaging
                .send_message(&participant.address, &text)
                .await?;
        }

        Ok(target)
    }

    /// Operator transition.
    ///
    /// Without `force` the target must be an allowed next state and its
    /// required data must be present. With `force` any declared state is
    /// accepted. Pending timeouts are cancelled either way.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidTransition`] when, without `force`, `to` is not
    ///   an allowed next state.
    /// - [`EngineError::Validation`] when `to` is not a declared state, or
    ///   when, without `force`, the target's required data is missing. The
    ///   error names the missing key.
    pub async fn advance(
        &self,
        participant_id: &str,
        to: &str,
        reason: &str,
        force: bool,
    ) -> Result<String> {
        let flow_id = self.definition.flow_id;
        let target = self.definition.require_state(to)?;
        let from = self.current_state(participant_id).await?;

        if !force {
            self.definition.validate_transition(&from, to)?;
            let data = self.state.get_all_state_data(participant_id, flow_id).await?;
            if let Some(missing) = target.required_data.iter().find(|k| !data.contains_key(**k)) {
                return Err(EngineError::validation(
                    *missing,
                    format!("required to enter {to}"),
                ));
            }
        }

        self.cancel_all(participant_id).await?;

        let stored = self.state.get_current_state(participant_id, flow_id).await?;
        match stored {
            Some(_) => {
                self.state
                    .transition_state(participant_id, flow_id, &from, to)
                    .await?
            }
            None => self.state.set_current_state(participant_id, flow_id, to).await?,
        }
        self.state
            .set_state_data(participant_id, flow_id, "last_advance_reason", reason)
            .await?;

        info!(participant_id, flow = flow_id, %from, to, reason, force, "State advanced");
        Ok(from)
    }

    /// Cancel every pending timeout slot of the participant.
    pub async fn cancel_all(&self, participant_id: &str) -> Result<()> {
        for slot in self.definition.timer_keys() {
            self.cancel_slot(participant_id, slot).await?;
        }
        Ok(())
    }

    /// Cancel the timer stored in one slot and clear the slot.
    pub async fn cancel_slot(&self, participant_id: &str, slot: &str) -> Result<()> {
        let flow_id = self.definition.flow_id;
        if let Some(timer_id) = self
            .state
            .get_state_data(participant_id, flow_id, slot)
            .await?
        {
            self.timers.cancel(&timer_id).await?;
            self.state
                .clear_state_data(participant_id, flow_id, slot)
                .await?;
            debug!(participant_id, slot, %timer_id, "Timeout cancelled");
        }
        Ok(())
    }

    fn validate(&self, plan: &TransitionPlan) -> Result<()> {
        self.definition.require_state(&plan.from)?;
        match plan.kind {
            TransitionKind::Forward => {
                let mut current = plan.from.as_str();
                for next in &plan.path {
                    self.definition.validate_transition(current, next)?;
                    current = next;
                }
            }
            TransitionKind::Override => {
                for next in &plan.path {
                    self.definition.require_state(next)?;
                }
            }
        }
        Ok(())
    }

    /// Fails if `target` needs data that is neither stored nor in `planned`.
    async fn check_required_data(
        &self,
        participant_id: &str,
        target: &str,
        planned: &[String],
    ) -> Result<()> {
        let target = self.definition.require_state(target)?;
        if target.required_data.is_empty() {
            return Ok(());
        }

        let stored = self
            .state
            .get_all_state_data(participant_id, self.definition.flow_id)
            .await?;
        for key in target.required_data {
            let in_plan = planned.iter().any(|k| k.as_str() == *key);
            if !in_plan && !stored.contains_key(*key) {
                warn!(participant_id, key, state = target.name, "Missing required data");
                return Err(EngineError::validation(
                    *key,
                    format!("required to enter {}", target.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{StateInfo, TimeoutInfo};
    use crate::messaging::LogOnlyMessaging;
    use crate::persistence::InMemoryPersistence;
    use chrono::Utc;

    static STATES: [StateInfo; 3] = [
        StateInfo {
            name: "A",
            description: "start",
            possible_next_states: &["B"],
            required_data: &[],
            optional_data: &[],
            timeouts: &[],
            message_template: None,
        },
        StateInfo {
            name: "B",
            description: "needs a choice",
            possible_next_states: &["C"],
            required_data: &["choice"],
            optional_data: &[],
            timeouts: &[TimeoutInfo {
                id: "b",
                callback_type: "b_timeout",
                timer_key: "b_timer_id",
            }],
            message_template: None,
        },
        StateInfo {
            name: "C",
            description: "end",
            possible_next_states: &[],
            required_data: &[],
            optional_data: &[],
            timeouts: &[],
            message_template: None,
        },
    ];

    static FLOW: FlowDefinition = FlowDefinition {
        flow_id: "test",
        initial_state: "A",
        states: &STATES,
    };

    fn participant() -> ParticipantRecord {
        ParticipantRecord {
            participant_id: "p1".into(),
            flow_id: "test".into(),
            address: "15551234567".into(),
            name: None,
            timezone: "UTC".into(),
            schedule: "10:00".into(),
            status: "active".into(),
            enrolled_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn executor() -> (FlowExecutor, StateManager, TimerService) {
        let store = Arc::new(InMemoryPersistence::new());
        let state = StateManager::new(store.clone());
        let timers = TimerService::with_persistence(store);
        state.set_current_state("p1", "test", "A").await.unwrap();
        let exec = FlowExecutor::new(&FLOW, state.clone(), timers.clone(), Arc::new(LogOnlyMessaging));
        (exec, state, timers)
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_executor_futures_are_send() {
        let (exec, _, _) = executor().await;
        let participant = participant();
        let plan = TransitionPlan::forward("A", "B").data("choice", "1").timeout(PlannedTimeout {
            slot: "b_timer_id",
            delay: Duration::from_secs(60),
            durable: DurableTimer::new("p1", "test", "b_timeout"),
            callback: Box::pin(async {}),
        });
        assert_send(exec.apply(&participant, plan));
        assert_send(exec.advance("p1", "B", "operator", false));
        assert_send(exec.cancel_all("p1"));
    }

    #[tokio::test]
    async fn test_forward_requires_data() {
        let (exec, _, _) = executor().await;

        let err = exec
            .apply(&participant(), TransitionPlan::forward("A", "B"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let state = exec
            .apply(&participant(), TransitionPlan::forward("A", "B").data("choice", "1"))
            .await
            .unwrap();
        assert_eq!(state, "B");
    }

    #[tokio::test]
    async fn test_stale_plan_conflicts() {
        let (exec, state, _) = executor().await;
        state.set_current_state("p1", "test", "B").await.unwrap();

        let err = exec
            .apply(&participant(), TransitionPlan::forward("A", "B").data("choice", "1"))
            .await
            .unwrap_err();
        assert!(err.is_benign_race());
    }

    #[tokio::test]
    async fn test_invalid_hop_rejected() {
        let (exec, _, _) = executor().await;
        let err = exec
            .apply(&participant(), TransitionPlan::forward("A", "C"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_advance_names_missing_data() {
        let (exec, state, _) = executor().await;

        let err = exec.advance("p1", "B", "operator", false).await.unwrap_err();
        match err {
            EngineError::Validation { field, .. } => assert_eq!(field, "choice"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            state.get_current_state("p1", "test").await.unwrap().as_deref(),
            Some("A")
        );

        state.set_state_data("p1", "test", "choice", "2").await.unwrap();
        assert_eq!(exec.advance("p1", "B", "operator", false).await.unwrap(), "A");
    }

    #[tokio::test]
    async fn test_advance_force() {
        let (exec, state, _) = executor().await;

        let err = exec.advance("p1", "C", "test", false).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        exec.advance("p1", "C", "operator", true).await.unwrap();
        assert_eq!(
            state.get_current_state("p1", "test").await.unwrap().as_deref(),
            Some("C")
        );
        assert_eq!(
            state
                .get_state_data("p1", "test", "last_advance_reason")
                .await
                .unwrap()
                .as_deref(),
            Some("operator")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_slot_armed_and_cancelled() {
        let (exec, state, timers) = executor().await;

        let plan = TransitionPlan::forward("A", "B").data("choice", "1").timeout(PlannedTimeout {
            slot: "b_timer_id",
            delay: Duration::from_secs(600),
            durable: DurableTimer::new("p1", "test", "b_timeout"),
            callback: Box::pin(async {}),
        });
        exec.apply(&participant(), plan).await.unwrap();

        let timer_id = state
            .get_state_data("p1", "test", "b_timer_id")
            .await
            .unwrap()
            .unwrap();
        assert!(timers.get_timer(&timer_id).is_ok());

        exec.cancel_all("p1").await.unwrap();
        assert!(timers.get_timer(&timer_id).is_err());
        assert_eq!(state.get_state_data("p1", "test", "b_timer_id").await.unwrap(), None);
    }
}
