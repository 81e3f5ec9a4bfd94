// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine: flows, timers, hooks and recovery wired together.
//!
//! [`Engine`] owns the process-wide registries (timer callbacks and hook
//! factories), builds them once from the registered flows and exposes the
//! operations an API layer calls: enrollment, inbound routing, timer
//! inspection and operator state changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::flow::executor::FlowExecutor;
use crate::flow::intervention::{InterventionFlow, InterventionRecovery, InterventionSettings};
use crate::flow::{Flow, FlowHook};
use crate::hooks::{HookFactoryRegistry, ResponseAction, ResponseHandler};
use crate::messaging::{DeliveryReceipt, InboundMessage, MessagingService, TextGenerator};
use crate::persistence::{ParticipantRecord, ParticipantStatus, Persistence, ReceiptRecord};
use crate::recovery::{
    HandlerRecoveryInfo, PersistedTimers, RecoveryFuture, RecoveryManager, RecoveryReport,
    TimerRecoveryInfo,
};
use crate::schedule::SchedulePattern;
use crate::state_manager::StateManager;
use crate::timer::{CallbackRegistry, TimerInfo, TimerService, required_param};

/// Enrollment input.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentRequest {
    /// Messaging address, canonicalized before it is stored.
    pub address: String,
    /// Display name used in messages.
    pub name: Option<String>,
    /// IANA timezone; the configured default when absent.
    pub timezone: Option<String>,
    /// Daily prompt pattern; the configured default when absent.
    pub schedule: Option<String>,
}

impl EnrollmentRequest {
    /// Request with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// A participant's enrollment and conversation position.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantState {
    /// Enrollment record.
    pub participant: ParticipantRecord,
    /// Current state, or the flow's initial state when none is stored.
    pub current_state: String,
    /// Stored state data.
    pub data: HashMap<String, String>,
}

struct FlowEntry {
    flow: Arc<dyn Flow>,
    executor: FlowExecutor,
}

/// The orchestration engine.
pub struct Engine {
    persistence: Arc<dyn Persistence>,
    messaging: Arc<dyn MessagingService>,
    state: StateManager,
    timers: TimerService,
    handler: ResponseHandler,
    recovery: RecoveryManager,
    callbacks: Arc<CallbackRegistry>,
    flows: HashMap<&'static str, FlowEntry>,
    intervention: Arc<InterventionFlow>,
}

impl Engine {
    /// Build the engine and its registries.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        messaging: Arc<dyn MessagingService>,
        generator: Option<Arc<dyn TextGenerator>>,
        settings: InterventionSettings,
    ) -> Self {
        let state = StateManager::new(persistence.clone());
        let timers = TimerService::with_persistence(persistence.clone());

        let intervention = InterventionFlow::new(
            persistence.clone(),
            timers.clone(),
            messaging.clone(),
            generator,
            settings,
        );
        let registered: Vec<Arc<dyn Flow>> = vec![intervention.clone()];

        let mut callbacks = CallbackRegistry::new();
        let mut hook_factories = HookFactoryRegistry::new();
        let mut flows = HashMap::new();
        for flow in registered {
            flow.clone().register_callbacks(&mut callbacks);

            let hook_flow = flow.clone();
            hook_factories.register(flow.hook_type(), move |params| {
                let participant_id = required_param(params, "participant_id")?;
                let action: Arc<dyn ResponseAction> =
                    Arc::new(FlowHook::new(hook_flow.clone(), participant_id));
                Ok(action)
            });

            let executor =
                FlowExecutor::new(flow.definition(), state.clone(), timers.clone(), messaging.clone());
            flows.insert(flow.flow_id(), FlowEntry { flow, executor });
        }
        let callbacks = Arc::new(callbacks);

        let handler = ResponseHandler::new(
            persistence.clone(),
            messaging.clone(),
            timers.clone(),
            Arc::new(hook_factories),
        );

        let mut recovery = RecoveryManager::new(persistence.clone());
        recovery.register_recoverable(Arc::new(PersistedTimers::new(persistence.clone())));
        recovery.register_participant_recoverable(Arc::new(InterventionRecovery::new(
            intervention.clone(),
        )));

        let restore_timers = timers.clone();
        let restore_callbacks = callbacks.clone();
        recovery.register_timer_recovery(move |info: TimerRecoveryInfo| -> RecoveryFuture<String> {
            let timers = restore_timers.clone();
            let callbacks = restore_callbacks.clone();
            Box::pin(async move { timers.restore(&info.record, &callbacks).await })
        });

        let restore_handler = handler.clone();
        recovery.register_handler_recovery(move |info: HandlerRecoveryInfo| -> RecoveryFuture<()> {
            let handler = restore_handler.clone();
            Box::pin(async move {
                handler
                    .register_persistent_hook(&info.address, &info.hook_type, info.params)
                    .await
            })
        });

        Self {
            persistence,
            messaging,
            state,
            timers,
            handler,
            recovery,
            callbacks,
            flows,
            intervention,
        }
    }

    fn entry(&self, flow_id: &str) -> Result<&FlowEntry> {
        self.flows
            .get(flow_id)
            .ok_or_else(|| EngineError::not_found("flow", flow_id))
    }

    async fn participant(&self, participant_id: &str, flow_id: &str) -> Result<ParticipantRecord> {
        self.persistence
            .get_participant(participant_id, flow_id)
            .await?
            .ok_or_else(|| EngineError::not_found("participant", participant_id))
    }

    fn hook_params(participant_id: &str, flow_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("participant_id".to_string(), participant_id.to_string()),
            ("flow_id".to_string(), flow_id.to_string()),
        ])
    }

    /// Enroll a participant and start the flow.
    ///
    /// Enrolling an already enrolled participant starts the flow over.
    #[instrument(skip(self, request), fields(flow = flow_id))]
    pub async fn enroll(
        &self,
        flow_id: &str,
        participant_id: &str,
        request: EnrollmentRequest,
    ) -> Result<ParticipantRecord> {
        let entry = self.entry(flow_id)?;
        if participant_id.trim().is_empty() {
            return Err(EngineError::validation("participant_id", "must not be empty"));
        }
        let address = self.messaging.canonicalize_recipient(&request.address)?;

        let settings = self.intervention.settings();
        let timezone = match request.timezone.as_deref().map(str::trim) {
            Some(tz) if !tz.is_empty() => tz
                .parse::<Tz>()
                .map_err(|_| EngineError::validation("timezone", format!("unknown timezone '{tz}'")))?,
            _ => settings.default_timezone,
        };
        let schedule = match request.schedule.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => settings.default_schedule.clone(),
        };
        SchedulePattern::parse(&schedule, timezone)?;

        if let Some(existing) = self
            .persistence
            .get_participant(participant_id, flow_id)
            .await?
        {
            info!(participant_id, "Re-enrolling participant");
            entry.flow.cancel_timers(participant_id).await?;
            self.state.reset_state(participant_id, flow_id).await?;
            if existing.address != address {
                self.handler.unregister_persistent_hook(&existing.address).await?;
            }
        }

        let now = Utc::now();
        let record = ParticipantRecord {
            participant_id: participant_id.to_string(),
            flow_id: flow_id.to_string(),
            address: address.clone(),
            name: request.name.filter(|n| !n.trim().is_empty()),
            timezone: timezone.name().to_string(),
            schedule,
            status: ParticipantStatus::Active.to_string(),
            enrolled_at: now,
            updated_at: now,
        };
        self.persistence.save_participant(&record).await?;

        self.handler
            .register_persistent_hook(
                &address,
                entry.flow.hook_type(),
                Self::hook_params(participant_id, flow_id),
            )
            .await?;
        entry.flow.start(&record).await?;

        info!(participant_id, %address, "Participant enrolled");
        Ok(record)
    }

    /// Route an inbound message. Returns whether a hook handled it.
    pub async fn process_inbound_response(&self, address: &str, body: &str) -> Result<bool> {
        self.process_inbound(&InboundMessage::new(address, body)).await
    }

    /// Route an inbound message with its transport timestamp.
    pub async fn process_inbound(&self, message: &InboundMessage) -> Result<bool> {
        self.handler.process_response(message).await
    }

    /// Store a delivery receipt.
    pub async fn record_receipt(&self, receipt: &DeliveryReceipt) -> Result<()> {
        self.persistence
            .record_receipt(&ReceiptRecord {
                address: receipt.to.clone(),
                status: receipt.status.clone(),
                occurred_at: receipt.timestamp,
            })
            .await
    }

    /// Active timers ordered by next firing.
    pub fn list_active_timers(&self) -> Vec<TimerInfo> {
        self.timers.list_active()
    }

    /// One active timer.
    pub fn get_timer(&self, timer_id: &str) -> Result<TimerInfo> {
        self.timers.get_timer(timer_id)
    }

    /// Cancel a timer. Unknown ids are ignored.
    pub async fn cancel_timer(&self, timer_id: &str) -> Result<()> {
        self.timers.cancel(timer_id).await
    }

    /// Operator transition, then the target state's entry actions.
    ///
    /// Returns the state the participant was in.
    #[instrument(skip(self), fields(flow = flow_id))]
    pub async fn advance_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        to_state: &str,
        reason: &str,
        force: bool,
    ) -> Result<String> {
        let entry = self.entry(flow_id)?;
        let participant = self.participant(participant_id, flow_id).await?;

        let from = entry
            .executor
            .advance(participant_id, to_state, reason, force)
            .await?;
        entry.flow.enter_state(&participant, to_state).await?;
        Ok(from)
    }

    /// Cancel everything pending and start the flow from its initial state.
    #[instrument(skip(self), fields(flow = flow_id))]
    pub async fn reset_participant(&self, participant_id: &str, flow_id: &str) -> Result<()> {
        let entry = self.entry(flow_id)?;
        let participant = self.participant(participant_id, flow_id).await?;

        entry.flow.cancel_timers(participant_id).await?;
        self.state.reset_state(participant_id, flow_id).await?;
        self.handler
            .register_persistent_hook(
                &participant.address,
                entry.flow.hook_type(),
                Self::hook_params(participant_id, flow_id),
            )
            .await?;
        entry.flow.start(&participant).await?;

        info!(participant_id, "Participant reset");
        Ok(())
    }

    /// Withdraw a participant: timers, hook and state are removed.
    pub async fn unenroll(&self, participant_id: &str, flow_id: &str) -> Result<()> {
        self.set_participant_status(participant_id, flow_id, ParticipantStatus::Withdrawn)
            .await
    }

    /// Change a participant's status.
    ///
    /// Pausing cancels pending timers and keeps the hook, so replies are
    /// recorded but ignored. Resuming re-arms the daily prompt. Completing or
    /// withdrawing also removes the hook; withdrawing drops the state.
    #[instrument(skip(self), fields(flow = flow_id))]
    pub async fn set_participant_status(
        &self,
        participant_id: &str,
        flow_id: &str,
        status: ParticipantStatus,
    ) -> Result<()> {
        let entry = self.entry(flow_id)?;
        let participant = self.participant(participant_id, flow_id).await?;

        match status {
            ParticipantStatus::Active => {}
            ParticipantStatus::Paused => entry.flow.cancel_timers(participant_id).await?,
            ParticipantStatus::Completed | ParticipantStatus::Withdrawn => {
                entry.flow.cancel_timers(participant_id).await?;
                self.handler
                    .unregister_persistent_hook(&participant.address)
                    .await?;
                if status == ParticipantStatus::Withdrawn {
                    self.state.reset_state(participant_id, flow_id).await?;
                }
            }
        }

        self.persistence
            .update_participant_status(participant_id, flow_id, status)
            .await?;

        if status == ParticipantStatus::Active {
            let resumed = self.participant(participant_id, flow_id).await?;
            if !self.handler.is_registered(&resumed.address) {
                self.handler
                    .register_persistent_hook(
                        &resumed.address,
                        entry.flow.hook_type(),
                        Self::hook_params(participant_id, flow_id),
                    )
                    .await?;
            }
            entry.flow.recover_reminders(&resumed).await?;
        }

        info!(participant_id, %status, "Participant status changed");
        Ok(())
    }

    /// Enrollment, current state and data of a participant.
    pub async fn participant_state(&self, participant_id: &str, flow_id: &str) -> Result<ParticipantState> {
        let entry = self.entry(flow_id)?;
        let participant = self.participant(participant_id, flow_id).await?;
        let current_state = entry.executor.current_state(participant_id).await?;
        let data = self.state.get_all_state_data(participant_id, flow_id).await?;
        Ok(ParticipantState {
            participant,
            current_state,
            data,
        })
    }

    /// Startup recovery.
    ///
    /// Runs every recoverable, then restores persistent hooks, drops hooks
    /// without an active or paused participant, removes stale hooks and
    /// re-derives each active participant's daily prompt. Failures are collected in the
    /// report; none of them stops the sequence.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = self.recovery.recover_all().await;

        report.attempted += 1;
        match self.handler.recover_persistent_hooks().await {
            Ok(_) => report.succeeded += 1,
            Err(e) => report.failures.push(("persistent_hooks".to_string(), e)),
        }

        let flow_ids: Vec<String> = self.flows.keys().map(|id| id.to_string()).collect();
        report.attempted += 1;
        match self.handler.validate_and_cleanup_hooks(&flow_ids).await {
            Ok(_) => report.succeeded += 1,
            Err(e) => report.failures.push(("hook_validation".to_string(), e)),
        }

        report.attempted += 1;
        match self.handler.cleanup_stale_hooks().await {
            Ok(_) => report.succeeded += 1,
            Err(e) => report.failures.push(("stale_hooks".to_string(), e)),
        }

        for (flow_id, entry) in &self.flows {
            report.attempted += 1;
            match self.recover_reminders(flow_id, entry).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => report.failures.push((format!("{flow_id}_reminders"), e)),
            }
        }

        if report.is_clean() {
            info!(components = report.attempted, "Startup recovery complete");
        } else {
            warn!(failed = report.failures.len(), "{}", report.summary());
        }
        report
    }

    async fn recover_reminders(&self, flow_id: &str, entry: &FlowEntry) -> Result<()> {
        let participants = self.persistence.list_active_participants(flow_id).await?;
        let mut failed = Vec::new();
        for participant in &participants {
            if let Err(e) = entry.flow.recover_reminders(participant).await {
                warn!(participant_id = %participant.participant_id, error = %e, "Reminder recovery failed");
                failed.push(participant.participant_id.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Recovery {
                component: format!("{flow_id}_reminders"),
                details: format!("{} of {} participants failed: {}", failed.len(), participants.len(), failed.join(", ")),
            })
        }
    }

    /// Backing store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Outbound transport.
    pub fn messaging(&self) -> &Arc<dyn MessagingService> {
        &self.messaging
    }

    /// Timer service.
    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Response handler.
    pub fn response_handler(&self) -> &ResponseHandler {
        &self.handler
    }

    /// State manager.
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Timer callback registry.
    pub fn callback_registry(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// The intervention flow.
    pub fn intervention(&self) -> &Arc<InterventionFlow> {
        &self.intervention
    }

    /// Registered flow ids.
    pub fn flow_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.flows.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::intervention::FLOW_ID;
    use crate::messaging::LogOnlyMessaging;
    use crate::persistence::InMemoryPersistence;

    fn engine() -> Engine {
        Engine::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(LogOnlyMessaging),
            None,
            InterventionSettings::default(),
        )
    }

    #[test]
    fn test_registries_cover_every_slot() {
        let engine = engine();
        assert_eq!(engine.flow_ids(), vec![FLOW_ID]);
        for callback_type in [
            "commitment_timeout",
            "feeling_timeout",
            "completion_timeout",
            "got_chance_timeout",
            "context_timeout",
            "mood_timeout",
            "barrier_detail_timeout",
            "barrier_reason_timeout",
        ] {
            assert!(engine.callback_registry().contains(callback_type), "{callback_type}");
        }
    }

    #[tokio::test]
    async fn test_enroll_validates_input() {
        let engine = engine();

        let err = engine
            .enroll("unknown", "p1", EnrollmentRequest::new("+15551234567"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "flow", .. }));

        let err = engine
            .enroll(FLOW_ID, "p1", EnrollmentRequest::new("not a number"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let request = EnrollmentRequest {
            timezone: Some("Mars/Olympus".into()),
            ..EnrollmentRequest::new("+15551234567")
        };
        let err = engine.enroll(FLOW_ID, "p1", request).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_enroll_stores_canonical_record() {
        let engine = engine();
        let record = engine
            .enroll(
                FLOW_ID,
                "p1",
                EnrollmentRequest {
                    name: Some("Ana".into()),
                    timezone: Some("Europe/Warsaw".into()),
                    schedule: Some("09:30".into()),
                    ..EnrollmentRequest::new("+1 (555) 123-4567")
                },
            )
            .await
            .unwrap();

        assert_eq!(record.address, "15551234567");
        assert_eq!(record.timezone, "Europe/Warsaw");
        assert!(engine.response_handler().is_registered("15551234567"));

        let state = engine.participant_state("p1", FLOW_ID).await.unwrap();
        assert_eq!(state.current_state, "ORIENTATION");
        assert_eq!(state.data.get("times_completed_week").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_unenroll_removes_everything() {
        let engine = engine();
        engine
            .enroll(FLOW_ID, "p1", EnrollmentRequest::new("+15551234567"))
            .await
            .unwrap();
        assert_eq!(engine.list_active_timers().len(), 1);

        engine.unenroll("p1", FLOW_ID).await.unwrap();
        assert!(engine.list_active_timers().is_empty());
        assert!(!engine.response_handler().is_registered("15551234567"));
        assert!(engine.persistence().list_hooks().await.unwrap().is_empty());

        let state = engine.participant_state("p1", FLOW_ID).await.unwrap();
        assert_eq!(state.participant.status(), ParticipantStatus::Withdrawn);
        assert!(state.data.is_empty());
    }
}
