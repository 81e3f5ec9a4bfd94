// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The daily micro-intervention flow.
//!
//! Each day a participant is asked to commit to a short activity, rates how
//! they feel, gets one of two activities at random and is then asked whether
//! it happened and how it went. Every question has a timeout that moves the
//! conversation on when the participant goes quiet.
//!
//! ```text
//! ORIENTATION ─┐
//!              ▼
//! END_OF_DAY ─► COMMITMENT_PROMPT ─► FEELING_PROMPT ─► RANDOM_ASSIGNMENT
//!    ▲  │                │                                 │
//!    │  ▼                ▼                                 ▼
//!    │ WEEKLY_SUMMARY  END_OF_DAY              SEND_INTERVENTION_{IMMEDIATE,REFLECTIVE}
//!    │                                           │                      │
//!    │                                  REINFORCEMENT_FOLLOWUP   DID_YOU_GET_A_CHANCE
//!    └──────────────── (context, mood, barrier questions) ◄─────────────┘
//! ```

pub mod messages;
mod recovery;

pub use recovery::InterventionRecovery;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use rand::Rng;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::messaging::{InboundMessage, MessagingService, TextGenerator};
use crate::persistence::{ParticipantRecord, ParticipantStatus, Persistence};
use crate::schedule::SchedulePattern;
use crate::state_manager::StateManager;
use crate::timer::{CallbackRegistry, DurableTimer, RecurringCallback, TimerFuture, TimerService, required_param};

use super::executor::{FlowExecutor, PlannedTimeout, TransitionPlan};
use super::{Flow, FlowDefinition, StateInfo, TimeoutInfo};

/// Flow identifier.
pub const FLOW_ID: &str = "intervention";

/// Hook type for intervention participants.
pub const HOOK_TYPE: &str = "intervention";

/// States of the intervention flow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, IntoStaticStr, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionState {
    /// Enrolled, waiting for the first daily prompt.
    Orientation,
    /// Asked whether they want to do today's activity.
    CommitmentPrompt,
    /// Asked how they feel.
    FeelingPrompt,
    /// Passing through the random activity choice.
    RandomAssignment,
    /// Doing the quick activity.
    SendInterventionImmediate,
    /// Doing the reflective activity.
    SendInterventionReflective,
    /// Passing through the completion praise.
    ReinforcementFollowup,
    /// Asked whether they got a chance to try it.
    DidYouGetAChance,
    /// Asked where they were.
    ContextQuestion,
    /// Asked how it left them feeling.
    MoodQuestion,
    /// Asked what made it harder.
    BarrierCheckAfterContextMood,
    /// Asked what got in the way.
    BarrierReasonNoChance,
    /// Passing through the no-reply path.
    IgnoredPath,
    /// Done for the day.
    EndOfDay,
    /// Passing through the weekly summary.
    WeeklySummary,
}

impl InterventionState {
    /// State tag.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Timers armed by the flow, one slot per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum TimerSlot {
    /// No answer to the commitment prompt.
    Commitment,
    /// No feeling rating.
    Feeling,
    /// No completion reply.
    Completion,
    /// No answer to "did you get a chance".
    GotChance,
    /// No context answer.
    Context,
    /// No mood answer.
    Mood,
    /// No barrier detail.
    BarrierDetail,
    /// No barrier reason.
    BarrierReason,
}

impl TimerSlot {
    /// State data key holding the timer id.
    pub const fn key(self) -> &'static str {
        match self {
            TimerSlot::Commitment => "commitment_timer_id",
            TimerSlot::Feeling => "feeling_timer_id",
            TimerSlot::Completion => "completion_timer_id",
            TimerSlot::GotChance => "got_chance_timer_id",
            TimerSlot::Context => "context_timer_id",
            TimerSlot::Mood => "mood_timer_id",
            TimerSlot::BarrierDetail => "barrier_detail_timer_id",
            TimerSlot::BarrierReason => "barrier_reason_timer_id",
        }
    }

    /// Registered callback type.
    pub const fn callback_type(self) -> &'static str {
        match self {
            TimerSlot::Commitment => "commitment_timeout",
            TimerSlot::Feeling => "feeling_timeout",
            TimerSlot::Completion => "completion_timeout",
            TimerSlot::GotChance => "got_chance_timeout",
            TimerSlot::Context => "context_timeout",
            TimerSlot::Mood => "mood_timeout",
            TimerSlot::BarrierDetail => "barrier_detail_timeout",
            TimerSlot::BarrierReason => "barrier_reason_timeout",
        }
    }

    const fn info(self, id: &'static str) -> TimeoutInfo {
        TimeoutInfo {
            id,
            callback_type: self.callback_type(),
            timer_key: self.key(),
        }
    }

    fn owns(self, state: InterventionState) -> bool {
        use InterventionState::*;
        matches!(
            (self, state),
            (TimerSlot::Commitment, CommitmentPrompt)
                | (TimerSlot::Feeling, FeelingPrompt)
                | (TimerSlot::Completion, SendInterventionImmediate | SendInterventionReflective)
                | (TimerSlot::GotChance, DidYouGetAChance)
                | (TimerSlot::Context, ContextQuestion)
                | (TimerSlot::Mood, MoodQuestion)
                | (TimerSlot::BarrierDetail, BarrierCheckAfterContextMood)
                | (TimerSlot::BarrierReason, BarrierReasonNoChance)
        )
    }
}

/// Which activity the participant was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum InterventionType {
    /// Quick physical activity.
    Immediate,
    /// Short reflection.
    Reflective,
}

impl InterventionType {
    fn state(self) -> InterventionState {
        match self {
            InterventionType::Immediate => InterventionState::SendInterventionImmediate,
            InterventionType::Reflective => InterventionState::SendInterventionReflective,
        }
    }

    fn template(self) -> &'static str {
        match self {
            InterventionType::Immediate => "intervention_immediate",
            InterventionType::Reflective => "intervention_reflective",
        }
    }
}

/// Typed view of the flow's state data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterventionData {
    /// Commitment answer: `yes`, `no` or `timed_out`.
    CommitmentResponse(String),
    /// Feeling rating, `on_demand` or `timed_out`.
    FeelingResponse(String),
    /// Assigned activity.
    Assigned(InterventionType),
    /// Completion answer: `done`, `no` or `no_reply`.
    CompletionResponse(String),
    /// Whether they got a chance to try the activity.
    GotChance(bool),
    /// Context choice.
    Context(u8),
    /// Mood choice.
    Mood(u8),
    /// Free-text barrier after context and mood.
    BarrierDetail(String),
    /// Free-text reason for not trying.
    BarrierReason(String),
    /// Activities completed since `week_start`.
    TimesCompletedWeek(u32),
    /// Start of the current summary week.
    WeekStart(DateTime<Utc>),
}

impl InterventionData {
    /// Storage key.
    pub fn key(&self) -> &'static str {
        match self {
            InterventionData::CommitmentResponse(_) => "commitment_response",
            InterventionData::FeelingResponse(_) => "feeling_response",
            InterventionData::Assigned(_) => "intervention_type",
            InterventionData::CompletionResponse(_) => "completion_response",
            InterventionData::GotChance(_) => "got_chance",
            InterventionData::Context(_) => "context_response",
            InterventionData::Mood(_) => "mood_response",
            InterventionData::BarrierDetail(_) => "barrier_detail_response",
            InterventionData::BarrierReason(_) => "barrier_reason_response",
            InterventionData::TimesCompletedWeek(_) => "times_completed_week",
            InterventionData::WeekStart(_) => "week_start",
        }
    }

    /// Storage value.
    pub fn value(&self) -> String {
        match self {
            InterventionData::CommitmentResponse(v)
            | InterventionData::FeelingResponse(v)
            | InterventionData::CompletionResponse(v)
            | InterventionData::BarrierDetail(v)
            | InterventionData::BarrierReason(v) => v.clone(),
            InterventionData::Assigned(t) => t.to_string(),
            InterventionData::GotChance(b) => b.to_string(),
            InterventionData::Context(n) | InterventionData::Mood(n) => n.to_string(),
            InterventionData::TimesCompletedWeek(n) => n.to_string(),
            InterventionData::WeekStart(at) => at.to_rfc3339(),
        }
    }

    /// Parse a stored entry. Unknown keys and malformed values yield `None`.
    pub fn from_entry(key: &str, value: &str) -> Option<Self> {
        let data = match key {
            "commitment_response" => InterventionData::CommitmentResponse(value.to_string()),
            "feeling_response" => InterventionData::FeelingResponse(value.to_string()),
            "intervention_type" => InterventionData::Assigned(value.parse().ok()?),
            "completion_response" => InterventionData::CompletionResponse(value.to_string()),
            "got_chance" => InterventionData::GotChance(value.parse().ok()?),
            "context_response" => InterventionData::Context(value.parse().ok()?),
            "mood_response" => InterventionData::Mood(value.parse().ok()?),
            "barrier_detail_response" => InterventionData::BarrierDetail(value.to_string()),
            "barrier_reason_response" => InterventionData::BarrierReason(value.to_string()),
            "times_completed_week" => InterventionData::TimesCompletedWeek(value.parse().ok()?),
            "week_start" => InterventionData::WeekStart(
                DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc),
            ),
            _ => return None,
        };
        Some(data)
    }

    /// All typed entries of a data map.
    pub fn from_map(data: &HashMap<String, String>) -> Vec<Self> {
        data.iter()
            .filter_map(|(k, v)| Self::from_entry(k, v))
            .collect()
    }
}

trait PlanExt {
    fn record(self, data: InterventionData) -> Self;
}

impl PlanExt for TransitionPlan {
    fn record(self, data: InterventionData) -> Self {
        let key = data.key();
        self.data(key, data.value())
    }
}

static STATES: [StateInfo; 15] = [
    StateInfo {
        name: "ORIENTATION",
        description: "Enrolled, waiting for the first daily prompt",
        possible_next_states: &["COMMITMENT_PROMPT"],
        required_data: &[],
        optional_data: &["week_start", "times_completed_week"],
        timeouts: &[],
        message_template: Some("orientation"),
    },
    StateInfo {
        name: "COMMITMENT_PROMPT",
        description: "Asked whether they want to do today's activity",
        possible_next_states: &["FEELING_PROMPT", "END_OF_DAY"],
        required_data: &[],
        optional_data: &["commitment_response"],
        timeouts: &[TimerSlot::Commitment.info("commitment")],
        message_template: Some("commitment_prompt"),
    },
    StateInfo {
        name: "FEELING_PROMPT",
        description: "Asked to rate how they feel",
        possible_next_states: &["RANDOM_ASSIGNMENT"],
        required_data: &["commitment_response"],
        optional_data: &["feeling_response"],
        timeouts: &[TimerSlot::Feeling.info("feeling")],
        message_template: Some("feeling_prompt"),
    },
    StateInfo {
        name: "RANDOM_ASSIGNMENT",
        description: "Choosing one of the two activities",
        possible_next_states: &["SEND_INTERVENTION_IMMEDIATE", "SEND_INTERVENTION_REFLECTIVE"],
        required_data: &[],
        optional_data: &["intervention_type"],
        timeouts: &[],
        message_template: None,
    },
    StateInfo {
        name: "SEND_INTERVENTION_IMMEDIATE",
        description: "Doing the quick activity",
        possible_next_states: &["REINFORCEMENT_FOLLOWUP", "DID_YOU_GET_A_CHANCE"],
        required_data: &["feeling_response", "intervention_type"],
        optional_data: &["completion_response"],
        timeouts: &[TimerSlot::Completion.info("completion")],
        message_template: Some("intervention_immediate"),
    },
    StateInfo {
        name: "SEND_INTERVENTION_REFLECTIVE",
        description: "Doing the reflective activity",
        possible_next_states: &["REINFORCEMENT_FOLLOWUP", "DID_YOU_GET_A_CHANCE"],
        required_data: &["feeling_response", "intervention_type"],
        optional_data: &["completion_response"],
        timeouts: &[TimerSlot::Completion.info("completion")],
        message_template: Some("intervention_reflective"),
    },
    StateInfo {
        name: "REINFORCEMENT_FOLLOWUP",
        description: "Praised for completing the activity",
        possible_next_states: &["END_OF_DAY"],
        required_data: &[],
        optional_data: &["times_completed_week"],
        timeouts: &[],
        message_template: Some("reinforcement"),
    },
    StateInfo {
        name: "DID_YOU_GET_A_CHANCE",
        description: "Asked whether they got a chance to try it",
        possible_next_states: &["CONTEXT_QUESTION", "BARRIER_REASON_NO_CHANCE", "IGNORED_PATH"],
        required_data: &[],
        optional_data: &["got_chance"],
        timeouts: &[TimerSlot::GotChance.info("got_chance")],
        message_template: Some("did_you_get_a_chance"),
    },
    StateInfo {
        name: "CONTEXT_QUESTION",
        description: "Asked where they were",
        possible_next_states: &["MOOD_QUESTION", "END_OF_DAY"],
        required_data: &[],
        optional_data: &["context_response"],
        timeouts: &[TimerSlot::Context.info("context")],
        message_template: Some("context_question"),
    },
    StateInfo {
        name: "MOOD_QUESTION",
        description: "Asked how it left them feeling",
        possible_next_states: &["BARRIER_CHECK_AFTER_CONTEXT_MOOD", "END_OF_DAY"],
        required_data: &["context_response"],
        optional_data: &["mood_response"],
        timeouts: &[TimerSlot::Mood.info("mood")],
        message_template: Some("mood_question"),
    },
    StateInfo {
        name: "BARRIER_CHECK_AFTER_CONTEXT_MOOD",
        description: "Asked what made it harder",
        possible_next_states: &["END_OF_DAY"],
        required_data: &["mood_response"],
        optional_data: &["barrier_detail_response"],
        timeouts: &[TimerSlot::BarrierDetail.info("barrier_detail")],
        message_template: Some("barrier_check"),
    },
    StateInfo {
        name: "BARRIER_REASON_NO_CHANCE",
        description: "Asked what got in the way",
        possible_next_states: &["END_OF_DAY"],
        required_data: &[],
        optional_data: &["barrier_reason_response"],
        timeouts: &[TimerSlot::BarrierReason.info("barrier_reason")],
        message_template: Some("barrier_reason"),
    },
    StateInfo {
        name: "IGNORED_PATH",
        description: "Did not answer after the activity",
        possible_next_states: &["END_OF_DAY"],
        required_data: &[],
        optional_data: &[],
        timeouts: &[],
        message_template: Some("ignored_path"),
    },
    StateInfo {
        name: "END_OF_DAY",
        description: "Done for the day",
        possible_next_states: &["COMMITMENT_PROMPT", "WEEKLY_SUMMARY"],
        required_data: &[],
        optional_data: &[],
        timeouts: &[],
        message_template: None,
    },
    StateInfo {
        name: "WEEKLY_SUMMARY",
        description: "Told how many activities they completed this week",
        possible_next_states: &["END_OF_DAY"],
        required_data: &[],
        optional_data: &["times_completed_week", "week_start"],
        timeouts: &[],
        message_template: Some("weekly_summary"),
    },
];

/// Transition table of the intervention flow.
pub static INTERVENTION_FLOW: FlowDefinition = FlowDefinition {
    flow_id: FLOW_ID,
    initial_state: "ORIENTATION",
    states: &STATES,
};

/// Timeouts and scheduling defaults.
#[derive(Debug, Clone)]
pub struct InterventionSettings {
    /// Wait for the commitment answer.
    pub commitment_timeout: Duration,
    /// Wait for the feeling rating.
    pub feeling_timeout: Duration,
    /// Wait for the completion reply.
    pub completion_timeout: Duration,
    /// Wait for "did you get a chance".
    pub got_chance_timeout: Duration,
    /// Wait for the context answer.
    pub context_timeout: Duration,
    /// Wait for the mood answer.
    pub mood_timeout: Duration,
    /// Wait for the barrier detail.
    pub barrier_detail_timeout: Duration,
    /// Wait for the barrier reason.
    pub barrier_reason_timeout: Duration,
    /// Timezone for participants enrolled without one.
    pub default_timezone: Tz,
    /// Daily prompt pattern for participants enrolled without one.
    pub default_schedule: String,
}

impl Default for InterventionSettings {
    fn default() -> Self {
        let quarter_hour = Duration::from_secs(15 * 60);
        Self {
            commitment_timeout: Duration::from_secs(12 * 60 * 60),
            feeling_timeout: quarter_hour,
            completion_timeout: Duration::from_secs(30 * 60),
            got_chance_timeout: quarter_hour,
            context_timeout: quarter_hour,
            mood_timeout: quarter_hour,
            barrier_detail_timeout: quarter_hour,
            barrier_reason_timeout: quarter_hour,
            default_timezone: chrono_tz::UTC,
            default_schedule: "10:00".to_string(),
        }
    }
}

impl InterventionSettings {
    /// Defaults with the scheduling fallbacks taken from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timezone: config.default_timezone,
            default_schedule: config.default_schedule.clone(),
            ..Self::default()
        }
    }

    /// Timeout for a slot.
    pub fn timeout(&self, slot: TimerSlot) -> Duration {
        match slot {
            TimerSlot::Commitment => self.commitment_timeout,
            TimerSlot::Feeling => self.feeling_timeout,
            TimerSlot::Completion => self.completion_timeout,
            TimerSlot::GotChance => self.got_chance_timeout,
            TimerSlot::Context => self.context_timeout,
            TimerSlot::Mood => self.mood_timeout,
            TimerSlot::BarrierDetail => self.barrier_detail_timeout,
            TimerSlot::BarrierReason => self.barrier_reason_timeout,
        }
    }

    /// Timeout re-armed after a restart for a question whose timer was lost.
    /// Never longer than the regular timeout.
    pub fn recovery_timeout(&self, slot: TimerSlot) -> Duration {
        let recovery = match slot {
            TimerSlot::Commitment => Duration::from_secs(30 * 60),
            TimerSlot::Completion => Duration::from_secs(15 * 60),
            _ => Duration::from_secs(5 * 60),
        };
        recovery.min(self.timeout(slot))
    }
}

const WEEK_DAYS: i64 = 7;

/// The intervention flow.
pub struct InterventionFlow {
    this: Weak<InterventionFlow>,
    executor: FlowExecutor,
    state: StateManager,
    persistence: Arc<dyn Persistence>,
    timers: TimerService,
    generator: Option<Arc<dyn TextGenerator>>,
    settings: InterventionSettings,
    reminders: DashMap<String, String>,
}

impl InterventionFlow {
    /// Create the flow.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        timers: TimerService,
        messaging: Arc<dyn MessagingService>,
        generator: Option<Arc<dyn TextGenerator>>,
        settings: InterventionSettings,
    ) -> Arc<Self> {
        let state = StateManager::new(persistence.clone());
        let executor = FlowExecutor::new(&INTERVENTION_FLOW, state.clone(), timers.clone(), messaging);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            executor,
            state,
            persistence,
            timers,
            generator,
            settings,
            reminders: DashMap::new(),
        })
    }

    /// Flow settings.
    pub fn settings(&self) -> &InterventionSettings {
        &self.settings
    }

    /// Id of the participant's daily prompt timer, if armed.
    pub fn reminder_timer(&self, participant_id: &str) -> Option<String> {
        self.reminders.get(participant_id).map(|id| id.value().clone())
    }

    async fn participant(&self, participant_id: &str) -> Result<ParticipantRecord> {
        self.persistence
            .get_participant(participant_id, FLOW_ID)
            .await?
            .ok_or_else(|| EngineError::not_found("participant", participant_id))
    }

    async fn current(&self, participant_id: &str) -> Result<InterventionState> {
        let current = self.executor.current_state(participant_id).await?;
        InterventionState::from_str(&current).map_err(|_| {
            EngineError::validation("state", format!("'{current}' is not an intervention state"))
        })
    }

    /// Apply a plan, dropping it if another event changed the state first.
    async fn run(&self, participant: &ParticipantRecord, plan: TransitionPlan) -> Result<()> {
        match self.executor.apply(participant, plan).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign_race() => {
                debug!(participant_id = %participant.participant_id, error = %e, "Dropping stale transition");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn planned_timeout(&self, participant_id: &str, slot: TimerSlot) -> PlannedTimeout {
        self.planned_timeout_after(participant_id, slot, self.settings.timeout(slot))
    }

    fn planned_timeout_after(&self, participant_id: &str, slot: TimerSlot, delay: Duration) -> PlannedTimeout {
        PlannedTimeout {
            slot: slot.key(),
            delay,
            durable: DurableTimer::new(participant_id, FLOW_ID, slot.callback_type())
                .param("participant_id", participant_id)
                .param("flow_id", FLOW_ID),
            callback: self.timeout_future(participant_id.to_string(), slot),
        }
    }

    fn timeout_future(&self, participant_id: String, slot: TimerSlot) -> TimerFuture {
        let this = self.this.clone();
        Box::pin(async move {
            let Some(flow) = this.upgrade() else {
                return;
            };
            if let Err(e) = flow.on_timeout(&participant_id, slot).await {
                warn!(%participant_id, slot = slot.key(), error = %e, "Timeout handling failed");
            }
        })
    }

    /// Message and timeout for entering `state`.
    async fn enter(
        &self,
        participant: &ParticipantRecord,
        state: InterventionState,
        mut plan: TransitionPlan,
    ) -> TransitionPlan {
        let Some(info) = INTERVENTION_FLOW.state(state.as_str()) else {
            return plan;
        };

        let text = match state {
            InterventionState::SendInterventionImmediate => {
                Some(self.intervention_text(participant, InterventionType::Immediate).await)
            }
            InterventionState::SendInterventionReflective => {
                Some(self.intervention_text(participant, InterventionType::Reflective).await)
            }
            _ => info
                .message_template
                .map(|t| messages::render(t, participant.name.as_deref())),
        };
        if let Some(text) = text {
            plan = plan.message(text);
        }

        for slot in TimerSlot::iter().filter(|slot| slot.owns(state)) {
            plan = plan.timeout(self.planned_timeout(&participant.participant_id, slot));
        }
        plan
    }

    async fn intervention_text(&self, participant: &ParticipantRecord, kind: InterventionType) -> String {
        let base = messages::render(kind.template(), participant.name.as_deref());
        let Some(generator) = &self.generator else {
            return base;
        };

        let feeling = self
            .state
            .get_state_data(&participant.participant_id, FLOW_ID, "feeling_response")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "unknown".to_string());
        let prompt = messages::generator_prompt(&base, participant.name.as_deref(), &feeling);

        match generator.generate(messages::GENERATOR_SYSTEM_PROMPT, &prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => base,
            Err(e) => {
                warn!(participant_id = %participant.participant_id, error = %e, "Text generation failed, using template");
                base
            }
        }
    }

    fn cancel_all_slots(mut plan: TransitionPlan) -> TransitionPlan {
        for slot in TimerSlot::iter() {
            plan = plan.cancel(slot.key());
        }
        plan
    }

    async fn commitment_plan(
        &self,
        participant: &ParticipantRecord,
        from: InterventionState,
        shortcut: bool,
    ) -> TransitionPlan {
        let to = InterventionState::CommitmentPrompt.as_str();
        let plan = if shortcut {
            TransitionPlan::override_to(from.as_str(), to)
        } else {
            TransitionPlan::forward(from.as_str(), to)
        };
        let plan = Self::cancel_all_slots(plan);
        self.enter(participant, InterventionState::CommitmentPrompt, plan)
            .await
    }

    async fn assignment_plan(
        &self,
        participant: &ParticipantRecord,
        from: InterventionState,
        feeling: String,
    ) -> TransitionPlan {
        let kind = random_assignment();
        let mut plan = if from == InterventionState::RandomAssignment {
            TransitionPlan::forward(from.as_str(), kind.state().as_str())
        } else {
            TransitionPlan::forward(from.as_str(), InterventionState::RandomAssignment.as_str())
                .then(kind.state().as_str())
        };
        plan = plan
            .cancel(TimerSlot::Feeling.key())
            .record(InterventionData::FeelingResponse(feeling))
            .record(InterventionData::Assigned(kind));
        info!(participant_id = %participant.participant_id, assigned = %kind, "Random assignment");
        self.enter(participant, kind.state(), plan).await
    }

    async fn completed_this_week(&self, participant_id: &str) -> Result<u32> {
        Ok(self
            .state
            .get_state_data(participant_id, FLOW_ID, "times_completed_week")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn week_start(&self, participant_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .get_state_data(participant_id, FLOW_ID, "week_start")
            .await?
            .and_then(|v| InterventionData::from_entry("week_start", &v))
            .and_then(|d| match d {
                InterventionData::WeekStart(at) => Some(at),
                _ => None,
            }))
    }

    async fn plan_for_reply(
        &self,
        participant: &ParticipantRecord,
        current: InterventionState,
        body: &str,
    ) -> Result<Option<TransitionPlan>> {
        use InterventionState::*;

        let reply = messages::canonicalize(body);
        let pid = participant.participant_id.as_str();
        let invalid = || {
            Some(TransitionPlan::stay(current.as_str()).message(messages::render("invalid_choice", None)))
        };

        let plan = match current {
            Orientation | EndOfDay if messages::is_ready(&reply) => {
                Some(self.commitment_plan(participant, current, true).await)
            }
            Orientation => Some(TransitionPlan::stay(current.as_str()).message(messages::render(
                "orientation",
                participant.name.as_deref(),
            ))),
            EndOfDay => {
                Some(TransitionPlan::stay(current.as_str()).message(messages::render("all_set", None)))
            }
            CommitmentPrompt => match messages::parse_commitment(&reply) {
                Some(true) => {
                    let plan = TransitionPlan::forward(current.as_str(), FeelingPrompt.as_str())
                        .cancel(TimerSlot::Commitment.key())
                        .record(InterventionData::CommitmentResponse("yes".into()));
                    Some(self.enter(participant, FeelingPrompt, plan).await)
                }
                Some(false) => Some(
                    TransitionPlan::forward(current.as_str(), EndOfDay.as_str())
                        .cancel(TimerSlot::Commitment.key())
                        .record(InterventionData::CommitmentResponse("no".into()))
                        .message(messages::render("not_today", None)),
                ),
                None => invalid(),
            },
            FeelingPrompt => match messages::parse_feeling(&reply) {
                Some(feeling) => Some(self.assignment_plan(participant, current, feeling).await),
                None => invalid(),
            },
            SendInterventionImmediate | SendInterventionReflective => {
                match messages::parse_completion(&reply) {
                    Some(true) => {
                        let completed = self.completed_this_week(pid).await? + 1;
                        Some(
                            TransitionPlan::forward(current.as_str(), ReinforcementFollowup.as_str())
                                .then(EndOfDay.as_str())
                                .cancel(TimerSlot::Completion.key())
                                .record(InterventionData::CompletionResponse("done".into()))
                                .record(InterventionData::TimesCompletedWeek(completed))
                                .message(messages::render("reinforcement", None)),
                        )
                    }
                    Some(false) => {
                        let plan = TransitionPlan::forward(current.as_str(), DidYouGetAChance.as_str())
                            .cancel(TimerSlot::Completion.key())
                            .record(InterventionData::CompletionResponse("no".into()));
                        Some(self.enter(participant, DidYouGetAChance, plan).await)
                    }
                    None => invalid(),
                }
            }
            DidYouGetAChance => match messages::parse_yes_no(&reply) {
                Some(true) => {
                    let plan = TransitionPlan::forward(current.as_str(), ContextQuestion.as_str())
                        .cancel(TimerSlot::GotChance.key())
                        .record(InterventionData::GotChance(true));
                    Some(self.enter(participant, ContextQuestion, plan).await)
                }
                Some(false) => {
                    let plan = TransitionPlan::forward(current.as_str(), BarrierReasonNoChance.as_str())
                        .cancel(TimerSlot::GotChance.key())
                        .record(InterventionData::GotChance(false));
                    Some(self.enter(participant, BarrierReasonNoChance, plan).await)
                }
                None => invalid(),
            },
            ContextQuestion => match messages::parse_choice(&reply, 4) {
                Some(choice) => {
                    let plan = TransitionPlan::forward(current.as_str(), MoodQuestion.as_str())
                        .cancel(TimerSlot::Context.key())
                        .record(InterventionData::Context(choice));
                    Some(self.enter(participant, MoodQuestion, plan).await)
                }
                None => invalid(),
            },
            MoodQuestion => match messages::parse_choice(&reply, 3) {
                Some(choice) => {
                    let plan =
                        TransitionPlan::forward(current.as_str(), BarrierCheckAfterContextMood.as_str())
                            .cancel(TimerSlot::Mood.key())
                            .record(InterventionData::Mood(choice));
                    Some(self.enter(participant, BarrierCheckAfterContextMood, plan).await)
                }
                None => invalid(),
            },
            BarrierCheckAfterContextMood | BarrierReasonNoChance => {
                let text = body.trim();
                if text.is_empty() {
                    return Ok(invalid());
                }
                let (slot, data) = if current == BarrierCheckAfterContextMood {
                    (TimerSlot::BarrierDetail, InterventionData::BarrierDetail(text.to_string()))
                } else {
                    (TimerSlot::BarrierReason, InterventionData::BarrierReason(text.to_string()))
                };
                Some(
                    TransitionPlan::forward(current.as_str(), EndOfDay.as_str())
                        .cancel(slot.key())
                        .record(data)
                        .message(messages::render("end_of_day", None)),
                )
            }
            RandomAssignment | ReinforcementFollowup | IgnoredPath | WeeklySummary => {
                debug!(participant_id = pid, state = %current, "Reply during pass-through state ignored");
                None
            }
        };
        Ok(plan)
    }

    /// Handle a fired timeout.
    pub async fn on_timeout(&self, participant_id: &str, slot: TimerSlot) -> Result<()> {
        use InterventionState::*;

        let participant = self.participant(participant_id).await?;
        let current = self.current(participant_id).await?;
        if !slot.owns(current) {
            debug!(participant_id, slot = slot.key(), state = %current, "Stale timeout ignored");
            return Ok(());
        }
        info!(participant_id, slot = slot.key(), state = %current, "Timeout fired");

        let from = current.as_str();
        let plan = match slot {
            TimerSlot::Commitment => TransitionPlan::forward(from, EndOfDay.as_str())
                .cancel(slot.key())
                .record(InterventionData::CommitmentResponse("timed_out".into())),
            TimerSlot::Feeling => {
                self.assignment_plan(&participant, current, "timed_out".to_string())
                    .await
            }
            TimerSlot::Completion => {
                let plan = TransitionPlan::forward(from, DidYouGetAChance.as_str())
                    .cancel(slot.key())
                    .record(InterventionData::CompletionResponse("no_reply".into()));
                self.enter(&participant, DidYouGetAChance, plan).await
            }
            TimerSlot::GotChance => TransitionPlan::forward(from, IgnoredPath.as_str())
                .then(EndOfDay.as_str())
                .cancel(slot.key())
                .message(messages::render("ignored_path", None)),
            TimerSlot::Context | TimerSlot::Mood | TimerSlot::BarrierDetail | TimerSlot::BarrierReason => {
                TransitionPlan::forward(from, EndOfDay.as_str())
                    .cancel(slot.key())
                    .message(messages::render("end_of_day", None))
            }
        };
        self.run(&participant, plan).await
    }

    /// Daily prompt. Runs only when the participant is idle for the day.
    pub async fn on_daily_prompt(&self, participant_id: &str) -> Result<()> {
        use InterventionState::*;

        let participant = self.participant(participant_id).await?;
        if participant.status() != ParticipantStatus::Active {
            debug!(participant_id, status = %participant.status, "Daily prompt skipped for inactive participant");
            return Ok(());
        }

        let current = self.current(participant_id).await?;
        if !matches!(current, Orientation | EndOfDay) {
            info!(participant_id, state = %current, "Daily prompt skipped, conversation in progress");
            return Ok(());
        }

        if current == EndOfDay {
            let week_start = self.week_start(participant_id).await?;
            let now = Utc::now();
            if week_start.is_some_and(|start| now - start >= chrono::Duration::days(WEEK_DAYS)) {
                let completed = self.completed_this_week(participant_id).await?;
                let summary = TransitionPlan::forward(current.as_str(), WeeklySummary.as_str())
                    .then(EndOfDay.as_str())
                    .record(InterventionData::TimesCompletedWeek(0))
                    .record(InterventionData::WeekStart(now))
                    .message(messages::weekly_summary(completed));
                self.run(&participant, summary).await?;
                info!(participant_id, completed, "Weekly summary sent");
            }
        }

        let plan = self.commitment_plan(&participant, current, false).await;
        self.run(&participant, plan).await
    }

    /// Arm (or re-arm) the participant's daily prompt.
    pub async fn schedule_reminder(&self, participant: &ParticipantRecord) -> Result<String> {
        let timezone: Tz = participant
            .timezone
            .parse()
            .unwrap_or(self.settings.default_timezone);
        let source = if participant.schedule.trim().is_empty() {
            self.settings.default_schedule.as_str()
        } else {
            participant.schedule.as_str()
        };
        let pattern = SchedulePattern::parse(source, timezone)?;

        let this = self.this.clone();
        let participant_id = participant.participant_id.clone();
        let callback: RecurringCallback = Arc::new(move || {
            let this = this.clone();
            let participant_id = participant_id.clone();
            Box::pin(async move {
                let Some(flow) = this.upgrade() else {
                    return;
                };
                if let Err(e) = flow.on_daily_prompt(&participant_id).await {
                    warn!(%participant_id, error = %e, "Daily prompt failed");
                }
            })
        });

        let timer_id = self.timers.schedule_with_pattern(&pattern, callback).await?;
        if let Some(previous) = self
            .reminders
            .insert(participant.participant_id.clone(), timer_id.clone())
        {
            self.timers.cancel(&previous).await?;
        }
        debug!(participant_id = %participant.participant_id, pattern = %pattern.describe(), %timer_id, "Daily prompt armed");
        Ok(timer_id)
    }
}

fn random_assignment() -> InterventionType {
    if rand::thread_rng().gen_bool(0.5) {
        InterventionType::Immediate
    } else {
        InterventionType::Reflective
    }
}

#[async_trait]
impl Flow for InterventionFlow {
    fn definition(&self) -> &'static FlowDefinition {
        &INTERVENTION_FLOW
    }

    fn hook_type(&self) -> &'static str {
        HOOK_TYPE
    }

    fn register_callbacks(self: Arc<Self>, registry: &mut CallbackRegistry) {
        for slot in TimerSlot::iter() {
            let flow = self.clone();
            registry.register(slot.callback_type(), move |params| {
                let participant_id = required_param(params, "participant_id")?;
                Ok(flow.timeout_future(participant_id.to_string(), slot))
            });
        }
    }

    async fn start(&self, participant: &ParticipantRecord) -> Result<()> {
        let pid = participant.participant_id.as_str();
        let initial = INTERVENTION_FLOW.initial_state;

        self.state.set_current_state(pid, FLOW_ID, initial).await?;
        for data in [
            InterventionData::TimesCompletedWeek(0),
            InterventionData::WeekStart(Utc::now()),
        ] {
            self.state
                .set_state_data(pid, FLOW_ID, data.key(), &data.value())
                .await?;
        }

        self.schedule_reminder(participant).await?;

        let welcome = TransitionPlan::stay(initial).message(messages::render(
            "orientation",
            participant.name.as_deref(),
        ));
        self.executor.apply(participant, welcome).await?;
        info!(participant_id = pid, "Participant started");
        Ok(())
    }

    async fn handle_response(&self, participant_id: &str, message: &InboundMessage) -> Result<()> {
        let participant = self.participant(participant_id).await?;
        if participant.status() != ParticipantStatus::Active {
            debug!(participant_id, "Reply from inactive participant ignored");
            return Ok(());
        }

        let current = self.current(participant_id).await?;
        match self.plan_for_reply(&participant, current, &message.body).await? {
            Some(plan) => self.run(&participant, plan).await,
            None => Ok(()),
        }
    }

    async fn enter_state(&self, participant: &ParticipantRecord, state: &str) -> Result<()> {
        let state = InterventionState::from_str(state)
            .map_err(|_| EngineError::validation("state", format!("'{state}' is not an intervention state")))?;

        let plan = match state {
            InterventionState::RandomAssignment => {
                let feeling = self
                    .state
                    .get_state_data(&participant.participant_id, FLOW_ID, "feeling_response")
                    .await?
                    .unwrap_or_else(|| "on_demand".to_string());
                self.assignment_plan(participant, state, feeling).await
            }
            _ => {
                self.enter(participant, state, TransitionPlan::stay(state.as_str()))
                    .await
            }
        };
        self.run(participant, plan).await
    }

    async fn cancel_timers(&self, participant_id: &str) -> Result<()> {
        self.executor.cancel_all(participant_id).await?;

        for record in self
            .persistence
            .list_timers_for_participant(participant_id)
            .await?
        {
            if record.flow_id == FLOW_ID {
                self.timers.cancel(&record.id).await?;
            }
        }

        if let Some((_, timer_id)) = self.reminders.remove(participant_id) {
            self.timers.cancel(&timer_id).await?;
        }
        debug!(participant_id, "Timers cancelled");
        Ok(())
    }

    async fn recover_reminders(&self, participant: &ParticipantRecord) -> Result<()> {
        self.schedule_reminder(participant).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_state_is_declared() {
        for state in InterventionState::iter() {
            assert!(INTERVENTION_FLOW.state(state.as_str()).is_some(), "{state}");
        }
        assert_eq!(STATES.len(), InterventionState::iter().count());
    }

    #[test]
    fn test_state_tags() {
        assert_eq!(InterventionState::DidYouGetAChance.as_str(), "DID_YOU_GET_A_CHANCE");
        assert_eq!(
            "BARRIER_CHECK_AFTER_CONTEXT_MOOD".parse::<InterventionState>().unwrap(),
            InterventionState::BarrierCheckAfterContextMood
        );
    }

    #[test]
    fn test_slots_match_table() {
        for slot in TimerSlot::iter() {
            let owners: Vec<&StateInfo> = STATES
                .iter()
                .filter(|s| s.timeouts.iter().any(|t| t.timer_key == slot.key()))
                .collect();
            assert!(!owners.is_empty(), "{}", slot.key());
            for owner in owners {
                let state: InterventionState = owner.name.parse().unwrap();
                assert!(slot.owns(state), "{} / {}", slot.key(), owner.name);
            }
        }
    }

    #[test]
    fn test_data_round_trip() {
        let now = Utc::now();
        for data in [
            InterventionData::Assigned(InterventionType::Reflective),
            InterventionData::GotChance(false),
            InterventionData::Context(3),
            InterventionData::TimesCompletedWeek(4),
            InterventionData::WeekStart(now),
        ] {
            let parsed = InterventionData::from_entry(data.key(), &data.value()).unwrap();
            match (&parsed, &data) {
                (InterventionData::WeekStart(a), InterventionData::WeekStart(b)) => {
                    assert_eq!(a.timestamp_millis(), b.timestamp_millis())
                }
                _ => assert_eq!(parsed, data),
            }
        }
        assert_eq!(InterventionData::from_entry("context_response", "x"), None);
        assert_eq!(InterventionData::from_entry("unknown", "1"), None);
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_event_futures_are_send() {
        let store = Arc::new(crate::persistence::InMemoryPersistence::new());
        let flow = InterventionFlow::new(
            store.clone(),
            TimerService::with_persistence(store),
            Arc::new(crate::messaging::LogOnlyMessaging),
            None,
            InterventionSettings::default(),
        );
        let participant = ParticipantRecord {
            participant_id: "p1".into(),
            flow_id: FLOW_ID.into(),
            address: "15551234567".into(),
            name: None,
            timezone: "UTC".into(),
            schedule: "10:00".into(),
            status: "active".into(),
            enrolled_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let message = InboundMessage::new("15551234567", "yes");

        assert_send(flow.on_timeout("p1", TimerSlot::Feeling));
        assert_send(flow.on_daily_prompt("p1"));
        assert_send(flow.schedule_reminder(&participant));
        assert_send(flow.handle_response("p1", &message));
        assert_send(flow.enter_state(&participant, "FEELING_PROMPT"));
    }

    #[test]
    fn test_default_settings() {
        let settings = InterventionSettings::default();
        assert_eq!(settings.timeout(TimerSlot::Commitment), Duration::from_secs(12 * 3600));
        assert_eq!(settings.timeout(TimerSlot::Completion), Duration::from_secs(1800));
        assert_eq!(settings.timeout(TimerSlot::Mood), Duration::from_secs(900));

        assert_eq!(settings.recovery_timeout(TimerSlot::Commitment), Duration::from_secs(1800));
        assert_eq!(settings.recovery_timeout(TimerSlot::Completion), Duration::from_secs(900));
        assert_eq!(settings.recovery_timeout(TimerSlot::Feeling), Duration::from_secs(300));

        let short = InterventionSettings {
            commitment_timeout: Duration::from_secs(60),
            ..InterventionSettings::default()
        };
        assert_eq!(short.recovery_timeout(TimerSlot::Commitment), Duration::from_secs(60));
    }
}
