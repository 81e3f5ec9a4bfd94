// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for nudge-core.
//!
//! The engine talks to storage only through the [`Persistence`] trait. Every
//! method is individually atomic; nothing here needs multi-row transactions
//! from the caller's point of view.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::InMemoryPersistence;
pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};

use crate::error::EngineError;

/// One participant's position in one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStateRecord {
    /// Participant identifier.
    pub participant_id: String,
    /// Flow identifier.
    pub flow_id: String,
    /// Current state tag. Empty when data was written before any state.
    pub current_state: String,
    /// Named auxiliary values.
    pub state_data: HashMap<String, String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// Whether a timer fires once or follows a calendar pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// Fires a single time.
    Once,
    /// Fires on every occurrence of a calendar pattern.
    Recurring,
}

/// Durable description of an outstanding timer.
///
/// Holds no closure: `callback_type` names the reconstruction routine and
/// `callback_params` carries everything that routine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRecord {
    /// Timer identifier.
    pub id: String,
    /// Participant the timer acts on.
    pub participant_id: String,
    /// Flow the timer belongs to.
    pub flow_id: String,
    /// State the timer belongs to, if any.
    pub state_type: Option<String>,
    /// State data slot holding this timer's id, if any.
    pub data_key: Option<String>,
    /// Once or recurring.
    pub timer_kind: TimerKind,
    /// Registered reconstruction routine.
    pub callback_type: String,
    /// Parameters for the reconstruction routine.
    pub callback_params: HashMap<String, String>,
    /// When the timer was scheduled.
    pub scheduled_at: DateTime<Utc>,
    /// Absolute deadline of a one-shot timer.
    pub expires_at: Option<DateTime<Utc>>,
    /// Delay requested at schedule time, in milliseconds.
    pub original_delay_ms: Option<i64>,
    /// Calendar pattern text of a recurring timer.
    pub pattern: Option<String>,
    /// Timezone the pattern is evaluated in.
    pub timezone: Option<String>,
    /// Next occurrence of a recurring timer.
    pub next_run: Option<DateTime<Utc>>,
}

/// Durable hook: enough to rebuild the in-memory handler for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    /// Canonical address the hook answers for.
    pub address: String,
    /// Registered hook factory tag.
    pub hook_type: String,
    /// Parameters for the factory.
    pub params: HashMap<String, String>,
    /// When the hook was registered.
    pub created_at: DateTime<Utc>,
}

/// Enrollment status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    /// Receiving prompts.
    Active,
    /// Temporarily not receiving prompts.
    Paused,
    /// Finished the program.
    Completed,
    /// Left the program.
    Withdrawn,
}

/// Enrollment record for one participant in one flow.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct ParticipantRecord {
    /// Participant identifier.
    pub participant_id: String,
    /// Flow the participant is enrolled in.
    pub flow_id: String,
    /// Canonical messaging address.
    pub address: String,
    /// Display name.
    pub name: Option<String>,
    /// IANA timezone name.
    pub timezone: String,
    /// Daily prompt pattern.
    pub schedule: String,
    /// Enrollment status (active, paused, completed, withdrawn).
    pub status: String,
    /// When the participant was enrolled.
    pub enrolled_at: DateTime<Utc>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
}

impl ParticipantRecord {
    /// Parsed status; unknown values read as paused.
    pub fn status(&self) -> ParticipantStatus {
        self.status.parse().unwrap_or(ParticipantStatus::Paused)
    }
}

/// Inbound message as recorded before routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRecord {
    /// Canonical sender address.
    pub address: String,
    /// Message body.
    pub body: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Whether a hook was found for the sender.
    pub routed: bool,
}

/// Delivery receipt reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptRecord {
    /// Recipient address.
    pub address: String,
    /// Transport status (sent, delivered, read, failed, ...).
    pub status: String,
    /// When the status was reported.
    pub occurred_at: DateTime<Utc>,
}

/// Row shape shared by the SQL backends; params are stored as JSON text.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TimerRow {
    pub id: String,
    pub participant_id: String,
    pub flow_id: String,
    pub state_type: Option<String>,
    pub data_key: Option<String>,
    pub timer_kind: String,
    pub callback_type: String,
    pub callback_params: String,
    pub scheduled_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub original_delay_ms: Option<i64>,
    pub pattern: Option<String>,
    pub timezone: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
}

impl TryFrom<TimerRow> for TimerRecord {
    type Error = EngineError;

    fn try_from(row: TimerRow) -> Result<Self, Self::Error> {
        let timer_kind = row.timer_kind.parse().map_err(|_| {
            EngineError::storage(
                "decode_timer",
                format!("unknown timer kind '{}'", row.timer_kind),
            )
        })?;
        Ok(TimerRecord {
            id: row.id,
            participant_id: row.participant_id,
            flow_id: row.flow_id,
            state_type: row.state_type,
            data_key: row.data_key,
            timer_kind,
            callback_type: row.callback_type,
            callback_params: serde_json::from_str(&row.callback_params)?,
            scheduled_at: row.scheduled_at,
            expires_at: row.expires_at,
            original_delay_ms: row.original_delay_ms,
            pattern: row.pattern,
            timezone: row.timezone,
            next_run: row.next_run,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct HookRow {
    pub address: String,
    pub hook_type: String,
    pub params: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<HookRow> for HookRecord {
    type Error = EngineError;

    fn try_from(row: HookRow) -> Result<Self, Self::Error> {
        Ok(HookRecord {
            address: row.address,
            hook_type: row.hook_type,
            params: serde_json::from_str(&row.params)?,
            created_at: row.created_at,
        })
    }
}

/// Storage contract consumed by the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- participant flow state ----

    /// Load the state row for (participant, flow), data included.
    async fn get_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<FlowStateRecord>, EngineError>;

    /// Create the row or overwrite its current state.
    async fn upsert_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        state: &str,
    ) -> Result<(), EngineError>;

    /// Overwrite the current state only if it still equals `expected`.
    ///
    /// Returns `false` when the row is missing or holds another state.
    async fn update_flow_state_if(
        &self,
        participant_id: &str,
        flow_id: &str,
        expected: &str,
        state: &str,
    ) -> Result<bool, EngineError>;

    /// Write one data value, creating the row (with an empty state) if needed.
    async fn set_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError>;

    /// Delete the row and all of its data.
    async fn delete_flow_state(&self, participant_id: &str, flow_id: &str)
    -> Result<(), EngineError>;

    // ---- timers ----

    /// Insert or replace a timer record.
    async fn save_timer(&self, record: &TimerRecord) -> Result<(), EngineError>;

    /// Load one timer record.
    async fn get_timer(&self, timer_id: &str) -> Result<Option<TimerRecord>, EngineError>;

    /// Delete a timer record. Deleting an unknown id is not an error.
    async fn delete_timer(&self, timer_id: &str) -> Result<(), EngineError>;

    /// All outstanding timer records, oldest first.
    async fn list_timers(&self) -> Result<Vec<TimerRecord>, EngineError>;

    /// Outstanding timer records for one participant.
    async fn list_timers_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<TimerRecord>, EngineError>;

    // ---- hooks ----

    /// Insert or replace the hook for `record.address`.
    async fn save_hook(&self, record: &HookRecord) -> Result<(), EngineError>;

    /// Delete the hook for an address. Unknown addresses are ignored.
    async fn delete_hook(&self, address: &str) -> Result<(), EngineError>;

    /// All persisted hooks.
    async fn list_hooks(&self) -> Result<Vec<HookRecord>, EngineError>;

    // ---- participants ----

    /// Insert or replace an enrollment record.
    async fn save_participant(&self, record: &ParticipantRecord) -> Result<(), EngineError>;

    /// Load one enrollment record.
    async fn get_participant(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<ParticipantRecord>, EngineError>;

    /// Change the status of an enrollment. Returns `false` if it does not exist.
    async fn update_participant_status(
        &self,
        participant_id: &str,
        flow_id: &str,
        status: ParticipantStatus,
    ) -> Result<bool, EngineError>;

    /// Every enrollment of a flow, whatever its status.
    async fn list_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError>;

    /// Active enrollments of a flow.
    async fn list_active_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError>;

    // ---- message audit ----

    /// Record an inbound message.
    async fn record_response(&self, record: &ResponseRecord) -> Result<(), EngineError>;

    /// Record a delivery receipt.
    async fn record_receipt(&self, record: &ReceiptRecord) -> Result<(), EngineError>;

    // ---- lifecycle ----

    /// Check that the store answers.
    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }

    /// Release connections. Called once during shutdown.
    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
