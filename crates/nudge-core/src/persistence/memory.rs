// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backed by concurrent maps.
//!
//! Used by tests and by embedders that do not need restart durability. Each
//! operation holds a single map shard lock, which gives the same per-call
//! atomicity as the SQL backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::EngineError;

use super::{
    FlowStateRecord, HookRecord, ParticipantRecord, ParticipantStatus, Persistence,
    ReceiptRecord, ResponseRecord, TimerRecord,
};

type Key = (String, String);

fn key(participant_id: &str, flow_id: &str) -> Key {
    (participant_id.to_string(), flow_id.to_string())
}

/// Map-backed persistence provider.
#[derive(Default)]
pub struct InMemoryPersistence {
    states: DashMap<Key, FlowStateRecord>,
    timers: DashMap<String, TimerRecord>,
    hooks: DashMap<String, HookRecord>,
    participants: DashMap<Key, ParticipantRecord>,
    responses: Mutex<Vec<ResponseRecord>>,
    receipts: Mutex<Vec<ReceiptRecord>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbound messages recorded so far.
    pub async fn responses(&self) -> Vec<ResponseRecord> {
        self.responses.lock().await.clone()
    }

    /// Delivery receipts recorded so far.
    pub async fn receipts(&self) -> Vec<ReceiptRecord> {
        self.receipts.lock().await.clone()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn get_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<FlowStateRecord>, EngineError> {
        Ok(self
            .states
            .get(&key(participant_id, flow_id))
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        state: &str,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        self.states
            .entry(key(participant_id, flow_id))
            .and_modify(|record| {
                record.current_state = state.to_string();
                record.updated_at = now;
            })
            .or_insert_with(|| FlowStateRecord {
                participant_id: participant_id.to_string(),
                flow_id: flow_id.to_string(),
                current_state: state.to_string(),
                state_data: HashMap::new(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn update_flow_state_if(
        &self,
        participant_id: &str,
        flow_id: &str,
        expected: &str,
        state: &str,
    ) -> Result<bool, EngineError> {
        match self.states.get_mut(&key(participant_id, flow_id)) {
            Some(mut record) if record.current_state == expected => {
                record.current_state = state.to_string();
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        data_key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut record = self
            .states
            .entry(key(participant_id, flow_id))
            .or_insert_with(|| FlowStateRecord {
                participant_id: participant_id.to_string(),
                flow_id: flow_id.to_string(),
                current_state: String::new(),
                state_data: HashMap::new(),
                created_at: now,
                updated_at: now,
            });
        record
            .state_data
            .insert(data_key.to_string(), value.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn delete_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<(), EngineError> {
        self.states.remove(&key(participant_id, flow_id));
        Ok(())
    }

    async fn save_timer(&self, record: &TimerRecord) -> Result<(), EngineError> {
        self.timers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_timer(&self, timer_id: &str) -> Result<Option<TimerRecord>, EngineError> {
        Ok(self.timers.get(timer_id).map(|entry| entry.value().clone()))
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<(), EngineError> {
        self.timers.remove(timer_id);
        Ok(())
    }

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, EngineError> {
        let mut timers: Vec<TimerRecord> =
            self.timers.iter().map(|entry| entry.value().clone()).collect();
        timers.sort_by_key(|t| t.scheduled_at);
        Ok(timers)
    }

    async fn list_timers_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<TimerRecord>, EngineError> {
        let mut timers: Vec<TimerRecord> = self
            .timers
            .iter()
            .filter(|entry| entry.participant_id == participant_id)
            .map(|entry| entry.value().clone())
            .collect();
        timers.sort_by_key(|t| t.scheduled_at);
        Ok(timers)
    }

    async fn save_hook(&self, record: &HookRecord) -> Result<(), EngineError> {
        self.hooks.insert(record.address.clone(), record.clone());
        Ok(())
    }

    async fn delete_hook(&self, address: &str) -> Result<(), EngineError> {
        self.hooks.remove(address);
        Ok(())
    }

    async fn list_hooks(&self) -> Result<Vec<HookRecord>, EngineError> {
        Ok(self.hooks.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save_participant(&self, record: &ParticipantRecord) -> Result<(), EngineError> {
        self.participants.insert(
            key(&record.participant_id, &record.flow_id),
            record.clone(),
        );
        Ok(())
    }

    async fn get_participant(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<ParticipantRecord>, EngineError> {
        Ok(self
            .participants
            .get(&key(participant_id, flow_id))
            .map(|entry| entry.value().clone()))
    }

    async fn update_participant_status(
        &self,
        participant_id: &str,
        flow_id: &str,
        status: ParticipantStatus,
    ) -> Result<bool, EngineError> {
        match self.participants.get_mut(&key(participant_id, flow_id)) {
            Some(mut record) => {
                record.status = status.to_string();
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError> {
        let mut participants: Vec<ParticipantRecord> = self
            .participants
            .iter()
            .filter(|entry| entry.flow_id == flow_id)
            .map(|entry| entry.value().clone())
            .collect();
        participants.sort_by_key(|p| p.enrolled_at);
        Ok(participants)
    }

    async fn list_active_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError> {
        let mut participants: Vec<ParticipantRecord> = self
            .participants
            .iter()
            .filter(|entry| {
                entry.flow_id == flow_id && entry.status() == ParticipantStatus::Active
            })
            .map(|entry| entry.value().clone())
            .collect();
        participants.sort_by_key(|p| p.enrolled_at);
        Ok(participants)
    }

    async fn record_response(&self, record: &ResponseRecord) -> Result<(), EngineError> {
        self.responses.lock().await.push(record.clone());
        Ok(())
    }

    async fn record_receipt(&self, record: &ReceiptRecord) -> Result<(), EngineError> {
        self.receipts.lock().await.push(record.clone());
        Ok(())
    }
}
