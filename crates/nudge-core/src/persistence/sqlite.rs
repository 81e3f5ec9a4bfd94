// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::EngineError;
use crate::migrations;

use super::{
    FlowStateRecord, HookRecord, HookRow, ParticipantRecord, ParticipantStatus, Persistence,
    ReceiptRecord, ResponseRecord, TimerRecord, TimerRow,
};

const TIMER_COLUMNS: &str = "id, participant_id, flow_id, state_type, data_key, timer_kind, \
    callback_type, callback_params, scheduled_at, expires_at, original_delay_ms, pattern, \
    timezone, next_run";

const PARTICIPANT_COLUMNS: &str =
    "participant_id, flow_id, address, name, timezone, schedule, status, enrolled_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/nudge.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        // An in-memory database lives and dies with its connection, so keep
        // exactly one and never recycle it.
        if url.contains(":memory:") {
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options
            .connect(url)
            .await
            .map_err(|e| {
                EngineError::storage("connect", format!("Failed to connect to SQLite: {}", e))
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn get_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<FlowStateRecord>, EngineError> {
        let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT current_state, created_at, updated_at
            FROM flow_states
            WHERE participant_id = ? AND flow_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((current_state, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let data: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT data_key, value
            FROM flow_state_data
            WHERE participant_id = ? AND flow_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(FlowStateRecord {
            participant_id: participant_id.to_string(),
            flow_id: flow_id.to_string(),
            current_state,
            state_data: data.into_iter().collect(),
            created_at,
            updated_at,
        }))
    }

    async fn upsert_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        state: &str,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO flow_states (participant_id, flow_id, current_state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT (participant_id, flow_id)
            DO UPDATE SET current_state = excluded.current_state, updated_at = excluded.updated_at
            "#,
        )
        .bind(participant_id)
        .bind(flow_id)
        .bind(state)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_flow_state_if(
        &self,
        participant_id: &str,
        flow_id: &str,
        expected: &str,
        state: &str,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE flow_states
            SET current_state = ?1, updated_at = ?2
            WHERE participant_id = ?3
              AND flow_id = ?4
              AND current_state = ?5
            "#,
        )
        .bind(state)
        .bind(Utc::now())
        .bind(participant_id)
        .bind(flow_id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO flow_states (participant_id, flow_id, current_state, created_at, updated_at)
            VALUES (?1, ?2, '', ?3, ?3)
            ON CONFLICT (participant_id, flow_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(participant_id)
        .bind(flow_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO flow_state_data (participant_id, flow_id, data_key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (participant_id, flow_id, data_key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(participant_id)
        .bind(flow_id)
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM flow_state_data WHERE participant_id = ? AND flow_id = ?")
            .bind(participant_id)
            .bind(flow_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM flow_states WHERE participant_id = ? AND flow_id = ?")
            .bind(participant_id)
            .bind(flow_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_timer(&self, record: &TimerRecord) -> Result<(), EngineError> {
        let params = serde_json::to_string(&record.callback_params)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO timers (
                id, participant_id, flow_id, state_type, data_key, timer_kind,
                callback_type, callback_params, scheduled_at, expires_at,
                original_delay_ms, pattern, timezone, next_run
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.participant_id)
        .bind(&record.flow_id)
        .bind(&record.state_type)
        .bind(&record.data_key)
        .bind(record.timer_kind.as_ref())
        .bind(&record.callback_type)
        .bind(params)
        .bind(record.scheduled_at)
        .bind(record.expires_at)
        .bind(record.original_delay_ms)
        .bind(&record.pattern)
        .bind(&record.timezone)
        .bind(record.next_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_timer(&self, timer_id: &str) -> Result<Option<TimerRecord>, EngineError> {
        let row = sqlx::query_as::<_, TimerRow>(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers WHERE id = ?"
        ))
        .bind(timer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TimerRecord::try_from).transpose()
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM timers WHERE id = ?")
            .bind(timer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, EngineError> {
        let rows = sqlx::query_as::<_, TimerRow>(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers ORDER BY scheduled_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TimerRecord::try_from).collect()
    }

    async fn list_timers_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<TimerRecord>, EngineError> {
        let rows = sqlx::query_as::<_, TimerRow>(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers WHERE participant_id = ? ORDER BY scheduled_at ASC"
        ))
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TimerRecord::try_from).collect()
    }

    async fn save_hook(&self, record: &HookRecord) -> Result<(), EngineError> {
        let params = serde_json::to_string(&record.params)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO hooks (address, hook_type, params, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&record.address)
        .bind(&record.hook_type)
        .bind(params)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_hook(&self, address: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM hooks WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_hooks(&self) -> Result<Vec<HookRecord>, EngineError> {
        let rows = sqlx::query_as::<_, HookRow>(
            "SELECT address, hook_type, params, created_at FROM hooks ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HookRecord::try_from).collect()
    }

    async fn save_participant(&self, record: &ParticipantRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO participants (
                participant_id, flow_id, address, name, timezone, schedule,
                status, enrolled_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.participant_id)
        .bind(&record.flow_id)
        .bind(&record.address)
        .bind(&record.name)
        .bind(&record.timezone)
        .bind(&record.schedule)
        .bind(&record.status)
        .bind(record.enrolled_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_participant(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<ParticipantRecord>, EngineError> {
        let record = sqlx::query_as::<_, ParticipantRecord>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE participant_id = ? AND flow_id = ?"
        ))
        .bind(participant_id)
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_participant_status(
        &self,
        participant_id: &str,
        flow_id: &str,
        status: ParticipantStatus,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE participants
            SET status = ?1, updated_at = ?2
            WHERE participant_id = ?3 AND flow_id = ?4
            "#,
        )
        .bind(status.as_ref())
        .bind(Utc::now())
        .bind(participant_id)
        .bind(flow_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError> {
        let records = sqlx::query_as::<_, ParticipantRecord>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE flow_id = ? ORDER BY enrolled_at ASC"
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_active_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError> {
        let records = sqlx::query_as::<_, ParticipantRecord>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE flow_id = ? AND status = 'active' ORDER BY enrolled_at ASC"
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn record_response(&self, record: &ResponseRecord) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO responses (address, body, received_at, routed) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.address)
        .bind(&record.body)
        .bind(record.received_at)
        .bind(record.routed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_receipt(&self, record: &ReceiptRecord) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO delivery_receipts (address, status, occurred_at) VALUES (?, ?, ?)",
        )
        .bind(&record.address)
        .bind(&record.status)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::persistence::TimerKind;

    /// Create an in-memory SQLite persistence for testing.
    async fn test_persistence() -> SqlitePersistence {
        SqlitePersistence::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to create in-memory SQLite persistence")
    }

    fn timer(id: &str, participant: &str) -> TimerRecord {
        let now = Utc::now();
        TimerRecord {
            id: id.to_string(),
            participant_id: participant.to_string(),
            flow_id: "intervention".to_string(),
            state_type: Some("FEELING_PROMPT".to_string()),
            data_key: Some("feeling_timer_id".to_string()),
            timer_kind: TimerKind::Once,
            callback_type: "feeling_timeout".to_string(),
            callback_params: HashMap::from([("participant_id".to_string(), participant.to_string())]),
            scheduled_at: now,
            expires_at: Some(now + chrono::Duration::minutes(15)),
            original_delay_ms: Some(15 * 60 * 1000),
            pattern: None,
            timezone: None,
            next_run: None,
        }
    }

    #[tokio::test]
    async fn test_flow_state_round_trip() {
        let store = test_persistence().await;

        assert!(store.get_flow_state("p1", "f").await.unwrap().is_none());

        store.upsert_flow_state("p1", "f", "ORIENTATION").await.unwrap();
        store.set_state_data("p1", "f", "k1", "v1").await.unwrap();
        store.set_state_data("p1", "f", "k1", "v2").await.unwrap();

        let record = store.get_flow_state("p1", "f").await.unwrap().unwrap();
        assert_eq!(record.current_state, "ORIENTATION");
        assert_eq!(record.state_data.get("k1").map(String::as_str), Some("v2"));
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = test_persistence().await;
        store.upsert_flow_state("p1", "f", "A").await.unwrap();

        assert!(store.update_flow_state_if("p1", "f", "A", "B").await.unwrap());
        assert!(!store.update_flow_state_if("p1", "f", "A", "C").await.unwrap());

        let record = store.get_flow_state("p1", "f").await.unwrap().unwrap();
        assert_eq!(record.current_state, "B");
    }

    #[tokio::test]
    async fn test_delete_flow_state_removes_data() {
        let store = test_persistence().await;
        store.upsert_flow_state("p1", "f", "A").await.unwrap();
        store.set_state_data("p1", "f", "k", "v").await.unwrap();

        store.delete_flow_state("p1", "f").await.unwrap();
        assert!(store.get_flow_state("p1", "f").await.unwrap().is_none());

        // A fresh row must not inherit old data
        store.upsert_flow_state("p1", "f", "A").await.unwrap();
        let record = store.get_flow_state("p1", "f").await.unwrap().unwrap();
        assert!(record.state_data.is_empty());
    }

    #[tokio::test]
    async fn test_timer_records() {
        let store = test_persistence().await;
        store.save_timer(&timer("t1", "p1")).await.unwrap();
        store.save_timer(&timer("t2", "p2")).await.unwrap();

        let loaded = store.get_timer("t1").await.unwrap().unwrap();
        assert_eq!(loaded.callback_type, "feeling_timeout");
        assert_eq!(loaded.timer_kind, TimerKind::Once);
        assert_eq!(
            loaded.callback_params.get("participant_id").map(String::as_str),
            Some("p1")
        );

        assert_eq!(store.list_timers().await.unwrap().len(), 2);
        assert_eq!(store.list_timers_for_participant("p2").await.unwrap().len(), 1);

        store.delete_timer("t1").await.unwrap();
        store.delete_timer("t1").await.unwrap();
        assert!(store.get_timer("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hooks_replace_by_address() {
        let store = test_persistence().await;
        let mut hook = HookRecord {
            address: "15551234567".to_string(),
            hook_type: "intervention".to_string(),
            params: HashMap::new(),
            created_at: Utc::now(),
        };
        store.save_hook(&hook).await.unwrap();
        hook.hook_type = "other".to_string();
        store.save_hook(&hook).await.unwrap();

        let hooks = store.list_hooks().await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].hook_type, "other");

        store.delete_hook("15551234567").await.unwrap();
        assert!(store.list_hooks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_participants() {
        let store = test_persistence().await;
        let now = Utc::now();
        for (id, status) in [("p1", "active"), ("p2", "paused"), ("p3", "active")] {
            store
                .save_participant(&ParticipantRecord {
                    participant_id: id.to_string(),
                    flow_id: "intervention".to_string(),
                    address: format!("1555000{id}"),
                    name: None,
                    timezone: "UTC".to_string(),
                    schedule: "10:00".to_string(),
                    status: status.to_string(),
                    enrolled_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        let active = store.list_active_participants("intervention").await.unwrap();
        assert_eq!(active.len(), 2);

        assert!(
            store
                .update_participant_status("p1", "intervention", ParticipantStatus::Withdrawn)
                .await
                .unwrap()
        );
        let active = store.list_active_participants("intervention").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].participant_id, "p3");

        let all = store.list_participants("intervention").await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(store.list_participants("other").await.unwrap().is_empty());
    }
}
