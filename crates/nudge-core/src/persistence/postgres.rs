// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence operations for nudge-core.
//!
//! Free functions take a pool so they can be reused by tooling; the
//! [`PostgresPersistence`] trait implementation delegates to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::EngineError;
use crate::migrations;

use super::{
    FlowStateRecord, HookRecord, HookRow, ParticipantRecord, ParticipantStatus, Persistence,
    ReceiptRecord, ResponseRecord, TimerRecord, TimerRow,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    ///
    /// The caller is responsible for running [`migrations::run_postgres`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a PostgreSQL URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                EngineError::storage("connect", format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Flow State Operations
// ============================================================================

/// Load a participant's state row together with its data values.
pub async fn get_flow_state(
    pool: &PgPool,
    participant_id: &str,
    flow_id: &str,
) -> Result<Option<FlowStateRecord>, EngineError> {
    let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT current_state, created_at, updated_at
        FROM flow_states
        WHERE participant_id = $1 AND flow_id = $2
        "#,
    )
    .bind(participant_id)
    .bind(flow_id)
    .fetch_optional(pool)
    .await?;

    let Some((current_state, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let data: Vec<(String, String)> = sqlx::query_as(
        "SELECT data_key, value FROM flow_state_data WHERE participant_id = $1 AND flow_id = $2",
    )
    .bind(participant_id)
    .bind(flow_id)
    .fetch_all(pool)
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

/// Create the state row or overwrite its current state.
pub async fn upsert_flow_state(
    pool: &PgPool,
    participant_id: &str,
    flow_id: &str,
    state: &str,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO flow_states (participant_id, flow_id, current_state, created_at, updated_at)
        VALUES ($1, $2, $3, NOW(), NOW())
        ON CONFLICT (participant_id, flow_id)
        DO UPDATE SET current_state = EXCLUDED.current_state, updated_at = NOW()
        "#,
    )
    .bind(participant_id)
    .bind(flow_id)
    .bind(state)
    .execute(pool)
    .await?;

    Ok(())
}

/// Compare-and-set on the current state.
pub async fn update_flow_state_if(
    pool: &PgPool,
    participant_id: &str,
    flow_id: &str,
    expected: &str,
    state: &str,
) -> Result<bool, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE flow_states
        SET current_state = $1, updated_at = NOW()
        WHERE participant_id = $2 AND flow_id = $3 AND current_state = $4
        "#,
    )
    .bind(state)
    .bind(participant_id)
    .bind(flow_id)
    .bind(expected)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Upsert one data value, creating an empty state row when needed.
pub async fn set_state_data(
    pool: &PgPool,
    participant_id: &str,
    flow_id: &str,
    key: &str,
    value: &str,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO flow_states (participant_id, flow_id, current_state, created_at, updated_at)
        VALUES ($1, $2, '', NOW(), NOW())
        ON CONFLICT (participant_id, flow_id) DO UPDATE SET updated_at = NOW()
        "#,
    )
    .bind(participant_id)
    .bind(flow_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO flow_state_data (participant_id, flow_id, data_key, value, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (participant_id, flow_id, data_key)
        DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
        "#,
    )
    .bind(participant_id)
    .bind(flow_id)
    .bind(key)
    .bind(value)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Delete a state row and its data.
pub async fn delete_flow_state(
    pool: &PgPool,
    participant_id: &str,
    flow_id: &str,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM flow_state_data WHERE participant_id = $1 AND flow_id = $2")
        .bind(participant_id)
        .bind(flow_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM flow_states WHERE participant_id = $1 AND flow_id = $2")
        .bind(participant_id)
        .bind(flow_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Timer Operations
// ============================================================================

const TIMER_COLUMNS: &str = "id, participant_id, flow_id, state_type, data_key, timer_kind, \
    callback_type, callback_params, scheduled_at, expires_at, original_delay_ms, pattern, \
    timezone, next_run";

/// Insert or replace a timer record.
pub async fn save_timer(pool: &PgPool, record: &TimerRecord) -> Result<(), EngineError> {
    let params = serde_json::to_string(&record.callback_params)?;
    sqlx::query(
        r#"
        INSERT INTO timers (
            id, participant_id, flow_id, state_type, data_key, timer_kind,
            callback_type, callback_params, scheduled_at, expires_at,
            original_delay_ms, pattern, timezone, next_run
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE SET
            participant_id = EXCLUDED.participant_id,
            flow_id = EXCLUDED.flow_id,
            state_type = EXCLUDED.state_type,
            data_key = EXCLUDED.data_key,
            timer_kind = EXCLUDED.timer_kind,
            callback_type = EXCLUDED.callback_type,
            callback_params = EXCLUDED.callback_params,
            scheduled_at = EXCLUDED.scheduled_at,
            expires_at = EXCLUDED.expires_at,
            original_delay_ms = EXCLUDED.original_delay_ms,
            pattern = EXCLUDED.pattern,
            timezone = EXCLUDED.timezone,
            next_run = EXCLUDED.next_run
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
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one timer record.
pub async fn get_timer(pool: &PgPool, timer_id: &str) -> Result<Option<TimerRecord>, EngineError> {
    sqlx::query_as::<_, TimerRow>(&format!("SELECT {TIMER_COLUMNS} FROM timers WHERE id = $1"))
        .bind(timer_id)
        .fetch_optional(pool)
        .await?
        .map(TimerRecord::try_from)
        .transpose()
}

/// List timer records, optionally for a single participant.
pub async fn list_timers(
    pool: &PgPool,
    participant_id: Option<&str>,
) -> Result<Vec<TimerRecord>, EngineError> {
    let rows = sqlx::query_as::<_, TimerRow>(&format!(
        "SELECT {TIMER_COLUMNS} FROM timers \
         WHERE ($1::TEXT IS NULL OR participant_id = $1) \
         ORDER BY scheduled_at ASC"
    ))
    .bind(participant_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TimerRecord::try_from).collect()
}

// ============================================================================
// Hook Operations
// ============================================================================

/// Insert or replace the hook for an address.
pub async fn save_hook(pool: &PgPool, record: &HookRecord) -> Result<(), EngineError> {
    let params = serde_json::to_string(&record.params)?;
    sqlx::query(
        r#"
        INSERT INTO hooks (address, hook_type, params, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (address) DO UPDATE SET
            hook_type = EXCLUDED.hook_type,
            params = EXCLUDED.params,
            created_at = EXCLUDED.created_at
        "#,
    )
    .bind(&record.address)
    .bind(&record.hook_type)
    .bind(params)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// List persisted hooks.
pub async fn list_hooks(pool: &PgPool) -> Result<Vec<HookRecord>, EngineError> {
    let rows = sqlx::query_as::<_, HookRow>(
        "SELECT address, hook_type, params, created_at FROM hooks ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(HookRecord::try_from).collect()
}

// ============================================================================
// Participant Operations
// ============================================================================

const PARTICIPANT_COLUMNS: &str =
    "participant_id, flow_id, address, name, timezone, schedule, status, enrolled_at, updated_at";

/// Insert or replace an enrollment record.
pub async fn save_participant(pool: &PgPool, record: &ParticipantRecord) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO participants (
            participant_id, flow_id, address, name, timezone, schedule,
            status, enrolled_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (participant_id, flow_id) DO UPDATE SET
            address = EXCLUDED.address,
            name = EXCLUDED.name,
            timezone = EXCLUDED.timezone,
            schedule = EXCLUDED.schedule,
            status = EXCLUDED.status,
            enrolled_at = EXCLUDED.enrolled_at,
            updated_at = EXCLUDED.updated_at
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
    .execute(pool)
    .await?;

    Ok(())
}

/// Active enrollments of a flow.
pub async fn list_participants(
    pool: &PgPool,
    flow_id: &str,
) -> Result<Vec<ParticipantRecord>, EngineError> {
    let records = sqlx::query_as::<_, ParticipantRecord>(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants \
         WHERE flow_id = $1 ORDER BY enrolled_at ASC"
    ))
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Enrollments of a flow whose status is `active`.
pub async fn list_active_participants(
    pool: &PgPool,
    flow_id: &str,
) -> Result<Vec<ParticipantRecord>, EngineError> {
    let records = sqlx::query_as::<_, ParticipantRecord>(&format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants \
         WHERE flow_id = $1 AND status = 'active' ORDER BY enrolled_at ASC"
    ))
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Persistence Trait Implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn get_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<FlowStateRecord>, EngineError> {
        get_flow_state(&self.pool, participant_id, flow_id).await
    }

    async fn upsert_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
        state: &str,
    ) -> Result<(), EngineError> {
        upsert_flow_state(&self.pool, participant_id, flow_id, state).await
    }

    async fn update_flow_state_if(
        &self,
        participant_id: &str,
        flow_id: &str,
        expected: &str,
        state: &str,
    ) -> Result<bool, EngineError> {
        update_flow_state_if(&self.pool, participant_id, flow_id, expected, state).await
    }

    async fn set_state_data(
        &self,
        participant_id: &str,
        flow_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        set_state_data(&self.pool, participant_id, flow_id, key, value).await
    }

    async fn delete_flow_state(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<(), EngineError> {
        delete_flow_state(&self.pool, participant_id, flow_id).await
    }

    async fn save_timer(&self, record: &TimerRecord) -> Result<(), EngineError> {
        save_timer(&self.pool, record).await
    }

    async fn get_timer(&self, timer_id: &str) -> Result<Option<TimerRecord>, EngineError> {
        get_timer(&self.pool, timer_id).await
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM timers WHERE id = $1")
            .bind(timer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, EngineError> {
        list_timers(&self.pool, None).await
    }

    async fn list_timers_for_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<TimerRecord>, EngineError> {
        list_timers(&self.pool, Some(participant_id)).await
    }

    async fn save_hook(&self, record: &HookRecord) -> Result<(), EngineError> {
        save_hook(&self.pool, record).await
    }

    async fn delete_hook(&self, address: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM hooks WHERE address = $1")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_hooks(&self) -> Result<Vec<HookRecord>, EngineError> {
        list_hooks(&self.pool).await
    }

    async fn save_participant(&self, record: &ParticipantRecord) -> Result<(), EngineError> {
        save_participant(&self.pool, record).await
    }

    async fn get_participant(
        &self,
        participant_id: &str,
        flow_id: &str,
    ) -> Result<Option<ParticipantRecord>, EngineError> {
        let record = sqlx::query_as::<_, ParticipantRecord>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE participant_id = $1 AND flow_id = $2"
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
            SET status = $1, updated_at = NOW()
            WHERE participant_id = $2 AND flow_id = $3
            "#,
        )
        .bind(status.as_ref())
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
        list_participants(&self.pool, flow_id).await
    }

    async fn list_active_participants(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ParticipantRecord>, EngineError> {
        list_active_participants(&self.pool, flow_id).await
    }

    async fn record_response(&self, record: &ResponseRecord) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO responses (address, body, received_at, routed) VALUES ($1, $2, $3, $4)",
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
            "INSERT INTO delivery_receipts (address, status, occurred_at) VALUES ($1, $2, $3)",
        )
        .bind(&record.address)
        .bind(&record.status)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pool.close().await;
        Ok(())
    }
}
