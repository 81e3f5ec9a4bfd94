// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup reconstruction of timers and hooks.
//!
//! Components register as [`Recoverable`] (whole-component recovery) or
//! [`ParticipantRecoverable`] (called once per active participant of a flow).
//! They rebuild runtime state through the [`RecoveryRegistry`], which forwards
//! to callbacks installed by the engine, so this module never depends on the
//! timer or hook implementations directly.
//!
//! Recovery is best effort: a failing component is recorded in the
//! [`RecoveryReport`] and the remaining components still run.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::persistence::{ParticipantRecord, ParticipantStatus, Persistence, TimerRecord};

/// Future returned by recovery callbacks.
pub type RecoveryFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

type TimerRecoveryFn = Arc<dyn Fn(TimerRecoveryInfo) -> RecoveryFuture<String> + Send + Sync>;
type HandlerRecoveryFn = Arc<dyn Fn(HandlerRecoveryInfo) -> RecoveryFuture<()> + Send + Sync>;

/// A stored timer to re-arm.
#[derive(Debug, Clone)]
pub struct TimerRecoveryInfo {
    /// The persisted record, rebuilt under the same id.
    pub record: TimerRecord,
}

/// A response handler to re-register.
#[derive(Debug, Clone)]
pub struct HandlerRecoveryInfo {
    /// Participant address.
    pub address: String,
    /// Hook factory tag.
    pub hook_type: String,
    /// Factory parameters.
    pub params: HashMap<String, String>,
}

/// Recovery entry points handed to recoverable components.
#[derive(Clone, Default)]
pub struct RecoveryRegistry {
    timer: Option<TimerRecoveryFn>,
    handler: Option<HandlerRecoveryFn>,
}

impl RecoveryRegistry {
    /// Re-arm a timer. Returns the timer id.
    pub async fn recover_timer(&self, info: TimerRecoveryInfo) -> Result<String> {
        let callback = self.timer.as_ref().ok_or_else(|| EngineError::Recovery {
            component: "registry".to_string(),
            details: "no timer recovery callback registered".to_string(),
        })?;
        callback(info).await
    }

    /// Re-register a response handler.
    pub async fn recover_response_handler(&self, info: HandlerRecoveryInfo) -> Result<()> {
        let callback = self.handler.as_ref().ok_or_else(|| EngineError::Recovery {
            component: "registry".to_string(),
            details: "no handler recovery callback registered".to_string(),
        })?;
        callback(info).await
    }
}

/// A component that rebuilds its own runtime state.
#[async_trait]
pub trait Recoverable: Send + Sync {
    /// Component name used in logs and reports.
    fn name(&self) -> &str;

    /// Rebuild runtime state from storage.
    async fn recover_state(&self, registry: &RecoveryRegistry) -> Result<()>;
}

/// A component that rebuilds state for each active participant of a flow.
#[async_trait]
pub trait ParticipantRecoverable: Send + Sync {
    /// Component name used in logs and reports.
    fn name(&self) -> &str;

    /// Flow whose active participants are visited.
    fn flow_id(&self) -> &str;

    /// Rebuild runtime state for one participant.
    async fn recover_participant(
        &self,
        participant_id: &str,
        record: &ParticipantRecord,
        registry: &RecoveryRegistry,
    ) -> Result<()>;
}

/// Outcome of [`RecoveryManager::recover_all`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Components attempted.
    pub attempted: usize,
    /// Components that recovered cleanly.
    pub succeeded: usize,
    /// Failures as (component, error).
    pub failures: Vec<(String, EngineError)>,
}

impl RecoveryReport {
    /// True when no component failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line summary for the startup log.
    pub fn summary(&self) -> String {
        format!(
            "recovery completed with {} errors out of {} components",
            self.failures.len(),
            self.attempted
        )
    }

    /// Collapse into a single error when anything failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        let details = self
            .failures
            .iter()
            .map(|(component, e)| format!("{component}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::Recovery {
            component: "recovery".to_string(),
            details: format!("{}: {details}", self.summary()),
        })
    }
}

/// Runs every registered recoverable at startup.
pub struct RecoveryManager {
    persistence: Arc<dyn Persistence>,
    recoverables: Vec<Arc<dyn Recoverable>>,
    participant_recoverables: Vec<Arc<dyn ParticipantRecoverable>>,
    registry: RecoveryRegistry,
}

impl RecoveryManager {
    /// Create an empty manager.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            recoverables: Vec::new(),
            participant_recoverables: Vec::new(),
            registry: RecoveryRegistry::default(),
        }
    }

    /// Add a whole-component recoverable.
    pub fn register_recoverable(&mut self, component: Arc<dyn Recoverable>) {
        self.recoverables.push(component);
    }

    /// Add a per-participant recoverable.
    pub fn register_participant_recoverable(&mut self, component: Arc<dyn ParticipantRecoverable>) {
        self.participant_recoverables.push(component);
    }

    /// Install the timer re-arm callback.
    pub fn register_timer_recovery<F>(&mut self, callback: F)
    where
        F: Fn(TimerRecoveryInfo) -> RecoveryFuture<String> + Send + Sync + 'static,
    {
        self.registry.timer = Some(Arc::new(callback));
    }

    /// Install the handler re-register callback.
    pub fn register_handler_recovery<F>(&mut self, callback: F)
    where
        F: Fn(HandlerRecoveryInfo) -> RecoveryFuture<()> + Send + Sync + 'static,
    {
        self.registry.handler = Some(Arc::new(callback));
    }

    /// Registry handed to recoverables.
    pub fn registry(&self) -> &RecoveryRegistry {
        &self.registry
    }

    /// Run every recoverable, collecting failures instead of stopping.
    pub async fn recover_all(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for component in &self.recoverables {
            report.attempted += 1;
            match component.recover_state(&self.registry).await {
                Ok(()) => {
                    debug!(component = component.name(), "Component recovered");
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(component = component.name(), error = %e, "Component recovery failed");
                    report.failures.push((component.name().to_string(), e));
                }
            }
        }

        for component in &self.participant_recoverables {
            report.attempted += 1;
            match self.recover_participants(component.as_ref()).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    error!(component = component.name(), error = %e, "Component recovery failed");
                    report.failures.push((component.name().to_string(), e));
                }
            }
        }

        if report.is_clean() {
            info!(components = report.attempted, "Recovery complete");
        } else {
            warn!(
                failed = report.failures.len(),
                components = report.attempted,
                "{}",
                report.summary()
            );
        }
        report
    }

    async fn recover_participants(&self, component: &dyn ParticipantRecoverable) -> Result<()> {
        let participants = self
            .persistence
            .list_active_participants(component.flow_id())
            .await?;

        let total = participants.len();
        let mut failed = Vec::new();
        for participant in &participants {
            if let Err(e) = component
                .recover_participant(&participant.participant_id, participant, &self.registry)
                .await
            {
                warn!(
                    component = component.name(),
                    participant_id = %participant.participant_id,
                    error = %e,
                    "Participant recovery failed"
                );
                failed.push(participant.participant_id.clone());
            }
        }

        info!(
            component = component.name(),
            flow = component.flow_id(),
            recovered = total - failed.len(),
            total,
            "Participants recovered"
        );

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Recovery {
                component: component.name().to_string(),
                details: format!(
                    "{} of {total} participants failed: {}",
                    failed.len(),
                    failed.join(", ")
                ),
            })
        }
    }
}

/// Re-arms every stored timer.
///
/// Records whose participant is gone or has left the program are deleted.
/// Records that fail to rebuild are kept and reported.
pub struct PersistedTimers {
    persistence: Arc<dyn Persistence>,
}

impl PersistedTimers {
    /// Recoverable over the given store.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    async fn is_dangling(&self, record: &TimerRecord) -> Result<bool> {
        let participant = self
            .persistence
            .get_participant(&record.participant_id, &record.flow_id)
            .await?;
        Ok(match participant {
            None => true,
            Some(p) => matches!(
                p.status(),
                ParticipantStatus::Withdrawn | ParticipantStatus::Completed
            ),
        })
    }
}

#[async_trait]
impl Recoverable for PersistedTimers {
    fn name(&self) -> &str {
        "persisted_timers"
    }

    async fn recover_state(&self, registry: &RecoveryRegistry) -> Result<()> {
        let records = self.persistence.list_timers().await?;
        let total = records.len();
        let mut restored = 0;
        let mut failed = 0;

        for record in records {
            let id = record.id.clone();
            match self.is_dangling(&record).await {
                Ok(false) => {}
                Ok(true) => {
                    warn!(
                        timer_id = %id,
                        participant_id = %record.participant_id,
                        "Dropping timer for missing participant"
                    );
                    if let Err(e) = self.persistence.delete_timer(&id).await {
                        warn!(timer_id = %id, error = %e, "Failed to delete dangling timer");
                        failed += 1;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(timer_id = %id, error = %e, "Failed to look up timer owner");
                    failed += 1;
                    continue;
                }
            }

            match registry.recover_timer(TimerRecoveryInfo { record }).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(timer_id = %id, error = %e, "Failed to restore timer");
                    failed += 1;
                }
            }
        }

        info!(restored, total, "Timers restored");
        if failed > 0 {
            return Err(EngineError::Recovery {
                component: self.name().to_string(),
                details: format!("{failed} of {total} timers could not be restored"),
            });
        }
        Ok(())
    }
}
