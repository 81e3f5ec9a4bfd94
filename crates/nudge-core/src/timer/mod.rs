// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer service: delayed, absolute and calendar-pattern callbacks.
//!
//! Callbacks are plain futures and never touch storage. A caller that wants a
//! timer to survive a restart also passes a [`DurableTimer`] descriptor; the
//! service writes a [`TimerRecord`] naming a registered callback type, and at
//! startup [`TimerService::restore`] rebuilds the future through the
//! [`CallbackRegistry`].
//!
//! Every scheduled callback runs on its own task. A one-shot timer fires at
//! most once per process; a recurring timer keeps its id and re-arms itself
//! for the next occurrence after each run.

mod registry;

pub use registry::{CallbackFactory, CallbackRegistry, required_param};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::persistence::{Persistence, TimerKind, TimerRecord};
use crate::schedule::SchedulePattern;

/// A timer callback.
pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Produces one callback per occurrence of a recurring timer.
pub type RecurringCallback = Arc<dyn Fn() -> TimerFuture + Send + Sync>;

/// Persistence descriptor for a timer that must survive a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableTimer {
    /// Participant the timer acts on.
    pub participant_id: String,
    /// Flow the timer belongs to.
    pub flow_id: String,
    /// State the timer belongs to.
    pub state_type: Option<String>,
    /// State data slot tracking the timer id.
    pub data_key: Option<String>,
    /// Registered callback type used to rebuild the callback.
    pub callback_type: String,
    /// Parameters for the callback factory.
    pub callback_params: HashMap<String, String>,
}

impl DurableTimer {
    /// Descriptor with no state, slot or parameters.
    pub fn new(
        participant_id: impl Into<String>,
        flow_id: impl Into<String>,
        callback_type: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            flow_id: flow_id.into(),
            state_type: None,
            data_key: None,
            callback_type: callback_type.into(),
            callback_params: HashMap::new(),
        }
    }

    /// Set the owning state.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state_type = Some(state.into());
        self
    }

    /// Set the data slot that tracks this timer.
    pub fn data_key(mut self, key: impl Into<String>) -> Self {
        self.data_key = Some(key.into());
        self
    }

    /// Add a callback parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.callback_params.insert(key.into(), value.into());
        self
    }

    fn into_record(self, id: &str, kind: TimerKind, scheduled_at: DateTime<Utc>) -> TimerRecord {
        TimerRecord {
            id: id.to_string(),
            participant_id: self.participant_id,
            flow_id: self.flow_id,
            state_type: self.state_type,
            data_key: self.data_key,
            timer_kind: kind,
            callback_type: self.callback_type,
            callback_params: self.callback_params,
            scheduled_at,
            expires_at: None,
            original_delay_ms: None,
            pattern: None,
            timezone: None,
            next_run: None,
        }
    }
}

/// Public view of an active timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerInfo {
    /// Timer identifier.
    pub id: String,
    /// Once or recurring.
    pub kind: TimerKind,
    /// Human-readable description.
    pub description: String,
    /// When the timer was scheduled.
    pub scheduled_at: DateTime<Utc>,
    /// Next firing instant.
    pub next_fire: Option<DateTime<Utc>>,
    /// Time left until the next firing.
    pub remaining: Option<Duration>,
    /// Participant of a durable timer.
    pub participant_id: Option<String>,
    /// Callback type of a durable timer.
    pub callback_type: Option<String>,
    /// Pattern text of a recurring timer.
    pub pattern: Option<String>,
}

/// Delay left before a persisted one-shot timer is due: `max(0, deadline - now)`.
pub fn remaining_delay(record: &TimerRecord, now: DateTime<Utc>) -> Duration {
    let deadline = record.expires_at.or_else(|| {
        record
            .original_delay_ms
            .map(|ms| record.scheduled_at + chrono::Duration::milliseconds(ms))
    });
    deadline
        .and_then(|deadline| (deadline - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

fn until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

struct TimerEntry {
    kind: TimerKind,
    description: String,
    scheduled_at: DateTime<Utc>,
    next_fire: Option<DateTime<Utc>>,
    pattern: Option<String>,
    record: Option<TimerRecord>,
    running: bool,
    abort: Option<AbortHandle>,
}

impl TimerEntry {
    fn info(&self, id: &str) -> TimerInfo {
        TimerInfo {
            id: id.to_string(),
            kind: self.kind,
            description: self.description.clone(),
            scheduled_at: self.scheduled_at,
            next_fire: self.next_fire,
            remaining: self.next_fire.map(until),
            participant_id: self.record.as_ref().map(|r| r.participant_id.clone()),
            callback_type: self.record.as_ref().map(|r| r.callback_type.clone()),
            pattern: self.pattern.clone(),
        }
    }

    /// A one-shot timer that already started firing is no longer active.
    fn is_active(&self) -> bool {
        !(self.kind == TimerKind::Once && self.running)
    }
}

struct Inner {
    entries: DashMap<String, TimerEntry>,
    tasks: Mutex<JoinSet<()>>,
    persistence: Option<Arc<dyn Persistence>>,
    stopped: AtomicBool,
}

impl Inner {
    /// Mark an entry as running. Fails if it was cancelled or the service stopped.
    fn claim(&self, id: &str) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match self.entries.get_mut(id) {
            Some(mut entry) if !entry.running => {
                entry.running = true;
                true
            }
            _ => false,
        }
    }

    async fn forget_record(&self, id: &str) {
        if let Some(persistence) = &self.persistence
            && let Err(e) = persistence.delete_timer(id).await
        {
            warn!(timer_id = %id, error = %e, "Failed to delete timer record");
        }
    }
}

/// Schedules and tracks timers.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl TimerService {
    /// Timer service without durable storage; descriptors are accepted but
    /// nothing is written.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Timer service that persists durable timers.
    pub fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        Self::build(Some(persistence))
    }

    fn build(persistence: Option<Arc<dyn Persistence>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                tasks: Mutex::new(JoinSet::new()),
                persistence,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Run `callback` once after `delay`.
    pub async fn schedule_after<F>(&self, delay: Duration, callback: F) -> Result<String>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let now = Utc::now();
        self.arm_once(new_id(), None, now, now + delay, Box::pin(callback))
            .await
    }

    /// Run `callback` once at `when`. A past instant fires immediately.
    pub async fn schedule_at<F>(&self, when: DateTime<Utc>, callback: F) -> Result<String>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.arm_once(new_id(), None, Utc::now(), when, Box::pin(callback))
            .await
    }

    /// Run `callback` on every occurrence of `pattern`.
    pub async fn schedule_with_pattern(
        &self,
        pattern: &SchedulePattern,
        callback: RecurringCallback,
    ) -> Result<String> {
        self.arm_recurring(new_id(), None, Utc::now(), pattern.clone(), callback)
            .await
    }

    /// Durable variant of [`schedule_after`](Self::schedule_after).
    pub async fn schedule_after_durable<F>(
        &self,
        delay: Duration,
        durable: DurableTimer,
        callback: F,
    ) -> Result<String>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let now = Utc::now();
        let id = new_id();
        let deadline = now + delay;
        let mut record = durable.into_record(&id, TimerKind::Once, now);
        record.expires_at = Some(deadline);
        record.original_delay_ms = Some(delay.as_millis() as i64);
        self.arm_once(id, Some(record), now, deadline, Box::pin(callback))
            .await
    }

    /// Durable variant of [`schedule_at`](Self::schedule_at).
    pub async fn schedule_at_durable<F>(
        &self,
        when: DateTime<Utc>,
        durable: DurableTimer,
        callback: F,
    ) -> Result<String>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let now = Utc::now();
        let id = new_id();
        let mut record = durable.into_record(&id, TimerKind::Once, now);
        record.expires_at = Some(when);
        record.original_delay_ms = Some((when - now).num_milliseconds().max(0));
        self.arm_once(id, Some(record), now, when, Box::pin(callback))
            .await
    }

    /// Durable variant of [`schedule_with_pattern`](Self::schedule_with_pattern).
    pub async fn schedule_with_pattern_durable(
        &self,
        pattern: &SchedulePattern,
        durable: DurableTimer,
        callback: RecurringCallback,
    ) -> Result<String> {
        let now = Utc::now();
        let id = new_id();
        let record = durable.into_record(&id, TimerKind::Recurring, now);
        self.arm_recurring(id, Some(record), now, pattern.clone(), callback)
            .await
    }

    /// Re-arm a persisted timer under its original id and deadline.
    ///
    /// One-shot timers whose deadline passed while the process was down fire
    /// immediately. Recurring timers resume at their next occurrence.
    pub async fn restore(
        &self,
        record: &TimerRecord,
        registry: &Arc<CallbackRegistry>,
    ) -> Result<String> {
        if !registry.contains(&record.callback_type) {
            return Err(EngineError::not_found(
                "callback type",
                record.callback_type.clone(),
            ));
        }
        if self.inner.entries.contains_key(&record.id) {
            debug!(timer_id = %record.id, "Timer already armed");
            return Ok(record.id.clone());
        }

        match record.timer_kind {
            TimerKind::Once => {
                let callback = registry.build(&record.callback_type, &record.callback_params)?;
                let now = Utc::now();
                let delay = remaining_delay(record, now);
                let deadline = now + delay;
                let mut restored = record.clone();
                restored.expires_at = restored.expires_at.or(Some(deadline));
                debug!(
                    timer_id = %record.id,
                    remaining_ms = delay.as_millis() as u64,
                    "Restoring timer"
                );
                self.arm_once(
                    record.id.clone(),
                    Some(restored),
                    record.scheduled_at,
                    deadline,
                    callback,
                )
                .await
            }
            TimerKind::Recurring => {
                let text = record.pattern.as_deref().ok_or_else(|| {
                    EngineError::validation("pattern", "recurring timer record has no pattern")
                })?;
                let timezone: Tz = record
                    .timezone
                    .as_deref()
                    .unwrap_or("UTC")
                    .parse()
                    .map_err(|_| EngineError::validation("timezone", "unknown timezone"))?;
                let pattern = SchedulePattern::parse(text, timezone)?;

                let registry = registry.clone();
                let callback_type = record.callback_type.clone();
                let params = record.callback_params.clone();
                let callback: RecurringCallback =
                    Arc::new(move || match registry.build(&callback_type, &params) {
                        Ok(future) => future,
                        Err(e) => {
                            let callback_type = callback_type.clone();
                            Box::pin(async move {
                                warn!(%callback_type, error = %e, "Failed to rebuild recurring callback");
                            })
                        }
                    });

                self.arm_recurring(
                    record.id.clone(),
                    Some(record.clone()),
                    record.scheduled_at,
                    pattern,
                    callback,
                )
                .await
            }
        }
    }

    /// Cancel a timer. Unknown ids are ignored.
    ///
    /// A one-shot callback that already started is left to finish.
    pub async fn cancel(&self, timer_id: &str) -> Result<()> {
        if let Some((_, entry)) = self.inner.entries.remove(timer_id) {
            if !entry.running
                && let Some(abort) = entry.abort
            {
                abort.abort();
            }
            debug!(timer_id, "Timer cancelled");
        }

        if let Some(persistence) = &self.inner.persistence {
            persistence.delete_timer(timer_id).await?;
        }
        Ok(())
    }

    /// Active timers ordered by next firing.
    pub fn list_active(&self) -> Vec<TimerInfo> {
        let mut timers: Vec<TimerInfo> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.info(entry.key()))
            .collect();
        timers.sort_by_key(|t| t.next_fire);
        timers
    }

    /// One active timer.
    pub fn get_timer(&self, timer_id: &str) -> Result<TimerInfo> {
        self.inner
            .entries
            .get(timer_id)
            .filter(|entry| entry.is_active())
            .map(|entry| entry.info(timer_id))
            .ok_or_else(|| EngineError::not_found("timer", timer_id))
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Cancel all pending work and refuse new timers.
    ///
    /// When this returns no callback is running and none will start. Durable
    /// records are kept so the next process can restore them.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = self.inner.tasks.lock().await;
        let pending = tasks.len();
        tasks.shutdown().await;
        drop(tasks);

        self.inner.entries.clear();
        info!(tasks = pending, "Timer service stopped");
        Ok(())
    }

    async fn arm_once(
        &self,
        id: String,
        record: Option<TimerRecord>,
        scheduled_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        callback: TimerFuture,
    ) -> Result<String> {
        self.ensure_running()?;
        self.save_record(record.as_ref()).await?;

        let description = match &record {
            Some(r) => format!("{} for {}", r.callback_type, r.participant_id),
            None => "one-shot".to_string(),
        };
        self.inner.entries.insert(
            id.clone(),
            TimerEntry {
                kind: TimerKind::Once,
                description,
                scheduled_at,
                next_fire: Some(deadline),
                pattern: None,
                record,
                running: false,
                abort: None,
            },
        );

        let inner = self.inner.clone();
        let task_id = id.clone();
        let delay = until(deadline);
        self.spawn(&id, async move {
            tokio::time::sleep(delay).await;
            if !inner.claim(&task_id) {
                return;
            }
            debug!(timer_id = %task_id, "Timer fired");
            callback.await;
            if let Some((_, entry)) = inner.entries.remove(&task_id)
                && entry.record.is_some()
            {
                inner.forget_record(&task_id).await;
            }
        })
        .await?;

        debug!(timer_id = %id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        Ok(id)
    }

    async fn arm_recurring(
        &self,
        id: String,
        record: Option<TimerRecord>,
        scheduled_at: DateTime<Utc>,
        pattern: SchedulePattern,
        callback: RecurringCallback,
    ) -> Result<String> {
        self.ensure_running()?;

        // a restored record keeps the occurrence it already drew
        let now = Utc::now();
        let resume = record.as_ref().and_then(|r| r.next_run).filter(|at| *at > now);
        let first = resume.or_else(|| pattern.next_after(now)).ok_or_else(|| {
            EngineError::validation("pattern", format!("'{pattern}' never fires"))
        })?;

        let record = record.map(|mut r| {
            r.timer_kind = TimerKind::Recurring;
            r.pattern = Some(pattern.as_str().to_string());
            r.timezone = Some(pattern.timezone().to_string());
            r.next_run = Some(first);
            r
        });
        self.save_record(record.as_ref()).await?;

        self.inner.entries.insert(
            id.clone(),
            TimerEntry {
                kind: TimerKind::Recurring,
                description: pattern.describe(),
                scheduled_at,
                next_fire: Some(first),
                pattern: Some(pattern.as_str().to_string()),
                record,
                running: false,
                abort: None,
            },
        );

        let text = pattern.as_str().to_string();
        let inner = self.inner.clone();
        let task_id = id.clone();
        self.spawn(&id, async move {
            let mut next = first;
            loop {
                tokio::time::sleep(until(next)).await;
                if !inner.claim(&task_id) {
                    return;
                }
                debug!(timer_id = %task_id, "Recurring timer fired");
                callback().await;

                let following = pattern.next_after_fired(next, Utc::now());
                let record = match inner.entries.get_mut(&task_id) {
                    Some(mut entry) => {
                        entry.running = false;
                        entry.next_fire = following;
                        entry.record.as_mut().map(|r| {
                            r.next_run = following;
                            r.clone()
                        })
                    }
                    None => return,
                };

                let Some(following) = following else {
                    inner.entries.remove(&task_id);
                    inner.forget_record(&task_id).await;
                    return;
                };

                if let (Some(record), Some(persistence)) = (record, &inner.persistence)
                    && let Err(e) = persistence.save_timer(&record).await
                {
                    warn!(timer_id = %task_id, error = %e, "Failed to update recurring timer record");
                }
                next = following;
            }
        })
        .await?;

        debug!(timer_id = %id, pattern = %text, next_fire = %first, "Recurring timer scheduled");
        Ok(id)
    }

    async fn spawn<F>(&self, id: &str, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock().await;
        if self.is_stopped() {
            drop(tasks);
            self.inner.entries.remove(id);
            return Err(EngineError::ShuttingDown);
        }
        while tasks.try_join_next().is_some() {}
        let abort = tasks.spawn(task);
        drop(tasks);

        if let Some(mut entry) = self.inner.entries.get_mut(id) {
            entry.abort = Some(abort);
        }
        Ok(())
    }

    async fn save_record(&self, record: Option<&TimerRecord>) -> Result<()> {
        if let (Some(record), Some(persistence)) = (record, &self.inner.persistence) {
            persistence.save_timer(record).await?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}
