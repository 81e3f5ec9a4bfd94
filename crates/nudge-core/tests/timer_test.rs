// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable timers across service instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;

use nudge_core::error::EngineError;
use nudge_core::persistence::{InMemoryPersistence, Persistence, TimerKind, TimerRecord};
use nudge_core::schedule::SchedulePattern;
use nudge_core::timer::{
    CallbackRegistry, DurableTimer, RecurringCallback, TimerFuture, TimerService, required_param,
};

/// Registry with a "count" callback that bumps a counter per firing and
/// records the `label` parameter it was rebuilt with.
fn counting_registry() -> (Arc<CallbackRegistry>, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let labels = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = CallbackRegistry::new();
    {
        let fired = fired.clone();
        let labels = labels.clone();
        registry.register("count", move |params: &HashMap<String, String>| {
            let label = required_param(params, "label")?.to_string();
            let fired = fired.clone();
            let labels = labels.clone();
            Ok(Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
                labels.lock().unwrap().push(label);
            }) as TimerFuture)
        });
    }
    (Arc::new(registry), fired, labels)
}

fn durable(label: &str) -> DurableTimer {
    DurableTimer::new("p1", "intervention", "count").param("label", label)
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_survives_service_restart() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, fired, labels) = counting_registry();

    let first = TimerService::with_persistence(store.clone());
    let id = first
        .schedule_after_durable(Duration::from_secs(600), durable("feeling"), async {})
        .await
        .unwrap();
    first.stop().await.unwrap();
    assert!(store.get_timer(&id).await.unwrap().is_some());

    let second = TimerService::with_persistence(store.clone());
    let record = store.get_timer(&id).await.unwrap().unwrap();
    let restored = second.restore(&record, &registry).await.unwrap();
    assert_eq!(restored, id);

    let remaining = second.get_timer(&id).unwrap().remaining.unwrap();
    assert!(remaining <= Duration::from_secs(600));

    tokio::time::sleep(Duration::from_secs(601)).await;
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(labels.lock().unwrap().as_slice(), ["feeling".to_string()]);
    assert!(second.get_timer(&id).is_err());
    assert!(store.get_timer(&id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_restore_twice_arms_once() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, fired, _) = counting_registry();

    let first = TimerService::with_persistence(store.clone());
    let id = first
        .schedule_after_durable(Duration::from_secs(30), durable("once"), async {})
        .await
        .unwrap();
    first.stop().await.unwrap();

    let second = TimerService::with_persistence(store.clone());
    let record = store.get_timer(&id).await.unwrap().unwrap();
    second.restore(&record, &registry).await.unwrap();
    second.restore(&record, &registry).await.unwrap();
    assert_eq!(second.list_active().len(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recurring_timer_restores_with_pattern() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, fired, _) = counting_registry();
    let pattern = SchedulePattern::parse("* * * * *", Tz::UTC).unwrap();

    let first = TimerService::with_persistence(store.clone());
    let noop: RecurringCallback = Arc::new(|| Box::pin(async {}) as TimerFuture);
    let id = first
        .schedule_with_pattern_durable(&pattern, durable("tick"), noop)
        .await
        .unwrap();
    first.stop().await.unwrap();

    let record = store.get_timer(&id).await.unwrap().unwrap();
    assert_eq!(record.timer_kind, TimerKind::Recurring);
    assert_eq!(record.pattern.as_deref(), Some("* * * * *"));
    assert_eq!(record.timezone.as_deref(), Some("UTC"));
    assert!(record.next_run.is_some());

    let second = TimerService::with_persistence(store.clone());
    assert_eq!(second.restore(&record, &registry).await.unwrap(), id);

    tokio::time::sleep(Duration::from_secs(185)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fired.load(Ordering::SeqCst) >= 2);

    // recurring timers stay listed and stored between firings
    assert_eq!(second.get_timer(&id).unwrap().kind, TimerKind::Recurring);
    assert!(store.get_timer(&id).await.unwrap().is_some());

    second.cancel(&id).await.unwrap();
    assert!(store.get_timer(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recurring_restore_keeps_drawn_occurrence() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, _, _) = counting_registry();
    let now = Utc::now();
    let drawn = now + chrono::Duration::hours(5);

    store
        .save_timer(&TimerRecord {
            id: "daily-window".to_string(),
            participant_id: "p1".to_string(),
            flow_id: "intervention".to_string(),
            state_type: None,
            data_key: None,
            timer_kind: TimerKind::Recurring,
            callback_type: "count".to_string(),
            callback_params: HashMap::from([("label".to_string(), "window".to_string())]),
            scheduled_at: now - chrono::Duration::days(1),
            expires_at: None,
            original_delay_ms: None,
            pattern: Some("00:00-23:59".to_string()),
            timezone: Some("UTC".to_string()),
            next_run: Some(drawn),
        })
        .await
        .unwrap();

    let timers = TimerService::with_persistence(store.clone());
    let record = store.get_timer("daily-window").await.unwrap().unwrap();
    timers.restore(&record, &registry).await.unwrap();

    let info = timers.get_timer("daily-window").unwrap();
    assert_eq!(info.next_fire, Some(drawn));
    timers.stop().await.unwrap();
}

#[tokio::test]
async fn test_restore_unknown_callback_type() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, _, _) = counting_registry();

    let first = TimerService::with_persistence(store.clone());
    let id = first
        .schedule_after_durable(
            Duration::from_secs(60),
            DurableTimer::new("p1", "intervention", "retired"),
            async {},
        )
        .await
        .unwrap();
    first.stop().await.unwrap();

    let second = TimerService::with_persistence(store.clone());
    let record = store.get_timer(&id).await.unwrap().unwrap();
    let err = second.restore(&record, &registry).await.unwrap_err();

    assert!(matches!(err, EngineError::NotFound { .. }));
    assert_eq!(err.error_code(), "NOT_FOUND");
    assert!(second.list_active().is_empty());
}

#[tokio::test]
async fn test_restore_missing_parameter_fails() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, _, _) = counting_registry();

    let first = TimerService::with_persistence(store.clone());
    let id = first
        .schedule_after_durable(
            Duration::from_secs(60),
            DurableTimer::new("p1", "intervention", "count"),
            async {},
        )
        .await
        .unwrap();
    first.stop().await.unwrap();

    let second = TimerService::with_persistence(store.clone());
    let record = store.get_timer(&id).await.unwrap().unwrap();
    let err = second.restore(&record, &registry).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_stopped_service_rejects_restore() {
    let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let (registry, _, _) = counting_registry();

    let timers = TimerService::with_persistence(store.clone());
    let id = timers
        .schedule_after_durable(Duration::from_secs(60), durable("late"), async {})
        .await
        .unwrap();
    let record = store.get_timer(&id).await.unwrap().unwrap();
    timers.stop().await.unwrap();

    let err = timers.restore(&record, &registry).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown));
}
