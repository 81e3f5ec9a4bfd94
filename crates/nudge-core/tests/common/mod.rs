// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for nudge-core integration tests.
//!
//! Provides a recording messaging mock, scripted text generators and a
//! TestContext wiring an engine over in-memory storage.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use nudge_core::engine::{Engine, EnrollmentRequest};
use nudge_core::error::{EngineError, Result};
use nudge_core::flow::intervention::{FLOW_ID, InterventionSettings};
use nudge_core::messaging::{MessagingService, TextGenerator};
use nudge_core::persistence::{InMemoryPersistence, Persistence};

pub const PHONE: &str = "+15551234567";
pub const ADDRESS: &str = "15551234567";

/// Messaging transport that records every send.
#[derive(Default)]
pub struct MockMessaging {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
    stopped: AtomicBool,
}

impl MockMessaging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All sends as (address, body).
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Bodies sent to one address.
    pub fn sent_to(&self, address: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == address)
            .map(|(_, body)| body)
            .collect()
    }

    pub fn last_to(&self, address: &str) -> Option<String> {
        self.sent_to(address).pop()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Make subsequent sends fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingService for MockMessaging {
    async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("mock transport down".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Generator that always answers with the same text.
pub struct FixedGenerator(pub &'static str);

#[async_trait]
impl TextGenerator for FixedGenerator {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Generator that always fails.
pub struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Err(EngineError::Generation("model unavailable".to_string()))
    }
}

/// Engine over in-memory storage with a recording transport.
pub struct TestContext {
    pub store: Arc<InMemoryPersistence>,
    pub messaging: Arc<MockMessaging>,
    pub engine: Engine,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryPersistence::new()))
    }

    /// Engine over an existing store, as after a restart.
    pub fn with_store(store: Arc<InMemoryPersistence>) -> Self {
        Self::build(store, None)
    }

    pub fn with_generator(generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(Arc::new(InMemoryPersistence::new()), Some(generator))
    }

    fn build(store: Arc<InMemoryPersistence>, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        let messaging = MockMessaging::new();
        let engine = Engine::new(
            store.clone(),
            messaging.clone(),
            generator,
            InterventionSettings::default(),
        );
        Self {
            store,
            messaging,
            engine,
        }
    }

    pub fn persistence(&self) -> Arc<dyn Persistence> {
        self.store.clone()
    }

    /// Enroll the default participant "p1".
    pub async fn enroll(&self) {
        self.engine
            .enroll(FLOW_ID, "p1", EnrollmentRequest::new(PHONE))
            .await
            .unwrap();
    }

    pub async fn state(&self) -> String {
        self.engine
            .participant_state("p1", FLOW_ID)
            .await
            .unwrap()
            .current_state
    }

    pub async fn data(&self, key: &str) -> Option<String> {
        self.engine
            .participant_state("p1", FLOW_ID)
            .await
            .unwrap()
            .data
            .get(key)
            .cloned()
    }

    pub async fn reply(&self, body: &str) -> bool {
        self.engine
            .process_inbound_response(PHONE, body)
            .await
            .unwrap()
    }

    /// Move "p1" straight to a state with its entry actions.
    pub async fn force_state(&self, state: &str) {
        self.engine
            .advance_state("p1", FLOW_ID, state, "test setup", true)
            .await
            .unwrap();
    }

    /// Stop the daily prompt of "p1" so long sleeps only see flow timeouts.
    pub async fn cancel_daily_prompt(&self) {
        if let Some(reminder) = self.engine.intervention().reminder_timer("p1") {
            self.engine.cancel_timer(&reminder).await.unwrap();
        }
    }

    /// Sleep past the daily prompt of "p1". Requires paused time.
    pub async fn run_until_daily_prompt(&self) {
        let reminder = self
            .engine
            .intervention()
            .reminder_timer("p1")
            .expect("daily prompt armed");
        let info = self.engine.get_timer(&reminder).unwrap();
        let remaining = info.remaining.unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining + Duration::from_secs(1)).await;
        settle().await;
    }
}

/// Let spawned callbacks run to completion.
///
/// With paused time the sleep only advances once every task is idle.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
