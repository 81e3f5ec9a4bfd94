// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for nudge-core.
//!
//! [`EngineRuntime`] runs the engine inside an existing tokio application:
//! it performs startup recovery, then forwards inbound messages and delivery
//! receipts from channels fed by the host's messaging adapter.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nudge_core::messaging::{InboundMessage, LogOnlyMessaging};
//! use nudge_core::persistence::SqlitePersistence;
//! use nudge_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/nudge.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .messaging(Arc::new(LogOnlyMessaging))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime
//!         .inbound_sender()
//!         .send(InboundMessage::new("+15551234567", "ready"))
//!         .await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::flow::intervention::InterventionSettings;
use crate::messaging::{DeliveryReceipt, InboundMessage, MessagingService, TextGenerator};
use crate::persistence::Persistence;
use crate::recovery::RecoveryReport;

const DEFAULT_BUFFER: usize = 256;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    messaging: Option<Arc<dyn MessagingService>>,
    generator: Option<Arc<dyn TextGenerator>>,
    settings: InterventionSettings,
    inbound_buffer: usize,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("messaging", &self.messaging.as_ref().map(|_| "..."))
            .field("generator", &self.generator.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("inbound_buffer", &self.inbound_buffer)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            messaging: None,
            generator: None,
            settings: InterventionSettings::default(),
            inbound_buffer: DEFAULT_BUFFER,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the outbound transport (required).
    pub fn messaging(mut self, messaging: Arc<dyn MessagingService>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    /// Personalise intervention text with a generator.
    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Override flow timeouts and scheduling defaults.
    pub fn settings(mut self, settings: InterventionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Take scheduling defaults and channel capacity from configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.settings = InterventionSettings::from_config(config);
        self.inbound_buffer = config.inbound_buffer;
        self
    }

    /// Capacity of the inbound message and receipt channels.
    ///
    /// Default: 256
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| EngineError::validation("persistence", "is required"))?;
        let messaging = self
            .messaging
            .ok_or_else(|| EngineError::validation("messaging", "is required"))?;
        if self.inbound_buffer == 0 {
            return Err(EngineError::validation("inbound_buffer", "must be positive"));
        }

        Ok(EngineRuntimeConfig {
            persistence,
            messaging,
            generator: self.generator,
            settings: self.settings,
            inbound_buffer: self.inbound_buffer,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    messaging: Arc<dyn MessagingService>,
    generator: Option<Arc<dyn TextGenerator>>,
    settings: InterventionSettings,
    inbound_buffer: usize,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("messaging", &"...")
            .field("settings", &self.settings)
            .field("inbound_buffer", &self.inbound_buffer)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Build the engine, run startup recovery and spawn the forwarders.
    ///
    /// Recovery failures are logged and kept in
    /// [`recovery_report`](EngineRuntime::recovery_report); they do not stop
    /// the runtime from starting.
    pub async fn start(self) -> Result<EngineRuntime> {
        let engine = Arc::new(Engine::new(
            self.persistence,
            self.messaging,
            self.generator,
            self.settings,
        ));

        let report = engine.recover().await;
        if !report.is_clean() {
            warn!(summary = %report.summary(), "Starting with incomplete recovery");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_buffer);
        let (receipt_tx, receipt_rx) = mpsc::channel(self.inbound_buffer);

        let forwarders = vec![
            tokio::spawn(forward_inbound(engine.clone(), inbound_rx, shutdown_rx.clone())),
            tokio::spawn(forward_receipts(engine.clone(), receipt_rx, shutdown_rx)),
        ];

        info!(flows = ?engine.flow_ids(), "EngineRuntime started");

        Ok(EngineRuntime {
            engine,
            inbound_tx,
            receipt_tx,
            shutdown_tx,
            forwarders,
            report,
        })
    }
}

/// A running engine embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: Arc<Engine>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    receipt_tx: mpsc::Sender<DeliveryReceipt>,
    shutdown_tx: watch::Sender<bool>,
    forwarders: Vec<JoinHandle<()>>,
    report: RecoveryReport,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The engine, for direct API calls.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Sender for inbound participant messages.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Sender for delivery receipts.
    pub fn receipt_sender(&self) -> mpsc::Sender<DeliveryReceipt> {
        self.receipt_tx.clone()
    }

    /// Outcome of startup recovery.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Check if the forwarders are still running.
    pub fn is_running(&self) -> bool {
        self.forwarders.iter().all(|handle| !handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops intake first, then the timer service, then closes storage and
    /// finally the transport. Every stage runs even if an earlier one failed.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        let mut failures = Vec::new();

        // Signal shutdown
        let _ = self.shutdown_tx.send(true);
        drop(self.inbound_tx);
        drop(self.receipt_tx);

        for handle in self.forwarders {
            if let Err(e) = handle.await {
                error!("Forwarder task panicked: {}", e);
                failures.push(format!("forwarder: {e}"));
            }
        }

        if let Err(e) = self.engine.timers().stop().await {
            failures.push(format!("timers: {e}"));
        }
        if let Err(e) = self.engine.persistence().close().await {
            failures.push(format!("persistence: {e}"));
        }
        if let Err(e) = self.engine.messaging().stop().await {
            failures.push(format!("messaging: {e}"));
        }

        if failures.is_empty() {
            info!("EngineRuntime shutdown complete");
            Ok(())
        } else {
            error!(failed = failures.len(), "EngineRuntime shutdown incomplete");
            Err(EngineError::Shutdown { failures })
        }
    }
}

/// Route inbound messages, one task per message.
async fn forward_inbound(
    engine: Arc<Engine>,
    mut rx: mpsc::Receiver<InboundMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                let engine = engine.clone();
                in_flight.spawn(async move {
                    match engine.process_inbound(&message).await {
                        Ok(routed) => debug!(from = %message.from, routed, "Inbound message processed"),
                        Err(e) => warn!(from = %message.from, error = %e, "Inbound message failed"),
                    }
                });
            }
        }

        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                error!("Inbound handler panicked: {}", e);
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    info!("Inbound forwarder stopped");
}

/// Store delivery receipts in arrival order.
async fn forward_receipts(
    engine: Arc<Engine>,
    mut rx: mpsc::Receiver<DeliveryReceipt>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            receipt = rx.recv() => {
                let Some(receipt) = receipt else {
                    break;
                };
                if let Err(e) = engine.record_receipt(&receipt).await {
                    warn!(to = %receipt.to, status = %receipt.status, error = %e, "Receipt not recorded");
                }
            }
        }
    }
    info!("Receipt forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::LogOnlyMessaging;
    use crate::persistence::InMemoryPersistence;

    #[test]
    fn test_builder_requires_persistence() {
        let result = EngineRuntime::builder()
            .messaging(Arc::new(LogOnlyMessaging))
            .build();
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn test_builder_requires_messaging() {
        let result = EngineRuntime::builder()
            .persistence(Arc::new(InMemoryPersistence::new()))
            .build();
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_buffer() {
        let result = EngineRuntime::builder()
            .persistence(Arc::new(InMemoryPersistence::new()))
            .messaging(Arc::new(LogOnlyMessaging))
            .inbound_buffer(0)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = EngineRuntime::builder()
            .persistence(Arc::new(InMemoryPersistence::new()))
            .messaging(Arc::new(LogOnlyMessaging))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(runtime.recovery_report().is_clean());

        let engine = runtime.engine().clone();
        runtime.shutdown().await.unwrap();
        assert!(engine.timers().is_stopped());
    }

    #[tokio::test]
    async fn test_receipts_are_recorded() {
        let store = Arc::new(InMemoryPersistence::new());
        let runtime = EngineRuntime::builder()
            .persistence(store.clone())
            .messaging(Arc::new(LogOnlyMessaging))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        runtime
            .receipt_sender()
            .send(DeliveryReceipt {
                to: "15551234567".into(),
                status: "delivered".into(),
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        // receipts are written in order, so wait until the forwarder drained
        for _ in 0..50 {
            if !store.receipts().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.receipts().await.len(), 1);
        assert_eq!(store.receipts().await[0].status, "delivered");

        runtime.shutdown().await.unwrap();
    }
}
