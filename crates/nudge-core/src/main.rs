// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nudge Core - standalone engine process
//!
//! Runs the orchestration engine against the configured database with a
//! log-only transport. Messaging adapters embed the library through
//! [`nudge_core::runtime::EngineRuntime`] instead.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use nudge_core::config::Config;
use nudge_core::messaging::LogOnlyMessaging;
use nudge_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use nudge_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nudge_core=info".parse()?),
        )
        .init();

    info!("Starting Nudge Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        default_timezone = %config.default_timezone,
        default_schedule = %config.default_schedule,
        max_connections = config.db_max_connections,
        "Configuration loaded"
    );

    // Connect to database (migrations run on connect)
    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqlitePersistence::connect(&config.database_url, config.db_max_connections).await?)
    } else {
        Arc::new(PostgresPersistence::connect(&config.database_url, config.db_max_connections).await?)
    };

    if !persistence.health_check().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database connection established");

    let runtime = EngineRuntime::builder()
        .persistence(persistence)
        .messaging(Arc::new(LogOnlyMessaging))
        .config(&config)
        .build()?
        .start()
        .await?;

    info!(
        timers = runtime.engine().list_active_timers().len(),
        hooks = runtime.engine().response_handler().hook_count(),
        "Nudge Core initialized successfully"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
