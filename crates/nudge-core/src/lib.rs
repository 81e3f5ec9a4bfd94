// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nudge Core - Durable Flow Orchestration
//!
//! This crate runs multi-day conversational interventions. Each participant
//! moves through a per-flow state machine driven by their replies and by
//! timers; all state, timers and response hooks are persisted so a restart
//! picks every conversation up where it left off.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Host application (HTTP API, SMS adapter)             │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ enroll / advance / reset          │ inbound messages, receipts
//!        ▼                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Engine ─── ResponseHandler (one hook per address) ──► Flow          │
//! │    │                                                  │              │
//! │    ├── RecoveryManager (startup rebuild)              ▼              │
//! │    │                                        FlowExecutor ── StateManager
//! │    └── TimerService ◄── CallbackRegistry ◄──── timeouts              │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ SQLite / PostgreSQL │
//! └─────────────────────┘
//! ```
//!
//! # Durability
//!
//! Closures cannot be stored, so a durable timer is stored as a
//! `callback_type` tag plus string parameters. At startup each flow
//! registers a factory per tag in the [`timer::CallbackRegistry`] and the
//! [`recovery::RecoveryManager`] rebuilds every stored timer under its
//! original id with its remaining delay. Persistent hooks work the same way
//! through [`hooks::HookFactoryRegistry`].
//!
//! # Consistency
//!
//! State changes are compare-and-set on the state a decision was made from.
//! When a timeout and a reply race for the same participant, the loser gets
//! [`error::EngineError::Conflict`] and is dropped without side effects.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `NUDGE_DATABASE_URL` | Yes | - | SQLite or PostgreSQL connection string |
//! | `NUDGE_DB_MAX_CONNECTIONS` | No | `5` | Pool size |
//! | `NUDGE_DEFAULT_TIMEZONE` | No | `UTC` | Timezone for participants enrolled without one |
//! | `NUDGE_DEFAULT_SCHEDULE` | No | `10:00` | Daily prompt pattern |
//! | `NUDGE_INBOUND_BUFFER` | No | `256` | Inbound and receipt channel capacity |

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Engine wiring and the operations exposed to an API layer.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Flow definitions, the shared executor and the intervention flow.
pub mod flow;

/// Response hooks and inbound routing.
pub mod hooks;

/// Messaging and text generation seams.
pub mod messaging;

/// Embedded database migrations.
pub mod migrations;

/// Storage trait and its SQLite, PostgreSQL and in-memory backends.
pub mod persistence;

/// Startup recovery of timers and hooks.
pub mod recovery;

/// Embeddable runtime with ordered startup and shutdown.
pub mod runtime;

/// Calendar patterns for recurring prompts.
pub mod schedule;

/// Participant state reads and writes.
pub mod state_manager;

/// Timer service and callback registry.
pub mod timer;

pub use engine::{Engine, EnrollmentRequest, ParticipantState};
pub use error::{EngineError, Result};
pub use runtime::EngineRuntime;
