// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messaging and text-generation seams.
//!
//! The engine never talks to a concrete transport. It sends through a
//! [`MessagingService`] and receives [`InboundMessage`]s and
//! [`DeliveryReceipt`]s over channels fed by the embedding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};

/// A message received from a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Sender address as reported by the transport.
    pub from: String,
    /// Message text.
    pub body: String,
    /// When the transport received the message.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Message received now.
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }
}

/// Delivery status update for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Recipient address.
    pub to: String,
    /// Transport status (sent, delivered, read, failed, ...).
    pub status: String,
    /// When the status was reported.
    pub timestamp: DateTime<Utc>,
}

/// Outbound transport.
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Send a text message to a canonical address.
    async fn send_message(&self, to: &str, body: &str) -> Result<()>;

    /// Validate an address and return its canonical form.
    ///
    /// The default accepts E.164-style phone numbers.
    fn canonicalize_recipient(&self, address: &str) -> Result<String> {
        canonicalize_phone(address)
    }

    /// Release transport resources. Called last during shutdown.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Optional generator used to personalise outbound text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce a message body from a system and a user prompt.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Canonical phone form: digits only, country code included, no `+`.
///
/// `"+1 (555) 123-4567"` becomes `"15551234567"`.
pub fn canonicalize_phone(address: &str) -> Result<String> {
    let digits: String = address.chars().filter(char::is_ascii_digit).collect();
    let stray = address
        .chars()
        .any(|c| !(c.is_ascii_digit() || c.is_whitespace() || "+-().".contains(c)));

    if stray || !(8..=15).contains(&digits.len()) {
        return Err(EngineError::validation(
            "address",
            format!("'{address}' is not a valid phone number"),
        ));
    }
    Ok(digits)
}

/// Transport that only logs. Used by the standalone binary, where messages
/// are delivered by an external adapter.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyMessaging;

#[async_trait]
impl MessagingService for LogOnlyMessaging {
    async fn send_message(&self, to: &str, body: &str) -> Result<()> {
        info!(to, chars = body.chars().count(), "Outbound message");
        Ok(())
    }
}
