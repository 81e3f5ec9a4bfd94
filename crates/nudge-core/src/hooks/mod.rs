// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Response routing: one active hook per participant address.
//!
//! A hook is the handler that receives a participant's inbound messages.
//! Ephemeral hooks live only in memory. Persistent hooks also write a
//! [`HookRecord`] so [`ResponseHandler::recover_persistent_hooks`] can rebuild
//! them through the [`HookFactoryRegistry`] after a restart.
//!
//! Registering a hook for an address that already has one replaces it.

mod registry;

pub use registry::{HookFactory, HookFactoryRegistry};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::messaging::{InboundMessage, MessagingService};
use crate::persistence::{HookRecord, ParticipantStatus, Persistence, ResponseRecord};
use crate::timer::TimerService;

/// Handler invoked for inbound messages from one address.
#[async_trait]
pub trait ResponseAction: Send + Sync {
    /// Handle a message. `message.from` is already canonical.
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

struct HookEntry {
    action: Arc<dyn ResponseAction>,
    generation: u64,
    hook_type: Option<String>,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
    cleanup_timer: Option<String>,
}

impl HookEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct HandlerInner {
    hooks: DashMap<String, HookEntry>,
    persistence: Arc<dyn Persistence>,
    messaging: Arc<dyn MessagingService>,
    timers: TimerService,
    factories: Arc<HookFactoryRegistry>,
    generation: AtomicU64,
}

impl HandlerInner {
    /// TTL expiry. A hook re-registered since the timer was armed is kept.
    async fn expire(&self, address: &str, generation: u64) {
        let Some((_, entry)) = self
            .hooks
            .remove_if(address, |_, entry| entry.generation == generation)
        else {
            return;
        };

        if entry.hook_type.is_some()
            && let Err(e) = self.persistence.delete_hook(address).await
        {
            warn!(address, error = %e, "Failed to delete expired hook record");
        }
        info!(address, "Hook expired");
    }
}

/// Routes inbound messages to the hook registered for the sender.
#[derive(Clone)]
pub struct ResponseHandler {
    inner: Arc<HandlerInner>,
}

impl ResponseHandler {
    /// Create a handler. `factories` must be complete before recovery runs.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        messaging: Arc<dyn MessagingService>,
        timers: TimerService,
        factories: Arc<HookFactoryRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                hooks: DashMap::new(),
                persistence,
                messaging,
                timers,
                factories,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register an in-memory hook, replacing any hook for the address.
    pub async fn register_hook(&self, address: &str, action: Arc<dyn ResponseAction>) -> Result<()> {
        let address = self.canonical(address)?;
        let previous = self.insert(&address, action, None);

        if let Some(previous) = previous {
            self.retire(&address, previous, true).await?;
        }
        debug!(%address, "Hook registered");
        Ok(())
    }

    /// Register a hook that survives restarts.
    ///
    /// The action is built from `hook_type` and `params` right away, so an
    /// unknown type fails here instead of at recovery.
    pub async fn register_persistent_hook(
        &self,
        address: &str,
        hook_type: &str,
        params: HashMap<String, String>,
    ) -> Result<()> {
        let address = self.canonical(address)?;
        let action = self.inner.factories.build(hook_type, &params)?;

        self.inner
            .persistence
            .save_hook(&HookRecord {
                address: address.clone(),
                hook_type: hook_type.to_string(),
                params,
                created_at: Utc::now(),
            })
            .await?;

        if let Some(previous) = self.insert(&address, action, Some(hook_type.to_string())) {
            self.retire(&address, previous, false).await?;
        }
        debug!(%address, hook_type, "Persistent hook registered");
        Ok(())
    }

    /// Drop the in-memory hook for an address. Returns whether one existed.
    pub async fn unregister_hook(&self, address: &str) -> Result<bool> {
        let address = self.canonical(address)?;
        self.remove(&address, false).await
    }

    /// Drop the hook for an address together with its stored record.
    pub async fn unregister_persistent_hook(&self, address: &str) -> Result<bool> {
        let address = self.canonical(address)?;
        self.remove(&address, true).await
    }

    /// Route an inbound message.
    ///
    /// The message is recorded first. Returns `false` when no hook exists for
    /// the sender; that is a normal outcome, not an error.
    #[instrument(skip(self, message), fields(from = %message.from))]
    pub async fn process_response(&self, message: &InboundMessage) -> Result<bool> {
        let address = self.canonical(&message.from)?;
        let hook = self
            .inner
            .hooks
            .get(&address)
            .filter(|entry| !entry.is_expired(Utc::now()))
            .map(|entry| (entry.action.clone(), entry.ttl));

        self.inner
            .persistence
            .record_response(&ResponseRecord {
                address: address.clone(),
                body: message.body.clone(),
                received_at: message.received_at,
                routed: hook.is_some(),
            })
            .await?;

        let Some((action, ttl)) = hook else {
            debug!(%address, "No active hook, message recorded only");
            return Ok(false);
        };

        if let Some(ttl) = ttl {
            self.set_auto_cleanup_timeout(&address, ttl).await?;
        }

        let routed = InboundMessage {
            from: address,
            ..message.clone()
        };
        action.handle(&routed).await?;
        Ok(true)
    }

    /// Remove the hook after `ttl` without traffic. Each routed message
    /// restarts the countdown.
    pub async fn set_auto_cleanup_timeout(&self, address: &str, ttl: Duration) -> Result<()> {
        let address = self.canonical(address)?;
        let generation = self
            .inner
            .hooks
            .get(&address)
            .map(|entry| entry.generation)
            .ok_or_else(|| EngineError::not_found("hook", address.clone()))?;

        let weak: Weak<HandlerInner> = Arc::downgrade(&self.inner);
        let target = address.clone();
        let timer_id = self
            .inner
            .timers
            .schedule_after(ttl, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&target, generation).await;
                }
            })
            .await?;

        let swapped = {
            match self.inner.hooks.get_mut(&address) {
                Some(mut entry) if entry.generation == generation => {
                    entry.ttl = Some(ttl);
                    entry.expires_at = Some(Utc::now() + ttl);
                    Some(entry.cleanup_timer.replace(timer_id.clone()))
                }
                _ => None,
            }
        };

        match swapped {
            Some(Some(previous)) => self.inner.timers.cancel(&previous).await,
            Some(None) => Ok(()),
            // replaced or removed while arming
            None => self.inner.timers.cancel(&timer_id).await,
        }
    }

    /// Rebuild persistent hooks from storage. Returns how many were restored.
    ///
    /// Records whose type is unknown or whose factory fails are skipped and
    /// left for [`cleanup_stale_hooks`](Self::cleanup_stale_hooks).
    pub async fn recover_persistent_hooks(&self) -> Result<usize> {
        let records = self.inner.persistence.list_hooks().await?;
        let mut recovered = 0;

        for record in records {
            if self.inner.hooks.contains_key(&record.address) {
                continue;
            }
            match self.inner.factories.build(&record.hook_type, &record.params) {
                Ok(action) => {
                    self.insert(&record.address, action, Some(record.hook_type.clone()));
                    recovered += 1;
                }
                Err(e) => {
                    warn!(
                        address = %record.address,
                        hook_type = %record.hook_type,
                        error = %e,
                        "Skipping unrecoverable hook"
                    );
                }
            }
        }

        info!(recovered, "Persistent hooks recovered");
        Ok(recovered)
    }

    /// Remove every hook, live or stored, whose address has no active or
    /// paused participant in any of `flow_ids`. Returns the number of
    /// addresses removed.
    pub async fn validate_and_cleanup_hooks(&self, flow_ids: &[String]) -> Result<usize> {
        let mut active = HashSet::new();
        for flow_id in flow_ids {
            for participant in self.inner.persistence.list_participants(flow_id).await? {
                if matches!(
                    participant.status(),
                    ParticipantStatus::Active | ParticipantStatus::Paused
                ) {
                    active.insert(participant.address);
                }
            }
        }

        let mut removed: HashSet<String> = HashSet::new();

        let live: Vec<String> = self
            .inner
            .hooks
            .iter()
            .filter(|entry| !active.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for address in live {
            self.remove(&address, true).await?;
            removed.insert(address);
        }

        for record in self.inner.persistence.list_hooks().await? {
            if !active.contains(&record.address) {
                self.inner.persistence.delete_hook(&record.address).await?;
                removed.insert(record.address);
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Removed hooks without an enrolled participant");
        }
        Ok(removed.len())
    }

    /// Remove expired hooks and stored hooks that can no longer be rebuilt.
    pub async fn cleanup_stale_hooks(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .inner
            .hooks
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for address in expired {
            if self.remove(&address, true).await? {
                removed += 1;
            }
        }

        for record in self.inner.persistence.list_hooks().await? {
            if self.inner.hooks.contains_key(&record.address) {
                continue;
            }
            if let Err(e) = self.inner.factories.build(&record.hook_type, &record.params) {
                debug!(address = %record.address, error = %e, "Deleting stale hook record");
                self.inner.persistence.delete_hook(&record.address).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Stale hooks cleaned up");
        }
        Ok(removed)
    }

    /// Number of live hooks.
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.len()
    }

    /// Whether a live hook exists for the address.
    pub fn is_registered(&self, address: &str) -> bool {
        self.canonical(address)
            .map(|address| self.inner.hooks.contains_key(&address))
            .unwrap_or(false)
    }

    fn canonical(&self, address: &str) -> Result<String> {
        self.inner.messaging.canonicalize_recipient(address)
    }

    fn insert(
        &self,
        address: &str,
        action: Arc<dyn ResponseAction>,
        hook_type: Option<String>,
    ) -> Option<HookEntry> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.hooks.insert(
            address.to_string(),
            HookEntry {
                action,
                generation,
                hook_type,
                ttl: None,
                expires_at: None,
                cleanup_timer: None,
            },
        )
    }

    /// Tear down a replaced entry. `drop_record` is set when the replacement
    /// did not write a record of its own.
    async fn retire(&self, address: &str, previous: HookEntry, drop_record: bool) -> Result<()> {
        if let Some(timer_id) = &previous.cleanup_timer {
            self.inner.timers.cancel(timer_id).await?;
        }
        if previous.hook_type.is_some() && drop_record {
            self.inner.persistence.delete_hook(address).await?;
        }
        Ok(())
    }

    async fn remove(&self, address: &str, delete_record: bool) -> Result<bool> {
        let removed = self.inner.hooks.remove(address);
        if let Some((_, entry)) = &removed
            && let Some(timer_id) = &entry.cleanup_timer
        {
            self.inner.timers.cancel(timer_id).await?;
        }
        if delete_record {
            self.inner.persistence.delete_hook(address).await?;
        }
        if removed.is_some() {
            debug!(address, "Hook removed");
        }
        Ok(removed.is_some())
    }
}
