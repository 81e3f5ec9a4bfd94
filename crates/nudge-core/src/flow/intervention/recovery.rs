// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::flow::executor::TransitionPlan;
use crate::persistence::ParticipantRecord;
use crate::recovery::{HandlerRecoveryInfo, ParticipantRecoverable, RecoveryRegistry};

use super::{FLOW_ID, HOOK_TYPE, InterventionFlow, InterventionState, TimerSlot};

/// Per-participant repair of the intervention flow after a restart.
///
/// Stored timers are re-armed by the persisted timer recoverable first. This
/// fixes up state rows, re-arms a shorter timeout for a question whose timer
/// was lost, and re-registers the participant's response hook.
pub struct InterventionRecovery {
    flow: Arc<InterventionFlow>,
}

impl InterventionRecovery {
    /// Recoverable for `flow`.
    pub fn new(flow: Arc<InterventionFlow>) -> Self {
        Self { flow }
    }

    async fn repair_state(&self, participant_id: &str) -> Result<()> {
        let state = &self.flow.state;
        match state.get_current_state(participant_id, FLOW_ID).await? {
            None => {
                warn!(participant_id, "No stored state, resetting to orientation");
                state
                    .set_current_state(participant_id, FLOW_ID, InterventionState::Orientation.as_str())
                    .await
            }
            Some(current) if InterventionState::from_str(&current).is_err() => {
                warn!(participant_id, state = %current, "Unknown stored state, moving to end of day");
                state
                    .set_current_state(participant_id, FLOW_ID, InterventionState::EndOfDay.as_str())
                    .await
            }
            Some(_) => Ok(()),
        }
    }

    /// Clear timer slots whose timer no longer exists.
    async fn clear_dangling_slots(&self, participant_id: &str) -> Result<()> {
        let data = self.flow.state.get_all_state_data(participant_id, FLOW_ID).await?;
        for slot in TimerSlot::iter() {
            let Some(timer_id) = data.get(slot.key()) else {
                continue;
            };
            if self.flow.timers.get_timer(timer_id).is_err() {
                debug!(participant_id, slot = slot.key(), %timer_id, "Clearing dangling timer slot");
                self.flow
                    .state
                    .clear_state_data(participant_id, FLOW_ID, slot.key())
                    .await?;
            }
        }
        Ok(())
    }

    /// Arm the current question's timeout when no live timer holds its slot.
    async fn rearm_lost_timeouts(&self, participant: &ParticipantRecord) -> Result<()> {
        let participant_id = participant.participant_id.as_str();
        let current = self.flow.current(participant_id).await?;
        let data = self.flow.state.get_all_state_data(participant_id, FLOW_ID).await?;

        let mut plan = TransitionPlan::stay(current.as_str());
        let mut armed = 0;
        for slot in TimerSlot::iter().filter(|slot| slot.owns(current)) {
            if data.contains_key(slot.key()) {
                continue;
            }
            let delay = self.flow.settings.recovery_timeout(slot);
            info!(
                participant_id,
                state = %current,
                slot = slot.key(),
                delay_secs = delay.as_secs(),
                "Re-arming lost timeout"
            );
            plan = plan.timeout(self.flow.planned_timeout_after(participant_id, slot, delay));
            armed += 1;
        }

        if armed > 0 {
            self.flow.run(participant, plan).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantRecoverable for InterventionRecovery {
    fn name(&self) -> &str {
        "intervention_participants"
    }

    fn flow_id(&self) -> &str {
        FLOW_ID
    }

    async fn recover_participant(
        &self,
        participant_id: &str,
        record: &ParticipantRecord,
        registry: &RecoveryRegistry,
    ) -> Result<()> {
        self.repair_state(participant_id).await?;
        self.clear_dangling_slots(participant_id).await?;
        self.rearm_lost_timeouts(record).await?;

        registry
            .recover_response_handler(HandlerRecoveryInfo {
                address: record.address.clone(),
                hook_type: HOOK_TYPE.to_string(),
                params: HashMap::from([
                    ("participant_id".to_string(), participant_id.to_string()),
                    ("flow_id".to_string(), FLOW_ID.to_string()),
                ]),
            })
            .await
    }
}
