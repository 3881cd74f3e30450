use serde::{Deserialize, Serialize};

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::JourneyStatus;

/// Describes a single valid status transition for a lead journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JourneyStatus,
    pub to: JourneyStatus,
    pub trigger: String,
}

/// Guards the lead-journey lifecycle by enforcing a finite set of valid
/// status transitions. Terminal statuses only leave through an operator retry.
#[derive(Debug, Clone)]
pub struct JourneyStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl JourneyStateMachine {
    pub fn new() -> Self {
        use JourneyStatus::*;

        let table: [(JourneyStatus, JourneyStatus, &str); 12] = [
            // InProgress ->
            (InProgress, Awaiting, "condition_unresolved"),
            (InProgress, Paused, "campaign_paused"),
            (InProgress, Completed, "end_reached"),
            (InProgress, Failed, "action_failed"),
            (InProgress, Blacklisted, "lead_blacklisted"),
            // Awaiting ->
            (Awaiting, InProgress, "condition_resolved"),
            (Awaiting, Failed, "condition_timed_out"),
            (Awaiting, Blacklisted, "lead_blacklisted"),
            // Paused ->
            (Paused, InProgress, "campaign_resumed"),
            (Paused, Failed, "campaign_stopped"),
            (Paused, Blacklisted, "lead_blacklisted"),
            // Failed ->
            (Failed, InProgress, "operator_retry"),
        ];

        let transitions = table
            .iter()
            .map(|(from, to, trigger)| StateTransition {
                from: *from,
                to: *to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed. Staying put is always allowed.
    pub fn can_transition(&self, from: JourneyStatus, to: JourneyStatus) -> bool {
        from == to || self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Checks a transition and returns the trigger that names it.
    pub fn check(&self, from: JourneyStatus, to: JourneyStatus) -> CampaignResult<&str> {
        if from == to {
            return Ok("unchanged");
        }
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger.as_str())
            .ok_or_else(|| CampaignError::invalid_transition("journey", from, to))
    }
}

impl Default for JourneyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
