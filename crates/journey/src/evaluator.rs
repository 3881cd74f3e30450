use tracing::debug;

use campaign_core::sequence::ConditionKind;
use campaign_core::types::{ActionType, JourneyMetrics, LeadEvent};

/// Maps journey metrics onto condition branches and folds channel outcomes
/// into those metrics.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// `true` takes the `yes` branch.
    pub fn evaluate(&self, kind: ConditionKind, metrics: &JourneyMetrics) -> bool {
        let outcome = match kind {
            ConditionKind::InviteAccepted => metrics.invite_accepted,
            ConditionKind::MessageRead => metrics.message_read,
            ConditionKind::ProfileOpen => metrics.profile_opened,
        };
        debug!(?kind, outcome, "Evaluated condition");
        outcome
    }

    /// Records a successfully executed action.
    pub fn record_completion(&self, metrics: &mut JourneyMetrics, action_type: ActionType) {
        match action_type {
            ActionType::SendInvite => metrics.invite_sent = true,
            ActionType::SendMessage => metrics.messages_sent += 1,
            ActionType::ViewProfile => metrics.profile_viewed = true,
            ActionType::EndorseSkills
            | ActionType::Follow
            | ActionType::LikePost
            | ActionType::FindEmail
            | ActionType::SendEmail => {}
        }
    }

    /// Records an asynchronously reported lead event. Returns whether any
    /// metric changed, i.e. whether an awaiting condition is worth re-checking.
    pub fn record_event(&self, metrics: &mut JourneyMetrics, event: LeadEvent) -> bool {
        let before = metrics.clone();
        match event {
            LeadEvent::InviteAccepted => metrics.invite_accepted = true,
            LeadEvent::MessageRead => metrics.message_read = true,
            LeadEvent::ProfileOpened => metrics.profile_opened = true,
            LeadEvent::MessageReplied => {
                metrics.messages_replied += 1;
                // A reply implies the message was read.
                metrics.message_read = true;
            }
        }
        *metrics != before
    }
}
