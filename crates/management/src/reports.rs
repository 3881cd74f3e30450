//! Campaign reporting: action buckets and per-type delivery stats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::store::OutreachStore;
use campaign_core::types::{
    Action, ActionStatus, ActionType, CampaignAnalytics, CampaignStatus, JourneyStatus,
};

/// A campaign's actions, grouped the way the operator console shows them.
/// `pending` holds everything not yet settled: pending, in flight and parked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignActions {
    pub completed: Vec<Action>,
    pub pending: Vec<Action>,
    pub failed: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTypeStats {
    pub action_type: ActionType,
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneyBreakdown {
    pub in_progress: u64,
    pub awaiting: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub blacklisted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignActionStats {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub paused: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub by_type: Vec<ActionTypeStats>,
    pub journeys: JourneyBreakdown,
    pub analytics: CampaignAnalytics,
    /// Set when any action failed; failed actions keep their raw channel error.
    pub warning: Option<String>,
}

pub fn campaign_actions(store: &dyn OutreachStore, campaign_id: Uuid) -> CampaignResult<CampaignActions> {
    if store.get_campaign(campaign_id).is_none() {
        return Err(CampaignError::not_found("campaign", campaign_id));
    }
    let mut actions = store.actions_for_campaign(campaign_id);
    actions.sort_by_key(|a| a.scheduled_for);

    let mut grouped = CampaignActions::default();
    for action in actions {
        match action.status {
            ActionStatus::Completed => grouped.completed.push(action),
            ActionStatus::Failed => grouped.failed.push(action),
            ActionStatus::Pending | ActionStatus::InProgress | ActionStatus::Paused => {
                grouped.pending.push(action)
            }
        }
    }
    Ok(grouped)
}

pub fn action_stats(store: &dyn OutreachStore, campaign_id: Uuid) -> CampaignResult<CampaignActionStats> {
    let campaign = store
        .get_campaign(campaign_id)
        .ok_or_else(|| CampaignError::not_found("campaign", campaign_id))?;
    let actions = store.actions_for_campaign(campaign_id);

    let mut stats = CampaignActionStats {
        campaign_id,
        status: campaign.status,
        total: actions.len() as u64,
        completed: 0,
        pending: 0,
        in_progress: 0,
        paused: 0,
        failed: 0,
        success_rate: 0.0,
        by_type: Vec::new(),
        journeys: JourneyBreakdown::default(),
        analytics: campaign.analytics,
        warning: None,
    };

    let mut by_type: HashMap<ActionType, ActionTypeStats> = HashMap::new();
    for action in &actions {
        let entry = by_type.entry(action.action_type).or_insert(ActionTypeStats {
            action_type: action.action_type,
            total: 0,
            completed: 0,
            pending: 0,
            failed: 0,
        });
        entry.total += 1;
        match action.status {
            ActionStatus::Completed => {
                stats.completed += 1;
                entry.completed += 1;
            }
            ActionStatus::Failed => {
                stats.failed += 1;
                entry.failed += 1;
            }
            ActionStatus::Pending => {
                stats.pending += 1;
                entry.pending += 1;
            }
            ActionStatus::InProgress => {
                stats.in_progress += 1;
                entry.pending += 1;
            }
            ActionStatus::Paused => {
                stats.paused += 1;
                entry.pending += 1;
            }
        }
    }
    stats.by_type = by_type.into_values().collect();
    stats.by_type.sort_by(|a, b| b.total.cmp(&a.total));

    let settled = stats.completed + stats.failed;
    if settled > 0 {
        stats.success_rate = stats.completed as f64 / settled as f64;
    }
    if stats.failed > 0 {
        stats.warning = Some(format!(
            "{} action(s) failed; retry them once the channel issue is fixed",
            stats.failed
        ));
    }

    for journey in store.journeys_for_campaign(campaign_id) {
        let bucket = match journey.status {
            JourneyStatus::InProgress => &mut stats.journeys.in_progress,
            JourneyStatus::Awaiting => &mut stats.journeys.awaiting,
            JourneyStatus::Paused => &mut stats.journeys.paused,
            JourneyStatus::Completed => &mut stats.journeys.completed,
            JourneyStatus::Failed => &mut stats.journeys.failed,
            JourneyStatus::Blacklisted => &mut stats.journeys.blacklisted,
        };
        *bucket += 1;
    }

    Ok(stats)
}
