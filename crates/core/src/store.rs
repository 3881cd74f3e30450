//! Persistence port for sequences, campaigns, journeys and actions.
//!
//! `MemoryStore` backs it with DashMap for development and tests. Production:
//! implement `OutreachStore` over PostgreSQL with a revision column on
//! campaigns, journeys and actions and a partial unique index on
//! `(journey_id) WHERE status IN ('pending', 'in_progress')`.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::sequence::SequenceDefinition;
use crate::types::{
    Action, ActionStatus, Campaign, CampaignStatus, ChannelAccount, JourneyStatus, Lead,
    LeadJourney, LeadList,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: &'static str, id: Uuid },

    #[error("{kind} {key} already exists")]
    Duplicate { kind: &'static str, key: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("journey {journey_id} already has open action {existing}")]
    OpenActionExists { journey_id: Uuid, existing: Uuid },
}

/// Record-level persistence with optimistic concurrency.
///
/// `update_*` and `commit_journey` compare the caller's `revision` with the
/// stored one, reject on mismatch, and bump it on success.
pub trait OutreachStore: Send + Sync {
    // Sequences
    fn save_sequence(&self, sequence: SequenceDefinition);
    fn get_sequence(&self, id: Uuid) -> Option<SequenceDefinition>;

    // Channel accounts
    fn save_account(&self, account: ChannelAccount);
    fn get_account(&self, id: Uuid) -> Option<ChannelAccount>;

    // Leads
    fn save_lead_list(&self, list: LeadList);
    fn get_lead_list(&self, id: Uuid) -> Option<LeadList>;
    fn get_lead(&self, id: Uuid) -> Option<Lead>;

    // Campaigns
    fn insert_campaign(&self, campaign: Campaign) -> Result<(), StoreError>;
    fn get_campaign(&self, id: Uuid) -> Option<Campaign>;
    fn list_campaigns(&self) -> Vec<Campaign>;
    fn campaigns_by_status(&self, status: CampaignStatus) -> Vec<Campaign>;
    fn campaigns_for_account(&self, account_id: Uuid) -> Vec<Uuid>;
    fn campaigns_for_sequence(&self, sequence_id: Uuid) -> Vec<Campaign>;
    fn update_campaign(&self, campaign: &mut Campaign) -> Result<(), StoreError>;
    /// Removes the campaign and its journeys. Actions stay as audit trail.
    fn delete_campaign(&self, id: Uuid) -> Result<usize, StoreError>;

    // Journeys
    /// Inserts a new journey together with its first action, if any.
    /// Fails with `Duplicate` when the (campaign, lead) pair already has one.
    fn insert_journey(&self, journey: LeadJourney, action: Option<Action>) -> Result<(), StoreError>;
    fn get_journey(&self, id: Uuid) -> Option<LeadJourney>;
    fn journey_for_lead(&self, campaign_id: Uuid, lead_id: Uuid) -> Option<LeadJourney>;
    fn journeys_for_campaign(&self, campaign_id: Uuid) -> Vec<LeadJourney>;
    /// `in_progress` journeys parked on a delay whose continuation is due.
    fn due_continuations(&self, now: DateTime<Utc>) -> Vec<LeadJourney>;
    /// `awaiting` journeys whose condition deadline has passed.
    fn expired_conditions(&self, now: DateTime<Utc>) -> Vec<LeadJourney>;
    /// Atomically writes a journey and, optionally, one of its actions
    /// (inserted when new, revision-checked otherwise).
    fn commit_journey(
        &self,
        journey: &mut LeadJourney,
        action: Option<&mut Action>,
    ) -> Result<(), StoreError>;

    // Actions
    fn get_action(&self, id: Uuid) -> Option<Action>;
    fn update_action(&self, action: &mut Action) -> Result<(), StoreError>;
    fn actions_for_campaign(&self, campaign_id: Uuid) -> Vec<Action>;
    fn actions_by_status(&self, campaign_id: Uuid, status: ActionStatus) -> Vec<Action>;
    fn actions_for_journey(&self, journey_id: Uuid) -> Vec<Action>;
    fn open_action_for_journey(&self, journey_id: Uuid) -> Option<Action>;
    /// Pending actions with `scheduled_for <= now`, oldest first.
    fn due_actions(&self, now: DateTime<Utc>) -> Vec<Action>;
    fn in_flight_actions(&self) -> Vec<Action>;
    fn count_dispatched_since(&self, campaign_ids: &[Uuid], since: DateTime<Utc>) -> u32;
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    sequences: DashMap<Uuid, SequenceDefinition>,
    accounts: DashMap<Uuid, ChannelAccount>,
    lead_lists: DashMap<Uuid, LeadList>,
    leads: DashMap<Uuid, Lead>,
    campaigns: DashMap<Uuid, Campaign>,
    journeys: DashMap<Uuid, LeadJourney>,
    /// (campaign_id, lead_id) -> journey_id
    journey_keys: DashMap<(Uuid, Uuid), Uuid>,
    actions: DashMap<Uuid, Action>,
    /// journey_id -> the one pending/in-progress action
    open_actions: DashMap<Uuid, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Outreach store initialized (in-memory, development mode)");
        Self::default()
    }

    /// Claims the journey's open-action slot. Returns whether it was newly taken.
    fn reserve_open(&self, journey_id: Uuid, action_id: Uuid) -> Result<bool, StoreError> {
        match self.open_actions.entry(journey_id) {
            Entry::Occupied(e) if *e.get() != action_id => Err(StoreError::OpenActionExists {
                journey_id,
                existing: *e.get(),
            }),
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(action_id);
                Ok(true)
            }
        }
    }

    fn release_open(&self, journey_id: Uuid, action_id: Uuid) {
        self.open_actions
            .remove_if(&journey_id, |_, held| *held == action_id);
    }

    fn write_action(&self, action: &mut Action) -> Result<(), StoreError> {
        let now_open = action.status.is_open();
        let newly_reserved = if now_open {
            self.reserve_open(action.journey_id, action.id)?
        } else {
            false
        };

        match self.actions.entry(action.id) {
            Entry::Occupied(mut e) => {
                if e.get().revision != action.revision {
                    if newly_reserved {
                        self.release_open(action.journey_id, action.id);
                    }
                    return Err(StoreError::Conflict {
                        kind: "action",
                        id: action.id,
                    });
                }
                action.revision += 1;
                e.insert(action.clone());
            }
            Entry::Vacant(v) => {
                v.insert(action.clone());
            }
        }

        if !now_open {
            self.release_open(action.journey_id, action.id);
        }
        Ok(())
    }

    fn collect_actions(&self, filter: impl Fn(&Action) -> bool) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .actions
            .iter()
            .filter(|r| filter(r.value()))
            .map(|r| r.value().clone())
            .collect();
        actions.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.created_at.cmp(&b.created_at))
        });
        actions
    }
}

impl OutreachStore for MemoryStore {
    // ─── Sequences ─────────────────────────────────────────────────────────

    fn save_sequence(&self, sequence: SequenceDefinition) {
        self.sequences.insert(sequence.id, sequence);
    }

    fn get_sequence(&self, id: Uuid) -> Option<SequenceDefinition> {
        self.sequences.get(&id).map(|r| r.value().clone())
    }

    // ─── Accounts ──────────────────────────────────────────────────────────

    fn save_account(&self, account: ChannelAccount) {
        self.accounts.insert(account.id, account);
    }

    fn get_account(&self, id: Uuid) -> Option<ChannelAccount> {
        self.accounts.get(&id).map(|r| r.value().clone())
    }

    // ─── Leads ─────────────────────────────────────────────────────────────

    fn save_lead_list(&self, list: LeadList) {
        for lead in &list.leads {
            self.leads.insert(lead.id, lead.clone());
        }
        self.lead_lists.insert(list.id, list);
    }

    fn get_lead_list(&self, id: Uuid) -> Option<LeadList> {
        self.lead_lists.get(&id).map(|r| r.value().clone())
    }

    fn get_lead(&self, id: Uuid) -> Option<Lead> {
        self.leads.get(&id).map(|r| r.value().clone())
    }

    // ─── Campaigns ─────────────────────────────────────────────────────────

    fn insert_campaign(&self, campaign: Campaign) -> Result<(), StoreError> {
        match self.campaigns.entry(campaign.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                kind: "campaign",
                key: campaign.id.to_string(),
            }),
            Entry::Vacant(v) => {
                v.insert(campaign);
                Ok(())
            }
        }
    }

    fn get_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|r| r.value().clone())
    }

    fn list_campaigns(&self) -> Vec<Campaign> {
        let mut campaigns: Vec<Campaign> =
            self.campaigns.iter().map(|r| r.value().clone()).collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        campaigns
    }

    fn campaigns_by_status(&self, status: CampaignStatus) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.value().status == status)
            .map(|r| r.value().clone())
            .collect()
    }

    fn campaigns_for_account(&self, account_id: Uuid) -> Vec<Uuid> {
        self.campaigns
            .iter()
            .filter(|r| r.value().channel_account_id == account_id)
            .map(|r| *r.key())
            .collect()
    }

    fn campaigns_for_sequence(&self, sequence_id: Uuid) -> Vec<Campaign> {
        self.campaigns
            .iter()
            .filter(|r| r.value().sequence_id == sequence_id)
            .map(|r| r.value().clone())
            .collect()
    }

    fn update_campaign(&self, campaign: &mut Campaign) -> Result<(), StoreError> {
        let mut entry = self
            .campaigns
            .get_mut(&campaign.id)
            .ok_or(StoreError::NotFound {
                kind: "campaign",
                id: campaign.id,
            })?;
        if entry.revision != campaign.revision {
            return Err(StoreError::Conflict {
                kind: "campaign",
                id: campaign.id,
            });
        }
        campaign.revision += 1;
        *entry = campaign.clone();
        Ok(())
    }

    fn delete_campaign(&self, id: Uuid) -> Result<usize, StoreError> {
        self.campaigns.remove(&id).ok_or(StoreError::NotFound {
            kind: "campaign",
            id,
        })?;

        let journey_ids: Vec<(Uuid, Uuid)> = self
            .journeys
            .iter()
            .filter(|r| r.value().campaign_id == id)
            .map(|r| (*r.key(), r.value().lead_id))
            .collect();
        for (journey_id, lead_id) in &journey_ids {
            self.journeys.remove(journey_id);
            self.journey_keys.remove(&(id, *lead_id));
            self.open_actions.remove(journey_id);
        }
        Ok(journey_ids.len())
    }

    // ─── Journeys ──────────────────────────────────────────────────────────

    fn insert_journey(
        &self,
        journey: LeadJourney,
        action: Option<Action>,
    ) -> Result<(), StoreError> {
        match self.journey_keys.entry((journey.campaign_id, journey.lead_id)) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                kind: "journey",
                key: format!("{}/{}", journey.campaign_id, journey.lead_id),
            }),
            Entry::Vacant(v) => {
                if let Some(mut action) = action {
                    self.write_action(&mut action)?;
                }
                v.insert(journey.id);
                self.journeys.insert(journey.id, journey);
                Ok(())
            }
        }
    }

    fn get_journey(&self, id: Uuid) -> Option<LeadJourney> {
        self.journeys.get(&id).map(|r| r.value().clone())
    }

    fn journey_for_lead(&self, campaign_id: Uuid, lead_id: Uuid) -> Option<LeadJourney> {
        let id = *self.journey_keys.get(&(campaign_id, lead_id))?;
        self.get_journey(id)
    }

    fn journeys_for_campaign(&self, campaign_id: Uuid) -> Vec<LeadJourney> {
        let mut journeys: Vec<LeadJourney> = self
            .journeys
            .iter()
            .filter(|r| r.value().campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        journeys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        journeys
    }

    fn due_continuations(&self, now: DateTime<Utc>) -> Vec<LeadJourney> {
        let mut due: Vec<LeadJourney> = self
            .journeys
            .iter()
            .filter(|r| {
                let j = r.value();
                j.status == JourneyStatus::InProgress && j.resume_at.is_some_and(|t| t <= now)
            })
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|j| j.resume_at);
        due
    }

    fn expired_conditions(&self, now: DateTime<Utc>) -> Vec<LeadJourney> {
        let mut expired: Vec<LeadJourney> = self
            .journeys
            .iter()
            .filter(|r| {
                let j = r.value();
                j.status == JourneyStatus::Awaiting
                    && j.condition_deadline.is_some_and(|t| t <= now)
            })
            .map(|r| r.value().clone())
            .collect();
        expired.sort_by_key(|j| j.condition_deadline);
        expired
    }

    fn commit_journey(
        &self,
        journey: &mut LeadJourney,
        action: Option<&mut Action>,
    ) -> Result<(), StoreError> {
        // The journey entry stays locked for the whole commit.
        let mut entry = self
            .journeys
            .get_mut(&journey.id)
            .ok_or(StoreError::NotFound {
                kind: "journey",
                id: journey.id,
            })?;
        if entry.revision != journey.revision {
            return Err(StoreError::Conflict {
                kind: "journey",
                id: journey.id,
            });
        }
        if let Some(action) = action {
            self.write_action(action)?;
        }
        journey.revision += 1;
        *entry = journey.clone();
        Ok(())
    }

    // ─── Actions ───────────────────────────────────────────────────────────

    fn get_action(&self, id: Uuid) -> Option<Action> {
        self.actions.get(&id).map(|r| r.value().clone())
    }

    fn update_action(&self, action: &mut Action) -> Result<(), StoreError> {
        if !self.actions.contains_key(&action.id) {
            return Err(StoreError::NotFound {
                kind: "action",
                id: action.id,
            });
        }
        self.write_action(action)
    }

    fn actions_for_campaign(&self, campaign_id: Uuid) -> Vec<Action> {
        self.collect_actions(|a| a.campaign_id == campaign_id)
    }

    fn actions_by_status(&self, campaign_id: Uuid, status: ActionStatus) -> Vec<Action> {
        self.collect_actions(|a| a.campaign_id == campaign_id && a.status == status)
    }

    fn actions_for_journey(&self, journey_id: Uuid) -> Vec<Action> {
        let mut actions = self.collect_actions(|a| a.journey_id == journey_id);
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        actions
    }

    fn open_action_for_journey(&self, journey_id: Uuid) -> Option<Action> {
        let id = *self.open_actions.get(&journey_id)?;
        self.get_action(id)
    }

    fn due_actions(&self, now: DateTime<Utc>) -> Vec<Action> {
        self.collect_actions(|a| a.status == ActionStatus::Pending && a.scheduled_for <= now)
    }

    fn in_flight_actions(&self) -> Vec<Action> {
        self.collect_actions(|a| a.status == ActionStatus::InProgress)
    }

    fn count_dispatched_since(&self, campaign_ids: &[Uuid], since: DateTime<Utc>) -> u32 {
        self.actions
            .iter()
            .filter(|r| {
                let a = r.value();
                campaign_ids.contains(&a.campaign_id) && a.dispatched_at.is_some_and(|t| t >= since)
            })
            .count() as u32
    }
}
