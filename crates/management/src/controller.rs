//! Campaign lifecycle control. A campaign's status gates the journey engine
//! and the dispatcher.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{make_event, notify, noop_sink, EventSink, EventType};
use campaign_core::sequence::{Edge, SequenceDefinition, SequenceNode};
use campaign_core::store::OutreachStore;
use campaign_core::types::{
    Campaign, CampaignStatus, ChannelAccount, HaltReason, JourneyStatus, LeadEvent, LeadJourney,
    LeadList,
};
use campaign_core::Clock;
use campaign_delivery::ActionDispatcher;
use campaign_journey::{validate, JourneyEngine};

/// Outcome of `start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub campaign: Campaign,
    pub journeys_created: usize,
    pub journeys_resumed: usize,
    pub enrollment_errors: usize,
}

pub struct CampaignController {
    store: Arc<dyn OutreachStore>,
    engine: Arc<JourneyEngine>,
    dispatcher: Arc<ActionDispatcher>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl CampaignController {
    pub fn new(engine: Arc<JourneyEngine>, dispatcher: Arc<ActionDispatcher>) -> Self {
        Self {
            store: engine.store().clone(),
            clock: engine.clock().clone(),
            engine,
            dispatcher,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn engine(&self) -> &Arc<JourneyEngine> {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn OutreachStore> {
        &self.store
    }

    // ─── Sequences ──────────────────────────────────────────────────────

    /// Validates and stores a new sequence.
    pub fn save_sequence(&self, sequence: SequenceDefinition) -> CampaignResult<SequenceDefinition> {
        validate(&sequence)?;
        info!(sequence_id = %sequence.id, name = %sequence.name, nodes = sequence.nodes.len(), "Sequence saved");
        self.store.save_sequence(sequence.clone());
        Ok(sequence)
    }

    /// Stores a sequence in the flow editor's JSON format.
    pub fn import_sequence_json(&self, doc: &serde_json::Value) -> CampaignResult<SequenceDefinition> {
        let sequence = SequenceDefinition::from_editor_json(doc)?;
        self.save_sequence(sequence)
    }

    /// Replaces a sequence's graph as a new version. Rejected while an active
    /// campaign runs on it, and when the new graph drops a node that a live or
    /// retryable journey still sits on.
    pub fn update_sequence(
        &self,
        sequence_id: Uuid,
        nodes: Vec<SequenceNode>,
        edges: Vec<Edge>,
    ) -> CampaignResult<SequenceDefinition> {
        let mut sequence = self
            .store
            .get_sequence(sequence_id)
            .ok_or_else(|| CampaignError::not_found("sequence", sequence_id))?;
        let locked = self
            .store
            .campaigns_for_sequence(sequence_id)
            .iter()
            .any(|c| c.status == CampaignStatus::Active);
        if locked {
            return Err(CampaignError::SequenceLocked(sequence_id));
        }

        sequence.nodes = nodes;
        sequence.edges = edges;
        sequence.version += 1;
        sequence.updated_at = self.clock.now();
        validate(&sequence)?;

        let stranded = self
            .store
            .campaigns_for_sequence(sequence_id)
            .into_iter()
            .flat_map(|c| self.store.journeys_for_campaign(c.id))
            .filter(|j| {
                !j.status.is_terminal()
                    || (j.status == JourneyStatus::Failed
                        && j.halt_reason == Some(HaltReason::ActionFailed))
            })
            .find(|j| sequence.node(&j.current_node_id).is_none());
        if let Some(journey) = stranded {
            warn!(
                sequence_id = %sequence_id,
                journey_id = %journey.id,
                node_id = %journey.current_node_id,
                "Sequence edit would strand a journey"
            );
            return Err(CampaignError::Configuration(format!(
                "node {} is still in use by journey {}",
                journey.current_node_id, journey.id
            )));
        }

        self.engine.register_definition(&sequence)?;
        self.store.save_sequence(sequence.clone());
        info!(sequence_id = %sequence_id, version = sequence.version, "Sequence updated");
        Ok(sequence)
    }

    // ─── Accounts and leads ─────────────────────────────────────────────

    pub fn save_account(&self, account: ChannelAccount) -> ChannelAccount {
        self.store.save_account(account.clone());
        account
    }

    pub fn add_lead_list(&self, list: LeadList) -> LeadList {
        info!(list_id = %list.id, leads = list.leads.len(), "Lead list added");
        self.store.save_lead_list(list.clone());
        list
    }

    // ─── Campaigns ──────────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        name: &str,
        sequence_id: Uuid,
        channel_account_id: Uuid,
        lead_list_ids: Vec<Uuid>,
    ) -> CampaignResult<Campaign> {
        let sequence = self
            .store
            .get_sequence(sequence_id)
            .ok_or_else(|| CampaignError::not_found("sequence", sequence_id))?;
        validate(&sequence)?;
        if self.store.get_account(channel_account_id).is_none() {
            return Err(CampaignError::not_found("channel account", channel_account_id));
        }
        if let Some(missing) = lead_list_ids
            .iter()
            .find(|id| self.store.get_lead_list(**id).is_none())
        {
            return Err(CampaignError::not_found("lead list", missing));
        }

        let campaign = Campaign::new(name, sequence_id, channel_account_id, lead_list_ids);
        self.store.insert_campaign(campaign.clone())?;
        info!(campaign_id = %campaign.id, name = %name, "Campaign created");
        Ok(campaign)
    }

    pub fn get_campaign(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        self.store
            .get_campaign(campaign_id)
            .ok_or_else(|| CampaignError::not_found("campaign", campaign_id))
    }

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        self.store.list_campaigns()
    }

    pub fn journeys(&self, campaign_id: Uuid) -> CampaignResult<Vec<LeadJourney>> {
        self.get_campaign(campaign_id)?;
        Ok(self.store.journeys_for_campaign(campaign_id))
    }

    /// Activates a draft, paused or stopped campaign: validates its sequence,
    /// checks the account has quota left, resumes paused journeys and creates
    /// journeys for every lead that has none. One lead failing to enroll does
    /// not stop the others.
    pub fn start(&self, campaign_id: Uuid) -> CampaignResult<StartReport> {
        let campaign = self.get_campaign(campaign_id)?;
        let from = campaign.status;
        if !matches!(
            from,
            CampaignStatus::Draft | CampaignStatus::Paused | CampaignStatus::Stopped
        ) {
            return Err(CampaignError::invalid_transition("campaign", from, CampaignStatus::Active));
        }

        let sequence = self
            .store
            .get_sequence(campaign.sequence_id)
            .ok_or_else(|| CampaignError::not_found("sequence", campaign.sequence_id))?;
        let def = self.engine.register_definition(&sequence)?;
        if from == CampaignStatus::Paused {
            let stranded = self
                .store
                .journeys_for_campaign(campaign_id)
                .into_iter()
                .find(|j| !j.status.is_terminal() && def.node(&j.current_node_id).is_none());
            if let Some(journey) = stranded {
                return Err(CampaignError::Configuration(format!(
                    "journey {} sits on node {} which sequence version {} no longer has",
                    journey.id,
                    journey.current_node_id,
                    def.version()
                )));
            }
        }

        if self.dispatcher.quota_remaining(&campaign) == 0 {
            let key = self.dispatcher.quota().key(&campaign);
            return Err(CampaignError::QuotaExceeded {
                scope: format!("{key:?}"),
            });
        }

        let now = self.clock.now();
        let paused_at = campaign.paused_at;
        let campaign = self.engine.update_campaign_with(campaign_id, |c| {
            if c.status != from {
                return Err(CampaignError::invalid_transition("campaign", c.status, CampaignStatus::Active));
            }
            c.status = CampaignStatus::Active;
            c.paused_at = None;
            c.started_at.get_or_insert(now);
            Ok(())
        })?;

        let journeys_resumed = match (from, paused_at) {
            (CampaignStatus::Paused, Some(paused_at)) => {
                self.engine.resume_campaign(campaign_id, paused_at, now)?
            }
            _ => 0,
        };

        let mut journeys_created = 0;
        let mut enrollment_errors = 0;
        for list_id in &campaign.lead_list_ids {
            let Some(list) = self.store.get_lead_list(*list_id) else {
                warn!(campaign_id = %campaign_id, list_id = %list_id, "Lead list missing, skipped");
                continue;
            };
            for lead in &list.leads {
                match self.engine.enroll_lead(&campaign, lead.id) {
                    Ok(Some(_)) => journeys_created += 1,
                    Ok(None) => {}
                    Err(e) => {
                        enrollment_errors += 1;
                        warn!(campaign_id = %campaign_id, lead_id = %lead.id, error = %e, "Lead enrollment failed");
                    }
                }
            }
        }

        self.engine.maybe_complete_campaign(campaign_id)?;
        info!(
            campaign_id = %campaign_id,
            from = ?from,
            journeys_created,
            journeys_resumed,
            enrollment_errors,
            "Campaign started"
        );
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::CampaignStarted,
                campaign_id,
                None,
                serde_json::json!({ "journeys_created": journeys_created }),
            ),
        );

        Ok(StartReport {
            campaign: self.get_campaign(campaign_id)?,
            journeys_created,
            journeys_resumed,
            enrollment_errors,
        })
    }

    /// Halts new dispatch. Actions already with the driver finish and report.
    pub fn pause(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        let now = self.clock.now();
        let campaign = self.engine.update_campaign_with(campaign_id, |c| {
            if c.status != CampaignStatus::Active {
                return Err(CampaignError::invalid_transition("campaign", c.status, CampaignStatus::Paused));
            }
            c.status = CampaignStatus::Paused;
            c.paused_at = Some(now);
            Ok(())
        })?;
        let journeys = self.engine.pause_campaign(campaign_id, now)?;

        info!(campaign_id = %campaign_id, journeys, "Campaign paused");
        notify(
            self.event_sink.as_ref(),
            make_event(EventType::CampaignPaused, campaign_id, None, serde_json::json!({})),
        );
        Ok(campaign)
    }

    /// Ends the campaign for good; every live journey is forced terminal.
    pub fn stop(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        let campaign = self.engine.update_campaign_with(campaign_id, |c| {
            if !matches!(c.status, CampaignStatus::Active | CampaignStatus::Paused) {
                return Err(CampaignError::invalid_transition("campaign", c.status, CampaignStatus::Stopped));
            }
            c.status = CampaignStatus::Stopped;
            c.paused_at = None;
            Ok(())
        })?;
        let journeys = self.engine.stop_campaign(campaign_id)?;

        info!(campaign_id = %campaign_id, journeys, "Campaign stopped");
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::CampaignStopped,
                campaign_id,
                None,
                serde_json::json!({ "journeys_stopped": journeys }),
            ),
        );
        Ok(campaign)
    }

    /// Deletes a campaign that is not running. Its journeys go with it; its
    /// actions stay as audit trail.
    pub fn delete(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let campaign = self.get_campaign(campaign_id)?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Stopped | CampaignStatus::Completed
        ) {
            return Err(CampaignError::InvalidTransition {
                entity: "campaign",
                from: format!("{:?}", campaign.status),
                to: "deleted".to_string(),
            });
        }
        let journeys = self.store.delete_campaign(campaign_id)?;
        info!(campaign_id = %campaign_id, journeys, "Campaign deleted");
        Ok(journeys)
    }

    /// Re-validates and registers the sequences of every running campaign,
    /// then replays action results whose journey update was lost. Run at
    /// boot; a campaign whose sequence no longer validates is logged and left
    /// for the operator.
    pub fn restore(&self) -> usize {
        let mut restored = 0;
        let running = self
            .store
            .campaigns_by_status(CampaignStatus::Active)
            .into_iter()
            .chain(self.store.campaigns_by_status(CampaignStatus::Paused));
        for campaign in running {
            let result = self
                .store
                .get_sequence(campaign.sequence_id)
                .ok_or_else(|| CampaignError::not_found("sequence", campaign.sequence_id))
                .and_then(|sequence| self.engine.register_definition(&sequence));
            match result {
                Ok(_) => restored += 1,
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Campaign not restored"),
            }
        }
        let recovery = self.engine.recover_stalled();
        info!(
            campaigns = restored,
            stalled_recovered = recovery.stalled_recovered,
            recovery_errors = recovery.errors,
            "Running campaigns restored"
        );
        restored
    }

    // ─── Operator actions ───────────────────────────────────────────────

    pub fn retry_failed_actions(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        self.dispatcher.retry_failed_actions(campaign_id)
    }

    pub fn record_lead_event(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        event: LeadEvent,
    ) -> CampaignResult<LeadJourney> {
        self.engine.record_lead_event(campaign_id, lead_id, event)
    }

    pub fn blacklist_lead(&self, campaign_id: Uuid, lead_id: Uuid) -> CampaignResult<LeadJourney> {
        self.engine.blacklist_lead(campaign_id, lead_id)
    }
}
