use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::config::{ConditionTimeoutPolicy, EngineConfig};
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{make_event, notify, noop_sink, EventSink, EventType};
use campaign_core::sequence::{Branch, Node, SequenceDefinition};
use campaign_core::store::{OutreachStore, StoreError};
use campaign_core::types::{
    Action, ActionStatus, ActionType, Campaign, CampaignAnalytics, CampaignStatus, HaltReason,
    JourneyMetrics, JourneyStatus, LeadEvent, LeadJourney,
};
use campaign_core::Clock;

use crate::delay;
use crate::evaluator::ConditionEvaluator;
use crate::personalize;
use crate::state_machine::JourneyStateMachine;
use crate::validator::{validate, ValidDefinition};

/// Attempts at a read-modify-write before a concurrent writer wins.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// What a journey mutation wants persisted.
enum Write {
    Unchanged,
    Commit(Option<Action>),
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub continuations_fired: usize,
    pub conditions_timed_out: usize,
    pub stalled_recovered: usize,
    pub errors: usize,
}

/// Per-lead state machine over validated sequences.
///
/// Every suspension (pending action, delay, unresolved condition) is durable
/// record state in the store, so any engine instance can pick a journey up
/// again from the store alone. Within one journey, mutations are serialized by
/// a per-journey lock and by the store's revision check.
pub struct JourneyEngine {
    store: Arc<dyn OutreachStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    definitions: DashMap<Uuid, Arc<ValidDefinition>>,
    journey_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    evaluator: ConditionEvaluator,
    state_machine: JourneyStateMachine,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("definitions", &self.definitions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(store: Arc<dyn OutreachStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
            definitions: DashMap::new(),
            journey_locks: DashMap::new(),
            evaluator: ConditionEvaluator::new(),
            state_machine: JourneyStateMachine::new(),
            event_sink: noop_sink(),
        }
    }

    /// Attach a sink for lifecycle webhooks.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn OutreachStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ─── Definitions ────────────────────────────────────────────────────

    /// Validates a sequence and makes it the definition journeys on it run against.
    pub fn register_definition(
        &self,
        sequence: &SequenceDefinition,
    ) -> CampaignResult<Arc<ValidDefinition>> {
        let valid = Arc::new(validate(sequence)?);
        info!(
            sequence_id = %sequence.id,
            version = sequence.version,
            nodes = valid.len(),
            "Sequence definition registered"
        );
        self.definitions.insert(sequence.id, valid.clone());
        Ok(valid)
    }

    /// The registered definition, loading and validating it from the store on first use.
    pub fn definition(&self, sequence_id: Uuid) -> CampaignResult<Arc<ValidDefinition>> {
        if let Some(valid) = self.definitions.get(&sequence_id) {
            return Ok(valid.clone());
        }
        let sequence = self
            .store
            .get_sequence(sequence_id)
            .ok_or_else(|| CampaignError::not_found("sequence", sequence_id))?;
        self.register_definition(&sequence)
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    /// Creates the lead's journey and advances it to its first suspension.
    /// Returns `None` when the lead already has a journey in this campaign.
    pub fn enroll_lead(
        &self,
        campaign: &Campaign,
        lead_id: Uuid,
    ) -> CampaignResult<Option<LeadJourney>> {
        if self.store.journey_for_lead(campaign.id, lead_id).is_some() {
            return Ok(None);
        }

        let def = self.definition(campaign.sequence_id)?;
        let now = self.clock.now();
        let mut journey = LeadJourney {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            lead_id,
            sequence_id: campaign.sequence_id,
            current_node_id: def.start_node_id().to_string(),
            status: JourneyStatus::InProgress,
            metrics: JourneyMetrics::default(),
            next_action_scheduled_for: None,
            resume_at: None,
            condition_deadline: None,
            halt_reason: None,
            paused_at: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        };

        let action = self.run(&mut journey, &def, campaign, now)?;
        match self.store.insert_journey(journey.clone(), action.clone()) {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        info!(
            campaign_id = %campaign.id,
            lead_id = %lead_id,
            journey_id = %journey.id,
            node_id = %journey.current_node_id,
            status = ?journey.status,
            "Lead journey started"
        );
        self.bump_analytics(campaign.id, |a| a.journeys_started += 1);
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::JourneyStarted,
                campaign.id,
                Some(lead_id),
                serde_json::json!({ "journey_id": journey.id }),
            ),
        );
        // Completion is checked once the whole lead list is enrolled.
        self.after_commit(JourneyStatus::InProgress, &journey, false);
        Ok(Some(journey))
    }

    // ─── Dispatcher results ─────────────────────────────────────────────

    /// Folds a completed action into its journey and advances past its node.
    /// A completion the journey has already absorbed is ignored.
    pub fn on_action_completed(&self, action: &Action) -> CampaignResult<()> {
        let now = self.clock.now();
        let folded = self.mutate_journey(action.journey_id, |journey| {
            if !is_current(journey, action) {
                debug!(action_id = %action.id, journey_id = %journey.id, "Stale completion ignored");
                return Ok(Write::Unchanged);
            }
            if journey.status == JourneyStatus::Completed {
                // Its node was the last one; this completion ended the journey.
                return Ok(Write::Unchanged);
            }
            self.evaluator
                .record_completion(&mut journey.metrics, action.action_type);
            if journey.status.is_terminal() {
                // Stopped or blacklisted while the action was in flight.
                return Ok(Write::Commit(None));
            }

            let def = self.definition(journey.sequence_id)?;
            let campaign = self.campaign(journey.campaign_id)?;
            journey.next_action_scheduled_for = None;
            if !self.move_next(journey, &def, &action.node_id)? {
                return Ok(Write::Commit(None));
            }
            let next = self.run(journey, &def, &campaign, now)?;
            Ok(Write::Commit(next))
        })?;
        if folded.is_none() {
            return Ok(());
        }

        self.bump_analytics(action.campaign_id, |a| {
            a.actions_completed += 1;
            match action.action_type {
                ActionType::SendInvite => a.invites_sent += 1,
                ActionType::SendMessage => a.messages_sent += 1,
                _ => {}
            }
        });
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::ActionCompleted,
                action.campaign_id,
                Some(action.lead_id),
                serde_json::json!({
                    "action_id": action.id,
                    "action_type": action.action_type,
                    "node_id": action.node_id,
                }),
            ),
        );
        Ok(())
    }

    /// Halts the action's journey. Failures are never retried automatically.
    pub fn on_action_failed(&self, action: &Action) -> CampaignResult<()> {
        let reason = action
            .result
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_default();

        let mut counted = false;
        self.mutate_journey(action.journey_id, |journey| {
            counted = false;
            if !is_current(journey, action) {
                return Ok(Write::Unchanged);
            }
            if journey.status.is_terminal() {
                // Already halted by this failure, or stopped while in flight.
                counted = journey.halt_reason != Some(HaltReason::ActionFailed);
                return Ok(Write::Unchanged);
            }
            self.finish(journey, JourneyStatus::Failed, Some(HaltReason::ActionFailed))?;
            counted = true;
            warn!(
                campaign_id = %journey.campaign_id,
                lead_id = %journey.lead_id,
                action_id = %action.id,
                node_id = %action.node_id,
                error = %reason,
                "Journey halted on failed action"
            );
            Ok(Write::Commit(None))
        })?;
        if !counted {
            return Ok(());
        }

        self.bump_analytics(action.campaign_id, |a| a.actions_failed += 1);
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::ActionFailed,
                action.campaign_id,
                Some(action.lead_id),
                serde_json::json!({
                    "action_id": action.id,
                    "action_type": action.action_type,
                    "error": reason,
                }),
            ),
        );
        Ok(())
    }

    /// Re-arms a failed action and the journey it halted. Returns `false` when
    /// the journey has moved on or was stopped, leaving the action failed.
    pub fn reopen_for_retry(
        &self,
        action_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> CampaignResult<bool> {
        let action = self
            .store
            .get_action(action_id)
            .ok_or_else(|| CampaignError::not_found("action", action_id))?;
        if action.status != ActionStatus::Failed {
            return Ok(false);
        }

        let now = self.clock.now();
        let reopened = self.mutate_journey(action.journey_id, |journey| {
            let Some(mut action) = self.store.get_action(action_id) else {
                return Ok(Write::Unchanged);
            };
            let halted_here = journey.status == JourneyStatus::Failed
                && journey.halt_reason == Some(HaltReason::ActionFailed);
            if action.status != ActionStatus::Failed || !halted_here || !is_current(journey, &action)
            {
                return Ok(Write::Unchanged);
            }
            let campaign = self.campaign(journey.campaign_id)?;

            self.transition(journey, JourneyStatus::InProgress)?;
            journey.halt_reason = None;
            journey.next_action_scheduled_for = Some(scheduled_for);

            action.status = ActionStatus::Pending;
            action.scheduled_for = scheduled_for;
            action.result = None;
            action.updated_at = now;
            if campaign.status == CampaignStatus::Paused {
                self.transition(journey, JourneyStatus::Paused)?;
                journey.paused_at = Some(now);
                action.status = ActionStatus::Paused;
            }
            Ok(Write::Commit(Some(action)))
        })?;

        if let Some(journey) = &reopened {
            info!(
                campaign_id = %journey.campaign_id,
                action_id = %action_id,
                scheduled_for = %scheduled_for,
                "Failed action reopened for retry"
            );
            self.bump_analytics(journey.campaign_id, |a| {
                a.journeys_failed = a.journeys_failed.saturating_sub(1)
            });
        }
        Ok(reopened.is_some())
    }

    // ─── Scheduler ──────────────────────────────────────────────────────

    /// Fires due delay continuations and expired condition waits for active campaigns.
    /// A failure on one journey is logged and counted, never propagated to the others.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut active: HashMap<Uuid, bool> = HashMap::new();
        let mut is_active = |campaign_id: Uuid| {
            *active.entry(campaign_id).or_insert_with(|| {
                self.store
                    .get_campaign(campaign_id)
                    .is_some_and(|c| c.status == CampaignStatus::Active)
            })
        };

        for journey in self.store.due_continuations(now) {
            if !is_active(journey.campaign_id) {
                continue;
            }
            match self.fire_continuation(journey.id, now) {
                Ok(true) => report.continuations_fired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(journey_id = %journey.id, error = %e, "Delay continuation failed");
                }
            }
        }

        for journey in self.store.expired_conditions(now) {
            if !is_active(journey.campaign_id) {
                continue;
            }
            match self.expire_condition(journey.id, now) {
                Ok(true) => report.conditions_timed_out += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(journey_id = %journey.id, error = %e, "Condition timeout failed");
                }
            }
        }

        let recovery = self.recover_stalled();
        report.stalled_recovered = recovery.stalled_recovered;
        report.errors += recovery.errors;

        if report != TickReport::default() {
            debug!(?report, "Journey tick");
        }
        report
    }

    /// Re-applies finished action results whose journey update never landed,
    /// as after a crash between the two writes. Such a journey is
    /// `in_progress` on its last action's node with no open action and no
    /// delay pending, while that action is already `completed` or `failed`.
    pub fn recover_stalled(&self) -> TickReport {
        let mut report = TickReport::default();
        let campaigns = self
            .store
            .campaigns_by_status(CampaignStatus::Active)
            .into_iter()
            .chain(self.store.campaigns_by_status(CampaignStatus::Paused));

        for campaign in campaigns {
            for journey in self.store.journeys_for_campaign(campaign.id) {
                let Some(action) = self.stalled_on(&journey) else {
                    continue;
                };
                warn!(
                    campaign_id = %journey.campaign_id,
                    lead_id = %journey.lead_id,
                    action_id = %action.id,
                    status = ?action.status,
                    "Replaying action result for stalled journey"
                );
                let replayed = match action.status {
                    ActionStatus::Completed => self.on_action_completed(&action),
                    _ => self.on_action_failed(&action),
                };
                match replayed {
                    Ok(()) => report.stalled_recovered += 1,
                    Err(e) => {
                        report.errors += 1;
                        error!(journey_id = %journey.id, error = %e, "Stalled journey not recovered");
                    }
                }
            }
        }
        report
    }

    fn stalled_on(&self, journey: &LeadJourney) -> Option<Action> {
        if journey.status != JourneyStatus::InProgress || journey.resume_at.is_some() {
            return None;
        }
        let action = self.store.get_action(*journey.history.last()?)?;
        let finished = matches!(action.status, ActionStatus::Completed | ActionStatus::Failed);
        if !finished || !is_current(journey, &action) {
            return None;
        }
        if self.store.open_action_for_journey(journey.id).is_some() {
            return None;
        }
        Some(action)
    }

    /// Moves a journey past its elapsed delay. Work after the delay is
    /// scheduled from the delay's due time, not from when the tick ran.
    pub fn fire_continuation(&self, journey_id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool> {
        let fired = self.mutate_journey(journey_id, |journey| {
            let due = match journey.resume_at {
                Some(due) if due <= now && journey.status == JourneyStatus::InProgress => due,
                _ => return Ok(Write::Unchanged),
            };
            let def = self.definition(journey.sequence_id)?;
            let campaign = self.campaign(journey.campaign_id)?;
            let node_id = journey.current_node_id.clone();

            journey.resume_at = None;
            journey.next_action_scheduled_for = None;
            debug!(journey_id = %journey.id, node_id = %node_id, due = %due, "Delay elapsed");
            if !self.move_next(journey, &def, &node_id)? {
                return Ok(Write::Commit(None));
            }
            let next = self.run(journey, &def, &campaign, due)?;
            Ok(Write::Commit(next))
        })?;
        Ok(fired.is_some())
    }

    /// Applies the configured timeout policy to an expired condition wait.
    pub fn expire_condition(&self, journey_id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool> {
        let expired = self.mutate_journey(journey_id, |journey| {
            let deadline = match journey.condition_deadline {
                Some(deadline) if deadline <= now && journey.status == JourneyStatus::Awaiting => {
                    deadline
                }
                _ => return Ok(Write::Unchanged),
            };
            info!(
                campaign_id = %journey.campaign_id,
                lead_id = %journey.lead_id,
                node_id = %journey.current_node_id,
                policy = ?self.config.on_condition_timeout,
                "Condition wait timed out"
            );

            match self.config.on_condition_timeout {
                ConditionTimeoutPolicy::Fail => {
                    self.finish(journey, JourneyStatus::Failed, Some(HaltReason::ConditionTimedOut))?;
                    Ok(Write::Commit(None))
                }
                ConditionTimeoutPolicy::NoBranch => {
                    let def = self.definition(journey.sequence_id)?;
                    let campaign = self.campaign(journey.campaign_id)?;
                    let next = self.take_branch(journey, &def, &campaign, Branch::No, deadline)?;
                    Ok(Write::Commit(next))
                }
            }
        })?;
        Ok(expired.is_some())
    }

    // ─── Lead events ────────────────────────────────────────────────────

    /// Records a channel-reported event about a lead and re-checks an awaiting
    /// condition. Repeated reports of the same fact are ignored.
    pub fn record_lead_event(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        event: LeadEvent,
    ) -> CampaignResult<LeadJourney> {
        let journey = self
            .store
            .journey_for_lead(campaign_id, lead_id)
            .ok_or_else(|| CampaignError::not_found("journey", format!("{campaign_id}/{lead_id}")))?;

        let now = self.clock.now();
        let updated = self.mutate_journey(journey.id, |journey| {
            if !self.evaluator.record_event(&mut journey.metrics, event) {
                return Ok(Write::Unchanged);
            }
            if journey.status != JourneyStatus::Awaiting {
                return Ok(Write::Commit(None));
            }

            let def = self.definition(journey.sequence_id)?;
            let kind = match def.node(&journey.current_node_id) {
                Some(Node::Condition { kind }) => *kind,
                _ => return Ok(Write::Commit(None)),
            };
            if !self.evaluator.evaluate(kind, &journey.metrics) {
                return Ok(Write::Commit(None));
            }
            let campaign = self.campaign(journey.campaign_id)?;
            let next = self.take_branch(journey, &def, &campaign, Branch::Yes, now)?;
            Ok(Write::Commit(next))
        })?;

        let Some(journey) = updated else {
            debug!(campaign_id = %campaign_id, lead_id = %lead_id, ?event, "Duplicate lead event ignored");
            return Ok(journey);
        };

        info!(campaign_id = %campaign_id, lead_id = %lead_id, ?event, status = ?journey.status, "Lead event recorded");
        let event_type = match event {
            LeadEvent::InviteAccepted => {
                self.bump_analytics(campaign_id, |a| a.invites_accepted += 1);
                Some(EventType::InviteAccepted)
            }
            LeadEvent::MessageReplied => {
                self.bump_analytics(campaign_id, |a| a.messages_replied += 1);
                Some(EventType::MessageReplied)
            }
            LeadEvent::MessageRead | LeadEvent::ProfileOpened => None,
        };
        if let Some(event_type) = event_type {
            notify(
                self.event_sink.as_ref(),
                make_event(
                    event_type,
                    campaign_id,
                    Some(lead_id),
                    serde_json::json!({ "journey_id": journey.id }),
                ),
            );
        }
        Ok(journey)
    }

    /// Removes a lead from outreach. A pending action is parked; one already
    /// in flight completes but no longer advances the journey.
    pub fn blacklist_lead(&self, campaign_id: Uuid, lead_id: Uuid) -> CampaignResult<LeadJourney> {
        let journey = self
            .store
            .journey_for_lead(campaign_id, lead_id)
            .ok_or_else(|| CampaignError::not_found("journey", format!("{campaign_id}/{lead_id}")))?;

        let now = self.clock.now();
        let updated = self.mutate_journey(journey.id, |journey| {
            if journey.status.is_terminal() {
                return Err(CampaignError::invalid_transition(
                    "journey",
                    journey.status,
                    JourneyStatus::Blacklisted,
                ));
            }
            let parked = self.park_pending_action(journey, now);
            self.finish(journey, JourneyStatus::Blacklisted, None)?;
            Ok(Write::Commit(parked))
        })?;
        let journey = updated.ok_or_else(|| CampaignError::not_found("journey", journey.id))?;

        info!(campaign_id = %campaign_id, lead_id = %lead_id, "Lead blacklisted");
        notify(
            self.event_sink.as_ref(),
            make_event(
                EventType::LeadBlacklisted,
                campaign_id,
                Some(lead_id),
                serde_json::json!({ "journey_id": journey.id }),
            ),
        );
        Ok(journey)
    }

    // ─── Campaign lifecycle ─────────────────────────────────────────────

    /// Parks every journey waiting on a pending action or a delay. In-flight
    /// actions and awaiting conditions are left alone.
    pub fn pause_campaign(&self, campaign_id: Uuid, paused_at: DateTime<Utc>) -> CampaignResult<usize> {
        let mut paused = 0;
        for journey in self.store.journeys_for_campaign(campaign_id) {
            if journey.status != JourneyStatus::InProgress {
                continue;
            }
            let result = self.mutate_journey(journey.id, |journey| {
                if journey.status != JourneyStatus::InProgress {
                    return Ok(Write::Unchanged);
                }
                let parked = self.park_pending_action(journey, paused_at);
                if parked.is_none() && journey.resume_at.is_none() {
                    return Ok(Write::Unchanged);
                }
                self.transition(journey, JourneyStatus::Paused)?;
                journey.paused_at = Some(paused_at);
                Ok(Write::Commit(parked))
            });
            match result {
                Ok(Some(_)) => paused += 1,
                Ok(None) => {}
                Err(e) => warn!(journey_id = %journey.id, error = %e, "Could not pause journey"),
            }
        }
        info!(campaign_id = %campaign_id, journeys = paused, "Campaign journeys paused");
        Ok(paused)
    }

    /// Returns paused journeys and their actions to work, shifting every
    /// schedule forward by the time spent paused.
    pub fn resume_campaign(
        &self,
        campaign_id: Uuid,
        paused_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CampaignResult<usize> {
        let pause = now - paused_at;
        let mut resumed = 0;
        for journey in self.store.journeys_for_campaign(campaign_id) {
            if !matches!(journey.status, JourneyStatus::Paused | JourneyStatus::Awaiting) {
                continue;
            }
            let result = self.mutate_journey(journey.id, |journey| match journey.status {
                JourneyStatus::Paused => {
                    let since = journey.paused_at.map_or(paused_at, |t| t.max(paused_at));
                    let offset = now - since;
                    shift(&mut journey.resume_at, offset);
                    shift(&mut journey.next_action_scheduled_for, offset);

                    let action = match journey.history.last() {
                        Some(id) => self.store.get_action(*id),
                        None => None,
                    };
                    let action = action
                        .filter(|a| a.status == ActionStatus::Paused)
                        .map(|mut a| {
                            a.status = ActionStatus::Pending;
                            a.scheduled_for = a.scheduled_for + offset;
                            a.updated_at = now;
                            a
                        });

                    self.transition(journey, JourneyStatus::InProgress)?;
                    journey.paused_at = None;
                    Ok(Write::Commit(action))
                }
                JourneyStatus::Awaiting if journey.condition_deadline.is_some() => {
                    shift(&mut journey.condition_deadline, pause);
                    Ok(Write::Commit(None))
                }
                _ => Ok(Write::Unchanged),
            });
            match result {
                Ok(Some(_)) => resumed += 1,
                Ok(None) => {}
                Err(e) => warn!(journey_id = %journey.id, error = %e, "Could not resume journey"),
            }
        }
        info!(
            campaign_id = %campaign_id,
            journeys = resumed,
            pause_secs = pause.num_seconds(),
            "Campaign journeys resumed"
        );
        Ok(resumed)
    }

    /// Forces every live journey to `failed` with `campaign_stopped`. Pending
    /// actions are parked for good.
    pub fn stop_campaign(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let now = self.clock.now();
        let mut stopped = 0;
        for journey in self.store.journeys_for_campaign(campaign_id) {
            if journey.status.is_terminal() {
                continue;
            }
            let result = self.mutate_journey(journey.id, |journey| {
                if journey.status.is_terminal() {
                    return Ok(Write::Unchanged);
                }
                let parked = self.park_pending_action(journey, now);
                self.finish(journey, JourneyStatus::Failed, Some(HaltReason::CampaignStopped))?;
                Ok(Write::Commit(parked))
            });
            match result {
                Ok(Some(_)) => stopped += 1,
                Ok(None) => {}
                Err(e) => error!(journey_id = %journey.id, error = %e, "Could not stop journey"),
            }
        }
        info!(campaign_id = %campaign_id, journeys = stopped, "Campaign journeys stopped");
        Ok(stopped)
    }

    /// Marks an active campaign `completed` once every journey is terminal.
    pub fn maybe_complete_campaign(&self, campaign_id: Uuid) -> CampaignResult<bool> {
        let campaign = self.campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Active {
            return Ok(false);
        }
        let journeys = self.store.journeys_for_campaign(campaign_id);
        if journeys.iter().any(|j| !j.status.is_terminal()) {
            return Ok(false);
        }

        let mut completed = false;
        self.update_campaign_with(campaign_id, |campaign| {
            completed = campaign.status == CampaignStatus::Active;
            if completed {
                campaign.status = CampaignStatus::Completed;
            }
            Ok(())
        })?;
        if completed {
            info!(campaign_id = %campaign_id, journeys = journeys.len(), "Campaign completed");
            notify(
                self.event_sink.as_ref(),
                make_event(
                    EventType::CampaignCompleted,
                    campaign_id,
                    None,
                    serde_json::json!({ "journeys": journeys.len() }),
                ),
            );
        }
        Ok(completed)
    }

    /// Puts a completed campaign back to `active` after journeys were reopened.
    pub fn reactivate_completed(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        let campaign = self.update_campaign_with(campaign_id, |campaign| {
            if campaign.status == CampaignStatus::Completed {
                campaign.status = CampaignStatus::Active;
            }
            Ok(())
        })?;
        info!(campaign_id = %campaign_id, status = ?campaign.status, "Campaign reactivated for retry");
        Ok(campaign)
    }

    /// Read-modify-write on a campaign, re-reading on revision conflicts.
    pub fn update_campaign_with<F>(&self, campaign_id: Uuid, mut mutate: F) -> CampaignResult<Campaign>
    where
        F: FnMut(&mut Campaign) -> CampaignResult<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut campaign = self.campaign(campaign_id)?;
            mutate(&mut campaign)?;
            campaign.updated_at = self.clock.now();
            match self.store.update_campaign(&mut campaign) {
                Ok(()) => return Ok(campaign),
                Err(StoreError::Conflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(campaign_id = %campaign_id, attempt, "Campaign write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn campaign(&self, campaign_id: Uuid) -> CampaignResult<Campaign> {
        self.store
            .get_campaign(campaign_id)
            .ok_or_else(|| CampaignError::not_found("campaign", campaign_id))
    }

    fn bump_analytics(&self, campaign_id: Uuid, bump: impl Fn(&mut CampaignAnalytics)) {
        let result = self.update_campaign_with(campaign_id, |campaign| {
            bump(&mut campaign.analytics);
            Ok(())
        });
        if let Err(e) = result {
            warn!(campaign_id = %campaign_id, error = %e, "Analytics update dropped");
        }
    }

    fn journey_lock(&self, journey_id: Uuid) -> Arc<Mutex<()>> {
        self.journey_locks.entry(journey_id).or_default().clone()
    }

    /// Serialized read-modify-write of one journey (plus at most one action).
    /// Returns the committed journey, or `None` when the mutation declined.
    fn mutate_journey<F>(&self, journey_id: Uuid, mut mutate: F) -> CampaignResult<Option<LeadJourney>>
    where
        F: FnMut(&mut LeadJourney) -> CampaignResult<Write>,
    {
        let lock = self.journey_lock(journey_id);
        let _guard = lock.lock();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut journey = self
                .store
                .get_journey(journey_id)
                .ok_or_else(|| CampaignError::not_found("journey", journey_id))?;
            let before = journey.status;

            let mut action = match mutate(&mut journey)? {
                Write::Unchanged => return Ok(None),
                Write::Commit(action) => action,
            };
            journey.updated_at = self.clock.now();
            match self.store.commit_journey(&mut journey, action.as_mut()) {
                Ok(()) => {
                    if journey.status.is_terminal() {
                        // Re-created on demand if a retry reopens the journey.
                        self.journey_locks.remove(&journey_id);
                    }
                    self.after_commit(before, &journey, true);
                    return Ok(Some(journey));
                }
                Err(StoreError::Conflict { .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(journey_id = %journey_id, attempt, "Journey write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Side effects of a journey reaching a terminal status.
    fn after_commit(&self, before: JourneyStatus, journey: &LeadJourney, check_completion: bool) {
        if before.is_terminal() || !journey.status.is_terminal() {
            return;
        }

        match (journey.status, journey.halt_reason) {
            (JourneyStatus::Completed, _) => {
                info!(
                    campaign_id = %journey.campaign_id,
                    lead_id = %journey.lead_id,
                    actions = journey.history.len(),
                    "Lead journey completed"
                );
                self.bump_analytics(journey.campaign_id, |a| a.journeys_completed += 1);
                notify(
                    self.event_sink.as_ref(),
                    make_event(
                        EventType::SequenceCompleted,
                        journey.campaign_id,
                        Some(journey.lead_id),
                        serde_json::json!({ "journey_id": journey.id }),
                    ),
                );
            }
            (JourneyStatus::Failed, Some(HaltReason::CampaignStopped)) => {}
            (JourneyStatus::Failed, _) => {
                self.bump_analytics(journey.campaign_id, |a| a.journeys_failed += 1);
            }
            _ => {}
        }

        if check_completion {
            if let Err(e) = self.maybe_complete_campaign(journey.campaign_id) {
                warn!(campaign_id = %journey.campaign_id, error = %e, "Completion check failed");
            }
        }
    }

    fn transition(&self, journey: &mut LeadJourney, to: JourneyStatus) -> CampaignResult<()> {
        let trigger = self.state_machine.check(journey.status, to)?;
        debug!(journey_id = %journey.id, from = ?journey.status, to = ?to, trigger, "Journey transition");
        journey.status = to;
        Ok(())
    }

    fn finish(
        &self,
        journey: &mut LeadJourney,
        status: JourneyStatus,
        halt_reason: Option<HaltReason>,
    ) -> CampaignResult<()> {
        self.transition(journey, status)?;
        journey.halt_reason = halt_reason;
        journey.next_action_scheduled_for = None;
        journey.resume_at = None;
        journey.condition_deadline = None;
        journey.paused_at = None;
        Ok(())
    }

    /// Parks the journey's not-yet-dispatched action, if it has one.
    fn park_pending_action(&self, journey: &LeadJourney, now: DateTime<Utc>) -> Option<Action> {
        let mut action = self.store.open_action_for_journey(journey.id)?;
        if action.status != ActionStatus::Pending {
            return None;
        }
        action.status = ActionStatus::Paused;
        action.updated_at = now;
        Some(action)
    }

    /// Moves to the node's sole successor. A node without one ends the
    /// journey as `completed`; returns whether there is more to run.
    fn move_next(&self, journey: &mut LeadJourney, def: &ValidDefinition, node_id: &str) -> CampaignResult<bool> {
        if def.node(node_id).is_none() {
            return Err(missing_node(def, node_id));
        }
        match def.next(node_id) {
            Some(next) => {
                journey.current_node_id = next.to_string();
                Ok(true)
            }
            None => {
                self.finish(journey, JourneyStatus::Completed, None)?;
                Ok(false)
            }
        }
    }

    /// Leaves an awaiting condition through one of its branches.
    fn take_branch(
        &self,
        journey: &mut LeadJourney,
        def: &ValidDefinition,
        campaign: &Campaign,
        branch: Branch,
        at: DateTime<Utc>,
    ) -> CampaignResult<Option<Action>> {
        let node_id = journey.current_node_id.clone();
        if def.node(&node_id).is_none() {
            return Err(missing_node(def, &node_id));
        }
        let target = def.branch(&node_id, branch).ok_or_else(|| {
            CampaignError::Configuration(format!("condition {node_id} has no {branch:?} branch"))
        })?;
        self.transition(journey, JourneyStatus::InProgress)?;
        journey.condition_deadline = None;
        journey.current_node_id = target.to_string();
        debug!(journey_id = %journey.id, node_id = %node_id, ?branch, "Condition resolved");
        self.run(journey, def, campaign, at)
    }

    /// Advances an `in_progress` journey from its current node until it
    /// suspends or ends. `at` is the time the current node was reached.
    fn run(
        &self,
        journey: &mut LeadJourney,
        def: &ValidDefinition,
        campaign: &Campaign,
        at: DateTime<Utc>,
    ) -> CampaignResult<Option<Action>> {
        let paused = campaign.status == CampaignStatus::Paused;

        // Acyclic, so every walk visits each node at most once.
        for _ in 0..=def.len() {
            let node_id = journey.current_node_id.clone();
            let node = def.node(&node_id).ok_or_else(|| missing_node(def, &node_id))?;

            match node {
                Node::Start => {
                    if !self.move_next(journey, def, &node_id)? {
                        return Ok(None);
                    }
                }
                Node::End => {
                    self.finish(journey, JourneyStatus::Completed, None)?;
                    return Ok(None);
                }
                Node::Delay(wait) => {
                    let due = delay::resolve(wait, at);
                    journey.resume_at = Some(due);
                    journey.next_action_scheduled_for = Some(due);
                    if paused {
                        self.transition(journey, JourneyStatus::Paused)?;
                        journey.paused_at = Some(self.clock.now());
                    }
                    debug!(journey_id = %journey.id, node_id = %node_id, due = %due, "Journey delayed");
                    return Ok(None);
                }
                Node::Condition { kind } => {
                    if self.evaluator.evaluate(*kind, &journey.metrics) {
                        let target = def.branch(&node_id, Branch::Yes).ok_or_else(|| {
                            CampaignError::Configuration(format!("condition {node_id} has no yes branch"))
                        })?;
                        journey.current_node_id = target.to_string();
                        continue;
                    }
                    self.transition(journey, JourneyStatus::Awaiting)?;
                    let timeout = Duration::hours(i64::from(self.config.condition_timeout_hours));
                    journey.condition_deadline = Some(at + timeout);
                    journey.next_action_scheduled_for = None;
                    debug!(journey_id = %journey.id, node_id = %node_id, ?kind, "Journey awaiting condition");
                    return Ok(None);
                }
                Node::SendInvite { .. }
                | Node::SendMessage { .. }
                | Node::ViewProfile
                | Node::EndorseSkills
                | Node::Follow
                | Node::LikePost
                | Node::FindEmail
                | Node::SendEmail { .. } => {
                    let action = self.schedule_action(journey, campaign, &node_id, node, at)?;
                    if paused {
                        self.transition(journey, JourneyStatus::Paused)?;
                        journey.paused_at = Some(action.created_at);
                    }
                    return Ok(Some(action));
                }
            }
        }

        Err(CampaignError::Internal(anyhow!(
            "journey {} did not settle within {} steps",
            journey.id,
            def.len()
        )))
    }

    fn schedule_action(
        &self,
        journey: &mut LeadJourney,
        campaign: &Campaign,
        node_id: &str,
        node: &Node,
        at: DateTime<Utc>,
    ) -> CampaignResult<Action> {
        let action_type = node.action_type().ok_or_else(|| {
            CampaignError::Configuration(format!("node {node_id} does not produce an action"))
        })?;
        let lead = self.store.get_lead(journey.lead_id);
        let data = personalize::action_data(node, lead.as_ref(), &mut rand::thread_rng());
        let now = self.clock.now();
        let status = if campaign.status == CampaignStatus::Paused {
            ActionStatus::Paused
        } else {
            ActionStatus::Pending
        };

        let action = Action {
            id: Uuid::new_v4(),
            campaign_id: journey.campaign_id,
            lead_id: journey.lead_id,
            journey_id: journey.id,
            sequence_id: journey.sequence_id,
            node_id: node_id.to_string(),
            action_type,
            status,
            data,
            result: None,
            scheduled_for: at,
            dispatched_at: None,
            executed_at: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            revision: 0,
        };
        journey.history.push(action.id);
        journey.next_action_scheduled_for = Some(at);

        info!(
            campaign_id = %journey.campaign_id,
            lead_id = %journey.lead_id,
            action_id = %action.id,
            node_id = %node_id,
            action_type = ?action_type,
            scheduled_for = %at,
            status = ?status,
            "Action scheduled"
        );
        Ok(action)
    }
}

/// Whether the action is the one the journey is currently suspended on.
fn is_current(journey: &LeadJourney, action: &Action) -> bool {
    journey.history.last() == Some(&action.id) && journey.current_node_id == action.node_id
}

fn missing_node(def: &ValidDefinition, node_id: &str) -> CampaignError {
    CampaignError::Configuration(format!(
        "node {node_id} is not part of sequence {} v{}",
        def.id(),
        def.version()
    ))
}

fn shift(at: &mut Option<DateTime<Utc>>, by: Duration) {
    if let Some(t) = at.as_mut() {
        *t = *t + by;
    }
}
