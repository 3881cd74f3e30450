use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campaign_core::config::DispatcherConfig;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::store::OutreachStore;
use campaign_core::types::{
    Action, ActionResult, ActionStatus, Campaign, CampaignStatus, ChannelAccount, JourneyStatus,
};
use campaign_core::Clock;
use campaign_journey::JourneyEngine;

use crate::channel::ChannelDriver;
use crate::quota::{local_day, QuotaKey, QuotaLedger};
use crate::working_hours;

/// Error recorded on actions whose driver call never reported back.
pub const INTERRUPTED_ERROR: &str = "interrupted: outcome unknown";

/// Result of trying to move one pending action to `in_progress`.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Action),
    /// Not due, already taken, or its campaign or journey is not running.
    NotDispatchable,
    DeferredQuota,
    DeferredWorkingHours,
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred_quota: usize,
    pub deferred_hours: usize,
    pub skipped: usize,
}

/// Hands due actions to the channel driver and feeds results back to the engine.
///
/// An action is claimed by a revision-checked `pending -> in_progress` write
/// after one unit of daily quota has been taken, so concurrent dispatchers
/// neither double-send nor overshoot a shared budget. Deferred actions stay
/// `pending` and are picked up by a later pass.
pub struct ActionDispatcher {
    store: Arc<dyn OutreachStore>,
    engine: Arc<JourneyEngine>,
    driver: Arc<dyn ChannelDriver>,
    quota: QuotaLedger,
    pruned_before: Mutex<Option<NaiveDate>>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("config", &self.config)
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new(
        engine: Arc<JourneyEngine>,
        driver: Arc<dyn ChannelDriver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store: engine.store().clone(),
            clock: engine.clock().clone(),
            quota: QuotaLedger::new(config.quota_scope, config.default_daily_limit),
            pruned_before: Mutex::new(None),
            engine,
            driver,
            config,
        }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    /// Claims every due action it may, executes the claims concurrently and
    /// records each result as it arrives.
    pub async fn dispatch_due(&self) -> CampaignResult<DispatchReport> {
        let now = self.clock.now();
        self.prune_quota(now);
        let mut report = DispatchReport::default();
        let mut campaigns: HashMap<Uuid, Option<Campaign>> = HashMap::new();
        let mut claimed = Vec::new();

        for action in self.store.due_actions(now) {
            let campaign = campaigns
                .entry(action.campaign_id)
                .or_insert_with(|| self.store.get_campaign(action.campaign_id))
                .clone();
            match self.claim_action(action, campaign.as_ref(), now) {
                ClaimOutcome::Claimed(action) => claimed.push(action),
                ClaimOutcome::NotDispatchable => report.skipped += 1,
                ClaimOutcome::DeferredQuota => report.deferred_quota += 1,
                ClaimOutcome::DeferredWorkingHours => report.deferred_hours += 1,
            }
        }
        report.dispatched = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }

        let concurrency = self.config.max_concurrent_dispatches.max(1);
        let mut results = stream::iter(claimed)
            .map(|action| async move {
                let result = self.driver.execute(&action).await;
                (action, result)
            })
            .buffer_unordered(concurrency);

        while let Some((action, result)) = results.next().await {
            let action_id = action.id;
            match self.record_result(action, result) {
                Ok(ActionStatus::Completed) => report.completed += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    error!(action_id = %action_id, error = %e, "Could not record action result");
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            deferred_quota = report.deferred_quota,
            deferred_hours = report.deferred_hours,
            "Dispatch pass finished"
        );
        Ok(report)
    }

    /// Claims one action for an external driver that executes on its own and
    /// reports back through [`ActionDispatcher::report_result`].
    pub fn claim(&self, action_id: Uuid) -> CampaignResult<ClaimOutcome> {
        let action = self
            .store
            .get_action(action_id)
            .ok_or_else(|| CampaignError::not_found("action", action_id))?;
        let campaign = self.store.get_campaign(action.campaign_id);
        Ok(self.claim_action(action, campaign.as_ref(), self.clock.now()))
    }

    /// Records the driver's answer for an in-flight action.
    pub fn report_result(&self, action_id: Uuid, result: ActionResult) -> CampaignResult<Action> {
        let action = self
            .store
            .get_action(action_id)
            .ok_or_else(|| CampaignError::not_found("action", action_id))?;
        if action.status != ActionStatus::InProgress {
            return Err(CampaignError::invalid_transition(
                "action",
                action.status,
                if result.success {
                    ActionStatus::Completed
                } else {
                    ActionStatus::Failed
                },
            ));
        }
        self.record_result(action, result)?;
        self.store
            .get_action(action_id)
            .ok_or_else(|| CampaignError::not_found("action", action_id))
    }

    /// Fails actions stuck `in_progress` past the in-flight timeout. Their
    /// outcome is unknown, so they are never replayed automatically.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> CampaignResult<usize> {
        let timeout = seconds(self.config.in_flight_timeout_secs);
        let mut recovered = 0;

        for mut action in self.store.in_flight_actions() {
            let stale = action
                .dispatched_at
                .map_or(true, |t| now.signed_duration_since(t) >= timeout);
            if !stale {
                continue;
            }
            action.status = ActionStatus::Failed;
            action.result = Some(ActionResult::failed(INTERRUPTED_ERROR));
            action.updated_at = now;
            if let Err(e) = self.store.update_action(&mut action) {
                debug!(action_id = %action.id, error = %e, "In-flight action resolved concurrently");
                continue;
            }

            warn!(
                campaign_id = %action.campaign_id,
                action_id = %action.id,
                dispatched_at = ?action.dispatched_at,
                "Interrupted action marked failed"
            );
            metrics::counter!("outreach.actions.interrupted").increment(1);
            if let Err(e) = self.engine.on_action_failed(&action) {
                error!(action_id = %action.id, error = %e, "Journey not halted for interrupted action");
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Operator retry: every failed action of the campaign goes back to
    /// `pending` after a backoff that grows with its attempt count. Returns how
    /// many were modified; zero failed actions is a no-op returning 0.
    pub fn retry_failed_actions(&self, campaign_id: Uuid) -> CampaignResult<usize> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .ok_or_else(|| CampaignError::not_found("campaign", campaign_id))?;
        if campaign.status == CampaignStatus::Stopped {
            return Err(CampaignError::InvalidTransition {
                entity: "campaign",
                from: format!("{:?}", campaign.status),
                to: "retry".to_string(),
            });
        }

        let failed = self.store.actions_by_status(campaign_id, ActionStatus::Failed);
        if failed.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now();
        let mut modified = 0;
        for action in &failed {
            let scheduled_for = now + self.backoff(action.attempts);
            match self.engine.reopen_for_retry(action.id, scheduled_for) {
                Ok(true) => modified += 1,
                Ok(false) => {
                    debug!(action_id = %action.id, "Failed action not reopened; its journey has moved on");
                }
                Err(e) => warn!(action_id = %action.id, error = %e, "Retry failed for action"),
            }
        }

        if modified > 0 && campaign.status == CampaignStatus::Completed {
            self.engine.reactivate_completed(campaign_id)?;
        }
        metrics::counter!("outreach.actions.retried").increment(modified as u64);
        info!(
            campaign_id = %campaign_id,
            failed = failed.len(),
            modified,
            "Failed actions retried"
        );
        Ok(modified)
    }

    /// Units left today in the budget this campaign draws from.
    pub fn quota_remaining(&self, campaign: &Campaign) -> u32 {
        let account = self.store.get_account(campaign.channel_account_id);
        let offset = account.as_ref().map_or(0, |a| a.utc_offset_minutes);
        let (day, day_start) = local_day(offset, self.clock.now());
        let key = self.quota.key(campaign);
        let limit = self.quota.limit(account.as_ref());
        self.quota
            .remaining(key, day, limit, || self.used_since(key, day_start))
    }

    /// `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let secs = self
            .config
            .retry_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.config.retry_backoff_max_secs);
        seconds(secs)
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn claim_action(
        &self,
        mut action: Action,
        campaign: Option<&Campaign>,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        if action.status != ActionStatus::Pending || action.scheduled_for > now {
            return ClaimOutcome::NotDispatchable;
        }
        let Some(campaign) = campaign.filter(|c| c.status == CampaignStatus::Active) else {
            debug!(action_id = %action.id, "Campaign not active, action held");
            return ClaimOutcome::NotDispatchable;
        };
        let journey_running = self
            .store
            .get_journey(action.journey_id)
            .is_some_and(|j| j.status == JourneyStatus::InProgress);
        if !journey_running {
            return ClaimOutcome::NotDispatchable;
        }

        let account: Option<ChannelAccount> = self.store.get_account(campaign.channel_account_id);
        let offset = account.as_ref().map_or(0, |a| a.utc_offset_minutes);
        if let Some(hours) = account.as_ref().and_then(|a| a.working_hours.as_ref()) {
            if !working_hours::is_open(hours, offset, now) {
                debug!(action_id = %action.id, account_id = %campaign.channel_account_id, "Outside working hours, action deferred");
                metrics::counter!("outreach.actions.deferred", "reason" => "working_hours").increment(1);
                return ClaimOutcome::DeferredWorkingHours;
            }
        }

        let (day, day_start) = local_day(offset, now);
        let key = self.quota.key(campaign);
        let limit = self.quota.limit(account.as_ref());
        if !self
            .quota
            .try_acquire(key, day, limit, || self.used_since(key, day_start))
        {
            debug!(action_id = %action.id, ?key, limit, "Daily quota exhausted, action deferred");
            metrics::counter!("outreach.actions.deferred", "reason" => "quota").increment(1);
            return ClaimOutcome::DeferredQuota;
        }

        // A pause or stop may have landed since the pass read the campaign.
        let still_active = self
            .store
            .get_campaign(campaign.id)
            .is_some_and(|c| c.status == CampaignStatus::Active);
        if !still_active {
            self.quota.release(key, day);
            debug!(action_id = %action.id, "Campaign left active mid-pass, action held");
            return ClaimOutcome::NotDispatchable;
        }

        action.status = ActionStatus::InProgress;
        action.dispatched_at = Some(now);
        action.attempts += 1;
        action.updated_at = now;
        match self.store.update_action(&mut action) {
            Ok(()) => {
                info!(
                    campaign_id = %action.campaign_id,
                    lead_id = %action.lead_id,
                    action_id = %action.id,
                    action_type = ?action.action_type,
                    attempt = action.attempts,
                    "Action dispatched"
                );
                metrics::counter!("outreach.actions.dispatched").increment(1);
                ClaimOutcome::Claimed(action)
            }
            Err(e) => {
                self.quota.release(key, day);
                debug!(action_id = %action.id, error = %e, "Action claimed elsewhere");
                ClaimOutcome::NotDispatchable
            }
        }
    }

    /// Drops quota counters once the day rolls over. Account-local days sit
    /// within one day of UTC, so yesterday's UTC date is kept.
    fn prune_quota(&self, now: DateTime<Utc>) {
        let cutoff = (now - Duration::days(1)).date_naive();
        let mut pruned_before = self.pruned_before.lock();
        if *pruned_before == Some(cutoff) {
            return;
        }
        self.quota.prune_before(cutoff);
        *pruned_before = Some(cutoff);
        debug!(%cutoff, counters = self.quota.counters(), "Quota counters pruned");
    }

    fn used_since(&self, key: QuotaKey, since: DateTime<Utc>) -> u32 {
        match key {
            QuotaKey::Account(account_id) => {
                let campaigns = self.store.campaigns_for_account(account_id);
                self.store.count_dispatched_since(&campaigns, since)
            }
            QuotaKey::Campaign(campaign_id) => {
                self.store.count_dispatched_since(&[campaign_id], since)
            }
        }
    }

    fn record_result(&self, mut action: Action, result: ActionResult) -> CampaignResult<ActionStatus> {
        let now = self.clock.now();
        let success = result.success;
        action.status = if success {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        action.result = Some(result);
        action.executed_at = Some(now);
        action.updated_at = now;
        self.store.update_action(&mut action)?;

        if success {
            metrics::counter!("outreach.actions.completed").increment(1);
            debug!(action_id = %action.id, "Action completed");
            self.engine.on_action_completed(&action)?;
        } else {
            let error = action
                .result
                .as_ref()
                .and_then(|r| r.error.as_deref())
                .unwrap_or_default();
            metrics::counter!("outreach.actions.failed").increment(1);
            warn!(
                campaign_id = %action.campaign_id,
                lead_id = %action.lead_id,
                action_id = %action.id,
                error = %CampaignError::ChannelExecution(error.to_string()),
                "Action failed"
            );
            self.engine.on_action_failed(&action)?;
        }
        Ok(action.status)
    }
}

/// Config seconds as a `Duration`, saturating far beyond any sane setting.
fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::from(u32::try_from(value).unwrap_or(u32::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedDriver;
    use campaign_core::config::{EngineConfig, QuotaScope};
    use campaign_core::sequence::{Edge, Node, SequenceDefinition, SequenceNode};
    use campaign_core::types::{Lead, LeadList, WorkingHours};
    use campaign_core::{ManualClock, MemoryStore};
    use chrono::{NaiveTime, TimeZone};

    struct Setup {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        engine: Arc<JourneyEngine>,
        driver: Arc<ScriptedDriver>,
        dispatcher: ActionDispatcher,
        account: ChannelAccount,
        sequence_id: Uuid,
    }

    fn sequence() -> SequenceDefinition {
        SequenceDefinition::new(
            "visit",
            vec![
                SequenceNode { id: "start".into(), node: Node::Start },
                SequenceNode { id: "visit".into(), node: Node::ViewProfile },
                SequenceNode { id: "end".into(), node: Node::End },
            ],
            vec![Edge::new("start", "visit"), Edge::new("visit", "end")],
        )
    }

    fn setup(config: DispatcherConfig, account: ChannelAccount) -> Setup {
        let store = Arc::new(MemoryStore::new());
        // Monday, 10:00 UTC.
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap()));
        let engine = Arc::new(JourneyEngine::new(
            store.clone(),
            clock.clone(),
            EngineConfig::default(),
        ));
        let driver = Arc::new(ScriptedDriver::new());
        let dispatcher = ActionDispatcher::new(engine.clone(), driver.clone(), config);
        let sequence = sequence();
        let sequence_id = sequence.id;
        store.save_account(account.clone());
        store.save_sequence(sequence);
        Setup {
            store,
            clock,
            engine,
            driver,
            dispatcher,
            account,
            sequence_id,
        }
    }

    impl Setup {
        /// An active campaign on the shared account with `leads` enrolled.
        fn campaign(&self, leads: usize) -> Campaign {
            let leads: Vec<Lead> = (0..leads)
                .map(|i| Lead::new(&format!("Lead{i}"), "Test", &format!("https://example.com/in/{i}")))
                .collect();
            let list = LeadList::new("list", leads.clone());
            let mut campaign = Campaign::new("c", self.sequence_id, self.account.id, vec![list.id]);
            campaign.status = CampaignStatus::Active;
            self.store.save_lead_list(list);
            self.store.insert_campaign(campaign.clone()).unwrap();
            for lead in &leads {
                self.engine.enroll_lead(&campaign, lead.id).unwrap();
            }
            campaign
        }
    }

    fn account(limit: u32) -> ChannelAccount {
        let mut account = ChannelAccount::new("sales");
        account.daily_limit = Some(limit);
        account
    }

    #[tokio::test]
    async fn test_dispatch_completes_journeys() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(3);

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.completed, 3);
        assert_eq!(s.driver.call_count(), 3);

        for journey in s.store.journeys_for_campaign(campaign.id) {
            assert_eq!(journey.status, JourneyStatus::Completed);
        }
        let campaign = s.store.get_campaign(campaign.id).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.analytics.actions_completed, 3);

        let again = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(again, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_quota_defers_without_failing() {
        let s = setup(DispatcherConfig::default(), account(2));
        let campaign = s.campaign(3);

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.deferred_quota, 1);
        let pending = s.store.actions_by_status(campaign.id, ActionStatus::Pending);
        assert_eq!(pending.len(), 1);
        assert!(s.store.actions_by_status(campaign.id, ActionStatus::Failed).is_empty());

        // Next local day the budget resets.
        s.clock.advance(Duration::days(1));
        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.deferred_quota, 0);
    }

    #[tokio::test]
    async fn test_account_quota_is_shared_across_campaigns() {
        let s = setup(DispatcherConfig::default(), account(3));
        let first = s.campaign(2);
        let second = s.campaign(2);

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.deferred_quota, 1);
        let left = s.store.actions_by_status(first.id, ActionStatus::Pending).len()
            + s.store.actions_by_status(second.id, ActionStatus::Pending).len();
        assert_eq!(left, 1);
        assert_eq!(s.dispatcher.quota_remaining(&first), 0);
    }

    #[tokio::test]
    async fn test_campaign_quota_scope() {
        let config = DispatcherConfig {
            quota_scope: QuotaScope::Campaign,
            ..DispatcherConfig::default()
        };
        let s = setup(config, account(3));
        s.campaign(2);
        s.campaign(2);

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched, 4);
        assert_eq!(report.deferred_quota, 0);
    }

    #[tokio::test]
    async fn test_quota_survives_restart() {
        let s = setup(DispatcherConfig::default(), account(2));
        let campaign = s.campaign(3);
        s.dispatcher.dispatch_due().await.unwrap();

        // A fresh dispatcher seeds today's usage from dispatch history.
        let restarted = ActionDispatcher::new(s.engine.clone(), s.driver.clone(), DispatcherConfig::default());
        assert_eq!(restarted.quota_remaining(&campaign), 0);
        let report = restarted.dispatch_due().await.unwrap();
        assert_eq!(report.deferred_quota, 1);
    }

    #[tokio::test]
    async fn test_working_hours_defer() {
        let mut acct = account(10);
        acct.working_hours = Some(WorkingHours {
            start: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            days: vec![],
        });
        let s = setup(DispatcherConfig::default(), acct);
        s.campaign(1);

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.deferred_hours, 1);
        assert_eq!(s.driver.call_count(), 0);

        s.clock.advance(Duration::hours(3));
        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn test_paused_campaign_is_not_dispatched() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(1);
        s.engine
            .update_campaign_with(campaign.id, |c| {
                c.status = CampaignStatus::Paused;
                Ok(())
            })
            .unwrap();

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_failure_isolated_and_retry_is_idempotent() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(2);
        let journeys = s.store.journeys_for_campaign(campaign.id);
        let unlucky = journeys[0].lead_id;
        s.driver.fail_lead(unlucky, "profile unavailable");

        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);

        let failed = s.store.actions_by_status(campaign.id, ActionStatus::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].result.as_ref().unwrap().error.as_deref(),
            Some("profile unavailable")
        );
        let campaign_now = s.store.get_campaign(campaign.id).unwrap();
        assert_eq!(campaign_now.analytics.actions_failed, 1);
        assert_eq!(campaign_now.status, CampaignStatus::Completed);

        s.driver.heal_lead(unlucky);
        let now = s.clock.now();
        assert_eq!(s.dispatcher.retry_failed_actions(campaign.id).unwrap(), 1);
        let retried = s.store.get_action(failed[0].id).unwrap();
        assert_eq!(retried.status, ActionStatus::Pending);
        assert_eq!(retried.scheduled_for, now + Duration::seconds(300));
        assert_eq!(
            s.store.get_campaign(campaign.id).unwrap().status,
            CampaignStatus::Active
        );

        // Nothing failed any more: repeated calls are no-ops.
        assert_eq!(s.dispatcher.retry_failed_actions(campaign.id).unwrap(), 0);
        assert_eq!(s.dispatcher.retry_failed_actions(campaign.id).unwrap(), 0);

        s.clock.advance(Duration::minutes(5));
        let report = s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.completed, 1);
        let action = s.store.get_action(failed[0].id).unwrap();
        assert_eq!(action.attempts, 2);
        assert_eq!(
            s.store.get_campaign(campaign.id).unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_retry_on_stopped_campaign_rejected() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(1);
        s.engine
            .update_campaign_with(campaign.id, |c| {
                c.status = CampaignStatus::Stopped;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            s.dispatcher.retry_failed_actions(campaign.id),
            Err(CampaignError::InvalidTransition { entity: "campaign", .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_stale_claims() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(1);
        let action = s.store.due_actions(s.clock.now()).remove(0);

        let ClaimOutcome::Claimed(claimed) = s.dispatcher.claim(action.id).unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(claimed.status, ActionStatus::InProgress);
        assert!(matches!(
            s.dispatcher.claim(action.id).unwrap(),
            ClaimOutcome::NotDispatchable
        ));

        assert_eq!(s.dispatcher.recover_interrupted(s.clock.now()).unwrap(), 0);
        let later = s.clock.advance(Duration::minutes(16));
        assert_eq!(s.dispatcher.recover_interrupted(later).unwrap(), 1);

        let action = s.store.get_action(action.id).unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(
            action.result.unwrap().error.as_deref(),
            Some(INTERRUPTED_ERROR)
        );
        let journey = s.store.journeys_for_campaign(campaign.id).remove(0);
        assert_eq!(journey.status, JourneyStatus::Failed);

        // The late report is rejected.
        assert!(s
            .dispatcher
            .report_result(action.id, ActionResult::ok(serde_json::json!({})))
            .is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let engine = Arc::new(JourneyEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
            EngineConfig::default(),
        ));
        let dispatcher = ActionDispatcher::new(engine, Arc::new(ScriptedDriver::new()), DispatcherConfig::default());
        assert_eq!(dispatcher.backoff(0), Duration::seconds(300));
        assert_eq!(dispatcher.backoff(1), Duration::seconds(300));
        assert_eq!(dispatcher.backoff(2), Duration::seconds(600));
        assert_eq!(dispatcher.backoff(4), Duration::seconds(2400));
        assert_eq!(dispatcher.backoff(5), Duration::seconds(3600));
        assert_eq!(dispatcher.backoff(40), Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_result_persisted_before_crash_is_applied_after_restart() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(1);
        let action = s.store.due_actions(s.clock.now()).remove(0);
        let ClaimOutcome::Claimed(mut action) = s.dispatcher.claim(action.id).unwrap() else {
            panic!("expected a claim");
        };
        // The outcome lands; the journey write never does.
        action.status = ActionStatus::Completed;
        action.result = Some(ActionResult::ok(serde_json::json!({})));
        s.store.update_action(&mut action).unwrap();

        let engine = Arc::new(JourneyEngine::new(
            s.store.clone(),
            s.clock.clone(),
            EngineConfig::default(),
        ));
        let dispatcher = ActionDispatcher::new(engine.clone(), s.driver.clone(), DispatcherConfig::default());
        let report = engine.tick(s.clock.now());
        assert_eq!(report.stalled_recovered, 1);
        assert_eq!(dispatcher.recover_interrupted(s.clock.now()).unwrap(), 0);

        let journey = s.store.journeys_for_campaign(campaign.id).remove(0);
        assert_eq!(journey.status, JourneyStatus::Completed);
        assert_eq!(journey.current_node_id, "end");
        let campaign = s.store.get_campaign(campaign.id).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.analytics.actions_completed, 1);
        assert_eq!(s.driver.call_count(), 0);
    }

    #[test]
    fn test_claim_rechecks_campaign_status() {
        let s = setup(DispatcherConfig::default(), account(10));
        let campaign = s.campaign(1);
        let snapshot = s.store.get_campaign(campaign.id).unwrap();
        s.engine
            .update_campaign_with(campaign.id, |c| {
                c.status = CampaignStatus::Paused;
                Ok(())
            })
            .unwrap();

        let now = s.clock.now();
        let action = s.store.due_actions(now).remove(0);
        assert!(matches!(
            s.dispatcher.claim_action(action.clone(), Some(&snapshot), now),
            ClaimOutcome::NotDispatchable
        ));
        assert_eq!(s.store.get_action(action.id).unwrap().status, ActionStatus::Pending);
        assert_eq!(s.dispatcher.quota_remaining(&snapshot), 10);
    }

    #[tokio::test]
    async fn test_day_rollover_prunes_quota_counters() {
        let s = setup(DispatcherConfig::default(), account(10));
        s.campaign(1);
        s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(s.dispatcher.quota().counters(), 1);

        s.clock.advance(Duration::days(2));
        s.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(s.dispatcher.quota().counters(), 0);
    }
}
