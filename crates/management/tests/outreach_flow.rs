//! End-to-end campaign flows: controller, journey engine and dispatcher over
//! an in-memory store with a manual clock and a scripted channel driver.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use campaign_core::config::{DispatcherConfig, EngineConfig};
use campaign_core::event_bus::{CaptureSink, EventType};
use campaign_core::sequence::{
    Branch, ConditionKind, Delay, Edge, MessageVariant, Node, SequenceDefinition, SequenceNode,
};
use campaign_core::store::OutreachStore;
use campaign_core::types::{
    ActionResult, ActionStatus, ActionType, Campaign, CampaignStatus, ChannelAccount,
    JourneyStatus, Lead, LeadEvent, LeadJourney, LeadList,
};
use campaign_core::{CampaignError, Clock, ManualClock, MemoryStore};
use campaign_delivery::{ActionDispatcher, ClaimOutcome, ScriptedDriver};
use campaign_journey::JourneyEngine;
use campaign_management::{reports, CampaignController};

struct Outreach {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    driver: Arc<ScriptedDriver>,
    events: Arc<CaptureSink>,
    controller: CampaignController,
}

fn t0() -> DateTime<Utc> {
    // Monday, 09:00 UTC.
    Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
}

fn wire(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Outreach {
    let events = Arc::new(CaptureSink::default());
    let driver = Arc::new(ScriptedDriver::new());
    let engine = Arc::new(
        JourneyEngine::new(store.clone(), clock.clone(), EngineConfig::default())
            .with_event_sink(events.clone()),
    );
    let dispatcher = Arc::new(ActionDispatcher::new(
        engine.clone(),
        driver.clone(),
        DispatcherConfig::default(),
    ));
    let controller = CampaignController::new(engine, dispatcher).with_event_sink(events.clone());
    Outreach {
        store,
        clock,
        driver,
        events,
        controller,
    }
}

fn outreach() -> Outreach {
    wire(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(t0())))
}

fn node(id: &str, node: Node) -> SequenceNode {
    SequenceNode { id: id.into(), node }
}

fn message() -> Node {
    Node::SendMessage {
        variants: vec![MessageVariant {
            body: "Thanks for connecting, {{first_name}}".into(),
            weight: 1,
        }],
    }
}

/// start → send_invite → delay(2 days) → send_message → end
fn invite_then_message() -> SequenceDefinition {
    SequenceDefinition::new(
        "invite then message",
        vec![
            node("start", Node::Start),
            node("invite", Node::SendInvite { message: "Hi {{first_name}}".into() }),
            node("wait", Node::Delay(Delay::days(2))),
            node("message", message()),
            node("end", Node::End),
        ],
        vec![
            Edge::new("start", "invite"),
            Edge::new("invite", "wait"),
            Edge::new("wait", "message"),
            Edge::new("message", "end"),
        ],
    )
}

/// start → send_invite → condition(invite_accepted) → yes: send_message, no: end
fn invite_then_condition() -> SequenceDefinition {
    SequenceDefinition::new(
        "invite then condition",
        vec![
            node("start", Node::Start),
            node("invite", Node::SendInvite { message: String::new() }),
            node("accepted", Node::Condition { kind: ConditionKind::InviteAccepted }),
            node("message", message()),
            node("end", Node::End),
            node("end_no", Node::End),
        ],
        vec![
            Edge::new("start", "invite"),
            Edge::new("invite", "accepted"),
            Edge::branch("accepted", "message", Branch::Yes),
            Edge::branch("accepted", "end_no", Branch::No),
            Edge::new("message", "end"),
        ],
    )
}

impl Outreach {
    fn campaign(&self, sequence: SequenceDefinition, leads: usize, daily_limit: Option<u32>) -> Campaign {
        let sequence = self.controller.save_sequence(sequence).unwrap();
        let mut account = ChannelAccount::new("sales");
        account.daily_limit = daily_limit;
        let account = self.controller.save_account(account);
        self.campaign_on(sequence.id, account.id, leads)
    }

    fn campaign_on(&self, sequence_id: Uuid, account_id: Uuid, leads: usize) -> Campaign {
        let leads = (0..leads)
            .map(|i| Lead::new(&format!("Lead{i}"), "Test", &format!("https://example.com/in/{i}")))
            .collect();
        let list = self.controller.add_lead_list(LeadList::new("list", leads));
        self.controller
            .create_campaign("outreach", sequence_id, account_id, vec![list.id])
            .unwrap()
    }

    fn journeys(&self, campaign: &Campaign) -> Vec<LeadJourney> {
        self.store.journeys_for_campaign(campaign.id)
    }

    fn only_journey(&self, campaign: &Campaign) -> LeadJourney {
        let mut journeys = self.journeys(campaign);
        assert_eq!(journeys.len(), 1);
        journeys.remove(0)
    }

    fn status(&self, campaign: &Campaign) -> CampaignStatus {
        self.store.get_campaign(campaign.id).unwrap().status
    }
}

#[tokio::test]
async fn test_invite_delay_message_completes() {
    let o = outreach();
    let campaign = o.campaign(invite_then_message(), 1, None);
    let report = o.controller.start(campaign.id).unwrap();
    assert_eq!(report.journeys_created, 1);

    let pending = o.store.actions_by_status(campaign.id, ActionStatus::Pending);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, ActionType::SendInvite);
    assert_eq!(pending[0].scheduled_for, t0());
    assert_eq!(pending[0].data.message.as_deref(), Some("Hi Lead0"));

    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 1);
    let journey = o.only_journey(&campaign);
    assert_eq!(journey.current_node_id, "wait");
    assert_eq!(journey.resume_at, Some(t0() + Duration::hours(48)));

    // Nothing fires before the delay elapses.
    o.clock.advance(Duration::hours(47));
    assert_eq!(o.controller.engine().tick(o.clock.now()).continuations_fired, 0);

    o.clock.set(t0() + Duration::hours(48));
    assert_eq!(o.controller.engine().tick(o.clock.now()).continuations_fired, 1);
    let pending = o.store.actions_by_status(campaign.id, ActionStatus::Pending);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, ActionType::SendMessage);

    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 1);
    let journey = o.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::Completed);
    assert_eq!(journey.history.len(), 2);
    assert_eq!(o.status(&campaign), CampaignStatus::Completed);
    assert_eq!(o.events.count_type(EventType::SequenceCompleted), 1);
    assert_eq!(o.events.count_type(EventType::CampaignCompleted), 1);
}

#[tokio::test]
async fn test_condition_awaits_then_takes_yes_branch() {
    let o = outreach();
    let campaign = o.campaign(invite_then_condition(), 1, None);
    o.controller.start(campaign.id).unwrap();
    o.controller.dispatcher().dispatch_due().await.unwrap();

    let journey = o.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::Awaiting);
    assert_eq!(journey.current_node_id, "accepted");
    assert!(journey.condition_deadline.is_some());

    let journey = o
        .controller
        .record_lead_event(campaign.id, journey.lead_id, LeadEvent::InviteAccepted)
        .unwrap();
    assert_eq!(journey.status, JourneyStatus::InProgress);
    assert_eq!(journey.current_node_id, "message");
    assert!(journey.metrics.invite_accepted);

    o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(o.only_journey(&campaign).status, JourneyStatus::Completed);
    let analytics = o.store.get_campaign(campaign.id).unwrap().analytics;
    assert_eq!(analytics.invites_accepted, 1);
    assert_eq!(analytics.messages_sent, 1);
}

#[tokio::test]
async fn test_failed_invite_retries_from_same_node() {
    let o = outreach();
    let campaign = o.campaign(invite_then_message(), 1, None);
    o.controller.start(campaign.id).unwrap();
    let lead_id = o.only_journey(&campaign).lead_id;

    o.driver.fail_lead(lead_id, "HTTP 500: upstream unavailable");
    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.failed, 1);

    let journey = o.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::Failed);
    assert_eq!(o.store.get_campaign(campaign.id).unwrap().analytics.actions_failed, 1);
    let grouped = reports::campaign_actions(o.store.as_ref(), campaign.id).unwrap();
    let error = grouped.failed[0].result.as_ref().and_then(|r| r.error.clone());
    assert_eq!(error.as_deref(), Some("HTTP 500: upstream unavailable"));

    o.driver.heal_lead(lead_id);
    assert_eq!(o.controller.retry_failed_actions(campaign.id).unwrap(), 1);
    let action = o.store.get_action(journey.history[0]).unwrap();
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.scheduled_for, t0() + Duration::seconds(300));
    assert_eq!(o.only_journey(&campaign).status, JourneyStatus::InProgress);

    // Not due until the backoff passes.
    assert_eq!(o.controller.dispatcher().dispatch_due().await.unwrap().dispatched, 0);
    o.clock.advance(Duration::minutes(5));
    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 1);

    let journey = o.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::InProgress);
    assert_eq!(journey.current_node_id, "wait");
    assert_eq!(journey.history.len(), 1);
}

#[tokio::test]
async fn test_one_failing_lead_does_not_halt_the_rest() {
    let o = outreach();
    let campaign = o.campaign(invite_then_message(), 3, None);
    o.controller.start(campaign.id).unwrap();
    let failing = o.journeys(&campaign)[0].lead_id;
    o.driver.fail_lead(failing, "profile unavailable");

    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(o.status(&campaign), CampaignStatus::Active);

    let stats = reports::action_stats(o.store.as_ref(), campaign.id).unwrap();
    assert_eq!(stats.failed, 1);
    assert!(stats.warning.is_some());
    assert_eq!(stats.journeys.in_progress, 2);
    assert_eq!(stats.journeys.failed, 1);
}

#[tokio::test]
async fn test_retry_with_nothing_failed_is_a_no_op() {
    let o = outreach();
    let campaign = o.campaign(invite_then_message(), 2, None);
    o.controller.start(campaign.id).unwrap();

    assert_eq!(o.controller.retry_failed_actions(campaign.id).unwrap(), 0);
    assert_eq!(o.controller.retry_failed_actions(campaign.id).unwrap(), 0);
    assert_eq!(o.store.actions_by_status(campaign.id, ActionStatus::Pending).len(), 2);
}

#[tokio::test]
async fn test_pause_resume_shifts_schedule_by_pause_length() {
    let o = outreach();
    let campaign = o.campaign(invite_then_message(), 2, None);
    o.controller.start(campaign.id).unwrap();

    // First lead moves on to its delay; second keeps a pending invite.
    let second = o.journeys(&campaign)[1].lead_id;
    let first_action = o
        .store
        .actions_by_status(campaign.id, ActionStatus::Pending)
        .into_iter()
        .find(|a| a.lead_id != second)
        .unwrap();
    o.controller.dispatcher().claim(first_action.id).unwrap();
    o.controller
        .dispatcher()
        .report_result(first_action.id, ActionResult::ok(serde_json::json!({})))
        .unwrap();
    let delayed = o.store.get_journey(first_action.journey_id).unwrap();
    let resume_at = delayed.resume_at.unwrap();

    o.clock.advance(Duration::hours(1));
    o.controller.pause(campaign.id).unwrap();
    let parked = o.store.actions_by_status(campaign.id, ActionStatus::Paused);
    assert_eq!(parked.len(), 1);
    let scheduled_before = parked[0].scheduled_for;

    // Nothing goes out while paused, even once due.
    o.clock.advance(Duration::hours(30));
    assert_eq!(o.controller.dispatcher().dispatch_due().await.unwrap().dispatched, 0);
    assert_eq!(o.controller.engine().tick(o.clock.now()).continuations_fired, 0);

    let report = o.controller.start(campaign.id).unwrap();
    assert_eq!(report.journeys_resumed, 2);
    assert_eq!(report.journeys_created, 0);

    let action = o.store.get_action(parked[0].id).unwrap();
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.scheduled_for, scheduled_before + Duration::hours(30));
    let delayed = o.store.get_journey(first_action.journey_id).unwrap();
    assert_eq!(delayed.status, JourneyStatus::InProgress);
    assert_eq!(delayed.resume_at, Some(resume_at + Duration::hours(30)));
}

#[tokio::test]
async fn test_account_quota_defers_and_blocks_start() {
    let o = outreach();
    let first = o.campaign(invite_then_message(), 2, Some(1));
    o.controller.start(first.id).unwrap();

    let report = o.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred_quota, 1);
    assert_eq!(o.store.actions_by_status(first.id, ActionStatus::Pending).len(), 1);
    assert!(o.store.actions_by_status(first.id, ActionStatus::Failed).is_empty());

    let second = o.campaign_on(first.sequence_id, first.channel_account_id, 1);
    assert!(matches!(
        o.controller.start(second.id),
        Err(CampaignError::QuotaExceeded { .. })
    ));

    o.clock.advance(Duration::days(1));
    o.controller.start(second.id).unwrap();
}

#[tokio::test]
async fn test_start_rejects_sequence_that_no_longer_validates() {
    let o = outreach();
    let campaign = o.campaign(invite_then_condition(), 1, None);

    let mut sequence = o.store.get_sequence(campaign.sequence_id).unwrap();
    sequence.edges.retain(|e| e.branch != Some(Branch::No));
    o.store.save_sequence(sequence);

    assert!(matches!(
        o.controller.start(campaign.id),
        Err(CampaignError::GraphValidation(_))
    ));
    assert_eq!(o.status(&campaign), CampaignStatus::Draft);
    assert!(o.journeys(&campaign).is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let before = wire(store.clone(), clock.clone());
    let campaign = before.campaign(invite_then_message(), 1, None);
    before.controller.start(campaign.id).unwrap();
    before.controller.dispatcher().dispatch_due().await.unwrap();
    drop(before);

    let after = wire(store, clock);
    assert_eq!(after.controller.restore(), 1);
    after.clock.advance(Duration::hours(48));
    assert_eq!(after.controller.engine().tick(after.clock.now()).continuations_fired, 1);
    let report = after.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(after.only_journey(&campaign).status, JourneyStatus::Completed);
}

#[tokio::test]
async fn test_restart_after_result_write_finishes_the_journey() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let before = wire(store.clone(), clock.clone());
    let campaign = before.campaign(invite_then_message(), 1, None);
    before.controller.start(campaign.id).unwrap();
    let invite = store.due_actions(clock.now()).remove(0);
    let ClaimOutcome::Claimed(mut invite) =
        before.controller.dispatcher().claim(invite.id).unwrap()
    else {
        panic!("expected a claim");
    };
    // Process dies after recording the outcome, before advancing the journey.
    invite.status = ActionStatus::Completed;
    invite.result = Some(ActionResult::ok(serde_json::json!({})));
    store.update_action(&mut invite).unwrap();
    drop(before);

    let after = wire(store, clock);
    assert_eq!(after.controller.restore(), 1);
    let journey = after.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::InProgress);
    assert_eq!(journey.resume_at, Some(t0() + Duration::hours(48)));

    after.clock.advance(Duration::hours(48));
    after.controller.engine().tick(after.clock.now());
    let report = after.controller.dispatcher().dispatch_due().await.unwrap();
    assert_eq!(report.completed, 1);
    let journey = after.only_journey(&campaign);
    assert_eq!(journey.status, JourneyStatus::Completed);
    assert_eq!(journey.history.len(), 2);
    assert!(journey.metrics.invite_sent);
}
