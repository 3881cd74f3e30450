//! Lifecycle notifications: the webhook/notification collaborator.
//!
//! Modules accept an `Arc<dyn EventSink>` and emit best-effort: a failing sink
//! is logged and never turned into an engine error.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CampaignStarted,
    CampaignPaused,
    CampaignStopped,
    CampaignCompleted,
    JourneyStarted,
    ActionCompleted,
    ActionFailed,
    InviteAccepted,
    MessageReplied,
    LeadBlacklisted,
    SequenceCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutreachEvent) -> anyhow::Result<()>;
}

/// Emit and swallow: delivery failures are logged, never propagated.
pub fn notify(sink: &dyn EventSink, event: OutreachEvent) {
    let event_type = event.event_type;
    let campaign_id = event.campaign_id;
    if let Err(e) = sink.emit(event) {
        warn!(?event_type, campaign_id = %campaign_id, error = %e, "Webhook emission failed");
    }
}

/// No-op sink for tests and deployments without webhooks.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: OutreachEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes every event to the structured log.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: OutreachEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            campaign_id = %event.campaign_id,
            lead_id = ?event.lead_id,
            payload = %event.payload,
            "Outreach event"
        );
        Ok(())
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<OutreachEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<OutreachEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: OutreachEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

pub fn make_event(
    event_type: EventType,
    campaign_id: Uuid,
    lead_id: Option<Uuid>,
    payload: serde_json::Value,
) -> OutreachEvent {
    OutreachEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        lead_id,
        payload,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn emit(&self, _event: OutreachEvent) -> anyhow::Result<()> {
            anyhow::bail!("endpoint returned 503")
        }
    }

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        let campaign = Uuid::new_v4();
        notify(
            sink.as_ref(),
            make_event(EventType::CampaignStarted, campaign, None, serde_json::json!({})),
        );
        notify(
            sink.as_ref(),
            make_event(
                EventType::InviteAccepted,
                campaign,
                Some(Uuid::new_v4()),
                serde_json::json!({"node": "n2"}),
            ),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::InviteAccepted), 1);
        assert_eq!(sink.events()[0].campaign_id, campaign);
    }

    #[test]
    fn test_failing_sink_is_swallowed() {
        // Must not panic or propagate.
        notify(
            &BrokenSink,
            make_event(EventType::ActionFailed, Uuid::new_v4(), None, serde_json::json!({})),
        );
    }
}
