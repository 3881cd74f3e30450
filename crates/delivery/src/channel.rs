//! Channel driver port: the external professional-network automation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use campaign_core::types::{Action, ActionResult, ActionType};

/// Executes one action against the channel. Protocol, authentication and
/// session handling live behind this call.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    async fn execute(&self, action: &Action) -> ActionResult;
}

/// Logs each action and reports success without contacting anything.
#[derive(Debug, Default)]
pub struct DryRunDriver;

#[async_trait]
impl ChannelDriver for DryRunDriver {
    async fn execute(&self, action: &Action) -> ActionResult {
        info!(
            action_id = %action.id,
            lead_id = %action.lead_id,
            action_type = ?action.action_type,
            message = action.data.message.as_deref().unwrap_or_default(),
            "Dry-run channel execution"
        );
        ActionResult::ok(serde_json::json!({ "dry_run": true }))
    }
}

/// Deterministic driver for tests: succeeds unless told otherwise and
/// records every call.
#[derive(Default)]
pub struct ScriptedDriver {
    failing_leads: Mutex<HashMap<Uuid, String>>,
    queued_failures: Mutex<HashMap<ActionType, VecDeque<String>>>,
    calls: Mutex<Vec<Action>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every action for this lead fails until [`ScriptedDriver::heal_lead`].
    pub fn fail_lead(&self, lead_id: Uuid, error: &str) {
        self.failing_leads.lock().insert(lead_id, error.to_string());
    }

    pub fn heal_lead(&self, lead_id: Uuid) {
        self.failing_leads.lock().remove(&lead_id);
    }

    /// The next action of this type fails once.
    pub fn fail_next(&self, action_type: ActionType, error: &str) {
        self.queued_failures
            .lock()
            .entry(action_type)
            .or_default()
            .push_back(error.to_string());
    }

    pub fn calls(&self) -> Vec<Action> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChannelDriver for ScriptedDriver {
    async fn execute(&self, action: &Action) -> ActionResult {
        self.calls.lock().push(action.clone());

        if let Some(error) = self.failing_leads.lock().get(&action.lead_id) {
            return ActionResult::failed(error.clone());
        }
        let queued = self
            .queued_failures
            .lock()
            .get_mut(&action.action_type)
            .and_then(|q| q.pop_front());
        if let Some(error) = queued {
            return ActionResult::failed(error);
        }
        ActionResult::ok(serde_json::json!({
            "action_id": action.id,
            "action_type": action.action_type,
        }))
    }
}
