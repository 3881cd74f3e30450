use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Leads ──────────────────────────────────────────────────────────────────

/// The outreach target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub position: Option<String>,
    pub profile_url: String,
    pub email: Option<String>,
}

impl Lead {
    pub fn new(first_name: &str, last_name: &str, profile_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            company: None,
            position: None,
            profile_url: profile_url.to_string(),
            email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadList {
    pub id: Uuid,
    pub name: String,
    pub leads: Vec<Lead>,
    pub created_at: DateTime<Utc>,
}

impl LeadList {
    pub fn new(name: &str, leads: Vec<Lead>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            leads,
            created_at: Utc::now(),
        }
    }
}

// ─── Channel Accounts ───────────────────────────────────────────────────────

/// The external channel identity actions are sent from, with its throughput settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub id: Uuid,
    pub name: String,
    /// Falls back to the dispatcher's configured default when unset.
    pub daily_limit: Option<u32>,
    pub working_hours: Option<WorkingHours>,
    /// Offset of the account's local day from UTC, used for quota days and working hours.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl ChannelAccount {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            daily_limit: None,
            working_hours: None,
            utc_offset_minutes: 0,
        }
    }
}

/// Local-time window in which the account may act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: Vec<Weekday>,
}

// ─── Campaigns ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignAnalytics {
    pub journeys_started: u64,
    pub journeys_completed: u64,
    pub journeys_failed: u64,
    pub actions_completed: u64,
    pub actions_failed: u64,
    pub invites_sent: u64,
    pub invites_accepted: u64,
    pub messages_sent: u64,
    pub messages_replied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub sequence_id: Uuid,
    pub lead_list_ids: Vec<Uuid>,
    pub channel_account_id: Uuid,
    pub status: CampaignStatus,
    pub analytics: CampaignAnalytics,
    pub paused_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped by the store on every write.
    pub revision: u64,
}

impl Campaign {
    pub fn new(name: &str, sequence_id: Uuid, channel_account_id: Uuid, lead_list_ids: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sequence_id,
            lead_list_ids,
            channel_account_id,
            status: CampaignStatus::Draft,
            analytics: CampaignAnalytics::default(),
            paused_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }
}

// ─── Lead Journeys ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    InProgress,
    Awaiting,
    Paused,
    Completed,
    Failed,
    Blacklisted,
}

impl JourneyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JourneyStatus::Completed | JourneyStatus::Failed | JourneyStatus::Blacklisted
        )
    }
}

/// Why a journey stopped short of `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    ActionFailed,
    ConditionTimedOut,
    CampaignStopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyMetrics {
    pub invite_sent: bool,
    pub invite_accepted: bool,
    pub messages_sent: u32,
    pub messages_replied: u32,
    pub profile_viewed: bool,
    pub message_read: bool,
    pub profile_opened: bool,
}

/// One lead's traversal of a sequence within one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadJourney {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub sequence_id: Uuid,
    pub current_node_id: String,
    pub status: JourneyStatus,
    pub metrics: JourneyMetrics,
    pub next_action_scheduled_for: Option<DateTime<Utc>>,
    /// Set while parked on a delay node; the continuation fires at this time.
    pub resume_at: Option<DateTime<Utc>>,
    /// Set while `awaiting` a condition; the timeout branch fires at this time.
    pub condition_deadline: Option<DateTime<Utc>>,
    pub halt_reason: Option<HaltReason>,
    /// When the journey entered `paused`; resume shifts its schedule by the time since.
    pub paused_at: Option<DateTime<Utc>>,
    /// Action ids in creation order.
    pub history: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

// ─── Actions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendInvite,
    SendMessage,
    ViewProfile,
    EndorseSkills,
    Follow,
    LikePost,
    FindEmail,
    SendEmail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl ActionStatus {
    /// Pending or in flight. At most one open action exists per journey.
    pub fn is_open(&self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::InProgress)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionData {
    pub message: Option<String>,
    pub subject: Option<String>,
    /// Index of the chosen `send_message` variant.
    pub variant: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(response: serde_json::Value) -> Self {
        Self {
            success: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
        }
    }
}

/// One schedulable unit of outreach work. Never deleted; doubles as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub journey_id: Uuid,
    pub sequence_id: Uuid,
    pub node_id: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub data: ActionData,
    pub result: Option<ActionResult>,
    pub scheduled_for: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

// ─── Lead Events ────────────────────────────────────────────────────────────

/// Asynchronous reports from the channel about a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadEvent {
    InviteAccepted,
    MessageRead,
    ProfileOpened,
    MessageReplied,
}
