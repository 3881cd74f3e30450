//! Request and response bodies for the outreach API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use campaign_core::sequence::{Edge, SequenceDefinition, SequenceNode};
use campaign_core::types::{ChannelAccount, Lead, LeadEvent, LeadList, WorkingHours};

// ─── Sequences ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    pub nodes: Vec<SequenceNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl CreateSequenceRequest {
    pub fn into_definition(self) -> SequenceDefinition {
        SequenceDefinition::new(self.name, self.nodes, self.edges)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSequenceRequest {
    pub nodes: Vec<SequenceNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

// ─── Accounts & leads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub daily_limit: Option<u32>,
    pub working_hours: Option<WorkingHours>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl CreateAccountRequest {
    pub fn into_account(self) -> ChannelAccount {
        let mut account = ChannelAccount::new(&self.name);
        account.daily_limit = self.daily_limit;
        account.working_hours = self.working_hours;
        account.utc_offset_minutes = self.utc_offset_minutes;
        account
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLead {
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub position: Option<String>,
    pub profile_url: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateLeadListRequest {
    pub name: String,
    pub leads: Vec<NewLead>,
}

impl CreateLeadListRequest {
    pub fn into_list(self) -> LeadList {
        let leads = self
            .leads
            .into_iter()
            .map(|l| {
                let mut lead = Lead::new(&l.first_name, &l.last_name, &l.profile_url);
                lead.company = l.company;
                lead.position = l.position;
                lead.email = l.email;
                lead
            })
            .collect();
        LeadList::new(&self.name, leads)
    }
}

// ─── Campaigns ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub sequence_id: Uuid,
    pub channel_account_id: Uuid,
    #[serde(default)]
    pub lead_list_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadEventRequest {
    pub event: LeadEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResponse {
    pub campaign_id: Uuid,
    pub modified_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub campaign_id: Uuid,
    pub journeys_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
