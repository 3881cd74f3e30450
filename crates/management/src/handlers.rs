//! Axum REST handlers for the outreach API.

use crate::controller::{CampaignController, StartReport};
use crate::models::*;
use crate::reports::{self, CampaignActionStats, CampaignActions};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use campaign_core::error::CampaignError;
use campaign_core::sequence::SequenceDefinition;
use campaign_core::store::StoreError;
use campaign_core::types::{Campaign, ChannelAccount, LeadJourney, LeadList};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Shared outreach state.
#[derive(Clone)]
pub struct OutreachState {
    pub controller: Arc<CampaignController>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Maps a domain error onto a status code and error body.
pub fn api_error(err: CampaignError) -> ApiError {
    let (status, code) = match &err {
        CampaignError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        CampaignError::GraphValidation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_sequence"),
        CampaignError::Configuration(_) => (StatusCode::UNPROCESSABLE_ENTITY, "configuration_error"),
        CampaignError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        CampaignError::SequenceLocked(_) => (StatusCode::CONFLICT, "sequence_locked"),
        CampaignError::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
        CampaignError::Store(StoreError::Conflict { .. } | StoreError::Duplicate { .. }) => {
            (StatusCode::CONFLICT, "conflict")
        }
        CampaignError::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "Outreach request failed");
        metrics::counter!("outreach.api.errors").increment(1);
    } else {
        warn!(error = %err, code, "Outreach request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        }),
    )
}

// ─── Sequences ─────────────────────────────────────────────────────────────

pub async fn create_sequence(
    State(state): State<OutreachState>,
    Json(req): Json<CreateSequenceRequest>,
) -> Result<(StatusCode, Json<SequenceDefinition>), ApiError> {
    let sequence = state
        .controller
        .save_sequence(req.into_definition())
        .map_err(api_error)?;
    metrics::counter!("outreach.sequences.created").increment(1);
    Ok((StatusCode::CREATED, Json(sequence)))
}

pub async fn import_sequence(
    State(state): State<OutreachState>,
    Json(doc): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<SequenceDefinition>), ApiError> {
    let sequence = state
        .controller
        .import_sequence_json(&doc)
        .map_err(api_error)?;
    metrics::counter!("outreach.sequences.created").increment(1);
    Ok((StatusCode::CREATED, Json(sequence)))
}

pub async fn get_sequence(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SequenceDefinition>, StatusCode> {
    state
        .controller
        .store()
        .get_sequence(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn update_sequence(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSequenceRequest>,
) -> ApiResult<SequenceDefinition> {
    state
        .controller
        .update_sequence(id, req.nodes, req.edges)
        .map(Json)
        .map_err(api_error)
}

// ─── Accounts & lead lists ─────────────────────────────────────────────────

pub async fn create_account(
    State(state): State<OutreachState>,
    Json(req): Json<CreateAccountRequest>,
) -> (StatusCode, Json<ChannelAccount>) {
    let account = state.controller.save_account(req.into_account());
    (StatusCode::CREATED, Json(account))
}

pub async fn get_account(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChannelAccount>, StatusCode> {
    state
        .controller
        .store()
        .get_account(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn create_lead_list(
    State(state): State<OutreachState>,
    Json(req): Json<CreateLeadListRequest>,
) -> (StatusCode, Json<LeadList>) {
    let list = state.controller.add_lead_list(req.into_list());
    metrics::counter!("outreach.leads.imported").increment(list.leads.len() as u64);
    (StatusCode::CREATED, Json(list))
}

// ─── Campaigns ─────────────────────────────────────────────────────────────

pub async fn list_campaigns(State(state): State<OutreachState>) -> Json<Vec<Campaign>> {
    Json(state.controller.list_campaigns())
}

pub async fn get_campaign(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Campaign> {
    state.controller.get_campaign(id).map(Json).map_err(api_error)
}

pub async fn create_campaign(
    State(state): State<OutreachState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state
        .controller
        .create_campaign(&req.name, req.sequence_id, req.channel_account_id, req.lead_list_ids)
        .map_err(api_error)?;
    metrics::counter!("outreach.campaigns.created").increment(1);
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn delete_campaign(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<DeleteResponse> {
    let journeys_deleted = state.controller.delete(id).map_err(api_error)?;
    metrics::counter!("outreach.campaigns.deleted").increment(1);
    Ok(Json(DeleteResponse {
        campaign_id: id,
        journeys_deleted,
    }))
}

pub async fn start_campaign(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StartReport> {
    let report = state.controller.start(id).map_err(api_error)?;
    metrics::counter!("outreach.campaigns.started").increment(1);
    Ok(Json(report))
}

pub async fn pause_campaign(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Campaign> {
    let campaign = state.controller.pause(id).map_err(api_error)?;
    metrics::counter!("outreach.campaigns.paused").increment(1);
    Ok(Json(campaign))
}

pub async fn stop_campaign(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Campaign> {
    let campaign = state.controller.stop(id).map_err(api_error)?;
    metrics::counter!("outreach.campaigns.stopped").increment(1);
    Ok(Json(campaign))
}

pub async fn retry_failed(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<RetryResponse> {
    let modified_count = state
        .controller
        .retry_failed_actions(id)
        .map_err(api_error)?;
    Ok(Json(RetryResponse {
        campaign_id: id,
        modified_count,
    }))
}

pub async fn campaign_journeys(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<LeadJourney>> {
    state.controller.journeys(id).map(Json).map_err(api_error)
}

pub async fn campaign_actions(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CampaignActions> {
    reports::campaign_actions(state.controller.store().as_ref(), id)
        .map(Json)
        .map_err(api_error)
}

pub async fn campaign_action_stats(
    State(state): State<OutreachState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CampaignActionStats> {
    reports::action_stats(state.controller.store().as_ref(), id)
        .map(Json)
        .map_err(api_error)
}

// ─── Leads ─────────────────────────────────────────────────────────────────

pub async fn lead_event(
    State(state): State<OutreachState>,
    Path((campaign_id, lead_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<LeadEventRequest>,
) -> ApiResult<LeadJourney> {
    let journey = state
        .controller
        .record_lead_event(campaign_id, lead_id, req.event)
        .map_err(api_error)?;
    metrics::counter!("outreach.lead_events.received").increment(1);
    Ok(Json(journey))
}

pub async fn blacklist_lead(
    State(state): State<OutreachState>,
    Path((campaign_id, lead_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<LeadJourney> {
    state
        .controller
        .blacklist_lead(campaign_id, lead_id)
        .map(Json)
        .map_err(api_error)
}
