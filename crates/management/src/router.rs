//! Outreach API router: mounts all endpoints under /api/v1/outreach.

use crate::handlers::{self, OutreachState};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the outreach router. Merge it into the main app.
pub fn outreach_router(state: OutreachState) -> Router {
    Router::new()
        // Sequences
        .route("/api/v1/outreach/sequences", post(handlers::create_sequence))
        .route("/api/v1/outreach/sequences/import", post(handlers::import_sequence))
        .route("/api/v1/outreach/sequences/:id", get(handlers::get_sequence).put(handlers::update_sequence))
        // Accounts & leads
        .route("/api/v1/outreach/accounts", post(handlers::create_account))
        .route("/api/v1/outreach/accounts/:id", get(handlers::get_account))
        .route("/api/v1/outreach/lead-lists", post(handlers::create_lead_list))
        // Campaigns
        .route("/api/v1/outreach/campaigns", get(handlers::list_campaigns).post(handlers::create_campaign))
        .route("/api/v1/outreach/campaigns/:id", get(handlers::get_campaign).delete(handlers::delete_campaign))
        .route("/api/v1/outreach/campaigns/:id/start", post(handlers::start_campaign))
        .route("/api/v1/outreach/campaigns/:id/pause", post(handlers::pause_campaign))
        .route("/api/v1/outreach/campaigns/:id/stop", post(handlers::stop_campaign))
        .route("/api/v1/outreach/campaigns/:id/retry", post(handlers::retry_failed))
        .route("/api/v1/outreach/campaigns/:id/journeys", get(handlers::campaign_journeys))
        .route("/api/v1/outreach/campaigns/:id/actions", get(handlers::campaign_actions))
        .route("/api/v1/outreach/campaigns/:id/actions/stats", get(handlers::campaign_action_stats))
        // Lead events
        .route("/api/v1/outreach/campaigns/:id/leads/:lead_id/events", post(handlers::lead_event))
        .route("/api/v1/outreach/campaigns/:id/leads/:lead_id/blacklist", post(handlers::blacklist_lead))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
