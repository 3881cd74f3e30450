//! Outreach campaign management: lifecycle control, reporting and the REST API.
//!
//! `CampaignController` owns campaign state transitions and drives the
//! journey engine and dispatcher; `outreach_router` exposes it over HTTP.

pub mod controller;
pub mod handlers;
pub mod models;
pub mod reports;
pub mod router;

pub use controller::{CampaignController, StartReport};
pub use handlers::OutreachState;
pub use router::outreach_router;
