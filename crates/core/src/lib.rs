//! Shared records, configuration, errors and collaborator ports for the
//! outreach campaign engine.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod sequence;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
pub use store::{MemoryStore, OutreachStore, StoreError};
