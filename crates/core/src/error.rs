use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    /// Rejected at edit-save or activation time, never raised by the engine.
    #[error("Sequence validation error: {0}")]
    GraphValidation(String),

    /// Per-action channel failure. Recorded in `result.error`, halts one journey.
    #[error("Channel execution error: {0}")]
    ChannelExecution(String),

    /// The dispatcher defers on this; it only surfaces from activation checks.
    #[error("Daily action quota exhausted for {scope}")]
    QuotaExceeded { scope: String },

    /// Unknown node type or condition kind. Blocks activation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Sequence {0} is bound to an active campaign; pause it or save a new version")]
    SequenceLocked(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}
