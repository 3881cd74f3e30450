//! Journey orchestration: sequence validation and the per-lead state machine
//! that walks each lead through an outreach sequence.

pub mod delay;
pub mod engine;
pub mod evaluator;
pub mod personalize;
pub mod state_machine;
pub mod validator;

pub use engine::{JourneyEngine, TickReport};
pub use evaluator::ConditionEvaluator;
pub use state_machine::JourneyStateMachine;
pub use validator::{validate, GraphError, ValidDefinition};
