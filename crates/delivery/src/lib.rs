//! Action delivery: daily quotas, working-hours windows, the channel driver
//! port and the dispatcher that hands due actions to it.

pub mod channel;
pub mod dispatcher;
pub mod quota;
pub mod working_hours;

pub use channel::{ChannelDriver, DryRunDriver, ScriptedDriver};
pub use dispatcher::{ActionDispatcher, ClaimOutcome, DispatchReport};
pub use quota::{QuotaKey, QuotaLedger};
