//! Relative delay resolution.

use chrono::{DateTime, Duration, Utc};

use campaign_core::sequence::{Delay, DelayUnit};

/// Length of a delay. Range is checked by the validator, not here.
pub fn duration(delay: &Delay) -> Duration {
    let value = i64::from(delay.value);
    match delay.unit {
        DelayUnit::Hours => Duration::hours(value),
        DelayUnit::Days => Duration::days(value),
    }
}

/// Absolute time a delay started at `reference` elapses.
pub fn resolve(delay: &Delay, reference: DateTime<Utc>) -> DateTime<Utc> {
    reference + duration(delay)
}
