//! Daily action quota: the budget shared by every dispatch against an account.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use campaign_core::config::QuotaScope;
use campaign_core::types::{Campaign, ChannelAccount};

use crate::working_hours::account_offset;

/// What a unit of quota is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKey {
    Account(Uuid),
    Campaign(Uuid),
}

/// The account-local calendar day `now` falls on, and when it began in UTC.
pub fn local_day(utc_offset_minutes: i32, now: DateTime<Utc>) -> (NaiveDate, DateTime<Utc>) {
    let local = now.with_timezone(&account_offset(utc_offset_minutes));
    let since_midnight = Duration::seconds(i64::from(local.num_seconds_from_midnight()))
        + Duration::nanoseconds(i64::from(local.nanosecond()));
    (local.date_naive(), now - since_midnight)
}

/// Per-day usage counters. A counter is seeded from persisted dispatch history
/// the first time a (key, day) pair is touched, so a restart never resets it.
pub struct QuotaLedger {
    scope: QuotaScope,
    default_limit: u32,
    used: DashMap<(QuotaKey, NaiveDate), u32>,
}

impl QuotaLedger {
    pub fn new(scope: QuotaScope, default_limit: u32) -> Self {
        Self {
            scope,
            default_limit,
            used: DashMap::new(),
        }
    }

    pub fn scope(&self) -> QuotaScope {
        self.scope
    }

    pub fn key(&self, campaign: &Campaign) -> QuotaKey {
        match self.scope {
            QuotaScope::Account => QuotaKey::Account(campaign.channel_account_id),
            QuotaScope::Campaign => QuotaKey::Campaign(campaign.id),
        }
    }

    pub fn limit(&self, account: Option<&ChannelAccount>) -> u32 {
        account
            .and_then(|a| a.daily_limit)
            .unwrap_or(self.default_limit)
    }

    /// Check-and-decrement in one step under the counter's entry lock.
    pub fn try_acquire(
        &self,
        key: QuotaKey,
        day: NaiveDate,
        limit: u32,
        seed: impl FnOnce() -> u32,
    ) -> bool {
        let mut used = self.used.entry((key, day)).or_insert_with(seed);
        if *used >= limit {
            debug!(?key, %day, used = *used, limit, "Daily quota exhausted");
            return false;
        }
        *used += 1;
        true
    }

    /// Gives back a unit taken for a dispatch that never happened.
    pub fn release(&self, key: QuotaKey, day: NaiveDate) {
        if let Some(mut used) = self.used.get_mut(&(key, day)) {
            *used = used.saturating_sub(1);
        }
    }

    pub fn remaining(
        &self,
        key: QuotaKey,
        day: NaiveDate,
        limit: u32,
        seed: impl FnOnce() -> u32,
    ) -> u32 {
        let used = *self.used.entry((key, day)).or_insert_with(seed);
        limit.saturating_sub(used)
    }

    /// Drops counters for days before `day`.
    pub fn prune_before(&self, day: NaiveDate) {
        self.used.retain(|(_, d), _| *d >= day);
    }

    /// Number of (key, day) counters held.
    pub fn counters(&self) -> usize {
        self.used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let ledger = QuotaLedger::new(QuotaScope::Account, 100);
        let key = QuotaKey::Account(Uuid::new_v4());
        assert!(ledger.try_acquire(key, day(6), 2, || 0));
        assert!(ledger.try_acquire(key, day(6), 2, || 0));
        assert!(!ledger.try_acquire(key, day(6), 2, || 0));
        assert_eq!(ledger.remaining(key, day(6), 2, || 0), 0);

        // A new day starts fresh.
        assert!(ledger.try_acquire(key, day(7), 2, || 0));

        ledger.release(key, day(6));
        assert_eq!(ledger.remaining(key, day(6), 2, || 0), 1);
    }

    #[test]
    fn test_seed_only_runs_once() {
        let ledger = QuotaLedger::new(QuotaScope::Campaign, 100);
        let key = QuotaKey::Campaign(Uuid::new_v4());
        assert!(!ledger.try_acquire(key, day(6), 5, || 5));
        assert_eq!(ledger.remaining(key, day(6), 5, || panic!("seeded twice")), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let ledger = Arc::new(QuotaLedger::new(QuotaScope::Account, 100));
        let key = QuotaKey::Account(Uuid::new_v4());
        let granted: usize = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| ledger.try_acquire(key, day(6), 100, || 0))
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(granted, 100);
    }

    #[test]
    fn test_local_day_follows_offset() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 22, 30, 0).unwrap();
        let (d, start) = local_day(0, now);
        assert_eq!(d, day(6));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap());

        // 22:30 UTC is 00:30 the next day at UTC+2; that day began at 22:00 UTC.
        let (d, start) = local_day(120, now);
        assert_eq!(d, day(7));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 6, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_key_follows_scope() {
        let campaign = Campaign::new("c", Uuid::new_v4(), Uuid::new_v4(), vec![]);
        let by_account = QuotaLedger::new(QuotaScope::Account, 10);
        let by_campaign = QuotaLedger::new(QuotaScope::Campaign, 10);
        assert_eq!(by_account.key(&campaign), QuotaKey::Account(campaign.channel_account_id));
        assert_eq!(by_campaign.key(&campaign), QuotaKey::Campaign(campaign.id));

        let mut account = ChannelAccount::new("sales");
        assert_eq!(by_account.limit(Some(&account)), 10);
        account.daily_limit = Some(25);
        assert_eq!(by_account.limit(Some(&account)), 25);
        assert_eq!(by_account.limit(None), 10);
    }
}
