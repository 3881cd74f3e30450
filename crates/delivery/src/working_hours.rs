//! Working hours: keeps an account from acting outside its local schedule.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Timelike, Utc};

use campaign_core::types::WorkingHours;

/// The account's UTC offset, falling back to UTC when out of range.
pub fn account_offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// Whether `now` falls inside the window, evaluated in the account's local time.
///
/// `start > end` is an overnight window. `start == end` means the whole day.
/// An empty `days` list allows every weekday.
pub fn is_open(hours: &WorkingHours, utc_offset_minutes: i32, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&account_offset(utc_offset_minutes));
    if !hours.days.is_empty() && !hours.days.contains(&local.weekday()) {
        return false;
    }

    let current = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
        .unwrap_or_default();
    if hours.start == hours.end {
        true
    } else if hours.start < hours.end {
        current >= hours.start && current < hours.end
    } else {
        current >= hours.start || current < hours.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn office() -> WorkingHours {
        WorkingHours {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }

    #[test]
    fn test_office_hours_utc() {
        // 2024-05-06 is a Monday.
        let hours = office();
        assert!(is_open(&hours, 0, Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()));
        assert!(is_open(&hours, 0, Utc.with_ymd_and_hms(2024, 5, 6, 16, 59, 59).unwrap()));
        assert!(!is_open(&hours, 0, Utc.with_ymd_and_hms(2024, 5, 6, 17, 0, 0).unwrap()));
        assert!(!is_open(&hours, 0, Utc.with_ymd_and_hms(2024, 5, 5, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_offset_moves_the_window() {
        let hours = office();
        // 07:30 UTC is 09:30 at UTC+2.
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 30, 0).unwrap();
        assert!(!is_open(&hours, 0, now));
        assert!(is_open(&hours, 120, now));
        // Sunday 23:30 UTC is already Monday 08:30 at UTC+9, before opening.
        let now = Utc.with_ymd_and_hms(2024, 5, 5, 23, 30, 0).unwrap();
        assert!(!is_open(&hours, 540, now));
        assert!(is_open(&hours, 600, now));
    }

    #[test]
    fn test_overnight_and_all_day_windows() {
        let night = WorkingHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            days: vec![],
        };
        assert!(is_open(&night, 0, Utc.with_ymd_and_hms(2024, 5, 6, 23, 0, 0).unwrap()));
        assert!(is_open(&night, 0, Utc.with_ymd_and_hms(2024, 5, 7, 5, 59, 0).unwrap()));
        assert!(!is_open(&night, 0, Utc.with_ymd_and_hms(2024, 5, 7, 12, 0, 0).unwrap()));

        let always = WorkingHours {
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            days: vec![],
        };
        assert!(is_open(&always, 0, Utc.with_ymd_and_hms(2024, 5, 7, 3, 0, 0).unwrap()));
    }
}
