use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeZone, Weekday};
use crate::clock::ist;

const OPEN: (u32, u32) = (9, 15);
const CLOSE: (u32, u32) = (15, 30);

/// NSE cash session, Monday to Friday, 09:15 to 15:30 IST inclusive.
/// Exchange holidays are not known here and read as open.
pub fn is_market_open<Tz: TimeZone>(now: &DateTime<Tz>) -> bool {
    let local: DateTime<FixedOffset> = now.with_timezone(&ist());
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let (Some(open), Some(close)) = (
        NaiveTime::from_hms_opt(OPEN.0, OPEN.1, 0),
        NaiveTime::from_hms_opt(CLOSE.0, CLOSE.1, 0),
    ) else {
        return false;
    };
    let t = local.time();
    t >= open && t <= close
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub interval_minutes: u32,
}

impl RefreshSchedule {
    pub fn new(interval_minutes: u32) -> Self {
        Self { interval_minutes }
    }

    /// A dataset that was never refreshed (`age_minutes < 0`) is always due.
    /// Otherwise refreshes only run while the market is open.
    pub fn is_due(&self, age_minutes: i64, market_open: bool) -> bool {
        if age_minutes < 0 {
            return true;
        }
        market_open && age_minutes >= i64::from(self.interval_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at_ist(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<FixedOffset> {
        ist().with_ymd_and_hms(y, m, d, hh, mm, 0).unwrap()
    }

    #[test]
    fn session_bounds_are_inclusive() {
        // 2025-12-29 is a Monday.
        assert!(!is_market_open(&at_ist(2025, 12, 29, 9, 14)));
        assert!(is_market_open(&at_ist(2025, 12, 29, 9, 15)));
        assert!(is_market_open(&at_ist(2025, 12, 29, 15, 30)));
        assert!(!is_market_open(&at_ist(2025, 12, 29, 15, 31)));
    }

    #[test]
    fn weekends_are_closed() {
        assert!(!is_market_open(&at_ist(2025, 12, 27, 11, 0)));
        assert!(!is_market_open(&at_ist(2025, 12, 28, 11, 0)));
    }

    #[test]
    fn utc_input_is_converted() {
        // 04:00 UTC is 09:30 IST.
        let utc = Utc.with_ymd_and_hms(2025, 12, 29, 4, 0, 0).unwrap();
        assert!(is_market_open(&utc));
    }

    #[test]
    fn schedule_due_rules() {
        let schedule = RefreshSchedule::new(2);
        assert!(schedule.is_due(-1, false));
        assert!(!schedule.is_due(1, true));
        assert!(schedule.is_due(2, true));
        assert!(!schedule.is_due(500, false));
    }
}
