//! Time seams. Production code sleeps on tokio and reads the wall clock;
//! tests swap in recording and fixed implementations.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::time::Duration;

/// Indian Standard Time, the single timezone every persisted timestamp uses.
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("+05:30 is a valid offset")
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ist(&self) -> DateTime<FixedOffset> {
        self.now().with_timezone(&ist())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ist_is_five_thirty_ahead() {
        let utc = Utc.with_ymd_and_hms(2025, 12, 29, 16, 47, 0).unwrap();
        let local = utc.with_timezone(&ist());
        assert_eq!(local.format("%Y-%m-%d %H:%M").to_string(), "2025-12-29 22:17");
    }
}
