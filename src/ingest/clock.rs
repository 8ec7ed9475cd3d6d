//! # Record Timestamps
//!
//! Picks the best available wall clock for a new record, in priority order:
//!
//! 1. Dedicated real-time clock
//! 2. Network-synchronized system time
//! 3. Uptime counter rendered as `1970-01-01 HH:MM:SS` (clearly out of epoch)

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::record::{parse_iso, ISO_FORMAT};

/// Prefix every clock returns while it has no trustworthy time
pub const UNSET_SENTINEL_PREFIX: &str = "1970-01-01";

/// System time before this year is treated as never synchronized
const MIN_SYNCED_YEAR: i32 = 2016;

/// Length of `YYYY-MM-DD HH:MM:SS`
const ISO_LEN: usize = 19;

/// A wall clock
pub trait ClockSource: Send + Sync {
    /// Current local time as `YYYY-MM-DD HH:MM:SS`, or a `1970-01-01 ...`
    /// sentinel when unset.
    fn now_iso(&self) -> String;
}

/// Host system clock, considered unset until it has been synchronized
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_iso(&self) -> String {
        let now = Local::now().naive_local();
        if now.year() < MIN_SYNCED_YEAR {
            return format!("{} 00:00:00", UNSET_SENTINEL_PREFIX);
        }
        now.format(ISO_FORMAT).to_string()
    }
}

/// Which clock stamped a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Rtc,
    Network,
    Uptime,
}

impl fmt::Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSource::Rtc => write!(f, "RTC"),
            TimeSource::Network => write!(f, "NTP"),
            TimeSource::Uptime => write!(f, "UPTIME"),
        }
    }
}

/// Stamps records from the best clock available right now
#[derive(Clone)]
pub struct Timestamper {
    rtc: Option<Arc<dyn ClockSource>>,
    network: Arc<dyn ClockSource>,
    started: Instant,
}

impl fmt::Debug for Timestamper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timestamper")
            .field("has_rtc", &self.rtc.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Timestamper {
    fn default() -> Self {
        Self::new(None, Arc::new(SystemClock))
    }
}

impl Timestamper {
    pub fn new(rtc: Option<Arc<dyn ClockSource>>, network: Arc<dyn ClockSource>) -> Self {
        Self {
            rtc,
            network,
            started: Instant::now(),
        }
    }

    /// Current timestamp and the clock it came from.
    pub fn now(&self) -> (NaiveDateTime, TimeSource) {
        if let Some(ts) = self.rtc.as_ref().and_then(|rtc| trusted(&rtc.now_iso())) {
            return (ts, TimeSource::Rtc);
        }
        if let Some(ts) = trusted(&self.network.now_iso()) {
            return (ts, TimeSource::Network);
        }
        (self.uptime_timestamp(), TimeSource::Uptime)
    }

    fn uptime_timestamp(&self) -> NaiveDateTime {
        let secs = self.started.elapsed().as_secs();
        let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
        NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|d| d.and_hms_opt(h as u32, m as u32, s as u32))
            .unwrap_or_default()
    }
}

fn trusted(iso: &str) -> Option<NaiveDateTime> {
    if iso.len() != ISO_LEN || iso.starts_with(UNSET_SENTINEL_PREFIX) {
        return None;
    }
    parse_iso(iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedClock(&'static str);

    impl ClockSource for FixedClock {
        fn now_iso(&self) -> String {
            self.0.to_string()
        }
    }

    fn clock(s: &'static str) -> Arc<dyn ClockSource> {
        Arc::new(FixedClock(s))
    }

    #[test]
    fn test_rtc_wins_when_set() {
        let t = Timestamper::new(Some(clock("2024-03-09 07:05:03")), clock("2025-01-01 00:00:00"));
        let (ts, source) = t.now();
        assert_eq!(source, TimeSource::Rtc);
        assert_eq!(ts.to_string(), "2024-03-09 07:05:03");
    }

    #[test]
    fn test_unset_rtc_falls_back_to_network() {
        let t = Timestamper::new(Some(clock("1970-01-01 00:00:09")), clock("2025-01-01 10:00:00"));
        assert_eq!(t.now().1, TimeSource::Network);

        let garbled = Timestamper::new(Some(clock("2024-03-09")), clock("2025-01-01 10:00:00"));
        assert_eq!(garbled.now().1, TimeSource::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_fallback_is_out_of_epoch() {
        let t = Timestamper::new(None, clock("1970-01-01 00:00:00"));
        tokio::time::advance(Duration::from_secs(3 * 3600 + 25 * 60 + 7)).await;

        let (ts, source) = t.now();
        assert_eq!(source, TimeSource::Uptime);
        assert_eq!(ts.to_string(), "1970-01-01 03:25:07");
    }

    #[test]
    fn test_time_source_display() {
        assert_eq!(TimeSource::Rtc.to_string(), "RTC");
        assert_eq!(TimeSource::Network.to_string(), "NTP");
        assert_eq!(TimeSource::Uptime.to_string(), "UPTIME");
    }
}
