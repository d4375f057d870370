use std::sync::atomic::{AtomicI64, Ordering};

use broker_trait::PriceMode;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use chrono_tz::Tz;

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

const fn hm(hour: u32, minute: u32) -> u32 {
    hour * 3600 + minute * 60
}

const REGULAR_OPEN: u32 = hm(9, 0);
const REGULAR_CLOSE: u32 = hm(15, 30);
const CLOSING_PRICE_OPEN: u32 = hm(15, 40);
const CLOSING_PRICE_CLOSE: u32 = hm(16, 0);
const AFTER_HOURS_CLOSE: u32 = hm(18, 0);

/// Picks the order price mode from the exchange-local time of day.
#[derive(Debug, Clone, Copy)]
pub struct SessionRouter {
    tz: Tz,
}

impl SessionRouter {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Exchange-local calendar date of `at`.
    pub fn local_date(&self, at: DateTime<Utc>) -> chrono::NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    pub fn price_mode_at(&self, at: DateTime<Utc>) -> PriceMode {
        let local = at.with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return PriceMode::Reserved;
        }

        let t = local.num_seconds_from_midnight();
        if (REGULAR_OPEN..=REGULAR_CLOSE).contains(&t) {
            PriceMode::Market
        } else if (CLOSING_PRICE_OPEN..=CLOSING_PRICE_CLOSE).contains(&t) {
            PriceMode::ClosingPrice
        } else if t > CLOSING_PRICE_CLOSE && t <= AFTER_HOURS_CLOSE {
            PriceMode::AfterHoursSingle
        } else {
            PriceMode::Reserved
        }
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new(chrono_tz::Asia::Seoul)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Seoul wall time on Wednesday 2024-11-06.
    fn seoul(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Seoul
            .with_ymd_and_hms(2024, 11, 6, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn session_windows() {
        let router = SessionRouter::default();
        let cases = [
            ((8, 59, 59), PriceMode::Reserved),
            ((9, 0, 0), PriceMode::Market),
            ((12, 0, 0), PriceMode::Market),
            ((15, 30, 0), PriceMode::Market),
            ((15, 30, 1), PriceMode::Reserved),
            ((15, 39, 59), PriceMode::Reserved),
            ((15, 40, 0), PriceMode::ClosingPrice),
            ((16, 0, 0), PriceMode::ClosingPrice),
            ((16, 0, 1), PriceMode::AfterHoursSingle),
            ((18, 0, 0), PriceMode::AfterHoursSingle),
            ((18, 0, 1), PriceMode::Reserved),
            ((23, 0, 0), PriceMode::Reserved),
        ];
        for ((h, m, s), expected) in cases {
            assert_eq!(router.price_mode_at(seoul(h, m, s)), expected, "{:02}:{:02}:{:02}", h, m, s);
        }
    }

    #[test]
    fn weekends_are_reserved() {
        let router = SessionRouter::default();
        let saturday_noon = chrono_tz::Asia::Seoul
            .with_ymd_and_hms(2024, 11, 9, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(router.price_mode_at(saturday_noon), PriceMode::Reserved);
    }

    #[test]
    fn fixed_clock_moves_on_demand() {
        let clock = FixedClock::new(seoul(9, 0, 0));
        clock.advance(Duration::minutes(390));
        assert_eq!(clock.now(), seoul(15, 30, 0));
        clock.set(seoul(16, 30, 0));
        assert_eq!(
            SessionRouter::default().price_mode_at(clock.now()),
            PriceMode::AfterHoursSingle
        );
    }
}
