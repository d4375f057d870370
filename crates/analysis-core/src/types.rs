use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: Option<f64>,
}

impl Bar {
    /// Daily bar with every price set to `close`. Handy for index series where
    /// only the close matters.
    pub fn daily_close(timestamp: DateTime<Utc>, close: f64) -> Self {
        Self {
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            vwap: None,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Close prices in bar order, dropping non-finite values.
pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .map(|b| b.close)
        .filter(|c| c.is_finite())
        .collect()
}

/// Inclusive calendar-date window ending at `as_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn trailing_days(as_of: NaiveDate, days: i64) -> Self {
        Self {
            from: as_of - chrono::Duration::days(days.max(0)),
            to: as_of,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}
