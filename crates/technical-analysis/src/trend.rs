use std::fmt;
use std::sync::Arc;

use analysis_core::stats::linear_regression_slope;
use analysis_core::{closes, DateWindow, PriceDataProvider};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TREND_WINDOW_DAYS: i64 = 14;

const STRONG_THRESHOLD: f64 = 0.15;
const WEAK_THRESHOLD: f64 = 0.05;

/// Short-window directional trend bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrendScore {
    StrongDown = -2,
    WeakDown = -1,
    Neutral = 0,
    WeakUp = 1,
    StrongUp = 2,
}

impl TrendScore {
    pub fn value(self) -> i8 {
        self as i8
    }

    pub fn name(self) -> &'static str {
        match self {
            TrendScore::StrongUp => "strong uptrend",
            TrendScore::WeakUp => "weak uptrend",
            TrendScore::Neutral => "neutral trend",
            TrendScore::WeakDown => "weak downtrend",
            TrendScore::StrongDown => "strong downtrend",
        }
    }

    /// Bucket a range-normalized slope. Thresholds are strict.
    pub fn from_normalized_slope(normalized: f64) -> Self {
        if !normalized.is_finite() {
            return TrendScore::Neutral;
        }
        if normalized > STRONG_THRESHOLD {
            TrendScore::StrongUp
        } else if normalized > WEAK_THRESHOLD {
            TrendScore::WeakUp
        } else if normalized < -STRONG_THRESHOLD {
            TrendScore::StrongDown
        } else if normalized < -WEAK_THRESHOLD {
            TrendScore::WeakDown
        } else {
            TrendScore::Neutral
        }
    }
}

impl fmt::Display for TrendScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Regression slope scaled by `len / (max - min)` so that the score is
/// independent of the price level.
pub fn normalized_slope(closes: &[f64]) -> Option<f64> {
    let slope = linear_regression_slope(closes)?;
    let max = closes.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = closes.iter().cloned().fold(f64::INFINITY, f64::min);
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return None;
    }
    Some(slope / (range / closes.len() as f64))
}

/// Trend bucket for a close series. Flat or too-short series are neutral.
pub fn score_closes(closes: &[f64]) -> TrendScore {
    normalized_slope(closes)
        .map(TrendScore::from_normalized_slope)
        .unwrap_or(TrendScore::Neutral)
}

/// Scores an instrument's recent closes. Never fails the caller.
pub struct TrendAnalyzer {
    provider: Arc<dyn PriceDataProvider>,
    window_days: i64,
}

impl TrendAnalyzer {
    pub fn new(provider: Arc<dyn PriceDataProvider>) -> Self {
        Self {
            provider,
            window_days: DEFAULT_TREND_WINDOW_DAYS,
        }
    }

    pub fn with_window_days(mut self, days: i64) -> Self {
        self.window_days = days;
        self
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    pub async fn analyze(&self, ticker: &str, as_of: NaiveDate) -> TrendScore {
        self.analyze_window(ticker, as_of, self.window_days).await
    }

    /// Same as [`analyze`](Self::analyze) with an explicit lookback.
    pub async fn analyze_window(&self, ticker: &str, as_of: NaiveDate, days: i64) -> TrendScore {
        let window = DateWindow::trailing_days(as_of, days);
        match self.provider.daily_bars(ticker, window).await {
            Ok(bars) => {
                let score = score_closes(&closes(&bars));
                tracing::debug!(ticker, days, bars = bars.len(), trend = %score, "Trend analyzed");
                score
            }
            Err(e) => {
                tracing::warn!("Trend analysis for {} fell back to neutral: {}", ticker, e);
                TrendScore::Neutral
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{Bar, InMemoryPriceData};
    use chrono::{Duration, TimeZone, Utc};

    fn series(start: f64, step: f64, count: usize) -> Vec<f64> {
        (0..count).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn thresholds_are_strict() {
        assert_eq!(TrendScore::from_normalized_slope(0.16), TrendScore::StrongUp);
        assert_eq!(TrendScore::from_normalized_slope(0.15), TrendScore::WeakUp);
        assert_eq!(TrendScore::from_normalized_slope(0.05), TrendScore::Neutral);
        assert_eq!(TrendScore::from_normalized_slope(-0.05), TrendScore::Neutral);
        assert_eq!(TrendScore::from_normalized_slope(-0.06), TrendScore::WeakDown);
        assert_eq!(TrendScore::from_normalized_slope(-0.15), TrendScore::WeakDown);
        assert_eq!(TrendScore::from_normalized_slope(-0.2), TrendScore::StrongDown);
        assert_eq!(TrendScore::from_normalized_slope(f64::NAN), TrendScore::Neutral);
    }

    #[test]
    fn straight_lines_are_strong() {
        assert_eq!(score_closes(&series(100.0, 1.0, 14)), TrendScore::StrongUp);
        assert_eq!(score_closes(&series(100.0, -1.0, 14)), TrendScore::StrongDown);
    }

    #[test]
    fn flat_and_short_series_are_neutral() {
        assert_eq!(score_closes(&[100.0; 10]), TrendScore::Neutral);
        assert_eq!(score_closes(&[100.0]), TrendScore::Neutral);
        assert_eq!(score_closes(&[]), TrendScore::Neutral);
    }

    #[test]
    fn ordering_follows_value() {
        assert!(TrendScore::WeakUp < TrendScore::StrongUp);
        assert!(TrendScore::WeakDown < TrendScore::Neutral);
        assert_eq!(TrendScore::StrongDown.value(), -2);
    }

    #[tokio::test]
    async fn analyzer_reads_provider_window() {
        let data = Arc::new(InMemoryPriceData::new());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..30)
            .map(|i| Bar::daily_close(start + Duration::days(i), 100.0 + i as f64))
            .collect();
        data.insert("035720", bars);

        let analyzer = TrendAnalyzer::new(data);
        let as_of = (start + Duration::days(29)).date_naive();
        assert_eq!(analyzer.analyze("035720", as_of).await, TrendScore::StrongUp);
    }

    #[tokio::test]
    async fn analyzer_is_neutral_without_data() {
        let analyzer = TrendAnalyzer::new(Arc::new(InMemoryPriceData::new()));
        let as_of = chrono::NaiveDate::from_ymd_opt(2024, 5, 30).unwrap();
        assert_eq!(analyzer.analyze("000000", as_of).await, TrendScore::Neutral);
    }
}
