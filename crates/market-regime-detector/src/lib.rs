use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use analysis_core::stats::{linear_regression_slope, return_volatility_pct};
use analysis_core::{closes, AnalysisError, DateWindow, Estimate, PriceDataProvider};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Broad-market board index id.
pub const DEFAULT_BROAD_INDEX: &str = "1001";
/// Growth board index id.
pub const DEFAULT_GROWTH_INDEX: &str = "2001";
pub const DEFAULT_REGIME_WINDOW_DAYS: i64 = 30;

/// Market-wide direction derived from two benchmark indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeClass {
    Bull,
    Neutral,
    Bear,
}

impl RegimeClass {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            RegimeClass::Bull => "Bull",
            RegimeClass::Neutral => "Neutral",
            RegimeClass::Bear => "Bear",
        }
    }

    /// Bull only when both benchmarks rise, Bear only when both fall.
    pub fn from_slopes(a: f64, b: f64) -> Self {
        if a > 0.0 && b > 0.0 {
            RegimeClass::Bull
        } else if a < 0.0 && b < 0.0 {
            RegimeClass::Bear
        } else {
            RegimeClass::Neutral
        }
    }
}

impl fmt::Display for RegimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegimeClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bull" => Ok(RegimeClass::Bull),
            "neutral" => Ok(RegimeClass::Neutral),
            "bear" => Ok(RegimeClass::Bear),
            other => anyhow::bail!("unknown regime classification '{}'", other),
        }
    }
}

/// One day's regime snapshot. Superseded by the next day's record, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRegime {
    pub as_of_date: NaiveDate,
    pub benchmark_index_values: [f64; 2],
    pub benchmark_trend_signs: [i8; 2],
    pub aggregate_volatility_pct: f64,
    pub classification: RegimeClass,
}

impl MarketRegime {
    /// Fail-safe regime: neutral with zero volatility.
    pub fn neutral(as_of_date: NaiveDate) -> Self {
        Self {
            as_of_date,
            benchmark_index_values: [0.0, 0.0],
            benchmark_trend_signs: [0, 0],
            aggregate_volatility_pct: 0.0,
            classification: RegimeClass::Neutral,
        }
    }

    pub fn is_bull(&self) -> bool {
        self.classification == RegimeClass::Bull
    }

    pub fn is_bear(&self) -> bool {
        self.classification == RegimeClass::Bear
    }
}

/// Metrics for one benchmark series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReading {
    pub index_id: String,
    pub last_value: f64,
    pub slope: f64,
    pub volatility_pct: f64,
    pub sample_size: usize,
}

impl BenchmarkReading {
    pub fn trend_sign(&self) -> i8 {
        if self.slope > 0.0 {
            1
        } else if self.slope < 0.0 {
            -1
        } else {
            0
        }
    }
}

/// Classifies the market from two benchmark indices over a trailing window.
pub struct MarketRegimeClassifier {
    provider: Arc<dyn PriceDataProvider>,
    benchmarks: [String; 2],
    window_days: i64,
}

impl MarketRegimeClassifier {
    pub fn new(provider: Arc<dyn PriceDataProvider>) -> Self {
        Self {
            provider,
            benchmarks: [DEFAULT_BROAD_INDEX.to_string(), DEFAULT_GROWTH_INDEX.to_string()],
            window_days: DEFAULT_REGIME_WINDOW_DAYS,
        }
    }

    pub fn with_benchmarks(mut self, broad: impl Into<String>, growth: impl Into<String>) -> Self {
        self.benchmarks = [broad.into(), growth.into()];
        self
    }

    pub fn with_window_days(mut self, days: i64) -> Self {
        self.window_days = days;
        self
    }

    pub fn benchmarks(&self) -> &[String; 2] {
        &self.benchmarks
    }

    /// Regime for `as_of`. Any data problem yields the neutral fail-safe,
    /// logged and returned as a fallback. No retries.
    pub async fn classify(&self, as_of: NaiveDate) -> Estimate<MarketRegime> {
        match self.compute(as_of).await {
            Ok(regime) => {
                tracing::info!(
                    date = %as_of,
                    regime = %regime.classification,
                    volatility = format!("{:.2}%", regime.aggregate_volatility_pct),
                    "Market regime classified"
                );
                Estimate::computed(regime)
            }
            Err(e) => {
                tracing::warn!("Market regime unavailable for {}: {}. Using Neutral.", as_of, e);
                Estimate::fallback(MarketRegime::neutral(as_of), e.to_string())
            }
        }
    }

    async fn compute(&self, as_of: NaiveDate) -> Result<MarketRegime, AnalysisError> {
        let broad = self.read_benchmark(&self.benchmarks[0], as_of).await?;
        let growth = self.read_benchmark(&self.benchmarks[1], as_of).await?;

        Ok(MarketRegime {
            as_of_date: as_of,
            benchmark_index_values: [broad.last_value, growth.last_value],
            benchmark_trend_signs: [broad.trend_sign(), growth.trend_sign()],
            aggregate_volatility_pct: (broad.volatility_pct + growth.volatility_pct) / 2.0,
            classification: RegimeClass::from_slopes(broad.slope, growth.slope),
        })
    }

    pub async fn read_benchmark(
        &self,
        index_id: &str,
        as_of: NaiveDate,
    ) -> Result<BenchmarkReading, AnalysisError> {
        let window = DateWindow::trailing_days(as_of, self.window_days);
        let bars = self.provider.daily_bars(index_id, window).await?;
        let values = closes(&bars);

        let slope = linear_regression_slope(&values).ok_or_else(|| {
            AnalysisError::InsufficientData(format!(
                "index {} has {} points, need at least 2",
                index_id,
                values.len()
            ))
        })?;
        // Two points give a direction but no spread of returns.
        let volatility_pct = return_volatility_pct(&values).unwrap_or_else(|| {
            tracing::debug!(
                "index {} has {} points, volatility taken as 0",
                index_id,
                values.len()
            );
            0.0
        });
        let last_value = values.last().copied().unwrap_or_default();

        Ok(BenchmarkReading {
            index_id: index_id.to_string(),
            last_value,
            slope,
            volatility_pct,
            sample_size: values.len(),
        })
    }
}
