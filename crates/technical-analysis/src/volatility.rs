use std::sync::Arc;

use analysis_core::stats::return_volatility_pct;
use analysis_core::{closes, AnalysisError, DateWindow, Estimate, PriceDataProvider};
use chrono::NaiveDate;
use dashmap::DashMap;

pub const DEFAULT_VOLATILITY_WINDOW_DAYS: i64 = 60;

/// Used whenever an instrument's history cannot produce a number.
pub const FALLBACK_VOLATILITY_PCT: f64 = 15.0;

/// Per-instrument volatility (std-dev of daily % returns, in percent).
///
/// Computed values are cached for the life of the estimator and the first
/// computation for a ticker wins. Fallbacks are never cached.
pub struct VolatilityEstimator {
    provider: Arc<dyn PriceDataProvider>,
    window_days: i64,
    cache: DashMap<String, f64>,
}

impl VolatilityEstimator {
    pub fn new(provider: Arc<dyn PriceDataProvider>) -> Self {
        Self {
            provider,
            window_days: DEFAULT_VOLATILITY_WINDOW_DAYS,
            cache: DashMap::new(),
        }
    }

    pub fn with_window_days(mut self, days: i64) -> Self {
        self.window_days = days;
        self
    }

    pub fn cached(&self, ticker: &str) -> Option<f64> {
        self.cache.get(ticker).map(|v| *v)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub async fn estimate(&self, ticker: &str, as_of: NaiveDate) -> Estimate<f64> {
        if let Some(v) = self.cached(ticker) {
            return Estimate::computed(v);
        }

        match self.compute(ticker, as_of).await {
            Ok(v) => {
                // A concurrent caller may have stored first; keep theirs.
                let stored = *self.cache.entry(ticker.to_string()).or_insert(v);
                tracing::debug!("Volatility for {}: {:.2}%", ticker, stored);
                Estimate::computed(stored)
            }
            Err(e) => {
                tracing::warn!(
                    "Volatility for {} unavailable ({}), using {:.1}%",
                    ticker,
                    e,
                    FALLBACK_VOLATILITY_PCT
                );
                Estimate::fallback(FALLBACK_VOLATILITY_PCT, e.to_string())
            }
        }
    }

    async fn compute(&self, ticker: &str, as_of: NaiveDate) -> Result<f64, AnalysisError> {
        let window = DateWindow::trailing_days(as_of, self.window_days);
        let bars = self.provider.daily_bars(ticker, window).await?;
        if bars.is_empty() {
            return Err(AnalysisError::InsufficientData(format!(
                "no bars for {} in the last {} days",
                ticker, self.window_days
            )));
        }
        return_volatility_pct(&closes(&bars)).ok_or_else(|| {
            AnalysisError::InsufficientData(format!(
                "{} bars for {} is too short for a volatility estimate",
                bars.len(),
                ticker
            ))
        })
    }
}
