use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tuning for the volatility-scaled stop and target bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Volatility at which the base percentages apply unscaled.
    pub reference_volatility_pct: f64,
    pub base_stop_loss_percent: f64,
    pub min_stop_loss_percent: f64,
    pub max_stop_loss_percent: f64,
    pub base_take_profit_percent: f64,
    pub min_take_profit_percent: f64,
    pub max_take_profit_percent: f64,
    pub bull_stop_multiplier: f64,
    pub bear_stop_multiplier: f64,
    pub bull_target_multiplier: f64,
    pub bear_target_multiplier: f64,
    /// stop = entry * ratio when the calculation cannot be trusted
    pub fallback_stop_ratio: f64,
    /// target = entry * ratio when the calculation cannot be trusted
    pub fallback_target_ratio: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            reference_volatility_pct: 15.0,
            base_stop_loss_percent: 5.0,
            min_stop_loss_percent: 3.0,
            max_stop_loss_percent: 15.0,
            base_take_profit_percent: 10.0,
            min_take_profit_percent: 5.0,
            max_take_profit_percent: 30.0,
            bull_stop_multiplier: 1.2,
            bear_stop_multiplier: 0.8,
            bull_target_multiplier: 1.3,
            bear_target_multiplier: 0.7,
            fallback_stop_ratio: 0.95,
            fallback_target_ratio: 1.10,
        }
    }
}

/// Stop-loss and target for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLevels {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    /// Effective percentages after regime scaling.
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("Invalid entry price: {0}")]
    InvalidEntryPrice(f64),

    #[error("Invalid volatility: {0}")]
    InvalidVolatility(f64),

    #[error("Calculation error: {0}")]
    CalculationError(String),
}
