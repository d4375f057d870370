use std::sync::Arc;

use analysis_core::Estimate;
use chrono::NaiveDate;
use market_regime_detector::RegimeClass;
use technical_analysis::VolatilityEstimator;

use crate::models::*;

/// Volatility- and regime-scaled stop-loss and target prices.
///
/// The regime multiplier is applied after clamping, so Bull/Bear values may
/// land outside the clamp bands.
pub struct RiskParameterCalculator {
    params: RiskParameters,
    volatility: Arc<VolatilityEstimator>,
}

impl RiskParameterCalculator {
    pub fn new(volatility: Arc<VolatilityEstimator>) -> Self {
        Self {
            params: RiskParameters::default(),
            volatility,
        }
    }

    pub fn with_parameters(mut self, params: RiskParameters) -> Self {
        self.params = params;
        self
    }

    pub fn parameters(&self) -> &RiskParameters {
        &self.params
    }

    fn volatility_scale(&self, volatility_pct: f64) -> f64 {
        volatility_pct / self.params.reference_volatility_pct
    }

    /// Stop-loss percent before regime scaling, always inside the clamp band.
    pub fn base_stop_loss_percent(&self, volatility_pct: f64) -> f64 {
        (self.params.base_stop_loss_percent * self.volatility_scale(volatility_pct)).clamp(
            self.params.min_stop_loss_percent,
            self.params.max_stop_loss_percent,
        )
    }

    /// Take-profit percent before regime scaling, always inside the clamp band.
    pub fn base_take_profit_percent(&self, volatility_pct: f64) -> f64 {
        (self.params.base_take_profit_percent * self.volatility_scale(volatility_pct)).clamp(
            self.params.min_take_profit_percent,
            self.params.max_take_profit_percent,
        )
    }

    pub fn stop_loss_percent(&self, volatility_pct: f64, regime: RegimeClass) -> f64 {
        let base = self.base_stop_loss_percent(volatility_pct);
        match regime {
            RegimeClass::Bear => base * self.params.bear_stop_multiplier,
            RegimeClass::Bull => base * self.params.bull_stop_multiplier,
            RegimeClass::Neutral => base,
        }
    }

    pub fn take_profit_percent(&self, volatility_pct: f64, regime: RegimeClass) -> f64 {
        let base = self.base_take_profit_percent(volatility_pct);
        match regime {
            RegimeClass::Bull => base * self.params.bull_target_multiplier,
            RegimeClass::Bear => base * self.params.bear_target_multiplier,
            RegimeClass::Neutral => base,
        }
    }

    /// Strict computation: any invalid input is an error.
    pub fn compute(
        &self,
        entry_price: f64,
        volatility_pct: f64,
        regime: RegimeClass,
    ) -> Result<RiskLevels, RiskError> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(RiskError::InvalidEntryPrice(entry_price));
        }
        if !volatility_pct.is_finite() || volatility_pct < 0.0 {
            return Err(RiskError::InvalidVolatility(volatility_pct));
        }

        let stop_pct = self.stop_loss_percent(volatility_pct, regime);
        let target_pct = self.take_profit_percent(volatility_pct, regime);
        let stop_loss = entry_price * (1.0 - stop_pct / 100.0);
        let target_price = entry_price * (1.0 + target_pct / 100.0);

        if !stop_loss.is_finite() || !target_price.is_finite() {
            return Err(RiskError::CalculationError(format!(
                "non-finite levels (stop={}, target={})",
                stop_loss, target_price
            )));
        }
        if !(stop_loss < entry_price && entry_price < target_price) {
            return Err(RiskError::CalculationError(format!(
                "levels out of order (stop={:.2}, entry={:.2}, target={:.2})",
                stop_loss, entry_price, target_price
            )));
        }

        Ok(RiskLevels {
            entry_price,
            stop_loss,
            target_price,
            stop_loss_percent: stop_pct,
            take_profit_percent: target_pct,
        })
    }

    /// Fixed -5% / +10% band.
    pub fn fallback_levels(&self, entry_price: f64) -> RiskLevels {
        RiskLevels {
            entry_price,
            stop_loss: entry_price * self.params.fallback_stop_ratio,
            target_price: entry_price * self.params.fallback_target_ratio,
            stop_loss_percent: (1.0 - self.params.fallback_stop_ratio) * 100.0,
            take_profit_percent: (self.params.fallback_target_ratio - 1.0) * 100.0,
        }
    }

    /// Levels for an entry. A bad entry price is an error; any other
    /// calculation problem degrades to the fixed fallback band.
    pub fn levels(
        &self,
        entry_price: f64,
        volatility_pct: f64,
        regime: RegimeClass,
    ) -> Result<Estimate<RiskLevels>, RiskError> {
        match self.compute(entry_price, volatility_pct, regime) {
            Ok(levels) => Ok(Estimate::computed(levels)),
            Err(RiskError::InvalidEntryPrice(p)) => Err(RiskError::InvalidEntryPrice(p)),
            Err(e) => {
                tracing::warn!("Risk levels fell back to fixed band at {:.2}: {}", entry_price, e);
                Ok(Estimate::fallback(self.fallback_levels(entry_price), e.to_string()))
            }
        }
    }

    /// Looks up (or computes and caches) the ticker's volatility, then derives levels.
    pub async fn levels_for(
        &self,
        ticker: &str,
        entry_price: f64,
        regime: RegimeClass,
        as_of: NaiveDate,
    ) -> Result<Estimate<RiskLevels>, RiskError> {
        let volatility = self.volatility.estimate(ticker, as_of).await.into_value();
        let levels = self.levels(entry_price, volatility, regime)?;
        tracing::info!(
            "{} risk levels @ {:.0}: stop {:.0} ({:.2}%), target {:.0} ({:.2}%), vol {:.2}%, regime {}",
            ticker,
            entry_price,
            levels.value().stop_loss,
            levels.value().stop_loss_percent,
            levels.value().target_price,
            levels.value().take_profit_percent,
            volatility,
            regime
        );
        Ok(levels)
    }
}
