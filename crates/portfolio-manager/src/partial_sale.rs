use chrono::{DateTime, Utc};

use crate::models::{PartialSaleRecord, PositionError};

pub const DEFAULT_PARTIAL_SELL_RATIO: f64 = 0.5;

/// Applies partial and final exits to a [`PartialSaleRecord`], keeping the
/// remaining quantity in range and the average sell price quantity-weighted.
#[derive(Debug, Clone)]
pub struct PartialSaleTracker {
    partial_sell_ratio: f64,
}

impl PartialSaleTracker {
    pub fn new(partial_sell_ratio: f64) -> Result<Self, PositionError> {
        if !(partial_sell_ratio > 0.0 && partial_sell_ratio <= 1.0) {
            return Err(PositionError::InvalidSale(format!(
                "partial sell ratio {} must be in (0, 1]",
                partial_sell_ratio
            )));
        }
        Ok(Self { partial_sell_ratio })
    }

    pub fn partial_sell_ratio(&self) -> f64 {
        self.partial_sell_ratio
    }

    /// Record that `fraction` of the *remaining* quantity was sold at `price`.
    /// Returns the quantity (in record units) that was sold.
    pub fn record_sale(
        &self,
        record: &mut PartialSaleRecord,
        fraction: f64,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<f64, PositionError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(PositionError::InvalidSale(format!(
                "{}: fraction {} must be in (0, 1]",
                record.ticker, fraction
            )));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(PositionError::InvalidSale(format!(
                "{}: sell price {} must be positive",
                record.ticker, price
            )));
        }
        if record.remaining_quantity <= 0.0 {
            return Err(PositionError::InvalidSale(format!(
                "{}: nothing left to sell",
                record.ticker
            )));
        }

        let sold_before = record.sold_quantity();
        let sell_qty = record.remaining_quantity * fraction;

        record.avg_sell_price =
            (record.avg_sell_price * sold_before + price * sell_qty) / (sold_before + sell_qty);
        record.remaining_quantity = (record.remaining_quantity - sell_qty).max(0.0);
        record.last_sell_date = Some(at);

        tracing::debug!(
            "{} sold {:.3} units @ {:.0}, remaining {:.3}, avg sell {:.2}",
            record.ticker,
            sell_qty,
            price,
            record.remaining_quantity,
            record.avg_sell_price
        );

        Ok(sell_qty)
    }

    /// The configured partial exit.
    pub fn record_partial(
        &self,
        record: &mut PartialSaleRecord,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<f64, PositionError> {
        self.record_sale(record, self.partial_sell_ratio, price, at)
    }

    /// Sell everything that is left.
    pub fn record_full_exit(
        &self,
        record: &mut PartialSaleRecord,
        price: f64,
        at: DateTime<Utc>,
    ) -> Result<f64, PositionError> {
        self.record_sale(record, 1.0, price, at)
    }
}

impl Default for PartialSaleTracker {
    fn default() -> Self {
        Self {
            partial_sell_ratio: DEFAULT_PARTIAL_SELL_RATIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 7, 2, 0, 0).unwrap()
    }

    #[test]
    fn weighted_average_across_partials() {
        let tracker = PartialSaleTracker::default();
        let mut record = PartialSaleRecord::new("000660", 100_000.0);

        let sold = tracker.record_partial(&mut record, 120_000.0, at()).unwrap();
        assert!((sold - 0.5).abs() < 1e-12);
        assert!(!record.is_untouched());
        assert_eq!(record.avg_sell_price, 120_000.0);

        // 0.25 more at 130k: (0.5*120k + 0.25*130k) / 0.75
        tracker.record_partial(&mut record, 130_000.0, at()).unwrap();
        assert!((record.remaining_quantity - 0.25).abs() < 1e-12);
        let expected = (0.5 * 120_000.0 + 0.25 * 130_000.0) / 0.75;
        assert!((record.avg_sell_price - expected).abs() < 1e-6);
        assert_eq!(record.last_sell_date, Some(at()));
    }

    #[test]
    fn full_exit_empties_record() {
        let tracker = PartialSaleTracker::default();
        let mut record = PartialSaleRecord::new("000660", 100_000.0);
        tracker.record_partial(&mut record, 110_000.0, at()).unwrap();
        tracker.record_full_exit(&mut record, 90_000.0, at()).unwrap();

        assert_eq!(record.remaining_quantity, 0.0);
        assert!((record.avg_sell_price - 100_000.0).abs() < 1e-6);
        assert!(tracker.record_full_exit(&mut record, 90_000.0, at()).is_err());
    }

    #[test]
    fn remaining_never_leaves_range() {
        let tracker = PartialSaleTracker::new(0.3).unwrap();
        let mut record = PartialSaleRecord::new("035720", 50_000.0);
        for _ in 0..20 {
            tracker.record_partial(&mut record, 55_000.0, at()).unwrap();
            assert!(record.remaining_quantity >= 0.0);
            assert!(record.remaining_quantity <= record.initial_quantity);
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(PartialSaleTracker::new(0.0).is_err());
        assert!(PartialSaleTracker::new(1.5).is_err());

        let tracker = PartialSaleTracker::default();
        let mut record = PartialSaleRecord::new("035720", 50_000.0);
        assert!(tracker.record_sale(&mut record, 0.5, 0.0, at()).is_err());
        assert!(tracker.record_sale(&mut record, -0.1, 10.0, at()).is_err());
        assert!(record.is_untouched());
    }
}
