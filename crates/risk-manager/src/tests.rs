#[cfg(test)]
mod risk_calculator_tests {
    use std::sync::Arc;

    use analysis_core::{Bar, InMemoryPriceData};
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use market_regime_detector::RegimeClass;
    use technical_analysis::VolatilityEstimator;

    use crate::calculator::RiskParameterCalculator;
    use crate::models::*;

    fn calculator_with(data: InMemoryPriceData) -> RiskParameterCalculator {
        RiskParameterCalculator::new(Arc::new(VolatilityEstimator::new(Arc::new(data))))
    }

    fn calculator() -> RiskParameterCalculator {
        calculator_with(InMemoryPriceData::new())
    }

    fn close_to(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn bull_regime_worked_example() {
        let levels = calculator()
            .compute(10_000.0, 30.0, RegimeClass::Bull)
            .unwrap();

        assert!(close_to(levels.stop_loss_percent, 12.0));
        assert!(close_to(levels.take_profit_percent, 26.0));
        assert!(close_to(levels.stop_loss, 8_800.0));
        assert!(close_to(levels.target_price, 12_600.0));
    }

    #[test]
    fn base_percentages_stay_in_bands() {
        let calc = calculator();
        for i in 0..=200 {
            let vol = i as f64 * 0.5;
            let stop = calc.base_stop_loss_percent(vol);
            let target = calc.base_take_profit_percent(vol);
            assert!((3.0..=15.0).contains(&stop), "stop {} at vol {}", stop, vol);
            assert!((5.0..=30.0).contains(&target), "target {} at vol {}", target, vol);
        }
    }

    #[test]
    fn regime_scaling_is_not_reclamped() {
        let calc = calculator();
        // 100% vol clamps the stop to 15, Bull pushes it to 18
        assert!(close_to(calc.stop_loss_percent(100.0, RegimeClass::Bull), 18.0));
        // 0% vol clamps the target to 5, Bear pulls it to 3.5
        assert!(close_to(calc.take_profit_percent(0.0, RegimeClass::Bear), 3.5));
    }

    #[test]
    fn bear_regime_tightens_stop_and_target() {
        let levels = calculator()
            .compute(50_000.0, 15.0, RegimeClass::Bear)
            .unwrap();
        assert!(close_to(levels.stop_loss_percent, 4.0));
        assert!(close_to(levels.take_profit_percent, 7.0));
        assert!(close_to(levels.stop_loss, 48_000.0));
        assert!(close_to(levels.target_price, 53_500.0));
    }

    #[test]
    fn levels_are_ordered_for_any_input() {
        let calc = calculator();
        for regime in [RegimeClass::Bull, RegimeClass::Neutral, RegimeClass::Bear] {
            for vol in [0.0, 1.0, 7.5, 15.0, 40.0, 300.0] {
                for entry in [1.0, 950.0, 72_300.0] {
                    let l = calc.compute(entry, vol, regime).unwrap();
                    assert!(l.stop_loss < l.entry_price && l.entry_price < l.target_price);
                }
            }
        }
    }

    #[test]
    fn same_inputs_same_outputs() {
        let calc = calculator();
        let a = calc.compute(12_345.0, 22.2, RegimeClass::Neutral).unwrap();
        let b = calc.compute(12_345.0, 22.2, RegimeClass::Neutral).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bad_volatility_uses_fixed_band() {
        let est = calculator()
            .levels(10_000.0, f64::NAN, RegimeClass::Neutral)
            .unwrap();
        assert!(est.is_fallback());
        assert!(close_to(est.value().stop_loss, 9_500.0));
        assert!(close_to(est.value().target_price, 11_000.0));
    }

    #[test]
    fn non_positive_entry_is_rejected() {
        let calc = calculator();
        assert_eq!(
            calc.levels(0.0, 15.0, RegimeClass::Neutral).unwrap_err(),
            RiskError::InvalidEntryPrice(0.0)
        );
        assert!(calc.compute(-5.0, 15.0, RegimeClass::Bull).is_err());
    }

    #[tokio::test]
    async fn unknown_ticker_uses_fallback_volatility() {
        let as_of = NaiveDate::from_ymd_opt(2024, 8, 30).unwrap();
        let est = calculator()
            .levels_for("999999", 20_000.0, RegimeClass::Neutral, as_of)
            .await
            .unwrap();

        // 15% fallback volatility -> base 5% / 10%
        assert!(!est.is_fallback());
        assert!(close_to(est.value().stop_loss, 19_000.0));
        assert!(close_to(est.value().target_price, 22_000.0));
    }

    #[tokio::test]
    async fn ticker_volatility_drives_levels() {
        let data = InMemoryPriceData::new();
        let start = Utc.with_ymd_and_hms(2024, 8, 1, 6, 0, 0).unwrap();
        // alternating +-6% moves, a jumpy stock
        let mut price = 10_000.0;
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                price *= if i % 2 == 0 { 1.06 } else { 0.94 };
                Bar::daily_close(start + Duration::days(i), price)
            })
            .collect();
        data.insert("247540", bars);

        let calc = calculator_with(data);
        let as_of = NaiveDate::from_ymd_opt(2024, 8, 30).unwrap();
        let est = calc
            .levels_for("247540", 10_000.0, RegimeClass::Neutral, as_of)
            .await
            .unwrap();

        // about 6% daily vol, well under the 15% reference: stop floors at 3%
        assert!(close_to(est.value().stop_loss_percent, 3.0));
        assert!(close_to(est.value().take_profit_percent, 5.0));
    }
}
