//! Pure statistics shared by the trend, volatility and regime calculations.
//! Stateless functions, no I/O.

use statrs::statistics::Statistics;

/// Simple percentage-change series (as fractions). Pairs with a zero base are skipped.
pub fn pct_returns(values: &[f64]) -> Vec<f64> {
    if values.len() < 2 {
        return Vec::new();
    }
    values
        .windows(2)
        .filter_map(|w| {
            if w[0] != 0.0 {
                Some((w[1] - w[0]) / w[0])
            } else {
                None
            }
        })
        .collect()
}

/// Least-squares slope of `values` against their index (0, 1, 2, ...).
pub fn linear_regression_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let sum_x: f64 = (0..n).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_x2: f64 = (0..n).map(|i| (i * i) as f64).sum();

    let denom = n_f * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (n_f * sum_xy - sum_x * sum_y) / denom;
    slope.is_finite().then_some(slope)
}

/// Standard deviation of daily percentage returns, expressed in percent.
///
/// Sample deviation (n - 1). Needs at least two returns (three prices);
/// anything shorter is `None`.
pub fn return_volatility_pct(closes: &[f64]) -> Option<f64> {
    let returns = pct_returns(closes);
    if returns.len() < 2 {
        return None;
    }
    let std = returns.std_dev();
    std.is_finite().then_some(std * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slope_of_straight_line() {
        let values: Vec<f64> = (0..10).map(|i| 100.0 + 2.5 * i as f64).collect();
        let slope = linear_regression_slope(&values).unwrap();
        assert!((slope - 2.5).abs() < 1e-9);
    }

    #[test]
    fn slope_needs_two_points() {
        assert_eq!(linear_regression_slope(&[100.0]), None);
        assert_eq!(linear_regression_slope(&[]), None);
    }

    #[test]
    fn volatility_uses_sample_std() {
        // returns +10%, -10% -> mean 0, sample variance 0.02
        let vol = return_volatility_pct(&[100.0, 110.0, 99.0]).unwrap();
        assert!((vol - 0.02_f64.sqrt() * 100.0).abs() < 1e-9);
    }

    #[test]
    fn steady_growth_has_zero_volatility() {
        let vol = return_volatility_pct(&[100.0, 110.0, 121.0, 133.1]).unwrap();
        assert!(vol.abs() < 1e-9);
    }

    #[test]
    fn volatility_needs_two_returns() {
        assert_eq!(return_volatility_pct(&[100.0, 101.0]), None);
    }

    #[test]
    fn zero_base_is_skipped() {
        assert_eq!(pct_returns(&[0.0, 10.0, 11.0]), vec![0.1]);
    }
}
