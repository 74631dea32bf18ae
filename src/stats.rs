use crate::error::OptimizerError;
use tracing::debug;

/// Minimum aligned price observations per asset (one return).
pub const MIN_PRICE_OBSERVATIONS: usize = 2;

/// Minimum return periods before a covariance is defined.
pub const MIN_RETURN_PERIODS: usize = 2;

// ──────────────────────────────────────────────────────────────────────────────
// Alignment
// ──────────────────────────────────────────────────────────────────────────────

/// Truncates every price series to the length of the shortest one, keeping
/// the same leading prefix of each so that index `t` refers to the same
/// observation slot across assets.
pub fn align_to_shortest(series: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, OptimizerError> {
    if series.is_empty() {
        return Err(OptimizerError::MisalignedData(
            "no price series supplied".to_string(),
        ));
    }

    if let Some(asset) = series.iter().position(|s| s.is_empty()) {
        return Err(OptimizerError::MisalignedData(format!(
            "asset {} has no price observations",
            asset
        )));
    }

    let min_len = series.iter().map(Vec::len).min().unwrap_or(0);
    if min_len < MIN_PRICE_OBSERVATIONS {
        return Err(OptimizerError::InsufficientHistory {
            available: min_len,
            required: MIN_PRICE_OBSERVATIONS,
        });
    }

    if series.iter().any(|s| s.len() != min_len) {
        debug!(
            "Truncating {} price series to shortest length {} (lengths: {:?})",
            series.len(),
            min_len,
            series.iter().map(Vec::len).collect::<Vec<_>>()
        );
    }

    Ok(series.iter().map(|s| s[..min_len].to_vec()).collect())
}

// ──────────────────────────────────────────────────────────────────────────────
// Returns
// ──────────────────────────────────────────────────────────────────────────────

/// Simple per-period returns `(p[i] - p[i-1]) / p[i-1]`.
///
/// A zero previous price yields a non-finite value; it is passed through
/// untouched so callers can reject it.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Return series of all assets, asset-major, every row the same length.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnMatrix {
    series: Vec<Vec<f64>>,
}

impl ReturnMatrix {
    /// Converts already aligned price series into returns.
    ///
    /// Non-positive or non-finite prices, and any non-finite return they
    /// produce, are fatal.
    pub fn from_prices(aligned: &[Vec<f64>]) -> Result<Self, OptimizerError> {
        if aligned.is_empty() {
            return Err(OptimizerError::MisalignedData(
                "no price series supplied".to_string(),
            ));
        }

        let len = aligned[0].len();
        if let Some(asset) = aligned.iter().position(|s| s.len() != len) {
            return Err(OptimizerError::MisalignedData(format!(
                "asset {} has {} prices, asset 0 has {}; align before estimating returns",
                asset,
                aligned[asset].len(),
                len
            )));
        }
        if len < MIN_PRICE_OBSERVATIONS {
            return Err(OptimizerError::InsufficientHistory {
                available: len,
                required: MIN_PRICE_OBSERVATIONS,
            });
        }

        for (asset, prices) in aligned.iter().enumerate() {
            if let Some((period, &value)) = prices
                .iter()
                .enumerate()
                .find(|(_, p)| !p.is_finite() || **p <= 0.0)
            {
                return Err(OptimizerError::NonFiniteInput {
                    asset,
                    period,
                    value,
                });
            }
        }

        let series = aligned.iter().map(|p| simple_returns(p)).collect();
        Self::from_returns(series)
    }

    /// Wraps precomputed return series, checking shape and finiteness.
    pub fn from_returns(series: Vec<Vec<f64>>) -> Result<Self, OptimizerError> {
        if series.is_empty() {
            return Err(OptimizerError::MisalignedData(
                "no return series supplied".to_string(),
            ));
        }

        let len = series[0].len();
        if let Some(asset) = series.iter().position(|s| s.len() != len) {
            return Err(OptimizerError::MisalignedData(format!(
                "asset {} has {} returns, asset 0 has {}",
                asset,
                series[asset].len(),
                len
            )));
        }
        if len == 0 {
            return Err(OptimizerError::InsufficientHistory {
                available: 1,
                required: MIN_PRICE_OBSERVATIONS,
            });
        }

        for (asset, row) in series.iter().enumerate() {
            if let Some((period, &value)) = row.iter().enumerate().find(|(_, r)| !r.is_finite()) {
                return Err(OptimizerError::NonFiniteInput {
                    asset,
                    period,
                    value,
                });
            }
        }

        Ok(Self { series })
    }

    pub fn assets(&self) -> usize {
        self.series.len()
    }

    pub fn periods(&self) -> usize {
        self.series[0].len()
    }

    pub fn series(&self, asset: usize) -> &[f64] {
        &self.series[asset]
    }

    /// Per-asset mean return, in asset order.
    pub fn means(&self) -> Vec<f64> {
        self.series.iter().map(|s| mean(s)).collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Covariance
// ──────────────────────────────────────────────────────────────────────────────

/// Population covariance (divisor `L`) of the return series.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceMatrix {
    values: Vec<Vec<f64>>,
}

impl CovarianceMatrix {
    /// Computes the upper triangle and mirrors it, so the result is exactly
    /// symmetric.
    pub fn estimate(returns: &ReturnMatrix) -> Result<Self, OptimizerError> {
        let n = returns.assets();
        let periods = returns.periods();
        if periods < MIN_RETURN_PERIODS {
            return Err(OptimizerError::InsufficientHistory {
                available: periods + 1,
                required: MIN_RETURN_PERIODS + 1,
            });
        }

        let means = returns.means();
        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let ri = returns.series(i);
                let rj = returns.series(j);
                let sum: f64 = ri
                    .iter()
                    .zip(rj.iter())
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum();
                let covariance = sum / periods as f64;
                values[i][j] = covariance;
                values[j][i] = covariance;
            }
        }

        Ok(Self { values })
    }

    /// Builds a matrix from explicit rows. Rows must be square.
    #[cfg(test)]
    pub fn from_rows(values: Vec<Vec<f64>>) -> Result<Self, OptimizerError> {
        let n = values.len();
        if n == 0 || values.iter().any(|row| row.len() != n) {
            return Err(OptimizerError::MisalignedData(format!(
                "covariance matrix must be square and non-empty, got {} rows",
                n
            )));
        }
        Ok(Self { values })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    #[cfg(test)]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    pub fn variance(&self, asset: usize) -> f64 {
        self.values[asset][asset]
    }

    /// `wᵀ Σ w`.
    pub fn quadratic_form(&self, weights: &[f64]) -> f64 {
        let mut acc = 0.0;
        for (i, row) in self.values.iter().enumerate() {
            let row_dot: f64 = row.iter().zip(weights.iter()).map(|(c, w)| c * w).sum();
            acc += weights[i] * row_dot;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_simple_returns_known_values() {
        let r = simple_returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.10).abs() < 1e-9);
        assert!((r[1] + 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_simple_returns_propagates_zero_price() {
        let r = simple_returns(&[0.0, 1.0, 2.0]);
        assert!(!r[0].is_finite());
        assert!((r[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_return_matrix_rejects_zero_price() {
        let err = ReturnMatrix::from_prices(&[vec![1.0, 0.0, 2.0]]).unwrap_err();
        assert_eq!(
            err,
            OptimizerError::NonFiniteInput {
                asset: 0,
                period: 1,
                value: 0.0
            }
        );
    }

    #[test]
    fn test_return_matrix_rejects_negative_price() {
        let err = ReturnMatrix::from_prices(&[vec![1.0, 2.0], vec![3.0, -1.0]]).unwrap_err();
        assert!(matches!(err, OptimizerError::NonFiniteInput { asset: 1, period: 1, .. }));
    }

    #[test]
    fn test_return_matrix_requires_equal_lengths() {
        let err = ReturnMatrix::from_prices(&[vec![1.0, 2.0, 3.0], vec![1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, OptimizerError::MisalignedData(_)));
    }

    #[test]
    fn test_align_keeps_common_prefix() {
        let aligned = align_to_shortest(&[
            vec![1.0, 2.0, 3.0, 4.0],
            vec![10.0, 20.0, 30.0],
        ])
        .unwrap();
        assert_eq!(aligned[0], vec![1.0, 2.0, 3.0]);
        assert_eq!(aligned[1], vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_align_rejects_empty_series() {
        let err = align_to_shortest(&[vec![1.0, 2.0], vec![]]).unwrap_err();
        assert!(matches!(err, OptimizerError::MisalignedData(_)));

        let err = align_to_shortest(&[]).unwrap_err();
        assert!(matches!(err, OptimizerError::MisalignedData(_)));
    }

    #[test]
    fn test_align_rejects_single_observation() {
        let err = align_to_shortest(&[vec![1.0, 2.0, 3.0], vec![5.0]]).unwrap_err();
        assert_eq!(
            err,
            OptimizerError::InsufficientHistory {
                available: 1,
                required: 2
            }
        );
    }

    #[test]
    fn test_covariance_single_asset_is_variance() {
        let returns = ReturnMatrix::from_returns(vec![vec![0.1, -0.1, 0.05, 0.0]]).unwrap();
        let cov = CovarianceMatrix::estimate(&returns).unwrap();
        assert_eq!(cov.dim(), 1);

        let m = (0.1 - 0.1 + 0.05 + 0.0) / 4.0;
        let expected = [0.1, -0.1, 0.05, 0.0]
            .iter()
            .map(|r: &f64| (r - m).powi(2))
            .sum::<f64>()
            / 4.0;
        assert!((cov.variance(0) - expected).abs() < 1e-15);
        assert!((cov.quadratic_form(&[1.0]).sqrt() - expected.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_covariance_uses_population_divisor() {
        let returns = ReturnMatrix::from_returns(vec![vec![0.1, -0.1]]).unwrap();
        let cov = CovarianceMatrix::estimate(&returns).unwrap();
        assert!((cov.get(0, 0) - 0.01).abs() < 1e-15);
    }

    #[test]
    fn test_covariance_requires_two_periods() {
        let returns = ReturnMatrix::from_prices(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let err = CovarianceMatrix::estimate(&returns).unwrap_err();
        assert!(matches!(err, OptimizerError::InsufficientHistory { .. }));
    }

    #[test]
    fn test_covariance_of_perfectly_correlated_assets() {
        let a = vec![0.01, -0.02, 0.03, 0.00];
        let b: Vec<f64> = a.iter().map(|r| r * 2.0).collect();
        let returns = ReturnMatrix::from_returns(vec![a, b]).unwrap();
        let cov = CovarianceMatrix::estimate(&returns).unwrap();
        assert!((cov.get(0, 1) - 2.0 * cov.get(0, 0)).abs() < 1e-15);
        assert!((cov.get(1, 1) - 4.0 * cov.get(0, 0)).abs() < 1e-15);
    }

    #[test]
    fn test_covariance_from_rows_rejects_ragged() {
        assert!(CovarianceMatrix::from_rows(vec![vec![1.0, 0.0], vec![0.0]]).is_err());
        assert!(CovarianceMatrix::from_rows(vec![]).is_err());
    }

    proptest! {
        #[test]
        fn covariance_is_symmetric_with_non_negative_diagonal(
            rows in (1usize..5, 2usize..40).prop_flat_map(|(n, l)| {
                prop::collection::vec(prop::collection::vec(-0.5f64..0.5f64, l), n)
            })
        ) {
            let returns = ReturnMatrix::from_returns(rows).unwrap();
            let cov = CovarianceMatrix::estimate(&returns).unwrap();
            for i in 0..cov.dim() {
                prop_assert!(cov.get(i, i) >= 0.0);
                for j in 0..cov.dim() {
                    prop_assert!((cov.get(i, j) - cov.get(j, i)).abs() < 1e-12);
                }
            }
        }

        #[test]
        fn returns_are_one_shorter_than_prices(
            prices in prop::collection::vec(0.01f64..1000.0f64, 2..100)
        ) {
            let returns = ReturnMatrix::from_prices(&[prices.clone()]).unwrap();
            prop_assert_eq!(returns.periods(), prices.len() - 1);
        }
    }
}
