//! Narrowing of a full allocation into the shapes downstream consumers expect.
//! The optimizer never does this itself.

use crate::portfolio::{OptimizationResult, PortfolioAllocation};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table.
    Text,
    /// Full allocation as JSON.
    Json,
    /// Token report plus the uint256 oracle encoding.
    Oracle,
}

/// Weight of asset 0, in percent.
pub fn first_weight_percent(result: &OptimizationResult) -> f64 {
    result.weight_percent(0).unwrap_or(0.0)
}

/// Body returned by the `/optimize` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightBody {
    pub weight: f64,
}

impl WeightBody {
    pub fn from_result(result: &OptimizationResult) -> Self {
        Self {
            weight: first_weight_percent(result),
        }
    }
}

/// `round(percent)` as a 32-byte big-endian unsigned integer, the layout an
/// oracle callback expects for a `uint256`. Negative or non-finite input
/// encodes as zero.
pub fn oracle_uint256(percent: f64) -> [u8; 32] {
    let rounded = percent.round();
    let value = if rounded.is_finite() && rounded > 0.0 {
        rounded as u128
    } else {
        0
    };

    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

pub fn oracle_hex(percent: f64) -> String {
    format!("0x{}", hex::encode(oracle_uint256(percent)))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OracleResponse {
    pub weight_percent: u64,
    pub uint256_hex: String,
}

impl OracleResponse {
    pub fn from_result(result: &OptimizationResult) -> Self {
        let percent = first_weight_percent(result);
        Self {
            weight_percent: percent.round().max(0.0) as u64,
            uint256_hex: oracle_hex(percent),
        }
    }
}

/// Token metadata next to the chosen weights, in portfolio order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenAllocationReport {
    pub token_addresses: Vec<String>,
    pub token_decimals: Vec<u8>,
    pub price_feed_addresses: Vec<String>,
    pub weights: Vec<f64>,
    pub first_weight_percent: f64,
    pub oracle: OracleResponse,
}

impl TokenAllocationReport {
    pub fn from_allocation(alloc: &PortfolioAllocation) -> Self {
        Self {
            token_addresses: alloc.assets.iter().map(|a| a.address.clone()).collect(),
            token_decimals: alloc.assets.iter().map(|a| a.decimals).collect(),
            price_feed_addresses: alloc
                .assets
                .iter()
                .map(|a| a.price_feed_address.clone())
                .collect(),
            weights: alloc.result.weights().to_vec(),
            first_weight_percent: first_weight_percent(&alloc.result),
            oracle: OracleResponse::from_result(&alloc.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_portfolio;
    use crate::portfolio::PortfolioSample;

    fn result_with(weights: Vec<f64>) -> OptimizationResult {
        OptimizationResult {
            best: PortfolioSample {
                weights,
                expected_return: 0.01,
                volatility: 0.02,
                sharpe_ratio: 0.5,
            },
            draw_index: 3,
            seed: 1,
            samples: 10,
            viable_draws: 10,
            degenerate_draws: 0,
        }
    }

    #[test]
    fn test_weight_body_uses_first_asset() {
        let body = WeightBody::from_result(&result_with(vec![0.6234, 0.3766]));
        assert!((body.weight - 62.34).abs() < 1e-9);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("weight").is_some());
    }

    #[test]
    fn test_oracle_uint256_encoding() {
        let bytes = oracle_uint256(62.5);
        assert_eq!(bytes[31], 63);
        assert!(bytes[..31].iter().all(|b| *b == 0));

        assert_eq!(
            oracle_hex(100.0),
            format!("0x{}64", "0".repeat(62))
        );
        assert_eq!(oracle_uint256(-3.0), [0u8; 32]);
        assert_eq!(oracle_uint256(f64::NAN), [0u8; 32]);
    }

    #[test]
    fn test_oracle_response_rounds_percent() {
        let oracle = OracleResponse::from_result(&result_with(vec![0.4449, 0.5551]));
        assert_eq!(oracle.weight_percent, 44);
        assert!(oracle.uint256_hex.ends_with("2c"));
    }

    #[test]
    fn test_token_report_keeps_portfolio_order() {
        let assets = default_portfolio();
        let alloc = PortfolioAllocation {
            assets: assets.clone(),
            provider: "mock".to_string(),
            observations: 5,
            mean_returns: vec![0.01, 0.001],
            asset_volatilities: vec![0.02, 0.005],
            result: result_with(vec![0.25, 0.75]),
            computed_at: "2024-01-01T00:00:00Z".to_string(),
        };

        let report = TokenAllocationReport::from_allocation(&alloc);
        assert_eq!(report.token_addresses[0], assets[0].address);
        assert_eq!(report.token_decimals, vec![8, 18]);
        assert_eq!(report.price_feed_addresses[1], assets[1].price_feed_address);
        assert_eq!(report.weights, vec![0.25, 0.75]);
        assert!((report.first_weight_percent - 25.0).abs() < 1e-12);
        assert_eq!(report.oracle.weight_percent, 25);
    }
}
