use anyhow::{anyhow, Context, Result};
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads for portfolio sampling",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Number of random portfolios sampled per optimization.
pub const OPTIMIZER_SAMPLES: usize = 100_000;

/// Draws handled by one independently seeded RNG stream. Fixed so results
/// for a seed do not depend on the thread count.
pub const DRAWS_PER_CHUNK: usize = 4096;

/// The cancellation flag is polled once per this many draws.
pub const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Daily klines requested from Binance (API maximum).
pub const DEFAULT_BINANCE_LOOKBACK: usize = 1000;

/// Days of market chart requested from CoinGecko.
pub const DEFAULT_COINGECKO_DAYS: usize = 90;

/// Observations generated per asset by the mock provider.
pub const DEFAULT_MOCK_LOOKBACK: usize = 365;

pub const DEFAULT_PORT: u16 = 8080;

/// Deadline for one search started from the HTTP server.
pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 30;

// ──────────────────────────────────────────────────────────────────────────────
// Token metadata
// ──────────────────────────────────────────────────────────────────────────────

/// One asset of the portfolio. Only `symbol` / `coingecko_id` reach the price
/// provider; the rest is carried through to the projected output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub key: String,
    pub name: String,
    /// Exchange ticker, quoted against USDT on Binance.
    pub symbol: String,
    /// CoinGecko coin id.
    pub coingecko_id: String,
    pub address: String,
    pub decimals: u8,
    pub price_feed_address: String,
}

pub fn default_portfolio() -> Vec<AssetConfig> {
    vec![
        AssetConfig {
            key: "GOLD".to_string(),
            name: "Gold Token".to_string(),
            symbol: "WBTC".to_string(),
            coingecko_id: "bitcoin".to_string(),
            address: "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599".to_string(),
            decimals: 8,
            price_feed_address: "0x5fb1616F78dA7aFC9FF79e0371741a747D2a7F22".to_string(),
        },
        AssetConfig {
            key: "FIAT".to_string(),
            name: "USD".to_string(),
            symbol: "LINK".to_string(),
            coingecko_id: "ethereum".to_string(),
            address: "0x514910771AF9Ca656af840dff83E8264EcF986CA".to_string(),
            decimals: 18,
            price_feed_address: "0x42585eD362B3f1BCa95c640FdFf35Ef899212734".to_string(),
        },
    ]
}

/// Loads an ordered asset list from a JSON array file.
pub fn load_portfolio(path: &Path) -> Result<Vec<AssetConfig>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open portfolio file {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let assets: Vec<AssetConfig> = serde_json::from_reader(reader)
        .with_context(|| format!("failed to parse portfolio file {}", path.display()))?;
    validate_portfolio(&assets)?;
    info!("Loaded {} assets from {}", assets.len(), path.display());
    Ok(assets)
}

pub fn validate_portfolio(assets: &[AssetConfig]) -> Result<()> {
    if assets.is_empty() {
        return Err(anyhow!("portfolio must contain at least one asset"));
    }

    let mut seen = HashSet::new();
    for asset in assets {
        if asset.key.trim().is_empty() {
            return Err(anyhow!("asset key cannot be empty"));
        }
        if !seen.insert(asset.key.as_str()) {
            return Err(anyhow!("duplicate asset key '{}'", asset.key));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_portfolio_is_valid() {
        let assets = default_portfolio();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].key, "GOLD");
        assert_eq!(assets[1].decimals, 18);
        assert!(validate_portfolio(&assets).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        let mut assets = default_portfolio();
        assets[1].key = "GOLD".to_string();
        assert!(validate_portfolio(&assets).is_err());
        assert!(validate_portfolio(&[]).is_err());
    }

    #[test]
    fn test_load_portfolio_roundtrips_json() {
        let path = std::env::temp_dir().join(format!(
            "sharpe_oracle_portfolio_{}.json",
            std::process::id()
        ));
        let assets = default_portfolio();
        std::fs::write(&path, serde_json::to_string(&assets).unwrap()).unwrap();

        let loaded = load_portfolio(&path).unwrap();
        assert_eq!(loaded, assets);

        let _ = std::fs::remove_file(&path);
    }
}
