use crate::config::{
    AssetConfig, DEFAULT_BINANCE_LOOKBACK, DEFAULT_COINGECKO_DAYS, DEFAULT_MOCK_LOOKBACK,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::ValueEnum;
use rand::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const BINANCE_MAX_LIMIT: usize = 1000;
const DEFAULT_BINANCE_URL: &str = "https://api.binance.com";
const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com";
const DEFAULT_MOCK_SEED: u64 = 0x5EED_0A11_0C47_1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProviderMode {
    /// Daily klines from Binance, `<SYMBOL>USDT` pairs.
    Binance,
    /// Daily market chart from CoinGecko, by coin id.
    Coingecko,
    /// Seeded random walk, no network.
    Mock,
}

impl DataProviderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Coingecko => "coingecko",
            Self::Mock => "mock",
        }
    }

    pub fn default_lookback(self) -> usize {
        match self {
            Self::Binance => DEFAULT_BINANCE_LOOKBACK,
            Self::Coingecko => DEFAULT_COINGECKO_DAYS,
            Self::Mock => DEFAULT_MOCK_LOOKBACK,
        }
    }
}

/// Where and how price histories are fetched.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub mode: DataProviderMode,
    /// Observations (Binance, mock) or days (CoinGecko) per asset.
    pub lookback: usize,
    pub binance_base_url: String,
    pub coingecko_base_url: String,
    pub retry_attempts: usize,
    pub request_timeout: std::time::Duration,
    pub mock_seed: u64,
}

impl ProviderConfig {
    /// Builds a provider configuration, reading endpoint and retry overrides
    /// from the environment.
    pub fn new(mode: DataProviderMode, lookback: Option<usize>) -> Self {
        Self {
            mode,
            lookback: mode.default_lookback(),
            binance_base_url: env_url("SHARPE_ORACLE_BINANCE_URL", DEFAULT_BINANCE_URL),
            coingecko_base_url: env_url("SHARPE_ORACLE_COINGECKO_URL", DEFAULT_COINGECKO_URL),
            retry_attempts: retry_attempts(),
            request_timeout: std::time::Duration::from_secs(request_timeout_secs()),
            mock_seed: std::env::var("SHARPE_ORACLE_MOCK_SEED")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_MOCK_SEED),
        }
        .with_lookback(lookback.unwrap_or_else(|| mode.default_lookback()))
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        let mut lookback = lookback.max(1);
        if self.mode == DataProviderMode::Binance && lookback > BINANCE_MAX_LIMIT {
            warn!(
                "Binance returns at most {} klines per request; clamping lookback {}",
                BINANCE_MAX_LIMIT, lookback
            );
            lookback = BINANCE_MAX_LIMIT;
        }
        self.lookback = lookback;
        self
    }
}

fn env_url(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn retry_attempts() -> usize {
    std::env::var("SHARPE_ORACLE_RETRY_ATTEMPTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, 8))
        .unwrap_or(3)
}

fn request_timeout_secs() -> u64 {
    std::env::var("SHARPE_ORACLE_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|v| v.clamp(1, 120))
        .unwrap_or(15)
}

async fn retry_sleep(attempt: usize) {
    let millis = (250_u64 * (attempt as u64)).min(1500);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

// ──────────────────────────────────────────────────────────────────────────────
// Price history
// ──────────────────────────────────────────────────────────────────────────────

/// A single closing price observation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PricePoint {
    pub date: DateTime<Utc>,
    pub close: f64,
}

/// Chronologically ordered closes of one asset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PriceHistory {
    pub asset: String,
    pub points: Vec<PricePoint>,
}

impl PriceHistory {
    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Seeded geometric random walk, one point per day ending today.
    pub fn new_mock(asset: &str, days: usize, daily_volatility: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Vec::with_capacity(days);
        let mut current_price: f64 = 100.0;
        let mut current_date = Utc::now() - Duration::days(days as i64);

        for _ in 0..days {
            points.push(PricePoint {
                date: current_date,
                close: current_price,
            });
            let change_pct: f64 = rng.gen_range(-daily_volatility..daily_volatility) + 0.0005;
            current_price *= 1.0 + change_pct;
            current_date += Duration::days(1);
        }

        Self {
            asset: asset.to_string(),
            points,
        }
    }

    fn sort_chronologically(&mut self) {
        self.points.sort_by_key(|p| p.date);
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Binance
// ──────────────────────────────────────────────────────────────────────────────

// open time, open, high, low, close, volume, close time, quote volume,
// trades, taker base, taker quote, ignore
#[derive(Deserialize, Debug)]
struct RawKline(i64, String, String, String, String, String, i64, String, i64, String, String, String);

fn klines_to_history(asset: &str, klines: Vec<RawKline>) -> Result<PriceHistory> {
    if klines.is_empty() {
        return Err(anyhow!("Binance returned no klines for {}", asset));
    }

    let points = klines
        .into_iter()
        .map(|k| {
            let date = Utc
                .timestamp_millis_opt(k.0)
                .single()
                .ok_or_else(|| anyhow!("invalid kline open time {} for {}", k.0, asset))?;
            let close = k
                .4
                .parse::<f64>()
                .with_context(|| format!("invalid kline close '{}' for {}", k.4, asset))?;
            Ok(PricePoint { date, close })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut history = PriceHistory {
        asset: asset.to_string(),
        points,
    };
    history.sort_chronologically();
    Ok(history)
}

async fn fetch_binance(client: &reqwest::Client, symbol: &str, config: &ProviderConfig) -> Result<PriceHistory> {
    let url = format!(
        "{}/api/v3/klines?symbol={}USDT&interval=1d&limit={}",
        config.binance_base_url,
        symbol.trim().to_uppercase(),
        config.lookback
    );
    let klines: Vec<RawKline> = get_json_with_retry(client, &url, symbol, config).await?;
    klines_to_history(symbol, klines)
}

// ──────────────────────────────────────────────────────────────────────────────
// CoinGecko
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct MarketChartResponse {
    prices: Vec<(f64, f64)>,
}

fn market_chart_to_history(coin_id: &str, chart: MarketChartResponse) -> Result<PriceHistory> {
    if chart.prices.is_empty() {
        return Err(anyhow!("CoinGecko returned no prices for {}", coin_id));
    }

    let points = chart
        .prices
        .into_iter()
        .map(|(ts_ms, close)| {
            let date = Utc
                .timestamp_millis_opt(ts_ms as i64)
                .single()
                .ok_or_else(|| anyhow!("invalid market chart timestamp {} for {}", ts_ms, coin_id))?;
            Ok(PricePoint { date, close })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut history = PriceHistory {
        asset: coin_id.to_string(),
        points,
    };
    history.sort_chronologically();
    Ok(history)
}

// Without `interval=daily` CoinGecko answers windows up to 90 days with hourly points.
fn coingecko_url(coin_id: &str, config: &ProviderConfig) -> String {
    format!(
        "{}/api/v3/coins/{}/market_chart?vs_currency=usd&days={}&interval=daily",
        config.coingecko_base_url,
        coin_id.trim().to_lowercase(),
        config.lookback
    )
}

async fn fetch_coingecko(client: &reqwest::Client, coin_id: &str, config: &ProviderConfig) -> Result<PriceHistory> {
    let url = coingecko_url(coin_id, config);
    let chart: MarketChartResponse = get_json_with_retry(client, &url, coin_id, config).await?;
    market_chart_to_history(coin_id, chart)
}

async fn get_json_with_retry<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    label: &str,
    config: &ProviderConfig,
) -> Result<T> {
    let attempts = config.retry_attempts;
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts {
        match client
            .get(url)
            .timeout(config.request_timeout)
            .send()
            .await
        {
            Ok(resp) => match resp.error_for_status() {
                Ok(ok_resp) => match ok_resp.json::<T>().await {
                    Ok(parsed) => return Ok(parsed),
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }

        if attempt < attempts {
            warn!(
                "{} history fetch retry for {} ({}/{})",
                config.mode.as_str(),
                label,
                attempt,
                attempts
            );
            retry_sleep(attempt).await;
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} history fetch failed for {}", config.mode.as_str(), label)))
}

// ──────────────────────────────────────────────────────────────────────────────
// Entry points
// ──────────────────────────────────────────────────────────────────────────────

fn mock_history(asset: &AssetConfig, index: usize, config: &ProviderConfig) -> PriceHistory {
    // Later assets get calmer walks so the default pair looks like volatile vs stable.
    let volatility = 0.04 / (index as f64 + 1.0).powi(2);
    let seed = config.mock_seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    PriceHistory::new_mock(&asset.key, config.lookback, volatility, seed)
}

/// Fetches the history of one asset with the configured provider.
pub async fn fetch_history(
    client: &reqwest::Client,
    asset: &AssetConfig,
    index: usize,
    config: &ProviderConfig,
) -> Result<PriceHistory> {
    match config.mode {
        DataProviderMode::Binance => fetch_binance(client, &asset.symbol, config).await,
        DataProviderMode::Coingecko => fetch_coingecko(client, &asset.coingecko_id, config).await,
        DataProviderMode::Mock => Ok(mock_history(asset, index, config)),
    }
}

/// Closing-price series for every asset, in portfolio order. Any failed
/// fetch fails the whole call.
pub async fn fetch_portfolio_prices(
    assets: &[AssetConfig],
    config: &ProviderConfig,
) -> Result<Vec<Vec<f64>>> {
    let client = reqwest::Client::new();
    let mut prices = Vec::with_capacity(assets.len());

    for (index, asset) in assets.iter().enumerate() {
        let history = fetch_history(&client, asset, index, config)
            .await
            .with_context(|| {
                format!(
                    "price fetch failed before computation: asset={}, provider={}, lookback={}",
                    asset.key,
                    config.mode.as_str(),
                    config.lookback
                )
            })?;
        info!(
            "Fetched {} closes for {} from {}",
            history.len(),
            asset.key,
            config.mode.as_str()
        );
        prices.push(history.closes());
    }

    Ok(prices)
}
