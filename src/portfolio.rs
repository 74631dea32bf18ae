use crate::config::{AssetConfig, CANCEL_CHECK_INTERVAL, DRAWS_PER_CHUNK, OPTIMIZER_SAMPLES};
use crate::data::{self, ProviderConfig};
use crate::error::OptimizerError;
use crate::stats::{self, CovarianceMatrix, ReturnMatrix};
use anyhow::Result;
use rand::distributions::Open01;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// Knobs of one Monte Carlo search.
#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub num_samples: usize,
    /// Fixed seed for reproducible runs; drawn from entropy when `None`.
    pub seed: Option<u64>,
    /// Set to `true` from outside to abort the search.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_samples: OPTIMIZER_SAMPLES,
            seed: None,
            cancel: None,
        }
    }
}

impl SamplerConfig {
    pub fn with_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// One scored draw.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioSample {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

/// A viable draw together with its position in the draw sequence.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexedSample {
    pub index: usize,
    #[serde(flatten)]
    pub sample: PortfolioSample,
}

/// The maximum-Sharpe draw of a search.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationResult {
    pub best: PortfolioSample,
    pub draw_index: usize,
    pub seed: u64,
    pub samples: usize,
    pub viable_draws: usize,
    pub degenerate_draws: usize,
}

impl OptimizationResult {
    pub fn weights(&self) -> &[f64] {
        &self.best.weights
    }

    /// Weight of `asset` expressed in percent.
    pub fn weight_percent(&self, asset: usize) -> Option<f64> {
        self.best.weights.get(asset).map(|w| w * 100.0)
    }
}

/// Complete output of the fetch → estimate → search pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PortfolioAllocation {
    pub assets: Vec<AssetConfig>,
    pub provider: String,
    /// Aligned price observations per asset.
    pub observations: usize,
    pub mean_returns: Vec<f64>,
    pub asset_volatilities: Vec<f64>,
    pub result: OptimizationResult,
    pub computed_at: String,
}

// ──────────────────────────────────────────────────────────────────────────────
// Scoring
// ──────────────────────────────────────────────────────────────────────────────

/// Draws `n` values in the open interval (0, 1) and normalizes them onto the
/// simplex.
pub fn draw_weights(rng: &mut impl Rng, n: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..n).map(|_| rng.sample(Open01)).collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / sum).collect()
}

/// Weighted sum of per-asset mean returns.
pub fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

pub fn portfolio_volatility(weights: &[f64], cov: &CovarianceMatrix) -> f64 {
    cov.quadratic_form(weights).sqrt()
}

/// Scores a weight vector. Sharpe is `return / volatility` with no
/// risk-free rate. Returns `None` for a degenerate draw (zero or non-finite
/// volatility, or a non-finite ratio).
pub fn score(weights: Vec<f64>, means: &[f64], cov: &CovarianceMatrix) -> Option<PortfolioSample> {
    let expected_return = portfolio_return(&weights, means);
    let volatility = portfolio_volatility(&weights, cov);
    if !volatility.is_finite() || volatility <= 0.0 {
        return None;
    }

    let sharpe_ratio = expected_return / volatility;
    if !sharpe_ratio.is_finite() {
        return None;
    }

    Some(PortfolioSample {
        weights,
        expected_return,
        volatility,
        sharpe_ratio,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Search
// ──────────────────────────────────────────────────────────────────────────────

fn chunk_rng(seed: u64, chunk: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (chunk as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Higher Sharpe wins; equal Sharpe goes to the earlier draw.
fn better(
    a: Option<(usize, PortfolioSample)>,
    b: Option<(usize, PortfolioSample)>,
) -> Option<(usize, PortfolioSample)> {
    match (a, b) {
        (Some(x), Some(y)) => {
            let y_wins = y.1.sharpe_ratio > x.1.sharpe_ratio
                || (y.1.sharpe_ratio == x.1.sharpe_ratio && y.0 < x.0);
            if y_wins { Some(y) } else { Some(x) }
        }
        (x, None) => x,
        (None, y) => y,
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    best: Option<(usize, PortfolioSample)>,
    viable: usize,
    degenerate: usize,
    cancelled: bool,
}

impl ChunkOutcome {
    fn merge(self, other: Self) -> Self {
        Self {
            best: better(self.best, other.best),
            viable: self.viable + other.viable,
            degenerate: self.degenerate + other.degenerate,
            cancelled: self.cancelled || other.cancelled,
        }
    }
}

struct Search<'a> {
    means: Vec<f64>,
    cov: &'a CovarianceMatrix,
    seed: u64,
    num_samples: usize,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Search<'a> {
    fn new(
        returns: &ReturnMatrix,
        cov: &'a CovarianceMatrix,
        config: &'a SamplerConfig,
    ) -> Result<Self, OptimizerError> {
        if config.num_samples == 0 {
            return Err(OptimizerError::InvalidConfig(
                "num_samples must be greater than zero".to_string(),
            ));
        }
        if returns.assets() != cov.dim() {
            return Err(OptimizerError::MisalignedData(format!(
                "{} return series but a {}x{} covariance matrix",
                returns.assets(),
                cov.dim(),
                cov.dim()
            )));
        }

        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
        Ok(Self {
            means: returns.means(),
            cov,
            seed,
            num_samples: config.num_samples,
            cancel: config.cancel.as_deref(),
        })
    }

    fn num_chunks(&self) -> usize {
        self.num_samples.div_ceil(DRAWS_PER_CHUNK)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn run_chunk(&self, chunk: usize, visit: &mut impl FnMut(usize, &PortfolioSample)) -> ChunkOutcome {
        let start = chunk * DRAWS_PER_CHUNK;
        let end = (start + DRAWS_PER_CHUNK).min(self.num_samples);
        let mut rng = chunk_rng(self.seed, chunk);
        let mut outcome = ChunkOutcome::default();

        for index in start..end {
            if (index - start) % CANCEL_CHECK_INTERVAL == 0 && self.cancelled() {
                outcome.cancelled = true;
                break;
            }

            let weights = draw_weights(&mut rng, self.means.len());
            match score(weights, &self.means, self.cov) {
                Some(sample) => {
                    outcome.viable += 1;
                    visit(index, &sample);
                    let replace = outcome
                        .best
                        .as_ref()
                        .is_none_or(|(_, best)| sample.sharpe_ratio > best.sharpe_ratio);
                    if replace {
                        outcome.best = Some((index, sample));
                    }
                }
                None => outcome.degenerate += 1,
            }
        }

        outcome
    }

    fn finish(&self, outcome: ChunkOutcome) -> Result<OptimizationResult, OptimizerError> {
        if outcome.cancelled {
            return Err(OptimizerError::Cancelled {
                completed_draws: outcome.viable + outcome.degenerate,
            });
        }

        if outcome.degenerate > 0 {
            warn!(
                "Excluded {} of {} draws with zero or non-finite volatility",
                outcome.degenerate, self.num_samples
            );
        }

        let Some((draw_index, best)) = outcome.best else {
            return Err(OptimizerError::NoViableAllocation {
                draws: self.num_samples,
            });
        };

        debug!(
            "Best draw #{} (seed {}): weights={:?}, Sharpe={:.6}",
            draw_index, self.seed, best.weights, best.sharpe_ratio
        );

        Ok(OptimizationResult {
            best,
            draw_index,
            seed: self.seed,
            samples: self.num_samples,
            viable_draws: outcome.viable,
            degenerate_draws: outcome.degenerate,
        })
    }
}

/// Monte Carlo maximum-Sharpe search over the weight simplex.
///
/// Draws are split into fixed-size chunks, each with its own RNG stream
/// derived from the seed, and evaluated in parallel. Each chunk keeps its
/// local best and the results are merged by a reduction, so the outcome for a
/// given seed is identical whatever the thread count.
pub fn optimize(
    returns: &ReturnMatrix,
    cov: &CovarianceMatrix,
    config: &SamplerConfig,
) -> Result<OptimizationResult, OptimizerError> {
    let search = Search::new(returns, cov, config)?;
    let outcome = (0..search.num_chunks())
        .into_par_iter()
        .map(|chunk| search.run_chunk(chunk, &mut |_: usize, _: &PortfolioSample| {}))
        .reduce(ChunkOutcome::default, ChunkOutcome::merge);
    search.finish(outcome)
}

/// Sequential version of [`optimize`] that reports every viable draw to
/// `visit` in draw order. Produces the same result as [`optimize`].
pub fn optimize_with_visitor(
    returns: &ReturnMatrix,
    cov: &CovarianceMatrix,
    config: &SamplerConfig,
    mut visit: impl FnMut(usize, &PortfolioSample),
) -> Result<OptimizationResult, OptimizerError> {
    let search = Search::new(returns, cov, config)?;
    let mut outcome = ChunkOutcome::default();
    for chunk in 0..search.num_chunks() {
        outcome = outcome.merge(search.run_chunk(chunk, &mut visit));
        if outcome.cancelled {
            break;
        }
    }
    search.finish(outcome)
}

/// Runs the search and keeps every viable draw (efficient-frontier cloud).
pub fn collect_samples(
    returns: &ReturnMatrix,
    cov: &CovarianceMatrix,
    config: &SamplerConfig,
) -> Result<(OptimizationResult, Vec<IndexedSample>), OptimizerError> {
    let mut samples = Vec::with_capacity(config.num_samples.min(DRAWS_PER_CHUNK));
    let result = optimize_with_visitor(returns, cov, config, |index, sample| {
        samples.push(IndexedSample {
            index,
            sample: sample.clone(),
        });
    })?;
    Ok((result, samples))
}

// ──────────────────────────────────────────────────────────────────────────────
// Pipeline
// ──────────────────────────────────────────────────────────────────────────────

/// Price series (one per asset, in asset order) → allocation.
pub fn allocate_from_prices(
    assets: &[AssetConfig],
    prices: &[Vec<f64>],
    provider: &str,
    config: &SamplerConfig,
) -> Result<PortfolioAllocation, OptimizerError> {
    if assets.len() != prices.len() {
        return Err(OptimizerError::MisalignedData(format!(
            "{} assets configured but {} price series supplied",
            assets.len(),
            prices.len()
        )));
    }

    let aligned = stats::align_to_shortest(prices)?;
    let observations = aligned[0].len();
    let returns = ReturnMatrix::from_prices(&aligned)?;
    let cov = CovarianceMatrix::estimate(&returns)?;

    info!(
        "Optimizing portfolio with {} assets, {} aligned observations, {} random samples...",
        assets.len(),
        observations,
        config.num_samples
    );

    let mean_returns = returns.means();
    let asset_volatilities: Vec<f64> = (0..cov.dim()).map(|i| cov.variance(i).sqrt()).collect();
    for (i, asset) in assets.iter().enumerate() {
        info!(
            "  {} ({}): E[r]={:.6}, σ={:.6}",
            asset.key, asset.symbol, mean_returns[i], asset_volatilities[i]
        );
    }

    let result = optimize(&returns, &cov, config)?;
    info!(
        "Max Sharpe {:.4} at draw #{} with weights {:?}",
        result.best.sharpe_ratio, result.draw_index, result.best.weights
    );

    Ok(PortfolioAllocation {
        assets: assets.to_vec(),
        provider: provider.to_string(),
        observations,
        mean_returns,
        asset_volatilities,
        result,
        computed_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Runs [`allocate_from_prices`] on the blocking pool.
pub async fn allocate_blocking(
    assets: &[AssetConfig],
    prices: Vec<Vec<f64>>,
    provider: &'static str,
    config: SamplerConfig,
) -> Result<PortfolioAllocation> {
    let assets = assets.to_vec();
    let allocation = tokio::task::spawn_blocking(move || {
        allocate_from_prices(&assets, &prices, provider, &config)
    })
    .await??;
    Ok(allocation)
}

/// Full pipeline: fetch prices → estimate → search.
pub async fn run_portfolio_optimization(
    assets: &[AssetConfig],
    provider: &ProviderConfig,
    config: SamplerConfig,
) -> Result<PortfolioAllocation> {
    info!(
        "=== Sharpe Oracle ===\n  Assets: {:?}\n  Provider: {}\n  Samples: {}",
        assets.iter().map(|a| a.key.as_str()).collect::<Vec<_>>(),
        provider.mode.as_str(),
        config.num_samples
    );

    let prices = data::fetch_portfolio_prices(assets, provider).await?;
    allocate_blocking(assets, prices, provider.mode.as_str(), config).await
}

const REPORT_INNER_WIDTH: usize = 60;

fn box_rule(left: char, right: char) -> String {
    format!("{}{}{}", left, "═".repeat(REPORT_INNER_WIDTH), right)
}

/// Pads (or cuts) `content` so the right border always lines up.
fn box_row(content: &str) -> String {
    let text: String = content.chars().take(REPORT_INNER_WIDTH - 2).collect();
    format!("║  {:<width$}║", text, width = REPORT_INNER_WIDTH - 2)
}

/// The boxed console report, one string per line.
pub fn allocation_report(alloc: &PortfolioAllocation) -> Vec<String> {
    let best = &alloc.result.best;
    let mut lines = vec![
        box_rule('╔', '╗'),
        format!(
            "║{:^width$}║",
            "Max-Sharpe Portfolio Allocation",
            width = REPORT_INNER_WIDTH
        ),
        box_rule('╠', '╣'),
        box_row(&format!(
            "Expected Return / period : {:>+10.4}%",
            best.expected_return * 100.0
        )),
        box_row(&format!(
            "Volatility / period      : {:>10.4}%",
            best.volatility * 100.0
        )),
        box_row(&format!("Sharpe Ratio (rf = 0)    : {:>10.4}", best.sharpe_ratio)),
        box_row(&format!("Viable draws             : {}", alloc.result.viable_draws)),
        box_row(&format!("Total draws              : {}", alloc.result.samples)),
        box_rule('╠', '╣'),
        box_row("Key     Symbol    Weight     E[r]       σ"),
        box_rule('╠', '╣'),
    ];

    for (i, asset) in alloc.assets.iter().enumerate() {
        lines.push(box_row(&format!(
            "{:<7} {:<8} {:>7.2}%  {:>+8.4}%  {:>7.4}%",
            asset.key,
            asset.symbol,
            best.weights[i] * 100.0,
            alloc.mean_returns[i] * 100.0,
            alloc.asset_volatilities[i] * 100.0
        )));
    }

    lines.push(box_rule('╠', '╣'));
    lines.push(box_row(&format!(
        "Provider: {:<10} Observations: {}",
        alloc.provider, alloc.observations
    )));
    lines.push(box_row(&format!("Seed: {}", alloc.result.seed)));
    lines.push(box_rule('╚', '╝'));
    lines
}

/// Pretty-prints the allocation to stdout.
pub fn print_allocation(alloc: &PortfolioAllocation) {
    println!();
    for line in allocation_report(alloc) {
        println!("{}", line);
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
