mod config;
mod data;
mod error;
mod portfolio;
mod projection;
mod server;
mod stats;

use anyhow::{Context, Result};
use clap::Parser;
use data::{DataProviderMode, ProviderConfig};
use portfolio::SamplerConfig;
use projection::{OutputFormat, TokenAllocationReport};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Sharpe Oracle: max-Sharpe allocation between portfolio tokens via Monte Carlo sampling",
    after_help = "EXAMPLES:
    # One-shot optimization with Binance daily klines
    cargo run --release

    # Reproducible run against CoinGecko, printing the oracle payload
    cargo run --release -- --provider coingecko --seed 42 --format oracle

    # Offline run that also dumps every sampled portfolio
    cargo run --release -- --provider mock --frontier-out frontier.json

    # Serve GET /optimize and /api/oracle
    cargo run --release -- --serve --port 8080"
)]
struct Args {
    /// Price history source
    #[arg(long, value_enum, env = "SHARPE_ORACLE_PROVIDER", default_value_t = DataProviderMode::Binance)]
    provider: DataProviderMode,

    /// Observations per asset (days for coingecko). Defaults per provider.
    #[arg(long, env = "SHARPE_ORACLE_LOOKBACK")]
    lookback: Option<usize>,

    /// Number of random portfolios to sample
    #[arg(long, env = "SHARPE_ORACLE_SAMPLES", default_value_t = config::OPTIMIZER_SAMPLES)]
    samples: usize,

    /// Fixed RNG seed for reproducible results
    #[arg(long, env = "SHARPE_ORACLE_SEED")]
    seed: Option<u64>,

    /// JSON file with the ordered token list (defaults to the built-in GOLD/FIAT pair)
    #[arg(long, env = "SHARPE_ORACLE_PORTFOLIO_FILE")]
    portfolio_file: Option<PathBuf>,

    /// Output projection for one-shot runs
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write every viable sampled portfolio to this JSON file
    #[arg(long)]
    frontier_out: Option<PathBuf>,

    /// Run the HTTP server instead of a one-shot optimization
    #[arg(long)]
    serve: bool,

    /// HTTP server port
    #[arg(long, env = "SHARPE_ORACLE_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Deadline for one search started by the server, in seconds
    #[arg(long, env = "SHARPE_ORACLE_TIMEOUT_SECS", default_value_t = config::DEFAULT_SEARCH_TIMEOUT_SECS)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sharpe_oracle=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    config::init_cpu_parallelism();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let assets = match &args.portfolio_file {
        Some(path) => config::load_portfolio(path)?,
        None => config::default_portfolio(),
    };
    let provider = ProviderConfig::new(args.provider, args.lookback);

    if args.serve {
        let settings = server::ServerSettings {
            assets,
            provider,
            num_samples: args.samples,
            seed: args.seed,
            search_timeout: std::time::Duration::from_secs(args.timeout_secs),
        };
        return server::run_server(args.port, settings).await;
    }

    let sampler = SamplerConfig::default()
        .with_samples(args.samples)
        .with_seed(args.seed);

    let prices = data::fetch_portfolio_prices(&assets, &provider).await?;
    let alloc = portfolio::allocate_blocking(
        &assets,
        prices.clone(),
        provider.mode.as_str(),
        sampler.clone(),
    )
    .await?;

    if let Some(path) = &args.frontier_out {
        write_frontier(prices, sampler.with_seed(Some(alloc.result.seed)), path).await?;
    }

    match args.format {
        OutputFormat::Text => {
            portfolio::print_allocation(&alloc);
            println!(
                "First Token Weight: {:.4}",
                projection::first_weight_percent(&alloc.result)
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&alloc)?),
        OutputFormat::Oracle => {
            let report = TokenAllocationReport::from_allocation(&alloc);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    info!("Portfolio optimization completed.");
    Ok(())
}

/// Replays the search on the same prices and seed as the reported result and
/// writes every viable draw.
async fn write_frontier(prices: Vec<Vec<f64>>, sampler: SamplerConfig, path: &Path) -> Result<()> {
    let (result, samples) = tokio::task::spawn_blocking(move || {
        let aligned = stats::align_to_shortest(&prices)?;
        let returns = stats::ReturnMatrix::from_prices(&aligned)?;
        let cov = stats::CovarianceMatrix::estimate(&returns)?;
        portfolio::collect_samples(&returns, &cov, &sampler)
    })
    .await??;

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer(std::io::BufWriter::new(file), &samples)?;
    info!(
        "Wrote {} sampled portfolios to {} (best draw #{})",
        samples.len(),
        path.display(),
        result.draw_index
    );
    Ok(())
}
