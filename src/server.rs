use crate::config::AssetConfig;
use crate::data::ProviderConfig;
use crate::error::OptimizerError;
use crate::portfolio::{self, PortfolioAllocation, SamplerConfig};
use crate::projection::{OracleResponse, WeightBody};
use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Hard cap on draws a single request may ask for.
pub const MAX_SAMPLES_PER_REQUEST: usize = 2_000_000;

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub assets: Vec<AssetConfig>,
    pub provider: ProviderConfig,
    pub num_samples: usize,
    pub seed: Option<u64>,
    pub search_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    settings: Arc<ServerSettings>,
    runtime: Arc<Mutex<RuntimeState>>,
}

#[derive(Clone, Debug, Serialize, Default)]
struct RuntimeState {
    last_allocation: Option<PortfolioAllocation>,
    last_error: Option<String>,
    updated_at: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize, Default)]
struct OptimizeRequest {
    samples: Option<usize>,
    seed: Option<u64>,
    lookback: Option<usize>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(full_state))
        .route("/optimize", get(optimize_weight))
        .route("/api/optimize", post(optimize_full))
        .route("/api/oracle", get(oracle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(port: u16, settings: ServerSettings) -> Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        runtime: Arc::new(Mutex::new(RuntimeState::default())),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("Sharpe oracle listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn full_state(State(state): State<AppState>) -> Json<RuntimeState> {
    Json(state.runtime.lock().await.clone())
}

async fn optimize_weight(State(state): State<AppState>) -> ApiResult<WeightBody> {
    let alloc = run_with_deadline(&state, OptimizeRequest::default()).await?;
    Ok(Json(WeightBody::from_result(&alloc.result)))
}

async fn optimize_full(
    State(state): State<AppState>,
    Json(req): Json<OptimizeRequest>,
) -> ApiResult<PortfolioAllocation> {
    run_with_deadline(&state, req).await.map(Json)
}

async fn oracle(State(state): State<AppState>) -> ApiResult<OracleResponse> {
    let alloc = run_with_deadline(&state, OptimizeRequest::default()).await?;
    Ok(Json(OracleResponse::from_result(&alloc.result)))
}

/// Runs one optimization under the configured deadline. On timeout the
/// search is told to stop through its cancellation flag.
async fn run_with_deadline(
    state: &AppState,
    req: OptimizeRequest,
) -> Result<PortfolioAllocation, (StatusCode, Json<ApiError>)> {
    let settings = &state.settings;
    let samples = req.samples.unwrap_or(settings.num_samples);
    if samples == 0 || samples > MAX_SAMPLES_PER_REQUEST {
        return Err(api_err(
            StatusCode::BAD_REQUEST,
            &format!("samples must be between 1 and {}", MAX_SAMPLES_PER_REQUEST),
        ));
    }

    let provider = match req.lookback {
        Some(lookback) => settings.provider.clone().with_lookback(lookback),
        None => settings.provider.clone(),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let config = SamplerConfig::default()
        .with_samples(samples)
        .with_seed(req.seed.or(settings.seed))
        .with_cancel(cancel.clone());

    let outcome = tokio::time::timeout(
        settings.search_timeout,
        portfolio::run_portfolio_optimization(&settings.assets, &provider, config),
    )
    .await;

    let mut runtime = state.runtime.lock().await;
    runtime.updated_at = Some(chrono::Utc::now().to_rfc3339());
    match outcome {
        Ok(Ok(alloc)) => {
            runtime.last_allocation = Some(alloc.clone());
            runtime.last_error = None;
            Ok(alloc)
        }
        Ok(Err(err)) => {
            warn!("Optimization failed: {:#}", err);
            runtime.last_error = Some(format!("{:#}", err));
            Err(api_err(error_status(&err), &format!("{:#}", err)))
        }
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            let msg = format!(
                "optimization exceeded {}s deadline",
                settings.search_timeout.as_secs_f64()
            );
            warn!("{}", msg);
            runtime.last_error = Some(msg.clone());
            Err(api_err(StatusCode::GATEWAY_TIMEOUT, &msg))
        }
    }
}

fn error_status(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<OptimizerError>() {
        Some(OptimizerError::Cancelled { .. }) => StatusCode::GATEWAY_TIMEOUT,
        Some(OptimizerError::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
        None if err.downcast_ref::<tokio::task::JoinError>().is_some() => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        None => StatusCode::BAD_GATEWAY,
    }
}

fn api_err(status: StatusCode, msg: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: msg.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_portfolio;
    use crate::data::DataProviderMode;

    fn mock_state(num_samples: usize, timeout: Duration) -> AppState {
        AppState {
            settings: Arc::new(ServerSettings {
                assets: default_portfolio(),
                provider: ProviderConfig::new(DataProviderMode::Mock, Some(60)),
                num_samples,
                seed: Some(17),
                search_timeout: timeout,
            }),
            runtime: Arc::new(Mutex::new(RuntimeState::default())),
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let input: anyhow::Error = OptimizerError::NonFiniteInput {
            asset: 0,
            period: 2,
            value: 0.0,
        }
        .into();
        assert_eq!(error_status(&input), StatusCode::UNPROCESSABLE_ENTITY);

        let none: anyhow::Error = OptimizerError::NoViableAllocation { draws: 10 }.into();
        assert_eq!(error_status(&none), StatusCode::UNPROCESSABLE_ENTITY);

        let cancelled: anyhow::Error = OptimizerError::Cancelled { completed_draws: 5 }.into();
        assert_eq!(error_status(&cancelled), StatusCode::GATEWAY_TIMEOUT);

        let upstream = anyhow::anyhow!("connection refused").context("price fetch failed");
        assert_eq!(error_status(&upstream), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_optimize_weight_returns_percent_and_records_state() {
        let state = mock_state(4000, Duration::from_secs(30));
        let Json(body) = optimize_weight(State(state.clone())).await.unwrap();
        assert!((0.0..=100.0).contains(&body.weight));

        let Json(runtime) = full_state(State(state)).await;
        let alloc = runtime.last_allocation.unwrap();
        assert!((alloc.result.best.weights[0] * 100.0 - body.weight).abs() < 1e-12);
        assert!(runtime.last_error.is_none());
    }

    #[tokio::test]
    async fn test_optimize_full_honours_request_overrides() {
        let state = mock_state(4000, Duration::from_secs(30));
        let req = OptimizeRequest {
            samples: Some(1500),
            seed: Some(99),
            lookback: Some(40),
        };
        let Json(alloc) = optimize_full(State(state), Json(req)).await.unwrap();
        assert_eq!(alloc.observations, 40);
        assert_eq!(alloc.result.samples, 1500);
        assert_eq!(alloc.result.seed, 99);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_samples() {
        let state = mock_state(4000, Duration::from_secs(30));
        let req = OptimizeRequest {
            samples: Some(0),
            ..Default::default()
        };
        let (status, _) = optimize_full(State(state), Json(req)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deadline_returns_gateway_timeout() {
        let state = mock_state(MAX_SAMPLES_PER_REQUEST, Duration::ZERO);
        let (status, Json(err)) = oracle(State(state.clone())).await.unwrap_err();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(err.error.contains("deadline"));

        let Json(runtime) = full_state(State(state)).await;
        assert!(runtime.last_error.is_some());
    }
}
