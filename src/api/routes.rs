/*
* Balancer HTTP API
* -----------------
* All routes live under `server.api_prefix` (default /api/v1):
*
* GET  /balancer/analyze?cluster=            - Plans a pass, moves nothing
* POST /balancer/execute                     - Plans and (unless dry_run) relocates
* GET  /balancer/config                      - Saved overrides and the effective config
* POST /balancer/config                      - Replaces the saved overrides
* GET  /balancer/migrations?limit=&status=   - Ledger records, newest first
* GET  /balancer/migrations/{id}             - One ledger record
* GET  /balancer/best-node?cpu=&memory=&disk= - Placement hint for a new guest
*
* Saved overrides are read on every request, so a POST to /balancer/config takes
* effect on the next pass without a restart.
*/

use axum::{
    extract::{Path, Query, State},
    http::Uri,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::info;

use super::error::ApiError;
use crate::cluster::{Analysis, Balancer, ExecutionOutcome};
use crate::config::{BalancingConfig, BalancingOverrides, OverrideStore, Settings};
use crate::core::resources::Resources;
use crate::migration::{MigrationRecord, MigrationStatus};

const DEFAULT_MIGRATION_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<Balancer>,
    /// Settings without persisted overrides; those come from `overrides` per request.
    pub settings: Arc<Settings>,
    pub overrides: OverrideStore,
    pub shutdown: CancellationToken,
}

impl AppState {
    fn cluster(&self, requested: Option<String>) -> String {
        requested.unwrap_or_else(|| self.settings.collector.default_cluster.clone())
    }

    async fn effective(&self, request: Option<&BalancingOverrides>) -> Result<BalancingConfig, ApiError> {
        let saved = self.overrides.load().await?;
        let merged = match request {
            Some(request) => saved.merge(request),
            None => saved,
        };
        let config = merged.apply(&self.settings.balancing);
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
pub struct ClusterQuery {
    pub cluster: Option<String>,
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub config: Option<BalancingOverrides>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigView {
    pub saved: BalancingOverrides,
    pub effective: BalancingConfig,
}

#[derive(Debug, Deserialize)]
pub struct MigrationQuery {
    pub limit: Option<usize>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BestNodeQuery {
    pub cluster: Option<String>,
    #[serde(default)]
    pub cpu: f64,
    /// Bytes.
    #[serde(default)]
    pub memory: f64,
    /// Bytes.
    #[serde(default)]
    pub disk: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BestNodeResponse {
    pub node: Option<String>,
    pub demand: Resources,
}

pub fn create_router(state: AppState) -> Router {
    let prefix = state.settings.server.api_prefix.trim_end_matches('/').to_string();
    let body_limit = state.settings.server.body_limit_bytes;

    let balancer_routes = Router::new()
        .route("/balancer/analyze", get(analyze))
        .route("/balancer/execute", post(execute))
        .route("/balancer/config", get(get_config).post(update_config))
        .route("/balancer/migrations", get(list_migrations))
        .route("/balancer/migrations/{id}", get(get_migration))
        .route("/balancer/best-node", get(best_node));

    let api = if prefix.is_empty() {
        balancer_routes
    } else {
        Router::new().nest(&prefix, balancer_routes)
    };

    api.fallback(fallback_handler)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
}

async fn fallback_handler(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri))
}

#[axum::debug_handler]
async fn analyze(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<Analysis>, ApiError> {
    let config = state.effective(None).await?;
    let cluster = state.cluster(query.cluster);
    let analysis = state.balancer.analyze(&cluster, &config, None).await?;
    Ok(Json(analysis))
}

#[axum::debug_handler]
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionOutcome>, ApiError> {
    let config = state.effective(request.config.as_ref()).await?;
    let cluster = state.cluster(request.cluster);
    info!(cluster = %cluster, dry_run = request.dry_run, "Execute requested");
    let outcome = state
        .balancer
        .execute(&cluster, &config, request.dry_run, state.shutdown.child_token())
        .await?;
    Ok(Json(outcome))
}

#[axum::debug_handler]
async fn get_config(State(state): State<AppState>) -> Result<Json<ConfigView>, ApiError> {
    let saved = state.overrides.load().await?;
    let effective = saved.apply(&state.settings.balancing);
    Ok(Json(ConfigView { saved, effective }))
}

#[axum::debug_handler]
async fn update_config(
    State(state): State<AppState>,
    Json(saved): Json<BalancingOverrides>,
) -> Result<Json<ConfigView>, ApiError> {
    let effective = saved.apply(&state.settings.balancing);
    effective.validate()?;
    state.overrides.save(&saved).await?;
    Ok(Json(ConfigView { saved, effective }))
}

#[axum::debug_handler]
async fn list_migrations(
    State(state): State<AppState>,
    Query(query): Query<MigrationQuery>,
) -> Result<Json<Vec<MigrationRecord>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<MigrationStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query.limit.unwrap_or(DEFAULT_MIGRATION_LIMIT);
    Ok(Json(state.balancer.ledger().list(status, Some(limit)).await))
}

#[axum::debug_handler]
async fn get_migration(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<MigrationRecord>, ApiError> {
    Ok(Json(state.balancer.ledger().get(id).await?))
}

#[axum::debug_handler]
async fn best_node(
    State(state): State<AppState>,
    Query(query): Query<BestNodeQuery>,
) -> Result<Json<BestNodeResponse>, ApiError> {
    let demand = Resources::new(query.cpu, query.memory, query.disk);
    if [demand.cpu, demand.memory, demand.disk].iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(ApiError::BadRequest("demand must be finite and non-negative".to_string()));
    }
    let config = state.effective(None).await?;
    let cluster = state.cluster(query.cluster);
    let node = state.balancer.best_node(&cluster, &config, demand).await?;
    Ok(Json(BestNodeResponse { node, demand }))
}
