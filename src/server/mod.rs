use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::query::gateway::DatabaseExecutor;
use crate::query::{QueryError, QueryValidator, SafetyGateway};
use crate::security::gate::require_auth;
use crate::security::{AuthGateway, Principal};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub auth: Option<Arc<AuthGateway>>,
    pub gateway: SafetyGateway,
    pub executor: Arc<dyn DatabaseExecutor>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>, executor: Arc<dyn DatabaseExecutor>) -> Result<Self> {
        let auth = if config.oidc.is_active() {
            info!(issuer = %config.oidc.issuer_url, "authentication enabled");
            Some(Arc::new(
                AuthGateway::new(config.oidc.clone()).context("building auth gateway")?,
            ))
        } else {
            warn!("authentication is disabled; all requests pass unauthenticated");
            None
        };

        let gateway = SafetyGateway::new(
            QueryValidator::new(config.query.max_length),
            config.query.execution_timeout(),
        );

        Ok(Self {
            config,
            auth,
            gateway,
            executor,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub status: &'static str,
    pub row_limit: u32,
    pub data: serde_json::Value,
}

// Liveness probe; on the default skip list.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

// Auth-provider reachability; on the default skip list.
async fn security_health(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.auth {
        Some(auth) => Json(auth.health().await),
        None => Json(json!({"status": "disabled"})),
    }
}

async fn run_query(
    State(state): State<SharedState>,
    principal: Option<Extension<Principal>>,
    Json(request): Json<QueryRequest>,
) -> axum::response::Response {
    let limit = request
        .limit
        .unwrap_or(state.config.query.default_row_limit)
        .min(state.config.query.max_row_limit);

    if let Some(Extension(principal)) = &principal {
        info!(user_id = %principal.user_id, limit = limit, "query tool invoked");
    } else {
        info!(limit = limit, "query tool invoked without principal");
    }

    match state
        .gateway
        .run(state.executor.as_ref(), &request.query, limit)
        .await
    {
        Ok(data) => Json(QueryResponse {
            status: "success",
            row_limit: limit,
            data,
        })
        .into_response(),
        Err(QueryError::Validation(err)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_query",
                "error_description": err.to_string(),
            })),
        )
            .into_response(),
        Err(QueryError::Execution(err)) => {
            let status = match err {
                crate::query::ExecutionError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                crate::query::ExecutionError::ConnectionFailure(_) => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({
                    "error": "execution_failed",
                    "error_description": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/security", get(security_health))
        .route("/api/v1/tools/query", post(run_query))
        .with_state(Arc::clone(&state));

    if let Some(auth) = &state.auth {
        router = router.layer(middleware::from_fn_with_state(
            Arc::clone(auth),
            require_auth,
        ));
    }
    router
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: GatewayConfig, executor: Arc<dyn DatabaseExecutor>) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(Arc::new(config), executor)?);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "gateway listening");
    axum::serve(listener, router).await.context("serving")?;
    Ok(())
}
