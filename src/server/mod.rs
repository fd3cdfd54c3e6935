//! HTTP server exposing the consistency check and P&L sync as JSON functions.

mod error;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pnl::{FlatPipValue, PnlSynchronizer, SyncReport, SyncScope};
use crate::risk::{LotSizeGuard, LotSizeRequest};

use error::ApiError;
use types::{LotSizeCheckBody, LotSizeCheckResponse, SyncTradePnlBody};

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    guard: LotSizeGuard,
    synchronizer: Arc<PnlSynchronizer<FlatPipValue>>,
}

impl AppState {
    pub fn new(guard: LotSizeGuard, synchronizer: PnlSynchronizer<FlatPipValue>) -> Self {
        Self {
            guard,
            synchronizer: Arc::new(synchronizer),
        }
    }
}

/// Create the axum router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/functions/v1/lot-size-consistency", post(lot_size_consistency))
        .route("/functions/v1/sync-trade-pnl", post(sync_trade_pnl))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Risk functions listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")
}

/// Parse a JSON body. An empty body reads as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::Validation(format!("Invalid request body: {}", e)))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn lot_size_consistency(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<LotSizeCheckResponse>, ApiError> {
    let body: LotSizeCheckBody = parse_body(&body)?;
    let request = LotSizeRequest::new(
        body.account_id,
        body.user_id,
        body.requested_lot_size,
        body.hard_block,
    )?;

    let outcome = state.guard.check(&request).await?;
    Ok(Json(LotSizeCheckResponse::from(&outcome)))
}

async fn sync_trade_pnl(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncReport>, ApiError> {
    let body: SyncTradePnlBody = parse_body(&body)?;
    let scope = SyncScope {
        user_id: body.user_id.filter(|s| !s.is_empty()),
        account_id: body.account_id.filter(|s| !s.is_empty()),
    };

    let report = state.synchronizer.sync(&scope).await?;
    Ok(Json(report))
}
