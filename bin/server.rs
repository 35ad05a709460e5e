// Procurement ETL - Health Server
// Serves the consistency audit over HTTP for load balancers and dashboards

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use procurement_etl::{ConsistencyAuditor, ConsistencyReport, EtlConfig, StoreInfo};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<EtlConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Store info response
#[derive(Serialize)]
struct StoresResponse {
    operational: Option<StoreInfo>,
    analytics: Option<StoreInfo>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - full audit; 503 unless HEALTHY
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.clone();
    let audit = tokio::task::spawn_blocking(move || ConsistencyAuditor::new(&config.database).run()).await;

    match audit {
        Ok(report) => {
            let status = health_status(&report);
            (status, Json(ApiResponse::ok(report))).into_response()
        }
        Err(e) => {
            error!(error = %e, "audit task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<ConsistencyReport>::err(format!("Audit task failed: {}", e))),
            )
                .into_response()
        }
    }
}

/// GET /api/stores - table list, row counts and size for both stores
async fn get_stores(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.clone();
    let stores = tokio::task::spawn_blocking(move || {
        let auditor = ConsistencyAuditor::new(&config.database);
        StoresResponse {
            operational: auditor.store_info(&config.database.operational_db_path),
            analytics: auditor.store_info(&config.database.analytics_db_path),
        }
    })
    .await;

    match stores {
        Ok(stores) => (StatusCode::OK, Json(ApiResponse::ok(stores))).into_response(),
        Err(e) => {
            error!(error = %e, "store info task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<StoresResponse>::err(format!("Store info task failed: {}", e))),
            )
                .into_response()
        }
    }
}

fn health_status(report: &ConsistencyReport) -> StatusCode {
    if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/stores", get(get_stores))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌐 Procurement ETL - Health Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = EtlConfig::from_env()?;
    for line in config.summary() {
        println!("   {}", line);
    }

    let state = AppState {
        config: Arc::new(config),
    };

    let addr = std::env::var("ETL_HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   Health: http://{}/api/health", addr);
    println!("   Stores: http://{}/api/stores", addr);
    println!("\n   Press Ctrl+C to stop\n");
    info!(%addr, "health server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
