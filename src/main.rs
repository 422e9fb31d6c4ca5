//! Boleto intake - webhook server that turns a payment slip URL into
//! extracted payment fields.

mod config;
mod error;
mod fetcher;
mod fields;
mod format;
mod gcp_auth;
mod handlers;
mod ocr;
mod pipeline;
mod publisher;
mod storage;
#[cfg(test)]
mod test_support;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::AppConfig;
use error::PipelineError;
use fetcher::Fetcher;
use gcp_auth::{ServiceAccountAuth, STORAGE_SCOPE, VISION_SCOPE};
use handlers::{HandlerRegistry, SlipHandler, SLIP_CLIENT};
use ocr::vision::GoogleVision;
use pipeline::SlipPipeline;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use storage::GcsStore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Inbound payloads are a small JSON document.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<HandlerRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "boleto_intake=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Bucket: {}, work dir: {}, retain uploads: {}",
        config.bucket,
        config.temp_dir.display(),
        config.retain_uploads
    );

    // Google Cloud clients share one connection pool
    let cloud = cloud_client(config.request_timeout)?;
    let storage_auth = ServiceAccountAuth::from_key_file(&config.storage_key_path, STORAGE_SCOPE)?;
    let vision_auth = ServiceAccountAuth::from_key_file(&config.vision_key_path, VISION_SCOPE)?;
    info!(
        "Service accounts loaded: storage={}, vision={}",
        storage_auth.client_email(),
        vision_auth.client_email()
    );

    let store = Arc::new(GcsStore::new(cloud.clone(), config.bucket.clone(), storage_auth));
    let vision = Arc::new(GoogleVision::new(cloud, vision_auth));
    // Downloads are bounded by the fetcher's idle timeout and size ceiling
    let pipeline = SlipPipeline::new(
        Fetcher::new(reqwest::Client::new(), config.fetch_limits()),
        store,
        vision,
        config.job_policy(),
        config.pipeline_settings(),
    );

    let registry = HandlerRegistry::new()
        .register(SLIP_CLIENT, Arc::new(SlipHandler::new(Arc::new(pipeline))));
    info!("Registered clients: {:?}", registry.codes());

    let app = router(AppState {
        registry: Arc::new(registry),
    });

    // Run server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Client for Cloud Storage, Vision and token calls. Every request,
/// body included, must finish within `timeout`.
fn cloud_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyticpay/:client_code", post(webhook))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Dispatch a webhook to the handler registered for `client_code`.
async fn webhook(
    State(state): State<AppState>,
    Path(client_code): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let handler = state.registry.get(&client_code).ok_or_else(|| {
        warn!("Webhook for unknown client: {}", client_code);
        (StatusCode::NOT_FOUND, "Unknown client".to_string())
    })?;

    // A missing or non-JSON body is reported by the handler as bad input
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();

    match handler.handle(payload).await {
        Ok(result) => Ok(Json(result)),
        Err(e @ PipelineError::Input(_)) => {
            warn!("Rejected webhook for {}: {}", client_code, e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            error!("Webhook for {} failed: {}", client_code, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error processing webhook".to_string(),
            ))
        }
    }
}
