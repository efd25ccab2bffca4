//! HTTP server implementation using Axum.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use conductor_core::config::GatewayConfig;
use conductor_runtime::{Dispatcher, RecentEvents};
use conductor_scheduler::Scheduler;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the pairing code on protected routes.
pub const PAIRING_HEADER: &str = "x-pairing-code";

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Required on `/api` routes when set.
    pub pairing_code: Option<String>,
    /// Job registry, poller and pool.
    pub scheduler: Arc<Scheduler>,
    /// Turns POSTed intents into jobs.
    pub dispatcher: Arc<Dispatcher>,
    /// Recent FSM events, served by `/api/events`.
    pub events: Arc<RecentEvents>,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<RecentEvents>,
    ) -> Self {
        Self {
            gateway_config,
            start_time: std::time::Instant::now(),
            pairing_code: None,
            scheduler,
            dispatcher,
            events,
        }
    }

    pub fn with_pairing_code(mut self, code: Option<String>) -> Self {
        self.pairing_code = code;
        self
    }
}

/// Pairing code for the gateway: `CONDUCTOR_PAIRING_CODE`, else
/// `<dir>/.pairing_code`, else a fresh code written to that file.
/// `None` when the config turns pairing off.
pub fn resolve_pairing_code(config: &GatewayConfig, dir: &Path) -> anyhow::Result<Option<String>> {
    if !config.require_pairing {
        tracing::warn!("⚠️ Pairing disabled: /api routes accept unauthenticated requests");
        return Ok(None);
    }
    if let Ok(code) = std::env::var("CONDUCTOR_PAIRING_CODE") {
        if !code.trim().is_empty() {
            return Ok(Some(code.trim().to_string()));
        }
    }

    let path = dir.join(".pairing_code");
    if let Ok(code) = std::fs::read_to_string(&path) {
        if !code.trim().is_empty() {
            return Ok(Some(code.trim().to_string()));
        }
    }

    let code = uuid::Uuid::new_v4().simple().to_string();
    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, &code)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!("🔑 Generated pairing code, stored in {}", path.display());
    Ok(Some(code))
}

/// Pairing code auth middleware: validates the `X-Pairing-Code` header or `?code=` query.
async fn require_pairing(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.pairing_code else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get(PAIRING_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if from_header == expected {
        return next.run(req).await;
    }

    let from_query = req
        .uri()
        .query()
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.strip_prefix("code="))
        .any(|code| code == expected);
    if from_query {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing pairing code"})),
    )
        .into_response()
}

/// Verify pairing code endpoint (public).
async fn verify_pairing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let code = body["code"].as_str().unwrap_or("");
    match &state.pairing_code {
        Some(expected) if code == expected => Json(serde_json::json!({"ok": true})),
        Some(_) => Json(serde_json::json!({"ok": false, "error": "Invalid pairing code"})),
        None => Json(serde_json::json!({"ok": true})),
    }
}

/// CORS for the configured origins. No origins means no cross-origin access.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    if origins.iter().any(|o| o.trim() == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(origins)
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.gateway_config.cors_origins);
    let shared = Arc::new(state);

    // Protected routes: require the pairing code
    let protected = Router::new()
        // Intent dispatch
        .route(
            "/api/jobs",
            get(super::routes::list_jobs).post(super::routes::dispatch_intent),
        )
        .route("/api/tasks", post(super::routes::dispatch_intent))
        .route("/api/webhook", post(super::routes::dispatch_intent))
        .route("/api/webhook/{*source}", post(super::routes::dispatch_intent))
        // Job admin
        .route(
            "/api/jobs/{id}",
            get(super::routes::get_job).delete(super::routes::cancel_job),
        )
        .route("/api/jobs/{id}/schedule", put(super::routes::reschedule_job))
        .route("/api/stats", get(super::routes::scheduler_stats))
        .route("/api/events", get(super::routes::recent_events))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_pairing,
        ));

    // Public routes
    let public = Router::new()
        .route("/api/verify-pairing", post(verify_pairing))
        .route("/metrics", get(super::routes::metrics))
        .route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server and serve until `shutdown` resolves.
pub async fn start<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!("🌐 Gateway server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_disabled() {
        let config = GatewayConfig {
            require_pairing: false,
            ..GatewayConfig::default()
        };
        let dir = std::env::temp_dir().join(format!("conductor-pair-{}", uuid::Uuid::new_v4()));
        assert!(resolve_pairing_code(&config, &dir).unwrap().is_none());
        assert!(!dir.exists());
    }

    #[test]
    fn test_pairing_code_generated_once() {
        if std::env::var("CONDUCTOR_PAIRING_CODE").is_ok() {
            return;
        }
        let dir = std::env::temp_dir().join(format!("conductor-pair-{}", uuid::Uuid::new_v4()));
        let config = GatewayConfig::default();

        let first = resolve_pairing_code(&config, &dir).unwrap().unwrap();
        assert_eq!(first.len(), 32);
        let second = resolve_pairing_code(&config, &dir).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(
            std::fs::read_to_string(dir.join(".pairing_code")).unwrap(),
            first
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
