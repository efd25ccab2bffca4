//! API route handlers for the gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use conductor_core::error::ConductorError;
use conductor_runtime::Intent;
use serde_json::Value;
use uuid::Uuid;

use crate::server::AppState;

/// Largest intent body read from a request.
const MAX_INTENT_BODY: usize = 1024 * 1024;

type ApiResponse = (StatusCode, Json<Value>);

fn status_for(err: &ConductorError) -> StatusCode {
    match err {
        ConductorError::CapabilityUnresolved(_) | ConductorError::JobNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ConductorError::CapabilityUnwired(_) => StatusCode::NOT_IMPLEMENTED,
        ConductorError::InvalidTransition(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ConductorError) -> ApiResponse {
    (
        status_for(err),
        Json(serde_json::json!({"ok": false, "error": err.to_string(), "kind": err.kind()})),
    )
}

fn parse_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": format!("invalid job id '{id}'")})),
        )
    })
}

/// Peer address of the connection. `X-Forwarded-For` is only used when the
/// peer is unknown.
fn caller_of(parts: &Parts) -> String {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.to_string();
    }
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResponse {
    let (status, healthy, error) = match state.scheduler.health().await {
        Ok(()) => (StatusCode::OK, "ok", None),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, "degraded", Some(e.to_string())),
    };
    (
        status,
        Json(serde_json::json!({
            "status": healthy,
            "error": error,
            "service": "conductor-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "pool_running": state.scheduler.pool().is_running().await,
        })),
    )
}

/// Turn the request into an intent and dispatch it.
/// 202 with the job id when a job was scheduled. A non-empty body must be JSON.
pub async fn dispatch_intent(State(state): State<Arc<AppState>>, request: Request) -> ApiResponse {
    let (parts, body) = request.into_parts();
    let caller = caller_of(&parts);

    let bytes = match axum::body::to_bytes(body, MAX_INTENT_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ok": false, "error": format!("unreadable body: {e}")})),
            );
        }
    };

    if !bytes.is_empty() && !is_json(&parts.headers) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(serde_json::json!({"ok": false, "error": "intent body must be application/json"})),
        );
    }

    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)));
    let intent = Intent::from_parts(
        parts.method.as_str(),
        parts.uri.path(),
        headers,
        &bytes,
        &caller,
    );

    match state.dispatcher.dispatch(&intent).await {
        Ok(response) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "ok": true,
                "status": "accepted",
                "intent_id": intent.id,
                "job_id": response.job_id,
                "job": response,
            })),
        ),
        Err(e) => {
            let (status, Json(mut body)) = error_response(&e);
            body["intent_id"] = serde_json::json!(intent.id);
            (status, Json(body))
        }
    }
}

/// List all registered jobs.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs: Vec<Value> = state
        .scheduler
        .list_scheduled_jobs()
        .await
        .iter()
        .map(|job| job.to_json())
        .collect();
    Json(serde_json::json!({"ok": true, "total": jobs.len(), "jobs": jobs}))
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.get_job(id).await {
        Ok(job) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "job": job.to_json()})),
        ),
        Err(e) => error_response(&e),
    }
}

/// Cancel a pending job. Running jobs answer 409.
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.scheduler.cancel_job(id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "id": id}))),
        Err(e) => error_response(&e),
    }
}

/// Replace a job's schedule: `{"schedule": "..."}`.
pub async fn reschedule_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(schedule) = body["schedule"].as_str() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "missing 'schedule'"})),
        );
    };
    match state.scheduler.reschedule_job(id, schedule).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "id": id, "schedule": schedule})),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn scheduler_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({"ok": true, "stats": state.scheduler.stats().await}))
}

/// Recent FSM events, oldest first.
pub async fn recent_events(State(state): State<Arc<AppState>>) -> Json<Value> {
    let events: Vec<Value> = state
        .events
        .snapshot()
        .iter()
        .map(|e| Value::Object(e.to_map()))
        .collect();
    Json(serde_json::json!({"ok": true, "events": events}))
}

/// Prometheus text exposition of the dispatch metrics.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("❌ Failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {e}"))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::body::Body;
    use conductor_core::config::GatewayConfig;
    use conductor_runtime::{DispatchMetrics, Dispatcher, RecentEvents};
    use conductor_scheduler::{CommandJob, Job, Scheduler, WorkerPool};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let scheduler = Arc::new(Scheduler::new(
            WorkerPool::new(1).unwrap(),
            Duration::from_secs(60),
        ));
        let events = Arc::new(RecentEvents::new(50));
        let metrics = Arc::new(DispatchMetrics::new("conductor").unwrap());
        let dispatcher = Arc::new(Dispatcher::new(scheduler.clone(), events.clone(), metrics));
        AppState::new(GatewayConfig::default(), scheduler, dispatcher, events)
    }

    async fn call(state: &AppState, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn post(uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, json) = call(&test_state(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "conductor-gateway");
    }

    #[tokio::test]
    async fn test_post_task_schedules_job() {
        let state = test_state();
        let (status, json) = call(
            &state,
            post(
                "/api/tasks",
                serde_json::json!({"schedule": "*/5 * * * *", "command": "backup.sh"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(json["ok"].as_bool().unwrap());

        let id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
        let job = state.scheduler.get_job(id).await.unwrap();
        assert_eq!(job.command(), "backup.sh");
        assert_eq!(job.name(), "/api/tasks");

        let (_, events) = call(&state, get("/api/events")).await;
        let events = events["events"].as_array().unwrap();
        assert_eq!(events.last().unwrap()["to"], "done");
    }

    #[tokio::test]
    async fn test_webhook_not_implemented() {
        let (status, json) = call(
            &test_state(),
            post("/api/webhook/github", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(json["kind"], "capability_unwired");
    }

    #[tokio::test]
    async fn test_header_hints_and_malformed_body() {
        let state = test_state();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .header("X-Command", "echo from-header")
            .body(Body::from("{oops"))
            .unwrap();
        let (status, json) = call(&state, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
        let job = state.scheduler.get_job(id).await.unwrap();
        assert_eq!(job.command(), "echo from-header");
    }

    #[tokio::test]
    async fn test_job_admin_routes() {
        let state = test_state();
        let job = CommandJob::new("nightly", "0 3 * * *", "true");
        let id = job.id();
        state.scheduler.schedule_job(job).await.unwrap();

        let (status, json) = call(&state, get("/api/jobs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);

        let (status, json) = call(&state, get(&format!("/api/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"]["schedule"], "0 3 * * *");

        let request = axum::http::Request::builder()
            .method("PUT")
            .uri(format!("/api/jobs/{id}/schedule"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"schedule":"*/10 * * * *"}"#))
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.scheduler.get_job(id).await.unwrap().schedule(),
            "*/10 * * * *"
        );

        let request = axum::http::Request::builder()
            .method("DELETE")
            .uri(format!("/api/jobs/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = call(&state, get(&format!("/api/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_job_id() {
        let (status, _) = call(&test_state(), get("/api/jobs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = test_state();
        call(&state, post("/api/jobs", serde_json::json!({"command": "true"}))).await;

        let response = build_router(state).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("conductor_intents_total 1"));
        assert!(text.contains("conductor_fsm_total_running_done 1"));
    }

    #[tokio::test]
    async fn test_pairing_code_required_on_api_routes() {
        let state = test_state().with_pairing_code(Some("s3cret".into()));

        let (status, json) = call(&state, post("/api/jobs", serde_json::json!({"command": "true"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["ok"], false);
        assert!(state.scheduler.list_scheduled_jobs().await.is_empty());

        let (status, _) = call(&state, get("/api/jobs")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut request = post("/api/jobs", serde_json::json!({"command": "true"}));
        request
            .headers_mut()
            .insert("X-Pairing-Code", "s3cret".parse().unwrap());
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, json) = call(&state, get("/api/jobs?code=s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);

        // Health and metrics stay public.
        let (status, _) = call(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let response = build_router(state).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cross_origin_plain_text_intent_rejected() {
        let state = test_state();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("origin", "http://evil.example")
            .header("content-type", "text/plain")
            .body(Body::from(r#"{"command":"touch /tmp/never"}"#))
            .unwrap();
        let response = build_router(state.clone()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
        assert!(state.scheduler.list_scheduled_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_configured_cors_origin_allowed() {
        let mut state = test_state();
        state.gateway_config.cors_origins = vec!["https://ops.example.com".into()];

        let mut request = get("/health");
        request
            .headers_mut()
            .insert("origin", "https://ops.example.com".parse().unwrap());
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://ops.example.com"
        );

        let mut request = get("/health");
        request
            .headers_mut()
            .insert("origin", "http://evil.example".parse().unwrap());
        let response = build_router(state).oneshot(request).await.unwrap();
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[test]
    fn test_caller_prefers_peer_address() {
        let forwarded = || {
            axum::http::Request::builder()
                .header("x-forwarded-for", "1.2.3.4, 10.0.0.1")
                .body(())
                .unwrap()
        };
        let (parts, _) = forwarded().into_parts();
        assert_eq!(caller_of(&parts), "1.2.3.4");

        let peer: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        let mut request = forwarded();
        request.extensions_mut().insert(ConnectInfo(peer));
        let (parts, _) = request.into_parts();
        assert_eq!(caller_of(&parts), "10.0.0.7:5555");
    }

    #[test]
    fn test_json_content_types() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "application/json; charset=utf-8".parse().unwrap());
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "application/vnd.api+json".parse().unwrap());
        assert!(is_json(&headers));
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(!is_json(&headers));
    }

    #[tokio::test]
    async fn test_unmapped_capability_error_mapping() {
        let err = ConductorError::CapabilityUnresolved("/unknown".into());
        assert_eq!(status_for(&err), StatusCode::NOT_FOUND);
        let err = ConductorError::Scheduling("down".into());
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
