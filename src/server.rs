use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::service::{ArchiveService, DetailOutcome, ListOutcome};

// ── Config ──

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// ── Error Handling ──

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", self.0))
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, Json(body)).into_response()
}

// ── Entrypoint ──

pub async fn serve(service: Arc<ArchiveService>, config: ServeConfig) -> anyhow::Result<()> {
    let sessions_dir = service.sessions_dir().display().to_string();
    let app = router(service);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, sessions_dir = %sessions_dir, "session archive listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("session archive stopped");
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(service: Arc<ArchiveService>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Health ──

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

// ── GET /api/sessions ──

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_sessions(
    State(service): State<Arc<ArchiveService>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let outcome = tokio::task::spawn_blocking(move || {
        service.list_summaries(query.limit, if_none_match.as_deref())
    })
    .await?;

    let response = match outcome {
        ListOutcome::NotModified { tag } => (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, tag), (header::CACHE_CONTROL, "no-cache".to_string())],
        )
            .into_response(),
        ListOutcome::Modified { sessions, tag } => (
            StatusCode::OK,
            [(header::ETAG, tag), (header::CACHE_CONTROL, "no-cache".to_string())],
            Json(sessions),
        )
            .into_response(),
    };
    Ok(response)
}

// ── GET /api/sessions/{id} ──

async fn get_session(
    State(service): State<Arc<ArchiveService>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let lookup = id.clone();
    let outcome = tokio::task::spawn_blocking(move || service.get_detail(&lookup)).await?;

    let response = match outcome {
        DetailOutcome::Found(detail) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-cache")],
            Json(detail),
        )
            .into_response(),
        DetailOutcome::NotFound => {
            error_response(StatusCode::NOT_FOUND, &format!("session not found: {id}"))
        }
        DetailOutcome::Invalid => {
            error_response(StatusCode::BAD_REQUEST, &format!("invalid session id: {id}"))
        }
        DetailOutcome::Failed(message) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
        }
    };
    Ok(response)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;
    use crate::service::ServiceSettings;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tower::ServiceExt;

    const SESSION: &str = r#"{"type":"session","id":"abc","timestamp":"2026-02-09T16:33:13Z"}
{"type":"message","message":{"role":"user","content":"hello world","timestamp":"2026-02-09T16:33:20Z"}}
{"type":"message","message":{"role":"assistant","model":"claude-opus","content":"hi there","usage":{"totalTokens":12,"cost":0.002}}}
"#;

    fn setup(dir: &std::path::Path) -> Router {
        fs::write(dir.join("abc.jsonl"), SESSION).unwrap();
        let settings = ServiceSettings::from_config(&ArchiveConfig::default(), dir.to_path_buf());
        router(Arc::new(ArchiveService::new(settings)))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let resp = app.oneshot(get("/api/health")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn list_returns_sessions_with_etag() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let resp = app.oneshot(get("/api/sessions?limit=10")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(header::ETAG));
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        let json = body_json(resp).await;
        let sessions = json.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["fileId"], "abc");
        assert_eq!(sessions[0]["prompt"], "hello world");
        assert_eq!(sessions[0]["model"], "claude-opus");
        assert_eq!(sessions[0]["totalTokens"], 12);
    }

    #[tokio::test]
    async fn matching_etag_returns_not_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let first = app.clone().oneshot(get("/api/sessions")).await.unwrap();
        let etag = first.headers()[header::ETAG].clone();

        let second = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .header(header::IF_NONE_MATCH, etag.clone())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(second.headers()[header::ETAG], etag);
        let bytes = second.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn detail_returns_session_and_timeline() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let resp = app.oneshot(get("/api/sessions/abc")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["session"]["id"], "abc");
        assert_eq!(json["session"]["messageCount"], 2);
        let timeline = json["timeline"].as_array().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0]["role"], "user");
        assert_eq!(timeline[1]["text"], "hi there");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let resp = app.oneshot(get("/api/sessions/missing")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn traversal_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let app = setup(tmp.path());

        let resp = app.oneshot(get("/api/sessions/..abc")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
