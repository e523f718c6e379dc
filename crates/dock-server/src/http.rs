use axum::extract::{Path as AxumPath, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use dock_types::{ErrorCode, ErrorEnvelope};
use dock_workspace::validate_workdir;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/pairing/generate", post(pairing_generate))
        .route("/api/pairing/verify", post(pairing_verify))
        .route("/api/agents", get(agents_list))
        .route("/api/sessions", get(sessions_list))
        .route("/api/sessions/{id}", delete(session_revoke))
        .route("/api/git/status", get(git_status))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), origin_gate))
        .with_state(state)
}

/// A declared origin outside the allow-list is refused on every endpoint.
/// Requests without an Origin header (curl, scripts) pass through.
async fn origin_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if let Some(origin) = declared_origin(request.headers()) {
        if !state.config.origin_allowed(&origin) {
            warn!(%origin, "http origin rejected");
            return (
                StatusCode::FORBIDDEN,
                Json(ErrorEnvelope::new(
                    ErrorCode::OriginNotAllowed,
                    "Origin not allowed",
                )),
            )
                .into_response();
        }
    }
    next.run(request).await
}

fn declared_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "activeSessions": state.sessions.count().await,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingGenerateInput {
    app_name: Option<String>,
    app_url: Option<String>,
}

async fn pairing_generate(
    State(state): State<AppState>,
    Json(input): Json<PairingGenerateInput>,
) -> Response {
    let (Some(app_name), Some(app_url)) = (
        input.app_name.filter(|v| !v.trim().is_empty()),
        input.app_url.filter(|v| !v.trim().is_empty()),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope::new(
                ErrorCode::InvalidMessageFormat,
                "appName and appUrl are required",
            )),
        )
            .into_response();
    };

    let code = state
        .pairing
        .issue(&app_name, &app_url, state.identity.public_key_pem())
        .await;
    Json(json!({
        "code": code.code,
        "expiresAt": code.expires_at.to_rfc3339(),
        "bridgePublicKey": state.identity.public_key_pem(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingVerifyInput {
    code: Option<String>,
    client_public_key: Option<String>,
}

async fn pairing_verify(
    State(state): State<AppState>,
    Json(input): Json<PairingVerifyInput>,
) -> Response {
    let code = input.code.unwrap_or_default();
    let client_public_key = input.client_public_key.unwrap_or_default();

    // One uniform refusal regardless of which clause failed.
    let Some(redemption) = state.pairing.redeem(&code, &client_public_key).await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope::new(
                ErrorCode::NotAuthenticated,
                "Invalid or expired pairing code",
            )),
        )
            .into_response();
    };

    let session = state.sessions.create(redemption).await;
    Json(json!({
        "token": session.token,
        "sessionId": session.id,
        "bridgePublicKey": state.identity.public_key_pem(),
        "expiresAt": session.expires_at.to_rfc3339(),
    }))
    .into_response()
}

async fn agents_list(State(state): State<AppState>) -> Json<Value> {
    let agents = state.coordinator.supervisor().catalog().list_installed().await;
    Json(json!(agents))
}

async fn sessions_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.sessions.list().await))
}

async fn session_revoke(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if state.sessions.revoke(&id).await {
        state.coordinator.cancel_session(&id).await;
        Json(json!({"ok": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorEnvelope::new(ErrorCode::NotAuthenticated, "no such session")),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct GitStatusQuery {
    workdir: String,
}

async fn git_status(
    State(state): State<AppState>,
    Query(query): Query<GitStatusQuery>,
) -> Response {
    let workdir = std::path::PathBuf::from(&query.workdir);
    if let Err(error) = validate_workdir(&workdir) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope::new(ErrorCode::WorkspaceError, error.to_string())),
        )
            .into_response();
    }
    match state.coordinator.workspace().status(&workdir).await {
        Ok(status) => Json(json!(status)).into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorEnvelope::new(error.code(), error.to_string())),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::util::ServiceExt;

    use dock_core::{BridgeConfig, CliOverrides};

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            BridgeConfig::load(&dir.path().join("config.json"), &CliOverrides::default())
                .expect("config");
        let state = crate::build_state(config, dir.path()).await.expect("state");
        (state, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_status_and_session_count() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn disallowed_origin_is_403_on_every_route() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .header("origin", "https://evil.test")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], "ORIGIN_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn pairing_generate_then_verify_creates_a_session() {
        let (state, _dir) = test_state().await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/pairing/generate")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"appName":"X","appUrl":"https://x.test"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let code = body["code"].as_str().expect("code").to_string();
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() == 4));
        assert!(body["bridgePublicKey"]
            .as_str()
            .expect("key")
            .contains("BEGIN PUBLIC KEY"));

        let verify_body = json!({
            "code": code,
            "clientPublicKey": "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n",
        });
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/pairing/verify")
                    .header("content-type", "application/json")
                    .body(Body::from(verify_body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["token"].as_str().is_some());
        assert!(body["sessionId"].as_str().is_some());
        assert_eq!(state.sessions.count().await, 1);

        // A second redemption of the same code is refused.
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/pairing/verify")
                    .header("content-type", "application/json")
                    .body(Body::from(verify_body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid or expired pairing code");
    }

    #[tokio::test]
    async fn pairing_generate_requires_both_fields() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/pairing/generate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"appName":"X"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn revoking_an_unknown_session_is_404() {
        let (state, _dir) = test_state().await;
        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/api/sessions/s-missing")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
