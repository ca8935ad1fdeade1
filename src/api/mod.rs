//! HTTP surface for the broker.
//!
//! A deliberately thin layer: it hands headers to the broker and turns
//! [`LoginOutcome`] / [`AuthError`] into statuses. Everything interesting
//! happens below.

use crate::broker::{AuthError, Broker, LoginOutcome};
use axum::{
    Json, Router,
    extract::{Extension, OriginalUri},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/login", get(login).post(login))
        .route("/{application}/login", get(login).post(login))
        .route("/session", get(session))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(broker))
                .layer(TraceLayer::new_for_http()),
        )
}

async fn login(
    Extension(broker): Extension<Arc<Broker>>,
    OriginalUri(uri): OriginalUri,
    mut headers: HeaderMap,
) -> Response {
    let remote_peer = extract_client_ip(&headers);
    let mut out_headers = HeaderMap::new();

    match broker
        .login(uri.path(), &mut headers, remote_peer.as_deref(), &mut out_headers)
        .await
    {
        Ok(LoginOutcome::Authenticated { body, .. }) => {
            (StatusCode::OK, out_headers, Json(body)).into_response()
        }
        Ok(LoginOutcome::Challenge { body }) => {
            (StatusCode::UNAUTHORIZED, out_headers, Json(body)).into_response()
        }
        Err(error) => {
            let status = match &error {
                AuthError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
                AuthError::PermissionDenied => StatusCode::FORBIDDEN,
                AuthError::InvalidData(_) => StatusCode::BAD_REQUEST,
                AuthError::InternalFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, out_headers, error.to_string()).into_response()
        }
    }
}

async fn session(
    Extension(broker): Extension<Arc<Broker>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    match broker.check_cookie(uri.path(), &headers) {
        Some(service) => Json(json!({
            "user": service.user(),
            "csrf-token": service.csrf_token(),
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Extract a client address for helper argv from common proxy headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
