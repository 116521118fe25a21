use agent_gateway_core::Gateway;
use agent_gateway_core::UserId;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    /// Seconds until the token can no longer be used.
    expires_in: u64,
}

/// Issues a socket token for the user the surrounding application vouches for
/// through the configured identity header.
pub(crate) async fn issue_token(State(gateway): State<Gateway>, headers: HeaderMap) -> Response {
    let header = gateway.config().user_header.as_str();
    let user = headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(user) = user else {
        debug!(header, "token request without user identity");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing user identity" })),
        )
            .into_response();
    };

    let token = gateway.tokens().issue(UserId::new(user));
    Json(TokenResponse {
        token: token.value,
        expires_in: gateway.tokens().ttl().as_secs(),
    })
    .into_response()
}

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
