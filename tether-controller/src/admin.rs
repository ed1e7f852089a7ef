//! Admin HTTP API.
//!
//! A thin wrapper over the token store and presence registries:
//! `POST /api/admin/tokens`, `GET /api/admin/connectors`,
//! `GET /api/admin/tunnelers`, and the internal
//! `POST /api/internal/consume-token`. Admin endpoints authorize with a
//! bearer token, the internal endpoint with `X-Internal-Token`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::state::{presence_status, ConnectorRegistry, TokenError, TokenStore, TunnelerPresence};

#[derive(Clone)]
pub struct AdminState {
    pub tokens: Arc<TokenStore>,
    pub connectors: Arc<ConnectorRegistry>,
    pub tunnelers: Arc<TunnelerPresence>,
    pub admin_auth_token: Option<String>,
    pub internal_auth_token: Option<String>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/admin/tokens", post(create_token))
        .route("/api/admin/connectors", get(list_connectors))
        .route("/api/admin/tunnelers", get(list_tunnelers))
        .route("/api/internal/consume-token", post(consume_token))
        .with_state(state)
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Serialize)]
struct ConnectorView {
    id: String,
    status: &'static str,
    private_ip: String,
    last_seen: String,
    version: String,
}

#[derive(Serialize)]
struct TunnelerView {
    id: String,
    status: &'static str,
    connector_id: String,
    last_seen: String,
}

#[derive(Deserialize)]
struct ConsumeTokenRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    connector_id: String,
}

async fn create_token(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin_auth(&headers, &state.admin_auth_token) {
        return resp;
    }

    match state.tokens.create() {
        Ok((token, expires_at)) => {
            let expires_at = OffsetDateTime::from_unix_timestamp(expires_at)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok())
                .unwrap_or_default();
            (StatusCode::OK, Json(TokenResponse { token, expires_at })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to create token");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to create token").into_response()
        }
    }
}

async fn list_connectors(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin_auth(&headers, &state.admin_auth_token) {
        return resp;
    }

    let now = OffsetDateTime::now_utc();
    let views: Vec<ConnectorView> = state
        .connectors
        .list()
        .into_iter()
        .map(|rec| ConnectorView {
            status: presence_status(now, rec.last_seen),
            last_seen: humanize_age(now - rec.last_seen),
            id: rec.id,
            private_ip: rec.private_ip,
            version: rec.version,
        })
        .collect();

    (StatusCode::OK, Json(views)).into_response()
}

async fn list_tunnelers(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_admin_auth(&headers, &state.admin_auth_token) {
        return resp;
    }

    let now = OffsetDateTime::now_utc();
    let views: Vec<TunnelerView> = state
        .tunnelers
        .list()
        .into_iter()
        .map(|rec| TunnelerView {
            status: presence_status(now, rec.last_seen),
            last_seen: humanize_age(now - rec.last_seen),
            id: rec.id,
            connector_id: rec.connector_id,
        })
        .collect();

    (StatusCode::OK, Json(views)).into_response()
}

async fn consume_token(
    State(state): State<AdminState>,
    headers: HeaderMap,
    body: Json<ConsumeTokenRequest>,
) -> Response {
    if let Err(resp) = check_internal_auth(&headers, &state.internal_auth_token) {
        return resp;
    }
    if body.connector_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing connector_id").into_response();
    }

    match state.tokens.consume(&body.token, &body.connector_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        )
            .into_response(),
        Err(TokenError::Persist(e)) => {
            tracing::error!(error = %e, "token store persistence failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "token store failure").into_response()
        }
        Err(e) => (StatusCode::UNAUTHORIZED, format!("token invalid: {e}")).into_response(),
    }
}

fn check_admin_auth(headers: &HeaderMap, expected: &Option<String>) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Err(
            (StatusCode::SERVICE_UNAVAILABLE, "admin auth not configured").into_response(),
        );
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented != Some(format!("Bearer {expected}").as_str()) {
        return Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response());
    }
    Ok(())
}

fn check_internal_auth(headers: &HeaderMap, expected: &Option<String>) -> Result<(), Response> {
    let Some(expected) = expected else {
        return Err(
            (StatusCode::SERVICE_UNAVAILABLE, "internal auth not configured").into_response(),
        );
    };
    let presented = headers.get("x-internal-token").and_then(|v| v.to_str().ok());
    if presented != Some(expected.as_str()) {
        return Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response());
    }
    Ok(())
}

/// Human-friendly relative age for admin listings.
fn humanize_age(age: Duration) -> String {
    let seconds = age.whole_seconds().max(0);
    match seconds {
        0..=4 => "just now".to_string(),
        5..=59 => format!("{seconds} seconds ago"),
        60..=3599 => format!("{} minutes ago", seconds / 60),
        3600..=86399 => format!("{} hours ago", seconds / 3600),
        _ => format!("{} days ago", seconds / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanizes_ages_like_the_admin_ui_expects() {
        assert_eq!(humanize_age(Duration::seconds(0)), "just now");
        assert_eq!(humanize_age(Duration::seconds(-5)), "just now");
        assert_eq!(humanize_age(Duration::seconds(12)), "12 seconds ago");
        assert_eq!(humanize_age(Duration::seconds(120)), "2 minutes ago");
        assert_eq!(humanize_age(Duration::seconds(7200)), "2 hours ago");
        assert_eq!(humanize_age(Duration::days(3)), "3 days ago");
    }

    #[test]
    fn admin_auth_requires_configuration_and_match() {
        let mut headers = HeaderMap::new();
        assert!(check_admin_auth(&headers, &None).is_err());

        let expected = Some("secret".to_string());
        assert!(check_admin_auth(&headers, &expected).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_admin_auth(&headers, &expected).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(check_admin_auth(&headers, &expected).is_ok());
    }

    #[test]
    fn internal_auth_uses_its_own_header() {
        let mut headers = HeaderMap::new();
        let expected = Some("internal".to_string());
        assert!(check_internal_auth(&headers, &expected).is_err());
        headers.insert("x-internal-token", "internal".parse().unwrap());
        assert!(check_internal_auth(&headers, &expected).is_ok());
    }
}
