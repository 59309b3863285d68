use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

use super::oauth::{
    authorize_url, delete_token, exchange_code, load_token, store_token,
};

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    #[allow(dead_code)]
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/servicem8/connect", get(start_connect))
        .route("/api/auth/servicem8/status", get(connection_status))
        .route("/api/auth/servicem8/disconnect", post(disconnect))
        .route("/auth/servicem8/callback", get(oauth_callback))
}

async fn start_connect(State(state): State<Arc<AppState>>) -> Response {
    let config = &state.config.servicem8;
    if config.app_id.is_empty() || config.app_secret.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Html(
                r#"<!DOCTYPE html>
<html>
<head><title>Error</title></head>
<body>
    <h1>ServiceM8 Not Configured</h1>
    <p>Set SERVICEM8_APP_ID and SERVICEM8_APP_SECRET to enable the connection.</p>
</body>
</html>"#
                    .to_string(),
            ),
        )
            .into_response();
    }

    let csrf_state = Uuid::new_v4().to_string();
    let url = authorize_url(config, &csrf_state);
    info!("starting ServiceM8 OAuth flow");
    Redirect::temporary(&url).into_response()
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        warn!("ServiceM8 OAuth denied: {} {}", error, description);
        return (
            StatusCode::BAD_REQUEST,
            Html(format!(
                r#"<!DOCTYPE html>
<html>
<head><title>Connection Failed</title></head>
<body>
    <h1>ServiceM8 Connection Failed</h1>
    <p>{} {}</p>
    <a href="/">Back to dashboard</a>
</body>
</html>"#,
                error, description
            )),
        )
            .into_response();
    }

    let code = match params.code {
        Some(code) => code,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Html(
                    r#"<!DOCTYPE html>
<html>
<head><title>Connection Failed</title></head>
<body>
    <h1>ServiceM8 Connection Failed</h1>
    <p>No authorization code was returned.</p>
    <a href="/">Back to dashboard</a>
</body>
</html>"#
                        .to_string(),
                ),
            )
                .into_response();
        }
    };

    let response = match exchange_code(&state.http, &state.config.servicem8, &code).await {
        Ok(response) => response,
        Err(e) => {
            warn!("ServiceM8 code exchange failed: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Html(
                    r#"<!DOCTYPE html>
<html>
<head><title>Connection Failed</title></head>
<body>
    <h1>ServiceM8 Connection Failed</h1>
    <p>Token exchange was rejected. Try connecting again.</p>
    <a href="/">Back to dashboard</a>
</body>
</html>"#
                        .to_string(),
                ),
            )
                .into_response();
        }
    };

    match blocking(&state.conn, move |conn| store_token(conn, &response)).await {
        Ok(_) => {
            info!("ServiceM8 account connected");
            Redirect::temporary("/").into_response()
        }
        Err(e) => {
            warn!("failed to store ServiceM8 token: {}", e);
            e.into_response()
        }
    }
}

async fn connection_status(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ConnectionStatus>> {
    let token = blocking(&state.conn, load_token).await?;
    let status = match token {
        Some(token) if !token.is_expired() => ConnectionStatus {
            connected: true,
            expires_at: token.expires_at,
        },
        // An expired token with a refresh token still counts as connected;
        // the next API call refreshes it lazily.
        Some(token) if token.refresh_token.is_some() => ConnectionStatus {
            connected: true,
            expires_at: token.expires_at,
        },
        _ => ConnectionStatus {
            connected: false,
            expires_at: None,
        },
    };
    Ok(Json(status))
}

async fn disconnect(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let removed = blocking(&state.conn, delete_token).await?;
    info!("ServiceM8 disconnected ({} token rows removed)", removed);
    Ok(Json(serde_json::json!({ "disconnected": true })))
}
