use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ServiceM8Config;
use crate::errors::{AppError, AppResult};
use crate::shared::models::schema::oauth_tokens;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

use super::{AUTHORIZE_URL, PROVIDER, TOKEN_URL};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable)]
#[diesel(table_name = oauth_tokens)]
pub struct OAuthToken {
    pub id: Uuid,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(expires) => {
                let buffer = Duration::minutes(5);
                Utc::now() >= expires - buffer
            }
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

pub fn authorize_url(config: &ServiceM8Config, state: &str) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        AUTHORIZE_URL,
        urlencoding::encode(&config.app_id),
        urlencoding::encode(&config.redirect_uri()),
        urlencoding::encode(&config.scope),
        urlencoding::encode(state),
    )
}

pub async fn exchange_code(
    http: &reqwest::Client,
    config: &ServiceM8Config,
    code: &str,
) -> AppResult<TokenResponse> {
    request_token(
        http,
        &[
            ("grant_type", "authorization_code"),
            ("client_id", &config.app_id),
            ("client_secret", &config.app_secret),
            ("redirect_uri", &config.redirect_uri()),
            ("code", code),
        ],
    )
    .await
}

pub async fn refresh_grant(
    http: &reqwest::Client,
    config: &ServiceM8Config,
    refresh_token: &str,
) -> AppResult<TokenResponse> {
    request_token(
        http,
        &[
            ("grant_type", "refresh_token"),
            ("client_id", &config.app_id),
            ("client_secret", &config.app_secret),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}

async fn request_token(
    http: &reqwest::Client,
    params: &[(&str, &str)],
) -> AppResult<TokenResponse> {
    let resp = http.post(TOKEN_URL).form(params).send().await?;
    if !resp.status().is_success() {
        return Err(AppError::Unauthorized(format!(
            "ServiceM8 token endpoint returned HTTP {}",
            resp.status().as_u16()
        )));
    }
    Ok(resp.json().await?)
}

/// Replaces any existing token for the provider; only one is ever active.
pub fn store_token(conn: &mut PgConnection, response: &TokenResponse) -> AppResult<OAuthToken> {
    let now = Utc::now();
    let row = OAuthToken {
        id: Uuid::new_v4(),
        provider: PROVIDER.to_string(),
        access_token: response.access_token.clone(),
        refresh_token: response.refresh_token.clone(),
        expires_at: response.expires_in.map(|secs| now + Duration::seconds(secs)),
        created_at: now,
        updated_at: now,
    };
    conn.transaction(|conn| {
        diesel::delete(oauth_tokens::table.filter(oauth_tokens::provider.eq(PROVIDER)))
            .execute(conn)?;
        diesel::insert_into(oauth_tokens::table).values(&row).execute(conn)?;
        Ok::<_, AppError>(())
    })?;
    Ok(row)
}

pub fn load_token(conn: &mut PgConnection) -> AppResult<Option<OAuthToken>> {
    Ok(oauth_tokens::table
        .filter(oauth_tokens::provider.eq(PROVIDER))
        .order(oauth_tokens::updated_at.desc())
        .first::<OAuthToken>(conn)
        .optional()?)
}

pub fn delete_token(conn: &mut PgConnection) -> AppResult<usize> {
    Ok(
        diesel::delete(oauth_tokens::table.filter(oauth_tokens::provider.eq(PROVIDER)))
            .execute(conn)?,
    )
}

/// Returns a usable access token, refreshing lazily when it is about to
/// expire. A failed refresh degrades to "not connected" (None) once the
/// stored token is actually dead.
pub async fn current_access_token(state: &AppState) -> AppResult<Option<String>> {
    let token = blocking(&state.conn, load_token).await?;
    let token = match token {
        Some(t) => t,
        None => return Ok(None),
    };

    if !token.needs_refresh() {
        return Ok(Some(token.access_token));
    }

    let refresh = match &token.refresh_token {
        Some(r) => r.clone(),
        None => {
            return Ok(if token.is_expired() {
                None
            } else {
                Some(token.access_token)
            });
        }
    };

    match refresh_grant(&state.http, &state.config.servicem8, &refresh).await {
        Ok(response) => {
            let stored =
                blocking(&state.conn, move |conn| store_token(conn, &response)).await?;
            Ok(Some(stored.access_token))
        }
        Err(e) => {
            log::warn!("ServiceM8 token refresh failed: {}", e);
            if token.is_expired() {
                Ok(None)
            } else {
                Ok(Some(token.access_token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: Option<DateTime<Utc>>) -> OAuthToken {
        OAuthToken {
            id: Uuid::new_v4(),
            provider: PROVIDER.to_string(),
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn token_without_expiry_never_needs_refresh() {
        let t = token(None);
        assert!(!t.is_expired());
        assert!(!t.needs_refresh());
    }

    #[test]
    fn token_near_expiry_needs_refresh_before_it_expires() {
        let t = token(Some(Utc::now() + Duration::minutes(2)));
        assert!(!t.is_expired());
        assert!(t.needs_refresh());
    }

    #[test]
    fn expired_token_reports_both() {
        let t = token(Some(Utc::now() - Duration::minutes(1)));
        assert!(t.is_expired());
        assert!(t.needs_refresh());
    }

    #[test]
    fn authorize_url_encodes_parameters() {
        let cfg = ServiceM8Config {
            app_id: "my app".to_string(),
            app_secret: "secret".to_string(),
            public_url: "https://cc.example.com".to_string(),
            api_base: super::super::DEFAULT_API_BASE.to_string(),
            scope: "read_jobs manage_jobs".to_string(),
        };
        let url = authorize_url(&cfg, "state-1");
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("client_id=my%20app"));
        assert!(url.contains("scope=read_jobs%20manage_jobs"));
        assert!(url.contains(
            "redirect_uri=https%3A%2F%2Fcc.example.com%2Fauth%2Fservicem8%2Fcallback"
        ));
        assert!(url.contains("state=state-1"));
    }
}
