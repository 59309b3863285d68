pub mod oauth;
pub mod routes;
pub mod sync;

use serde::{Deserialize, Deserializer};

use crate::errors::{AppError, AppResult};

pub const PROVIDER: &str = "servicem8";
pub const DEFAULT_API_BASE: &str = "https://api.servicem8.com/api_1.0";
pub const PLATFORM_BASE: &str = "https://api.servicem8.com/message_services";
pub const AUTHORIZE_URL: &str = "https://go.servicem8.com/oauth/authorize";
pub const TOKEN_URL: &str = "https://go.servicem8.com/oauth/access_token";

/// Thin client over the ServiceM8 REST API. Listing endpoints are paginated
/// with `$top` and filtered with OData-style `$filter` strings.
pub struct ServiceM8Client {
    http: reqwest::Client,
    api_base: String,
    platform_base: String,
    access_token: String,
}

impl ServiceM8Client {
    pub fn new(http: reqwest::Client, api_base: &str, access_token: String) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            platform_base: PLATFORM_BASE.to_string(),
            access_token,
        }
    }

    /// Points both API and platform endpoints at the same base; used in tests.
    pub fn with_single_base(http: reqwest::Client, base: &str, access_token: String) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            http,
            api_base: base.clone(),
            platform_base: base,
            access_token,
        }
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        entity: &str,
        top: Option<u32>,
        filter: Option<&str>,
    ) -> AppResult<Vec<T>> {
        let url = format!("{}/{}.json", self.api_base, entity);
        let mut req = self.http.get(&url).bearer_auth(&self.access_token);
        if let Some(top) = top {
            req = req.query(&[("$top", top.to_string())]);
        }
        if let Some(filter) = filter {
            req = req.query(&[("$filter", filter)]);
        }
        let resp = req.send().await?;
        match resp.status().as_u16() {
            200..=299 => Ok(resp.json().await?),
            401 | 403 => Err(AppError::Unauthorized(
                "ServiceM8 rejected the access token".to_string(),
            )),
            code => Err(AppError::Internal(format!(
                "ServiceM8 {} listing returned HTTP {}",
                entity, code
            ))),
        }
    }

    pub async fn list_jobs(&self, top: Option<u32>, filter: Option<&str>) -> AppResult<Vec<Sm8Job>> {
        self.list("job", top, filter).await
    }

    pub async fn list_companies(
        &self,
        top: Option<u32>,
        filter: Option<&str>,
    ) -> AppResult<Vec<Sm8Company>> {
        self.list("company", top, filter).await
    }

    pub async fn list_contacts(
        &self,
        top: Option<u32>,
        filter: Option<&str>,
    ) -> AppResult<Vec<Sm8Contact>> {
        self.list("companycontact", top, filter).await
    }

    pub async fn list_notes(&self, top: Option<u32>, filter: Option<&str>) -> AppResult<Vec<Sm8Note>> {
        self.list("note", top, filter).await
    }

    pub async fn list_feed_items(
        &self,
        top: Option<u32>,
        filter: Option<&str>,
    ) -> AppResult<Vec<Sm8FeedItem>> {
        self.list("feeditem", top, filter).await
    }

    async fn platform_send(&self, endpoint: &str, body: serde_json::Value) -> AppResult<()> {
        let url = format!("{}/{}", self.platform_base, endpoint);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        match resp.status().as_u16() {
            200..=299 => Ok(()),
            401 | 403 => Err(AppError::Unauthorized(
                "ServiceM8 rejected the access token".to_string(),
            )),
            code => Err(AppError::Internal(format!(
                "ServiceM8 {} send returned HTTP {}",
                endpoint, code
            ))),
        }
    }

    pub async fn send_sms(&self, to: &str, message: &str) -> AppResult<()> {
        self.platform_send("sms", serde_json::json!({ "to": to, "message": message }))
            .await
    }

    pub async fn send_email(&self, to: &str, subject: &str, body: &str) -> AppResult<()> {
        self.platform_send(
            "email",
            serde_json::json!({ "to": to, "subject": subject, "htmlBody": body }),
        )
        .await
    }
}

/// ServiceM8 booleans arrive as 0/1 integers or "0"/"1" strings depending on
/// the endpoint.
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        serde_json::Value::String(s) => matches!(s.trim(), "1" | "true" | "yes"),
        _ => false,
    })
}

/// Monetary amounts arrive as strings ("12500.00") or bare numbers.
fn de_opt_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sm8Job {
    pub uuid: String,
    #[serde(default)]
    pub generated_job_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub job_address: Option<String>,
    #[serde(default)]
    pub job_description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_amount")]
    pub total_invoice_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_flag")]
    pub quote_sent: bool,
    #[serde(default)]
    pub quote_sent_stamp: Option<String>,
    #[serde(default)]
    pub company_uuid: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sm8Company {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sm8Contact {
    pub uuid: String,
    #[serde(default)]
    pub company_uuid: Option<String>,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sm8Note {
    pub uuid: String,
    #[serde(default)]
    pub related_object_uuid: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub create_date: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sm8FeedItem {
    pub uuid: String,
    #[serde(default)]
    pub related_object_uuid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_jobs_sends_top_and_filter_params() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/job.json")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("$top".into(), "50".into()),
                mockito::Matcher::UrlEncoded("$filter".into(), "active eq '1'".into()),
            ]))
            .match_header("authorization", "Bearer token-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"uuid":"j-1","generated_job_id":"1042","status":"Work Order",
                     "quote_sent":"1","quote_sent_stamp":"2024-01-01 09:30:00",
                     "total_invoice_amount":"12500.00","active":1}]"#,
            )
            .create_async()
            .await;

        let client = ServiceM8Client::with_single_base(
            reqwest::Client::new(),
            &server.url(),
            "token-123".to_string(),
        );
        let jobs = client
            .list_jobs(Some(50), Some("active eq '1'"))
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uuid, "j-1");
        assert!(jobs[0].quote_sent);
        assert!(jobs[0].active);
        assert_eq!(jobs[0].total_invoice_amount, Some(12500.0));
    }

    #[tokio::test]
    async fn unauthorized_listing_maps_to_unauthorized_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job.json")
            .with_status(401)
            .create_async()
            .await;

        let client = ServiceM8Client::with_single_base(
            reqwest::Client::new(),
            &server.url(),
            "expired".to_string(),
        );
        let err = client.list_jobs(None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn flags_accept_ints_strings_and_bools() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "de_flag")]
            flag: bool,
        }
        for (raw, expected) in [
            (r#"{"flag":1}"#, true),
            (r#"{"flag":"1"}"#, true),
            (r#"{"flag":true}"#, true),
            (r#"{"flag":0}"#, false),
            (r#"{"flag":"0"}"#, false),
            (r#"{"flag":null}"#, false),
        ] {
            let probe: Probe = serde_json::from_str(raw).unwrap();
            assert_eq!(probe.flag, expected, "raw: {}", raw);
        }
    }
}
