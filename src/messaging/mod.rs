use axum::{extract::State, response::Json, routing::post, Router};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::jobs::lifecycle::{CommunicationType, ContactDirection};
use crate::servicem8::oauth::current_access_token;
use crate::servicem8::ServiceM8Client;
use crate::shared::models::schema::jobs;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSmsRequest {
    pub job_id: Option<Uuid>,
    pub to: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub job_id: Option<Uuid>,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub sent: bool,
}

async fn connected_client(state: &AppState) -> AppResult<ServiceM8Client> {
    let token = current_access_token(state)
        .await?
        .ok_or_else(|| AppError::Unauthorized("ServiceM8 not connected".to_string()))?;
    Ok(ServiceM8Client::new(
        state.http.clone(),
        &state.config.servicem8.api_base,
        token,
    ))
}

/// Stamps the job's outbound contact-tracking fields after a send.
async fn record_outbound_contact(
    state: &Arc<AppState>,
    job_id: Uuid,
    kind: CommunicationType,
) -> AppResult<()> {
    blocking(&state.conn, move |conn| {
        let now = Utc::now();
        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::last_contact_at.eq(Some(now)),
                jobs::last_contact_type.eq(Some(kind.as_str().to_string())),
                jobs::last_contact_direction
                    .eq(Some(ContactDirection::Outbound.as_str().to_string())),
                jobs::updated_at.eq(now),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await
}

pub async fn handle_send_sms(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendSmsRequest>,
) -> AppResult<Json<SendResponse>> {
    if payload.to.trim().is_empty() || payload.message.trim().is_empty() {
        return Err(AppError::Validation(
            "both 'to' and 'message' are required".to_string(),
        ));
    }
    let client = connected_client(&state).await?;
    client.send_sms(&payload.to, &payload.message).await?;
    if let Some(job_id) = payload.job_id {
        record_outbound_contact(&state, job_id, CommunicationType::Sms).await?;
    }
    log::info!("sent SMS to {}", payload.to);
    Ok(Json(SendResponse { sent: true }))
}

pub async fn handle_send_email(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendEmailRequest>,
) -> AppResult<Json<SendResponse>> {
    if payload.to.trim().is_empty() || payload.subject.trim().is_empty() {
        return Err(AppError::Validation(
            "both 'to' and 'subject' are required".to_string(),
        ));
    }
    let client = connected_client(&state).await?;
    client
        .send_email(&payload.to, &payload.subject, &payload.body)
        .await?;
    if let Some(job_id) = payload.job_id {
        record_outbound_contact(&state, job_id, CommunicationType::Email).await?;
    }
    log::info!("sent email to {}", payload.to);
    Ok(Json(SendResponse { sent: true }))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/messaging/sms", post(handle_send_sms))
        .route("/api/messaging/email", post(handle_send_email))
}
