use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::shared::models::schema::app_settings;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

pub const STAFF_KEY: &str = "staff";

/// Synthetic staff entry used by the UI as an "everyone" filter; it is never
/// a real person and never counts toward capacity.
pub const ALL_STAFF_ID: &str = "all";

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = app_settings)]
pub struct AppSetting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Sales,
    Production,
    Install,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub id: String,
    pub name: String,
    pub role: StaffRole,
    #[serde(default)]
    pub daily_capacity_hours: f64,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    Leads,
    Quotes,
    Production,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::Quotes => "quotes",
            Self::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leads" => Some(Self::Leads),
            "quotes" => Some(Self::Quotes),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn settings_key(&self) -> String {
        format!("pipeline_{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineColumn {
    pub id: String,
    pub title: String,
    pub color: String,
}

pub fn default_columns(pipeline: Pipeline) -> Vec<PipelineColumn> {
    let cols: &[(&str, &str, &str)] = match pipeline {
        Pipeline::Leads => &[
            ("new_lead", "New Leads", "#3b82f6"),
            ("contacted", "Contacted", "#8b5cf6"),
            ("site_visit", "Site Visit Booked", "#f59e0b"),
            ("quote_sent", "Quote Sent", "#10b981"),
        ],
        Pipeline::Quotes => &[
            ("fresh", "Fresh", "#10b981"),
            ("awaiting_reply", "Awaiting Reply", "#f59e0b"),
            ("followed_up", "Followed Up", "#8b5cf6"),
            ("negotiating", "Negotiating", "#3b82f6"),
        ],
        Pipeline::Production => &[
            ("new_jobs_won", "New Jobs Won", "#3b82f6"),
            ("in_production", "In Production", "#8b5cf6"),
            ("waiting_supplier", "Waiting on Supplier", "#f59e0b"),
            ("waiting_client", "Waiting on Client", "#f97316"),
            ("need_to_go_back", "Need to Go Back", "#ef4444"),
            ("recently_completed", "Recently Completed", "#10b981"),
        ],
    };
    cols.iter()
        .map(|(id, title, color)| PipelineColumn {
            id: (*id).to_string(),
            title: (*title).to_string(),
            color: (*color).to_string(),
        })
        .collect()
}

pub fn get_setting(conn: &mut PgConnection, key: &str) -> AppResult<Option<serde_json::Value>> {
    Ok(app_settings::table
        .find(key)
        .select(app_settings::value)
        .first::<serde_json::Value>(conn)
        .optional()?)
}

pub fn put_setting(conn: &mut PgConnection, key: &str, value: serde_json::Value) -> AppResult<()> {
    let row = AppSetting {
        key: key.to_string(),
        value,
        updated_at: Utc::now(),
    };
    diesel::insert_into(app_settings::table)
        .values(&row)
        .on_conflict(app_settings::key)
        .do_update()
        .set((
            app_settings::value.eq(&row.value),
            app_settings::updated_at.eq(row.updated_at),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn load_staff(conn: &mut PgConnection) -> AppResult<Vec<StaffMember>> {
    match get_setting(conn, STAFF_KEY)? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| AppError::Internal(format!("corrupt staff settings blob: {}", e))),
        None => Ok(Vec::new()),
    }
}

pub fn load_columns(conn: &mut PgConnection, pipeline: Pipeline) -> AppResult<Vec<PipelineColumn>> {
    match get_setting(conn, &pipeline.settings_key())? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| AppError::Internal(format!("corrupt pipeline settings blob: {}", e))),
        None => Ok(default_columns(pipeline)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub key: String,
    pub value: serde_json::Value,
}

pub async fn handle_settings_list(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<HashMap<String, serde_json::Value>>> {
    let rows = blocking(&state.conn, |conn| {
        Ok(app_settings::table.load::<AppSetting>(conn)?)
    })
    .await?;
    Ok(Json(rows.into_iter().map(|r| (r.key, r.value)).collect()))
}

pub async fn handle_setting_get(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let value = blocking(&state.conn, move |conn| {
        get_setting(conn, &key)?.ok_or_else(|| AppError::NotFound(format!("setting '{}' not set", key)))
    })
    .await?;
    Ok(Json(value))
}

pub async fn handle_setting_put(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PutSettingRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let value = blocking(&state.conn, move |conn| {
        put_setting(conn, &payload.key, payload.value.clone())?;
        Ok(payload.value)
    })
    .await?;
    Ok(Json(value))
}

pub async fn handle_staff_get(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<StaffMember>>> {
    let staff = blocking(&state.conn, load_staff).await?;
    Ok(Json(staff))
}

pub async fn handle_staff_put(
    State(state): State<Arc<AppState>>,
    Json(mut staff): Json<Vec<StaffMember>>,
) -> AppResult<Json<Vec<StaffMember>>> {
    for member in &mut staff {
        if member.id.is_empty() {
            member.id = Uuid::new_v4().to_string();
        }
    }
    let staff = blocking(&state.conn, move |conn| {
        put_setting(conn, STAFF_KEY, serde_json::to_value(&staff).unwrap_or_default())?;
        Ok(staff)
    })
    .await?;
    Ok(Json(staff))
}

pub async fn handle_pipeline_get(
    State(state): State<Arc<AppState>>,
    Path(pipeline): Path<String>,
) -> AppResult<Json<Vec<PipelineColumn>>> {
    let pipeline = Pipeline::parse(&pipeline)
        .ok_or_else(|| AppError::Validation(format!("unknown pipeline '{}'", pipeline)))?;
    let columns = blocking(&state.conn, move |conn| load_columns(conn, pipeline)).await?;
    Ok(Json(columns))
}

/// Replaces a pipeline's column list wholesale. Columns with jobs still
/// assigned to them may be removed; orphaned statuses are tolerated.
pub async fn handle_pipeline_put(
    State(state): State<Arc<AppState>>,
    Path(pipeline): Path<String>,
    Json(columns): Json<Vec<PipelineColumn>>,
) -> AppResult<Json<Vec<PipelineColumn>>> {
    let pipeline = Pipeline::parse(&pipeline)
        .ok_or_else(|| AppError::Validation(format!("unknown pipeline '{}'", pipeline)))?;
    let columns = blocking(&state.conn, move |conn| {
        put_setting(
            conn,
            &pipeline.settings_key(),
            serde_json::to_value(&columns).unwrap_or_default(),
        )?;
        Ok(columns)
    })
    .await?;
    Ok(Json(columns))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/settings",
            get(handle_settings_list).post(handle_setting_put),
        )
        .route("/api/settings/staff", get(handle_staff_get).put(handle_staff_put))
        .route(
            "/api/settings/pipelines/:pipeline",
            get(handle_pipeline_get).put(handle_pipeline_put),
        )
        .route("/api/settings/:key", get(handle_setting_get))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_keys_are_namespaced() {
        assert_eq!(Pipeline::Leads.settings_key(), "pipeline_leads");
        assert_eq!(Pipeline::parse("production"), Some(Pipeline::Production));
        assert!(Pipeline::parse("sales").is_none());
    }

    #[test]
    fn default_columns_cover_scheduler_stages() {
        let ids: Vec<String> = default_columns(Pipeline::Production)
            .into_iter()
            .map(|c| c.id)
            .collect();
        for stage in [
            "new_jobs_won",
            "in_production",
            "waiting_supplier",
            "waiting_client",
            "need_to_go_back",
            "recently_completed",
        ] {
            assert!(ids.contains(&stage.to_string()), "missing {}", stage);
        }
    }

    #[test]
    fn staff_blob_round_trips() {
        let staff = vec![StaffMember {
            id: "s1".into(),
            name: "Mel".into(),
            role: StaffRole::Install,
            daily_capacity_hours: 8.0,
            skills: vec!["pvc".into()],
            active: true,
        }];
        let value = serde_json::to_value(&staff).unwrap();
        let back: Vec<StaffMember> = serde_json::from_value(value).unwrap();
        assert_eq!(back[0].id, "s1");
        assert_eq!(back[0].role, StaffRole::Install);
    }
}
