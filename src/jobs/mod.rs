pub mod lifecycle;
pub mod stages;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::shared::models::schema::jobs;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;
use lifecycle::{
    InstallStage, LifecyclePhase, PurchaseOrderStatus, SalesStage, SchedulerStage,
};

// Database model - field order matches the jobs table. Updates load the row,
// mutate it, and write it back whole, so None fields really mean NULL.
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = jobs, treat_none_as_null = true)]
pub struct Job {
    pub id: Uuid,
    pub servicem8_uuid: Option<String>,
    pub job_code: Option<String>,
    pub description: Option<String>,
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub lifecycle_phase: String,
    pub status: String,
    pub sales_stage: Option<String>,
    pub scheduler_stage: Option<String>,
    pub install_stage: Option<String>,
    pub work_type_id: Option<Uuid>,
    pub quote_value: Option<f64>,
    pub purchase_order_status: String,
    pub quote_sent: bool,
    pub quote_sent_at: Option<DateTime<Utc>>,
    pub hours_since_quote_sent: Option<i64>,
    pub days_since_quote_sent: Option<i64>,
    pub post_install_date: Option<NaiveDate>,
    pub panel_install_date: Option<NaiveDate>,
    pub tentative_post_date: Option<NaiveDate>,
    pub tentative_panel_date: Option<NaiveDate>,
    pub post_duration_hours: Option<f64>,
    pub panel_duration_hours: Option<f64>,
    pub post_crew_size: Option<i32>,
    pub panel_crew_size: Option<i32>,
    pub production_duration_days: Option<i32>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub last_contact_type: Option<String>,
    pub last_contact_direction: Option<String>,
    pub last_client_contact_at: Option<DateTime<Utc>>,
    pub last_client_contact_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Blank quote-phase job; callers fill in what they know.
    pub fn new_lead(now: DateTime<Utc>) -> Self {
        Job {
            id: Uuid::new_v4(),
            servicem8_uuid: None,
            job_code: None,
            description: None,
            company_name: None,
            contact_name: None,
            contact_phone: None,
            contact_email: None,
            address: None,
            lifecycle_phase: LifecyclePhase::Quote.as_str().to_string(),
            status: "new_lead".to_string(),
            sales_stage: None,
            scheduler_stage: None,
            install_stage: None,
            work_type_id: None,
            quote_value: None,
            purchase_order_status: PurchaseOrderStatus::None.as_str().to_string(),
            quote_sent: false,
            quote_sent_at: None,
            hours_since_quote_sent: None,
            days_since_quote_sent: None,
            post_install_date: None,
            panel_install_date: None,
            tentative_post_date: None,
            tentative_panel_date: None,
            post_duration_hours: None,
            panel_duration_hours: None,
            post_crew_size: None,
            panel_crew_size: None,
            production_duration_days: None,
            last_contact_at: None,
            last_contact_type: None,
            last_contact_direction: None,
            last_client_contact_at: None,
            last_client_contact_type: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::parse(&self.lifecycle_phase).unwrap_or(LifecyclePhase::Quote)
    }

    pub fn install_stage_parsed(&self) -> Option<InstallStage> {
        self.install_stage.as_deref().and_then(InstallStage::parse)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: Uuid,
    pub servicem8_uuid: Option<String>,
    pub job_code: Option<String>,
    pub description: Option<String>,
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub lifecycle_phase: String,
    pub status: String,
    pub sales_stage: Option<String>,
    pub scheduler_stage: Option<String>,
    pub install_stage: Option<String>,
    pub work_type_id: Option<Uuid>,
    pub quote_value: Option<f64>,
    pub purchase_order_status: String,
    pub quote_sent: bool,
    pub quote_sent_at: Option<DateTime<Utc>>,
    pub hours_since_quote_sent: Option<i64>,
    pub days_since_quote_sent: Option<i64>,
    pub post_install_date: Option<NaiveDate>,
    pub panel_install_date: Option<NaiveDate>,
    pub tentative_post_date: Option<NaiveDate>,
    pub tentative_panel_date: Option<NaiveDate>,
    pub post_duration_hours: Option<f64>,
    pub panel_duration_hours: Option<f64>,
    pub post_crew_size: Option<i32>,
    pub panel_crew_size: Option<i32>,
    pub production_duration_days: Option<i32>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub last_contact_type: Option<String>,
    pub last_contact_direction: Option<String>,
    pub last_client_contact_at: Option<DateTime<Utc>>,
    pub last_client_contact_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        JobResponse {
            id: job.id,
            servicem8_uuid: job.servicem8_uuid,
            job_code: job.job_code,
            description: job.description,
            company_name: job.company_name,
            contact_name: job.contact_name,
            contact_phone: job.contact_phone,
            contact_email: job.contact_email,
            address: job.address,
            lifecycle_phase: job.lifecycle_phase,
            status: job.status,
            sales_stage: job.sales_stage,
            scheduler_stage: job.scheduler_stage,
            install_stage: job.install_stage,
            work_type_id: job.work_type_id,
            quote_value: job.quote_value,
            purchase_order_status: job.purchase_order_status,
            quote_sent: job.quote_sent,
            quote_sent_at: job.quote_sent_at,
            hours_since_quote_sent: job.hours_since_quote_sent,
            days_since_quote_sent: job.days_since_quote_sent,
            post_install_date: job.post_install_date,
            panel_install_date: job.panel_install_date,
            tentative_post_date: job.tentative_post_date,
            tentative_panel_date: job.tentative_panel_date,
            post_duration_hours: job.post_duration_hours,
            panel_duration_hours: job.panel_duration_hours,
            post_crew_size: job.post_crew_size,
            panel_crew_size: job.panel_crew_size,
            production_duration_days: job.production_duration_days,
            last_contact_at: job.last_contact_at,
            last_contact_type: job.last_contact_type,
            last_contact_direction: job.last_contact_direction,
            last_client_contact_at: job.last_client_contact_at,
            last_client_contact_type: job.last_client_contact_type,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub job_code: Option<String>,
    pub description: Option<String>,
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub quote_value: Option<f64>,
    pub work_type_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_code: Option<String>,
    pub description: Option<String>,
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub address: Option<String>,
    pub lifecycle_phase: Option<String>,
    pub status: Option<String>,
    pub sales_stage: Option<String>,
    pub scheduler_stage: Option<String>,
    pub install_stage: Option<String>,
    pub work_type_id: Option<Uuid>,
    pub quote_value: Option<f64>,
    pub purchase_order_status: Option<String>,
    pub post_duration_hours: Option<f64>,
    pub panel_duration_hours: Option<f64>,
    pub post_crew_size: Option<i32>,
    pub panel_crew_size: Option<i32>,
    pub production_duration_days: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilters {
    pub phase: Option<String>,
    pub status: Option<String>,
    pub scheduler_stage: Option<String>,
    pub install_stage: Option<String>,
    pub work_type_id: Option<Uuid>,
    pub limit: Option<i64>,
}

pub fn find_job(conn: &mut PgConnection, job_id: Uuid) -> AppResult<Job> {
    jobs::table
        .find(job_id)
        .first::<Job>(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", job_id)))
}

/// Applies a patch to a loaded job, enforcing enum validity and the
/// phase/stage invariant. Pure so it can be tested without a database.
pub fn apply_update(job: &mut Job, update: JobUpdate, now: DateTime<Utc>) -> AppResult<()> {
    if let Some(v) = update.job_code {
        job.job_code = Some(v);
    }
    if let Some(v) = update.description {
        job.description = Some(v);
    }
    if let Some(v) = update.company_name {
        job.company_name = Some(v);
    }
    if let Some(v) = update.contact_name {
        job.contact_name = Some(v);
    }
    if let Some(v) = update.contact_phone {
        job.contact_phone = Some(v);
    }
    if let Some(v) = update.contact_email {
        job.contact_email = Some(v);
    }
    if let Some(v) = update.address {
        job.address = Some(v);
    }
    if let Some(v) = update.lifecycle_phase {
        let phase = LifecyclePhase::parse(&v)
            .ok_or_else(|| AppError::Validation(format!("unknown lifecycle phase '{}'", v)))?;
        job.lifecycle_phase = phase.as_str().to_string();
        if phase == LifecyclePhase::Quote {
            job.scheduler_stage = None;
            job.install_stage = None;
        } else if job.install_stage.is_none() {
            job.install_stage = Some(InstallStage::PendingPosts.as_str().to_string());
        }
    }
    if let Some(v) = update.status {
        job.status = v;
    }
    if let Some(v) = update.sales_stage {
        let stage = SalesStage::parse(&v)
            .ok_or_else(|| AppError::Validation(format!("unknown sales stage '{}'", v)))?;
        job.sales_stage = Some(stage.as_str().to_string());
    }
    if let Some(v) = update.scheduler_stage {
        if job.phase() != LifecyclePhase::WorkOrder {
            return Err(AppError::Validation(
                "scheduler stage only applies to work orders".to_string(),
            ));
        }
        let stage = SchedulerStage::parse(&v)
            .ok_or_else(|| AppError::Validation(format!("unknown scheduler stage '{}'", v)))?;
        job.scheduler_stage = Some(stage.as_str().to_string());
    }
    if let Some(v) = update.install_stage {
        if job.phase() != LifecyclePhase::WorkOrder {
            return Err(AppError::Validation(
                "install stage only applies to work orders".to_string(),
            ));
        }
        let stage = InstallStage::parse(&v)
            .ok_or_else(|| AppError::Validation(format!("unknown install stage '{}'", v)))?;
        job.install_stage = Some(stage.as_str().to_string());
    }
    if let Some(v) = update.work_type_id {
        job.work_type_id = Some(v);
    }
    if let Some(v) = update.quote_value {
        job.quote_value = Some(v);
    }
    if let Some(v) = update.purchase_order_status {
        let po = PurchaseOrderStatus::parse(&v)
            .ok_or_else(|| AppError::Validation(format!("unknown purchase order status '{}'", v)))?;
        job.purchase_order_status = po.as_str().to_string();
    }
    if let Some(v) = update.post_duration_hours {
        job.post_duration_hours = Some(v);
    }
    if let Some(v) = update.panel_duration_hours {
        job.panel_duration_hours = Some(v);
    }
    if let Some(v) = update.post_crew_size {
        job.post_crew_size = Some(v);
    }
    if let Some(v) = update.panel_crew_size {
        job.panel_crew_size = Some(v);
    }
    if let Some(v) = update.production_duration_days {
        job.production_duration_days = Some(v);
    }
    job.updated_at = now;
    Ok(())
}

pub async fn handle_job_list(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<JobFilters>,
) -> AppResult<Json<Vec<JobResponse>>> {
    let rows = blocking(&state.conn, move |conn| {
        let mut query = jobs::table.into_boxed();
        if let Some(phase) = &filters.phase {
            LifecyclePhase::parse(phase)
                .ok_or_else(|| AppError::Validation(format!("unknown lifecycle phase '{}'", phase)))?;
            query = query.filter(jobs::lifecycle_phase.eq(phase.clone()));
        }
        if let Some(status) = &filters.status {
            query = query.filter(jobs::status.eq(status.clone()));
        }
        if let Some(stage) = &filters.scheduler_stage {
            query = query.filter(jobs::scheduler_stage.eq(stage.clone()));
        }
        if let Some(stage) = &filters.install_stage {
            query = query.filter(jobs::install_stage.eq(stage.clone()));
        }
        if let Some(wt) = filters.work_type_id {
            query = query.filter(jobs::work_type_id.eq(wt));
        }
        let limit = filters.limit.unwrap_or(500).clamp(1, 2000);
        Ok(query
            .order(jobs::updated_at.desc())
            .limit(limit)
            .load::<Job>(conn)?)
    })
    .await?;
    Ok(Json(rows.into_iter().map(JobResponse::from).collect()))
}

pub async fn handle_job_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| find_job(conn, id)).await?;
    Ok(Json(job.into()))
}

pub async fn handle_job_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| {
        let mut job = Job::new_lead(Utc::now());
        job.job_code = payload.job_code;
        job.description = payload.description;
        job.company_name = payload.company_name;
        job.contact_name = payload.contact_name;
        job.contact_phone = payload.contact_phone;
        job.contact_email = payload.contact_email;
        job.address = payload.address;
        job.quote_value = payload.quote_value;
        job.work_type_id = payload.work_type_id;
        diesel::insert_into(jobs::table).values(&job).execute(conn)?;
        Ok(job)
    })
    .await?;
    log::info!("created job {}", job.id);
    Ok(Json(job.into()))
}

pub async fn handle_job_patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<JobUpdate>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut job = find_job(conn, id)?;
            apply_update(&mut job, payload, Utc::now())?;
            diesel::update(jobs::table.find(id)).set(&job).execute(conn)?;
            Ok(job)
        })
    })
    .await?;
    Ok(Json(job.into()))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/jobs", get(handle_job_list).post(handle_job_create))
        .route(
            "/api/jobs/:id",
            get(handle_job_get).patch(handle_job_patch),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_rejects_install_stage_on_quote() {
        let mut job = Job::new_lead(Utc::now());
        let update = JobUpdate {
            install_stage: Some("pending_posts".to_string()),
            ..Default::default()
        };
        let err = apply_update(&mut job, update, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(job.install_stage.is_none());
    }

    #[test]
    fn promoting_to_work_order_seeds_install_stage() {
        let mut job = Job::new_lead(Utc::now());
        let update = JobUpdate {
            lifecycle_phase: Some("work_order".to_string()),
            scheduler_stage: Some("new_jobs_won".to_string()),
            ..Default::default()
        };
        apply_update(&mut job, update, Utc::now()).unwrap();
        assert_eq!(job.lifecycle_phase, "work_order");
        assert_eq!(job.install_stage.as_deref(), Some("pending_posts"));
        assert_eq!(job.scheduler_stage.as_deref(), Some("new_jobs_won"));
    }

    #[test]
    fn demoting_to_quote_clears_stages() {
        let mut job = Job::new_lead(Utc::now());
        apply_update(
            &mut job,
            JobUpdate {
                lifecycle_phase: Some("work_order".to_string()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap();
        apply_update(
            &mut job,
            JobUpdate {
                lifecycle_phase: Some("quote".to_string()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert!(job.install_stage.is_none());
        assert!(job.scheduler_stage.is_none());
    }

    #[test]
    fn patch_rejects_unknown_enum_values() {
        let mut job = Job::new_lead(Utc::now());
        let err = apply_update(
            &mut job,
            JobUpdate {
                purchase_order_status: Some("shipped".to_string()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
