use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::jobs::find_job;
use crate::shared::models::schema::{job_stage_progress, jobs, work_type_stages};
use crate::shared::state::AppState;
use crate::shared::utils::blocking;
use crate::worktypes::WorkTypeStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

// Rows are always loaded, mutated, and written back whole, so None means
// "write NULL" rather than "leave unchanged" (clearing a stopped timer's
// start stamp depends on this).
#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable, AsChangeset)]
#[diesel(table_name = job_stage_progress, treat_none_as_null = true)]
pub struct JobStageProgress {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage_id: Uuid,
    pub status: String,
    pub notes: Option<String>,
    pub timer_running: bool,
    pub timer_started_at: Option<DateTime<Utc>>,
    pub total_time_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStageProgress {
    pub fn pending(job_id: Uuid, stage_id: Uuid, now: DateTime<Utc>) -> Self {
        JobStageProgress {
            id: Uuid::new_v4(),
            job_id,
            stage_id,
            status: StageStatus::Pending.as_str().to_string(),
            notes: None,
            timer_running: false,
            timer_started_at: None,
            total_time_seconds: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgressResponse {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage_id: Uuid,
    pub stage_name: String,
    pub stage_key: String,
    pub category: String,
    pub order_index: i32,
    pub triggers_scheduler: bool,
    pub triggers_purchase_order: bool,
    pub status: String,
    pub notes: Option<String>,
    pub timer_running: bool,
    pub timer_started_at: Option<DateTime<Utc>>,
    pub total_time_seconds: i64,
    pub updated_at: DateTime<Utc>,
}

impl StageProgressResponse {
    fn from_parts(progress: JobStageProgress, stage: WorkTypeStage) -> Self {
        StageProgressResponse {
            id: progress.id,
            job_id: progress.job_id,
            stage_id: progress.stage_id,
            stage_name: stage.name,
            stage_key: stage.stage_key,
            category: stage.category,
            order_index: stage.order_index,
            triggers_scheduler: stage.triggers_scheduler,
            triggers_purchase_order: stage.triggers_purchase_order,
            status: progress.status,
            notes: progress.notes,
            timer_running: progress.timer_running,
            timer_started_at: progress.timer_started_at,
            total_time_seconds: progress.total_time_seconds,
            updated_at: progress.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeStagesRequest {
    pub work_type_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgressUpdate {
    pub status: Option<String>,
    pub notes: Option<String>,
}

/// Starting an already-running timer is an error; silently resetting the
/// start stamp would discard time the crew believes is being recorded.
pub fn start_timer(progress: &mut JobStageProgress, now: DateTime<Utc>) -> AppResult<()> {
    if progress.timer_running {
        return Err(AppError::Conflict("timer already running".to_string()));
    }
    progress.timer_running = true;
    progress.timer_started_at = Some(now);
    progress.status = StageStatus::InProgress.as_str().to_string();
    progress.updated_at = now;
    Ok(())
}

/// Stopping a stopped timer is a no-op; returns whether anything changed.
pub fn stop_timer(progress: &mut JobStageProgress, now: DateTime<Utc>) -> bool {
    if !progress.timer_running {
        return false;
    }
    let elapsed = progress
        .timer_started_at
        .map(|started| (now - started).num_seconds().max(0))
        .unwrap_or(0);
    progress.total_time_seconds += elapsed;
    progress.timer_running = false;
    progress.timer_started_at = None;
    progress.updated_at = now;
    true
}

/// Completion toggle: completed flips back to pending, anything else
/// (pending or in_progress) flips to completed.
pub fn toggle_completion(progress: &mut JobStageProgress, now: DateTime<Utc>) {
    let next = match StageStatus::parse(&progress.status) {
        Some(StageStatus::Completed) => StageStatus::Pending,
        _ => StageStatus::Completed,
    };
    progress.status = next.as_str().to_string();
    progress.updated_at = now;
}

fn find_stage(conn: &mut PgConnection, stage_id: Uuid) -> AppResult<WorkTypeStage> {
    work_type_stages::table
        .find(stage_id)
        .first::<WorkTypeStage>(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("stage {} not found", stage_id)))
}

/// Fetch-or-lazily-create the progress row for a (job, stage) pair.
fn get_or_create(
    conn: &mut PgConnection,
    job_id: Uuid,
    stage_id: Uuid,
) -> AppResult<JobStageProgress> {
    if let Some(existing) = job_stage_progress::table
        .filter(job_stage_progress::job_id.eq(job_id))
        .filter(job_stage_progress::stage_id.eq(stage_id))
        .first::<JobStageProgress>(conn)
        .optional()?
    {
        return Ok(existing);
    }
    find_job(conn, job_id)?;
    find_stage(conn, stage_id)?;
    let row = JobStageProgress::pending(job_id, stage_id, Utc::now());
    diesel::insert_into(job_stage_progress::table)
        .values(&row)
        .on_conflict((job_stage_progress::job_id, job_stage_progress::stage_id))
        .do_nothing()
        .execute(conn)?;
    // Re-read in case a concurrent request won the insert race.
    Ok(job_stage_progress::table
        .filter(job_stage_progress::job_id.eq(job_id))
        .filter(job_stage_progress::stage_id.eq(stage_id))
        .first::<JobStageProgress>(conn)?)
}

fn save(conn: &mut PgConnection, progress: &JobStageProgress) -> AppResult<()> {
    diesel::update(job_stage_progress::table.find(progress.id))
        .set(progress)
        .execute(conn)?;
    Ok(())
}

fn joined_response(
    conn: &mut PgConnection,
    progress: JobStageProgress,
) -> AppResult<StageProgressResponse> {
    let stage = find_stage(conn, progress.stage_id)?;
    Ok(StageProgressResponse::from_parts(progress, stage))
}

pub async fn handle_stage_list(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<Vec<StageProgressResponse>>> {
    let rows = blocking(&state.conn, move |conn| {
        find_job(conn, job_id)?;
        let rows = job_stage_progress::table
            .inner_join(work_type_stages::table)
            .filter(job_stage_progress::job_id.eq(job_id))
            .order(work_type_stages::order_index.asc())
            .load::<(JobStageProgress, WorkTypeStage)>(conn)?;
        Ok(rows)
    })
    .await?;
    Ok(Json(
        rows.into_iter()
            .map(|(p, s)| StageProgressResponse::from_parts(p, s))
            .collect(),
    ))
}

/// Inserts a pending progress row for every stage of the work type.
/// Idempotent: rows that already exist are left untouched.
pub async fn handle_stages_initialize(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Json(payload): Json<InitializeStagesRequest>,
) -> AppResult<Json<Vec<StageProgressResponse>>> {
    let rows = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut job = find_job(conn, job_id)?;
            let stage_ids: Vec<Uuid> = work_type_stages::table
                .filter(work_type_stages::work_type_id.eq(payload.work_type_id))
                .select(work_type_stages::id)
                .load(conn)?;
            if stage_ids.is_empty() {
                return Err(AppError::NotFound(format!(
                    "work type {} has no stages",
                    payload.work_type_id
                )));
            }
            let now = Utc::now();
            let new_rows: Vec<JobStageProgress> = stage_ids
                .iter()
                .map(|stage_id| JobStageProgress::pending(job_id, *stage_id, now))
                .collect();
            diesel::insert_into(job_stage_progress::table)
                .values(&new_rows)
                .on_conflict((job_stage_progress::job_id, job_stage_progress::stage_id))
                .do_nothing()
                .execute(conn)?;

            if job.work_type_id != Some(payload.work_type_id) {
                job.work_type_id = Some(payload.work_type_id);
                job.updated_at = now;
                diesel::update(jobs::table.find(job_id)).set(&job).execute(conn)?;
            }

            let rows = job_stage_progress::table
                .inner_join(work_type_stages::table)
                .filter(job_stage_progress::job_id.eq(job_id))
                .order(work_type_stages::order_index.asc())
                .load::<(JobStageProgress, WorkTypeStage)>(conn)?;
            Ok(rows)
        })
    })
    .await?;
    Ok(Json(
        rows.into_iter()
            .map(|(p, s)| StageProgressResponse::from_parts(p, s))
            .collect(),
    ))
}

pub async fn handle_stage_update(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<StageProgressUpdate>,
) -> AppResult<Json<StageProgressResponse>> {
    let response = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut progress = get_or_create(conn, job_id, stage_id)?;
            if let Some(status) = payload.status {
                let parsed = StageStatus::parse(&status).ok_or_else(|| {
                    AppError::Validation(format!("unknown stage status '{}'", status))
                })?;
                progress.status = parsed.as_str().to_string();
            }
            if let Some(notes) = payload.notes {
                progress.notes = Some(notes);
            }
            progress.updated_at = Utc::now();
            save(conn, &progress)?;
            joined_response(conn, progress)
        })
    })
    .await?;
    Ok(Json(response))
}

pub async fn handle_stage_toggle(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<StageProgressResponse>> {
    let response = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut progress = get_or_create(conn, job_id, stage_id)?;
            toggle_completion(&mut progress, Utc::now());
            save(conn, &progress)?;
            joined_response(conn, progress)
        })
    })
    .await?;
    Ok(Json(response))
}

pub async fn handle_timer_start(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<StageProgressResponse>> {
    let response = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut progress = get_or_create(conn, job_id, stage_id)?;
            start_timer(&mut progress, Utc::now())?;
            save(conn, &progress)?;
            joined_response(conn, progress)
        })
    })
    .await?;
    Ok(Json(response))
}

pub async fn handle_timer_stop(
    State(state): State<Arc<AppState>>,
    Path((job_id, stage_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<StageProgressResponse>> {
    let response = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut progress = get_or_create(conn, job_id, stage_id)?;
            if stop_timer(&mut progress, Utc::now()) {
                save(conn, &progress)?;
            }
            joined_response(conn, progress)
        })
    })
    .await?;
    Ok(Json(response))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/jobs/:id/stages", get(handle_stage_list))
        .route(
            "/api/jobs/:id/stages/initialize",
            post(handle_stages_initialize),
        )
        .route(
            "/api/jobs/:id/stages/:stage_id",
            patch(handle_stage_update),
        )
        .route(
            "/api/jobs/:id/stages/:stage_id/toggle",
            post(handle_stage_toggle),
        )
        .route(
            "/api/jobs/:id/stages/:stage_id/timer/start",
            post(handle_timer_start),
        )
        .route(
            "/api/jobs/:id/stages/:stage_id/timer/stop",
            post(handle_timer_stop),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn progress() -> JobStageProgress {
        JobStageProgress::pending(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn start_sets_running_and_in_progress() {
        let mut p = progress();
        let now = Utc::now();
        start_timer(&mut p, now).unwrap();
        assert!(p.timer_running);
        assert_eq!(p.timer_started_at, Some(now));
        assert_eq!(p.status, "in_progress");
    }

    #[test]
    fn start_while_running_is_rejected() {
        let mut p = progress();
        let now = Utc::now();
        start_timer(&mut p, now).unwrap();
        let err = start_timer(&mut p, now + Duration::seconds(5)).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        // Original start stamp survives the rejected second start.
        assert_eq!(p.timer_started_at, Some(now));
    }

    #[test]
    fn stop_accumulates_elapsed_seconds() {
        let mut p = progress();
        let start = Utc::now();
        start_timer(&mut p, start).unwrap();
        assert!(stop_timer(&mut p, start + Duration::seconds(90)));
        assert_eq!(p.total_time_seconds, 90);
        assert!(!p.timer_running);
        assert!(p.timer_started_at.is_none());

        // A second session adds to the same total.
        start_timer(&mut p, start + Duration::seconds(200)).unwrap();
        assert!(stop_timer(&mut p, start + Duration::seconds(260)));
        assert_eq!(p.total_time_seconds, 150);
    }

    #[test]
    fn stop_when_not_running_is_noop() {
        let mut p = progress();
        assert!(!stop_timer(&mut p, Utc::now()));
        assert_eq!(p.total_time_seconds, 0);
        assert_eq!(p.status, "pending");
    }

    #[test]
    fn toggle_flips_between_completed_and_pending() {
        let mut p = progress();
        let now = Utc::now();
        toggle_completion(&mut p, now);
        assert_eq!(p.status, "completed");
        toggle_completion(&mut p, now);
        assert_eq!(p.status, "pending");

        // in_progress also toggles straight to completed.
        p.status = StageStatus::InProgress.as_str().to_string();
        toggle_completion(&mut p, now);
        assert_eq!(p.status, "completed");
    }
}
