use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::jobs::lifecycle::{InstallStage, LifecyclePhase};
use crate::jobs::{find_job, Job, JobResponse};
use crate::settings::{load_staff, StaffMember, StaffRole, ALL_STAFF_ID};
use crate::shared::models::schema::jobs;
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

/// Confirmed dates may only be booked this many days ahead; anything further
/// out stays tentative.
pub const CONFIRM_LOCKOUT_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Posts,
    Panels,
}

pub fn daily_install_capacity(staff: &[StaffMember]) -> f64 {
    staff
        .iter()
        .filter(|s| s.active && s.role == StaffRole::Install && s.id != ALL_STAFF_ID)
        .map(|s| s.daily_capacity_hours)
        .sum()
}

/// Confirmed post + panel install hours booked on a given day. Tentative
/// dates never count.
pub fn booked_hours(jobs: &[Job], date: NaiveDate) -> f64 {
    jobs.iter()
        .map(|j| {
            let mut hours = 0.0;
            if j.post_install_date == Some(date) {
                hours += j.post_duration_hours.unwrap_or(0.0);
            }
            if j.panel_install_date == Some(date) {
                hours += j.panel_duration_hours.unwrap_or(0.0);
            }
            hours
        })
        .sum()
}

pub fn is_over_capacity(booked: f64, capacity: f64) -> bool {
    booked > capacity
}

/// Milder warning state than over-capacity: scheduling one more job of the
/// given duration would tip the day over. Colors the UI, never blocks.
pub fn would_overbook(booked: f64, capacity: f64, candidate: f64) -> bool {
    booked + candidate > capacity
}

pub fn within_confirm_window(date: NaiveDate, today: NaiveDate) -> bool {
    (date - today).num_days() <= CONFIRM_LOCKOUT_DAYS
}

fn require_work_order(job: &Job) -> AppResult<()> {
    if job.phase() != LifecyclePhase::WorkOrder {
        return Err(AppError::Validation(
            "only work orders can be scheduled".to_string(),
        ));
    }
    Ok(())
}

/// Advance planning: pencils a milestone onto a future date with no capacity
/// or window constraints. Clears any confirmed date for the milestone so the
/// two can never coexist.
pub fn apply_tentative(
    job: &mut Job,
    milestone: Milestone,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> AppResult<()> {
    require_work_order(job)?;
    if job.install_stage_parsed() == Some(InstallStage::Completed) {
        return Err(AppError::Validation(
            "install already completed".to_string(),
        ));
    }
    match milestone {
        Milestone::Posts => {
            job.tentative_post_date = Some(date);
            job.post_install_date = None;
            job.install_stage = Some(InstallStage::TentativePosts.as_str().to_string());
        }
        Milestone::Panels => {
            job.tentative_panel_date = Some(date);
            job.panel_install_date = None;
            job.install_stage = Some(InstallStage::TentativePanels.as_str().to_string());
        }
    }
    job.updated_at = now;
    Ok(())
}

/// Books a confirmed install date. Subject to the two-week window; the
/// tentative date for the milestone is consumed.
pub fn apply_confirmed(
    job: &mut Job,
    milestone: Milestone,
    date: NaiveDate,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> AppResult<()> {
    require_work_order(job)?;
    if !within_confirm_window(date, today) {
        return Err(AppError::Validation(format!(
            "cannot confirm {}: more than {} days out",
            date, CONFIRM_LOCKOUT_DAYS
        )));
    }
    match milestone {
        Milestone::Posts => {
            job.post_install_date = Some(date);
            job.tentative_post_date = None;
            job.install_stage = Some(InstallStage::PostsScheduled.as_str().to_string());
        }
        Milestone::Panels => {
            job.panel_install_date = Some(date);
            job.tentative_panel_date = None;
            job.install_stage = Some(InstallStage::PanelsScheduled.as_str().to_string());
        }
    }
    job.updated_at = now;
    Ok(())
}

/// Promotes the pencilled tentative date into a confirmed booking.
pub fn confirm_tentative(
    job: &mut Job,
    milestone: Milestone,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let date = match milestone {
        Milestone::Posts => job.tentative_post_date,
        Milestone::Panels => job.tentative_panel_date,
    }
    .ok_or_else(|| AppError::Validation("no tentative date to confirm".to_string()))?;
    apply_confirmed(job, milestone, date, today, now)
}

/// Drags the job back off the calendar. Idempotent; returns whether any
/// state actually changed.
pub fn unschedule(job: &mut Job, milestone: Milestone, now: DateTime<Utc>) -> bool {
    let (pending, changed) = match milestone {
        Milestone::Posts => {
            let changed = job.post_install_date.is_some()
                || job.tentative_post_date.is_some()
                || job.install_stage.as_deref() != Some(InstallStage::PendingPosts.as_str());
            job.post_install_date = None;
            job.tentative_post_date = None;
            (InstallStage::PendingPosts, changed)
        }
        Milestone::Panels => {
            let changed = job.panel_install_date.is_some()
                || job.tentative_panel_date.is_some()
                || job.install_stage.as_deref() != Some(InstallStage::PendingPanels.as_str());
            job.panel_install_date = None;
            job.tentative_panel_date = None;
            (InstallStage::PendingPanels, changed)
        }
    };
    job.install_stage = Some(pending.as_str().to_string());
    if changed {
        job.updated_at = now;
    }
    changed
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub milestone: Milestone,
    pub date: NaiveDate,
    #[serde(default)]
    pub tentative: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRequest {
    pub milestone: Milestone,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub capacity_hours: f64,
    pub booked_hours: f64,
    pub over_capacity: bool,
    pub jobs: Vec<JobResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckQuery {
    pub date: NaiveDate,
    pub duration: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub date: NaiveDate,
    pub capacity_hours: f64,
    pub booked_hours: f64,
    pub over_capacity: bool,
    pub would_overbook: bool,
}

fn jobs_on_day(conn: &mut PgConnection, date: NaiveDate) -> AppResult<Vec<Job>> {
    Ok(jobs::table
        .filter(
            jobs::post_install_date
                .eq(date)
                .or(jobs::panel_install_date.eq(date)),
        )
        .load::<Job>(conn)?)
}

fn save_job(conn: &mut PgConnection, job: &Job) -> AppResult<()> {
    diesel::update(jobs::table.find(job.id))
        .set((
            jobs::post_install_date.eq(job.post_install_date),
            jobs::panel_install_date.eq(job.panel_install_date),
            jobs::tentative_post_date.eq(job.tentative_post_date),
            jobs::tentative_panel_date.eq(job.tentative_panel_date),
            jobs::install_stage.eq(job.install_stage.clone()),
            jobs::updated_at.eq(job.updated_at),
        ))
        .execute(conn)?;
    Ok(())
}

pub async fn handle_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ScheduleRequest>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut job = find_job(conn, id)?;
            let now = Utc::now();
            if payload.tentative {
                apply_tentative(&mut job, payload.milestone, payload.date, now)?;
            } else {
                apply_confirmed(
                    &mut job,
                    payload.milestone,
                    payload.date,
                    now.date_naive(),
                    now,
                )?;
            }
            save_job(conn, &job)?;
            Ok(job)
        })
    })
    .await?;
    Ok(Json(job.into()))
}

pub async fn handle_confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MilestoneRequest>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut job = find_job(conn, id)?;
            let now = Utc::now();
            confirm_tentative(&mut job, payload.milestone, now.date_naive(), now)?;
            save_job(conn, &job)?;
            Ok(job)
        })
    })
    .await?;
    Ok(Json(job.into()))
}

pub async fn handle_unschedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MilestoneRequest>,
) -> AppResult<Json<JobResponse>> {
    let job = blocking(&state.conn, move |conn| {
        conn.transaction(|conn| {
            let mut job = find_job(conn, id)?;
            if unschedule(&mut job, payload.milestone, Utc::now()) {
                save_job(conn, &job)?;
            }
            Ok(job)
        })
    })
    .await?;
    Ok(Json(job.into()))
}

pub async fn handle_day(
    State(state): State<Arc<AppState>>,
    Path(date): Path<NaiveDate>,
) -> AppResult<Json<DaySchedule>> {
    let (capacity, booked, day_jobs) = blocking(&state.conn, move |conn| {
        let staff = load_staff(conn)?;
        let day_jobs = jobs_on_day(conn, date)?;
        let capacity = daily_install_capacity(&staff);
        let booked = booked_hours(&day_jobs, date);
        Ok((capacity, booked, day_jobs))
    })
    .await?;
    Ok(Json(DaySchedule {
        date,
        capacity_hours: capacity,
        booked_hours: booked,
        over_capacity: is_over_capacity(booked, capacity),
        jobs: day_jobs.into_iter().map(JobResponse::from).collect(),
    }))
}

pub async fn handle_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> AppResult<Json<CheckResponse>> {
    let (capacity, booked) = blocking(&state.conn, move |conn| {
        let staff = load_staff(conn)?;
        let day_jobs = jobs_on_day(conn, query.date)?;
        Ok((
            daily_install_capacity(&staff),
            booked_hours(&day_jobs, query.date),
        ))
    })
    .await?;
    Ok(Json(CheckResponse {
        date: query.date,
        capacity_hours: capacity,
        booked_hours: booked,
        over_capacity: is_over_capacity(booked, capacity),
        would_overbook: would_overbook(booked, capacity, query.duration),
    }))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/jobs/:id/schedule", post(handle_schedule))
        .route("/api/jobs/:id/schedule/confirm", post(handle_confirm))
        .route("/api/jobs/:id/unschedule", post(handle_unschedule))
        .route("/api/schedule/day/:date", get(handle_day))
        .route("/api/schedule/check", get(handle_check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::lifecycle::SchedulerStage;

    fn install_staff(hours: &[f64]) -> Vec<StaffMember> {
        hours
            .iter()
            .enumerate()
            .map(|(i, h)| StaffMember {
                id: format!("s{}", i),
                name: format!("Crew {}", i),
                role: StaffRole::Install,
                daily_capacity_hours: *h,
                skills: vec![],
                active: true,
            })
            .collect()
    }

    fn work_order() -> Job {
        let mut job = Job::new_lead(Utc::now());
        job.lifecycle_phase = LifecyclePhase::WorkOrder.as_str().to_string();
        job.scheduler_stage = Some(SchedulerStage::NewJobsWon.as_str().to_string());
        job.install_stage = Some(InstallStage::PendingPosts.as_str().to_string());
        job
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn capacity_sums_active_install_staff_only() {
        let mut staff = install_staff(&[8.0, 8.0, 16.0]);
        staff[2].active = false;
        staff.push(StaffMember {
            id: ALL_STAFF_ID.to_string(),
            name: "All staff".into(),
            role: StaffRole::Install,
            daily_capacity_hours: 100.0,
            skills: vec![],
            active: true,
        });
        staff.push(StaffMember {
            id: "sales1".into(),
            name: "Front office".into(),
            role: StaffRole::Sales,
            daily_capacity_hours: 8.0,
            skills: vec![],
            active: true,
        });
        assert_eq!(daily_install_capacity(&staff), 16.0);
    }

    #[test]
    fn overbook_is_distinct_from_over_capacity() {
        // Empty day, 32h capacity, a 40h candidate: would overbook but the
        // day itself is not yet over capacity.
        assert!(would_overbook(0.0, 32.0, 40.0));
        assert!(!is_over_capacity(0.0, 32.0));

        assert!(is_over_capacity(33.0, 32.0));
        assert!(!is_over_capacity(32.0, 32.0));
        assert!(!would_overbook(24.0, 32.0, 8.0));
    }

    #[test]
    fn booked_hours_counts_posts_and_panels_on_the_day() {
        let d = date("2024-03-04");
        let mut a = work_order();
        a.post_install_date = Some(d);
        a.post_duration_hours = Some(6.0);
        let mut b = work_order();
        b.panel_install_date = Some(d);
        b.panel_duration_hours = Some(5.5);
        let mut c = work_order();
        c.tentative_post_date = Some(d); // tentative never counts
        c.post_duration_hours = Some(8.0);
        assert_eq!(booked_hours(&[a, b, c], d), 11.5);
    }

    #[test]
    fn confirm_within_window_moves_tentative_to_confirmed() {
        let today = date("2024-03-01");
        let mut job = work_order();
        apply_tentative(&mut job, Milestone::Posts, date("2024-03-10"), Utc::now()).unwrap();
        assert_eq!(job.install_stage.as_deref(), Some("tentative_posts"));

        confirm_tentative(&mut job, Milestone::Posts, today, Utc::now()).unwrap();
        assert_eq!(job.post_install_date, Some(date("2024-03-10")));
        assert_eq!(job.tentative_post_date, None);
        assert_eq!(job.install_stage.as_deref(), Some("posts_scheduled"));
    }

    #[test]
    fn confirm_outside_window_is_rejected_without_changes() {
        let today = date("2024-03-01");
        let mut job = work_order();
        apply_tentative(&mut job, Milestone::Panels, date("2024-03-20"), Utc::now()).unwrap();

        let err = confirm_tentative(&mut job, Milestone::Panels, today, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        // Tentative state untouched; nothing confirmed.
        assert_eq!(job.tentative_panel_date, Some(date("2024-03-20")));
        assert_eq!(job.panel_install_date, None);
        assert_eq!(job.install_stage.as_deref(), Some("tentative_panels"));
    }

    #[test]
    fn lockout_boundary_is_exactly_fourteen_days() {
        let today = date("2024-03-01");
        assert!(within_confirm_window(date("2024-03-15"), today));
        assert!(!within_confirm_window(date("2024-03-16"), today));
    }

    #[test]
    fn direct_confirmed_drop_outside_window_is_rejected() {
        let mut job = work_order();
        let now = Utc::now();
        let err =
            apply_confirmed(&mut job, Milestone::Posts, date("2099-01-01"), date("2024-03-01"), now)
                .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(job.post_install_date, None);
    }

    #[test]
    fn unschedule_resets_stage_and_is_idempotent() {
        let today = date("2024-03-01");
        let mut job = work_order();
        apply_confirmed(&mut job, Milestone::Posts, date("2024-03-08"), today, Utc::now()).unwrap();
        assert!(unschedule(&mut job, Milestone::Posts, Utc::now()));
        assert_eq!(job.post_install_date, None);
        assert_eq!(job.tentative_post_date, None);
        assert_eq!(job.install_stage.as_deref(), Some("pending_posts"));

        // Second unschedule changes nothing.
        assert!(!unschedule(&mut job, Milestone::Posts, Utc::now()));
        assert_eq!(job.install_stage.as_deref(), Some("pending_posts"));
    }

    #[test]
    fn scheduling_a_quote_is_rejected() {
        let mut quote = Job::new_lead(Utc::now());
        let err =
            apply_tentative(&mut quote, Milestone::Posts, date("2024-03-08"), Utc::now())
                .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn tentative_and_confirmed_are_mutually_exclusive() {
        let today = date("2024-03-01");
        let mut job = work_order();
        apply_confirmed(&mut job, Milestone::Posts, date("2024-03-05"), today, Utc::now()).unwrap();
        // Re-pencilling clears the confirmed booking.
        apply_tentative(&mut job, Milestone::Posts, date("2024-04-01"), Utc::now()).unwrap();
        assert_eq!(job.post_install_date, None);
        assert_eq!(job.tentative_post_date, Some(date("2024-04-01")));
    }
}
