use axum::{extract::State, response::Json, routing::get, routing::post, Router};
use chrono::{DateTime, Utc};
use cron::Schedule;
use diesel::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration as TokioDuration};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::jobs::lifecycle::{
    map_external_status, parse_quote_stamp, CommunicationType, ContactDirection, InstallStage,
    LifecyclePhase,
};
use crate::jobs::Job;
use crate::shared::models::schema::{jobs, sync_logs};
use crate::shared::state::AppState;
use crate::shared::utils::blocking;

use super::oauth::current_access_token;
use super::{ServiceM8Client, Sm8Job};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Manual,
    Automatic,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Insertable)]
#[diesel(table_name = sync_logs)]
pub struct SyncLog {
    pub id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub jobs_processed: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogResponse {
    pub id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub jobs_processed: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<SyncLog> for SyncLogResponse {
    fn from(l: SyncLog) -> Self {
        SyncLogResponse {
            id: l.id,
            sync_type: l.sync_type,
            status: l.status,
            jobs_processed: l.jobs_processed,
            error_message: l.error_message,
            started_at: l.started_at,
            finished_at: l.finished_at,
        }
    }
}

/// Best-effort guess at what kind of communication a free-text note records.
/// Substring matching only; a note that merely mentions "email" while
/// describing a phone call will misclassify. Consumers treat this as a hint.
pub fn classify_communication(text: &str) -> Option<(CommunicationType, ContactDirection)> {
    let lower = text.to_lowercase();
    let kind = if lower.contains("email") || lower.contains("e-mail") {
        CommunicationType::Email
    } else if lower.contains("sms") || lower.contains("text message") || lower.contains("texted") {
        CommunicationType::Sms
    } else if lower.contains("call") || lower.contains("phone") || lower.contains("rang") {
        CommunicationType::Call
    } else {
        return None;
    };

    const INBOUND_HINTS: &[&str] = &[
        "received",
        "client called",
        "customer called",
        "called us",
        "replied",
        "responded",
        "rang us",
        "from client",
        "from customer",
        "enquiry",
        "inquiry",
    ];
    let direction = if INBOUND_HINTS.iter().any(|h| lower.contains(h)) {
        ContactDirection::Inbound
    } else {
        ContactDirection::Outbound
    };
    Some((kind, direction))
}

/// Customer snapshot pulled from the company/contact listings, copied onto
/// the job row during sync.
#[derive(Debug, Clone, Default)]
pub struct CustomerSnapshot {
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
}

/// Upserts one remote job by its external UUID, applying the status mapping.
/// Existing rows keep their local kanban placement (status, scheduler stage,
/// install stage) unless the phase changed or the remote went terminal;
/// derived quote fields are always recomputed.
pub fn upsert_remote_job(
    conn: &mut PgConnection,
    remote: &Sm8Job,
    customer: &CustomerSnapshot,
    now: DateTime<Utc>,
) -> AppResult<Uuid> {
    let derived = map_external_status(
        &remote.status,
        remote.quote_sent,
        remote.quote_sent_stamp.as_deref(),
        now,
    );
    let quote_sent_at = remote
        .quote_sent_stamp
        .as_deref()
        .and_then(parse_quote_stamp);

    let existing = jobs::table
        .filter(jobs::servicem8_uuid.eq(&remote.uuid))
        .first::<Job>(conn)
        .optional()?;

    match existing {
        Some(mut job) => {
            let phase_changed = job.lifecycle_phase != derived.phase.as_str();
            let terminal = derived.status == "unsuccessful" || derived.status == "complete";
            if phase_changed || terminal {
                job.status = derived.status;
                job.scheduler_stage = derived.scheduler_stage.map(|s| s.as_str().to_string());
                if derived.phase == LifecyclePhase::WorkOrder {
                    if job.install_stage.is_none() {
                        job.install_stage =
                            Some(InstallStage::PendingPosts.as_str().to_string());
                    }
                } else {
                    job.install_stage = None;
                }
            }
            job.lifecycle_phase = derived.phase.as_str().to_string();
            job.sales_stage = derived.sales_stage.map(|s| s.as_str().to_string());
            job.hours_since_quote_sent = derived.hours_since_quote_sent;
            job.days_since_quote_sent = derived.days_since_quote_sent;
            job.quote_sent = remote.quote_sent;
            job.quote_sent_at = quote_sent_at;
            job.job_code = remote.generated_job_id.clone().or(job.job_code);
            job.description = remote.job_description.clone().or(job.description);
            job.address = remote.job_address.clone().or(job.address);
            job.quote_value = remote.total_invoice_amount.or(job.quote_value);
            job.company_name = customer.company_name.clone().or(job.company_name);
            job.contact_name = customer.contact_name.clone().or(job.contact_name);
            job.contact_phone = customer.contact_phone.clone().or(job.contact_phone);
            job.contact_email = customer.contact_email.clone().or(job.contact_email);
            job.updated_at = now;
            let id = job.id;
            diesel::update(jobs::table.find(id)).set(&job).execute(conn)?;
            Ok(id)
        }
        None => {
            let mut job = Job::new_lead(now);
            job.servicem8_uuid = Some(remote.uuid.clone());
            job.job_code = remote.generated_job_id.clone();
            job.description = remote.job_description.clone();
            job.address = remote.job_address.clone();
            job.quote_value = remote.total_invoice_amount;
            job.company_name = customer.company_name.clone();
            job.contact_name = customer.contact_name.clone();
            job.contact_phone = customer.contact_phone.clone();
            job.contact_email = customer.contact_email.clone();
            job.lifecycle_phase = derived.phase.as_str().to_string();
            job.status = derived.status;
            job.sales_stage = derived.sales_stage.map(|s| s.as_str().to_string());
            job.scheduler_stage = derived.scheduler_stage.map(|s| s.as_str().to_string());
            if derived.phase == LifecyclePhase::WorkOrder {
                job.install_stage = Some(InstallStage::PendingPosts.as_str().to_string());
            }
            job.quote_sent = remote.quote_sent;
            job.quote_sent_at = quote_sent_at;
            job.hours_since_quote_sent = derived.hours_since_quote_sent;
            job.days_since_quote_sent = derived.days_since_quote_sent;
            let id = job.id;
            diesel::insert_into(jobs::table).values(&job).execute(conn)?;
            Ok(id)
        }
    }
}

/// One piece of free text that might record a communication, with the best
/// timestamp available for it.
#[derive(Debug, Clone)]
pub struct CommEvent {
    pub text: String,
    pub at: Option<DateTime<Utc>>,
}

/// Picks the newest classifiable event. Events without a parseable stamp
/// fall back to "now" so a fresh unstamped note still wins.
pub fn latest_communication(
    events: &[CommEvent],
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, CommunicationType, ContactDirection)> {
    let mut latest: Option<(DateTime<Utc>, CommunicationType, ContactDirection)> = None;
    for event in events {
        let stamp = event.at.unwrap_or(now);
        if let Some((kind, direction)) = classify_communication(&event.text) {
            if latest.map(|(at, _, _)| stamp > at).unwrap_or(true) {
                latest = Some((stamp, kind, direction));
            }
        }
    }
    latest
}

/// Applies the newest classifiable note/feed event to the job's
/// contact-tracking fields.
pub fn apply_communication_events(
    conn: &mut PgConnection,
    job_id: Uuid,
    events: &[CommEvent],
    now: DateTime<Utc>,
) -> AppResult<()> {
    if let Some((at, kind, direction)) = latest_communication(events, now) {
        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::last_contact_at.eq(Some(at)),
                jobs::last_contact_type.eq(Some(kind.as_str().to_string())),
                jobs::last_contact_direction.eq(Some(direction.as_str().to_string())),
            ))
            .execute(conn)?;
        if direction == ContactDirection::Inbound {
            diesel::update(jobs::table.find(job_id))
                .set((
                    jobs::last_client_contact_at.eq(Some(at)),
                    jobs::last_client_contact_type.eq(Some(kind.as_str().to_string())),
                ))
                .execute(conn)?;
        }
    }
    Ok(())
}

fn insert_log(conn: &mut PgConnection, sync_type: SyncType) -> AppResult<SyncLog> {
    let log = SyncLog {
        id: Uuid::new_v4(),
        sync_type: sync_type.as_str().to_string(),
        status: "in_progress".to_string(),
        jobs_processed: 0,
        error_message: None,
        started_at: Utc::now(),
        finished_at: None,
    };
    diesel::insert_into(sync_logs::table).values(&log).execute(conn)?;
    Ok(log)
}

fn finalize_log(
    conn: &mut PgConnection,
    log_id: Uuid,
    status: &str,
    processed: i32,
    error: Option<String>,
) -> AppResult<()> {
    diesel::update(sync_logs::table.find(log_id))
        .set((
            sync_logs::status.eq(status),
            sync_logs::jobs_processed.eq(processed),
            sync_logs::error_message.eq(error),
            sync_logs::finished_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub status: String,
    pub jobs_processed: i32,
}

/// One full pull-and-upsert pass. Best-effort and at-least-once: jobs already
/// upserted stay upserted when a later step fails, and the partial count is
/// recorded on the log entry.
pub async fn run_sync(state: Arc<AppState>, sync_type: SyncType) -> AppResult<SyncSummary> {
    if state
        .sync_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(AppError::Conflict("sync already in progress".to_string()));
    }
    let result = run_sync_inner(&state, sync_type).await;
    state.sync_running.store(false, Ordering::SeqCst);
    result
}

async fn run_sync_inner(state: &Arc<AppState>, sync_type: SyncType) -> AppResult<SyncSummary> {
    let log = blocking(&state.conn, move |conn| insert_log(conn, sync_type)).await?;
    let log_id = log.id;

    let token = match current_access_token(state).await? {
        Some(token) => token,
        None => {
            let message = "ServiceM8 not connected".to_string();
            let msg = message.clone();
            blocking(&state.conn, move |conn| {
                finalize_log(conn, log_id, "error", 0, Some(msg))
            })
            .await?;
            return Err(AppError::Unauthorized(message));
        }
    };

    let client = ServiceM8Client::new(
        state.http.clone(),
        &state.config.servicem8.api_base,
        token,
    );

    let mut processed: i32 = 0;
    let outcome = sync_jobs(state, &client, &mut processed).await;

    match outcome {
        Ok(()) => {
            blocking(&state.conn, move |conn| {
                finalize_log(conn, log_id, "success", processed, None)
            })
            .await?;
            log::info!("ServiceM8 sync finished: {} jobs", processed);
            Ok(SyncSummary {
                status: "success".to_string(),
                jobs_processed: processed,
            })
        }
        Err(e) => {
            let message = e.to_string();
            blocking(&state.conn, move |conn| {
                finalize_log(conn, log_id, "error", processed, Some(message))
            })
            .await?;
            log::error!("ServiceM8 sync failed after {} jobs: {}", processed, e);
            Err(e)
        }
    }
}

/// Pulls the company and contact listings once and indexes them by company
/// UUID, so per-job enrichment is a map lookup instead of an API call.
async fn load_customer_index(
    client: &ServiceM8Client,
) -> HashMap<String, CustomerSnapshot> {
    let mut index: HashMap<String, CustomerSnapshot> = HashMap::new();

    match client.list_companies(Some(500), Some("active eq '1'")).await {
        Ok(companies) => {
            for company in companies {
                index
                    .entry(company.uuid)
                    .or_default()
                    .company_name = company.name;
            }
        }
        Err(e) => log::warn!("skipping company enrichment: {}", e),
    }

    match client.list_contacts(Some(500), None).await {
        Ok(contacts) => {
            for contact in contacts {
                let company_uuid = match contact.company_uuid {
                    Some(uuid) => uuid,
                    None => continue,
                };
                let snapshot = index.entry(company_uuid).or_default();
                if snapshot.contact_name.is_none() {
                    let name = [contact.first.as_deref(), contact.last.as_deref()]
                        .iter()
                        .flatten()
                        .copied()
                        .collect::<Vec<_>>()
                        .join(" ");
                    if !name.is_empty() {
                        snapshot.contact_name = Some(name);
                    }
                    snapshot.contact_phone = contact.mobile.or(contact.phone);
                    snapshot.contact_email = contact.email;
                }
            }
        }
        Err(e) => log::warn!("skipping contact enrichment: {}", e),
    }

    index
}

/// Gathers note and feed-item text for one job. Best-effort: a failed fetch
/// yields an empty list, never an error.
async fn load_comm_events(client: &ServiceM8Client, job_uuid: &str) -> Vec<CommEvent> {
    let mut events = Vec::new();
    let filter = format!("related_object_uuid eq '{}'", job_uuid);

    match client.list_notes(Some(20), Some(&filter)).await {
        Ok(notes) => {
            for note in notes.into_iter().filter(|n| n.active) {
                if let Some(text) = note.note {
                    events.push(CommEvent {
                        text,
                        at: note.create_date.as_deref().and_then(parse_quote_stamp),
                    });
                }
            }
        }
        Err(e) => log::warn!("skipping notes for job {}: {}", job_uuid, e),
    }

    match client.list_feed_items(Some(20), Some(&filter)).await {
        Ok(items) => {
            for item in items {
                if let Some(text) = item.message {
                    events.push(CommEvent {
                        text,
                        at: item.timestamp.as_deref().and_then(parse_quote_stamp),
                    });
                }
            }
        }
        Err(e) => log::warn!("skipping feed items for job {}: {}", job_uuid, e),
    }

    events
}

async fn sync_jobs(
    state: &Arc<AppState>,
    client: &ServiceM8Client,
    processed: &mut i32,
) -> AppResult<()> {
    let remote_jobs = client.list_jobs(Some(500), Some("active eq '1'")).await?;
    log::info!("ServiceM8 returned {} active jobs", remote_jobs.len());

    let customers = load_customer_index(client).await;

    for remote in remote_jobs {
        let now = Utc::now();
        let customer = remote
            .company_uuid
            .as_ref()
            .and_then(|uuid| customers.get(uuid))
            .cloned()
            .unwrap_or_default();
        let remote_for_upsert = remote.clone();
        let job_id = blocking(&state.conn, move |conn| {
            upsert_remote_job(conn, &remote_for_upsert, &customer, now)
        })
        .await?;
        *processed += 1;

        // Communication classification is a hint; fetch failures are skipped.
        let events = load_comm_events(client, &remote.uuid).await;
        if !events.is_empty() {
            blocking(&state.conn, move |conn| {
                apply_communication_events(conn, job_id, &events, now)
            })
            .await?;
        }
    }
    Ok(())
}

/// Background sync loop: one delayed run shortly after startup, then runs on
/// the configured cron cadence.
pub struct SyncService {
    state: Arc<AppState>,
}

impl SyncService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn spawn(self) {
        if !self.state.config.sync.enabled {
            log::info!("automatic ServiceM8 sync disabled");
            return;
        }

        let schedule = Schedule::from_str(&self.state.config.sync.schedule).unwrap_or_else(|e| {
            log::warn!(
                "invalid SYNC_SCHEDULE '{}' ({}); falling back to every 15 minutes",
                self.state.config.sync.schedule,
                e
            );
            Schedule::from_str("0 */15 * * * *").expect("fallback schedule parses")
        });

        sleep(TokioDuration::from_secs(
            self.state.config.sync.startup_delay_secs,
        ))
        .await;
        self.tick(SyncType::Automatic).await;

        let mut last_run = Utc::now();
        let mut ticker = interval(TokioDuration::from_secs(60));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Some(next) = schedule.upcoming(Utc).next() {
                let due_soon = (next - now).num_seconds() < 60;
                let dampened = (now - last_run).num_seconds() < 60;
                if due_soon && !dampened {
                    last_run = now;
                    self.tick(SyncType::Automatic).await;
                }
            }
        }
    }

    async fn tick(&self, sync_type: SyncType) {
        match run_sync(self.state.clone(), sync_type).await {
            Ok(summary) => {
                log::info!("automatic sync processed {} jobs", summary.jobs_processed)
            }
            Err(AppError::Conflict(_)) => {
                log::warn!("automatic sync skipped: another sync is running")
            }
            Err(e) => log::error!("automatic sync failed: {}", e),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub running: bool,
    pub latest: Option<SyncLogResponse>,
    pub recent: Vec<SyncLogResponse>,
}

pub async fn handle_sync_trigger(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<SyncSummary>> {
    let summary = run_sync(state, SyncType::Manual).await?;
    Ok(Json(summary))
}

pub async fn handle_sync_status(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<SyncStatusResponse>> {
    let running = state.sync_running.load(Ordering::SeqCst);
    let recent = blocking(&state.conn, |conn| {
        Ok(sync_logs::table
            .order(sync_logs::started_at.desc())
            .limit(20)
            .load::<SyncLog>(conn)?)
    })
    .await?;
    let recent: Vec<SyncLogResponse> = recent.into_iter().map(SyncLogResponse::from).collect();
    let latest = recent.first().cloned();
    Ok(Json(SyncStatusResponse {
        running,
        latest,
        recent,
    }))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync/servicem8", post(handle_sync_trigger))
        .route("/api/sync/status", get(handle_sync_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_detects_email_sms_and_calls() {
        assert_eq!(
            classify_communication("Emailed the updated quote to the client"),
            Some((CommunicationType::Email, ContactDirection::Outbound))
        );
        assert_eq!(
            classify_communication("SMS sent re: install date"),
            Some((CommunicationType::Sms, ContactDirection::Outbound))
        );
        assert_eq!(
            classify_communication("Phone call about colour options"),
            Some((CommunicationType::Call, ContactDirection::Outbound))
        );
        assert_eq!(classify_communication("Measured the boundary line"), None);
    }

    #[test]
    fn classifier_flags_client_initiated_contact_as_inbound() {
        assert_eq!(
            classify_communication("Client called to confirm panel colour"),
            Some((CommunicationType::Call, ContactDirection::Inbound))
        );
        assert_eq!(
            classify_communication("Received email asking about start date"),
            Some((CommunicationType::Email, ContactDirection::Inbound))
        );
    }

    #[test]
    fn classifier_is_a_hint_not_a_guarantee() {
        // Known false positive inherited from the substring approach: the
        // note is about a call but mentions email, and email wins.
        assert_eq!(
            classify_communication("Called client, they prefer email from now on"),
            Some((CommunicationType::Email, ContactDirection::Outbound))
        );
    }

    #[test]
    fn latest_communication_prefers_the_newest_event() {
        let now = parse_quote_stamp("2024-02-10 12:00:00").unwrap();
        let events = vec![
            CommEvent {
                text: "Emailed quote".to_string(),
                at: parse_quote_stamp("2024-02-01 09:00:00"),
            },
            CommEvent {
                text: "Client called about colours".to_string(),
                at: parse_quote_stamp("2024-02-05 15:30:00"),
            },
            CommEvent {
                text: "Measured the site".to_string(),
                at: parse_quote_stamp("2024-02-09 08:00:00"),
            },
        ];
        let (at, kind, direction) = latest_communication(&events, now).unwrap();
        assert_eq!(at, parse_quote_stamp("2024-02-05 15:30:00").unwrap());
        assert_eq!(kind, CommunicationType::Call);
        assert_eq!(direction, ContactDirection::Inbound);
    }

    #[test]
    fn unstamped_events_fall_back_to_now() {
        let now = parse_quote_stamp("2024-02-10 12:00:00").unwrap();
        let events = vec![
            CommEvent {
                text: "Emailed quote".to_string(),
                at: parse_quote_stamp("2024-02-01 09:00:00"),
            },
            CommEvent {
                text: "SMS sent just now".to_string(),
                at: None,
            },
        ];
        let (at, kind, _) = latest_communication(&events, now).unwrap();
        assert_eq!(at, now);
        assert_eq!(kind, CommunicationType::Sms);
    }

    #[test]
    fn sync_type_tags() {
        assert_eq!(SyncType::Manual.as_str(), "manual");
        assert_eq!(SyncType::Automatic.as_str(), "automatic");
    }
}
