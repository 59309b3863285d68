use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// ServiceM8 reports job timestamps in the account's local timezone (UTC+8).
pub const SOURCE_TZ_OFFSET_HOURS: i32 = 8;

/// Days a sent quote counts as "fresh" in the quotes pipeline.
pub const FRESH_QUOTE_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Quote,
    WorkOrder,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::WorkOrder => "work_order",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quote" => Some(Self::Quote),
            "work_order" => Some(Self::WorkOrder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStage {
    NewJobsWon,
    InProduction,
    WaitingSupplier,
    WaitingClient,
    NeedToGoBack,
    RecentlyCompleted,
}

impl SchedulerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewJobsWon => "new_jobs_won",
            Self::InProduction => "in_production",
            Self::WaitingSupplier => "waiting_supplier",
            Self::WaitingClient => "waiting_client",
            Self::NeedToGoBack => "need_to_go_back",
            Self::RecentlyCompleted => "recently_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_jobs_won" => Some(Self::NewJobsWon),
            "in_production" => Some(Self::InProduction),
            "waiting_supplier" => Some(Self::WaitingSupplier),
            "waiting_client" => Some(Self::WaitingClient),
            "need_to_go_back" => Some(Self::NeedToGoBack),
            "recently_completed" => Some(Self::RecentlyCompleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    PendingPosts,
    TentativePosts,
    PostsScheduled,
    Measuring,
    ManufacturingPanels,
    PendingPanels,
    TentativePanels,
    PanelsScheduled,
    Completed,
}

impl InstallStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPosts => "pending_posts",
            Self::TentativePosts => "tentative_posts",
            Self::PostsScheduled => "posts_scheduled",
            Self::Measuring => "measuring",
            Self::ManufacturingPanels => "manufacturing_panels",
            Self::PendingPanels => "pending_panels",
            Self::TentativePanels => "tentative_panels",
            Self::PanelsScheduled => "panels_scheduled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_posts" => Some(Self::PendingPosts),
            "tentative_posts" => Some(Self::TentativePosts),
            "posts_scheduled" => Some(Self::PostsScheduled),
            "measuring" => Some(Self::Measuring),
            "manufacturing_panels" => Some(Self::ManufacturingPanels),
            "pending_panels" => Some(Self::PendingPanels),
            "tentative_panels" => Some(Self::TentativePanels),
            "panels_scheduled" => Some(Self::PanelsScheduled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesStage {
    Fresh,
    AwaitingReply,
}

impl SalesStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::AwaitingReply => "awaiting_reply",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fresh" => Some(Self::Fresh),
            "awaiting_reply" => Some(Self::AwaitingReply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    None,
    Ordered,
    Received,
    Delayed,
}

impl PurchaseOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ordered => "ordered",
            Self::Received => "received",
            Self::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "ordered" => Some(Self::Ordered),
            "received" => Some(Self::Received),
            "delayed" => Some(Self::Delayed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    Email,
    Sms,
    Call,
}

impl CommunicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Call => "call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactDirection {
    Inbound,
    Outbound,
}

impl ContactDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Everything derivable from the external status text plus the quote flags.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedStatus {
    pub phase: LifecyclePhase,
    pub status: String,
    pub sales_stage: Option<SalesStage>,
    pub scheduler_stage: Option<SchedulerStage>,
    pub hours_since_quote_sent: Option<i64>,
    pub days_since_quote_sent: Option<i64>,
}

const LOSS_KEYWORDS: &[&str] = &["unsuccessful", "lost", "cancelled"];
const DONE_KEYWORDS: &[&str] = &["complete", "finished", "done"];
const WORK_ORDER_KEYWORDS: &[&str] = &["work order", "in progress", "scheduled", "completed"];

/// Maps an external (ServiceM8) status string to the local phase/stage/status
/// tuple. No keyword match falls through to quote/new_lead; bad timestamps
/// leave the derived elapsed fields unset instead of failing the job.
pub fn map_external_status(
    status_text: &str,
    quote_sent: bool,
    quote_sent_stamp: Option<&str>,
    now: DateTime<Utc>,
) -> DerivedStatus {
    let lower = status_text.to_lowercase();

    if LOSS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return DerivedStatus {
            phase: LifecyclePhase::Quote,
            status: "unsuccessful".to_string(),
            sales_stage: None,
            scheduler_stage: None,
            hours_since_quote_sent: None,
            days_since_quote_sent: None,
        };
    }

    if DONE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return DerivedStatus {
            phase: LifecyclePhase::WorkOrder,
            status: "complete".to_string(),
            sales_stage: None,
            scheduler_stage: Some(SchedulerStage::RecentlyCompleted),
            hours_since_quote_sent: None,
            days_since_quote_sent: None,
        };
    }

    if WORK_ORDER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        let stage = if lower.contains("progress") || lower.contains("production") {
            SchedulerStage::InProduction
        } else if lower.contains("scheduled") {
            SchedulerStage::InProduction
        } else {
            SchedulerStage::NewJobsWon
        };
        return DerivedStatus {
            phase: LifecyclePhase::WorkOrder,
            status: stage.as_str().to_string(),
            sales_stage: None,
            scheduler_stage: Some(stage),
            hours_since_quote_sent: None,
            days_since_quote_sent: None,
        };
    }

    // Quote phase. Sent means the flag is set AND a stamp was recorded;
    // creation date never counts as "sent".
    let sent = quote_sent
        && quote_sent_stamp
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

    if !sent {
        return DerivedStatus {
            phase: LifecyclePhase::Quote,
            status: "new_lead".to_string(),
            sales_stage: None,
            scheduler_stage: None,
            hours_since_quote_sent: None,
            days_since_quote_sent: None,
        };
    }

    let elapsed = quote_sent_stamp
        .and_then(parse_quote_stamp)
        .map(|sent_at| now - sent_at);

    let sales_stage = elapsed.map(|e| {
        if e.num_days() <= FRESH_QUOTE_DAYS {
            SalesStage::Fresh
        } else {
            SalesStage::AwaitingReply
        }
    });
    let (hours, days) = elapsed_split(elapsed);

    DerivedStatus {
        phase: LifecyclePhase::Quote,
        status: "quote_sent".to_string(),
        sales_stage,
        scheduler_stage: None,
        hours_since_quote_sent: hours,
        days_since_quote_sent: days,
    }
}

/// Under 24h the dashboard shows an hour count, after that a day count.
/// Exactly one of the two is set when the elapsed time is known.
fn elapsed_split(elapsed: Option<Duration>) -> (Option<i64>, Option<i64>) {
    match elapsed {
        Some(e) if e < Duration::hours(24) => (Some(e.num_hours()), None),
        Some(e) => (None, Some(e.num_days())),
        None => (None, None),
    }
}

/// Parses a `YYYY-MM-DD HH:MM:SS` stamp in the source timezone into UTC.
/// Returns None for anything malformed (including ServiceM8's zero dates).
pub fn parse_quote_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(SOURCE_TZ_OFFSET_HOURS * 3600)?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc8(stamp: &str) -> DateTime<Utc> {
        parse_quote_stamp(stamp).expect("valid stamp")
    }

    #[test]
    fn loss_keywords_map_to_unsuccessful_quote() {
        for text in ["Unsuccessful", "Quote - LOST", "Cancelled by client"] {
            let d = map_external_status(text, true, Some("2024-01-01 00:00:00"), Utc::now());
            assert_eq!(d.phase, LifecyclePhase::Quote);
            assert_eq!(d.status, "unsuccessful");
            assert!(d.scheduler_stage.is_none());
        }
    }

    #[test]
    fn done_keywords_map_to_recently_completed() {
        for text in ["Completed", "Job Finished", "Done and invoiced"] {
            let d = map_external_status(text, false, None, Utc::now());
            assert_eq!(d.phase, LifecyclePhase::WorkOrder);
            assert_eq!(d.status, "complete");
            assert_eq!(d.scheduler_stage, Some(SchedulerStage::RecentlyCompleted));
        }
    }

    #[test]
    fn work_order_keywords_refine_scheduler_stage() {
        let d = map_external_status("Work Order", false, None, Utc::now());
        assert_eq!(d.phase, LifecyclePhase::WorkOrder);
        assert_eq!(d.scheduler_stage, Some(SchedulerStage::NewJobsWon));

        let d = map_external_status("In Progress", false, None, Utc::now());
        assert_eq!(d.scheduler_stage, Some(SchedulerStage::InProduction));

        let d = map_external_status("Work Order - Scheduled", false, None, Utc::now());
        assert_eq!(d.scheduler_stage, Some(SchedulerStage::InProduction));
    }

    #[test]
    fn unsent_quote_is_new_lead() {
        let d = map_external_status("Quote", false, None, Utc::now());
        assert_eq!(d.status, "new_lead");
        assert!(d.sales_stage.is_none());

        // Flag set but empty stamp still counts as unsent.
        let d = map_external_status("Quote", true, Some("  "), Utc::now());
        assert_eq!(d.status, "new_lead");
    }

    #[test]
    fn sent_quote_under_24h_reports_hours_only() {
        let now = utc8("2024-01-01 10:00:00");
        let d = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(d.status, "quote_sent");
        assert_eq!(d.sales_stage, Some(SalesStage::Fresh));
        assert_eq!(d.hours_since_quote_sent, Some(10));
        assert_eq!(d.days_since_quote_sent, None);
    }

    #[test]
    fn sent_quote_over_24h_reports_days_only() {
        let now = utc8("2024-01-06 12:00:00");
        let d = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(d.hours_since_quote_sent, None);
        assert_eq!(d.days_since_quote_sent, Some(5));
        assert_eq!(d.sales_stage, Some(SalesStage::AwaitingReply));
    }

    #[test]
    fn fresh_boundary_is_three_days() {
        let now = utc8("2024-01-04 00:00:00");
        let d = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(d.sales_stage, Some(SalesStage::Fresh));

        let now = utc8("2024-01-05 00:00:01");
        let d = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(d.sales_stage, Some(SalesStage::AwaitingReply));
    }

    #[test]
    fn malformed_stamp_leaves_derived_fields_unset() {
        let d = map_external_status("Quote", true, Some("0000-00-00 00:00:00"), Utc::now());
        assert_eq!(d.status, "quote_sent");
        assert_eq!(d.sales_stage, None);
        assert_eq!(d.hours_since_quote_sent, None);
        assert_eq!(d.days_since_quote_sent, None);
    }

    #[test]
    fn stamp_parses_from_fixed_offset() {
        let dt = parse_quote_stamp("2024-01-01 08:00:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn enum_round_trips() {
        for s in [
            "pending_posts",
            "tentative_posts",
            "posts_scheduled",
            "measuring",
            "manufacturing_panels",
            "pending_panels",
            "tentative_panels",
            "panels_scheduled",
            "completed",
        ] {
            assert_eq!(InstallStage::parse(s).unwrap().as_str(), s);
        }
        assert!(InstallStage::parse("nonsense").is_none());
        for s in [
            "new_jobs_won",
            "in_production",
            "waiting_supplier",
            "waiting_client",
            "need_to_go_back",
            "recently_completed",
        ] {
            assert_eq!(SchedulerStage::parse(s).unwrap().as_str(), s);
        }
    }
}
