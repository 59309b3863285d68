use crate::config::AppConfig;
use crate::shared::utils::DbPool;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub http: reqwest::Client,
    /// Guard against overlapping ServiceM8 sync runs (manual vs timer).
    pub sync_running: AtomicBool,
}

impl AppState {
    pub fn new(config: AppConfig, conn: DbPool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("jobserver/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");
        Self {
            conn,
            config,
            http,
            sync_running: AtomicBool::new(false),
        }
    }
}
