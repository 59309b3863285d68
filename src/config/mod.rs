use anyhow::Context;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub servicem8: ServiceM8Config,
    pub sync: SyncConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Clone)]
pub struct ServiceM8Config {
    pub app_id: String,
    pub app_secret: String,
    /// Public base URL of this server, used to build the OAuth redirect URI.
    pub public_url: String,
    pub api_base: String,
    pub scope: String,
}

impl ServiceM8Config {
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/servicem8/callback", self.public_url)
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    /// Cron expression evaluated by the sync service ticker.
    pub schedule: String,
    /// Delay before the first automatic sync after startup.
    pub startup_delay_secs: u64,
    pub enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let server = ServerConfig {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        };

        let servicem8 = ServiceM8Config {
            app_id: std::env::var("SERVICEM8_APP_ID").unwrap_or_default(),
            app_secret: std::env::var("SERVICEM8_APP_SECRET").unwrap_or_default(),
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| format!("http://{}:{}", server.host, server.port)),
            api_base: std::env::var("SERVICEM8_API_BASE")
                .unwrap_or_else(|_| "https://api.servicem8.com/api_1.0".to_string()),
            scope: std::env::var("SERVICEM8_SCOPE").unwrap_or_else(|_| {
                "read_jobs manage_jobs read_customers read_job_notes publish_sms publish_email"
                    .to_string()
            }),
        };

        // Every 15 minutes unless overridden.
        let sync = SyncConfig {
            schedule: std::env::var("SYNC_SCHEDULE")
                .unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            startup_delay_secs: std::env::var("SYNC_STARTUP_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            enabled: std::env::var("SYNC_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        };

        Ok(AppConfig {
            server,
            database: DatabaseConfig { url: database_url },
            servicem8,
            sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_uri_appends_callback_path() {
        let cfg = ServiceM8Config {
            app_id: "app".into(),
            app_secret: "secret".into(),
            public_url: "https://cc.example.com".into(),
            api_base: "https://api.servicem8.com/api_1.0".into(),
            scope: "read_jobs".into(),
        };
        assert_eq!(
            cfg.redirect_uri(),
            "https://cc.example.com/auth/servicem8/callback"
        );
    }
}
