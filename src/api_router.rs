//! Combines the API routes from all domain modules into a unified router.

use axum::Router;
use std::sync::Arc;

use crate::shared::state::AppState;

/// Configure all API routes from all modules.
pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // ===== Jobs: CRUD + lifecycle (jobs module) =====
        .merge(crate::jobs::configure())
        // ===== Per-job stage checklists & timers =====
        .merge(crate::jobs::stages::configure())
        // ===== Install scheduling & capacity =====
        .merge(crate::scheduling::configure())
        // ===== Work type configuration =====
        .merge(crate::worktypes::configure())
        // ===== Staff / pipeline / app settings =====
        .merge(crate::settings::configure())
        // ===== ServiceM8 OAuth connection =====
        .merge(crate::servicem8::routes::configure())
        // ===== ServiceM8 sync =====
        .merge(crate::servicem8::sync::configure())
        // ===== Outbound SMS / email =====
        .merge(crate::messaging::configure())
}
