pub mod api_router;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod messaging;
pub mod scheduling;
pub mod servicem8;
pub mod settings;
pub mod shared;
pub mod worktypes;
