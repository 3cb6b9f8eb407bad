//! Typed persistence boundary.
//!
//! The core never talks to a database directly; it goes through the [`Store`]
//! trait. JSON-typed fields (`payload`, `result`, `token_usage`, settings
//! values) are serialised on write and parsed on read by the implementation,
//! and list queries always come back as flat, fully-unwrapped vectors.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Job, Mission, MissionLog, MissionStep};
use crate::settings::{AiSettings, ExecutionSettings, ProjectSettings, PromptSettings};

pub use memory::InMemoryStore;

/// Store operations the core depends on. Every write bumps the row's
/// `updated_at`.
#[async_trait]
pub trait Store: Send + Sync {
    // Missions
    async fn create_mission(&self, mission: &Mission) -> Result<(), String>;
    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, String>;
    async fn update_mission(&self, mission: &Mission) -> Result<(), String>;

    // Steps
    async fn insert_step(&self, step: &MissionStep) -> Result<(), String>;
    async fn update_step(&self, step: &MissionStep) -> Result<(), String>;
    /// Steps of a mission ordered by ascending `order_index`.
    async fn list_steps(&self, mission_id: Uuid) -> Result<Vec<MissionStep>, String>;
    /// Remove steps still `PENDING`; returns how many were deleted.
    async fn delete_pending_steps(&self, mission_id: Uuid) -> Result<usize, String>;

    // Logs (insert-only)
    async fn append_log(&self, log: &MissionLog) -> Result<(), String>;
    async fn list_logs(&self, mission_id: Uuid) -> Result<Vec<MissionLog>, String>;

    // Jobs
    async fn create_job(&self, job: &Job) -> Result<(), String>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, String>;
    /// The job driving `mission_id`, if any (at most one is running).
    async fn find_job_for_mission(&self, mission_id: Uuid) -> Result<Option<Job>, String>;
    async fn update_job(&self, job: &Job) -> Result<(), String>;
    /// Bump only `heartbeat_at` so an external liveness scanner sees us.
    async fn touch_job_heartbeat(&self, id: Uuid) -> Result<(), String>;
    /// Running jobs whose heartbeat is older than `cutoff` (crashed controllers).
    async fn stale_running_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, String>;

    // Settings (key/value per project, JSON values)
    async fn get_setting(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<serde_json::Value>, String>;
    async fn set_setting(
        &self,
        project_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), String>;
}

/// Read and type the three settings keys the core recognises. Missing or
/// malformed keys fall back to defaults rather than failing the mission.
pub async fn load_project_settings(
    store: &dyn Store,
    project_id: Uuid,
) -> Result<ProjectSettings, String> {
    let ai = match store.get_setting(project_id, "ai").await? {
        Some(value) => serde_json::from_value::<AiSettings>(value).unwrap_or_else(|e| {
            tracing::warn!("Malformed `ai` settings for project {project_id}: {e}");
            AiSettings::default()
        }),
        None => AiSettings::default(),
    };
    let execution = match store.get_setting(project_id, "execution").await? {
        Some(value) => serde_json::from_value::<ExecutionSettings>(value).unwrap_or_else(|e| {
            tracing::warn!("Malformed `execution` settings for project {project_id}: {e}");
            ExecutionSettings::default()
        }),
        None => ExecutionSettings::default(),
    };
    let prompts = match store.get_setting(project_id, "prompts").await? {
        Some(value) => serde_json::from_value::<PromptSettings>(value).unwrap_or_default(),
        None => PromptSettings::default(),
    };
    Ok(ProjectSettings { ai, execution, prompts })
}
