//! In-memory store (non-persistent).
//!
//! Backs the test-suite and single-process deployments. Settings values are
//! kept as serialised JSON strings so the parse-on-read behaviour matches a
//! database-backed adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{Job, Mission, MissionLog, MissionStep, StepStatus};

use super::Store;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    missions: Arc<RwLock<HashMap<Uuid, Mission>>>,
    steps: Arc<RwLock<HashMap<Uuid, MissionStep>>>,
    logs: Arc<RwLock<Vec<MissionLog>>>,
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    settings: Arc<RwLock<HashMap<(Uuid, String), String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_mission(&self, mission: &Mission) -> Result<(), String> {
        let mut row = mission.clone();
        row.updated_at = Utc::now();
        self.missions.write().await.insert(row.id, row);
        Ok(())
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, String> {
        Ok(self.missions.read().await.get(&id).cloned())
    }

    async fn update_mission(&self, mission: &Mission) -> Result<(), String> {
        let mut missions = self.missions.write().await;
        if !missions.contains_key(&mission.id) {
            return Err(format!("Mission {} not found", mission.id));
        }
        let mut row = mission.clone();
        row.updated_at = Utc::now();
        missions.insert(row.id, row);
        Ok(())
    }

    async fn insert_step(&self, step: &MissionStep) -> Result<(), String> {
        let mut row = step.clone();
        row.updated_at = Utc::now();
        self.steps.write().await.insert(row.id, row);
        Ok(())
    }

    async fn update_step(&self, step: &MissionStep) -> Result<(), String> {
        let mut steps = self.steps.write().await;
        if !steps.contains_key(&step.id) {
            return Err(format!("Step {} not found", step.id));
        }
        let mut row = step.clone();
        row.updated_at = Utc::now();
        steps.insert(row.id, row);
        Ok(())
    }

    async fn list_steps(&self, mission_id: Uuid) -> Result<Vec<MissionStep>, String> {
        let mut steps: Vec<MissionStep> = self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.mission_id == mission_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order_index);
        Ok(steps)
    }

    async fn delete_pending_steps(&self, mission_id: Uuid) -> Result<usize, String> {
        let mut steps = self.steps.write().await;
        let to_delete: Vec<Uuid> = steps
            .values()
            .filter(|s| s.mission_id == mission_id && s.status == StepStatus::Pending)
            .map(|s| s.id)
            .collect();
        for id in &to_delete {
            steps.remove(id);
        }
        Ok(to_delete.len())
    }

    async fn append_log(&self, log: &MissionLog) -> Result<(), String> {
        self.logs.write().await.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, mission_id: Uuid) -> Result<Vec<MissionLog>, String> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.mission_id == mission_id)
            .cloned()
            .collect())
    }

    async fn create_job(&self, job: &Job) -> Result<(), String> {
        let mut row = job.clone();
        row.updated_at = Utc::now();
        self.jobs.write().await.insert(row.id, row);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, String> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_job_for_mission(&self, mission_id: Uuid) -> Result<Option<Job>, String> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .find(|j| j.mission_id == Some(mission_id))
            .cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), String> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(format!("Job {} not found", job.id));
        }
        let mut row = job.clone();
        row.updated_at = Utc::now();
        jobs.insert(row.id, row);
        Ok(())
    }

    async fn touch_job_heartbeat(&self, id: Uuid) -> Result<(), String> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| format!("Job {id} not found"))?;
        let now = Utc::now();
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn stale_running_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, String> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == crate::model::JobStatus::Running)
            .filter(|j| j.heartbeat_at.map(|hb| hb < cutoff).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_setting(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<serde_json::Value>, String> {
        match self.settings.read().await.get(&(project_id, key.to_string())) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| format!("Malformed settings value for `{key}`: {e}")),
            None => Ok(None),
        }
    }

    async fn set_setting(
        &self,
        project_id: Uuid,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), String> {
        self.settings
            .write()
            .await
            .insert((project_id, key.to_string()), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobPayload, MissionStatus};

    #[tokio::test]
    async fn writes_bump_updated_at() {
        let store = InMemoryStore::new();
        let mission = Mission::new(Uuid::new_v4(), "test goal", None);
        store.create_mission(&mission).await.expect("create mission");

        let before = store
            .get_mission(mission.id)
            .await
            .expect("get mission")
            .expect("mission exists");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut patched = before.clone();
        patched.status = MissionStatus::Planning;
        store.update_mission(&patched).await.expect("update mission");

        let after = store
            .get_mission(mission.id)
            .await
            .expect("get mission")
            .expect("mission exists");
        assert_eq!(after.status, MissionStatus::Planning);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn delete_pending_preserves_finished_steps() {
        let store = InMemoryStore::new();
        let mission_id = Uuid::new_v4();

        let mut done = MissionStep::new(mission_id, 0, "done step");
        done.status = StepStatus::Done;
        let mut failed = MissionStep::new(mission_id, 1, "failed step");
        failed.status = StepStatus::Failed;
        let pending = MissionStep::new(mission_id, 2, "pending step");

        for step in [&done, &failed, &pending] {
            store.insert_step(step).await.expect("insert step");
        }

        let removed = store
            .delete_pending_steps(mission_id)
            .await
            .expect("delete pending");
        assert_eq!(removed, 1);

        let remaining = store.list_steps(mission_id).await.expect("list steps");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|s| s.status != StepStatus::Pending));
        // Order is preserved.
        assert_eq!(remaining[0].order_index, 0);
        assert_eq!(remaining[1].order_index, 1);
    }

    #[tokio::test]
    async fn settings_round_trip_through_json_strings() {
        let store = InMemoryStore::new();
        let project = Uuid::new_v4();
        store
            .set_setting(
                project,
                "execution",
                serde_json::json!({ "persistSandbox": true }),
            )
            .await
            .expect("set setting");

        let settings = super::super::load_project_settings(&store, project)
            .await
            .expect("load settings");
        assert_eq!(settings.execution.persist_sandbox, Some(true));
        // Unset keys come back as defaults.
        assert!(settings.ai.provider.is_none());
    }

    #[tokio::test]
    async fn stale_job_scan_flags_missing_and_old_heartbeats() {
        let store = InMemoryStore::new();
        let mut job = Job::new(Uuid::new_v4(), JobPayload::default());
        job.status = crate::model::JobStatus::Running;
        store.create_job(&job).await.expect("create job");

        // No heartbeat yet: counts as stale.
        let stale = store
            .stale_running_jobs(Utc::now())
            .await
            .expect("scan stale jobs");
        assert_eq!(stale.len(), 1);

        store.touch_job_heartbeat(job.id).await.expect("heartbeat");
        let stale = store
            .stale_running_jobs(Utc::now() - chrono::Duration::seconds(30))
            .await
            .expect("scan stale jobs");
        assert!(stale.is_empty());
    }
}
