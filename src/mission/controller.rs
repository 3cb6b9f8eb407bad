//! The mission state machine and controller loop.
//!
//! One controller task drives one job/mission pair from `QUEUED` through
//! planning, approval, execution, validation and review. Human control
//! actions land on the mission row out-of-band (see [`super::control`]);
//! the loop observes them on its next poll. Whatever happens, the sandbox is
//! torn down before the task exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::llm::artifacts::{self, CoderContext};
use crate::llm::{resolve_role, LlmClient, Role};
use crate::model::{
    JobResult, JobStatus, LogKind, Mission, MissionLog, MissionStatus, MissionStep, StepStatus,
};
use crate::sandbox::{Sandbox, SandboxHost};
use crate::settings::ProjectSettings;
use crate::store::{load_project_settings, Store};

use super::context::collect_repo_context;
use super::control::{log_user_input, sync_job_for_mission};
use super::executor::{StepExecutor, EXIT_CODE_BLOCKED};

/// Poll interval of the outer loop while in a waiting state.
const LOOP_POLL: Duration = Duration::from_secs(2);

/// Poll interval while blocking for an executable status between steps.
const STATUS_POLL: Duration = Duration::from_secs(1);

/// Heartbeat cadence on the job row.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

pub struct MissionController {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    host: Arc<dyn SandboxHost>,
}

impl MissionController {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, host: Arc<dyn SandboxHost>) -> Self {
        Self { store, llm, host }
    }

    /// Drive the job's mission to a terminal state. Always tears the sandbox
    /// down on the way out, success or not.
    pub async fn run_job(&self, job_id: Uuid) -> anyhow::Result<()> {
        let mut job = self
            .store
            .get_job(job_id)
            .await
            .map_err(|e| anyhow!(e))?
            .with_context(|| format!("job {job_id} not found"))?;
        let mission_id = job
            .mission_id
            .with_context(|| format!("job {job_id} has no mission"))?;

        // Claim the job.
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        self.store.update_job(&job).await.map_err(|e| anyhow!(e))?;

        let heartbeat = {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    ticker.tick().await;
                    if let Err(e) = store.touch_job_heartbeat(job_id).await {
                        tracing::warn!("Heartbeat for job {job_id} failed: {e}");
                    }
                }
            })
        };

        let result = self.provision_and_drive(&job, mission_id).await;
        heartbeat.abort();

        if let Err(e) = &result {
            self.fail_mission(mission_id, &e.to_string()).await;
        }
        self.finalize_job(job_id, mission_id).await;
        result
    }

    /// Spawn the sandbox, run the controller loop, tear down in all cases.
    async fn provision_and_drive(
        &self,
        job: &crate::model::Job,
        mission_id: Uuid,
    ) -> anyhow::Result<()> {
        let mission = self.reload(mission_id).await?;
        let settings = load_project_settings(self.store.as_ref(), mission.project_id)
            .await
            .map_err(|e| anyhow!(e))?;

        // SandboxFatal: pull/create/start errors bubble up and fail the mission.
        let sandbox = self
            .host
            .spawn(mission_id, mission.project_id, job.id, &settings.execution)
            .await
            .context("sandbox provisioning failed")?;

        // Single log sink per instance; chunks land in the tracing stream.
        let (sink, mut chunks) = tokio::sync::mpsc::unbounded_channel::<String>();
        sandbox.stream_logs(sink).await;
        let sink_task = tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                tracing::debug!(target: "openjules::sandbox", mission = %mission_id, "{}", chunk.trim_end());
            }
        });

        let driven = self.drive(&sandbox, job, mission_id, &settings).await;

        if let Err(e) = self.host.teardown(sandbox.instance_id()).await {
            tracing::warn!("Teardown of sandbox for mission {mission_id} failed: {e}");
        }
        sink_task.abort();
        driven
    }

    async fn drive(
        &self,
        sandbox: &Arc<dyn Sandbox>,
        job: &crate::model::Job,
        mission_id: Uuid,
        settings: &ProjectSettings,
    ) -> anyhow::Result<()> {
        sandbox.init().await.context("sandbox init failed")?;

        let mission = self.reload(mission_id).await?;
        let repo = mission.repo_url.clone().or_else(|| job.payload.repo.clone());
        if let Some(url) = repo {
            sandbox
                .clone_repo(&url, job.payload.branch.as_deref())
                .await
                .with_context(|| format!("cloning {url} failed"))?;
        }

        loop {
            let mut mission = self.reload(mission_id).await?;
            match mission.status {
                MissionStatus::Queued => {
                    mission.started_at = Some(Utc::now());
                    mission.status = MissionStatus::Planning;
                    self.update_mission(&mission).await?;
                }
                MissionStatus::Planning => {
                    self.plan(&mut mission, sandbox, settings).await?;
                }
                MissionStatus::Executing => {
                    self.execute_steps(&mut mission, sandbox, settings).await?;
                }
                MissionStatus::Validating => {
                    self.validate(&mut mission, job.id, sandbox).await?;
                }
                MissionStatus::WaitingPlanApproval
                | MissionStatus::Paused
                | MissionStatus::WaitingInput
                | MissionStatus::WaitingReview => {
                    tokio::time::sleep(LOOP_POLL).await;
                }
                MissionStatus::Completed | MissionStatus::Failed => break,
            }
        }
        Ok(())
    }

    /// One plan wave: consume pending user input, ask the planner, replace
    /// all `PENDING` steps, move to approval.
    async fn plan(
        &self,
        mission: &mut Mission,
        sandbox: &Arc<dyn Sandbox>,
        settings: &ProjectSettings,
    ) -> anyhow::Result<()> {
        let user_input = mission.latest_user_input.take();
        if let Some(input) = &user_input {
            log_user_input(self.store.as_ref(), mission.id, input)
                .await
                .map_err(|e| anyhow!(e))?;
        }

        let ctx = collect_repo_context(sandbox.repo_dir());
        let binding = resolve_role(&settings.ai, Role::Planner);
        // A planner failure aborts the mission (handled by the outer catch).
        let plan = artifacts::generate_plan(
            self.llm.as_ref(),
            &binding,
            &mission.goal,
            &ctx,
            settings.prompts.planner.content.as_deref(),
            user_input.as_deref(),
        )
        .await
        .context("planner failed")?;

        // Replace the pending wave; finished history stays untouched and new
        // steps continue the order_index sequence.
        let existing = self.list_steps(mission.id).await?;
        let next_index = existing.iter().map(|s| s.order_index + 1).max().unwrap_or(0);
        self.store
            .delete_pending_steps(mission.id)
            .await
            .map_err(|e| anyhow!(e))?;
        for (offset, draft) in plan.steps.iter().enumerate() {
            let mut step =
                MissionStep::new(mission.id, next_index + offset as i32, &draft.description);
            step.timeout_ms = draft.timeout_ms;
            step.retryable = draft.retryable;
            step.max_retries = if draft.retryable { 2 } else { 0 };
            step.background = draft.background;
            step.ready_pattern = draft.ready_pattern.clone().filter(|p| !p.trim().is_empty());
            if step.background && step.ready_pattern.is_none() {
                // background ⇒ ready_pattern invariant
                step.ready_pattern = Some(crate::guard::DEFAULT_READY_PATTERN.to_string());
            }
            self.store.insert_step(&step).await.map_err(|e| anyhow!(e))?;
        }

        mission.plan_reasoning = Some(plan.reasoning.clone());
        mission.ai_provider = Some(plan.provider.clone());
        mission.ai_model = Some(plan.model.clone());
        mission.token_usage.record(Role::Planner.as_str(), plan.usage);
        mission.status = MissionStatus::WaitingPlanApproval;
        self.update_mission(mission).await?;

        self.append_log(MissionLog::new(
            mission.id,
            None,
            LogKind::Thought,
            format!("Planned {} steps: {}", plan.steps.len(), plan.reasoning),
        ))
        .await?;
        Ok(())
    }

    /// Execute `PENDING` steps in order until the wave is drained or the
    /// mission leaves `EXECUTING`.
    async fn execute_steps(
        &self,
        mission: &mut Mission,
        sandbox: &Arc<dyn Sandbox>,
        settings: &ProjectSettings,
    ) -> anyhow::Result<()> {
        let coder_binding = resolve_role(&settings.ai, Role::Coder);
        let guard_binding = resolve_role(&settings.ai, Role::Guard);
        let troubleshooter_binding = resolve_role(&settings.ai, Role::Troubleshooter);
        let mut guard_feedback: Option<String> = None;

        loop {
            let steps = self.list_steps(mission.id).await?;
            let Some(position) = steps.iter().position(|s| s.status == StepStatus::Pending) else {
                // Wave drained; move to validation if nothing intervened.
                let mut current = self.reload(mission.id).await?;
                if current.status == MissionStatus::Executing {
                    current.status = MissionStatus::Validating;
                    self.update_mission(&current).await?;
                }
                return Ok(());
            };
            let mut step = steps[position].clone();

            // Block until the mission is in an executable-adjacent state;
            // yield to the outer loop for anything but EXECUTING.
            let status = self.wait_for_mission_status(mission.id).await?;
            if status != MissionStatus::Executing {
                return Ok(());
            }

            // Out-of-band user input between steps becomes a log line and a
            // hint for the coder.
            let mut current = self.reload(mission.id).await?;
            let user_hint = current.latest_user_input.take();
            if let Some(input) = &user_hint {
                log_user_input(self.store.as_ref(), mission.id, input)
                    .await
                    .map_err(|e| anyhow!(e))?;
                self.update_mission(&current).await?;
            }
            *mission = current;

            // Fill in the command late, with full context.
            if step.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                self.generate_command(
                    mission,
                    sandbox,
                    &mut step,
                    &steps,
                    position,
                    guard_feedback.take(),
                    user_hint,
                    &coder_binding,
                )
                .await?;
            }

            let executor = StepExecutor {
                store: self.store.as_ref(),
                sandbox: sandbox.as_ref(),
                guard_settings: &settings.execution.command_guard,
                llm: self.llm.as_ref(),
                guard_binding: &guard_binding,
            };
            let outcome = executor.execute(&mut step).await.map_err(|e| anyhow!(e))?;

            if outcome.exit_code == EXIT_CODE_BLOCKED {
                // GuardBlock: the mission continues with the next step.
                guard_feedback = Some(format!(
                    "`{}` was blocked: {}",
                    step.command.as_deref().unwrap_or(""),
                    outcome.stderr
                ));
                continue;
            }

            if !outcome.success() && step.status == StepStatus::Failed {
                self.analyze_and_log_failure(mission, &step, &outcome, &troubleshooter_binding)
                    .await;

                let mut current = self.reload(mission.id).await?;
                current.status = MissionStatus::Failed;
                current.fail_reason = Some(format!("Step {} failed.", position + 1));
                current.mark_finished();
                self.update_mission(&current).await?;
                *mission = current;
                return Ok(());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_command(
        &self,
        mission: &mut Mission,
        sandbox: &Arc<dyn Sandbox>,
        step: &mut MissionStep,
        steps: &[MissionStep],
        position: usize,
        guard_feedback: Option<String>,
        user_hint: Option<String>,
        coder_binding: &crate::llm::RoleBinding,
    ) -> anyhow::Result<()> {
        let repo_ctx = collect_repo_context(sandbox.repo_dir());
        let previous_outputs = steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Done | StepStatus::Failed))
            .map(|s| {
                format!(
                    "step {} ({}): exit={} {}",
                    s.order_index,
                    s.description,
                    s.exit_code.unwrap_or(-1),
                    crate::model::truncate_with_ellipsis(&s.stdout_tail, 500),
                )
            })
            .collect();
        let ctx = CoderContext {
            goal: mission.goal.clone(),
            step_index: position,
            step_total: steps.len(),
            step_description: step.description.clone(),
            plan_overview: steps
                .iter()
                .map(|s| (s.description.clone(), s.status.as_str().to_string()))
                .collect(),
            previous_outputs,
            file_tree: repo_ctx.file_tree,
            package_json: repo_ctx.package_json,
            guard_feedback,
            user_hint,
            troubleshooter_analysis: None,
        };

        match artifacts::generate_step_command(self.llm.as_ref(), coder_binding, &ctx).await {
            Ok(artifact) => {
                step.command = Some(artifact.command.clone());
                if artifact.background {
                    step.background = true;
                    step.ready_pattern = artifact
                        .ready_pattern
                        .clone()
                        .filter(|p| !p.trim().is_empty())
                        .or_else(|| Some(crate::guard::DEFAULT_READY_PATTERN.to_string()));
                }
                mission
                    .token_usage
                    .record(Role::Coder.as_str(), artifact.usage);
                self.update_mission(mission).await?;
            }
            Err(e) => {
                // Coder failure degrades to a harmless placeholder command.
                tracing::warn!("Coder failed for step {}: {e}", step.order_index);
                self.append_log(MissionLog::new(
                    mission.id,
                    Some(step.id),
                    LogKind::Error,
                    format!("Coder failed: {e}"),
                ))
                .await?;
                step.command = Some(format!(
                    "echo \"Coder could not generate command for: {}\"",
                    step.description.replace('"', "'")
                ));
            }
        }
        self.store.update_step(step).await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    /// Ask the troubleshooter for a recovery strategy and log it. Advisory
    /// only: failures here never mask the step failure itself.
    async fn analyze_and_log_failure(
        &self,
        mission: &mut Mission,
        step: &MissionStep,
        outcome: &crate::sandbox::ExecOutcome,
        binding: &crate::llm::RoleBinding,
    ) {
        let combined = format!("{}\n{}", outcome.stderr, outcome.stdout);
        match artifacts::analyze_failure(
            self.llm.as_ref(),
            binding,
            &mission.goal,
            &step.description,
            step.command.as_deref().unwrap_or(""),
            outcome.exit_code,
            &combined,
        )
        .await
        {
            Ok((analysis, usage)) => {
                mission
                    .token_usage
                    .record(Role::Troubleshooter.as_str(), usage);
                if let Err(e) = self.update_mission(mission).await {
                    tracing::warn!("Persisting troubleshooter usage failed: {e}");
                }
                if let Err(e) = self
                    .append_log(MissionLog::new(
                        mission.id,
                        Some(step.id),
                        LogKind::Thought,
                        format!("Troubleshooter: {analysis}"),
                    ))
                    .await
                {
                    tracing::warn!("Logging troubleshooter analysis failed: {e}");
                }
            }
            Err(e) => tracing::warn!("Troubleshooter failed: {e}"),
        }
    }

    /// Collect the patch, attach it to the job and hand the mission to review.
    async fn validate(
        &self,
        mission: &mut Mission,
        job_id: Uuid,
        sandbox: &Arc<dyn Sandbox>,
    ) -> anyhow::Result<()> {
        let patch = sandbox.create_patch().await.context("patch collection failed")?;

        let steps = self.list_steps(mission.id).await?;
        let done = steps.iter().filter(|s| s.status == StepStatus::Done).count();
        let mut job = self
            .store
            .get_job(job_id)
            .await
            .map_err(|e| anyhow!(e))?
            .with_context(|| format!("job {job_id} disappeared"))?;
        job.result = Some(JobResult {
            patch: Some(patch),
            summary: Some(format!("{done}/{} steps succeeded", steps.len())),
        });
        self.store.update_job(&job).await.map_err(|e| anyhow!(e))?;

        mission.status = MissionStatus::WaitingReview;
        mission.mark_finished();
        self.update_mission(mission).await?;

        self.append_log(MissionLog::new(
            mission.id,
            None,
            LogKind::Metric,
            json!({
                "durationMs": mission.total_duration_ms,
                "tokens": mission.token_usage.total,
                "steps": steps.len(),
            })
            .to_string(),
        ))
        .await?;
        Ok(())
    }

    /// Poll until the mission is in a state the step loop can act on.
    async fn wait_for_mission_status(&self, mission_id: Uuid) -> anyhow::Result<MissionStatus> {
        loop {
            let mission = self.reload(mission_id).await?;
            match mission.status {
                MissionStatus::Executing
                | MissionStatus::Planning
                | MissionStatus::Paused
                | MissionStatus::WaitingInput => return Ok(mission.status),
                MissionStatus::Completed | MissionStatus::Failed => return Ok(mission.status),
                _ => tokio::time::sleep(STATUS_POLL).await,
            }
        }
    }

    /// Outer catch: transition to FAILED with a single error log. Never
    /// overwrites an already-terminal state.
    async fn fail_mission(&self, mission_id: Uuid, reason: &str) {
        let mission = match self.store.get_mission(mission_id).await {
            Ok(Some(m)) => m,
            _ => return,
        };
        if mission.status.is_terminal() {
            return;
        }
        let mut mission = mission;
        mission.status = MissionStatus::Failed;
        mission.fail_reason = Some(reason.to_string());
        mission.mark_finished();
        if let Err(e) = self.update_mission(&mission).await {
            tracing::error!("Failing mission {mission_id} could not be persisted: {e}");
            return;
        }
        let _ = self
            .append_log(MissionLog::new(
                mission_id,
                None,
                LogKind::Error,
                format!("Mission failed: {reason}"),
            ))
            .await;
    }

    /// Bring the job row in line with the final mission state.
    async fn finalize_job(&self, job_id: Uuid, mission_id: Uuid) {
        let Ok(Some(mission)) = self.store.get_mission(mission_id).await else {
            return;
        };
        if let Err(e) = sync_job_for_mission(self.store.as_ref(), &mission).await {
            tracing::warn!("Final job sync for {job_id} failed: {e}");
        }
    }

    async fn reload(&self, mission_id: Uuid) -> anyhow::Result<Mission> {
        self.store
            .get_mission(mission_id)
            .await
            .map_err(|e| anyhow!(e))?
            .with_context(|| format!("mission {mission_id} disappeared"))
    }

    async fn update_mission(&self, mission: &Mission) -> anyhow::Result<()> {
        self.store.update_mission(mission).await.map_err(|e| anyhow!(e))?;
        sync_job_for_mission(self.store.as_ref(), mission)
            .await
            .map_err(|e| anyhow!(e))
    }

    async fn list_steps(&self, mission_id: Uuid) -> anyhow::Result<Vec<MissionStep>> {
        self.store.list_steps(mission_id).await.map_err(|e| anyhow!(e))
    }

    async fn append_log(&self, log: MissionLog) -> anyhow::Result<()> {
        self.store.append_log(&log).await.map_err(|e| anyhow!(e))
    }
}
