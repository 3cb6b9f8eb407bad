//! Per-step execution: guard, promote, run, retry, record.

use chrono::Utc;
use serde_json::json;

use crate::guard::{self, Verdict};
use crate::llm::{LlmClient, RoleBinding};
use crate::model::{truncate_with_ellipsis, LogKind, MissionLog, MissionStep, StepStatus};
use crate::sandbox::{ExecOutcome, Sandbox};
use crate::settings::CommandGuardSettings;
use crate::store::Store;

/// Kept characters of stdout on the step row.
pub const STDOUT_TAIL_MAX: usize = 5_000;

/// Kept characters of stderr on the step row.
pub const STDERR_TAIL_MAX: usize = 3_000;

/// Exit code recorded for guard-blocked steps.
pub const EXIT_CODE_BLOCKED: i64 = -2;

const RETRY_BASE_DELAY_MS: u64 = 2_000;

pub struct StepExecutor<'a> {
    pub store: &'a dyn Store,
    pub sandbox: &'a dyn Sandbox,
    pub guard_settings: &'a CommandGuardSettings,
    pub llm: &'a dyn LlmClient,
    pub guard_binding: &'a RoleBinding,
}

impl StepExecutor<'_> {
    /// Run one step to completion and persist every field the data model
    /// tracks. Returns the final execution outcome; the step row carries the
    /// authoritative status.
    pub async fn execute(&self, step: &mut MissionStep) -> Result<ExecOutcome, String> {
        let command = step.command.clone().unwrap_or_default();

        // 1. Guard.
        let verdict = guard::evaluate_with_review(
            &command,
            step.background,
            self.guard_settings,
            Some((self.llm, self.guard_binding)),
        )
        .await;
        if !verdict.allowed {
            return self.block_step(step, &verdict).await;
        }

        // 2. Auto-promotion to background.
        if verdict.promoted_to_background {
            step.background = true;
            if step.ready_pattern.is_none() {
                step.ready_pattern = verdict.suggested_ready_pattern.clone();
            }
        }
        let command = verdict.sanitised.clone();
        step.command = Some(command.clone());

        // 3. Mark running and announce the command.
        step.status = StepStatus::InProgress;
        step.started_at = Some(Utc::now());
        self.store.update_step(step).await?;
        self.store
            .append_log(&MissionLog::new(
                step.mission_id,
                Some(step.id),
                LogKind::Command,
                json!({
                    "command": command,
                    "timeoutMs": step.timeout_ms,
                    "retryable": step.retryable,
                    "background": step.background,
                })
                .to_string(),
            ))
            .await?;

        // 4/5. Execute, with exponential backoff when the step is retryable.
        let max_retries = if step.retryable { step.max_retries } else { 0 };
        let mut retries_used: u32 = 0;
        let mut outcome = self.run_once(step, &command).await;
        while !outcome.success() && retries_used < max_retries {
            let delay = RETRY_BASE_DELAY_MS * 2u64.pow(retries_used);
            tracing::debug!(
                "Step {} attempt {} failed (exit {}), retrying in {delay}ms",
                step.order_index,
                retries_used + 1,
                outcome.exit_code
            );
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            retries_used += 1;
            outcome = self.run_once(step, &command).await;
        }

        // 7. Persist the result.
        let finished = Utc::now();
        step.status = if outcome.success() { StepStatus::Done } else { StepStatus::Failed };
        step.exit_code = Some(outcome.exit_code);
        step.retry_count = retries_used;
        step.finished_at = Some(finished);
        step.duration_ms = step
            .started_at
            .map(|started| (finished - started).num_milliseconds());
        step.stdout_tail = truncate_with_ellipsis(&outcome.stdout, STDOUT_TAIL_MAX);
        step.stderr_tail = truncate_with_ellipsis(&outcome.stderr, STDERR_TAIL_MAX);
        step.result_summary = Some(format!(
            "exit={} duration={}ms",
            outcome.exit_code,
            step.duration_ms.unwrap_or(0)
        ));
        self.store.update_step(step).await?;

        // 8. Tool output log with metrics.
        self.store
            .append_log(&MissionLog::new(
                step.mission_id,
                Some(step.id),
                LogKind::ToolOutput,
                json!({
                    "exitCode": outcome.exit_code,
                    "retries": retries_used,
                    "durationMs": step.duration_ms,
                    "stdout": step.stdout_tail,
                    "stderr": step.stderr_tail,
                })
                .to_string(),
            ))
            .await?;

        Ok(outcome)
    }

    /// 6. Executor exceptions become a synthetic failed outcome instead of
    /// unwinding past the step.
    async fn run_once(&self, step: &MissionStep, command: &str) -> ExecOutcome {
        let result = match (&step.ready_pattern, step.background) {
            (Some(pattern), true) => {
                self.sandbox
                    .background_command(command, pattern, Some(step.timeout_ms))
                    .await
            }
            _ => self.sandbox.command(command, None, Some(step.timeout_ms)).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => ExecOutcome {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
            },
        }
    }

    async fn block_step(
        &self,
        step: &mut MissionStep,
        verdict: &Verdict,
    ) -> Result<ExecOutcome, String> {
        let rule = verdict.rule.as_deref().unwrap_or("unknown");
        let reason = verdict.reason.as_deref().unwrap_or("blocked");
        step.status = StepStatus::Blocked;
        step.exit_code = Some(EXIT_CODE_BLOCKED);
        step.finished_at = Some(Utc::now());
        step.result_summary = Some(format!("blocked by {rule}"));
        step.stderr_tail = truncate_with_ellipsis(&format!("{rule}: {reason}"), STDERR_TAIL_MAX);
        self.store.update_step(step).await?;
        self.store
            .append_log(&MissionLog::new(
                step.mission_id,
                Some(step.id),
                LogKind::Error,
                format!("🛡️ Command blocked ({rule}): {reason}"),
            ))
            .await?;
        tracing::warn!("Blocked step {} command by rule {rule}", step.order_index);
        Ok(ExecOutcome {
            stdout: String::new(),
            stderr: format!("{rule}: {reason}"),
            exit_code: EXIT_CODE_BLOCKED,
        })
    }
}
