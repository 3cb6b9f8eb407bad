//! Core data model: missions, steps, logs, jobs.
//!
//! Status enums serialise to the wire-exact strings the CRUD layer speaks;
//! JSON-typed fields (`payload`, `result`, `token_usage`, log content) are
//! opaque bytes to the store and typed records here.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Queued,
    Planning,
    WaitingPlanApproval,
    Executing,
    Paused,
    WaitingInput,
    Validating,
    WaitingReview,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Planning => "PLANNING",
            Self::WaitingPlanApproval => "WAITING_PLAN_APPROVAL",
            Self::Executing => "EXECUTING",
            Self::Paused => "PAUSED",
            Self::WaitingInput => "WAITING_INPUT",
            Self::Validating => "VALIDATING",
            Self::WaitingReview => "WAITING_REVIEW",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Terminal states: the controller loop exits on these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States in which the controller idles waiting for a human.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Self::WaitingPlanApproval | Self::Paused | Self::WaitingInput | Self::WaitingReview
        )
    }
}

impl FromStr for MissionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "QUEUED" => Ok(Self::Queued),
            "PLANNING" => Ok(Self::Planning),
            "WAITING_PLAN_APPROVAL" => Ok(Self::WaitingPlanApproval),
            "EXECUTING" => Ok(Self::Executing),
            "PAUSED" => Ok(Self::Paused),
            "WAITING_INPUT" => Ok(Self::WaitingInput),
            "VALIDATING" => Ok(Self::Validating),
            "WAITING_REVIEW" => Ok(Self::WaitingReview),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("unknown mission status: {value}")),
        }
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Status of the external trigger record backing a mission run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    WaitingReview,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingReview => "waiting_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Projection of a mission status onto its job, per the gating table.
/// Returns `None` for mission states with no job-side reflection.
pub fn job_status_for_mission(status: MissionStatus) -> Option<JobStatus> {
    match status {
        MissionStatus::Completed => Some(JobStatus::Completed),
        MissionStatus::Failed => Some(JobStatus::Failed),
        MissionStatus::WaitingReview
        | MissionStatus::WaitingPlanApproval
        | MissionStatus::Paused
        | MissionStatus::WaitingInput => Some(JobStatus::WaitingReview),
        _ => None,
    }
}

/// Prompt/completion token counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// Per-role token accounting plus the running total.
///
/// Invariant: `total` equals the sum over all role buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionTokenUsage {
    #[serde(default)]
    pub roles: BTreeMap<String, TokenUsage>,
    #[serde(default)]
    pub total: TokenUsage,
}

impl MissionTokenUsage {
    pub fn record(&mut self, role: &str, usage: TokenUsage) {
        self.roles.entry(role.to_string()).or_default().add(usage);
        self.total.add(usage);
    }
}

/// A user goal under execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub project_id: Uuid,
    pub goal: String,
    pub status: MissionStatus,
    pub repo_url: Option<String>,
    /// Out-of-band chat input from the user, consumed by the controller.
    pub latest_user_input: Option<String>,
    pub latest_agent_question: Option<String>,
    pub plan_reasoning: Option<String>,
    pub fail_reason: Option<String>,
    pub result_summary: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<i64>,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub token_usage: MissionTokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    /// Stamp `finished_at`/`total_duration_ms` when entering a state that
    /// requires them (`COMPLETED`, `FAILED`, `WAITING_REVIEW`).
    pub fn mark_finished(&mut self) {
        let now = Utc::now();
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        if self.total_duration_ms.is_none() {
            self.total_duration_ms = self
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0));
        }
    }

    pub fn new(project_id: Uuid, goal: impl Into<String>, repo_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            goal: goal.into(),
            status: MissionStatus::Queued,
            repo_url,
            latest_user_input: None,
            latest_agent_question: None,
            plan_reasoning: None,
            fail_reason: None,
            result_summary: None,
            started_at: None,
            finished_at: None,
            total_duration_ms: None,
            ai_provider: None,
            ai_model: None,
            token_usage: MissionTokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Default per-step execution timeout.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

/// One entry in the current plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStep {
    pub id: Uuid,
    pub mission_id: Uuid,
    /// Monotonic within the mission, across plan waves.
    pub order_index: i32,
    pub description: String,
    /// Filled by the coder just before execution.
    pub command: Option<String>,
    pub status: StepStatus,
    pub timeout_ms: u64,
    pub retryable: bool,
    pub max_retries: u32,
    pub background: bool,
    pub ready_pattern: Option<String>,
    pub exit_code: Option<i64>,
    pub retry_count: u32,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MissionStep {
    pub fn new(mission_id: Uuid, order_index: i32, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mission_id,
            order_index,
            description: description.into(),
            command: None,
            status: StepStatus::Pending,
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            retryable: false,
            max_retries: 0,
            background: false,
            ready_pattern: None,
            exit_code: None,
            retry_count: 0,
            duration_ms: None,
            started_at: None,
            finished_at: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of an append-only mission log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Thought,
    Command,
    ToolOutput,
    Error,
    Metric,
    AgentQuestion,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::Command => "command",
            Self::ToolOutput => "tool_output",
            Self::Error => "error",
            Self::Metric => "metric",
            Self::AgentQuestion => "agent_question",
        }
    }
}

/// Append-only event stream entry. `content` is either plain text or a
/// JSON-encoded object, opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionLog {
    pub id: Uuid,
    pub mission_id: Uuid,
    pub step_id: Option<Uuid>,
    pub kind: LogKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MissionLog {
    pub fn new(mission_id: Uuid, step_id: Option<Uuid>, kind: LogKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            step_id,
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Source repository reference carried by a job trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Outcome attached to a finished job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// The external trigger record that bootstraps a mission run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    pub mission_id: Option<Uuid>,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(project_id: Uuid, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            mission_id: None,
            status: JobStatus::Pending,
            payload,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A human gating action patched onto a mission by the CRUD layer.
///
/// Action strings are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPatch {
    Plan(PlanAction),
    Review(ReviewAction),
    Control { action: ControlAction, message: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Input,
}

impl PlanAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl ReviewAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl ControlAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "input" => Some(Self::Input),
            _ => None,
        }
    }
}

/// Truncate `text` to at most `max` characters, marking the cut with a
/// trailing ellipsis when anything was dropped.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
