//! Per-mission isolated workspaces.
//!
//! A sandbox is a host directory bind-mounted into a dedicated container.
//! The Docker-backed implementation lives in [`docker`]; the controller and
//! the test-suite talk to the [`Sandbox`]/[`SandboxHost`] traits so execution
//! can be faked without a daemon.

pub mod docker;

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::settings::ExecutionSettings;

pub use docker::DockerDriver;

/// Default foreground command timeout.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 300_000;

/// Default readiness timeout for background commands.
pub const DEFAULT_BACKGROUND_TIMEOUT_MS: u64 = 120_000;

/// Sink for raw output chunks; one per instance, attached by the controller.
pub type LogSink = tokio::sync::mpsc::UnboundedSender<String>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Docker connection failed: {0}")]
    Connect(String),

    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("Container {operation} failed: {message}")]
    Container { operation: &'static str, message: String },

    #[error("Sandbox io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sandbox init failed: {0}")]
    Init(String),

    #[error("Invalid readiness pattern `{pattern}`: {message}")]
    ReadyPattern { pattern: String, message: String },

    #[error("Background process died unexpectedly: {tail}")]
    BackgroundDied { tail: String },

    #[error("Timeout: no output matched `{pattern}` within {timeout_ms}ms")]
    BackgroundReadyTimeout { pattern: String, timeout_ms: u64 },

    #[error("Path `{0}` escapes the sandbox repository")]
    PathEscape(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Unknown sandbox instance {0}")]
    UnknownInstance(Uuid),
}

/// Result of one foreground or background execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the exit code could not be determined.
    pub exit_code: i64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One provisioned workspace: a container plus its host directory.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn instance_id(&self) -> Uuid;

    /// Host path of the repository directory inside the workspace.
    fn repo_dir(&self) -> &Path;

    /// Detect the shell, best-effort install base tooling, `git init` the
    /// repository. A failing `git init` is fatal for the mission.
    async fn init(&self) -> Result<(), SandboxError>;

    /// Seed the repository from a remote before planning.
    async fn clone_repo(&self, url: &str, branch: Option<&str>) -> Result<(), SandboxError>;

    /// Run a foreground command through the detected shell. Exec-level
    /// failures are reported as `exit_code = -1`, not as `Err`.
    async fn command(
        &self,
        cmd: &str,
        workdir: Option<&Path>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError>;

    /// Launch a detached long-running command and resolve once its combined
    /// output matches `ready_pattern` (case-insensitive). The process keeps
    /// running after resolution.
    async fn background_command(
        &self,
        cmd: &str,
        ready_pattern: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError>;

    /// Register the single output sink; command streams forward every chunk.
    async fn stream_logs(&self, sink: LogSink);

    async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<(), SandboxError>;
    async fn read_file(&self, relative: &str) -> Result<Vec<u8>, SandboxError>;

    /// `git diff --no-color -- .` over the workspace, with intent-to-add
    /// staging so new files appear in the patch.
    async fn create_patch(&self) -> Result<String, SandboxError>;
}

/// Provisions and tears down sandboxes.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    async fn spawn(
        &self,
        mission_id: Uuid,
        project_id: Uuid,
        job_id: Uuid,
        settings: &ExecutionSettings,
    ) -> Result<std::sync::Arc<dyn Sandbox>, SandboxError>;

    /// Stop and remove the container, delete the workspace unless persistence
    /// is configured, and always forget the bookkeeping.
    async fn teardown(&self, instance_id: Uuid) -> Result<(), SandboxError>;
}

/// Join `relative` onto `root`, rejecting absolute paths and any `..`
/// traversal that would escape the repository.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, SandboxError> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(SandboxError::PathEscape(relative.to_string()));
    }
    let mut depth: i32 = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(SandboxError::PathEscape(relative.to_string()));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathEscape(relative.to_string()));
            }
        }
    }
    Ok(root.join(rel))
}
