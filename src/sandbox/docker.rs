//! Docker-backed sandbox driver.
//!
//! One container per mission: the host workspace is bind-mounted at
//! `/workspace`, a keep-alive command holds the container open, and every
//! command runs as an exec with demultiplexed output streaming. Background
//! commands follow the nohup + log file + pid file readiness protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use regex::RegexBuilder;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_DOCKER_IMAGE};
use crate::settings::ExecutionSettings;

use super::{
    safe_join, ExecOutcome, LogSink, Sandbox, SandboxError, SandboxHost,
    DEFAULT_BACKGROUND_TIMEOUT_MS, DEFAULT_COMMAND_TIMEOUT_MS,
};

const CONTAINER_WORKSPACE: &str = "/workspace";
const DOCKER_API_TIMEOUT_SECS: u64 = 120;
const PID_PROBE_INTERVAL_MS: u64 = 2_000;
const DIED_TAIL_CHARS: usize = 2_000;

struct Bookkeeping {
    container_id: String,
    workspace: PathBuf,
    persist: bool,
}

/// Provisions one container per mission against the local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
    config: Config,
    instances: Mutex<HashMap<Uuid, Bookkeeping>>,
}

impl DockerDriver {
    pub fn connect(config: Config) -> Result<Self, SandboxError> {
        let socket = config.docker_socket.to_string_lossy();
        let docker = Docker::connect_with_socket(&socket, DOCKER_API_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| SandboxError::Connect(e.to_string()))?;
        Ok(Self {
            docker,
            config,
            instances: Mutex::new(HashMap::new()),
        })
    }

    fn resolve_root(&self, settings: &ExecutionSettings) -> Result<PathBuf, SandboxError> {
        if let Some(root) = &self.config.sandbox_root_override {
            return Ok(root.clone());
        }
        if let Some(root) = &settings.sandbox_root {
            return Ok(PathBuf::from(root));
        }
        Config::default_sandbox_root().map_err(|e| SandboxError::Init(e.to_string()))
    }

    fn resolve_image(&self, settings: &ExecutionSettings) -> String {
        settings
            .docker
            .image
            .clone()
            .or_else(|| self.config.docker_image_override.clone())
            .unwrap_or_else(|| DEFAULT_DOCKER_IMAGE.to_string())
    }

    fn resolve_persist(&self, settings: &ExecutionSettings) -> bool {
        self.config
            .persist_sandbox_override
            .or(settings.persist_sandbox)
            .unwrap_or(false)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!("Pulling image {image}");
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHost for DockerDriver {
    async fn spawn(
        &self,
        mission_id: Uuid,
        project_id: Uuid,
        job_id: Uuid,
        settings: &ExecutionSettings,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let root = self.resolve_root(settings)?;
        let dir_name = format!(
            "sandbox-{mission_id}-{:08x}-{:08x}",
            rand::random::<u32>(),
            rand::random::<u32>()
        );
        let workspace = root.join(&dir_name);
        let repo = workspace.join("repo");
        tokio::fs::create_dir_all(&repo).await?;

        let image = self.resolve_image(settings);
        self.ensure_image(&image).await?;

        let docker_settings = &settings.docker;
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{CONTAINER_WORKSPACE}",
                workspace.to_string_lossy()
            )]),
            nano_cpus: docker_settings
                .cpu_limit
                .map(|cpus| (cpus * 1_000_000_000.0) as i64),
            memory: docker_settings.mem_limit_mb.map(|mb| mb * 1024 * 1024),
            pids_limit: docker_settings.pids_limit,
            network_mode: docker_settings.network_mode.clone(),
            ..HostConfig::default()
        };
        let labels = HashMap::from([
            ("openjules.mission_id".to_string(), mission_id.to_string()),
            ("openjules.project_id".to_string(), project_id.to_string()),
            ("openjules.job_id".to_string(), job_id.to_string()),
        ]);
        let body = ContainerCreateBody {
            image: Some(image.clone()),
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            working_dir: Some(format!("{CONTAINER_WORKSPACE}/repo")),
            labels: Some(labels),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&dir_name).build()),
                body,
            )
            .await
            .map_err(|e| SandboxError::Container {
                operation: "create",
                message: e.to_string(),
            })?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::Container {
                operation: "start",
                message: e.to_string(),
            })?;

        let instance_id = Uuid::new_v4();
        let persist = self.resolve_persist(settings);
        self.instances.lock().await.insert(
            instance_id,
            Bookkeeping {
                container_id: created.id.clone(),
                workspace: workspace.clone(),
                persist,
            },
        );

        tracing::info!(
            "Spawned sandbox {instance_id} for mission {mission_id} (image {image}, workspace {})",
            workspace.display()
        );

        Ok(Arc::new(DockerInstance {
            instance_id,
            docker: self.docker.clone(),
            container_id: created.id,
            workspace,
            repo,
            shell: RwLock::new("sh".to_string()),
            sink: RwLock::new(None),
        }))
    }

    async fn teardown(&self, instance_id: Uuid) -> Result<(), SandboxError> {
        let Some(bookkeeping) = self.instances.lock().await.remove(&instance_id) else {
            return Err(SandboxError::UnknownInstance(instance_id));
        };

        let stop = self
            .docker
            .stop_container(
                &bookkeeping.container_id,
                Some(StopContainerOptionsBuilder::new().t(1).build()),
            )
            .await;
        if let Err(e) = stop {
            tracing::warn!("Stopping container {} failed: {e}", bookkeeping.container_id);
        }
        let removed = self
            .docker
            .remove_container(
                &bookkeeping.container_id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await;
        if let Err(e) = removed {
            tracing::warn!("Removing container {} failed: {e}", bookkeeping.container_id);
        }

        if !bookkeeping.persist {
            if let Err(e) = tokio::fs::remove_dir_all(&bookkeeping.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "Removing workspace {} failed: {e}",
                        bookkeeping.workspace.display()
                    );
                }
            }
        }

        tracing::info!("Tore down sandbox {instance_id}");
        Ok(())
    }
}

/// One running container plus its host workspace.
pub struct DockerInstance {
    instance_id: Uuid,
    docker: Docker,
    container_id: String,
    workspace: PathBuf,
    repo: PathBuf,
    shell: RwLock<String>,
    sink: RwLock<Option<LogSink>>,
}

impl DockerInstance {
    /// Translate a host path under the workspace into its container path.
    fn container_path(&self, host: &Path) -> String {
        match host.strip_prefix(&self.workspace) {
            Ok(rel) if rel.as_os_str().is_empty() => CONTAINER_WORKSPACE.to_string(),
            Ok(rel) => format!("{CONTAINER_WORKSPACE}/{}", rel.to_string_lossy()),
            Err(_) => format!("{CONTAINER_WORKSPACE}/repo"),
        }
    }

    async fn forward(&self, text: &str) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            let _ = sink.send(text.to_string());
        }
    }

    /// Run an exec and stream its demultiplexed output until it finishes or
    /// the timeout elapses. Exec-level errors come back as `exit_code = -1`.
    async fn exec_streaming(
        &self,
        cmd: Vec<String>,
        workdir: Option<String>,
        timeout_ms: u64,
        forward_output: bool,
    ) -> ExecOutcome {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            working_dir: workdir,
            ..Default::default()
        };
        let exec = match self.docker.create_exec(&self.container_id, options).await {
            Ok(exec) => exec,
            Err(e) => {
                return ExecOutcome { stdout: String::new(), stderr: e.to_string(), exit_code: -1 }
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        let streamed = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            async {
                match self.docker.start_exec(&exec.id, None).await {
                    Ok(StartExecResults::Attached { mut output, .. }) => {
                        while let Some(chunk) = output.next().await {
                            match chunk {
                                Ok(LogOutput::StdOut { message }) => {
                                    let text = String::from_utf8_lossy(&message);
                                    if forward_output {
                                        self.forward(&text).await;
                                    }
                                    stdout.push_str(&text);
                                }
                                Ok(LogOutput::StdErr { message }) => {
                                    let text = String::from_utf8_lossy(&message);
                                    if forward_output {
                                        self.forward(&text).await;
                                    }
                                    stderr.push_str(&text);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    stderr.push_str(&e.to_string());
                                    return Err(());
                                }
                            }
                        }
                        Ok(())
                    }
                    Ok(StartExecResults::Detached) => Ok(()),
                    Err(e) => {
                        stderr.push_str(&e.to_string());
                        Err(())
                    }
                }
            },
        )
        .await;

        match streamed {
            Ok(Ok(())) => {
                let exit_code = self
                    .docker
                    .inspect_exec(&exec.id)
                    .await
                    .ok()
                    .and_then(|inspect| inspect.exit_code)
                    .unwrap_or(-1);
                ExecOutcome { stdout, stderr, exit_code }
            }
            Ok(Err(())) => ExecOutcome { stdout, stderr, exit_code: -1 },
            Err(_) => {
                stderr.push_str(&format!("Timeout: command did not finish within {timeout_ms}ms"));
                ExecOutcome { stdout, stderr, exit_code: -1 }
            }
        }
    }

    async fn shell_exec(
        &self,
        command: &str,
        workdir: Option<String>,
        timeout_ms: u64,
        forward_output: bool,
    ) -> ExecOutcome {
        let shell = self.shell.read().await.clone();
        self.exec_streaming(
            vec![shell, "-lc".to_string(), command.to_string()],
            workdir,
            timeout_ms,
            forward_output,
        )
        .await
    }

    async fn run_host_git(&self, args: &[&str]) -> Result<String, SandboxError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await
            .map_err(|e| SandboxError::Git(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Git(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Sandbox for DockerInstance {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn repo_dir(&self) -> &Path {
        &self.repo
    }

    async fn init(&self) -> Result<(), SandboxError> {
        // Prefer bash when the image ships it.
        let probe = self
            .exec_streaming(
                vec!["sh".to_string(), "-c".to_string(), "command -v bash".to_string()],
                None,
                10_000,
                false,
            )
            .await;
        if probe.exit_code == 0 && !probe.stdout.trim().is_empty() {
            *self.shell.write().await = "bash".to_string();
        }

        // Best-effort base tooling; images without a package manager still work.
        let install = "(apk add --no-cache git curl wget procps >/dev/null 2>&1) \
                       || (apt-get update -qq >/dev/null 2>&1 && apt-get install -y -qq git curl wget procps >/dev/null 2>&1) \
                       || true";
        let _ = self.shell_exec(install, None, 120_000, false).await;

        let init = self
            .shell_exec(
                "git init -q . && git config user.email openjules@local && git config user.name OpenJules",
                Some(format!("{CONTAINER_WORKSPACE}/repo")),
                30_000,
                false,
            )
            .await;
        if init.exit_code != 0 {
            return Err(SandboxError::Init(format!(
                "git init failed (exit {}): {}",
                init.exit_code, init.stderr
            )));
        }

        let shell = self.shell.read().await.clone();
        let ready = format!(
            "Sandbox container {} ready (shell {shell}, workspace {})",
            &self.container_id[..12.min(self.container_id.len())],
            self.workspace.display()
        );
        tracing::info!("{ready}");
        self.forward(&ready).await;
        Ok(())
    }

    async fn clone_repo(&self, url: &str, branch: Option<&str>) -> Result<(), SandboxError> {
        let branch_arg = branch
            .map(|b| format!("--branch {} ", shell_quote(b)))
            .unwrap_or_default();
        let cmd = format!("git clone --depth 1 {branch_arg}{} .", shell_quote(url));
        let outcome = self
            .shell_exec(&cmd, Some(format!("{CONTAINER_WORKSPACE}/repo")), 300_000, true)
            .await;
        if outcome.exit_code != 0 {
            return Err(SandboxError::Git(format!(
                "clone of {url} failed (exit {}): {}",
                outcome.exit_code, outcome.stderr
            )));
        }
        Ok(())
    }

    async fn command(
        &self,
        cmd: &str,
        workdir: Option<&Path>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        let container_workdir = workdir
            .map(|dir| self.container_path(dir))
            .unwrap_or_else(|| format!("{CONTAINER_WORKSPACE}/repo"));
        Ok(self
            .shell_exec(
                cmd,
                Some(container_workdir),
                timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
                true,
            )
            .await)
    }

    async fn background_command(
        &self,
        cmd: &str,
        ready_pattern: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_BACKGROUND_TIMEOUT_MS);
        let ready = RegexBuilder::new(ready_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SandboxError::ReadyPattern {
                pattern: ready_pattern.to_string(),
                message: e.to_string(),
            })?;

        let shell = self.shell.read().await.clone();
        let log_file = format!("/tmp/bg-{:08x}.log", rand::random::<u32>());
        let escaped = cmd.replace('\'', "'\\''");
        let launcher = format!(
            "nohup {shell} -c '{escaped}' > {log_file} 2>&1 & echo $! > {log_file}.pid"
        );
        let launched = self
            .shell_exec(&launcher, Some(format!("{CONTAINER_WORKSPACE}/repo")), 15_000, false)
            .await;
        if launched.exit_code != 0 {
            return Err(SandboxError::BackgroundDied {
                tail: format!("launch failed (exit {}): {}", launched.exit_code, launched.stderr),
            });
        }

        // Follow the log file; race readiness against pid death and timeout.
        let tail_exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        shell.clone(),
                        "-c".to_string(),
                        format!("tail -n +1 -f {log_file}"),
                    ]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Container { operation: "exec", message: e.to_string() })?;
        let mut tail_stream = match self
            .docker
            .start_exec(&tail_exec.id, None)
            .await
            .map_err(|e| SandboxError::Container { operation: "exec", message: e.to_string() })?
        {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(SandboxError::Container {
                    operation: "exec",
                    message: "tail stream detached unexpectedly".to_string(),
                })
            }
        };

        let mut buffer = String::new();
        let deadline = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms));
        tokio::pin!(deadline);
        let mut pid_probe =
            tokio::time::interval(std::time::Duration::from_millis(PID_PROBE_INTERVAL_MS));
        pid_probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pid_probe.tick().await; // First tick fires immediately; skip it.

        loop {
            tokio::select! {
                chunk = tail_stream.next() => {
                    match chunk {
                        Some(Ok(LogOutput::StdOut { message }))
                        | Some(Ok(LogOutput::StdErr { message })) => {
                            let text = String::from_utf8_lossy(&message);
                            self.forward(&text).await;
                            buffer.push_str(&text);
                            if ready.is_match(&buffer) {
                                // Pattern matched; the process keeps running.
                                return Ok(ExecOutcome {
                                    stdout: buffer,
                                    stderr: String::new(),
                                    exit_code: 0,
                                });
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(SandboxError::Container {
                                operation: "exec",
                                message: format!("tail stream failed: {e}"),
                            });
                        }
                        None => {
                            return Err(SandboxError::BackgroundDied {
                                tail: last_chars(&buffer, DIED_TAIL_CHARS),
                            });
                        }
                    }
                }
                _ = pid_probe.tick() => {
                    let alive = self
                        .shell_exec(
                            &format!("kill -0 $(cat {log_file}.pid)"),
                            None,
                            10_000,
                            false,
                        )
                        .await;
                    if alive.exit_code != 0 {
                        return Err(SandboxError::BackgroundDied {
                            tail: last_chars(&buffer, DIED_TAIL_CHARS),
                        });
                    }
                }
                _ = &mut deadline => {
                    return Err(SandboxError::BackgroundReadyTimeout {
                        pattern: ready_pattern.to_string(),
                        timeout_ms,
                    });
                }
            }
        }
    }

    async fn stream_logs(&self, sink: LogSink) {
        *self.sink.write().await = Some(sink);
    }

    async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let path = safe_join(&self.repo, relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_file(&self, relative: &str) -> Result<Vec<u8>, SandboxError> {
        let path = safe_join(&self.repo, relative)?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn create_patch(&self) -> Result<String, SandboxError> {
        // Intent-to-add staging lets brand-new files show up in plain diff.
        self.run_host_git(&["add", "-A", "--intent-to-add", "."]).await?;
        self.run_host_git(&["diff", "--no-color", "--", "."]).await
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn last_chars(text: &str, count: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}
