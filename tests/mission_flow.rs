//! End-to-end mission flows against mock seams: a scripted LLM client, a
//! fake sandbox host backed by real temp directories, and the in-memory
//! store. Covers the controller state machine, human gating, guard
//! behaviour, background readiness and teardown guarantees.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use openjules::llm::{ChatMessage, ChatOptions, ChatOutcome, LlmClient, LlmError, Role, RoleBinding};
use openjules::mission::{apply_control, MissionController};
use openjules::model::{
    ControlAction, ControlPatch, Job, JobPayload, JobStatus, Mission, MissionStatus, PlanAction,
    ReviewAction, StepStatus,
};
use openjules::sandbox::{ExecOutcome, LogSink, Sandbox, SandboxError, SandboxHost};
use openjules::settings::ExecutionSettings;
use openjules::store::{InMemoryStore, Store};

const PATCH: &str = "diff --git a/server.js b/server.js\nnew file mode 100644\n--- /dev/null\n+++ b/server.js\n@@ -0,0 +1 @@\n+console.log('hi')\n";

// ── Scripted LLM ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedLlm {
    planner: StdMutex<VecDeque<String>>,
    coder: StdMutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn with_plan(plan: &str) -> Self {
        let llm = Self::default();
        llm.planner.lock().expect("lock").push_back(plan.to_string());
        llm
    }

    fn push_plan(&self, plan: &str) {
        self.planner.lock().expect("lock").push_back(plan.to_string());
    }

    fn push_command(&self, reply: &str) {
        self.coder.lock().expect("lock").push_back(reply.to_string());
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        binding: &RoleBinding,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let content = match binding.role {
            Role::Planner => self
                .planner
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| LlmError::Http("no scripted plan left".to_string()))?,
            Role::Coder => self
                .coder
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| LlmError::Http("no scripted command left".to_string()))?,
            Role::Troubleshooter => {
                "Read the stderr tail for the direct cause. Verify the referenced files exist. \
                 Retry with a simpler command."
                    .to_string()
            }
            _ => r#"{"safe": true}"#.to_string(),
        };
        Ok(ChatOutcome {
            content,
            prompt_tokens: 100,
            completion_tokens: 25,
            total_tokens: 125,
            model: binding.model.clone(),
            provider: binding.provider.as_str().to_string(),
        })
    }
}

// ── Fake sandbox host ────────────────────────────────────────────────────────

struct FakeHost {
    root: PathBuf,
    persist: bool,
    /// What a background process "prints" before going quiet.
    emitted_output: String,
    live: StdMutex<HashMap<Uuid, PathBuf>>,
    teardowns: AtomicUsize,
}

impl FakeHost {
    fn new(root: PathBuf, emitted_output: &str) -> Self {
        Self {
            root,
            persist: false,
            emitted_output: emitted_output.to_string(),
            live: StdMutex::new(HashMap::new()),
            teardowns: AtomicUsize::new(0),
        }
    }

    fn live_count(&self) -> usize {
        self.live.lock().expect("lock").len()
    }
}

#[async_trait]
impl SandboxHost for FakeHost {
    async fn spawn(
        &self,
        mission_id: Uuid,
        _project_id: Uuid,
        _job_id: Uuid,
        _settings: &ExecutionSettings,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let workspace = self.root.join(format!("sandbox-{mission_id}-deadbeef-cafebabe"));
        let repo = workspace.join("repo");
        tokio::fs::create_dir_all(&repo).await?;

        let instance_id = Uuid::new_v4();
        self.live
            .lock()
            .expect("lock")
            .insert(instance_id, workspace);
        Ok(Arc::new(FakeSandbox {
            instance_id,
            repo,
            emitted_output: self.emitted_output.clone(),
        }))
    }

    async fn teardown(&self, instance_id: Uuid) -> Result<(), SandboxError> {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        let Some(workspace) = self.live.lock().expect("lock").remove(&instance_id) else {
            return Err(SandboxError::UnknownInstance(instance_id));
        };
        if !self.persist {
            let _ = tokio::fs::remove_dir_all(&workspace).await;
        }
        Ok(())
    }
}

struct FakeSandbox {
    instance_id: Uuid,
    repo: PathBuf,
    emitted_output: String,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn repo_dir(&self) -> &Path {
        &self.repo
    }

    async fn init(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn clone_repo(&self, _url: &str, _branch: Option<&str>) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn command(
        &self,
        cmd: &str,
        _workdir: Option<&Path>,
        _timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        Ok(ExecOutcome {
            stdout: format!("ran: {cmd}"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn background_command(
        &self,
        _cmd: &str,
        ready_pattern: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecOutcome, SandboxError> {
        let ready = regex::RegexBuilder::new(ready_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SandboxError::ReadyPattern {
                pattern: ready_pattern.to_string(),
                message: e.to_string(),
            })?;
        if ready.is_match(&self.emitted_output) {
            Ok(ExecOutcome {
                stdout: self.emitted_output.clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        } else {
            Err(SandboxError::BackgroundReadyTimeout {
                pattern: ready_pattern.to_string(),
                timeout_ms: timeout_ms.unwrap_or(120_000),
            })
        }
    }

    async fn stream_logs(&self, _sink: LogSink) {}

    async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<(), SandboxError> {
        let path = self.repo.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_file(&self, relative: &str) -> Result<Vec<u8>, SandboxError> {
        Ok(tokio::fs::read(self.repo.join(relative)).await?)
    }

    async fn create_patch(&self) -> Result<String, SandboxError> {
        Ok(PATCH.to_string())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<InMemoryStore>,
    llm: Arc<ScriptedLlm>,
    host: Arc<FakeHost>,
    controller: Arc<MissionController>,
    _root: tempfile::TempDir,
}

async fn harness(llm: ScriptedLlm, emitted_output: &str) -> Harness {
    let root = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(llm);
    let host = Arc::new(FakeHost::new(root.path().to_path_buf(), emitted_output));
    let controller = Arc::new(MissionController::new(
        store.clone(),
        llm.clone(),
        host.clone(),
    ));
    Harness { store, llm, host, controller, _root: root }
}

async fn seed_mission(store: &InMemoryStore, goal: &str) -> (Mission, Job) {
    let project_id = Uuid::new_v4();
    store
        .set_setting(
            project_id,
            "ai",
            serde_json::json!({ "provider": "openai", "openai": { "apiKey": "sk-test" } }),
        )
        .await
        .expect("seed ai settings");

    let mission = Mission::new(project_id, goal, None);
    store.create_mission(&mission).await.expect("create mission");

    let mut job = Job::new(project_id, JobPayload::default());
    job.mission_id = Some(mission.id);
    store.create_job(&job).await.expect("create job");
    (mission, job)
}

async fn wait_for_status(
    store: &InMemoryStore,
    mission_id: Uuid,
    status: MissionStatus,
) -> Mission {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if let Some(mission) = store.get_mission(mission_id).await.expect("get mission") {
                if mission.status == status {
                    return mission;
                }
                assert!(
                    !(mission.status.is_terminal() && mission.status != status),
                    "mission reached terminal {} while waiting for {}: {:?}",
                    mission.status,
                    status,
                    mission.fail_reason
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status}"))
}

fn plan_json(steps: &[serde_json::Value]) -> String {
    serde_json::json!({ "reasoning": "scripted plan", "steps": steps }).to_string()
}

fn simple_step(description: &str) -> serde_json::Value {
    serde_json::json!({ "description": description })
}

fn command_json(command: &str) -> String {
    serde_json::json!({ "command": command, "reasoning": "scripted" }).to_string()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

/// Scenario 1: happy path without a repo, through approval and review, with
/// a non-empty patch in the job result and full teardown.
#[tokio::test(start_paused = true)]
async fn happy_path_reaches_review_with_patch_and_tears_down() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[
        simple_step("Scaffold a package.json and source layout"),
        simple_step("Implement the hello world api"),
        simple_step("Smoke-test the implementation"),
        simple_step("Review the changes and produce final diff"),
    ]));
    for cmd in [
        "cat > package.json <<'EOF'\n{\"name\":\"hello\"}\nEOF",
        "cat > server.js <<'EOF'\nconsole.log('hi')\nEOF",
        "node -e \"require('./server.js')\"",
        "git add -A . && git status --short",
    ] {
        llm.push_command(&command_json(cmd));
    }

    let h = harness(llm, "").await;
    let (mission, job) =
        seed_mission(&h.store, "create a simple nodejs helloworld api").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    let waiting = wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    assert_eq!(waiting.plan_reasoning.as_deref(), Some("scripted plan"));
    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(steps.len(), 4);
    assert!(steps[3].description.contains("produce final diff"));

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    let reviewing = wait_for_status(&h.store, mission.id, MissionStatus::WaitingReview).await;
    assert!(reviewing.finished_at.is_some());
    assert!(reviewing.total_duration_ms.unwrap_or(-1) >= 0);

    // Patch landed on the job and the job mirrors the review state.
    let job_row = h.store.get_job(job.id).await.expect("get job").expect("job exists");
    assert_eq!(job_row.status, JobStatus::WaitingReview);
    let patch = job_row.result.expect("result").patch.expect("patch");
    assert!(patch.starts_with("diff --git"));

    // All steps done, strictly increasing gap-free order within the wave.
    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert!(steps.iter().all(|s| s.status == StepStatus::Done));
    for (i, step) in steps.iter().enumerate() {
        assert_eq!(step.order_index, i as i32);
    }

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Review(ReviewAction::Approve))
        .await
        .expect("approve review");

    task.await.expect("join").expect("controller run");

    let done = h.store.get_mission(mission.id).await.expect("get").expect("exists");
    assert_eq!(done.status, MissionStatus::Completed);
    assert!(done.result_summary.is_some());

    // Token accounting: total equals the sum over role buckets.
    let mut summed = openjules::model::TokenUsage::default();
    for bucket in done.token_usage.roles.values() {
        summed.add(*bucket);
    }
    assert_eq!(summed, done.token_usage.total);
    assert!(done.token_usage.roles.contains_key("planner"));
    assert!(done.token_usage.roles.contains_key("coder"));

    // Teardown ran: no live container, sandbox directory removed.
    assert_eq!(h.host.live_count(), 0);
    assert_eq!(h.host.teardowns.load(Ordering::Relaxed), 1);
    let leftovers = std::fs::read_dir(h._root.path()).expect("read root").count();
    assert_eq!(leftovers, 0, "sandbox directory should be deleted");

    let job_row = h.store.get_job(job.id).await.expect("get job").expect("job exists");
    assert_eq!(job_row.status, JobStatus::Completed);
    assert!(job_row.finished_at.is_some());
    assert!(job_row.heartbeat_at.is_some());
}

/// Scenario 2: the guard blocks a destructive command; the step ends BLOCKED
/// and the mission carries on with the next step.
#[tokio::test(start_paused = true)]
async fn guard_block_keeps_mission_running() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[
        simple_step("Clean the workspace"),
        simple_step("Say hello"),
    ]));
    llm.push_command(&command_json("rm -rf /"));
    llm.push_command(&command_json("echo hello"));

    let h = harness(llm, "").await;
    let (mission, job) = seed_mission(&h.store, "tidy up").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingReview).await;

    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(steps[0].status, StepStatus::Blocked);
    assert_eq!(steps[0].exit_code, Some(-2));
    assert!(steps[0].result_summary.as_deref().unwrap_or("").contains("rm-rf-root"));
    assert_eq!(steps[1].status, StepStatus::Done);

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Review(ReviewAction::Approve))
        .await
        .expect("approve review");
    task.await.expect("join").expect("controller run");
}

/// Scenario 3: `npm start` is auto-promoted to background and succeeds once
/// the emitted output matches the suggested readiness pattern.
#[tokio::test(start_paused = true)]
async fn hanging_command_is_promoted_and_waits_for_readiness() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[simple_step("Start the server")]));
    llm.push_command(&command_json("npm start"));

    let h = harness(llm, "server booting\nlistening on 3000\n").await;
    let (mission, job) = seed_mission(&h.store, "serve the api").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingReview).await;

    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(steps[0].status, StepStatus::Done);
    assert!(steps[0].background, "guard should have promoted npm start");
    let pattern = steps[0].ready_pattern.as_deref().expect("pattern set");
    assert_eq!(pattern, openjules::guard::DEFAULT_READY_PATTERN);
    assert!(steps[0].stdout_tail.contains("listening on 3000"));

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Review(ReviewAction::Approve))
        .await
        .expect("approve review");
    task.await.expect("join").expect("controller run");
}

/// Scenario 4: a background step whose readiness pattern never matches times
/// out, fails the step and the mission.
#[tokio::test(start_paused = true)]
async fn background_readiness_timeout_fails_the_mission() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[serde_json::json!({
        "description": "Start the service",
        "background": true,
        "readyPattern": "NEVER_HAPPENS",
        "timeoutMs": 3000,
    })]));
    llm.push_command(&command_json("node service.js"));

    let h = harness(llm, "the service prints something else\n").await;
    let (mission, job) = seed_mission(&h.store, "run the service").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    task.await.expect("join").expect("controller run");

    let failed = h.store.get_mission(mission.id).await.expect("get").expect("exists");
    assert_eq!(failed.status, MissionStatus::Failed);
    assert_eq!(failed.fail_reason.as_deref(), Some("Step 1 failed."));
    assert!(failed.finished_at.is_some());

    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].stderr_tail.contains("Timeout"));

    let job_row = h.store.get_job(job.id).await.expect("get job").expect("job exists");
    assert_eq!(job_row.status, JobStatus::Failed);
    assert!(job_row.last_error.is_some());

    // Teardown also runs on the failure path.
    assert_eq!(h.host.live_count(), 0);
}

/// Scenario 5: user input from plan approval discards the pending wave and
/// replans; finished history would be preserved and order keeps increasing.
#[tokio::test(start_paused = true)]
async fn user_input_triggers_replan_with_fresh_steps() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[
        simple_step("Scaffold a JavaScript project"),
        simple_step("Produce final diff"),
    ]));

    let h = harness(llm, "").await;
    let (mission, job) = seed_mission(&h.store, "build a small api").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    let first_wave = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(first_wave.len(), 2);

    // Queue the second plan before poking the controller.
    h.llm.push_plan(&plan_json(&[
        simple_step("Scaffold a TypeScript project"),
        simple_step("Configure the TypeScript compiler"),
        simple_step("Produce final diff"),
    ]));
    let patched = apply_control(
        h.store.as_ref(),
        mission.id,
        ControlPatch::Control {
            action: ControlAction::Input,
            message: Some("use TypeScript".to_string()),
        },
    )
    .await
    .expect("input accepted");
    assert_eq!(patched.status, MissionStatus::Planning);

    // Wait until the second wave is in place.
    let waiting = wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    assert!(waiting.latest_user_input.is_none(), "input was consumed");

    let second_wave = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(second_wave.len(), 3, "old pending steps were discarded");
    assert!(second_wave
        .iter()
        .take(2)
        .all(|s| s.description.contains("TypeScript")));
    // order_index keeps increasing across waves and stays gap-free within one.
    let first_index = second_wave[0].order_index;
    assert!(first_index > first_wave.last().expect("wave").order_index);
    for (offset, step) in second_wave.iter().enumerate() {
        assert_eq!(step.order_index, first_index + offset as i32);
    }

    // The consumed input is visible in the log stream.
    let logs = h.store.list_logs(mission.id).await.expect("logs");
    assert!(logs.iter().any(|l| l.content.contains("use TypeScript")));

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Reject))
        .await
        .expect("reject plan");
    task.await.expect("join").expect("controller run");

    let failed = h.store.get_mission(mission.id).await.expect("get").expect("exists");
    assert_eq!(failed.status, MissionStatus::Failed);
    assert!(failed.fail_reason.is_some());
}

/// Pause/resume between steps leaves the plan untouched.
#[tokio::test(start_paused = true)]
async fn pause_resume_preserves_step_count_and_order() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[
        simple_step("First change"),
        simple_step("Second change"),
    ]));
    llm.push_command(&command_json("echo one"));
    llm.push_command(&command_json("echo two"));

    let h = harness(llm, "").await;
    let (mission, job) = seed_mission(&h.store, "two quick edits").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    let before: Vec<_> = h
        .store
        .list_steps(mission.id)
        .await
        .expect("steps")
        .iter()
        .map(|s| (s.id, s.order_index))
        .collect();

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    // Pause as soon as the controller is executing, then resume.
    wait_for_status(&h.store, mission.id, MissionStatus::Executing).await;
    if let Ok(paused) = apply_control(
        h.store.as_ref(),
        mission.id,
        ControlPatch::Control { action: ControlAction::Pause, message: None },
    )
    .await
    {
        assert_eq!(paused.status, MissionStatus::Paused);
        apply_control(
            h.store.as_ref(),
            mission.id,
            ControlPatch::Control { action: ControlAction::Resume, message: None },
        )
        .await
        .expect("resume");
    }

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingReview).await;
    let after: Vec<_> = h
        .store
        .list_steps(mission.id)
        .await
        .expect("steps")
        .iter()
        .map(|s| (s.id, s.order_index))
        .collect();
    assert_eq!(before, after, "pause/resume must not disturb the plan");

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Review(ReviewAction::Approve))
        .await
        .expect("approve review");
    task.await.expect("join").expect("controller run");
}

/// Planner failure aborts the mission with a fail reason and teardown.
#[tokio::test(start_paused = true)]
async fn planner_failure_fails_the_mission() {
    // No scripted plan: the planner call errors out.
    let h = harness(ScriptedLlm::default(), "").await;
    let (mission, job) = seed_mission(&h.store, "anything").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let result = tokio::spawn(async move { controller.run_job(job_id).await })
        .await
        .expect("join");
    assert!(result.is_err(), "planner failure surfaces as an error");

    let failed = h.store.get_mission(mission.id).await.expect("get").expect("exists");
    assert_eq!(failed.status, MissionStatus::Failed);
    assert!(failed.fail_reason.as_deref().unwrap_or("").contains("planner"));
    assert_eq!(h.host.live_count(), 0);

    let logs = h.store.list_logs(mission.id).await.expect("logs");
    assert!(logs
        .iter()
        .any(|l| l.kind == openjules::model::LogKind::Error));
}

/// Coder failure degrades to the echo safety command instead of failing.
#[tokio::test(start_paused = true)]
async fn coder_failure_falls_back_to_echo_command() {
    let llm = ScriptedLlm::with_plan(&plan_json(&[simple_step("Mystery step")]));
    // No scripted coder reply: the coder call errors out.

    let h = harness(llm, "").await;
    let (mission, job) = seed_mission(&h.store, "do the thing").await;

    let controller = h.controller.clone();
    let job_id = job.id;
    let task = tokio::spawn(async move { controller.run_job(job_id).await });

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingPlanApproval).await;
    apply_control(h.store.as_ref(), mission.id, ControlPatch::Plan(PlanAction::Approve))
        .await
        .expect("approve plan");

    wait_for_status(&h.store, mission.id, MissionStatus::WaitingReview).await;
    let steps = h.store.list_steps(mission.id).await.expect("steps");
    assert_eq!(steps[0].status, StepStatus::Done);
    assert!(steps[0]
        .command
        .as_deref()
        .unwrap_or("")
        .contains("Coder could not generate command for:"));

    apply_control(h.store.as_ref(), mission.id, ControlPatch::Review(ReviewAction::Approve))
        .await
        .expect("approve review");
    task.await.expect("join").expect("controller run");
}
