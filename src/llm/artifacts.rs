//! Planner, coder and troubleshooter contracts.
//!
//! Builds the role prompts, parses the JSON artefacts out of model replies,
//! and carries the keyless static fallback that plans heuristically from
//! `package.json`.

use serde::Deserialize;

use crate::model::{TokenUsage, DEFAULT_STEP_TIMEOUT_MS};

use super::{
    extract_json_block, ChatMessage, ChatOptions, LlmClient, LlmError, Provider, RoleBinding,
};

/// README text is truncated to this many characters in planner prompts.
const README_MAX_CHARS: usize = 8_000;

/// Combined stderr+stdout tail shown to the troubleshooter.
const FAILURE_OUTPUT_MAX_CHARS: usize = 4_000;

/// Repository context assembled by the controller before planning/coding.
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub repo_present: bool,
    pub file_tree: Option<String>,
    pub package_json: Option<String>,
    pub readme: Option<String>,
    pub custom_instructions: Option<String>,
}

/// One planned step before it is persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStepDraft {
    pub description: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub ready_pattern: Option<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

/// Parsed planner output plus accounting.
#[derive(Debug, Clone)]
pub struct PlanArtifact {
    pub reasoning: String,
    pub steps: Vec<PlanStepDraft>,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct PlanWire {
    #[serde(default)]
    reasoning: String,
    steps: Vec<PlanStepDraft>,
}

/// Parsed coder output plus accounting.
#[derive(Debug, Clone)]
pub struct StepCommandArtifact {
    pub command: String,
    pub reasoning: String,
    pub background: bool,
    pub ready_pattern: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepCommandWire {
    command: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    ready_pattern: Option<String>,
}

/// Context handed to the coder for one step.
#[derive(Debug, Clone, Default)]
pub struct CoderContext {
    pub goal: String,
    pub step_index: usize,
    pub step_total: usize,
    pub step_description: String,
    /// (description, status) per step of the current plan, in order.
    pub plan_overview: Vec<(String, String)>,
    /// Truncated outputs of previously finished steps.
    pub previous_outputs: Vec<String>,
    pub file_tree: Option<String>,
    pub package_json: Option<String>,
    pub guard_feedback: Option<String>,
    pub user_hint: Option<String>,
    pub troubleshooter_analysis: Option<String>,
}

const PLANNER_SYSTEM_PROMPT: &str = r#"You are the planner of an autonomous software engineer working inside an isolated Linux container.

Break the user's goal into a plan of 3 to 8 steps. Reply with JSON only, matching exactly:
{"reasoning": "<why this plan>", "steps": [{"description": "<what the step achieves>", "timeoutMs": 300000, "retryable": false, "background": false, "readyPattern": null}]}

Rules:
- Step descriptions state outcomes, never shell commands; a separate coder turns them into commands.
- If no repository is provided, plan to scaffold one; never ask clarifying questions about a missing repo.
- Mark a step background=true with a readyPattern only when it starts a long-lived service later steps depend on.
- Mark retryable=true only for steps that are safe to repeat, such as installing dependencies.
- The final step reviews the work and produces the final diff."#;

const CODER_SYSTEM_PROMPT: &str = r#"You are the coder of an autonomous software engineer. You turn one plan step into exactly one shell command for a non-interactive Linux container whose working directory is the project repository.

Reply with JSON only, matching exactly:
{"command": "<shell command>", "reasoning": "<one sentence>", "background": false, "readyPattern": null}

Rules:
- Never use interactive programs (editors, REPLs, pagers) or commands that prompt.
- Never use back-ticks; use $(...) only when unavoidable.
- Create files with quoted heredocs: cat > path <<'EOF' ... EOF.
- For long-running commands (servers, watchers) set background=true and a readyPattern regex that matches their startup output.
- Prefer the project's own scripts (package.json scripts) over ad-hoc tool invocations when they exist.
- Never run npm init -y; write package.json explicitly with a heredoc.
- When you add a script to package.json, the file it references must exist (create it in the same command if needed)."#;

const TROUBLESHOOTER_SYSTEM_PROMPT: &str = "You analyse a failed shell command for an autonomous \
software engineer. Reply with plain text, at most three sentences, describing the most likely \
cause and the strategy to get past it. Do not reply with a corrected command.";

/// Produce a plan for the mission goal, via the bound provider or the static
/// fallback when no key is configured.
pub async fn generate_plan(
    client: &dyn LlmClient,
    binding: &RoleBinding,
    goal: &str,
    ctx: &RepoContext,
    planner_prompt_override: Option<&str>,
    user_input: Option<&str>,
) -> Result<PlanArtifact, LlmError> {
    if binding.provider == Provider::Static {
        return Ok(static_plan(goal, ctx));
    }

    let system = planner_prompt_override.unwrap_or(PLANNER_SYSTEM_PROMPT);
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(planner_user_message(goal, ctx, user_input)),
    ];
    let opts = ChatOptions { temperature: Some(0.2), max_tokens: Some(2048), json_mode: true };

    let outcome = client.chat(binding, &messages, &opts).await?;
    let block = extract_json_block(&outcome.content).unwrap_or(outcome.content.as_str());
    let wire: PlanWire = serde_json::from_str(block)
        .map_err(|e| LlmError::Parse(format!("planner reply: {e}")))?;
    if wire.steps.is_empty() {
        return Err(LlmError::Parse("planner reply had no steps".to_string()));
    }

    Ok(PlanArtifact {
        reasoning: wire.reasoning,
        steps: wire.steps,
        usage: outcome.usage(),
        provider: outcome.provider,
        model: outcome.model,
    })
}

fn planner_user_message(goal: &str, ctx: &RepoContext, user_input: Option<&str>) -> String {
    let mut msg = format!("Goal: {goal}\n\n");
    if ctx.repo_present {
        msg.push_str("A source repository is checked out in the working directory.\n");
    } else {
        msg.push_str("No source repository is provided; start from an empty directory.\n");
    }
    if let Some(tree) = &ctx.file_tree {
        msg.push_str(&format!("\nFile tree:\n{tree}\n"));
    }
    if let Some(pkg) = &ctx.package_json {
        msg.push_str(&format!("\npackage.json:\n{pkg}\n"));
    }
    if let Some(readme) = &ctx.readme {
        let truncated: String = readme.chars().take(README_MAX_CHARS).collect();
        msg.push_str(&format!("\nREADME:\n{truncated}\n"));
    }
    if let Some(instructions) = &ctx.custom_instructions {
        msg.push_str(&format!("\nProject instructions:\n{instructions}\n"));
    }
    if let Some(input) = user_input {
        msg.push_str(&format!("\nLatest user input (take this into account):\n{input}\n"));
    }
    msg
}

/// Produce the shell command for one step.
pub async fn generate_step_command(
    client: &dyn LlmClient,
    binding: &RoleBinding,
    ctx: &CoderContext,
) -> Result<StepCommandArtifact, LlmError> {
    if binding.provider == Provider::Static {
        return Ok(static_step_command(ctx));
    }

    let messages = vec![
        ChatMessage::system(CODER_SYSTEM_PROMPT),
        ChatMessage::user(coder_user_message(ctx)),
    ];
    let opts = ChatOptions { temperature: Some(0.1), max_tokens: Some(1024), json_mode: true };

    let outcome = client.chat(binding, &messages, &opts).await?;
    let block = extract_json_block(&outcome.content).unwrap_or(outcome.content.as_str());
    let wire: StepCommandWire = serde_json::from_str(block)
        .map_err(|e| LlmError::Parse(format!("coder reply: {e}")))?;
    if wire.command.trim().is_empty() {
        return Err(LlmError::Parse("coder reply had an empty command".to_string()));
    }

    Ok(StepCommandArtifact {
        command: wire.command,
        reasoning: wire.reasoning,
        background: wire.background,
        ready_pattern: wire.ready_pattern,
        usage: outcome.usage(),
    })
}

fn coder_user_message(ctx: &CoderContext) -> String {
    let mut msg = format!(
        "Mission goal: {}\n\nCurrent step ({} of {}): {}\n\nPlan:\n",
        ctx.goal,
        ctx.step_index + 1,
        ctx.step_total,
        ctx.step_description
    );
    for (i, (description, status)) in ctx.plan_overview.iter().enumerate() {
        let marker = if i == ctx.step_index { "→" } else { " " };
        msg.push_str(&format!("{marker} {}. [{status}] {description}\n", i + 1));
    }
    if !ctx.previous_outputs.is_empty() {
        msg.push_str("\nPrevious step outputs:\n");
        for output in &ctx.previous_outputs {
            msg.push_str(output);
            msg.push('\n');
        }
    }
    if let Some(tree) = &ctx.file_tree {
        msg.push_str(&format!("\nFile tree:\n{tree}\n"));
    }
    if let Some(pkg) = &ctx.package_json {
        msg.push_str(&format!("\npackage.json:\n{pkg}\n"));
    }
    if let Some(feedback) = &ctx.guard_feedback {
        msg.push_str(&format!("\nThe command guard rejected a previous attempt:\n{feedback}\n"));
    }
    if let Some(hint) = &ctx.user_hint {
        msg.push_str(&format!("\nUser hint:\n{hint}\n"));
    }
    if let Some(analysis) = &ctx.troubleshooter_analysis {
        msg.push_str(&format!("\nTroubleshooter analysis of the last failure:\n{analysis}\n"));
    }
    msg
}

/// Analyse a failed step; returns the plain-text strategy and token usage.
pub async fn analyze_failure(
    client: &dyn LlmClient,
    binding: &RoleBinding,
    goal: &str,
    step_description: &str,
    command: &str,
    exit_code: i64,
    combined_output: &str,
) -> Result<(String, TokenUsage), LlmError> {
    if binding.provider == Provider::Static {
        return Ok((
            "The command exited non-zero; read the tail of stderr for the direct cause. \
             Check that every file and script the command references actually exists. \
             If the failure is environmental, retry with a simpler, more explicit command."
                .to_string(),
            TokenUsage::default(),
        ));
    }

    let tail_start = combined_output
        .len()
        .saturating_sub(FAILURE_OUTPUT_MAX_CHARS);
    let tail = &combined_output[floor_char_boundary(combined_output, tail_start)..];
    let user = format!(
        "Mission goal: {goal}\nStep: {step_description}\nFailed command: {command}\nExit code: {exit_code}\n\nOutput tail:\n{tail}"
    );
    let messages = vec![
        ChatMessage::system(TROUBLESHOOTER_SYSTEM_PROMPT),
        ChatMessage::user(user),
    ];
    let opts = ChatOptions { temperature: Some(0.3), max_tokens: Some(512), json_mode: false };

    let outcome = client.chat(binding, &messages, &opts).await?;
    let usage = outcome.usage();
    Ok((outcome.content.trim().to_string(), usage))
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index.min(s.len())
}

// ── Static fallback ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct PackageJsonScripts {
    #[serde(default)]
    scripts: std::collections::BTreeMap<String, String>,
}

/// Heuristic plan used when no API key is configured: scaffold or verify,
/// then run whichever of lint/test/build the repo's `package.json` defines.
fn static_plan(goal: &str, ctx: &RepoContext) -> PlanArtifact {
    let scripts = ctx
        .package_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<PackageJsonScripts>(raw).ok())
        .unwrap_or_default()
        .scripts;

    let mut steps: Vec<PlanStepDraft> = Vec::new();
    let mut push = |description: String, retryable: bool| {
        steps.push(PlanStepDraft {
            description,
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            retryable,
            background: false,
            ready_pattern: None,
        });
    };

    if ctx.repo_present {
        push("Install project dependencies".to_string(), true);
        push(format!("Implement the requested change: {goal}"), false);
        if scripts.contains_key("lint") {
            push("Run the lint script and fix any findings".to_string(), false);
        }
        if scripts.contains_key("test") {
            push("Run the test suite".to_string(), false);
        }
        if scripts.contains_key("build") {
            push("Build the project".to_string(), false);
        }
    } else {
        push("Scaffold a package.json and source layout for the project".to_string(), false);
        push(format!("Implement the requested change: {goal}"), false);
        push("Smoke-test the implementation".to_string(), false);
    }
    push("Review the changes and produce final diff".to_string(), false);
    steps.truncate(8);

    PlanArtifact {
        reasoning: "No AI provider is configured; planned heuristically from the repository layout."
            .to_string(),
        steps,
        usage: TokenUsage::default(),
        provider: Provider::Static.as_str().to_string(),
        model: Provider::Static.default_model().to_string(),
    }
}

/// Keyless coder: map the step description onto a safe, non-interactive
/// command.
fn static_step_command(ctx: &CoderContext) -> StepCommandArtifact {
    let description = ctx.step_description.to_lowercase();
    let command = if description.contains("install") {
        "npm install --no-audit --no-fund".to_string()
    } else if description.contains("lint") {
        "npm run lint --if-present".to_string()
    } else if description.contains("test") {
        "npm test --if-present".to_string()
    } else if description.contains("build") {
        "npm run build --if-present".to_string()
    } else if description.contains("diff") || description.contains("review") {
        "git add -A . && git status --short".to_string()
    } else {
        format!(
            "echo \"Manual step (no AI provider configured): {}\"",
            ctx.step_description.replace('"', "'")
        )
    };

    StepCommandArtifact {
        command,
        reasoning: "Derived heuristically from the step description.".to_string(),
        background: false,
        ready_pattern: None,
        usage: TokenUsage::default(),
    }
}
