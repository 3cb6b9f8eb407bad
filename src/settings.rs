//! Per-project settings consumed by the core.
//!
//! Settings live in the store as key/value rows (`ai`, `execution`,
//! `prompts`) with JSON values; this module gives them typed shapes. Unknown
//! keys are ignored so the CRUD layer can grow its own without breaking us.

use serde::{Deserialize, Serialize};

use crate::llm::Role;

/// Credentials and model choice for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Per-role provider/model override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The `ai` settings key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    /// Global provider name: `openai`, `anthropic`, `google`, `groq`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub openai: ProviderSettings,
    #[serde(default)]
    pub anthropic: ProviderSettings,
    #[serde(default)]
    pub google: ProviderSettings,
    #[serde(default)]
    pub groq: ProviderSettings,
    #[serde(default)]
    pub roles: RoleOverrides,
}

/// Role override table. Roles the core never calls directly (`reviewer`,
/// `thinker`) are still recognised so the settings blob round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<RoleOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coder: Option<RoleOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<RoleOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinker: Option<RoleOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<RoleOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub troubleshooter: Option<RoleOverride>,
}

impl AiSettings {
    pub fn role_override(&self, role: Role) -> Option<&RoleOverride> {
        match role {
            Role::Planner => self.roles.planner.as_ref(),
            Role::Coder => self.roles.coder.as_ref(),
            Role::Reviewer => self.roles.reviewer.as_ref(),
            Role::Thinker => self.roles.thinker.as_ref(),
            Role::Guard => self.roles.guard.as_ref(),
            Role::Troubleshooter => self.roles.troubleshooter.as_ref(),
        }
    }

    pub fn provider_settings(&self, provider: &str) -> &ProviderSettings {
        match provider {
            "anthropic" => &self.anthropic,
            "google" => &self.google,
            "groq" => &self.groq,
            _ => &self.openai,
        }
    }
}

/// Container resource caps under `execution.docker`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Fractional CPUs, e.g. 1.5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

/// Command guard toggles under `execution.commandGuard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandGuardSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub block_destructive: bool,
    #[serde(default = "default_true")]
    pub block_hanging: bool,
    #[serde(default = "default_true")]
    pub block_network_exfil: bool,
    #[serde(default = "default_true")]
    pub block_privilege_esc: bool,
    #[serde(default = "default_true")]
    pub block_shell_injection: bool,
    #[serde(default)]
    pub custom_deny_patterns: Vec<String>,
    #[serde(default)]
    pub custom_allow_patterns: Vec<String>,
    #[serde(default)]
    pub ai_review: bool,
}

impl Default for CommandGuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            block_destructive: true,
            block_hanging: true,
            block_network_exfil: true,
            block_privilege_esc: true,
            block_shell_injection: true,
            custom_deny_patterns: Vec::new(),
            custom_allow_patterns: Vec::new(),
            ai_review: false,
        }
    }
}

/// The `execution` settings key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_sandbox: Option<bool>,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub command_guard: CommandGuardSettings,
}

/// Optional planner prompt override under `prompts.planner.content`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// The `prompts` settings key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSettings {
    #[serde(default)]
    pub planner: PromptOverride,
}

/// All settings the core reads for one project.
#[derive(Debug, Clone, Default)]
pub struct ProjectSettings {
    pub ai: AiSettings,
    pub execution: ExecutionSettings,
    pub prompts: PromptSettings,
}

fn default_true() -> bool {
    true
}
