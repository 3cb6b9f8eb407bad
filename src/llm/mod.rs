//! LLM role gateway.
//!
//! A uniform chat contract over multiple provider back-ends. Callers resolve
//! a [`Role`] to a [`RoleBinding`] (provider + model + key) from project
//! settings, then go through the [`LlmClient`] trait so tests can substitute
//! scripted responses.

pub mod artifacts;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TokenUsage;
use crate::settings::AiSettings;

pub use http::HttpLlmClient;

/// Named LLM persona with its own provider/model override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Coder,
    Reviewer,
    Thinker,
    Guard,
    Troubleshooter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Thinker => "thinker",
            Self::Guard => "guard",
            Self::Troubleshooter => "troubleshooter",
        }
    }
}

/// Provider back-ends the gateway can speak to. `Static` is the keyless
/// fallback that synthesises artefacts heuristically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Groq,
    Static,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Groq => "groq",
            Self::Static => "static",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            "groq" => Some(Self::Groq),
            "static" => Some(Self::Static),
            _ => None,
        }
    }

    /// Model used when the settings name a provider but no model.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-5.2",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Google => "gemini-2.5-flash",
            Self::Groq => "llama-3.3-70b-versatile",
            Self::Static => "static",
        }
    }
}

/// A resolved (provider, model, key) triple for one role.
#[derive(Debug, Clone)]
pub struct RoleBinding {
    pub role: Role,
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<String>,
}

/// Resolve a role to its binding: per-role override first, then the global
/// provider, then the static fallback when no API key is configured.
pub fn resolve_role(ai: &AiSettings, role: Role) -> RoleBinding {
    let override_provider = ai
        .role_override(role)
        .and_then(|o| o.provider.as_deref())
        .and_then(Provider::from_name);
    let global_provider = ai.provider.as_deref().and_then(Provider::from_name);

    let provider = override_provider.or(global_provider).unwrap_or(Provider::Static);
    if provider == Provider::Static {
        return RoleBinding {
            role,
            provider,
            model: provider.default_model().to_string(),
            api_key: None,
        };
    }

    let settings = ai.provider_settings(provider.as_str());
    let api_key = settings.api_key.clone().filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
        // A provider without a key degrades to the static fallback.
        return RoleBinding {
            role,
            provider: Provider::Static,
            model: Provider::Static.default_model().to_string(),
            api_key: None,
        };
    }

    let model = ai
        .role_override(role)
        .and_then(|o| o.model.clone())
        .or_else(|| settings.model.clone())
        .unwrap_or_else(|| provider.default_model().to_string());

    RoleBinding { role, provider, model, api_key }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One turn of a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Request structured JSON output where the provider supports it.
    pub json_mode: bool,
}

/// Result of one chat call, with token accounting.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: String,
    pub provider: String,
}

impl ChatOutcome {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            prompt: self.prompt_tokens,
            completion: self.completion_tokens,
            total: self.total_tokens,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No API key configured for provider {0}")]
    MissingApiKey(String),

    #[error("Provider request failed: {0}")]
    Http(String),

    #[error("Provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Could not parse provider response: {0}")]
    Parse(String),

    #[error("The static provider cannot serve chat for role {0}")]
    StaticChat(String),
}

/// Uniform chat entry point over all provider back-ends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        binding: &RoleBinding,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError>;
}

/// Extract the first balanced `{…}` block from free-form model output.
/// String-aware so braces inside JSON strings do not unbalance the scan.
/// Used for providers without a structured JSON mode.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ProviderSettings, RoleOverride};

    fn keyed_settings() -> AiSettings {
        AiSettings {
            provider: Some("openai".to_string()),
            openai: ProviderSettings {
                api_key: Some("sk-test".to_string()),
                model: None,
            },
            anthropic: ProviderSettings {
                api_key: Some("sk-ant".to_string()),
                model: Some("claude-custom".to_string()),
            },
            ..AiSettings::default()
        }
    }

    #[test]
    fn role_resolution_prefers_per_role_override() {
        let mut ai = keyed_settings();
        ai.roles.coder = Some(RoleOverride {
            provider: Some("anthropic".to_string()),
            model: None,
        });

        let coder = resolve_role(&ai, Role::Coder);
        assert_eq!(coder.provider, Provider::Anthropic);
        assert_eq!(coder.model, "claude-custom");

        let planner = resolve_role(&ai, Role::Planner);
        assert_eq!(planner.provider, Provider::OpenAi);
        assert_eq!(planner.model, "gpt-5.2");
    }

    #[test]
    fn missing_key_falls_back_to_static() {
        let ai = AiSettings {
            provider: Some("google".to_string()),
            ..AiSettings::default()
        };
        let binding = resolve_role(&ai, Role::Planner);
        assert_eq!(binding.provider, Provider::Static);
        assert!(binding.api_key.is_none());
    }

    #[test]
    fn no_provider_at_all_is_static() {
        let binding = resolve_role(&AiSettings::default(), Role::Troubleshooter);
        assert_eq!(binding.provider, Provider::Static);
    }

    #[test]
    fn json_extraction_finds_first_balanced_block() {
        let text = "Sure! Here is the plan:\n```json\n{\"a\": {\"b\": 1}, \"c\": \"}\"}\n```\ntrailing";
        let block = extract_json_block(text).expect("block found");
        assert_eq!(block, "{\"a\": {\"b\": 1}, \"c\": \"}\"}");
        assert!(extract_json_block("no json here").is_none());
        assert!(extract_json_block("{unterminated").is_none());
    }
}
