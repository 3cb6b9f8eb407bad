//! HTTP provider back-ends.
//!
//! One `reqwest` client multiplexed over the OpenAI-compatible endpoint
//! (OpenAI, Groq), the Anthropic Messages API and the Google Generative
//! Language API. The static provider never reaches this module.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    ChatMessage, ChatOptions, ChatOutcome, LlmClient, LlmError, MessageRole, Provider, RoleBinding,
};

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GROQ_BASE: &str = "https://api.groq.com/openai/v1";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1";
const GOOGLE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

pub struct HttpLlmClient {
    http: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with static configuration");
        Self { http }
    }
}

impl Default for HttpLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(
        &self,
        binding: &RoleBinding,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let key = binding
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::MissingApiKey(binding.provider.as_str().to_string()))?;

        match binding.provider {
            Provider::OpenAi => {
                self.chat_openai_compatible(OPENAI_BASE, key, binding, messages, opts)
                    .await
            }
            Provider::Groq => {
                self.chat_openai_compatible(GROQ_BASE, key, binding, messages, opts)
                    .await
            }
            Provider::Anthropic => self.chat_anthropic(key, binding, messages, opts).await,
            Provider::Google => self.chat_google(key, binding, messages, opts).await,
            Provider::Static => Err(LlmError::StaticChat(binding.role.as_str().to_string())),
        }
    }
}

// ── OpenAI-compatible (OpenAI, Groq) ─────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OaChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OaResponse {
    choices: Vec<OaChoice>,
    #[serde(default)]
    usage: Option<OaUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaChoice {
    message: OaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OaResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OaUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl HttpLlmClient {
    async fn chat_openai_compatible(
        &self,
        base: &str,
        key: &str,
        binding: &RoleBinding,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let wire_messages: Vec<OaChatMessage<'_>> = messages
            .iter()
            .map(|m| OaChatMessage {
                role: match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let mut body = json!({
            "model": binding.model,
            "messages": wire_messages,
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = opts.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if opts.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .http
            .post(format!("{base}/chat/completions"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let parsed: OaResponse = read_json(response).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("response had no message content".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatOutcome {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            model: parsed.model.unwrap_or_else(|| binding.model.clone()),
            provider: binding.provider.as_str().to_string(),
        })
    }
}

// ── Anthropic Messages ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl HttpLlmClient {
    async fn chat_anthropic(
        &self,
        key: &str,
        binding: &RoleBinding,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        // Anthropic takes the system prompt out-of-band.
        let system: String = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                json!({
                    "role": if m.role == MessageRole::Assistant { "assistant" } else { "user" },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": binding.model,
            "max_tokens": opts.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }

        let response = self
            .http
            .post(format!("{ANTHROPIC_BASE}/messages"))
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let parsed: AnthropicResponse = read_json(response).await?;

        let content: String = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(LlmError::Parse("response had no text blocks".to_string()));
        }
        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatOutcome {
            content,
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
            model: parsed.model.unwrap_or_else(|| binding.model.clone()),
            provider: binding.provider.as_str().to_string(),
        })
    }
}

// ── Google Generative Language ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    usage_metadata: Option<GoogleUsage>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl HttpLlmClient {
    async fn chat_google(
        &self,
        key: &str,
        binding: &RoleBinding,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let system: String = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                json!({
                    "role": if m.role == MessageRole::Assistant { "model" } else { "user" },
                    "parts": [{ "text": m.content }],
                })
            })
            .collect();

        let mut generation_config = json!({});
        if let Some(t) = opts.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(max) = opts.max_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if opts.json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let url = format!(
            "{GOOGLE_BASE}/models/{}:generateContent?key={key}",
            binding.model
        );
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        let parsed: GoogleResponse = read_json(response).await?;

        let content: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| LlmError::Parse("response had no candidates".to_string()))?;
        let usage = parsed.usage_metadata.unwrap_or_default();

        Ok(ChatOutcome {
            content,
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
            model: binding.model.clone(),
            provider: binding.provider.as_str().to_string(),
        })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, LlmError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LlmError::Http(e.to_string()))?;
    if !status.is_success() {
        return Err(LlmError::Api { status: status.as_u16(), body });
    }
    serde_json::from_str(&body).map_err(|e| LlmError::Parse(format!("{e}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_response_shape_parses() {
        let raw = r#"{
            "model": "gpt-5.2",
            "choices": [{ "message": { "role": "assistant", "content": "{\"ok\":true}" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        }"#;
        let parsed: OaResponse = serde_json::from_str(raw).expect("openai shape parses");
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{\"ok\":true}"));
        assert_eq!(parsed.usage.expect("usage").total_tokens, 15);
    }

    #[test]
    fn anthropic_response_shape_parses() {
        let raw = r#"{
            "model": "claude-sonnet-4-20250514",
            "content": [{ "type": "text", "text": "three sentences." }],
            "usage": { "input_tokens": 50, "output_tokens": 9 }
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).expect("anthropic shape parses");
        assert_eq!(parsed.content[0].text.as_deref(), Some("three sentences."));
        assert_eq!(parsed.usage.expect("usage").input_tokens, 50);
    }

    #[test]
    fn google_response_shape_parses() {
        let raw = r#"{
            "candidates": [{ "content": { "parts": [{ "text": "hello" }], "role": "model" } }],
            "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 2, "totalTokenCount": 9 }
        }"#;
        let parsed: GoogleResponse = serde_json::from_str(raw).expect("google shape parses");
        let text = parsed.candidates[0]
            .content
            .as_ref()
            .and_then(|c| c.parts[0].text.as_deref());
        assert_eq!(text, Some("hello"));
        assert_eq!(parsed.usage_metadata.expect("usage").total_token_count, 9);
    }
}
