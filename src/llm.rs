//! Per-trader LLM oracle client (spec §4.4, §9). Each trader owns one
//! `LlmClient` instance built from its own config; there is no process-wide
//! client, so credentials never leak across tenants and a slow/broken
//! upstream for one trader cannot stall another.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::models::AiModel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

fn model_slug(model: AiModel, custom_override: Option<&str>) -> String {
    match model {
        AiModel::Qwen => "qwen/qwen-2.5-72b-instruct".to_string(),
        AiModel::Deepseek => "deepseek/deepseek-chat".to_string(),
        AiModel::Custom => custom_override.unwrap_or("openai/gpt-4o-mini").to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One trader's OpenAI-compatible chat-completions client.
pub struct LlmClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: AiModel, custom_model_override: Option<String>) -> Self {
        Self::with_base_url(
            api_key,
            model,
            custom_model_override,
            DEFAULT_BASE_URL.to_string(),
        )
    }

    pub fn with_base_url(
        api_key: String,
        model: AiModel,
        custom_model_override: Option<String>,
        base_url: String,
    ) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build LLM HTTP client");
        Self {
            http,
            api_key,
            base_url,
            model: model_slug(model, custom_model_override.as_deref()),
        }
    }

    /// Reads `NOFX_LLM_API_KEY` (or a per-trader override supplied by the
    /// caller) from the environment rather than from a global static, per
    /// the no-process-wide-client requirement.
    pub fn from_env(model: AiModel, custom_model_override: Option<String>) -> Result<Self, AppError> {
        let api_key = std::env::var("NOFX_LLM_API_KEY").map_err(|_| AppError::CredentialMissing {
            exchange: "llm".to_string(),
            detail: "NOFX_LLM_API_KEY not set".to_string(),
        })?;
        Ok(Self::new(api_key, model, custom_model_override))
    }

    pub async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmCallOutput, AppError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt.to_string(),
                },
            ],
            temperature: 0.3,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("LLM call failed")
                .to_string();
            return Err(AppError::VenueError {
                code: status.as_u16().to_string(),
                message,
            });
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AppError::ParseError(format!("LLM response decode: {e}")))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::ParseError("LLM response had no choices".into()))?;

        if text.trim().is_empty() {
            return Err(AppError::ParseError("LLM returned an empty reply".into()));
        }

        let (prompt_tokens, completion_tokens) = body
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(LlmCallOutput {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}
