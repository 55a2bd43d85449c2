//! Provider-neutral chat types and the `LlmProvider` capability.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AnthropicProvider, FileConfig, HttpError, OpenAiCompatProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ImageAttachment {
    pub(crate) media_type: String,
    /// Base64 payload without the `data:` prefix.
    pub(crate) data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ToolCall {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub(crate) role: String,
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) images: Vec<ImageAttachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) is_error: bool,
}

impl ChatMessage {
    pub(crate) fn plain(role: &str, content: Option<String>) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            images: Vec::new(),
            is_error: false,
        }
    }

    pub(crate) fn system(content: &str) -> Self {
        Self::plain("system", Some(content.to_string()))
    }

    pub(crate) fn user(content: &str) -> Self {
        Self::plain("user", Some(content.to_string()))
    }

    pub(crate) fn user_with_images(content: &str, images: Vec<ImageAttachment>) -> Self {
        Self {
            images,
            ..Self::user(content)
        }
    }

    pub(crate) fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain("assistant", content)
        }
    }

    pub(crate) fn tool_result(call_id: &str, name: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            is_error: content.starts_with("Error"),
            ..Self::plain("tool", Some(content.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ToolDefinition {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct LlmResponse {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Vec<ToolCall>,
    pub(crate) finish_reason: String,
    pub(crate) usage: Option<serde_json::Value>,
}

impl LlmResponse {
    pub(crate) fn text(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            finish_reason: "stop".to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn error(message: String) -> Self {
        Self {
            content: Some(message),
            finish_reason: "error".to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub(crate) fn is_error(&self) -> bool {
        self.finish_reason == "error"
    }
}

/// Chat completion with tool calling. Implementations never fail outward:
/// transport and status problems come back as `finish_reason == "error"`.
pub(crate) trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn default_model(&self) -> String;
    fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition], model: Option<&str>) -> LlmResponse;
}

/// Render an HTTP failure the way users see it in chat.
pub(crate) fn describe_http_error(vendor: &str, err: &HttpError, timeout_secs: u64) -> String {
    match err {
        HttpError::Status { code: 401 | 403, .. } => {
            format!("{vendor} API authentication failed. Check your API key.")
        }
        HttpError::Status { code: 429, .. } => {
            format!("{vendor} API rate limit exceeded. Please try again later.")
        }
        HttpError::Status { body, .. } => format!("{vendor} API error: {body}"),
        e if e.is_timeout() => format!("{vendor} API timeout after {timeout_secs}s"),
        other => format!("Error calling {vendor} API: {other}"),
    }
}

/// Strip a `provider/` routing prefix from a model name when it names `provider`.
pub(crate) fn strip_provider_prefix(model: &str, provider: &str) -> String {
    match model.split_once('/') {
        Some((prefix, rest)) if prefix.eq_ignore_ascii_case(provider) => rest.to_string(),
        _ => model.to_string(),
    }
}

/// Build a provider by name using the keys and bases in `config`.
pub(crate) fn build_provider(config: &FileConfig, name: &str) -> Result<Arc<dyn LlmProvider>, String> {
    let api_key = config
        .api_key_for(name)
        .ok_or_else(|| format!("no API key configured for provider '{name}'"))?;
    let settings = config.provider(name).cloned().unwrap_or_default();
    let model = settings.model.clone().unwrap_or_else(|| config.agent.model.clone());

    if name == "anthropic" {
        return Ok(Arc::new(AnthropicProvider::new(
            api_key,
            settings.api_base.clone(),
            strip_provider_prefix(&model, "anthropic"),
            config.agent.max_tokens,
            config.agent.temperature,
        )));
    }
    let provider = OpenAiCompatProvider::for_vendor(
        name,
        api_key,
        settings.api_base.clone(),
        model,
        config.agent.max_tokens,
        config.agent.temperature,
    )?;
    Ok(Arc::new(provider))
}

/// The agent's main provider, picked by `FileConfig::resolve_provider`.
pub(crate) fn build_default_provider(config: &FileConfig) -> Result<Arc<dyn LlmProvider>, String> {
    let name = config
        .resolve_provider()
        .ok_or("No LLM provider configured. Add an API key under providers in config.json")?;
    build_provider(config, &name)
}
