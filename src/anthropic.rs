use crate::{
    describe_http_error, http_agent, post_json_with_retry, strip_provider_prefix, ChatMessage, LlmProvider,
    LlmResponse, RetryPolicy, ToolCall, ToolDefinition,
};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub(crate) const ANTHROPIC_TIMEOUT_SECS: u64 = 120;

pub(crate) fn collect_system_blocks(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == "system")
        .filter_map(|m| m.content.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Convert chat history to Messages API turns. Consecutive tool results are
/// batched into a single user turn, as the API requires.
pub(crate) fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    let mut pending_results: Vec<serde_json::Value> = Vec::new();

    for msg in messages {
        if msg.role == "system" {
            continue;
        }
        if msg.role != "tool" && !pending_results.is_empty() {
            out.push(serde_json::json!({"role": "user", "content": std::mem::take(&mut pending_results)}));
        }
        match msg.role.as_str() {
            "user" => {
                let text = msg.content.clone().unwrap_or_default();
                let mut blocks: Vec<serde_json::Value> = msg
                    .images
                    .iter()
                    .map(|image| {
                        serde_json::json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.media_type,
                                "data": image.data
                            }
                        })
                    })
                    .collect();
                blocks.push(serde_json::json!({"type": "text", "text": text}));
                out.push(serde_json::json!({"role": "user", "content": blocks}));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(content) = msg.content.as_deref().filter(|c| !c.is_empty()) {
                    blocks.push(serde_json::json!({"type": "text", "text": content}));
                }
                for call in &msg.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": ""}));
                }
                out.push(serde_json::json!({"role": "assistant", "content": blocks}));
            }
            "tool" => {
                let Some(tool_id) = msg.tool_call_id.clone() else {
                    continue;
                };
                let mut block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_id,
                    "content": msg.content.clone().unwrap_or_default()
                });
                if msg.is_error {
                    block["is_error"] = serde_json::json!(true);
                }
                pending_results.push(block);
            }
            _ => {}
        }
    }
    if !pending_results.is_empty() {
        out.push(serde_json::json!({"role": "user", "content": pending_results}));
    }
    out
}

pub(crate) fn to_anthropic_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|tool| {
            serde_json::json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters
            })
        })
        .collect()
}

pub(crate) fn parse_anthropic_response(payload: &serde_json::Value) -> Result<LlmResponse, String> {
    let content = payload
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or("Anthropic response missing content")?;
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(text.to_string());
                }
            }
            "tool_use" => {
                let field = |key: &str| block.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
                tool_calls.push(ToolCall {
                    id: field("id"),
                    name: field("name"),
                    arguments: block.get("input").cloned().unwrap_or_else(|| serde_json::json!({})),
                });
            }
            _ => {}
        }
    }

    let usage = payload.get("usage").map(|usage| {
        let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        serde_json::json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output
        })
    });
    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.concat())
    };

    Ok(LlmResponse {
        content,
        tool_calls,
        finish_reason: payload
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string(),
        usage,
    })
}

pub(crate) struct AnthropicProvider {
    api_key: String,
    url: String,
    model: String,
    max_tokens: u64,
    temperature: f64,
    agent: ureq::Agent,
}

impl AnthropicProvider {
    pub(crate) fn new(
        api_key: String,
        api_base: Option<String>,
        model: String,
        max_tokens: u64,
        temperature: f64,
    ) -> Self {
        let base = api_base.unwrap_or_else(|| ANTHROPIC_API_BASE.to_string());
        Self {
            api_key,
            url: messages_url(&base),
            model,
            max_tokens,
            temperature,
            agent: http_agent(ANTHROPIC_TIMEOUT_SECS),
        }
    }

    pub(crate) fn build_payload(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: Option<&str>,
    ) -> serde_json::Value {
        let model = strip_provider_prefix(model.unwrap_or(&self.model), "anthropic");
        let mut payload = serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": to_anthropic_messages(messages),
        });
        let system_blocks = collect_system_blocks(messages);
        if !system_blocks.is_empty() {
            payload["system"] = serde_json::json!(system_blocks.join("\n\n"));
        }
        if !tools.is_empty() {
            payload["tools"] = serde_json::json!(to_anthropic_tools(tools));
        }
        payload
    }
}

/// Accepts either a bare host (`https://api.anthropic.com`) or a full `/v1/messages` URL.
fn messages_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/messages") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> String {
        self.model.clone()
    }

    fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition], model: Option<&str>) -> LlmResponse {
        let payload = self.build_payload(messages, tools, model);
        let headers = [("x-api-key", self.api_key.as_str()), ("anthropic-version", ANTHROPIC_VERSION)];
        let body = match post_json_with_retry(
            &self.agent,
            &self.url,
            &headers,
            &payload,
            RetryPolicy::default(),
            "anthropic",
        ) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(target: "anthropic", error = %e, "chat request failed");
                return LlmResponse::error(describe_http_error("Anthropic", &e, ANTHROPIC_TIMEOUT_SECS));
            }
        };
        parse_anthropic_response(&body).unwrap_or_else(|e| {
            tracing::error!(target: "anthropic", error = %e, "unexpected response shape");
            LlmResponse::error(format!("Error calling Anthropic API: {e}"))
        })
    }
}
