use crate::{
    describe_http_error, http_agent, post_json_with_retry, strip_provider_prefix, ChatMessage, LlmProvider,
    LlmResponse, RetryPolicy, ToolCall, ToolDefinition,
};

pub(crate) const OPENAI_TIMEOUT_SECS: u64 = 120;

/// Default chat base URL per OpenAI-compatible vendor.
pub(crate) fn default_api_base(vendor: &str) -> Option<&'static str> {
    match vendor {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        _ => None,
    }
}

fn display_vendor(vendor: &str) -> String {
    match vendor {
        "openai" => "OpenAI".to_string(),
        "openrouter" => "OpenRouter".to_string(),
        "groq" => "Groq".to_string(),
        "gemini" => "Gemini".to_string(),
        "together" => "Together".to_string(),
        "zhipu" => "Zhipu".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn to_openai_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match msg.role.as_str() {
            "user" if !msg.images.is_empty() => {
                let mut parts: Vec<serde_json::Value> = msg
                    .images
                    .iter()
                    .map(|image| {
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{};base64,{}", image.media_type, image.data)}
                        })
                    })
                    .collect();
                parts.push(serde_json::json!({"type": "text", "text": msg.content.clone().unwrap_or_default()}));
                serde_json::json!({"role": "user", "content": parts})
            }
            "assistant" if !msg.tool_calls.is_empty() => {
                let calls: Vec<serde_json::Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments.to_string()}
                        })
                    })
                    .collect();
                serde_json::json!({"role": "assistant", "content": msg.content, "tool_calls": calls})
            }
            "tool" => serde_json::json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "name": msg.name,
                "content": msg.content.clone().unwrap_or_default()
            }),
            role => serde_json::json!({"role": role, "content": msg.content.clone().unwrap_or_default()}),
        })
        .collect()
}

pub(crate) fn to_openai_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|tool| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            })
        })
        .collect()
}

/// Tool arguments arrive as a JSON string; malformed ones become `{}`.
fn parse_arguments(raw: Option<&serde_json::Value>) -> serde_json::Value {
    match raw {
        Some(serde_json::Value::String(text)) if text.trim().is_empty() => serde_json::json!({}),
        Some(serde_json::Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|e| {
            tracing::warn!(target: "openai", error = %e, "tool arguments were not valid JSON");
            serde_json::json!({})
        }),
        Some(value @ serde_json::Value::Object(_)) => value.clone(),
        _ => serde_json::json!({}),
    }
}

pub(crate) fn parse_openai_response(payload: &serde_json::Value) -> Result<LlmResponse, String> {
    let choice = payload
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .ok_or("response missing choices")?;
    let message = choice.get("message").ok_or("response choice missing message")?;

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    let function = call.get("function");
                    ToolCall {
                        id: call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments: parse_arguments(function.and_then(|f| f.get("arguments"))),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        content: message
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        tool_calls,
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string(),
        usage: payload.get("usage").cloned(),
    })
}

/// Chat completions against any OpenAI-compatible endpoint.
pub(crate) struct OpenAiCompatProvider {
    vendor: String,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u64,
    temperature: f64,
    agent: ureq::Agent,
}

impl OpenAiCompatProvider {
    pub(crate) fn for_vendor(
        vendor: &str,
        api_key: String,
        api_base: Option<String>,
        model: String,
        max_tokens: u64,
        temperature: f64,
    ) -> Result<Self, String> {
        let api_base = api_base
            .or_else(|| default_api_base(vendor).map(str::to_string))
            .ok_or_else(|| format!("provider '{vendor}' needs an api_base"))?;
        Ok(Self {
            vendor: vendor.to_string(),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            max_tokens,
            temperature,
            agent: http_agent(OPENAI_TIMEOUT_SECS),
        })
    }

    /// OpenRouter routes on the full `vendor/model` name; everyone else wants it bare.
    fn wire_model(&self, model: Option<&str>) -> String {
        let model = model.unwrap_or(&self.model);
        if self.vendor == "openrouter" {
            model.to_string()
        } else {
            strip_provider_prefix(model, &self.vendor)
        }
    }

    pub(crate) fn build_payload(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: Option<&str>,
    ) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "model": self.wire_model(model),
            "messages": to_openai_messages(messages),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            payload["tools"] = serde_json::json!(to_openai_tools(tools));
        }
        payload
    }
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.vendor
    }

    fn default_model(&self) -> String {
        self.model.clone()
    }

    fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition], model: Option<&str>) -> LlmResponse {
        let vendor = display_vendor(&self.vendor);
        let url = format!("{}/chat/completions", self.api_base);
        let auth = format!("Bearer {}", self.api_key);
        let payload = self.build_payload(messages, tools, model);
        let body = match post_json_with_retry(
            &self.agent,
            &url,
            &[("authorization", &auth)],
            &payload,
            RetryPolicy::default(),
            &self.vendor,
        ) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(target: "openai", vendor = %self.vendor, error = %e, "chat request failed");
                return LlmResponse::error(describe_http_error(&vendor, &e, OPENAI_TIMEOUT_SECS));
            }
        };
        parse_openai_response(&body).unwrap_or_else(|e| {
            tracing::error!(target: "openai", vendor = %self.vendor, error = %e, "unexpected response shape");
            LlmResponse::error(format!("Error calling {vendor} API: {e}"))
        })
    }
}
