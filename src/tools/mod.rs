//! Tool trait, per-call context and the name-keyed registry the agent dispatches through.

mod fs;
mod memory;
mod message;
mod reminder;
mod screenshot;
mod search;
mod shell;
mod spawn;
mod web;

#[allow(unused_imports)]
pub(crate) use fs::*;
#[allow(unused_imports)]
pub(crate) use memory::*;
#[allow(unused_imports)]
pub(crate) use message::*;
#[allow(unused_imports)]
pub(crate) use reminder::*;
#[allow(unused_imports)]
pub(crate) use screenshot::*;
#[allow(unused_imports)]
pub(crate) use search::*;
#[allow(unused_imports)]
pub(crate) use shell::*;
#[allow(unused_imports)]
pub(crate) use spawn::*;
#[allow(unused_imports)]
pub(crate) use web::*;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{LazyMemory, MessageBus, ToolDefinition};

/// Per-call context. Tools never keep channel state between calls.
#[derive(Clone, Default)]
pub(crate) struct ToolContext {
    pub(crate) channel: String,
    pub(crate) chat_id: String,
    pub(crate) memory: Option<Arc<LazyMemory>>,
    pub(crate) bus: Option<MessageBus>,
}

impl ToolContext {
    pub(crate) fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn with_memory(mut self, memory: Option<Arc<LazyMemory>>) -> Self {
        self.memory = memory;
        self
    }

    pub(crate) fn with_bus(mut self, bus: Option<MessageBus>) -> Self {
        self.bus = bus;
        self
    }
}

pub(crate) trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn parameters(&self) -> serde_json::Value;
    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Deserialize tool arguments into a typed struct.
pub(crate) fn parse_args<T: DeserializeOwned>(args: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(args.clone()).map_err(|e| format!("args: {e}"))
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Check `args` against the top level of a tool schema. Returns every problem found.
pub(crate) fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = args.as_object() else {
        errors.push("parameters must be an object".to_string());
        return errors;
    };
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                errors.push(format!("missing required {key}"));
            }
        }
    }
    let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
        return errors;
    };
    for (key, value) in obj {
        let Some(prop) = properties.get(key) else {
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(|v| v.as_str()) {
            if !type_matches(expected, value) {
                errors.push(format!("{key} should be {expected}"));
                continue;
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(|v| v.as_array()) {
            if !allowed.contains(value) {
                errors.push(format!("{key} must be one of {}", serde_json::Value::Array(allowed.clone())));
            }
        }
    }
    errors
}

/// Tools keyed by name, kept in registration order for stable definitions.
#[derive(Default, Clone)]
pub(crate) struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier tool in place.
    pub(crate) fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.by_name.get(&name) {
            Some(&idx) => self.tools[idx] = tool,
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| self.tools[idx].clone())
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.tools.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub(crate) fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Run a tool by name. Every failure, including a panic inside the tool, comes back
    /// as an `Error: …` string.
    pub(crate) fn execute(&self, name: &str, args: &serde_json::Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.get(name) else {
            return format!("Error: Tool '{name}' not found");
        };
        let problems = validate_args(&tool.parameters(), args);
        if !problems.is_empty() {
            return format!("Error: Invalid parameters for tool '{name}': {}", problems.join("; "));
        }
        match catch_unwind(AssertUnwindSafe(|| tool.execute(args, ctx))) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.starts_with("Error") => err,
            Ok(Err(err)) => format!("Error: {err}"),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(target: "tools", tool = name, panic = %detail, "tool panicked");
                format!("Error executing {name}: {detail}")
            }
        }
    }
}
