use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use serde::Deserialize;

use super::{parse_args, Tool, ToolContext, ToolRegistry};
use crate::{run_tool_loop, ChatMessage, InboundMessage, LlmProvider};

const SUBAGENT_MAX_ITERATIONS: usize = 15;
const LABEL_CHARS: usize = 30;

#[derive(Debug, Deserialize)]
struct SpawnArgs {
    task: String,
    #[serde(default)]
    label: Option<String>,
}

/// Runs a task on its own thread with a reduced tool set and reports back through the
/// bus as a `system` inbound message addressed to the originating chat.
pub(crate) struct SpawnTool {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    tools: ToolRegistry,
    workspace: PathBuf,
}

impl SpawnTool {
    /// `tools` must not contain `message` or `spawn`.
    pub(crate) fn new(
        provider: Arc<dyn LlmProvider>,
        model: Option<String>,
        tools: ToolRegistry,
        workspace: PathBuf,
    ) -> Self {
        Self {
            provider,
            model,
            tools,
            workspace,
        }
    }

    fn system_prompt(&self, task: &str) -> String {
        format!(
            "# Subagent\n\n\
             You are a subagent spawned by the main agent to complete one task.\n\n\
             ## Your Task\n{task}\n\n\
             ## Rules\n\
             1. Stay focused on the assigned task and nothing else\n\
             2. Your final response is reported back to the main agent\n\
             3. Do not start side tasks or hold a conversation\n\
             4. Be concise but informative in your findings\n\n\
             You can read and write files in the workspace, run shell commands, search and fetch web pages.\n\
             You cannot message the user directly or spawn other subagents.\n\n\
             ## Workspace\n{}",
            self.workspace.display()
        )
    }
}

fn short_label(task: &str) -> String {
    let short: String = task.chars().take(LABEL_CHARS).collect();
    if task.chars().count() > LABEL_CHARS {
        format!("{short}...")
    } else {
        short
    }
}

fn new_task_id(task: &str) -> String {
    let seed = format!("{task}:{}:{:?}", crate::now_ms(), thread::current().id());
    blake3::hash(seed.as_bytes()).to_hex()[..8].to_string()
}

/// The inbound message that carries a finished subagent's result back to the agent.
pub(crate) fn subagent_announcement(label: &str, task: &str, result: &str, channel: &str, chat_id: &str) -> InboundMessage {
    let content = format!(
        "[Subagent '{label}' completed]\n\nTask: {task}\n\nResult:\n{result}\n\n\
         Summarize this naturally for the user. Keep it brief (1-2 sentences). \
         Do not mention technical details like \"subagent\" or task IDs."
    );
    InboundMessage::new("system", "subagent", &format!("{channel}:{chat_id}"), &content)
}

impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use this for complex or \
         time-consuming tasks that can run independently. The subagent will complete the \
         task and report back when done."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task for the subagent to complete"},
                "label": {"type": "string", "description": "Optional short label for the task (for display)"}
            },
            "required": ["task"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: SpawnArgs = parse_args(args)?;
        let Some(bus) = ctx.bus.clone() else {
            return Err("Error: Background tasks not available".into());
        };
        let label = parsed
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| short_label(&parsed.task));
        let id = new_task_id(&parsed.task);

        let provider = self.provider.clone();
        let model = self.model.clone();
        let tools = self.tools.clone();
        let system = self.system_prompt(&parsed.task);
        let task = parsed.task;
        let sub_ctx = ToolContext::new(&ctx.channel, &ctx.chat_id).with_memory(ctx.memory.clone());
        let (channel, chat_id) = (ctx.channel.clone(), ctx.chat_id.clone());
        let thread_label = label.clone();
        let thread_id = id.clone();

        thread::Builder::new()
            .name(format!("subagent-{id}"))
            .spawn(move || {
                tracing::info!(target: "subagent", id = %thread_id, label = %thread_label, "started");
                let mut messages = vec![ChatMessage::system(&system), ChatMessage::user(&task)];
                let outcome = run_tool_loop(
                    provider.as_ref(),
                    model.as_deref(),
                    &tools,
                    &mut messages,
                    &sub_ctx,
                    SUBAGENT_MAX_ITERATIONS,
                );
                let result = outcome
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| "Task completed but no final response was generated.".into());
                tracing::info!(
                    target: "subagent",
                    id = %thread_id,
                    iterations = outcome.iterations,
                    tools = ?outcome.tools_used,
                    "finished"
                );
                if !bus.publish_inbound(subagent_announcement(&thread_label, &task, &result, &channel, &chat_id)) {
                    tracing::warn!(target: "subagent", id = %thread_id, "bus closed before result was announced");
                }
            })
            .map_err(|e| format!("Error: could not start subagent: {e}"))?;

        Ok(format!(
            "Subagent [{label}] started (id: {id}). I'll notify you when it completes."
        ))
    }
}
