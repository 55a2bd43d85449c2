use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    append_log_jsonl, env_optional, log_dir_path, summarize_result, AgentLogEntry, CancelReminderTool,
    ChatMessage, Collaborator, CommandHandler, CommandOutcome, ContextBuilder, CopyFileTool, CreateDirTool,
    CronJob, EditFileTool, ExecTool, FileConfig, GlobTool, GrepTool, InboundMessage, LazyMemory,
    ListDirTool, ListRemindersTool, LlmProvider, MemoryGetTool, MemoryListTool, MemorySearchTool,
    MemoryWriteTool, MessageBus, MessageTool, MoveFileTool, OutboundMessage, PayloadKind, ReadFileTool,
    RenameFileTool, Scheduler, ScreenshotTool, SessionManager, SetReminderTool, ShellGuard, SpawnTool,
    ToolContext, ToolRegistry, WebFetchTool, WebSearchTool, WorkspaceSandbox, WriteFileTool,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const NO_RESPONSE: &str = "I've completed processing but have no response to give.";
const BACKGROUND_DONE: &str = "Background task completed.";
const EMPTY_RESPONSE: &str = "Done.";

// ── Tool loop ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct ToolLoopOutcome {
    /// Final assistant text. `None` when the model gave none or the iteration cap was hit.
    pub(crate) content: Option<String>,
    pub(crate) iterations: usize,
    pub(crate) tools_used: Vec<String>,
}

/// Call the model until it answers without tool calls. Tool calls from one response run
/// sequentially in emission order, and each result is appended under its call id.
pub(crate) fn run_tool_loop(
    provider: &dyn LlmProvider,
    model: Option<&str>,
    tools: &ToolRegistry,
    messages: &mut Vec<ChatMessage>,
    ctx: &ToolContext,
    max_iterations: usize,
) -> ToolLoopOutcome {
    let definitions = tools.get_definitions();
    let mut outcome = ToolLoopOutcome::default();
    for iteration in 1..=max_iterations.max(1) {
        outcome.iterations = iteration;
        tracing::debug!(target: "agent", iteration, messages = messages.len(), "calling model");
        let response = provider.chat(messages, &definitions, model);
        if response.is_error() {
            tracing::warn!(
                target: "agent",
                provider = provider.name(),
                error = response.content.as_deref().unwrap_or(""),
                "model call failed"
            );
        }
        if !response.has_tool_calls() {
            outcome.content = response.content;
            return outcome;
        }
        messages.push(ChatMessage::assistant(response.content.clone(), response.tool_calls.clone()));
        for call in &response.tool_calls {
            tracing::debug!(target: "agent", tool = %call.name, args = %call.arguments, "executing tool");
            let result = tools.execute(&call.name, &call.arguments, ctx);
            outcome.tools_used.push(call.name.clone());
            messages.push(ChatMessage::tool_result(&call.id, &call.name, &result));
        }
    }
    tracing::warn!(target: "agent", max_iterations, "iteration cap reached");
    outcome.content = None;
    outcome
}

/// Everything the main agent can call. Sub-agents get the same set minus `message` and `spawn`.
pub(crate) fn default_tools(
    config: &FileConfig,
    provider: Arc<dyn LlmProvider>,
    scheduler: Option<Arc<dyn Scheduler>>,
    memory: Option<Arc<LazyMemory>>,
) -> ToolRegistry {
    let workspace = config.workspace_path();
    let restrict = config.tools.restrict_to_workspace;
    let sandbox = WorkspaceSandbox::new(Some(workspace.clone()), restrict);
    let mut tools = ToolRegistry::new();

    tools.register(Arc::new(ReadFileTool::new(sandbox.clone())));
    tools.register(Arc::new(WriteFileTool::new(sandbox.clone())));
    tools.register(Arc::new(EditFileTool::new(sandbox.clone())));
    tools.register(Arc::new(ListDirTool::new(sandbox.clone())));
    tools.register(Arc::new(RenameFileTool::new(sandbox.clone())));
    tools.register(Arc::new(MoveFileTool::new(sandbox.clone())));
    tools.register(Arc::new(CopyFileTool::new(sandbox.clone())));
    tools.register(Arc::new(CreateDirTool::new(sandbox.clone())));
    tools.register(Arc::new(GlobTool::new(sandbox.clone())));
    tools.register(Arc::new(GrepTool::new(sandbox)));

    let shell_cwd = env_optional("ICRON_SHELL_CWD")
        .map(PathBuf::from)
        .unwrap_or_else(|| workspace.clone());
    tools.register(Arc::new(ExecTool::new(Arc::new(ShellGuard::new(
        shell_cwd,
        config.tools.exec.timeout_secs,
        restrict,
        config.tools.exec.allow_shell_fallback,
    )))));

    tools.register(Arc::new(WebSearchTool::new(
        &config.tools.web_search.api_key,
        config.tools.web_search.max_results,
    )));
    tools.register(Arc::new(WebFetchTool));
    tools.register(Arc::new(ScreenshotTool::new(workspace.clone(), &config.tools.screenshot)));

    if let Some(memory) = memory {
        tools.register(Arc::new(MemorySearchTool::new(memory.clone())));
        tools.register(Arc::new(MemoryWriteTool::new(memory.clone())));
        tools.register(Arc::new(MemoryGetTool::new(memory.clone())));
        tools.register(Arc::new(MemoryListTool::new(memory)));
    }

    tools.register(Arc::new(SetReminderTool::new(scheduler.clone())));
    tools.register(Arc::new(ListRemindersTool::new(scheduler.clone())));
    tools.register(Arc::new(CancelReminderTool::new(scheduler)));

    let subagent_tools = tools.clone();
    tools.register(Arc::new(MessageTool));
    tools.register(Arc::new(SpawnTool::new(provider, None, subagent_tools, workspace)));
    tools
}

// ── Agent loop ───────────────────────────────────────────────────────────

/// Owns the sessions, the tool registry and the command handler. Runs on one thread;
/// everything else talks to it through the bus.
pub(crate) struct AgentLoop {
    bus: MessageBus,
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    sessions: SessionManager,
    commands: CommandHandler,
    context: ContextBuilder,
    config: FileConfig,
    memory: Option<Arc<LazyMemory>>,
    running: Arc<AtomicBool>,
    max_iterations: usize,
    log_dir: PathBuf,
}

impl AgentLoop {
    pub(crate) fn new(
        config: FileConfig,
        bus: MessageBus,
        provider: Arc<dyn LlmProvider>,
        scheduler: Option<Arc<dyn Scheduler>>,
        memory: Option<Arc<LazyMemory>>,
    ) -> Self {
        let workspace = config.workspace_path();
        let tools = default_tools(&config, provider.clone(), scheduler.clone(), memory.clone());
        let context = ContextBuilder::new(&workspace);
        let commands = CommandHandler::new(scheduler, context.skills_dirs().to_vec());
        let sessions = SessionManager::new(config.data_dir_path().join("sessions"));
        tracing::info!(
            target: "agent",
            provider = provider.name(),
            tools = tools.len(),
            workspace = %workspace.display(),
            "agent ready"
        );
        Self {
            bus,
            provider,
            tools,
            sessions,
            commands,
            context,
            max_iterations: config.agent.max_iterations.max(1),
            log_dir: log_dir_path(&workspace),
            config,
            memory,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared stop flag; clearing it ends `run` within one poll interval.
    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub(crate) fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub(crate) fn run(&mut self) {
        tracing::info!(target: "agent", "agent loop started");
        while self.running.load(Ordering::SeqCst) {
            let Some(msg) = self.bus.consume_inbound(POLL_INTERVAL) else {
                continue;
            };
            if let Some(reply) = self.process_message(msg) {
                if !self.bus.publish_outbound(reply) {
                    tracing::warn!(target: "agent", "outbound queue closed");
                }
            }
        }
        tracing::info!(target: "agent", "agent loop stopped");
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(target: "agent", "agent loop stopping");
    }

    /// One inbound message to at most one reply. Errors and panics turn into an apology
    /// addressed to the sender; the loop keeps going either way.
    pub(crate) fn process_message(&mut self, msg: InboundMessage) -> Option<OutboundMessage> {
        let (channel, chat_id) = (msg.channel.clone(), msg.chat_id.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(msg)));
        let error = match outcome {
            Ok(Ok(reply)) => return reply,
            Ok(Err(e)) => e,
            Err(panic) => panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string()),
        };
        tracing::error!(target: "agent", channel = %channel, chat_id = %chat_id, error = %error, "message failed");
        Some(OutboundMessage::new(
            &channel,
            &chat_id,
            &format!("Sorry, I encountered an error: {error}"),
        ))
    }

    /// Run `content` as if typed into the CLI under `session_key` and return the reply text.
    pub(crate) fn process_direct(&mut self, content: &str, session_key: &str) -> String {
        let (channel, chat_id) = session_key.split_once(':').unwrap_or(("cli", session_key));
        let msg = InboundMessage::new(channel, "user", chat_id, content);
        self.process_message(msg).map(|reply| reply.content).unwrap_or_default()
    }

    /// Route a due job. Direct-delivery reminders go straight out; anything else becomes a
    /// system message so the model handles it in the target chat.
    pub(crate) fn handle_job(bus: &MessageBus, job: &CronJob) -> bool {
        let channel = job.payload.channel.as_deref().unwrap_or("cli");
        let to = job.payload.to.as_deref().unwrap_or("direct");
        if job.payload.kind == PayloadKind::SystemEvent && job.payload.deliver {
            tracing::info!(target: "agent", job = %job.id, channel, to, "delivering reminder");
            return bus.publish_outbound(OutboundMessage::new(channel, to, &job.payload.message));
        }
        tracing::info!(target: "agent", job = %job.id, channel, to, "routing job to agent");
        bus.publish_inbound(InboundMessage::new(
            "system",
            "cron",
            &format!("{channel}:{to}"),
            &job.payload.message,
        ))
    }

    fn dispatch(&mut self, msg: InboundMessage) -> Result<Option<OutboundMessage>, String> {
        if msg.channel == "system" {
            return self.process_system(msg).map(Some);
        }
        tracing::info!(target: "agent", channel = %msg.channel, sender = %msg.sender_id, "processing message");

        if msg.content.trim().to_lowercase().starts_with("/collab") {
            return Ok(Some(self.handle_collab(&msg)));
        }

        let mut msg = msg;
        let key = msg.session_key();
        match self
            .commands
            .handle(&msg.content, &mut self.sessions, &key, &msg.channel, &msg.chat_id)
        {
            Some(CommandOutcome::Reply(text)) => {
                return Ok(Some(OutboundMessage::new(&msg.channel, &msg.chat_id, &text)));
            }
            Some(CommandOutcome::Delegate(text)) => msg.content = text,
            None => {}
        }

        let answer = self.run_turn(&key, &msg.channel, &msg.chat_id, &msg.content, &msg.media, NO_RESPONSE, None)?;
        let mut reply = OutboundMessage::new(&msg.channel, &msg.chat_id, &answer);
        reply.metadata = msg.metadata;
        Ok(Some(reply))
    }

    /// Sub-agent and cron announcements. `chat_id` carries the `channel:chat_id` to answer.
    fn process_system(&mut self, msg: InboundMessage) -> Result<OutboundMessage, String> {
        tracing::info!(target: "agent", sender = %msg.sender_id, "processing system message");
        let (channel, chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };
        let key = format!("{channel}:{chat_id}");
        let recorded = format!("[System: {}] {}", msg.sender_id, msg.content);
        let answer = self.run_turn(&key, &channel, &chat_id, &msg.content, &[], BACKGROUND_DONE, Some(&recorded))?;
        Ok(OutboundMessage::new(&channel, &chat_id, &answer))
    }

    /// Build context, run the tool loop, record the exchange. Returns the final answer.
    #[allow(clippy::too_many_arguments)]
    fn run_turn(
        &mut self,
        key: &str,
        channel: &str,
        chat_id: &str,
        content: &str,
        media: &[String],
        fallback: &str,
        recorded_as: Option<&str>,
    ) -> Result<String, String> {
        let mut session = self.sessions.get_or_create(key);
        let history = session.get_history(
            self.config.agent.max_history_messages,
            self.config.agent.max_history_tokens,
        );
        let mut messages = self.context.build_messages(history, content, media);
        let ctx = ToolContext::new(channel, chat_id)
            .with_memory(self.memory.clone())
            .with_bus(Some(self.bus.clone()));

        let outcome = run_tool_loop(
            self.provider.as_ref(),
            None,
            &self.tools,
            &mut messages,
            &ctx,
            self.max_iterations,
        );
        let mut answer = outcome.content.unwrap_or_else(|| fallback.to_string());
        if answer.trim().is_empty() {
            answer = EMPTY_RESPONSE.to_string();
        }

        let user_text = recorded_as.unwrap_or(content);
        session.add_message("user", user_text);
        let mut extra = serde_json::Map::new();
        if !outcome.tools_used.is_empty() {
            extra.insert("tools_used".into(), serde_json::json!(outcome.tools_used));
        }
        session.add_message_with("assistant", &answer, extra);
        self.sessions.save(&session)?;

        let meta = serde_json::json!({
            "channel": channel,
            "chat_id": chat_id,
            "iterations": outcome.iterations,
            "tools_used": outcome.tools_used,
        });
        for entry in [
            AgentLogEntry::new(key, "user", user_text, None),
            AgentLogEntry::new(key, "assistant", &answer, Some(meta)),
        ] {
            if let Err(e) = append_log_jsonl(&self.log_dir, &entry) {
                tracing::warn!(target: "agent", error = %e, "turn log write failed");
            }
        }
        tracing::info!(
            target: "agent",
            session = key,
            iterations = outcome.iterations,
            tools = outcome.tools_used.len(),
            "turn complete"
        );
        Ok(answer)
    }

    fn handle_collab(&self, msg: &InboundMessage) -> OutboundMessage {
        let reply = |text: &str| OutboundMessage::new(&msg.channel, &msg.chat_id, text);
        let task = msg.content.trim().get("/collab".len()..).unwrap_or("").trim();
        if task.is_empty() {
            return reply(
                "**Multi-Model Collaboration**\n\n\
                 Usage: `/collab <task>`\n\n\
                 Example: `/collab Design a REST API authentication system`\n\n\
                 Models will discuss back-and-forth until they agree on the best solution.",
            );
        }

        let collaborator = Collaborator::from_config(&self.config);
        if collaborator.provider_count() < 2 {
            let names: Vec<&str> = collaborator.participants().iter().map(|p| p.name.as_str()).collect();
            let names = if names.is_empty() { "none".to_string() } else { names.join(", ") };
            return reply(&format!(
                "❌ **Not Enough Providers**\n\n\
                 Multi-model collaboration requires at least 2 configured providers.\n\n\
                 Currently configured: {names}\n\n\
                 Add more API keys in your config to enable collaboration."
            ));
        }

        let participants: Vec<String> = collaborator
            .participants()
            .iter()
            .take(2)
            .map(|p| format!("{} {}", p.emoji, p.name))
            .collect();
        self.bus.publish_outbound(reply(&format!(
            "🤝 **Starting Collaborative Dialogue**\n\n\
             **Task:** {task}\n\n\
             **Participants:** {}\n\n\
             *Models will discuss until reaching consensus...*",
            participants.join(", ")
        )));

        let bus = self.bus.clone();
        let result = collaborator.collaborate(task, &|text| {
            bus.publish_outbound(reply(text));
        });
        reply(&summarize_result(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CronService, LlmResponse, Tool, ToolCall, ToolDefinition};
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    /// Plays back queued responses and records every request it saw.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
        fallback: LlmResponse,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
            Self::with_fallback(responses, LlmResponse::text("ok"))
        }

        fn with_fallback(responses: Vec<LlmResponse>, fallback: LlmResponse) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_user_text(&self) -> Option<String> {
            let seen = self.seen.lock().unwrap();
            seen.last()?
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .and_then(|m| m.content.clone())
        }
    }

    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }
        fn default_model(&self) -> String {
            "scripted-1".into()
        }
        fn chat(&self, messages: &[ChatMessage], _tools: &[ToolDefinition], _model: Option<&str>) -> LlmResponse {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(r) if r.finish_reason == "panic" => panic!("provider exploded"),
                Some(r) => r,
                None => self.fallback.clone(),
            }
        }
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> LlmResponse {
        LlmResponse {
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: args,
            }],
            finish_reason: "tool_calls".into(),
            ..Default::default()
        }
    }

    fn test_config(name: &str) -> FileConfig {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("agent_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("workspace")).unwrap();
        let mut config = FileConfig::default();
        config.workspace = dir.join("workspace").to_string_lossy().to_string();
        config.data_dir = dir.join("data").to_string_lossy().to_string();
        config
    }

    fn agent(name: &str, llm: Arc<ScriptedLlm>, scheduler: Option<Arc<dyn Scheduler>>) -> (AgentLoop, MessageBus) {
        let bus = MessageBus::new();
        (AgentLoop::new(test_config(name), bus.clone(), llm, scheduler, None), bus)
    }

    struct Sleepy;

    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps then echoes"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"ms": {"type": "integer"}, "tag": {"type": "string"}}})
        }
        fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
            std::thread::sleep(Duration::from_millis(args["ms"].as_u64().unwrap_or(0)));
            Ok(args["tag"].as_str().unwrap_or("").to_string())
        }
    }

    #[test]
    fn test_tool_results_follow_emission_order() {
        let calls = LlmResponse {
            tool_calls: vec![
                ToolCall { id: "c1".into(), name: "sleepy".into(), arguments: serde_json::json!({"ms": 60, "tag": "slow"}) },
                ToolCall { id: "c2".into(), name: "sleepy".into(), arguments: serde_json::json!({"ms": 0, "tag": "fast"}) },
            ],
            finish_reason: "tool_calls".into(),
            ..Default::default()
        };
        let llm = ScriptedLlm::new(vec![calls, LlmResponse::text("all done")]);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Sleepy));
        let mut messages = vec![ChatMessage::user("go")];
        let outcome = run_tool_loop(llm.as_ref(), None, &tools, &mut messages, &ToolContext::default(), 5);

        assert_eq!(outcome.content.as_deref(), Some("all done"));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tools_used, vec!["sleepy", "sleepy"]);
        let results: Vec<(&str, &str)> = messages
            .iter()
            .filter(|m| m.role == "tool")
            .map(|m| (m.tool_call_id.as_deref().unwrap_or(""), m.content.as_deref().unwrap_or("")))
            .collect();
        assert_eq!(results, vec![("c1", "slow"), ("c2", "fast")]);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].tool_calls.len(), 2);
    }

    #[test]
    fn test_iteration_cap_uses_fallback() {
        let llm = ScriptedLlm::with_fallback(Vec::new(), tool_call("x", "nope", serde_json::json!({})));
        let (mut agent, _) = agent("cap", llm.clone(), None);
        agent.max_iterations = 3;
        assert_eq!(agent.process_direct("loop forever", "cli:direct"), NO_RESPONSE);
        assert_eq!(llm.calls(), 3);
    }

    #[test]
    fn test_whitespace_answer_recorded_as_done() {
        let llm = ScriptedLlm::new(vec![LlmResponse::text("  \n ")]);
        let (mut agent, _) = agent("blank", llm, None);
        assert_eq!(agent.process_direct("hello", "cli:direct"), "Done.");

        let mut sessions = SessionManager::new(agent.sessions().dir().to_path_buf());
        let session = sessions.get_or_create("cli:direct");
        let roles: Vec<(&str, &str)> = session
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        assert_eq!(roles, vec![("user", "hello"), ("assistant", "Done.")]);
        let logged = crate::load_session_logs(&agent.log_dir, "cli:direct", 10);
        assert_eq!(logged.len(), 2);
    }

    #[test]
    fn test_history_carries_into_next_turn() {
        let llm = ScriptedLlm::new(vec![LlmResponse::text("first answer"), LlmResponse::text("second answer")]);
        let (mut agent, _) = agent("history", llm.clone(), None);
        agent.process_direct("first question", "cli:direct");
        agent.process_direct("second question", "cli:direct");
        let seen = llm.seen.lock().unwrap();
        let second: Vec<&str> = seen[1].iter().filter_map(|m| m.content.as_deref()).collect();
        assert!(second.contains(&"first question"));
        assert!(second.contains(&"first answer"));
        assert_eq!(seen[1][0].role, "system");
    }

    #[test]
    fn test_system_message_reroutes_to_origin() {
        let llm = ScriptedLlm::new(vec![LlmResponse::text("Your files are counted.")]);
        let (mut agent, _) = agent("system", llm, None);
        let msg = InboundMessage::new("system", "subagent", "telegram:42", "[Subagent 'census' completed]");
        let reply = agent.process_message(msg).unwrap();
        assert_eq!((reply.channel.as_str(), reply.chat_id.as_str()), ("telegram", "42"));
        assert_eq!(reply.content, "Your files are counted.");

        let session = agent.sessions.get_or_create("telegram:42");
        assert_eq!(session.messages[0].content, "[System: subagent] [Subagent 'census' completed]");
    }

    #[test]
    fn test_system_message_without_origin_falls_back_to_cli() {
        let llm = ScriptedLlm::new(vec![LlmResponse { finish_reason: "stop".into(), ..Default::default() }]);
        let (mut agent, _) = agent("system_cli", llm, None);
        let reply = agent
            .process_message(InboundMessage::new("system", "cron", "lonely", "ping"))
            .unwrap();
        assert_eq!((reply.channel.as_str(), reply.chat_id.as_str()), ("cli", "lonely"));
        assert_eq!(reply.content, BACKGROUND_DONE);
    }

    #[test]
    fn test_commands_reply_or_delegate() {
        let llm = ScriptedLlm::new(Vec::new());
        let (mut agent, _) = agent("commands", llm.clone(), None);
        let help = agent.process_direct("/help", "cli:direct");
        assert!(help.starts_with("**icron Commands**"));
        assert_eq!(llm.calls(), 0);

        agent.process_direct("/weather Oslo", "cli:direct");
        assert_eq!(llm.calls(), 1);
        assert_eq!(llm.last_user_text().as_deref(), Some("What's the current weather in Oslo?"));
    }

    #[test]
    fn test_reminder_round_trip_skips_model() {
        let llm = ScriptedLlm::new(Vec::new());
        let service = Arc::new(CronService::in_memory());
        let (mut agent, bus) = agent("remind", llm.clone(), Some(service.clone()));
        let before = crate::now_ms();
        let reply = agent
            .process_message(InboundMessage::new("slack", "u1", "C9", "/remind 5m Check the build"))
            .unwrap();
        assert!(reply.content.starts_with("✅ Reminder scheduled"));

        let jobs = service.list_jobs();
        assert_eq!(jobs.len(), 1);
        let next = jobs[0].next_run_at_ms.unwrap();
        assert!((next - (before + 300_000)).abs() <= 1_000);

        let due = service.take_due(next);
        assert_eq!(due.len(), 1);
        assert!(AgentLoop::handle_job(&bus, &due[0]));
        let out = bus.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].channel.as_str(), out[0].chat_id.as_str()), ("slack", "C9"));
        assert!(out[0].content.contains("Check the build"));
        assert_eq!(llm.calls(), 0);
        assert!(service.list_jobs().is_empty());
    }

    #[test]
    fn test_agent_turn_jobs_become_system_messages() {
        let service = CronService::in_memory();
        let job = service
            .add_job(
                "digest",
                crate::JobSchedule::Every { every_ms: 60_000 },
                crate::JobPayload {
                    kind: PayloadKind::AgentTurn,
                    message: "Summarize my inbox".into(),
                    deliver: true,
                    channel: Some("discord".into()),
                    to: Some("77".into()),
                },
                false,
            )
            .unwrap();
        let bus = MessageBus::new();
        assert!(AgentLoop::handle_job(&bus, &job));
        let msg = bus.consume_inbound(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.channel, "system");
        assert_eq!(msg.chat_id, "discord:77");
        assert!(bus.drain_outbound().is_empty());
    }

    #[test]
    fn test_panics_become_apologies() {
        let llm = ScriptedLlm::new(vec![LlmResponse { finish_reason: "panic".into(), ..Default::default() }]);
        let (mut agent, _) = agent("panic", llm, None);
        let reply = agent.process_direct("hi", "cli:direct");
        assert_eq!(reply, "Sorry, I encountered an error: provider exploded");
        assert_eq!(agent.process_direct("again", "cli:direct"), "ok");
    }

    #[test]
    fn test_collab_needs_two_providers() {
        let llm = ScriptedLlm::new(Vec::new());
        let (mut agent, _) = agent("collab", llm.clone(), None);
        assert!(agent.process_direct("/collab", "cli:direct").starts_with("**Multi-Model Collaboration**"));
        let reply = agent.process_direct("/collab design a cache", "cli:direct");
        assert!(reply.starts_with("❌ **Not Enough Providers**"));
        assert!(reply.contains("Currently configured: none"));
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn test_registry_contents() {
        let llm = ScriptedLlm::new(Vec::new());
        let (agent, _) = agent("tools", llm, Some(Arc::new(CronService::in_memory())));
        for name in ["read_file", "exec", "web_fetch", "screenshot", "message", "spawn", "set_reminder"] {
            assert!(agent.tools.has(name), "missing {name}");
        }
        assert!(!agent.tools.has("memory_search"));
    }
}
