//! Slash commands. Session and listing commands answer directly; the rest are rewritten
//! into an instruction and handed to the agent.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::{
    describe_trigger, discover_skills, format_reminder_list, now_ms, offset_ms, parse_duration_ms, schedule_reminder,
    Scheduler, SessionManager, REMINDER_PREFIX,
};

const MAX_LISTED_SESSIONS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommandOutcome {
    /// Final answer; the agent is not involved.
    Reply(String),
    /// Continue through the agent with this message instead of the command text.
    Delegate(String),
}

struct Template {
    key: &'static str,
    emoji: &'static str,
    description: &'static str,
    instruction: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        key: "morning",
        emoji: "🌅",
        description: "Weather, calendar, reminders, and news summary",
        instruction: "Provide a comprehensive morning briefing:\n\
1. Get the current weather for the user's location\n\
2. Check for any calendar events or meetings today\n\
3. List any pending reminders or tasks\n\
4. Summarize the top 3-5 news headlines relevant to the user\n\
Format the response in a clear, scannable way with sections.",
    },
    Template {
        key: "daily",
        emoji: "📊",
        description: "What was accomplished and pending tasks",
        instruction: "Provide a daily summary:\n\
1. Summarize what was discussed and accomplished in today's conversations\n\
2. List any tasks that were mentioned but not completed\n\
3. Highlight any follow-ups or action items\n\
4. Suggest priorities for tomorrow\n\
Be concise but comprehensive.",
    },
    Template {
        key: "research",
        emoji: "🔬",
        description: "Research a topic and summarize findings",
        instruction: "Conduct thorough research on the specified topic:\n\
1. Search the web for authoritative sources\n\
2. Gather key facts, statistics, and expert opinions\n\
3. Identify multiple perspectives if applicable\n\
4. Synthesize findings into a clear summary\n\
5. Include sources and links for reference\n\
Provide a well-structured research report.",
    },
    Template {
        key: "recap",
        emoji: "📝",
        description: "Summarize the current session",
        instruction: "Summarize the current conversation session:\n\
1. List the main topics discussed\n\
2. Highlight key decisions or conclusions made\n\
3. Note any unanswered questions or pending items\n\
4. Summarize any code, files, or artifacts created\n\
Keep it concise but capture all important points.",
    },
];

const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "collab",
        "**Multi-Model Collaboration**\n\n\
Have two AI providers discuss a task until they agree.\n\n\
Usage:\n\
• `/collab Design a REST API authentication system`\n\n\
At least 2 providers must be configured with API keys (e.g., Anthropic + OpenAI).",
    ),
    (
        "commands",
        "**All Commands**\n\n\
Session Management:\n\
• `/sessions` - List all sessions\n\
• `/session clear` - Clear history\n\
• `/session new` or `/new` - New session\n\
• `/session rename [name]` - Rename session\n\
• `/session switch [id]` - Switch session\n\n\
Quick Actions:\n\
• `/remind [time] [message]` - Set reminder\n\
• `/search [query]` - Web search\n\
• `/memory` - Memory info\n\
• `/weather [location]` - Get weather\n\
• `/skills` - List available skills\n\
• `/skills run [name]` - Run a skill\n\
• `/templates` - List templates\n\
• `/template [name]` - Run a template\n\
• `/collab [task]` - Multi-model collaboration",
    ),
    (
        "memory",
        "**Memory System**\n\n\
icron keeps long-term notes in MEMORY.md and a dated log per day under memory/.\n\n\
Commands:\n\
• `/memory` - Show current memory information\n\n\
Memory is stored separately from sessions and persists permanently.",
    ),
    (
        "reminders",
        "**Reminders**\n\n\
Usage:\n\
• `/remind 5m Check the build` - Remind in 5 minutes\n\
• `/remind 2h Review PR` - Remind in 2 hours\n\
• `/remind tomorrow 9am Team meeting` - Remind tomorrow at 9am\n\
• `/remind list` - Show active reminders\n\
• `/remind cancel [id]` - Cancel a reminder",
    ),
    (
        "search",
        "**Quick Search**\n\n\
Usage:\n\
• `/search rust async tutorial` - Search the web\n\n\
The agent will search and summarize results for you.",
    ),
    (
        "sessions",
        "**Session Management**\n\n\
Sessions store your conversation history. Each channel/chat has its own session.\n\n\
Commands:\n\
• `/sessions` - List all sessions with IDs\n\
• `/session clear` - Clear current session history\n\
• `/session new` - Start a fresh session (alias: `/new`)\n\
• `/session rename [name]` - Rename current session\n\
• `/session switch [id]` - Switch to another session",
    ),
    (
        "skills",
        "**Skills System**\n\n\
Skills are folders under `skills/` with a SKILL.md describing how to do something.\n\n\
Commands:\n\
• `/skills` - List all available skills\n\
• `/skills run [name]` - Execute a skill by name",
    ),
    (
        "weather",
        "**Weather Lookup**\n\n\
Usage:\n\
• `/weather` - Weather for your usual location\n\
• `/weather London` - Weather for London",
    ),
];

const GENERAL_HELP: &str = "**icron Commands** 🤖\n\n\
**Session Management**\n\
• `/sessions` - List all sessions\n\
• `/session clear` - Clear current session history\n\
• `/session new` - Start fresh session (or `/new`)\n\
• `/session rename [name]` - Rename current session\n\
• `/session switch [id]` - Switch to another session\n\n\
**Quick Actions**\n\
• `/remind [time] [message]` - Set a reminder\n\
• `/search [query]` - Quick web search\n\
• `/memory` - Show memory information\n\
• `/weather [location]` - Get current weather\n\
• `/skills` - List available skills\n\
• `/skills run [name]` - Execute a skill\n\
• `/collab [task]` - Multi-model collaboration\n\
• `/templates` - List message templates\n\
• `/template [name]` - Run a template\n\n\
**Help**\n\
• `/help [topic]` - Detailed help for: collab, commands, memory, reminders, search, sessions, skills, weather\n\n\
💡 Tip: You can also just chat naturally - I'll understand!";

static COMMAND: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)^/([a-zA-Z]+)(?:\s+(.*))?$").ok());
static LEADING_DURATION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:in\s+)?(\d+\s*(?:seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h|days?|d))\s+(.+)$").ok()
});

pub(crate) struct CommandHandler {
    scheduler: Option<Arc<dyn Scheduler>>,
    skills_dirs: Vec<PathBuf>,
}

impl CommandHandler {
    pub(crate) fn new(scheduler: Option<Arc<dyn Scheduler>>, skills_dirs: Vec<PathBuf>) -> Self {
        Self { scheduler, skills_dirs }
    }

    pub(crate) fn is_command(text: &str) -> bool {
        let text = text.trim();
        text.starts_with('/') && text.len() > 1
    }

    /// `None` when `text` is not a slash command.
    pub(crate) fn handle(
        &self,
        text: &str,
        sessions: &mut SessionManager,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Option<CommandOutcome> {
        if !Self::is_command(text) {
            return None;
        }
        let caps = COMMAND.as_ref()?.captures(text.trim())?;
        let command = caps.get(1)?.as_str().to_lowercase();
        let args = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        tracing::debug!(target: "commands", command = %command, args, "slash command");

        let outcome = match command.as_str() {
            "help" => CommandOutcome::Reply(help(args)),
            "sessions" => CommandOutcome::Reply(list_sessions(sessions, session_key)),
            "session" => CommandOutcome::Reply(session_command(sessions, session_key, args)),
            "new" => CommandOutcome::Reply(session_new(sessions, session_key)),
            "remind" => self.remind(args, channel, chat_id),
            "search" if args.is_empty() => CommandOutcome::Reply(
                "**Search Usage**\n\n• `/search rust async best practices`\n• `/search latest AI news`".into(),
            ),
            "search" => CommandOutcome::Delegate(format!(
                "Search the web for \"{args}\" and summarize the most relevant results with links."
            )),
            "memory" => CommandOutcome::Delegate(
                "Show what you remember about me: use memory_list and summarize MEMORY.md and the recent daily notes."
                    .into(),
            ),
            "skills" => self.skills(args),
            "weather" => CommandOutcome::Delegate(if args.is_empty() {
                "What's the current weather where I am? Use my location from memory if you know it.".into()
            } else {
                format!("What's the current weather in {args}?")
            }),
            "templates" => CommandOutcome::Reply(list_templates()),
            "template" => run_template(args),
            other => CommandOutcome::Reply(format!(
                "❓ Unknown command: `/{other}`\n\nType `/help` to see available commands."
            )),
        };
        Some(outcome)
    }

    fn remind(&self, args: &str, channel: &str, chat_id: &str) -> CommandOutcome {
        if args.is_empty() {
            return CommandOutcome::Reply(
                "**Reminder Usage**\n\n\
                 • `/remind 5m Check the build`\n\
                 • `/remind 2h Review the PR`\n\
                 • `/remind tomorrow 9am Team standup`\n\n\
                 Time formats: Nm (minutes), Nh (hours), or natural language."
                    .into(),
            );
        }
        let Some(scheduler) = &self.scheduler else {
            return CommandOutcome::Delegate(format!("Set a reminder: {args}"));
        };
        let mut words = args.splitn(2, char::is_whitespace);
        match (words.next().map(str::to_lowercase).as_deref(), words.next().map(str::trim)) {
            (Some("list"), None) => return CommandOutcome::Reply(format_reminder_list(scheduler.as_ref())),
            (Some("cancel"), Some(id)) => {
                return CommandOutcome::Reply(if scheduler.remove_job(id) {
                    format!("✅ Reminder {id} cancelled.")
                } else {
                    format!("❌ Could not find reminder with ID '{id}'")
                });
            }
            _ => {}
        }

        let parsed = LEADING_DURATION
            .as_ref()
            .and_then(|re| re.captures(args))
            .and_then(|caps| {
                let ms = parse_duration_ms(caps.get(1)?.as_str())?;
                Some((ms, caps.get(2)?.as_str().trim().to_string()))
            })
            .filter(|(ms, message)| *ms > 0 && !message.is_empty());
        let Some((delay_ms, message)) = parsed else {
            tracing::debug!(target: "commands", args, "reminder time not a plain duration, delegating");
            return CommandOutcome::Delegate(format!("Set a reminder: {args}"));
        };

        let now = now_ms();
        let Some(at_ms) = offset_ms(now, delay_ms) else {
            return CommandOutcome::Reply(format!("❌ Invalid time: `{args}` is too far in the future"));
        };
        let text = format!("{REMINDER_PREFIX}{message}");
        match schedule_reminder(scheduler.as_ref(), &text, at_ms, channel, chat_id) {
            Ok(job) => CommandOutcome::Reply(format!(
                "✅ Reminder scheduled {}. Message: \"{message}\" (ID: {})",
                describe_trigger(at_ms, now),
                job.id
            )),
            Err(e) => CommandOutcome::Reply(format!("❌ Could not schedule reminder: {e}")),
        }
    }

    fn skills(&self, args: &str) -> CommandOutcome {
        let mut parts = args.splitn(2, char::is_whitespace);
        if parts.next().map(str::to_lowercase).as_deref() == Some("run") {
            let name = parts.next().map(str::trim).unwrap_or("");
            if name.is_empty() {
                return CommandOutcome::Reply("❌ Please specify a skill name: `/skills run weather`".into());
            }
            return CommandOutcome::Delegate(format!(
                "Run the skill '{name}': read its SKILL.md under skills/{name}/ with read_file and follow the instructions."
            ));
        }
        let skills = discover_skills(&self.skills_dirs);
        if skills.is_empty() {
            return CommandOutcome::Reply("📭 No skills found in the skills directory.".into());
        }
        let mut lines = vec!["**Available Skills** 🛠️\n".to_string()];
        lines.extend(
            skills
                .iter()
                .map(|s| format!("{} **{}** - {}", s.emoji, s.name, s.description)),
        );
        lines.push("\n💡 Use `/skills run [name]` to execute a skill.".into());
        CommandOutcome::Reply(lines.join("\n"))
    }
}

fn help(args: &str) -> String {
    if args.is_empty() {
        return GENERAL_HELP.to_string();
    }
    let topic = args.to_lowercase();
    match HELP_TOPICS.iter().find(|(name, _)| *name == topic) {
        Some((_, text)) => text.to_string(),
        None => {
            let available: Vec<&str> = HELP_TOPICS.iter().map(|(name, _)| *name).collect();
            format!(
                "❓ Unknown help topic: `{topic}`\n\nAvailable topics: {}",
                available.join(", ")
            )
        }
    }
}

fn list_sessions(sessions: &SessionManager, current: &str) -> String {
    let all = sessions.list_sessions();
    if all.is_empty() {
        return "📭 No sessions found.".into();
    }
    let mut lines = vec!["**Your Sessions** 📋\n".to_string()];
    for (i, info) in all.iter().take(MAX_LISTED_SESSIONS).enumerate() {
        let updated: String = info.updated_at.chars().take(16).collect::<String>().replace('T', " ");
        let marker = if info.key == current { " ← current" } else { "" };
        let name = info.name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
        lines.push(format!("{}. `{}`{name}{marker}", i + 1, info.key));
        lines.push(format!("   Last updated: {updated} · {} messages", info.message_count));
    }
    if all.len() > MAX_LISTED_SESSIONS {
        lines.push(format!("\n*...and {} more sessions*", all.len() - MAX_LISTED_SESSIONS));
    }
    lines.join("\n")
}

fn session_command(sessions: &mut SessionManager, key: &str, args: &str) -> String {
    if args.is_empty() {
        return "**Session Commands**\n\n\
                • `/session clear` - Clear history\n\
                • `/session new` - Start fresh\n\
                • `/session rename [name]` - Rename\n\
                • `/session switch [id]` - Switch session"
            .into();
    }
    let mut parts = args.splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().map(str::trim).unwrap_or("");
    match sub.as_str() {
        "clear" => {
            let mut session = sessions.get_or_create(key);
            let count = session.messages.len();
            session.clear();
            match sessions.save(&session) {
                Ok(()) => format!("🗑️ Cleared {count} messages from session."),
                Err(e) => format!("❌ Could not clear session: {e}"),
            }
        }
        "new" => session_new(sessions, key),
        "rename" => {
            if rest.is_empty() {
                return "❌ Please provide a name: `/session rename My Project`".into();
            }
            let old = sessions.get_or_create(key).display_name().to_string();
            match sessions.set_name(key, rest) {
                Ok(()) => format!("✅ Session renamed from `{old}` to `{rest}`"),
                Err(e) => format!("❌ Could not rename session: {e}"),
            }
        }
        "switch" => session_switch(sessions, rest),
        other => format!("❓ Unknown session subcommand: `{other}`\n\nAvailable: clear, new, rename, switch"),
    }
}

fn session_new(sessions: &mut SessionManager, key: &str) -> String {
    let mut session = sessions.get_or_create(key);
    session.clear();
    session
        .metadata
        .insert("started_fresh".into(), serde_json::Value::Bool(true));
    match sessions.save(&session) {
        Ok(()) => "✨ Started fresh session. Previous history cleared.".into(),
        Err(e) => format!("❌ Could not start a new session: {e}"),
    }
}

fn session_switch(sessions: &SessionManager, target: &str) -> String {
    if target.is_empty() {
        return "❌ Please provide a session ID: `/session switch discord:123`".into();
    }
    let all = sessions.list_sessions();
    let matched = all
        .iter()
        .find(|s| s.key == target)
        .or_else(|| {
            let idx: usize = target.parse().ok()?;
            all.get(idx.checked_sub(1)?)
        })
        .map(|s| s.key.clone());
    match matched {
        None => format!("❌ Session not found: `{target}`\n\nUse `/sessions` to see available sessions."),
        // Sessions are bound to channel:chat, so switching means talking from that chat.
        Some(key) => format!(
            "🔄 To switch to session `{key}`, you would need to change channels or use a different chat ID.\n\n\
             Current session switching between chats is not yet supported."
        ),
    }
}

fn list_templates() -> String {
    let mut lines = vec![
        "**Message Templates** 📋\n".to_string(),
        "Quick workflows for common tasks:\n".to_string(),
    ];
    lines.extend(
        TEMPLATES
            .iter()
            .map(|t| format!("{} **{}** - {}", t.emoji, t.key, t.description)),
    );
    lines.push("\n💡 Use `/template [name]` to run a template.".into());
    lines.push("   Example: `/template morning` or `/template research AI trends`".into());
    lines.join("\n")
}

fn run_template(args: &str) -> CommandOutcome {
    if args.is_empty() {
        return CommandOutcome::Reply(
            "**Template Usage**\n\n\
             • `/template morning` - Run morning briefing\n\
             • `/template daily` - Run daily summary\n\
             • `/template research [topic]` - Research a topic\n\
             • `/template recap` - Recap current conversation\n\n\
             Use `/templates` to see all available templates."
                .into(),
        );
    }
    let mut parts = args.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_lowercase();
    let extra = parts.next().map(str::trim).unwrap_or("");
    let Some(template) = TEMPLATES.iter().find(|t| t.key == name) else {
        let available: Vec<&str> = TEMPLATES.iter().map(|t| t.key).collect();
        return CommandOutcome::Reply(format!(
            "❓ Unknown template: `{name}`\n\nAvailable templates: {}\nUse `/templates` for details.",
            available.join(", ")
        ));
    };
    if extra.is_empty() {
        CommandOutcome::Delegate(template.instruction.to_string())
    } else {
        CommandOutcome::Delegate(format!("{}\n\nTopic: {extra}", template.instruction))
    }
}
