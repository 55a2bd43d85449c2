use std::sync::Arc;

use chrono::{Local, TimeZone};
use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::{describe_trigger, parse_time_expression, schedule_reminder, Scheduler};

pub(crate) const REMINDER_PREFIX: &str = "⏰ **Reminder:** ";

#[derive(Debug, Deserialize)]
struct SetArgs {
    message: String,
    when: String,
}

pub(crate) struct SetReminderTool {
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl SetReminderTool {
    pub(crate) fn new(scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self { scheduler }
    }
}

impl Tool for SetReminderTool {
    fn name(&self) -> &str {
        "set_reminder"
    }

    fn description(&self) -> &str {
        "Set a reminder that is delivered to this chat at the given time. \
         'when' accepts 'in 5 minutes', '5m', '2h', 'at 3pm', 'at 14:30' or 'tomorrow at 9am'."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "What to remind the user about"},
                "when": {"type": "string", "description": "When to send the reminder"}
            },
            "required": ["message", "when"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: SetArgs = parse_args(args)?;
        let Some(scheduler) = &self.scheduler else {
            return Err("Error: Reminder service not available".into());
        };
        if ctx.channel.is_empty() || ctx.chat_id.is_empty() {
            return Err("Cannot determine where to send reminder".into());
        }
        let now = Local::now();
        let Some(at_ms) = parse_time_expression(&parsed.when, now) else {
            return Err(format!(
                "Could not understand time expression '{}'. Try 'in 5 minutes' or 'at 2pm'.",
                parsed.when
            ));
        };
        let now_ms = now.timestamp_millis();
        if at_ms <= now_ms {
            return Err("Reminder time must be in the future".into());
        }
        let text = format!("{REMINDER_PREFIX}{}", parsed.message);
        schedule_reminder(scheduler.as_ref(), &text, at_ms, &ctx.channel, &ctx.chat_id)?;
        Ok(format!(
            "✅ Reminder scheduled {}. Message: \"{}\" (Do not recalculate or restate the time - use exactly what's shown.)",
            describe_trigger(at_ms, now_ms),
            parsed.message
        ))
    }
}

pub(crate) struct ListRemindersTool {
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ListRemindersTool {
    pub(crate) fn new(scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self { scheduler }
    }
}

/// Active reminders as a bullet list, shared with the `/remind` listing.
pub(crate) fn format_reminder_list(scheduler: &dyn Scheduler) -> String {
    let jobs = scheduler.list_jobs();
    if jobs.is_empty() {
        return "📭 No active reminders.".to_string();
    }
    let mut lines = vec!["📋 **Active Reminders:**".to_string()];
    for job in jobs {
        let when = job
            .next_run_at_ms
            .and_then(|ms| Local.timestamp_millis_opt(ms).single())
            .map(|t| t.format("%b %d, %I:%M %p").to_string())
            .unwrap_or_else(|| "unscheduled".to_string());
        lines.push(format!("- [{}] {} - {when}", job.id, job.name));
    }
    lines.join("\n")
}

impl Tool for ListRemindersTool {
    fn name(&self) -> &str {
        "list_reminders"
    }

    fn description(&self) -> &str {
        "List all active reminders with their IDs and trigger times."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let Some(scheduler) = &self.scheduler else {
            return Err("Error: Reminder service not available".into());
        };
        Ok(format_reminder_list(scheduler.as_ref()))
    }
}

#[derive(Debug, Deserialize)]
struct CancelArgs {
    reminder_id: String,
}

pub(crate) struct CancelReminderTool {
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl CancelReminderTool {
    pub(crate) fn new(scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        Self { scheduler }
    }
}

impl Tool for CancelReminderTool {
    fn name(&self) -> &str {
        "cancel_reminder"
    }

    fn description(&self) -> &str {
        "Cancel a reminder by the ID shown in list_reminders."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reminder_id": {"type": "string", "description": "ID of the reminder to cancel"}
            },
            "required": ["reminder_id"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: CancelArgs = parse_args(args)?;
        let Some(scheduler) = &self.scheduler else {
            return Err("Error: Reminder service not available".into());
        };
        let id = parsed.reminder_id.trim();
        if scheduler.remove_job(id) {
            Ok(format!("✅ Reminder {id} cancelled."))
        } else {
            Ok(format!("❌ Could not find reminder with ID '{id}'"))
        }
    }
}
