use std::sync::Arc;

use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::ShellGuard;

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    allow_shell: bool,
}

/// `exec`: thin adapter over the shell guard, which owns every safety check.
pub(crate) struct ExecTool {
    guard: Arc<ShellGuard>,
}

impl ExecTool {
    pub(crate) fn new(guard: Arc<ShellGuard>) -> Self {
        Self { guard }
    }
}

impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Commands are validated for security."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The command to execute (will be validated for security)"},
                "working_dir": {"type": "string", "description": "Optional working directory for the command"},
                "allow_shell": {
                    "type": "boolean",
                    "description": "Explicitly allow shell execution for complex commands (requires allow_shell_fallback=True)"
                }
            },
            "required": ["command"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: ExecArgs = parse_args(args)?;
        Ok(self
            .guard
            .execute(&parsed.command, parsed.working_dir.as_deref(), parsed.allow_shell))
    }
}
