use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::HttpError;

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

pub(crate) fn parse_retry_after(resp: &ureq::Response) -> Option<f64> {
    resp.header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Exponential backoff with a small jitter, capped at `max_secs`.
pub(crate) fn backoff_delay(attempt: usize, base_secs: f64, max_secs: f64) -> f64 {
    let delay = (base_secs * 2.0_f64.powi(attempt as i32)).min(max_secs);
    delay * (1.0 + jitter_ratio() * 0.2)
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── HTTP ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: usize,
    pub(crate) base_secs: f64,
    pub(crate) max_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_secs: 0.5,
            max_secs: 4.0,
        }
    }
}

pub(crate) fn http_agent(timeout_secs: u64) -> ureq::Agent {
    let timeout = Duration::from_secs(timeout_secs.max(1));
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

/// POST a JSON body, retrying transport errors and retryable statuses with backoff.
/// `Retry-After` raises the delay when the server sends one.
pub(crate) fn post_json_with_retry(
    agent: &ureq::Agent,
    url: &str,
    headers: &[(&str, &str)],
    payload: &serde_json::Value,
    policy: RetryPolicy,
    component: &str,
) -> Result<serde_json::Value, HttpError> {
    let mut last_error = HttpError::Transport("no attempts made".to_string());
    for attempt in 0..=policy.max_retries {
        let mut request = agent.post(url).set("content-type", "application/json");
        for (name, value) in headers {
            request = request.set(name, value);
        }
        match request.send_json(payload.clone()) {
            Ok(resp) => {
                return resp
                    .into_json::<serde_json::Value>()
                    .map_err(|e| HttpError::Decode(e.to_string()));
            }
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = parse_retry_after(&resp);
                let text = resp.into_string().unwrap_or_default();
                last_error = HttpError::Status {
                    code,
                    body: truncate_with_marker(text.trim(), 500),
                };
                if attempt < policy.max_retries && is_retryable_status(code) {
                    let mut delay = backoff_delay(attempt, policy.base_secs, policy.max_secs);
                    if let Some(retry_after) = retry_after {
                        delay = delay.max(retry_after);
                    }
                    tracing::warn!(component, code, attempt, delay, "retryable status, backing off");
                    thread::sleep(Duration::from_secs_f64(delay));
                    continue;
                }
                break;
            }
            Err(ureq::Error::Transport(err)) => {
                last_error = HttpError::Transport(err.to_string());
                if attempt < policy.max_retries {
                    let delay = backoff_delay(attempt, policy.base_secs, policy.max_secs);
                    tracing::warn!(component, attempt, error = %err, "transport error, backing off");
                    thread::sleep(Duration::from_secs_f64(delay));
                    continue;
                }
                break;
            }
        }
    }
    Err(last_error)
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

pub(crate) fn default_data_dir() -> PathBuf {
    expand_home("~/.icron")
}

/// Truncate to `max_chars` characters, appending a marker with the remaining count.
pub(crate) fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... (truncated, {} more chars)", total - max_chars)
}

/// Rough token estimate used for history budgeting: one token per four characters.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

pub(crate) fn build_external_command(program: &str, args: &[String]) -> ProcessCommand {
    let mut cmd = ProcessCommand::new(program);
    cmd.args(args);

    // The child leads its own process group so a timeout can take down the whole tree.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Kill a child process and its entire process group.
#[cfg(unix)]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_tree(child: &mut std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

pub(crate) fn is_daily_log_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".md") else {
        return false;
    };
    chrono::NaiveDate::parse_from_str(stem, "%Y-%m-%d").is_ok() && stem.len() == 10
}

pub(crate) fn relative_display(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}
