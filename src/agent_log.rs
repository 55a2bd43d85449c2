//! Per-day JSONL turn log under `<workspace>/logs/`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

const LOG_FILES_SCANNED: usize = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AgentLogEntry {
    pub(crate) session: String,
    pub(crate) role: String,
    pub(crate) text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) meta: Option<serde_json::Value>,
    pub(crate) ts_utc: i64,
}

impl AgentLogEntry {
    pub(crate) fn new(session: &str, role: &str, text: &str, meta: Option<serde_json::Value>) -> Self {
        Self {
            session: session.to_string(),
            role: role.to_string(),
            text: text.to_string(),
            meta,
            ts_utc: chrono::Utc::now().timestamp(),
        }
    }
}

pub(crate) fn log_dir_path(workspace: &Path) -> PathBuf {
    workspace.join("logs")
}

fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("agent-") && n.ends_with(".jsonl"))
        .unwrap_or(false)
}

pub(crate) fn append_log_jsonl(log_dir: &Path, entry: &AgentLogEntry) -> Result<PathBuf, String> {
    fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {e}"))?;
    let path = log_dir.join(format!("agent-{}.jsonl", Local::now().format("%Y-%m-%d")));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    let json = serde_json::to_string(entry).map_err(|e| format!("encode log entry: {e}"))?;
    writeln!(file, "{json}").map_err(|e| format!("write log entry: {e}"))?;
    Ok(path)
}

/// The newest `limit` entries for `session` across the last week of logs, oldest first.
pub(crate) fn load_session_logs(log_dir: &Path, session: &str, limit: usize) -> Vec<AgentLogEntry> {
    let mut files: Vec<PathBuf> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_log_file(p))
            .collect(),
        Err(_) => return Vec::new(),
    };
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    files.truncate(LOG_FILES_SCANNED);

    let mut newest_first = Vec::new();
    for path in &files {
        let Ok(file) = fs::File::open(path) else { continue };
        let mut day: Vec<AgentLogEntry> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str::<AgentLogEntry>(&line).ok())
            .filter(|entry| entry.session == session)
            .collect();
        day.reverse();
        newest_first.extend(day);
        if newest_first.len() >= limit {
            break;
        }
    }
    newest_first.truncate(limit);
    newest_first.reverse();
    newest_first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_load_by_session() {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("agent_log_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        for i in 0..4 {
            append_log_jsonl(&dir, &AgentLogEntry::new("cli:direct", "assistant", &format!("reply {i}"), None)).unwrap();
        }
        append_log_jsonl(&dir, &AgentLogEntry::new("telegram:1", "assistant", "other", None)).unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let entries = load_session_logs(&dir, "cli:direct", 2);
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["reply 2", "reply 3"]);
        assert!(load_session_logs(&dir, "nobody", 5).is_empty());
        assert!(load_session_logs(&dir.join("missing"), "cli:direct", 5).is_empty());
    }
}
