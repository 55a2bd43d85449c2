//! Conversation sessions persisted as one JSONL file each: a metadata line, then messages.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::{estimate_tokens, ChatMessage};

fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SessionMessage {
    pub(crate) role: String,
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) timestamp: String,
    /// Anything else recorded with the message (tools used, sender).
    #[serde(flatten)]
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Session {
    pub(crate) key: String,
    pub(crate) name: Option<String>,
    pub(crate) messages: Vec<SessionMessage>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
    pub(crate) metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub(crate) fn new(key: &str) -> Self {
        let now = timestamp();
        Self {
            key: key.to_string(),
            name: None,
            messages: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }

    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    pub(crate) fn add_message(&mut self, role: &str, content: &str) {
        self.add_message_with(role, content, serde_json::Map::new());
    }

    pub(crate) fn add_message_with(
        &mut self,
        role: &str,
        content: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) {
        self.messages.push(SessionMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: timestamp(),
            extra,
        });
        self.updated_at = timestamp();
    }

    /// The last `max_messages`, then trimmed oldest-first to fit `max_tokens`.
    /// The newest message is always kept, even alone over budget.
    pub(crate) fn get_history(&self, max_messages: usize, max_tokens: Option<usize>) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max_messages);
        let recent = &self.messages[start..];
        let keep = match max_tokens {
            None => recent.len(),
            Some(budget) => {
                let mut total = 0usize;
                let mut kept = 0usize;
                for msg in recent.iter().rev() {
                    let tokens = estimate_tokens(&msg.content);
                    if kept > 0 && total + tokens > budget {
                        break;
                    }
                    total += tokens;
                    kept += 1;
                }
                if kept < recent.len() {
                    tracing::debug!(target: "session", key = %self.key, trimmed = recent.len() - kept, tokens = total, "trimmed history");
                }
                kept
            }
        };
        recent[recent.len() - keep..]
            .iter()
            .map(|m| ChatMessage::plain(&m.role, Some(m.content.clone())))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = timestamp();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    kind: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionInfo {
    pub(crate) key: String,
    pub(crate) name: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
    pub(crate) message_count: usize,
    pub(crate) path: PathBuf,
}

/// Sessions under one directory, with an in-process cache consulted before disk.
pub(crate) struct SessionManager {
    dir: PathBuf,
    cache: HashMap<String, Session>,
}

pub(crate) fn session_file_name(key: &str) -> String {
    let safe: String = key
        .replace(':', "_")
        .chars()
        .map(|c| if matches!(c, '<' | '>' | '"' | '/' | '\\' | '|' | '?' | '*') { '_' } else { c })
        .collect();
    format!("{safe}.jsonl")
}

impl SessionManager {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(session_file_name(key))
    }

    pub(crate) fn get_or_create(&mut self, key: &str) -> Session {
        if let Some(session) = self.cache.get(key) {
            return session.clone();
        }
        let session = match load_session(&self.path_for(key), key) {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(key),
            Err(e) => {
                tracing::warn!(target: "session", key, error = %e, "failed to load session, starting fresh");
                Session::new(key)
            }
        };
        self.cache.insert(key.to_string(), session.clone());
        session
    }

    pub(crate) fn save(&mut self, session: &Session) -> Result<(), String> {
        fs::create_dir_all(&self.dir).map_err(|e| format!("create sessions dir: {e}"))?;
        let path = self.path_for(&session.key);
        let mut metadata = session.metadata.clone();
        match &session.name {
            Some(name) => metadata.insert("name".into(), serde_json::Value::String(name.clone())),
            None => metadata.remove("name"),
        };
        let header = MetadataLine {
            kind: "metadata".into(),
            key: Some(session.key.clone()),
            created_at: Some(session.created_at.clone()),
            updated_at: Some(session.updated_at.clone()),
            metadata,
        };
        let mut body = serde_json::to_string(&header).map_err(|e| format!("encode session: {e}"))?;
        body.push('\n');
        for msg in &session.messages {
            body.push_str(&serde_json::to_string(msg).map_err(|e| format!("encode message: {e}"))?);
            body.push('\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| format!("write {}: {e}", tmp.display()))?;
        file.write_all(body.as_bytes())
            .map_err(|e| format!("write {}: {e}", tmp.display()))?;
        fs::rename(&tmp, &path).map_err(|e| format!("replace {}: {e}", path.display()))?;
        self.cache.insert(session.key.clone(), session.clone());
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &str) -> bool {
        self.cache.remove(key);
        fs::remove_file(self.path_for(key)).is_ok()
    }

    /// All sessions on disk, most recently updated first.
    pub(crate) fn list_sessions(&self) -> Vec<SessionInfo> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionInfo> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .filter_map(|path| {
                let fallback_key = path.file_stem()?.to_string_lossy().replacen('_', ":", 1);
                let session = load_session(&path, &fallback_key).ok().flatten()?;
                Some(SessionInfo {
                    key: session.key,
                    name: session.name,
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                    message_count: session.messages.len(),
                    path,
                })
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Move a session to a new key. Fails when the source is missing or the target exists.
    pub(crate) fn rename(&mut self, old_key: &str, new_key: &str) -> Result<(), String> {
        let old_path = self.path_for(old_key);
        let new_path = self.path_for(new_key);
        if !old_path.exists() {
            return Err(format!("Session {old_key} not found"));
        }
        if new_path.exists() {
            return Err(format!("Session {new_key} already exists"));
        }
        let mut session = self.get_or_create(old_key);
        session.key = new_key.to_string();
        session.updated_at = timestamp();
        self.save(&session)?;
        fs::remove_file(&old_path).map_err(|e| format!("remove {}: {e}", old_path.display()))?;
        self.cache.remove(old_key);
        tracing::info!(target: "session", from = old_key, to = new_key, "renamed session");
        Ok(())
    }

    pub(crate) fn set_name(&mut self, key: &str, name: &str) -> Result<(), String> {
        let mut session = self.get_or_create(key);
        session.name = Some(name.to_string());
        session.updated_at = timestamp();
        self.save(&session)
    }
}

fn load_session(path: &Path, key: &str) -> Result<Option<Session>, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("read {}: {e}", path.display())),
    };
    let mut session = Session::new(key);
    let mut saw_header = false;
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("parse {}: {e}", path.display()))?;
        if value.get("_type").and_then(|v| v.as_str()) == Some("metadata") {
            let header: MetadataLine =
                serde_json::from_value(value).map_err(|e| format!("parse metadata: {e}"))?;
            if let Some(stored) = header.key {
                session.key = stored;
            }
            if let Some(created) = header.created_at {
                session.created_at = created;
            }
            if let Some(updated) = header.updated_at {
                session.updated_at = updated;
            }
            session.name = header.metadata.get("name").and_then(|v| v.as_str()).map(str::to_string);
            session.metadata = header.metadata;
            session.metadata.remove("name");
            saw_header = true;
        } else {
            let msg: SessionMessage =
                serde_json::from_value(value).map_err(|e| format!("parse message: {e}"))?;
            session.messages.push(msg);
        }
    }
    Ok(saw_header.then_some(session))
}
