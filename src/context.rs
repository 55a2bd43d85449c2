//! System prompt assembly, skill discovery and the workspace skeleton written by `init`.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::Local;

use crate::{truncate_with_marker, ChatMessage, ImageAttachment, MemoryStore, MEMORY_DIR, PERMANENT_FILE};

/// Workspace files folded into the system prompt when present, in this order.
pub(crate) const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];
pub(crate) const SKILLS_DIR: &str = "skills";
const MAX_SECTION_CHARS: usize = 20_000;
const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

// ── Skills ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SkillInfo {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) emoji: String,
    pub(crate) path: PathBuf,
}

/// Pull `key: value` pairs out of a `---` frontmatter block (optionally wrapped in a
/// ```` ```skill ```` fence).
pub(crate) fn parse_frontmatter(content: &str) -> Option<Vec<(String, String)>> {
    let body = content.strip_prefix("```skill\n").unwrap_or(content);
    let rest = body.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    let pairs = rest[..end]
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.starts_with(' ') || key.trim().is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect();
    Some(pairs)
}

fn parse_skill(skill_file: &Path) -> Option<SkillInfo> {
    let content = fs::read_to_string(skill_file).ok()?;
    let pairs = parse_frontmatter(&content)?;
    let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
    let dir = skill_file.parent()?;
    let dir_name = dir.file_name()?.to_string_lossy().to_string();
    let emoji = get("emoji")
        .or_else(|| {
            let metadata: serde_json::Value = serde_json::from_str(&get("metadata")?).ok()?;
            metadata.pointer("/icron/emoji")?.as_str().map(str::to_string)
        })
        .unwrap_or_else(|| "📦".to_string());
    Some(SkillInfo {
        name: get("name").filter(|n| !n.is_empty()).unwrap_or(dir_name),
        description: get("description").unwrap_or_else(|| "No description".to_string()),
        emoji,
        path: dir.to_path_buf(),
    })
}

/// Every `<dir>/<skill>/SKILL.md` with parseable frontmatter, sorted by name.
pub(crate) fn discover_skills(dirs: &[PathBuf]) -> Vec<SkillInfo> {
    let mut skills: Vec<SkillInfo> = dirs
        .iter()
        .filter_map(|dir| fs::read_dir(dir).ok())
        .flat_map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let file = p.join("SKILL.md");
            let parsed = parse_skill(&file);
            if parsed.is_none() && file.exists() {
                tracing::warn!(target: "context", skill = %p.display(), "SKILL.md has no usable frontmatter");
            }
            parsed
        })
        .collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills.dedup_by(|a, b| a.name == b.name);
    skills
}

// ── Prompt ──────────────────────────────────────────────────────────────

fn read_section(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| truncate_with_marker(trimmed, MAX_SECTION_CHARS))
}

pub(crate) struct ContextBuilder {
    workspace: PathBuf,
    skills_dirs: Vec<PathBuf>,
}

impl ContextBuilder {
    pub(crate) fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            skills_dirs: vec![workspace.join(SKILLS_DIR)],
        }
    }

    pub(crate) fn skills_dirs(&self) -> &[PathBuf] {
        &self.skills_dirs
    }

    fn identity(&self) -> String {
        let now = Local::now();
        format!(
            "# icron\n\n\
             You are icron, a personal AI assistant. You can read, write and edit files, run \
             shell commands, search the web, take screenshots, set reminders, message the user \
             and keep long-term memory.\n\n\
             ## Current Time\n{}\n\n\
             ## Workspace\nYour workspace is at: {}\n\
             - Long-term memory: {}/{PERMANENT_FILE}\n\
             - Daily notes: {}/{MEMORY_DIR}/YYYY-MM-DD.md\n\
             - Skills: {}/{SKILLS_DIR}/<name>/SKILL.md\n\n\
             Use memory_search before answering questions about earlier work, and memory_write to \
             save facts worth keeping. Reply directly with text for normal conversation; use the \
             message tool only to send something to a specific chat.",
            now.format("%Y-%m-%d %H:%M (%A)"),
            self.workspace.display(),
            self.workspace.display(),
            self.workspace.display(),
            self.workspace.display(),
        )
    }

    pub(crate) fn skills_summary(&self) -> Option<String> {
        let skills = discover_skills(&self.skills_dirs);
        if skills.is_empty() {
            return None;
        }
        let lines: Vec<String> = skills
            .iter()
            .map(|s| format!("- {} **{}**: {} ({}/SKILL.md)", s.emoji, s.name, s.description, s.path.display()))
            .collect();
        Some(format!(
            "# Skills\n\nRead a skill's SKILL.md with read_file before using it.\n\n{}",
            lines.join("\n")
        ))
    }

    pub(crate) fn build_system_prompt(&self) -> String {
        let mut sections = vec![self.identity()];
        for name in BOOTSTRAP_FILES {
            if let Some(text) = read_section(&self.workspace.join(name)) {
                sections.push(format!("## {name}\n\n{text}"));
            }
        }
        if let Ok(store) = MemoryStore::new(&self.workspace) {
            let permanent = store.read_permanent();
            if !permanent.trim().is_empty() {
                sections.push(format!(
                    "# Memory\n\n## Long-term\n{}",
                    truncate_with_marker(permanent.trim(), MAX_SECTION_CHARS)
                ));
            }
            let today = store.read_daily_log(None);
            if !today.trim().is_empty() {
                sections.push(format!(
                    "## Today's notes\n{}",
                    truncate_with_marker(today.trim(), MAX_SECTION_CHARS)
                ));
            }
        }
        if let Some(skills) = self.skills_summary() {
            sections.push(skills);
        }
        sections.join("\n\n---\n\n")
    }

    /// System prompt, then history, then the current message with any readable images.
    pub(crate) fn build_messages(&self, history: Vec<ChatMessage>, current: &str, media: &[String]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&self.build_system_prompt()));
        messages.extend(history);
        let images: Vec<ImageAttachment> = media.iter().filter_map(|p| load_image(Path::new(p))).collect();
        if images.is_empty() {
            messages.push(ChatMessage::user(current));
        } else {
            messages.push(ChatMessage::user_with_images(current, images));
        }
        messages
    }
}

pub(crate) fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Base64 image attachment, or `None` for non-images and unreadable or oversized files.
pub(crate) fn load_image(path: &Path) -> Option<ImageAttachment> {
    let media_type = image_media_type(path)?;
    let meta = fs::metadata(path).ok()?;
    if meta.len() > MAX_IMAGE_BYTES {
        tracing::warn!(target: "context", path = %path.display(), bytes = meta.len(), "image too large to attach");
        return None;
    }
    let bytes = fs::read(path).ok()?;
    Some(ImageAttachment {
        media_type: media_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

// ── Workspace skeleton ──────────────────────────────────────────────────

const AGENTS_TEMPLATE: &str = "# Agent Instructions\n\n\
- Be concise, accurate and friendly.\n\
- Explain what you are doing before running commands that change things.\n\
- Save durable facts about the user with memory_write (target=permanent).\n";
const SOUL_TEMPLATE: &str = "# Soul\n\nI am icron, a lightweight personal assistant.\n\n\
- Helpful and direct\n- Curious and careful\n";
const USER_TEMPLATE: &str = "# User\n\nInformation about the user goes here.\n\n\
- Name:\n- Timezone:\n- Preferences:\n";
const MEMORY_TEMPLATE: &str = "# Long-term Memory\n\nImportant facts, preferences and decisions go here.\n";

/// Create the workspace layout. Existing files are left untouched; returns what was created.
pub(crate) fn bootstrap_workspace(workspace: &Path) -> Result<Vec<PathBuf>, String> {
    fs::create_dir_all(workspace.join(MEMORY_DIR)).map_err(|e| format!("create memory dir: {e}"))?;
    fs::create_dir_all(workspace.join(SKILLS_DIR)).map_err(|e| format!("create skills dir: {e}"))?;
    let mut created = Vec::new();
    for (name, body) in [
        ("AGENTS.md", AGENTS_TEMPLATE),
        ("SOUL.md", SOUL_TEMPLATE),
        ("USER.md", USER_TEMPLATE),
        (PERMANENT_FILE, MEMORY_TEMPLATE),
    ] {
        let path = workspace.join(name);
        if path.exists() {
            continue;
        }
        fs::write(&path, body).map_err(|e| format!("write {}: {e}", path.display()))?;
        created.push(path);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(name: &str) -> PathBuf {
        let ws = std::env::temp_dir()
            .join("icron_test")
            .join(format!("context_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&ws);
        fs::create_dir_all(&ws).unwrap();
        ws
    }

    #[test]
    fn test_frontmatter() {
        let pairs = parse_frontmatter("---\nname: weather\ndescription: \"Get weather\"\n---\n# Body").unwrap();
        assert_eq!(pairs[0], ("name".to_string(), "weather".to_string()));
        assert_eq!(pairs[1].1, "Get weather");
        assert!(parse_frontmatter("```skill\n---\nname: x\n---\n").is_some());
        assert!(parse_frontmatter("# no frontmatter").is_none());
    }

    #[test]
    fn test_system_prompt_includes_memory_and_skills() {
        let ws = workspace("prompt");
        bootstrap_workspace(&ws).unwrap();
        fs::write(ws.join("MEMORY.md"), "User prefers metric units.").unwrap();
        let skill = ws.join("skills").join("weather");
        fs::create_dir_all(&skill).unwrap();
        fs::write(
            skill.join("SKILL.md"),
            "---\nname: weather\ndescription: Current weather\nmetadata: {\"icron\":{\"emoji\":\"🌤️\"}}\n---\n",
        )
        .unwrap();

        let builder = ContextBuilder::new(&ws);
        let prompt = builder.build_system_prompt();
        assert!(prompt.starts_with("# icron"));
        assert!(prompt.contains("User prefers metric units."));
        assert!(prompt.contains("## SOUL.md"));
        assert!(prompt.contains("🌤️ **weather**: Current weather"));

        let skills = discover_skills(builder.skills_dirs());
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].emoji, "🌤️");
    }

    #[test]
    fn test_build_messages_attaches_images() {
        let ws = workspace("images");
        let png = ws.join("shot.png");
        fs::write(&png, [0x89u8, b'P', b'N', b'G']).unwrap();
        let builder = ContextBuilder::new(&ws);
        let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant(Some("ok".into()), vec![])];
        let messages = builder.build_messages(
            history,
            "what is this?",
            &[png.display().to_string(), ws.join("notes.txt").display().to_string()],
        );
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        let last = messages.last().unwrap();
        assert_eq!(last.content.as_deref(), Some("what is this?"));
        assert_eq!(last.images.len(), 1);
        assert_eq!(last.images[0].media_type, "image/png");
    }

    #[test]
    fn test_bootstrap_keeps_existing_files() {
        let ws = workspace("bootstrap");
        fs::write(ws.join("USER.md"), "custom").unwrap();
        let created = bootstrap_workspace(&ws).unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(fs::read_to_string(ws.join("USER.md")).unwrap(), "custom");
        assert!(bootstrap_workspace(&ws).unwrap().is_empty());
    }
}
