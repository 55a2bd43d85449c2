//! Semantic memory tools. Backends are resolved per call: the context's handle wins,
//! otherwise the tool's own lazily built one.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::{resolve_lenient, LazyMemory, MemoryBackend, MEMORY_DIR, PERMANENT_FILE};

const SNIPPET_CHARS: usize = 700;

fn backend(own: &Arc<LazyMemory>, ctx: &ToolContext) -> Result<Arc<MemoryBackend>, String> {
    ctx.memory.as_ref().unwrap_or(own).get()
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) struct MemorySearchTool {
    memory: Arc<LazyMemory>,
}

impl MemorySearchTool {
    pub(crate) fn new(memory: Arc<LazyMemory>) -> Self {
        Self { memory }
    }
}

impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory (MEMORY.md and daily logs) by meaning and keywords. \
         Use before answering questions about prior work, decisions, people or preferences."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "limit": {"type": "integer", "description": "Maximum results (default from config)"}
            },
            "required": ["query"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: SearchArgs = parse_args(args)?;
        if parsed.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        let backend = backend(&self.memory, ctx)?;
        let hits = backend.search(&parsed.query, parsed.limit)?;
        if hits.is_empty() {
            return Ok(format!("No memories found for '{}'", parsed.query));
        }
        let blocks: Vec<String> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let snippet: String = hit.text.chars().take(SNIPPET_CHARS).collect();
                format!(
                    "{}. {} (lines {}-{}, score {:.2})\n{}",
                    i + 1,
                    hit.file_path,
                    hit.start_line,
                    hit.end_line,
                    hit.score,
                    snippet.trim()
                )
            })
            .collect();
        Ok(blocks.join("\n\n"))
    }
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    content: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

pub(crate) struct MemoryWriteTool {
    memory: Arc<LazyMemory>,
}

impl MemoryWriteTool {
    pub(crate) fn new(memory: Arc<LazyMemory>) -> Self {
        Self { memory }
    }
}

impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Save information to memory. target='daily' (default) appends a timestamped note to \
         today's log; target='permanent' writes to MEMORY.md for durable facts and preferences."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The text to save"},
                "target": {"type": "string", "enum": ["daily", "permanent"], "description": "Where to save it"},
                "mode": {
                    "type": "string",
                    "enum": ["append", "replace"],
                    "description": "For permanent memory: append (default) or replace the whole file"
                }
            },
            "required": ["content"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: WriteArgs = parse_args(args)?;
        if parsed.content.trim().is_empty() {
            return Err("content must not be empty".into());
        }
        let backend = backend(&self.memory, ctx)?;
        let store = &backend.store;
        let (path, summary) = match parsed.target.as_deref().unwrap_or("daily") {
            "permanent" => {
                if parsed.mode.as_deref() == Some("replace") {
                    store.write_permanent(&parsed.content)?;
                } else {
                    store.append_permanent(parsed.content.trim())?;
                }
                (store.permanent_path(), "Saved to MEMORY.md".to_string())
            }
            _ => {
                let path = store.append_daily_log(&parsed.content, None)?;
                let summary = format!("Saved to {}", store.relative_name(&path));
                (path, summary)
            }
        };
        // The write already succeeded; an indexing failure only delays searchability.
        if let Err(e) = backend.reindex_file(&path) {
            tracing::warn!(target: "memory_tools", file = %path.display(), error = %e, "reindex after write failed");
            return Ok(format!("{summary} (search index not updated: {e})"));
        }
        Ok(summary)
    }
}

#[derive(Debug, Deserialize)]
struct GetArgs {
    path: String,
    #[serde(default)]
    from_line: Option<usize>,
    #[serde(default)]
    lines: Option<usize>,
}

pub(crate) struct MemoryGetTool {
    memory: Arc<LazyMemory>,
}

impl MemoryGetTool {
    pub(crate) fn new(memory: Arc<LazyMemory>) -> Self {
        Self { memory }
    }
}

impl Tool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "Read a memory file (MEMORY.md or memory/*.md), optionally a line range from a search hit."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative memory file, e.g. memory/2025-01-31.md"},
                "from_line": {"type": "integer", "description": "First line to return (1-based)"},
                "lines": {"type": "integer", "description": "Number of lines to return"}
            },
            "required": ["path"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: GetArgs = parse_args(args)?;
        let backend = backend(&self.memory, ctx)?;
        let workspace = resolve_lenient(backend.store.workspace());
        let requested = resolve_lenient(&workspace.join(parsed.path.trim()));
        let allowed = requested == workspace.join(PERMANENT_FILE)
            || (requested.starts_with(workspace.join(MEMORY_DIR))
                && requested.extension().map(|e| e == "md").unwrap_or(false));
        if !allowed {
            return Err(format!("Not a memory file: {}", parsed.path));
        }
        let path: PathBuf = requested;
        let content = fs::read_to_string(&path).map_err(|_| format!("Memory file not found: {}", parsed.path))?;
        let start = parsed.from_line.unwrap_or(1).max(1);
        let selected: Vec<&str> = content
            .lines()
            .skip(start - 1)
            .take(parsed.lines.unwrap_or(usize::MAX))
            .collect();
        if selected.is_empty() {
            return Ok(format!("{} has no content in that range", parsed.path));
        }
        Ok(selected.join("\n"))
    }
}

pub(crate) struct MemoryListTool {
    memory: Arc<LazyMemory>,
}

impl MemoryListTool {
    pub(crate) fn new(memory: Arc<LazyMemory>) -> Self {
        Self { memory }
    }
}

impl Tool for MemoryListTool {
    fn name(&self) -> &str {
        "memory_list"
    }

    fn description(&self) -> &str {
        "List memory files with their sizes and the state of the search index."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let backend = backend(&self.memory, ctx)?;
        let files = backend.store.list_memory_files();
        if files.is_empty() {
            return Ok("No memory files yet.".to_string());
        }
        let mut lines: Vec<String> = files
            .iter()
            .map(|path| {
                let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                format!("- {} ({size} bytes)", backend.store.relative_name(path))
            })
            .collect();
        match backend.index.get_stats() {
            Ok(stats) => lines.push(format!(
                "\nIndex: {} chunks from {} files ({} backend, dimension {})",
                stats.total_chunks,
                stats.indexed_files,
                backend.index.backend_name(),
                stats.dimension
            )),
            Err(e) => lines.push(format!("\nIndex unavailable: {e}")),
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HashEmbedding, MemorySettings, ToolRegistry};

    fn registry(name: &str) -> (ToolRegistry, Arc<MemoryBackend>) {
        let ws = std::env::temp_dir()
            .join("icron_test")
            .join(format!("memtools_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&ws);
        fs::create_dir_all(&ws).unwrap();
        let backend =
            Arc::new(MemoryBackend::open(&ws, &MemorySettings::default(), Arc::new(HashEmbedding::new(64))).unwrap());
        let lazy = Arc::new(LazyMemory::injected(backend.clone()));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(MemorySearchTool::new(lazy.clone())));
        reg.register(Arc::new(MemoryWriteTool::new(lazy.clone())));
        reg.register(Arc::new(MemoryGetTool::new(lazy.clone())));
        reg.register(Arc::new(MemoryListTool::new(lazy)));
        (reg, backend)
    }

    #[test]
    fn test_write_then_search() {
        let (reg, backend) = registry("write_search");
        let ctx = ToolContext::default();
        let out = reg.execute(
            "memory_write",
            &serde_json::json!({"content": "User's cat is named Miso", "target": "permanent"}),
            &ctx,
        );
        assert_eq!(out, "Saved to MEMORY.md");
        let daily = reg.execute("memory_write", &serde_json::json!({"content": "shipped release 1.2"}), &ctx);
        assert!(daily.starts_with("Saved to memory/"));
        assert_eq!(backend.index.get_indexed_files().unwrap().len(), 2);

        let hits = reg.execute("memory_search", &serde_json::json!({"query": "cat Miso"}), &ctx);
        assert!(hits.starts_with("1. MEMORY.md"));
        assert!(hits.contains("Miso"));
    }

    #[test]
    fn test_get_and_list() {
        let (reg, backend) = registry("get_list");
        backend.store.write_permanent("line one\nline two\nline three").unwrap();
        let ctx = ToolContext::default();
        assert_eq!(
            reg.execute("memory_get", &serde_json::json!({"path": "MEMORY.md", "from_line": 2, "lines": 1}), &ctx),
            "line two"
        );
        assert!(reg
            .execute("memory_get", &serde_json::json!({"path": "../etc/passwd"}), &ctx)
            .starts_with("Error: Not a memory file"));
        let listing = reg.execute("memory_list", &serde_json::json!({}), &ctx);
        assert!(listing.starts_with("- MEMORY.md"));
        assert!(listing.contains("Index: 0 chunks"));
    }

    #[test]
    fn test_context_handle_overrides_own() {
        let (_reg, backend) = registry("override");
        let mut config = crate::FileConfig::default();
        config.memory.enabled = false;
        let disabled = Arc::new(LazyMemory::from_config(&config));
        let tool = MemoryListTool::new(disabled.clone());
        assert!(tool.execute(&serde_json::json!({}), &ToolContext::default()).is_err());
        let ctx = ToolContext::default().with_memory(Some(Arc::new(LazyMemory::injected(backend))));
        assert!(tool.execute(&serde_json::json!({}), &ctx).is_ok());
    }
}
