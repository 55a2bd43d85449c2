//! Markdown memory files: a permanent `MEMORY.md` and dated daily logs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};

use crate::{is_daily_log_name, relative_display};

pub(crate) const PERMANENT_FILE: &str = "MEMORY.md";
pub(crate) const MEMORY_DIR: &str = "memory";
pub(crate) const DEFAULT_CHUNK_TOKENS: usize = 400;
pub(crate) const DEFAULT_CHUNK_OVERLAP: usize = 80;
const CHARS_PER_TOKEN: usize = 4;

/// A contiguous run of source lines, 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextChunk {
    pub(crate) text: String,
    pub(crate) start_line: usize,
    pub(crate) end_line: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryStore {
    workspace: PathBuf,
}

impl MemoryStore {
    pub(crate) fn new(workspace: &Path) -> Result<Self, String> {
        fs::create_dir_all(workspace.join(MEMORY_DIR))
            .map_err(|e| format!("create memory dir: {e}"))?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
        })
    }

    pub(crate) fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub(crate) fn memory_dir(&self) -> PathBuf {
        self.workspace.join(MEMORY_DIR)
    }

    pub(crate) fn permanent_path(&self) -> PathBuf {
        self.workspace.join(PERMANENT_FILE)
    }

    pub(crate) fn daily_log_path(&self, date: Option<NaiveDate>) -> PathBuf {
        let date = date.unwrap_or_else(|| Local::now().date_naive());
        self.memory_dir().join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub(crate) fn read_permanent(&self) -> String {
        fs::read_to_string(self.permanent_path()).unwrap_or_default()
    }

    pub(crate) fn write_permanent(&self, content: &str) -> Result<(), String> {
        fs::write(self.permanent_path(), content).map_err(|e| format!("write MEMORY.md: {e}"))
    }

    pub(crate) fn append_permanent(&self, content: &str) -> Result<(), String> {
        let existing = self.read_permanent();
        let separator = if existing.is_empty() { "" } else { "\n\n" };
        self.write_permanent(&format!("{existing}{separator}{content}"))
    }

    pub(crate) fn read_daily_log(&self, date: Option<NaiveDate>) -> String {
        fs::read_to_string(self.daily_log_path(date)).unwrap_or_default()
    }

    /// Append a `- [HH:MM] entry` bullet, creating the `# YYYY-MM-DD` heading on first write.
    pub(crate) fn append_daily_log(&self, entry: &str, date: Option<NaiveDate>) -> Result<PathBuf, String> {
        fs::create_dir_all(self.memory_dir()).map_err(|e| format!("create memory dir: {e}"))?;
        let now = Local::now();
        let date = date.unwrap_or_else(|| now.date_naive());
        let path = self.daily_log_path(Some(date));
        let bullet = format!("- [{}] {}", now.format("%H:%M"), entry.trim());

        let content = match fs::read_to_string(&path) {
            Ok(existing) if !existing.trim().is_empty() => {
                format!("{}\n{bullet}\n", existing.trim_end())
            }
            _ => format!("# {}\n\n{bullet}\n", date.format("%Y-%m-%d")),
        };
        fs::write(&path, content).map_err(|e| format!("write daily log: {e}"))?;
        Ok(path)
    }

    /// `MEMORY.md` first when present, then daily logs newest first.
    pub(crate) fn list_memory_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let permanent = self.permanent_path();
        if permanent.is_file() {
            files.push(permanent);
        }
        let mut logs: Vec<PathBuf> = fs::read_dir(self.memory_dir())
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| {
                        path.is_file()
                            && path
                                .file_name()
                                .map(|n| is_daily_log_name(&n.to_string_lossy()))
                                .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        logs.sort();
        logs.reverse();
        files.extend(logs);
        files
    }

    /// Workspace-relative display name used as the index `file_path` key.
    pub(crate) fn relative_name(&self, path: &Path) -> String {
        relative_display(path, &self.workspace)
    }

    pub(crate) fn chunk_file(
        &self,
        path: &Path,
        chunk_tokens: usize,
        overlap_tokens: usize,
    ) -> Result<Vec<TextChunk>, String> {
        let text = fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        Ok(chunk_text(&text, chunk_tokens, overlap_tokens))
    }
}

/// Split `text` into line-aligned chunks of roughly `chunk_tokens` tokens.
///
/// Each new chunk is seeded with the tail of the previous one, up to `overlap_tokens`.
/// When overlap is enabled at least one line is carried, and never the whole previous
/// chunk when it had more than one line, so the walk always advances.
pub(crate) fn chunk_text(text: &str, chunk_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chars = chunk_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;
    let line_cost = |line: &str| line.chars().count() + 1;

    let mut chunks = Vec::new();
    let mut current: Vec<(usize, &str)> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, line) in text.lines().enumerate() {
        let cost = line_cost(line);
        if current_chars + cost > max_chars && !current.is_empty() {
            chunks.push(build_chunk(&current));

            let mut keep = 0usize;
            if overlap_chars > 0 {
                let mut kept_chars = 0usize;
                for (_, prev) in current.iter().rev() {
                    let prev_cost = line_cost(prev);
                    if keep > 0 && kept_chars + prev_cost > overlap_chars {
                        break;
                    }
                    keep += 1;
                    kept_chars += prev_cost;
                }
                if current.len() > 1 {
                    keep = keep.min(current.len() - 1);
                }
            }
            current.drain(..current.len() - keep);
            current_chars = current.iter().map(|(_, l)| line_cost(l)).sum();
        }
        current.push((idx + 1, line));
        current_chars += cost;
    }

    if !current.is_empty() {
        chunks.push(build_chunk(&current));
    }
    chunks
}

fn build_chunk(lines: &[(usize, &str)]) -> TextChunk {
    let start_line = lines.first().map(|(n, _)| *n).unwrap_or(1);
    let end_line = lines.last().map(|(n, _)| *n).unwrap_or(start_line);
    let text = lines.iter().map(|(_, l)| *l).collect::<Vec<_>>().join("\n");
    TextChunk {
        text,
        start_line,
        end_line,
    }
}
