//! `glob` and `grep` over the workspace, bounded so a huge tree cannot stall the agent.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use walkdir::WalkDir;

use super::{parse_args, Tool, ToolContext};
use crate::WorkspaceSandbox;

pub(crate) const MAX_GLOB_RESULTS: usize = 100;
pub(crate) const MAX_GREP_RESULTS: usize = 50;
pub(crate) const MAX_FILES_TO_SCAN: usize = 1000;
pub(crate) const MAX_PATTERN_LENGTH: usize = 1000;
pub(crate) const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Translate a glob into an anchored regex over `/`-separated relative paths.
/// `**/` spans any number of directories, `*` and `?` stay inside one segment.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:[^/]*/)*");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match chars[i..].iter().position(|&c| c == ']') {
                Some(end) if end > 1 => {
                    let body: String = chars[i + 1..i + end].iter().collect();
                    let body = body.strip_prefix('!').map(|b| format!("^{b}")).unwrap_or(body);
                    out.push('[');
                    out.push_str(&body.replace('\\', "\\\\"));
                    out.push(']');
                    i += end + 1;
                    continue;
                }
                _ => out.push_str("\\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).map_err(|e| format!("Invalid glob pattern: {e}"))
}

fn rel_slash(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn search_root(sandbox: &WorkspaceSandbox, path: Option<&str>) -> Result<PathBuf, String> {
    match path.filter(|p| !p.trim().is_empty()) {
        Some(raw) => sandbox.resolve(raw).map_err(|e| e.to_string()),
        None => Ok(sandbox.default_root()),
    }
}

/// Binary (NUL in the first KiB), oversized, or unreadable files are skipped.
fn should_skip_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return true;
    };
    if meta.len() > MAX_FILE_SIZE {
        return true;
    }
    let Ok(mut file) = fs::File::open(path) else {
        return true;
    };
    let mut head = [0u8; 1024];
    match file.read(&mut head) {
        Ok(n) => head[..n].contains(&0),
        Err(_) => true,
    }
}

#[derive(Debug, Deserialize)]
struct GlobArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

pub(crate) struct GlobTool {
    sandbox: WorkspaceSandbox,
}

impl GlobTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (e.g., '**/*.py', 'src/**/*.ts')"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Glob pattern to match files (e.g., '**/*.py')"},
                "path": {"type": "string", "description": "Directory to search in (defaults to workspace root)"}
            },
            "required": ["pattern"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: GlobArgs = parse_args(args)?;
        if parsed.pattern.len() > MAX_PATTERN_LENGTH {
            return Err(format!("Pattern too long (max {MAX_PATTERN_LENGTH} characters)"));
        }
        let root = search_root(&self.sandbox, parsed.path.as_deref())?;
        if !root.is_dir() {
            return Err(format!("Not a directory: {}", root.display()));
        }
        let matcher = glob_to_regex(&parsed.pattern)?;

        let mut matches = Vec::new();
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path_is_symlink() {
                continue;
            }
            let rel = rel_slash(entry.path(), &root);
            if matcher.is_match(&rel) && self.sandbox.contains(entry.path()) {
                matches.push(rel);
                if matches.len() >= MAX_GLOB_RESULTS * 2 {
                    break;
                }
            }
        }
        if matches.is_empty() {
            return Ok(format!("No files found matching '{}'", parsed.pattern));
        }
        matches.sort();
        let mut output = matches
            .iter()
            .take(MAX_GLOB_RESULTS)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if matches.len() > MAX_GLOB_RESULTS {
            output.push_str(&format!("\n... and {} more files", matches.len() - MAX_GLOB_RESULTS));
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
}

pub(crate) struct GrepTool {
    sandbox: WorkspaceSandbox,
}

impl GrepTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }

    fn collect_files(&self, root: &Path, filter: &str) -> Result<Vec<PathBuf>, String> {
        let matcher = glob_to_regex(filter)?;
        let by_name = !filter.contains('/');
        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let subject = if by_name {
                entry.file_name().to_string_lossy().to_string()
            } else {
                rel_slash(entry.path(), root)
            };
            if matcher.is_match(&subject) && self.sandbox.contains(entry.path()) {
                files.push(entry.into_path());
                if files.len() >= MAX_FILES_TO_SCAN {
                    break;
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in files. Returns matching lines with file paths and line numbers."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regex pattern to search for"},
                "path": {"type": "string", "description": "File or directory to search (defaults to workspace)"},
                "glob": {"type": "string", "description": "File pattern filter (e.g., '*.py'). Only used when path is a directory."},
                "case_insensitive": {"type": "boolean", "description": "Ignore case when matching (default: false)"}
            },
            "required": ["pattern"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: GrepArgs = parse_args(args)?;
        if parsed.pattern.len() > MAX_PATTERN_LENGTH {
            return Err(format!("Pattern too long (max {MAX_PATTERN_LENGTH} characters)"));
        }
        let regex = RegexBuilder::new(&parsed.pattern)
            .case_insensitive(parsed.case_insensitive)
            .build()
            .map_err(|e| format!("Invalid regex pattern: {e}"))?;

        let target = search_root(&self.sandbox, parsed.path.as_deref())?;
        let (files, base) = if target.is_file() {
            let base = target.parent().map(Path::to_path_buf).unwrap_or_default();
            (vec![target.clone()], base)
        } else if target.is_dir() {
            let filter = parsed.glob.as_deref().filter(|g| !g.is_empty()).unwrap_or("*");
            (self.collect_files(&target, filter)?, target.clone())
        } else {
            return Err(format!("Path not found: {}", target.display()));
        };

        let mut results = Vec::new();
        'files: for file in &files {
            if should_skip_file(file) {
                continue;
            }
            let Ok(bytes) = fs::read(file) else { continue };
            let content = String::from_utf8_lossy(&bytes);
            let rel = rel_slash(file, &base);
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(format!("{rel}:{}: {}", idx + 1, line.trim()));
                    if results.len() >= MAX_GREP_RESULTS {
                        break 'files;
                    }
                }
            }
        }
        if results.is_empty() {
            return Ok(format!("No matches found for pattern '{}'", parsed.pattern));
        }
        let mut output = results.join("\n");
        if results.len() >= MAX_GREP_RESULTS {
            output.push_str(&format!("\n... (limited to {MAX_GREP_RESULTS} results)"));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("search_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("src/nested")).unwrap();
        fs::write(dir.join("src/main.rs"), "fn main() {\n    println!(\"hi\");\n}\n").unwrap();
        fs::write(dir.join("src/nested/lib.rs"), "pub fn Helper() {}\n").unwrap();
        fs::write(dir.join("README.md"), "# readme\nfn is mentioned here\n").unwrap();
        fs::write(dir.join("blob.bin"), [0u8, 1, 2, b'f', b'n']).unwrap();
        dir
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("**/*.rs").unwrap();
        assert!(re.is_match("main.rs"));
        assert!(re.is_match("src/nested/lib.rs"));
        assert!(!re.is_match("src/lib.rsx"));
        let single = glob_to_regex("src/*.rs").unwrap();
        assert!(single.is_match("src/main.rs"));
        assert!(!single.is_match("src/nested/lib.rs"));
        assert!(glob_to_regex("file[0-9].txt").unwrap().is_match("file7.txt"));
        assert!(glob_to_regex("a.b").unwrap().is_match("a.b"));
        assert!(!glob_to_regex("a.b").unwrap().is_match("axb"));
    }

    #[test]
    fn test_glob_tool() {
        let dir = workspace("glob");
        let tool = GlobTool::new(WorkspaceSandbox::new(Some(dir), true));
        let ctx = ToolContext::default();
        let out = tool.execute(&serde_json::json!({"pattern": "**/*.rs"}), &ctx).unwrap();
        assert_eq!(out, "src/main.rs\nsrc/nested/lib.rs");
        let none = tool.execute(&serde_json::json!({"pattern": "*.py"}), &ctx).unwrap();
        assert_eq!(none, "No files found matching '*.py'");
        assert!(tool
            .execute(&serde_json::json!({"pattern": "*", "path": "README.md"}), &ctx)
            .unwrap_err()
            .starts_with("Not a directory"));
    }

    #[test]
    fn test_grep_tool() {
        let dir = workspace("grep");
        let tool = GrepTool::new(WorkspaceSandbox::new(Some(dir), true));
        let ctx = ToolContext::default();
        let out = tool
            .execute(&serde_json::json!({"pattern": "fn ", "glob": "*.rs"}), &ctx)
            .unwrap();
        assert_eq!(out, "src/main.rs:1: fn main() {\nsrc/nested/lib.rs:1: pub fn Helper() {}");

        let ci = tool
            .execute(&serde_json::json!({"pattern": "helper", "case_insensitive": true}), &ctx)
            .unwrap();
        assert!(ci.contains("lib.rs:1"));
        let all = tool.execute(&serde_json::json!({"pattern": "fn"}), &ctx).unwrap();
        assert!(!all.contains("blob.bin"));
        assert!(tool
            .execute(&serde_json::json!({"pattern": "("}), &ctx)
            .unwrap_err()
            .starts_with("Invalid regex pattern"));
        let long = "a".repeat(MAX_PATTERN_LENGTH + 1);
        assert_eq!(
            tool.execute(&serde_json::json!({"pattern": long}), &ctx).unwrap_err(),
            "Pattern too long (max 1000 characters)"
        );
        assert_eq!(
            tool.execute(&serde_json::json!({"pattern": "zzz_nothing"}), &ctx).unwrap(),
            "No matches found for pattern 'zzz_nothing'"
        );
    }

    #[test]
    fn test_grep_caps_results() {
        let dir = workspace("grep_cap");
        let body: String = (0..80).map(|i| format!("match line {i}\n")).collect();
        fs::write(dir.join("many.txt"), body).unwrap();
        let tool = GrepTool::new(WorkspaceSandbox::new(Some(dir), true));
        let out = tool
            .execute(&serde_json::json!({"pattern": "match line", "path": "many.txt"}), &ToolContext::default())
            .unwrap();
        assert_eq!(out.lines().count(), MAX_GREP_RESULTS + 1);
        assert!(out.ends_with("... (limited to 50 results)"));
    }
}
