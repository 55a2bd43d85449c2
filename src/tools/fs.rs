//! File tools. Every path goes through the workspace sandbox before it is touched.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use super::{parse_args, Tool, ToolContext};
use crate::WorkspaceSandbox;

fn io_error(action: &str, path: &str, err: std::io::Error) -> String {
    if err.kind() == ErrorKind::PermissionDenied {
        format!("Error: Permission denied: {path}")
    } else {
        format!("Error {action}: {err}")
    }
}

fn path_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {"path": {"type": "string", "description": description}},
        "required": ["path"]
    })
}

fn transfer_schema(verb: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "source": {"type": "string", "description": format!("The source path to {verb}")},
            "destination": {"type": "string", "description": "The destination path"}
        },
        "required": ["source", "destination"]
    })
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    path: String,
    old_text: String,
    new_text: String,
}

#[derive(Debug, Deserialize)]
struct RenameArgs {
    old_path: String,
    new_name: String,
}

#[derive(Debug, Deserialize)]
struct TransferArgs {
    source: String,
    destination: String,
}

// ── read / write / edit ──────────────────────────────────────────────────

pub(crate) struct ReadFileTool {
    sandbox: WorkspaceSandbox,
}

impl ReadFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters(&self) -> serde_json::Value {
        path_schema("The file path to read")
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: PathArgs = parse_args(args)?;
        let path = self.sandbox.resolve(&parsed.path).map_err(|e| e.to_string())?;
        if !path.exists() {
            return Err(format!("File not found: {}", parsed.path));
        }
        if !path.is_file() {
            return Err(format!("Not a file: {}", parsed.path));
        }
        let bytes = fs::read(&path).map_err(|e| io_error("reading file", &parsed.path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub(crate) struct WriteFileTool {
    sandbox: WorkspaceSandbox,
}

impl WriteFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to write to"},
                "content": {"type": "string", "description": "The content to write"}
            },
            "required": ["path", "content"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: WriteArgs = parse_args(args)?;
        let path = self.sandbox.resolve(&parsed.path).map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("writing file", &parsed.path, e))?;
        }
        fs::write(&path, parsed.content.as_bytes()).map_err(|e| io_error("writing file", &parsed.path, e))?;
        Ok(format!(
            "Successfully wrote {} bytes to {}",
            parsed.content.len(),
            parsed.path
        ))
    }
}

pub(crate) struct EditFileTool {
    sandbox: WorkspaceSandbox,
}

impl EditFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. The old_text must exist exactly in the file."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to edit"},
                "old_text": {"type": "string", "description": "The exact text to find and replace"},
                "new_text": {"type": "string", "description": "The text to replace with"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: EditArgs = parse_args(args)?;
        let path = self.sandbox.resolve(&parsed.path).map_err(|e| e.to_string())?;
        if !path.is_file() {
            return Err(format!("File not found: {}", parsed.path));
        }
        let content = fs::read_to_string(&path).map_err(|e| io_error("editing file", &parsed.path, e))?;
        if parsed.old_text.is_empty() || !content.contains(&parsed.old_text) {
            return Err("old_text not found in file. Make sure it matches exactly.".into());
        }
        let count = content.matches(&parsed.old_text).count();
        if count > 1 {
            return Ok(format!(
                "Warning: old_text appears {count} times. Please provide more context to make it unique."
            ));
        }
        let updated = content.replacen(&parsed.old_text, &parsed.new_text, 1);
        fs::write(&path, updated).map_err(|e| io_error("editing file", &parsed.path, e))?;
        Ok(format!("Successfully edited {}", parsed.path))
    }
}

// ── directories ──────────────────────────────────────────────────────────

pub(crate) struct ListDirTool {
    sandbox: WorkspaceSandbox,
}

impl ListDirTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory."
    }

    fn parameters(&self) -> serde_json::Value {
        path_schema("The directory path to list")
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: PathArgs = parse_args(args)?;
        let path = self.sandbox.resolve(&parsed.path).map_err(|e| e.to_string())?;
        if !path.exists() {
            return Err(format!("Directory not found: {}", parsed.path));
        }
        if !path.is_dir() {
            return Err(format!("Not a directory: {}", parsed.path));
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&path)
            .map_err(|e| io_error("listing directory", &parsed.path, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        if entries.is_empty() {
            return Ok(format!("Directory {} is empty", parsed.path));
        }
        entries.sort();
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| {
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if entry.is_dir() {
                    format!("[DIR] {name}")
                } else {
                    format!("[FILE] {name}")
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

pub(crate) struct CreateDirTool {
    sandbox: WorkspaceSandbox,
}

impl CreateDirTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for CreateDirTool {
    fn name(&self) -> &str {
        "create_dir"
    }

    fn description(&self) -> &str {
        "Create a new directory. Creates parent directories if needed."
    }

    fn parameters(&self) -> serde_json::Value {
        path_schema("The directory path to create")
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: PathArgs = parse_args(args)?;
        let path = self.sandbox.resolve(&parsed.path).map_err(|e| e.to_string())?;
        if path.is_dir() {
            return Ok(format!("Directory already exists: {}", parsed.path));
        }
        if path.exists() {
            return Err(format!("A file with this name already exists: {}", parsed.path));
        }
        fs::create_dir_all(&path).map_err(|e| io_error("creating directory", &parsed.path, e))?;
        Ok(format!("Successfully created directory: {}", parsed.path))
    }
}

// ── rename / move / copy ─────────────────────────────────────────────────

pub(crate) struct RenameFileTool {
    sandbox: WorkspaceSandbox,
}

impl RenameFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for RenameFileTool {
    fn name(&self) -> &str {
        "rename_file"
    }

    fn description(&self) -> &str {
        "Rename a file or directory to a new name in the same location."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "old_path": {"type": "string", "description": "The current path of the file or directory"},
                "new_name": {"type": "string", "description": "The new name (just the name, not a full path)"}
            },
            "required": ["old_path", "new_name"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: RenameArgs = parse_args(args)?;
        let old = self.sandbox.resolve(&parsed.old_path).map_err(|e| e.to_string())?;
        if !old.exists() {
            return Err(format!("File or directory not found: {}", parsed.old_path));
        }
        let name = parsed.new_name.trim();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
            return Err("new_name should be just a name, not a path".into());
        }
        let parent = old.parent().unwrap_or_else(|| Path::new("/"));
        let target = self
            .sandbox
            .revalidate(&parent.join(name))
            .map_err(|_| "Destination would be outside workspace".to_string())?;
        if target.exists() {
            return Err(format!("Target already exists: {}", target.display()));
        }
        fs::rename(&old, &target).map_err(|e| io_error("renaming", &parsed.old_path, e))?;
        Ok(format!("Successfully renamed {} to {name}", parsed.old_path))
    }
}

/// Resolve source and destination; a directory destination receives the source's file name.
fn resolve_transfer(sandbox: &WorkspaceSandbox, parsed: &TransferArgs) -> Result<(PathBuf, PathBuf), String> {
    let source = sandbox.resolve(&parsed.source).map_err(|e| e.to_string())?;
    if !source.exists() {
        return Err(format!("Source not found: {}", parsed.source));
    }
    let mut dest = sandbox.resolve(&parsed.destination).map_err(|e| e.to_string())?;
    if dest.is_dir() {
        if let Some(name) = source.file_name() {
            dest = sandbox.revalidate(&dest.join(name)).map_err(|e| e.to_string())?;
        }
    }
    if source.is_dir() && dest.starts_with(&source) {
        return Err(format!(
            "Cannot copy or move directory '{}' into itself ('{}')",
            parsed.source, parsed.destination
        ));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("create parent: {e}"))?;
    }
    if dest.exists() {
        return Err(format!("Destination already exists: {}", parsed.destination));
    }
    Ok((source, dest))
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_file() {
        fs::copy(source, dest)?;
        return Ok(());
    }
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(source).map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub(crate) struct MoveFileTool {
    sandbox: WorkspaceSandbox,
}

impl MoveFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for MoveFileTool {
    fn name(&self) -> &str {
        "move_file"
    }

    fn description(&self) -> &str {
        "Move a file or directory to a new location. Creates parent directories if needed."
    }

    fn parameters(&self) -> serde_json::Value {
        transfer_schema("move")
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: TransferArgs = parse_args(args)?;
        let (source, dest) = resolve_transfer(&self.sandbox, &parsed)?;
        if fs::rename(&source, &dest).is_err() {
            // Cross-device moves need a copy followed by removal.
            copy_tree(&source, &dest).map_err(|e| io_error("moving", &parsed.source, e))?;
            let removed = if source.is_dir() {
                fs::remove_dir_all(&source)
            } else {
                fs::remove_file(&source)
            };
            removed.map_err(|e| io_error("moving", &parsed.source, e))?;
        }
        Ok(format!("Successfully moved {} to {}", parsed.source, parsed.destination))
    }
}

pub(crate) struct CopyFileTool {
    sandbox: WorkspaceSandbox,
}

impl CopyFileTool {
    pub(crate) fn new(sandbox: WorkspaceSandbox) -> Self {
        Self { sandbox }
    }
}

impl Tool for CopyFileTool {
    fn name(&self) -> &str {
        "copy_file"
    }

    fn description(&self) -> &str {
        "Copy a file or directory to a new location. Creates parent directories if needed."
    }

    fn parameters(&self) -> serde_json::Value {
        transfer_schema("copy")
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: TransferArgs = parse_args(args)?;
        let (source, dest) = resolve_transfer(&self.sandbox, &parsed)?;
        copy_tree(&source, &dest).map_err(|e| io_error("copying", &parsed.source, e))?;
        Ok(format!("Successfully copied {} to {}", parsed.source, parsed.destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolRegistry;
    use std::sync::Arc;

    fn setup(name: &str) -> (PathBuf, ToolRegistry) {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("fs_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let sandbox = WorkspaceSandbox::new(Some(dir.clone()), true);
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(ReadFileTool::new(sandbox.clone())));
        reg.register(Arc::new(WriteFileTool::new(sandbox.clone())));
        reg.register(Arc::new(EditFileTool::new(sandbox.clone())));
        reg.register(Arc::new(ListDirTool::new(sandbox.clone())));
        reg.register(Arc::new(CreateDirTool::new(sandbox.clone())));
        reg.register(Arc::new(RenameFileTool::new(sandbox.clone())));
        reg.register(Arc::new(MoveFileTool::new(sandbox.clone())));
        reg.register(Arc::new(CopyFileTool::new(sandbox)));
        (dir, reg)
    }

    fn run(reg: &ToolRegistry, tool: &str, args: serde_json::Value) -> String {
        reg.execute(tool, &args, &ToolContext::default())
    }

    #[test]
    fn test_write_read_edit() {
        let (_dir, reg) = setup("write_read");
        assert_eq!(
            run(&reg, "write_file", serde_json::json!({"path": "notes/a.txt", "content": "hello world"})),
            "Successfully wrote 11 bytes to notes/a.txt"
        );
        assert_eq!(run(&reg, "read_file", serde_json::json!({"path": "notes/a.txt"})), "hello world");
        assert_eq!(
            run(&reg, "edit_file", serde_json::json!({"path": "notes/a.txt", "old_text": "world", "new_text": "there"})),
            "Successfully edited notes/a.txt"
        );
        assert_eq!(run(&reg, "read_file", serde_json::json!({"path": "notes/a.txt"})), "hello there");
        assert!(
            run(&reg, "edit_file", serde_json::json!({"path": "notes/a.txt", "old_text": "zzz", "new_text": ""}))
                .starts_with("Error: old_text not found")
        );
        run(&reg, "write_file", serde_json::json!({"path": "dup.txt", "content": "x x"}));
        assert!(
            run(&reg, "edit_file", serde_json::json!({"path": "dup.txt", "old_text": "x", "new_text": "y"}))
                .starts_with("Warning: old_text appears 2 times")
        );
        assert_eq!(
            run(&reg, "read_file", serde_json::json!({"path": "missing.txt"})),
            "Error: File not found: missing.txt"
        );
    }

    #[test]
    fn test_escape_is_refused() {
        let (_dir, reg) = setup("escape");
        let out = run(&reg, "read_file", serde_json::json!({"path": "../../etc/passwd"}));
        assert!(out.starts_with("Error: Access denied"));
        let out = run(&reg, "write_file", serde_json::json!({"path": "/tmp/icron_escape.txt", "content": "x"}));
        assert!(out.starts_with("Error: Access denied"));
    }

    #[test]
    fn test_list_and_create_dir() {
        let (dir, reg) = setup("list");
        assert_eq!(run(&reg, "list_dir", serde_json::json!({"path": "."})), "Directory . is empty");
        assert_eq!(
            run(&reg, "create_dir", serde_json::json!({"path": "sub"})),
            "Successfully created directory: sub"
        );
        assert_eq!(run(&reg, "create_dir", serde_json::json!({"path": "sub"})), "Directory already exists: sub");
        fs::write(dir.join("b.txt"), "b").unwrap();
        assert_eq!(run(&reg, "list_dir", serde_json::json!({"path": "."})), "[FILE] b.txt\n[DIR] sub");
        assert_eq!(
            run(&reg, "list_dir", serde_json::json!({"path": "b.txt"})),
            "Error: Not a directory: b.txt"
        );
    }

    #[test]
    fn test_rename_move_copy() {
        let (dir, reg) = setup("transfer");
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::create_dir_all(dir.join("box")).unwrap();

        assert_eq!(
            run(&reg, "rename_file", serde_json::json!({"old_path": "a.txt", "new_name": "sub/b.txt"})),
            "Error: new_name should be just a name, not a path"
        );
        assert_eq!(
            run(&reg, "rename_file", serde_json::json!({"old_path": "a.txt", "new_name": "b.txt"})),
            "Successfully renamed a.txt to b.txt"
        );
        assert_eq!(
            run(&reg, "copy_file", serde_json::json!({"source": "b.txt", "destination": "box"})),
            "Successfully copied b.txt to box"
        );
        assert!(dir.join("box/b.txt").is_file());
        assert_eq!(
            run(&reg, "move_file", serde_json::json!({"source": "b.txt", "destination": "box"})),
            "Error: Destination already exists: box"
        );
        assert_eq!(
            run(&reg, "move_file", serde_json::json!({"source": "b.txt", "destination": "c.txt"})),
            "Successfully moved b.txt to c.txt"
        );
        assert!(!dir.join("b.txt").exists());
        assert_eq!(
            run(&reg, "copy_file", serde_json::json!({"source": "nope", "destination": "x"})),
            "Error: Source not found: nope"
        );
    }

    #[test]
    fn test_directory_into_itself_refused() {
        let (dir, reg) = setup("into_self");
        fs::create_dir_all(dir.join("box/sub")).unwrap();
        fs::write(dir.join("box/sub/f.txt"), "f").unwrap();

        let out = run(&reg, "copy_file", serde_json::json!({"source": "box", "destination": "box/inner"}));
        assert_eq!(out, "Error: Cannot copy or move directory 'box' into itself ('box/inner')");
        let out = run(&reg, "move_file", serde_json::json!({"source": "box", "destination": "box/sub"}));
        assert!(out.starts_with("Error: Cannot copy or move directory"), "{out}");
        assert!(!dir.join("box/inner").exists());
        assert!(!dir.join("box/sub/box").exists());

        assert_eq!(
            run(&reg, "copy_file", serde_json::json!({"source": "box", "destination": "boxed"})),
            "Successfully copied box to boxed"
        );
        assert!(dir.join("boxed/sub/f.txt").is_file());
    }
}
