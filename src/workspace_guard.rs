//! Path sandboxing for every filesystem-touching tool.
//!
//! `resolve` is lenient about non-existent tails (so new files can be written) but
//! resolves symlinks for every component that does exist, so a link pointing outside
//! the workspace is caught by the containment check.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::{expand_home, GuardError};

pub(crate) const OUTSIDE_WORKSPACE: &str = "Access denied: path is outside the allowed workspace";

/// Resolve `path` to an absolute path, following symlinks of existing components.
pub(crate) fn resolve_lenient(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if let Ok(canonical) = fs::canonicalize(&resolved) {
                    resolved = canonical;
                }
            }
        }
    }
    resolved
}

/// Validate and resolve a tool-supplied path against the workspace root.
pub(crate) fn resolve(
    path_str: &str,
    workspace_root: Option<&Path>,
    restrict: bool,
) -> Result<PathBuf, GuardError> {
    if path_str.trim().is_empty() {
        return Err(GuardError::Security("Empty path is not allowed".into()));
    }
    if path_str.contains('\0') {
        return Err(GuardError::Security("Invalid characters in path".into()));
    }

    let path = expand_home(path_str);

    if !restrict {
        return Ok(resolve_lenient(&path));
    }

    let Some(root) = workspace_root else {
        return Err(GuardError::Config(
            "Workspace not configured but restrict_to_workspace is enabled".into(),
        ));
    };
    let root_resolved = resolve_lenient(root);

    let candidate = if path.is_absolute() {
        path
    } else {
        root_resolved.join(path)
    };
    let resolved = resolve_lenient(&candidate);

    if !resolved.starts_with(&root_resolved) {
        tracing::warn!(
            target: "workspace_guard",
            input = path_str,
            resolved = %resolved.display(),
            workspace = %root_resolved.display(),
            "path escape blocked"
        );
        return Err(GuardError::Security(OUTSIDE_WORKSPACE.into()));
    }
    Ok(resolved)
}

/// Re-validate a path derived from an already-validated one (joined file names, rename targets).
pub(crate) fn revalidate(
    derived: &Path,
    workspace_root: Option<&Path>,
    restrict: bool,
) -> Result<PathBuf, GuardError> {
    let text = derived.to_string_lossy();
    resolve(&text, workspace_root, restrict)
}

/// Tool-side wrapper: workspace root plus the restrict flag from config.
#[derive(Debug, Clone)]
pub(crate) struct WorkspaceSandbox {
    pub(crate) root: Option<PathBuf>,
    pub(crate) restrict: bool,
}

impl WorkspaceSandbox {
    pub(crate) fn new(root: Option<PathBuf>, restrict: bool) -> Self {
        if !restrict {
            tracing::warn!(target: "workspace_guard", "workspace restriction disabled for file tools");
        }
        Self { root, restrict }
    }

    pub(crate) fn resolve(&self, path_str: &str) -> Result<PathBuf, GuardError> {
        resolve(path_str, self.root.as_deref(), self.restrict)
    }

    pub(crate) fn revalidate(&self, derived: &Path) -> Result<PathBuf, GuardError> {
        revalidate(derived, self.root.as_deref(), self.restrict)
    }

    /// Default search root when a tool is called without a path.
    pub(crate) fn default_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => resolve_lenient(root),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// True when `path` lies inside the workspace (always true when unrestricted).
    pub(crate) fn contains(&self, path: &Path) -> bool {
        if !self.restrict {
            return true;
        }
        match &self.root {
            Some(root) => resolve_lenient(path).starts_with(resolve_lenient(root)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("guard_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_rejects_empty_and_nul() {
        let ws = temp_workspace("empty");
        assert!(matches!(resolve("", Some(&ws), true), Err(GuardError::Security(_))));
        assert!(matches!(resolve("   ", Some(&ws), true), Err(GuardError::Security(_))));
        assert!(matches!(resolve("a\0b", Some(&ws), true), Err(GuardError::Security(_))));
    }

    #[test]
    fn test_missing_workspace_is_config_error() {
        assert!(matches!(resolve("notes.md", None, true), Err(GuardError::Config(_))));
    }

    #[test]
    fn test_relative_paths_resolve_inside() {
        let ws = temp_workspace("relative");
        let root = resolve_lenient(&ws);
        let out = resolve("sub/new.md", Some(&ws), true).unwrap();
        assert_eq!(out, root.join("sub/new.md"));
        assert_eq!(resolve(".", Some(&ws), true).unwrap(), root);
    }

    #[test]
    fn test_traversal_and_absolute_escape_blocked() {
        let ws = temp_workspace("escape");
        for bad in ["../x", "a/../../x", "/etc/passwd", "sub/../../../tmp"] {
            let err = resolve(bad, Some(&ws), true).unwrap_err();
            assert_eq!(err, GuardError::Security(OUTSIDE_WORKSPACE.into()), "{bad}");
        }
    }

    #[test]
    fn test_sibling_prefix_not_contained() {
        let ws = temp_workspace("sib");
        let sibling = PathBuf::from(format!("{}-other/file", ws.display()));
        assert!(resolve(&sibling.to_string_lossy(), Some(&ws), true).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_blocked() {
        let ws = temp_workspace("symlink");
        let outside = temp_workspace("symlink_target");
        std::os::unix::fs::symlink(&outside, ws.join("link")).unwrap();
        assert!(resolve("link/secret.txt", Some(&ws), true).is_err());
    }

    #[test]
    fn test_containment_property_over_many_inputs() {
        let ws = temp_workspace("property");
        fs::create_dir_all(ws.join("a/b")).unwrap();
        let root = resolve_lenient(&ws);
        let inputs = [
            "a", "a/b", "a/b/../..", "a/b/../../..", "./a/./b", "..", "/", "~", "~/x",
            "a//b", "a/b/c/d/../../../../../", "/tmp", "b/../a", "...", "a/..b",
        ];
        for input in inputs {
            if let Ok(path) = resolve(input, Some(&ws), true) {
                assert!(path.starts_with(&root), "{input} -> {}", path.display());
            }
        }
    }

    #[test]
    fn test_unrestricted_returns_absolute() {
        let out = resolve("/tmp/../tmp/x", None, false).unwrap();
        assert!(out.is_absolute());
        assert!(out.ends_with("x"));
    }

    #[test]
    fn test_revalidate_derived_destination() {
        let ws = temp_workspace("derived");
        let sandbox = WorkspaceSandbox::new(Some(ws.clone()), true);
        let dest = sandbox.resolve("dir").unwrap();
        assert!(sandbox.revalidate(&dest.join("file.txt")).is_ok());
        assert!(sandbox.revalidate(&dest.join("../../escape.txt")).is_err());
    }
}
