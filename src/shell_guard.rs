//! Guarded command execution for the `exec` tool.
//!
//! Parse → Guard → Dispatch → Collect. Commands run as an argv vector by default;
//! a real shell is used only when the caller asks for it and config allows it.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};

use crate::{build_external_command, kill_process_tree, resolve_lenient, truncate_with_marker, RunError};

pub(crate) const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;
pub(crate) const MAX_OUTPUT_CHARS: usize = 10_000;
const PROCESS_POLL_MS: u64 = 25;
const PIPE_DRAIN_MS: u64 = 500;

const ALLOWED_COMMANDS: &[&str] = &[
    // version control
    "git", "hg", "svn",
    // package managers and build tools
    "npm", "npx", "yarn", "pnpm", "pip", "pip3", "pipx", "poetry", "pdm", "cargo", "go", "gem",
    "bundle", "composer", "maven", "mvn", "gradle", "make", "cmake",
    // interpreters and compilers
    "python", "python3", "node", "ruby", "php", "java", "javac", "rustc", "gcc", "g++", "clang",
    // read-only file inspection
    "ls", "cat", "head", "tail", "grep", "find", "wc", "sort", "uniq", "diff", "file", "stat",
    "du", "df", "pwd", "basename", "dirname", "realpath", "readlink",
    // file manipulation
    "mkdir", "cp", "mv", "touch", "chmod", "chown", "sed", "awk", "cut", "tr", "xargs", "tee",
    // archives
    "tar", "zip", "unzip", "gzip", "gunzip", "bzip2",
    // network diagnostics
    "curl", "wget", "ping", "host", "dig", "nslookup",
    // process and system info
    "ps", "top", "htop", "uptime", "whoami", "id", "groups",
    // containers
    "docker", "docker-compose", "podman",
    // test runners, linters, bundlers
    "pytest", "jest", "mocha", "rspec", "phpunit", "eslint", "prettier", "black", "flake8",
    "mypy", "rubocop", "webpack", "vite", "esbuild", "rollup", "parcel",
    // shell builtins that also exist as binaries
    "echo", "printf", "date", "env", "which", "whereis", "type", "true", "false", "test", "expr",
];

const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\b",
    r"\brm\s+.*-[rf]{1,2}\b",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(shutdown|reboot|poweroff|init\s+[06])\b",
    r":\(\)\s*\{.*\};\s*:",
    r"\bsudo\b",
    r"\bsu\s+-?\s*\w*\b",
    r"\bchmod\s+.*777\b",
    r"\b(curl|wget).*\|\s*(ba)?sh",
    r"\beval\b",
    r"\bexec\b",
    r"/etc/(passwd|shadow|sudoers)",
    r"~/.ssh",
    r"\.env\b",
];

const SHELL_FEATURE_PATTERNS: &[&str] = &[
    r"\$\{",
    r"\$\(",
    r"`[^`]+`",
    r"\|\|",
    r"&&",
    r"[<>]{1,2}",
    r"\*|\?|\[",
    r"~/",
];

const DANGEROUS_METACHARS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r'];

static DENY_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DENY_PATTERNS
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
});

static SHELL_FEATURE_REGEXES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| SHELL_FEATURE_PATTERNS.iter().filter_map(|p| Regex::new(p).ok()).collect());

static ABSOLUTE_PATH_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?:^|[\s"'=])(/[^\s"']*|[A-Za-z]:\\[^\s"']*)"#).ok());

// ── Process spawning seam ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) exit_code: Option<i32>,
}

/// Everything that actually creates a subprocess goes through this trait.
pub(crate) trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, RunError>;
}

/// Spawns real processes in their own process group and hard-kills the group on timeout.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ProcessRunner;

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> (Arc<Mutex<Vec<u8>>>, Option<thread::JoinHandle<()>>) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let Some(mut pipe) = pipe else {
        return (buf, None);
    };
    let sink = buf.clone();
    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = sink.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buf, Some(handle))
}

fn drain(buf: &Arc<Mutex<Vec<u8>>>, handle: Option<thread::JoinHandle<()>>) -> String {
    // A grandchild can keep the pipe open after the child exits; don't wait on it forever.
    if let Some(handle) = handle {
        let until = Instant::now() + Duration::from_millis(PIPE_DRAIN_MS);
        while !handle.is_finished() && Instant::now() < until {
            thread::sleep(Duration::from_millis(5));
        }
    }
    let bytes = buf.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&bytes).to_string()
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, RunError> {
        let mut cmd = build_external_command(program, args);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| RunError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        let (stdout_buf, stdout_handle) = spawn_pipe_reader(child.stdout.take());
        let (stderr_buf, stderr_handle) = spawn_pipe_reader(child.stderr.take());

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait()? {
                Some(status) => {
                    return Ok(CommandOutput {
                        stdout: drain(&stdout_buf, stdout_handle),
                        stderr: drain(&stderr_buf, stderr_handle),
                        exit_code: status.code(),
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        kill_process_tree(&mut child);
                        tracing::warn!(target: "shell_guard", pid, program, "killed process group after timeout");
                        return Err(RunError::Timeout(timeout.as_secs()));
                    }
                    thread::sleep(Duration::from_millis(PROCESS_POLL_MS));
                }
            }
        }
    }
}

// ── Guard ────────────────────────────────────────────────────────────────

pub(crate) fn needs_shell(command: &str) -> bool {
    SHELL_FEATURE_REGEXES.iter().any(|re| re.is_match(command)) || has_unquoted_separator(command)
}

/// Pipes, `;` and `&` only mean something to a shell when they sit outside quotes.
fn has_unquoted_separator(command: &str) -> bool {
    let mut single = false;
    let mut double = false;
    let mut escaped = false;
    for c in command.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !single => escaped = true,
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '|' | ';' | '&' if !single && !double => return true,
            _ => {}
        }
    }
    false
}

pub(crate) fn has_dangerous_metachar(command: &str) -> bool {
    command.chars().any(|c| DANGEROUS_METACHARS.contains(&c))
}

fn base_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

pub(crate) struct ShellGuard {
    working_dir: PathBuf,
    timeout: Duration,
    restrict_to_workspace: bool,
    allow_shell_fallback: bool,
    allowed: HashSet<&'static str>,
    runner: Arc<dyn CommandRunner>,
}

impl ShellGuard {
    pub(crate) fn new(
        working_dir: PathBuf,
        timeout_secs: u64,
        restrict_to_workspace: bool,
        allow_shell_fallback: bool,
    ) -> Self {
        Self::with_runner(
            working_dir,
            timeout_secs,
            restrict_to_workspace,
            allow_shell_fallback,
            Arc::new(ProcessRunner),
        )
    }

    pub(crate) fn with_runner(
        working_dir: PathBuf,
        timeout_secs: u64,
        restrict_to_workspace: bool,
        allow_shell_fallback: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            restrict_to_workspace,
            allow_shell_fallback,
            allowed: ALLOWED_COMMANDS.iter().copied().collect(),
            runner,
        }
    }

    pub(crate) fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    pub(crate) fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(base_name(program).as_str())
    }

    /// Returns a rejection message when the command must not run.
    pub(crate) fn guard_command(&self, command: &str, cwd: &Path) -> Option<String> {
        let lower = command.to_lowercase();
        if DENY_REGEXES.iter().any(|re| re.is_match(&lower)) {
            return Some("Error: Command blocked by safety guard (dangerous pattern detected)".into());
        }

        if self.restrict_to_workspace {
            if command.contains("../") || command.contains("..\\") {
                return Some("Error: Command blocked by safety guard (path traversal detected)".into());
            }
            let cwd_resolved = resolve_lenient(cwd);
            if let Some(re) = ABSOLUTE_PATH_RE.as_ref() {
                for caps in re.captures_iter(command) {
                    let Some(raw) = caps.get(1) else { continue };
                    let candidate = resolve_lenient(Path::new(raw.as_str()));
                    if !candidate.starts_with(&cwd_resolved) {
                        return Some(
                            "Error: Command blocked by safety guard (path outside working dir)".into(),
                        );
                    }
                }
            }
        }
        None
    }

    fn resolve_cwd(&self, working_dir: Option<&str>) -> Result<PathBuf, String> {
        let Some(raw) = working_dir.filter(|w| !w.trim().is_empty()) else {
            return Ok(self.working_dir.clone());
        };
        if self.restrict_to_workspace {
            crate::resolve(raw, Some(&self.working_dir), true).map_err(|e| format!("Error: {e}"))
        } else {
            Ok(resolve_lenient(&crate::expand_home(raw)))
        }
    }

    pub(crate) fn execute(&self, command: &str, working_dir: Option<&str>, allow_shell: bool) -> String {
        let command = command.trim();
        if command.is_empty() {
            return "Error: Empty command".into();
        }
        let cwd = match self.resolve_cwd(working_dir) {
            Ok(cwd) => cwd,
            Err(err) => return err,
        };
        if let Some(rejection) = self.guard_command(command, &cwd) {
            tracing::warn!(target: "shell_guard", command, "command rejected by guard");
            return rejection;
        }

        // Commands without shell syntax always run as argv, whatever allow_shell says.
        let result = if !needs_shell(command) {
            self.run_direct(command, &cwd)
        } else if allow_shell && self.allow_shell_fallback {
            self.run_via_shell(command, &cwd)
        } else if has_dangerous_metachar(command) {
            Err("Error: Command contains shell metacharacters (pipes, redirects, substitution). \
                 Shell execution requires allow_shell=true and allow_shell_fallback enabled in config."
                .to_string())
        } else if allow_shell {
            Err("Error: Shell execution is disabled (tools.exec.allow_shell_fallback is false)".to_string())
        } else {
            self.run_direct(command, &cwd)
        };

        match result {
            Ok(output) => format_output(&output),
            Err(message) => message,
        }
    }

    fn run_direct(&self, command: &str, cwd: &Path) -> Result<CommandOutput, String> {
        let argv = shlex::split(command)
            .ok_or_else(|| "Error: Could not parse command (unbalanced quotes?)".to_string())?;
        let Some(program) = argv.first() else {
            return Err("Error: Empty command".into());
        };
        if !self.is_allowed(program) {
            return Err(format!(
                "Error: Command '{}' is not in the allowed commands list",
                base_name(program)
            ));
        }
        let resolved = which::which(program).map_err(|_| format!("Error: Command not found: {program}"))?;
        let resolved = resolved.to_string_lossy().to_string();
        tracing::debug!(target: "shell_guard", program = %resolved, "exec");
        self.spawn(&resolved, &argv[1..], cwd)
    }

    fn run_via_shell(&self, command: &str, cwd: &Path) -> Result<CommandOutput, String> {
        let first = command.split_whitespace().next().unwrap_or_default();
        if !self.is_allowed(first) {
            return Err(format!(
                "Error: Command '{}' is not in the allowed commands list",
                base_name(first)
            ));
        }
        tracing::info!(target: "shell_guard", command, "shell fallback");
        self.spawn("sh", &["-c".to_string(), command.to_string()], cwd)
    }

    fn spawn(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput, String> {
        self.runner
            .run(program, args, cwd, self.timeout)
            .map_err(|err| match err {
                RunError::Timeout(secs) => format!("Error: Command timed out after {secs} seconds"),
                other => format!("Error executing command: {other}"),
            })
    }
}

pub(crate) fn format_output(output: &CommandOutput) -> String {
    let mut parts = Vec::new();
    if !output.stdout.is_empty() {
        parts.push(output.stdout.clone());
    }
    if !output.stderr.trim().is_empty() {
        parts.push(format!("STDERR:\n{}", output.stderr));
    }
    let code = output.exit_code.unwrap_or(-1);
    if code != 0 {
        parts.push(format!("\nExit code: {code}"));
    }
    let text = if parts.is_empty() {
        "(no output)".to_string()
    } else {
        parts.join("\n")
    };
    truncate_with_marker(&text, MAX_OUTPUT_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SpyRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl SpyRunner {
        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CommandRunner for SpyRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _cwd: &Path,
            _timeout: Duration,
        ) -> Result<CommandOutput, RunError> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(CommandOutput {
                stdout: "spy".into(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("shell_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn guard(name: &str, restrict: bool, fallback: bool) -> (ShellGuard, Arc<SpyRunner>) {
        let spy = Arc::new(SpyRunner::default());
        let guard = ShellGuard::with_runner(temp_dir(name), 5, restrict, fallback, spy.clone());
        (guard, spy)
    }

    #[test]
    fn test_sudo_rm_rejected_before_spawn() {
        let (guard, spy) = guard("sudo", false, true);
        let out = guard.execute("sudo rm -rf /", None, false);
        assert!(out.contains("dangerous pattern"), "{out}");
        let out = guard.execute("sudo rm -rf /", None, true);
        assert!(out.starts_with("Error:"));
        assert_eq!(spy.count(), 0);
    }

    #[test]
    fn test_non_allowlisted_rejected_before_spawn() {
        let (guard, spy) = guard("allowlist", false, false);
        for cmd in ["nmap localhost", "/usr/bin/nc -l 9000", "bash script.sh", "ssh host"] {
            let out = guard.execute(cmd, None, false);
            assert!(out.contains("not in the allowed commands list"), "{cmd}: {out}");
        }
        assert_eq!(spy.count(), 0);
    }

    #[test]
    fn test_deny_patterns_case_insensitive() {
        let (guard, spy) = guard("deny", false, false);
        for cmd in [
            "RM -RF build",
            "rm build -r",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=x",
            "shutdown now",
            "chmod -R 777 .",
            "cat .env",
            "cat /etc/shadow",
            "eval ls",
        ] {
            assert!(guard.execute(cmd, None, false).contains("dangerous pattern"), "{cmd}");
        }
        assert_eq!(spy.count(), 0);
    }

    #[test]
    fn test_restricted_traversal_and_absolute_paths() {
        let (guard, spy) = guard("restrict", true, false);
        assert!(guard.execute("ls ../", None, false).contains("path traversal"));
        assert!(guard.execute("cat /var/log/syslog", None, false).contains("outside working dir"));
        assert_eq!(spy.count(), 0);
        let out = guard.execute("curl https://example.com/a", None, false);
        assert_eq!(out, "spy");
    }

    #[test]
    fn test_metacharacters_need_explicit_opt_in() {
        let (guard, spy) = guard("meta", false, false);
        let out = guard.execute("echo hi | grep h", None, false);
        assert!(out.contains("shell metacharacters"), "{out}");
        let out = guard.execute("echo hi; ls", None, true);
        assert!(out.contains("shell metacharacters"), "{out}");
        let out = guard.execute("ls *.txt", None, true);
        assert!(out.contains("Shell execution is disabled"), "{out}");
        assert_eq!(spy.count(), 0);
    }

    #[test]
    fn test_plain_commands_skip_shell_checks() {
        let (guard, spy) = guard("plain", false, false);
        assert_eq!(guard.execute("echo 'fix (bug)'", None, false), "spy");
        assert_eq!(guard.execute("echo 'a;b' \"x|y\"", None, false), "spy");
        assert_eq!(guard.execute("echo hi", None, true), "spy");
        let calls = spy.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, vec!["fix (bug)".to_string()]);
        assert_eq!(calls[1].1, vec!["a;b".to_string(), "x|y".to_string()]);
    }

    #[test]
    fn test_unquoted_separators_need_shell() {
        assert!(needs_shell("echo hi | grep h"));
        assert!(needs_shell("echo a; ls"));
        assert!(needs_shell("sleep 1 &"));
        assert!(!needs_shell("echo 'a | b; c & d'"));
        assert!(!needs_shell("echo a\\;b"));
    }

    #[test]
    fn test_shell_fallback_uses_sh_and_checks_allowlist() {
        let (guard, spy) = guard("fallback", false, true);
        assert_eq!(guard.execute("echo hi | grep h", None, true), "spy");
        let calls = spy.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "sh");
        assert_eq!(calls[0].1, vec!["-c".to_string(), "echo hi | grep h".to_string()]);
        drop(calls);
        let out = guard.execute("nc -l 1 && echo x", None, true);
        assert!(out.contains("not in the allowed"));
        assert_eq!(spy.count(), 1);
    }

    #[test]
    fn test_direct_exec_resolves_on_path() {
        let (guard, spy) = guard("direct", false, false);
        assert_eq!(guard.execute("echo 'hello world'", None, false), "spy");
        let calls = spy.calls.lock().unwrap();
        assert!(calls[0].0.ends_with("echo"));
        assert_eq!(calls[0].1, vec!["hello world".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        let (guard, spy) = guard("parse", false, false);
        assert_eq!(guard.execute("   ", None, false), "Error: Empty command");
        assert!(guard.execute("echo \"abc", None, false).contains("Could not parse"));
        assert_eq!(spy.count(), 0);
    }

    #[test]
    fn test_format_output() {
        let out = format_output(&CommandOutput {
            stdout: "ok\n".into(),
            stderr: "warn".into(),
            exit_code: Some(2),
        });
        assert_eq!(out, "ok\n\nSTDERR:\nwarn\n\nExit code: 2");
        let empty = format_output(&CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        });
        assert_eq!(empty, "(no output)");
        let big = format_output(&CommandOutput {
            stdout: "x".repeat(MAX_OUTPUT_CHARS + 25),
            exit_code: Some(0),
            ..Default::default()
        });
        assert!(big.ends_with("... (truncated, 25 more chars)"));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_collects_output() {
        let dir = temp_dir("real");
        let guard = ShellGuard::new(dir, 10, false, false);
        let out = guard.execute("echo hello", None, false);
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_process_runner_timeout_kills() {
        let dir = temp_dir("timeout");
        let started = Instant::now();
        let result = ProcessRunner.run("sleep", &["5".to_string()], &dir, Duration::from_secs(1));
        assert!(matches!(result, Err(RunError::Timeout(1))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
