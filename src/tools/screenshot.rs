//! `screenshot`: capture a web page to `media/screenshots/` through a pluggable backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::{CommandRunner, ProcessRunner, RunError, ScreenshotSettings};

const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CaptureRequest {
    pub(crate) url: String,
    pub(crate) output: PathBuf,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) full_page: bool,
    pub(crate) timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CaptureError {
    Unavailable(String),
    TimedOut,
    Failed(String),
}

/// Renders a page to a PNG file.
pub(crate) trait ScreenshotBackend: Send + Sync {
    fn capture(&self, request: &CaptureRequest) -> Result<(), CaptureError>;
}

/// Headless Chromium driven as a subprocess (`--screenshot`).
pub(crate) struct ChromiumBackend {
    browser: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl ChromiumBackend {
    pub(crate) fn new(browser: Option<String>) -> Self {
        Self::with_runner(browser, Arc::new(ProcessRunner))
    }

    pub(crate) fn with_runner(browser: Option<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { browser, runner }
    }

    fn locate(&self) -> Option<PathBuf> {
        match &self.browser {
            Some(configured) => which::which(configured).ok(),
            None => BROWSER_CANDIDATES.iter().find_map(|name| which::which(name).ok()),
        }
    }
}

impl ScreenshotBackend for ChromiumBackend {
    fn capture(&self, request: &CaptureRequest) -> Result<(), CaptureError> {
        let Some(browser) = self.locate() else {
            return Err(CaptureError::Unavailable(
                "no headless Chromium found on PATH (install chromium or set tools.screenshot.browser)".into(),
            ));
        };
        // Chromium's CLI has no full-page mode; approximate with a tall window.
        let height = if request.full_page { request.height.max(4 * DEFAULT_HEIGHT) } else { request.height };
        let args = vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--hide-scrollbars".to_string(),
            format!("--window-size={},{height}", request.width),
            format!("--timeout={}", request.timeout_ms),
            format!("--screenshot={}", request.output.display()),
            request.url.clone(),
        ];
        let cwd = request.output.parent().unwrap_or(Path::new("."));
        // Give the browser a margin past its own page-load budget before killing it.
        let wall = Duration::from_millis(request.timeout_ms.saturating_add(5_000));
        let output = match self
            .runner
            .run(&browser.to_string_lossy(), &args, cwd, wall)
        {
            Ok(output) => output,
            Err(RunError::Timeout(_)) => return Err(CaptureError::TimedOut),
            Err(e) => return Err(CaptureError::Failed(e.to_string())),
        };
        if output.exit_code != Some(0) {
            let detail = output.stderr.lines().last().unwrap_or("browser exited with an error");
            return Err(CaptureError::Failed(detail.trim().to_string()));
        }
        if !request.output.exists() {
            return Err(CaptureError::Failed("browser produced no image".into()));
        }
        Ok(())
    }
}

/// Only absolute http(s) URLs with a host are captured.
pub(crate) fn validate_screenshot_url(raw: &str) -> Result<url::Url, String> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("Only http/https allowed, got '{}'", parsed.scheme()));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err("Missing domain".into());
    }
    Ok(parsed)
}

pub(crate) fn screenshot_file_name(url: &str, now: chrono::DateTime<chrono::Local>) -> String {
    let digest = blake3::hash(url.as_bytes()).to_hex();
    format!("screenshot_{}_{}.png", now.format("%Y%m%d_%H%M%S"), &digest[..8])
}

#[derive(Debug, Deserialize)]
struct ScreenshotArgs {
    url: String,
    #[serde(default)]
    full_page: bool,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

pub(crate) struct ScreenshotTool {
    workspace: PathBuf,
    timeout_ms: u64,
    default_width: u32,
    default_height: u32,
    backend: Arc<dyn ScreenshotBackend>,
}

impl ScreenshotTool {
    pub(crate) fn new(workspace: PathBuf, settings: &ScreenshotSettings) -> Self {
        Self::with_backend(workspace, settings, Arc::new(ChromiumBackend::new(settings.browser.clone())))
    }

    pub(crate) fn with_backend(
        workspace: PathBuf,
        settings: &ScreenshotSettings,
        backend: Arc<dyn ScreenshotBackend>,
    ) -> Self {
        Self {
            workspace,
            timeout_ms: settings.timeout_ms,
            default_width: if settings.width == 0 { DEFAULT_WIDTH } else { settings.width },
            default_height: if settings.height == 0 { DEFAULT_HEIGHT } else { settings.height },
            backend,
        }
    }
}

impl Tool for ScreenshotTool {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn description(&self) -> &str {
        "Capture a screenshot of a web page. Returns the file path for attachment. \
         Supports full-page screenshots and custom viewport dimensions."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL of the web page to capture (must be http/https)"},
                "full_page": {"type": "boolean", "description": "Capture the full scrollable page (default: false)"},
                "width": {"type": "integer", "description": "Viewport width in pixels (320-3840, default 1280)"},
                "height": {"type": "integer", "description": "Viewport height in pixels (240-2160, default 720)"}
            },
            "required": ["url"]
        })
    }

    fn execute(&self, args: &serde_json::Value, _ctx: &ToolContext) -> Result<String, String> {
        let parsed: ScreenshotArgs = parse_args(args)?;
        let url = validate_screenshot_url(&parsed.url)
            .map_err(|e| format!("Error: URL validation failed - {e}"))?;
        let width = parsed.width.unwrap_or(self.default_width).clamp(320, 3840);
        let height = parsed.height.unwrap_or(self.default_height).clamp(240, 2160);

        let dir = self.workspace.join("media").join("screenshots");
        fs::create_dir_all(&dir).map_err(|e| format!("Error: Failed to create screenshots directory - {e}"))?;
        let output = dir.join(screenshot_file_name(url.as_str(), chrono::Local::now()));

        let request = CaptureRequest {
            url: url.to_string(),
            output: output.clone(),
            width,
            height,
            full_page: parsed.full_page,
            timeout_ms: self.timeout_ms,
        };
        match self.backend.capture(&request) {
            Ok(()) => {}
            Err(CaptureError::Unavailable(reason)) => {
                return Err(format!("Error: Screenshot backend unavailable - {reason}"));
            }
            Err(CaptureError::TimedOut) => {
                let _ = fs::remove_file(&output);
                return Err(format!("Error: Page load timed out after {}ms - {url}", self.timeout_ms));
            }
            Err(CaptureError::Failed(reason)) => {
                let _ = fs::remove_file(&output);
                return Err(format!("Error: Screenshot capture failed - {reason}"));
            }
        }
        tracing::info!(target: "tools", url = %url, path = %output.display(), "screenshot captured");
        Ok(format!(
            "Screenshot captured successfully.\nURL: {url}\nPath: {}\nDimensions: {width}x{height}\nFull page: {}\n\n\
             To send this screenshot, use: message(content=\"your text\", media=[\"{}\"])",
            output.display(),
            parsed.full_page,
            output.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeBackend {
        outcome: Result<(), CaptureError>,
        seen: Mutex<Vec<CaptureRequest>>,
    }

    impl FakeBackend {
        fn new(outcome: Result<(), CaptureError>) -> Arc<Self> {
            Arc::new(Self { outcome, seen: Mutex::new(Vec::new()) })
        }
    }

    impl ScreenshotBackend for FakeBackend {
        fn capture(&self, request: &CaptureRequest) -> Result<(), CaptureError> {
            self.seen.lock().unwrap().push(request.clone());
            if self.outcome.is_ok() {
                fs::write(&request.output, b"png").unwrap();
            }
            self.outcome.clone()
        }
    }

    fn workspace(name: &str) -> PathBuf {
        let ws = std::env::temp_dir()
            .join("icron_test")
            .join(format!("shot_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&ws);
        fs::create_dir_all(&ws).unwrap();
        ws
    }

    #[test]
    fn test_url_validation() {
        assert!(validate_screenshot_url("https://example.com/page").is_ok());
        assert_eq!(
            validate_screenshot_url("file:///etc/passwd").unwrap_err(),
            "Only http/https allowed, got 'file'"
        );
        assert!(validate_screenshot_url("example.com").is_err());
        assert!(validate_screenshot_url("http://").is_err());
    }

    #[test]
    fn test_file_name_shape() {
        let now = chrono::Local::now();
        let name = screenshot_file_name("https://example.com", now);
        assert!(name.starts_with(&format!("screenshot_{}_", now.format("%Y%m%d_%H%M%S"))));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "screenshot_20250101_120000_abcdef12.png".len());
    }

    #[test]
    fn test_capture_writes_into_media_dir() {
        let ws = workspace("ok");
        let backend = FakeBackend::new(Ok(()));
        let tool = ScreenshotTool::with_backend(ws.clone(), &ScreenshotSettings::default(), backend.clone());
        let out = tool
            .execute(&serde_json::json!({"url": "https://example.com", "width": 100}), &ToolContext::default())
            .unwrap();
        assert!(out.starts_with("Screenshot captured successfully."));
        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0].width, 320);
        assert!(seen[0].output.starts_with(ws.join("media").join("screenshots")));
        assert!(seen[0].output.exists());
    }

    #[test]
    fn test_fails_closed() {
        let ws = workspace("closed");
        let ctx = ToolContext::default();
        let args = serde_json::json!({"url": "https://example.com"});

        let missing = ScreenshotTool::with_backend(
            ws.clone(),
            &ScreenshotSettings::default(),
            FakeBackend::new(Err(CaptureError::Unavailable("no browser".into()))),
        );
        assert!(missing.execute(&args, &ctx).unwrap_err().contains("backend unavailable - no browser"));

        let slow = ScreenshotTool::with_backend(
            ws.clone(),
            &ScreenshotSettings::default(),
            FakeBackend::new(Err(CaptureError::TimedOut)),
        );
        assert!(slow.execute(&args, &ctx).unwrap_err().starts_with("Error: Page load timed out"));

        let bad = ScreenshotTool::with_backend(ws, &ScreenshotSettings::default(), FakeBackend::new(Ok(())));
        assert!(bad
            .execute(&serde_json::json!({"url": "ftp://example.com"}), &ctx)
            .unwrap_err()
            .starts_with("Error: URL validation failed"));
    }

    #[test]
    fn test_chromium_timeout_maps_to_timed_out() {
        struct Slow;
        impl CommandRunner for Slow {
            fn run(&self, _: &str, _: &[String], _: &Path, t: Duration) -> Result<crate::CommandOutput, RunError> {
                Err(RunError::Timeout(t.as_secs()))
            }
        }
        // `sh` stands in for the browser binary so `which` resolves on any Unix host.
        let backend = ChromiumBackend::with_runner(Some("sh".into()), Arc::new(Slow));
        let request = CaptureRequest {
            url: "https://example.com".into(),
            output: std::env::temp_dir().join("icron_test").join("never.png"),
            width: 800,
            height: 600,
            full_page: false,
            timeout_ms: 10,
        };
        assert_eq!(backend.capture(&request), Err(CaptureError::TimedOut));
        let nothing = ChromiumBackend::with_runner(Some("icron-no-such-browser".into()), Arc::new(Slow));
        assert!(matches!(nothing.capture(&request), Err(CaptureError::Unavailable(_))));
    }
}
