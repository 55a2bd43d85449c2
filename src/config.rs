use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{default_data_dir, env_optional, expand_home, ConfigError};

pub(crate) const KNOWN_PROVIDERS: &[&str] = &[
    "anthropic", "openrouter", "openai", "gemini", "together", "groq", "zhipu", "vllm",
];

/// Provider priority when the model name doesn't pick one.
const KEY_PRIORITY: &[&str] = &["openrouter", "anthropic", "openai", "gemini", "zhipu", "groq", "together", "vllm"];

// ── Sections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AgentSettings {
    pub(crate) model: String,
    pub(crate) provider: Option<String>,
    pub(crate) max_tokens: u64,
    pub(crate) temperature: f64,
    pub(crate) max_iterations: usize,
    pub(crate) max_history_messages: usize,
    pub(crate) max_history_tokens: Option<usize>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            provider: None,
            max_tokens: 8192,
            temperature: 0.7,
            max_iterations: 20,
            max_history_messages: 50,
            max_history_tokens: Some(100_000),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ProviderSettings {
    pub(crate) api_key: String,
    pub(crate) api_base: Option<String>,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ExecSettings {
    pub(crate) timeout_secs: u64,
    pub(crate) allow_shell_fallback: bool,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            timeout_secs: crate::DEFAULT_EXEC_TIMEOUT_SECS,
            allow_shell_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct WebSearchSettings {
    pub(crate) api_key: String,
    pub(crate) max_results: usize,
}

impl Default for WebSearchSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ScreenshotSettings {
    pub(crate) browser: Option<String>,
    pub(crate) timeout_ms: u64,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            browser: None,
            timeout_ms: 30_000,
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ToolSettings {
    pub(crate) restrict_to_workspace: bool,
    pub(crate) exec: ExecSettings,
    pub(crate) web_search: WebSearchSettings,
    pub(crate) screenshot: ScreenshotSettings,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            exec: ExecSettings::default(),
            web_search: WebSearchSettings::default(),
            screenshot: ScreenshotSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct EmbeddingSettings {
    /// `auto`, `openai` or `local`.
    pub(crate) provider: String,
    pub(crate) model: Option<String>,
    pub(crate) api_key: String,
    pub(crate) api_base: Option<String>,
    pub(crate) dimension: Option<usize>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            model: None,
            api_key: String::new(),
            api_base: None,
            dimension: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct MemorySettings {
    pub(crate) enabled: bool,
    pub(crate) chunk_tokens: usize,
    pub(crate) chunk_overlap: usize,
    pub(crate) vector_weight: f32,
    pub(crate) max_results: usize,
    pub(crate) sqlite_vec_path: Option<String>,
    pub(crate) embedding: EmbeddingSettings,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_tokens: crate::DEFAULT_CHUNK_TOKENS,
            chunk_overlap: crate::DEFAULT_CHUNK_OVERLAP,
            vector_weight: 0.7,
            max_results: 10,
            sqlite_vec_path: None,
            embedding: EmbeddingSettings::default(),
        }
    }
}

// ── Root ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FileConfig {
    pub(crate) workspace: String,
    pub(crate) data_dir: String,
    pub(crate) agent: AgentSettings,
    pub(crate) providers: BTreeMap<String, ProviderSettings>,
    pub(crate) tools: ToolSettings,
    pub(crate) memory: MemorySettings,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            workspace: "~/.icron/workspace".to_string(),
            data_dir: "~/.icron".to_string(),
            agent: AgentSettings::default(),
            providers: BTreeMap::new(),
            tools: ToolSettings::default(),
            memory: MemorySettings::default(),
        }
    }
}

impl FileConfig {
    pub(crate) fn workspace_path(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub(crate) fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub(crate) fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    pub(crate) fn api_key_for(&self, name: &str) -> Option<String> {
        self.providers
            .get(name)
            .map(|p| p.api_key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// Providers that have an API key configured.
    pub(crate) fn configured_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, p)| !p.api_key.trim().is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Explicit `agent.provider`, then a `provider/` model prefix, then the first keyed provider.
    pub(crate) fn resolve_provider(&self) -> Option<String> {
        if let Some(explicit) = self.agent.provider.as_ref().filter(|p| !p.trim().is_empty()) {
            return Some(explicit.trim().to_string());
        }
        let model = self.agent.model.to_ascii_lowercase();
        if let Some((prefix, _)) = model.split_once('/') {
            if KNOWN_PROVIDERS.contains(&prefix) && self.api_key_for(prefix).is_some() {
                return Some(prefix.to_string());
            }
        }
        if model.contains("claude") && self.api_key_for("anthropic").is_some() {
            return Some("anthropic".to_string());
        }
        KEY_PRIORITY
            .iter()
            .find(|name| self.api_key_for(name).is_some())
            .map(|name| name.to_string())
    }

    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(env_optional);
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(workspace) = lookup("ICRON_WORKSPACE") {
            self.workspace = workspace;
        }
        if let Some(data_dir) = lookup("ICRON_DATA_DIR") {
            self.data_dir = data_dir;
        }
        if let Some(model) = lookup("ICRON_MODEL") {
            self.agent.model = model;
        }
        if let Some(path) = lookup("ICRON_SQLITE_VEC_PATH") {
            self.memory.sqlite_vec_path = Some(path);
        }
        if self.tools.web_search.api_key.trim().is_empty() {
            if let Some(key) = lookup("BRAVE_API_KEY") {
                self.tools.web_search.api_key = key;
            }
        }
        for name in KNOWN_PROVIDERS {
            let var = format!("{}_API_KEY", name.to_ascii_uppercase());
            let Some(key) = lookup(&var) else { continue };
            let entry = self.providers.entry(name.to_string()).or_default();
            if entry.api_key.trim().is_empty() {
                entry.api_key = key;
            }
        }
    }
}

pub(crate) fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}

/// Load config from `path`; a missing file yields defaults.
pub(crate) fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub(crate) fn save_config(path: &Path, config: &FileConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("icron_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("config_{}_{name}.json", std::process::id()))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(&temp_path("missing_never_written")).unwrap();
        assert_eq!(config.agent.max_iterations, 20);
        assert!(config.tools.restrict_to_workspace);
        assert!(!config.tools.exec.allow_shell_fallback);
        assert_eq!(config.memory.chunk_tokens, 400);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let path = temp_path("partial");
        std::fs::write(&path, r#"{"agent": {"model": "gpt-4o"}, "tools": {"exec": {"timeout_secs": 5}}}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.agent.model, "gpt-4o");
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.tools.exec.timeout_secs, 5);
        assert!(config.tools.restrict_to_workspace);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let path = temp_path("invalid");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_save_roundtrip() {
        let path = temp_path("save");
        let mut config = FileConfig::default();
        config.providers.insert(
            "openai".into(),
            ProviderSettings {
                api_key: "sk-test".into(),
                ..Default::default()
            },
        );
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.api_key_for("openai").as_deref(), Some("sk-test"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_env_overrides_fill_missing_keys_only() {
        let mut config = FileConfig::default();
        config.providers.insert(
            "anthropic".into(),
            ProviderSettings {
                api_key: "from-file".into(),
                ..Default::default()
            },
        );
        let env: HashMap<&str, &str> = HashMap::from([
            ("ANTHROPIC_API_KEY", "from-env"),
            ("GROQ_API_KEY", "groq-env"),
            ("ICRON_WORKSPACE", "/tmp/ws"),
            ("BRAVE_API_KEY", "brave"),
        ]);
        config.apply_overrides_from(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.api_key_for("anthropic").as_deref(), Some("from-file"));
        assert_eq!(config.api_key_for("groq").as_deref(), Some("groq-env"));
        assert_eq!(config.workspace_path(), PathBuf::from("/tmp/ws"));
        assert_eq!(config.tools.web_search.api_key, "brave");
    }

    #[test]
    fn test_resolve_provider() {
        let mut config = FileConfig::default();
        assert_eq!(config.resolve_provider(), None);
        config.providers.insert(
            "openai".into(),
            ProviderSettings {
                api_key: "k".into(),
                ..Default::default()
            },
        );
        assert_eq!(config.resolve_provider().as_deref(), Some("openai"));
        config.providers.insert(
            "anthropic".into(),
            ProviderSettings {
                api_key: "k".into(),
                ..Default::default()
            },
        );
        assert_eq!(config.resolve_provider().as_deref(), Some("anthropic"));
        config.agent.provider = Some("groq".into());
        assert_eq!(config.resolve_provider().as_deref(), Some("groq"));
    }
}
