use thiserror::Error;

/// Path validation failures raised by the workspace guard.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum GuardError {
    #[error("{0}")]
    Security(String),
    #[error("{0}")]
    Config(String),
}

/// Failures at the vector index boundary. Dimension and weight errors are caller bugs.
#[derive(Debug, Error)]
pub(crate) enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector_weight must be within [0, 1], got {0}")]
    InvalidWeight(f32),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("vector extension: {0}")]
    Extension(String),
}

/// Subprocess failures surfaced by a `CommandRunner`.
#[derive(Debug, Error)]
pub(crate) enum RunError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("config io ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse ({path}): {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Final outcome of an HTTP call after retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum HttpError {
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode response: {0}")]
    Decode(String),
}

impl HttpError {
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(msg) if msg.to_ascii_lowercase().contains("timed out"))
    }
}
