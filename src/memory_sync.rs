//! Keeps the vector index in step with the markdown memory files.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;

use walkdir::WalkDir;

use crate::{
    build_embedder, EmbeddingProvider, FileConfig, MemorySettings, MemoryStore, SearchResult, VectorIndex,
    INDEX_FILE_NAME,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct IndexReport {
    pub(crate) files: usize,
    pub(crate) chunks: usize,
    pub(crate) failures: Vec<String>,
}

/// Store, index and embedder bundled for the memory tools.
pub(crate) struct MemoryBackend {
    pub(crate) store: MemoryStore,
    pub(crate) index: VectorIndex,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    chunk_tokens: usize,
    chunk_overlap: usize,
    vector_weight: f32,
    max_results: usize,
}

impl MemoryBackend {
    pub(crate) fn open(
        workspace: &Path,
        settings: &MemorySettings,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, String> {
        let store = MemoryStore::new(workspace)?;
        let index_path = store.memory_dir().join(INDEX_FILE_NAME);
        let extension = settings.sqlite_vec_path.as_ref().map(|p| crate::expand_home(p));
        let index = VectorIndex::open(&index_path, embedder.dimension(), extension.as_deref())
            .map_err(|e| format!("open vector index: {e}"))?;
        Ok(Self {
            store,
            index,
            embedder,
            chunk_tokens: settings.chunk_tokens,
            chunk_overlap: settings.chunk_overlap,
            vector_weight: settings.vector_weight.clamp(0.0, 1.0),
            max_results: settings.max_results.max(1),
        })
    }

    pub(crate) fn default_limit(&self) -> usize {
        self.max_results
    }

    /// Markdown files eligible for indexing: `MEMORY.md` plus non-hidden `memory/**/*.md`.
    pub(crate) fn indexable_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let permanent = self.store.permanent_path();
        if permanent.is_file() {
            files.push(permanent);
        }
        for entry in WalkDir::new(self.store.memory_dir())
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().map(|ext| ext == "md").unwrap_or(false) {
                files.push(path.to_path_buf());
            }
        }
        files
    }

    /// Replace every chunk of `path` with a fresh chunking of its current content.
    /// Embedding happens before the index is touched, so a failing embedder leaves the
    /// previous chunks searchable.
    pub(crate) fn reindex_file(&self, path: &Path) -> Result<usize, String> {
        let rel = self.store.relative_name(path);
        let chunks = if path.is_file() {
            self.store.chunk_file(path, self.chunk_tokens, self.chunk_overlap)?
        } else {
            Vec::new()
        };
        let embeddings = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            self.embedder.embed_batch(&texts)?
        };
        if embeddings.len() != chunks.len() {
            return Err(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            ));
        }
        let count = self
            .index
            .replace_file(&rel, &chunks, &embeddings)
            .map_err(|e| format!("index {rel}: {e}"))?;
        tracing::debug!(target: "memory_sync", file = %rel, chunks = count, "reindexed");
        Ok(count)
    }

    pub(crate) fn index_all(&self) -> IndexReport {
        let mut report = IndexReport::default();
        for path in self.indexable_files() {
            match self.reindex_file(&path) {
                Ok(count) => {
                    report.files += 1;
                    report.chunks += count;
                }
                Err(e) => {
                    tracing::warn!(target: "memory_sync", file = %path.display(), error = %e, "failed to index");
                    report.failures.push(format!("{}: {e}", self.store.relative_name(&path)));
                }
            }
        }
        report
    }

    pub(crate) fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchResult>, String> {
        let limit = limit.unwrap_or(self.max_results).max(1);
        let embedding = self.embedder.embed(query)?;
        self.index
            .hybrid_search(&embedding, query, limit, self.vector_weight)
            .map_err(|e| format!("memory search: {e}"))
    }
}

/// Startup indexing on its own thread; the agent never waits on it.
pub(crate) fn spawn_background_index(backend: Arc<MemoryBackend>) -> Option<thread::JoinHandle<IndexReport>> {
    thread::Builder::new()
        .name("memory-index".into())
        .spawn(move || {
            let report = backend.index_all();
            tracing::info!(
                target: "memory_sync",
                files = report.files,
                chunks = report.chunks,
                failures = report.failures.len(),
                "memory indexing finished"
            );
            report
        })
        .map_err(|e| tracing::warn!(target: "memory_sync", error = %e, "could not spawn indexing thread"))
        .ok()
}

/// Builds the memory backend on first use unless one was injected.
pub(crate) struct LazyMemory {
    config: Option<FileConfig>,
    cell: OnceLock<Result<Arc<MemoryBackend>, String>>,
}

impl LazyMemory {
    pub(crate) fn from_config(config: &FileConfig) -> Self {
        Self {
            config: Some(config.clone()),
            cell: OnceLock::new(),
        }
    }

    pub(crate) fn injected(backend: Arc<MemoryBackend>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(backend));
        Self { config: None, cell }
    }

    pub(crate) fn get(&self) -> Result<Arc<MemoryBackend>, String> {
        self.cell
            .get_or_init(|| {
                let config = self
                    .config
                    .as_ref()
                    .ok_or_else(|| "memory backend not configured".to_string())?;
                if !config.memory.enabled {
                    return Err("Memory system is disabled (memory.enabled = false)".to_string());
                }
                let embedder = build_embedder(config)?;
                let backend = MemoryBackend::open(&config.workspace_path(), &config.memory, embedder)?;
                Ok(Arc::new(backend))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashEmbedding;

    fn temp_workspace(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("icron_test")
            .join(format!("sync_{}_{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_backend(name: &str) -> MemoryBackend {
        let ws = temp_workspace(name);
        MemoryBackend::open(&ws, &MemorySettings::default(), Arc::new(HashEmbedding::new(64))).unwrap()
    }

    #[test]
    fn test_reindex_replaces_chunks() {
        let backend = test_backend("reindex");
        backend.store.write_permanent("# Facts\nThe cat is named Miso.").unwrap();
        let path = backend.store.permanent_path();
        assert_eq!(backend.reindex_file(&path).unwrap(), 1);
        assert_eq!(backend.reindex_file(&path).unwrap(), 1);
        assert_eq!(backend.index.chunk_count().unwrap(), 1);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(backend.reindex_file(&path).unwrap(), 0);
        assert_eq!(backend.index.chunk_count().unwrap(), 0);
    }

    struct OfflineEmbedding;

    impl EmbeddingProvider for OfflineEmbedding {
        fn name(&self) -> &str {
            "offline"
        }

        fn dimension(&self) -> usize {
            64
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
            Err("embedding service unreachable".into())
        }
    }

    #[test]
    fn test_failed_embedding_keeps_previous_chunks() {
        let backend = test_backend("embed_fail");
        backend.store.write_permanent("The cat is named Miso.").unwrap();
        let path = backend.store.permanent_path();
        assert_eq!(backend.reindex_file(&path).unwrap(), 1);

        let ws = backend.store.workspace().to_path_buf();
        let offline = MemoryBackend::open(&ws, &MemorySettings::default(), Arc::new(OfflineEmbedding)).unwrap();
        offline.store.append_permanent("The dog is named Pixel.").unwrap();
        let err = offline.reindex_file(&path).unwrap_err();
        assert!(err.contains("unreachable"), "{err}");
        assert_eq!(offline.index.chunk_count().unwrap(), 1);
        assert_eq!(offline.index.keyword_search("Miso", 5).unwrap().len(), 1);
    }

    #[test]
    fn test_index_all_skips_hidden_and_finds_logs() {
        let backend = test_backend("index_all");
        backend.store.write_permanent("perm fact").unwrap();
        backend.store.append_daily_log("deployed the service", None).unwrap();
        std::fs::write(backend.store.memory_dir().join(".hidden.md"), "secret").unwrap();
        std::fs::create_dir_all(backend.store.memory_dir().join("topics")).unwrap();
        std::fs::write(backend.store.memory_dir().join("topics/rust.md"), "rust notes").unwrap();

        let report = backend.index_all();
        assert_eq!(report.files, 3);
        assert!(report.failures.is_empty());
        let files = backend.index.get_indexed_files().unwrap();
        assert!(files.contains(&"MEMORY.md".to_string()));
        assert!(files.contains(&"memory/topics/rust.md".to_string()));
        assert!(!files.iter().any(|f| f.contains(".hidden")));
    }

    #[test]
    fn test_search_finds_written_fact() {
        let backend = test_backend("search");
        backend.store.write_permanent("favourite drink: green tea").unwrap();
        backend.store.append_daily_log("grocery run for bananas", None).unwrap();
        backend.index_all();
        let hits = backend.search("green tea", Some(3)).unwrap();
        assert_eq!(hits[0].file_path, "MEMORY.md");
    }

    #[test]
    fn test_lazy_memory_injection_and_disabled() {
        let injected = LazyMemory::injected(Arc::new(test_backend("lazy")));
        assert!(injected.get().is_ok());

        let mut config = FileConfig::default();
        config.memory.enabled = false;
        config.workspace = temp_workspace("lazy_disabled").display().to_string();
        let lazy = LazyMemory::from_config(&config);
        assert!(lazy.get().err().unwrap().contains("disabled"));
    }
}
