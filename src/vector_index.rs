//! Chunk index over SQLite: embeddings for semantic search, FTS5 for keyword search.
//!
//! The vector side is a strategy picked once at open time. When the `vec0` extension
//! loads, `vec_chunks` mirrors the embeddings and SQLite ranks them; otherwise every
//! stored embedding is scored in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rusqlite::{params, Connection, LoadExtensionGuard, Transaction};

use crate::{IndexError, TextChunk};

pub(crate) const INDEX_FILE_NAME: &str = ".vector_index.db";

// ── Schema SQL ───────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    file_path TEXT NOT NULL,
    start_line INTEGER,
    end_line INTEGER,
    text TEXT NOT NULL,
    embedding BLOB,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_chunks USING fts5(
    text,
    content='chunks',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO fts_chunks(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO fts_chunks(fts_chunks, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO fts_chunks(fts_chunks, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO fts_chunks(rowid, text) VALUES (new.id, new.text);
END;
";

const BM25_SQL: &str = "
SELECT c.file_path, c.text, c.start_line, c.end_line, bm25(fts_chunks) AS rank
FROM fts_chunks
JOIN chunks c ON c.id = fts_chunks.rowid
WHERE fts_chunks MATCH ?1
ORDER BY rank ASC, c.id ASC
LIMIT ?2";

// ── Types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SearchResult {
    pub(crate) file_path: String,
    pub(crate) text: String,
    pub(crate) start_line: i64,
    pub(crate) end_line: i64,
    pub(crate) score: f32,
}

impl SearchResult {
    fn key(&self) -> (String, i64, i64) {
        (self.file_path.clone(), self.start_line, self.end_line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexStats {
    pub(crate) total_chunks: usize,
    pub(crate) indexed_files: usize,
    pub(crate) dimension: usize,
    pub(crate) has_sqlite_vec: bool,
}

pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity; defined as 0 when either vector has zero norm.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ── Vector backends ──────────────────────────────────────────────────────

pub(crate) trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn has_sqlite_vec(&self) -> bool;
    /// Per-connection setup (extension loading).
    fn prepare(&self, conn: &Connection) -> Result<(), IndexError>;
    fn init_schema(&self, conn: &Connection, dimension: usize) -> Result<(), IndexError>;
    fn insert(&self, conn: &Connection, id: i64, blob: &[u8]) -> Result<(), IndexError>;
    fn delete_file(&self, conn: &Connection, file_path: &str) -> Result<(), IndexError>;
    fn clear(&self, conn: &Connection) -> Result<(), IndexError>;
    fn search(&self, conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError>;
}

/// Scores every stored embedding in memory.
#[derive(Debug, Default)]
pub(crate) struct CosineBackend;

impl VectorBackend for CosineBackend {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn has_sqlite_vec(&self) -> bool {
        false
    }

    fn prepare(&self, _conn: &Connection) -> Result<(), IndexError> {
        Ok(())
    }

    fn init_schema(&self, _conn: &Connection, _dimension: usize) -> Result<(), IndexError> {
        Ok(())
    }

    fn insert(&self, _conn: &Connection, _id: i64, _blob: &[u8]) -> Result<(), IndexError> {
        Ok(())
    }

    fn delete_file(&self, _conn: &Connection, _file_path: &str) -> Result<(), IndexError> {
        Ok(())
    }

    fn clear(&self, _conn: &Connection) -> Result<(), IndexError> {
        Ok(())
    }

    fn search(&self, conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        let mut stmt = conn.prepare(
            "SELECT file_path, text, start_line, end_line, embedding
             FROM chunks WHERE embedding IS NOT NULL ORDER BY id ASC",
        )?;
        let rows: Vec<(SearchResult, Vec<u8>)> = stmt
            .query_map([], |row| {
                Ok((
                    SearchResult {
                        file_path: row.get(0)?,
                        text: row.get(1)?,
                        start_line: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        end_line: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        score: 0.0,
                    },
                    row.get(4)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut scored: Vec<SearchResult> = rows
            .into_par_iter()
            .map(|(mut result, blob)| {
                result.score = cosine_similarity(query, &blob_to_embedding(&blob));
                result
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Delegates storage and ranking to the `vec0` virtual table.
#[derive(Debug)]
pub(crate) struct SqliteVecBackend {
    extension_path: PathBuf,
}

impl SqliteVecBackend {
    pub(crate) fn new(extension_path: PathBuf) -> Self {
        Self { extension_path }
    }
}

impl VectorBackend for SqliteVecBackend {
    fn name(&self) -> &'static str {
        "sqlite-vec"
    }

    fn has_sqlite_vec(&self) -> bool {
        true
    }

    fn prepare(&self, conn: &Connection) -> Result<(), IndexError> {
        // SAFETY: the extension path comes from local configuration, and loading is
        // disabled again when the guard drops.
        unsafe {
            let _guard = LoadExtensionGuard::new(conn)?;
            conn.load_extension(&self.extension_path, None)?;
        }
        Ok(())
    }

    fn init_schema(&self, conn: &Connection, dimension: usize) -> Result<(), IndexError> {
        let version: String = conn
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .map_err(|e| IndexError::Extension(format!("vec_version: {e}")))?;
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
                id INTEGER PRIMARY KEY,
                embedding FLOAT[{dimension}]
            );"
        ))?;
        let orphans = conn.execute("DELETE FROM vec_chunks WHERE id NOT IN (SELECT id FROM chunks)", [])?;
        if orphans > 0 {
            tracing::info!(target: "vector_index", orphans, "removed orphaned vec_chunks rows");
        }
        tracing::info!(target: "vector_index", version = %version, dimension, "sqlite-vec ready");
        Ok(())
    }

    fn insert(&self, conn: &Connection, id: i64, blob: &[u8]) -> Result<(), IndexError> {
        conn.execute("INSERT INTO vec_chunks (id, embedding) VALUES (?1, ?2)", params![id, blob])?;
        Ok(())
    }

    fn delete_file(&self, conn: &Connection, file_path: &str) -> Result<(), IndexError> {
        conn.execute(
            "DELETE FROM vec_chunks WHERE id IN (SELECT id FROM chunks WHERE file_path = ?1)",
            params![file_path],
        )?;
        Ok(())
    }

    fn clear(&self, conn: &Connection) -> Result<(), IndexError> {
        conn.execute("DELETE FROM vec_chunks", [])?;
        Ok(())
    }

    fn search(&self, conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        let mut stmt = conn.prepare(
            "SELECT c.file_path, c.text, c.start_line, c.end_line,
                    vec_distance_cosine(v.embedding, ?1) AS distance
             FROM vec_chunks v
             JOIN chunks c ON c.id = v.id
             ORDER BY distance ASC, c.id ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![embedding_to_blob(query), limit as i64], |row| {
                let distance: Option<f64> = row.get(4)?;
                Ok(SearchResult {
                    file_path: row.get(0)?,
                    text: row.get(1)?,
                    start_line: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    end_line: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    score: 1.0 - distance.unwrap_or(0.0) as f32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ── Index ────────────────────────────────────────────────────────────────

pub(crate) struct VectorIndex {
    path: PathBuf,
    dimension: usize,
    backend: Box<dyn VectorBackend>,
}

impl VectorIndex {
    /// Open (or create) the index. `extension` is the path of the `vec0` loadable
    /// library; when it is absent or fails to load, the in-memory backend is used.
    pub(crate) fn open(path: &Path, dimension: usize, extension: Option<&Path>) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let backend: Box<dyn VectorBackend> = match extension {
            Some(ext) => {
                let candidate = SqliteVecBackend::new(ext.to_path_buf());
                match candidate
                    .prepare(&conn)
                    .and_then(|_| candidate.init_schema(&conn, dimension))
                {
                    Ok(()) => Box::new(candidate),
                    Err(e) => {
                        tracing::warn!(target: "vector_index", error = %e, "sqlite-vec unavailable, using in-memory cosine");
                        Box::new(CosineBackend)
                    }
                }
            }
            None => Box::new(CosineBackend),
        };
        tracing::debug!(target: "vector_index", backend = backend.name(), path = %path.display(), "index opened");

        Ok(Self {
            path: path.to_path_buf(),
            dimension,
            backend,
        })
    }

    pub(crate) fn dimension(&self) -> usize {
        self.dimension
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    fn connection(&self) -> Result<Connection, IndexError> {
        let conn = open_connection(&self.path)?;
        self.backend.prepare(&conn)?;
        Ok(conn)
    }

    /// Run `f` in a transaction on a fresh connection; dropped transactions roll back.
    fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, IndexError>) -> Result<T, IndexError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub(crate) fn add_chunk(
        &self,
        file_path: &str,
        text: &str,
        embedding: &[f32],
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<i64, IndexError> {
        self.check_dimension(embedding)?;
        self.with_transaction(|tx| self.insert_row(tx, file_path, text, embedding, start_line, end_line))
    }

    fn insert_row(
        &self,
        tx: &Transaction<'_>,
        file_path: &str,
        text: &str,
        embedding: &[f32],
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<i64, IndexError> {
        let blob = embedding_to_blob(embedding);
        tx.execute(
            "INSERT INTO chunks (file_path, start_line, end_line, text, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_path,
                start_line.map(|n| n as i64),
                end_line.map(|n| n as i64),
                text,
                blob
            ],
        )?;
        let id = tx.last_insert_rowid();
        self.backend.insert(tx, id, &blob)?;
        Ok(id)
    }

    /// Swap every row of `file_path` for `chunks` in one transaction. On any error the
    /// previous rows stay in place.
    pub(crate) fn replace_file(
        &self,
        file_path: &str,
        chunks: &[TextChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<usize, IndexError> {
        for embedding in embeddings {
            self.check_dimension(embedding)?;
        }
        let inserted = self.with_transaction(|tx| {
            self.backend.delete_file(tx, file_path)?;
            tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])?;
            let mut inserted = 0;
            for (chunk, embedding) in chunks.iter().zip(embeddings) {
                self.insert_row(
                    tx,
                    file_path,
                    &chunk.text,
                    embedding,
                    Some(chunk.start_line),
                    Some(chunk.end_line),
                )?;
                inserted += 1;
            }
            Ok(inserted)
        })?;
        tracing::debug!(target: "vector_index", file_path, inserted, "replaced chunks");
        Ok(inserted)
    }

    pub(crate) fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        self.check_dimension(query_embedding)?;
        let conn = self.connection()?;
        self.backend.search(&conn, query_embedding, limit)
    }

    /// Keyword search over FTS5 with scores normalised to `[0, 1]`.
    pub(crate) fn keyword_search(&self, query_text: &str, limit: usize) -> Result<Vec<SearchResult>, IndexError> {
        let conn = self.connection()?;
        Ok(search_bm25(&conn, query_text, limit))
    }

    /// `final = w * vector + (1 - w) * keyword`, merged by `(file_path, start_line, end_line)`.
    pub(crate) fn hybrid_search(
        &self,
        query_embedding: &[f32],
        query_text: &str,
        limit: usize,
        vector_weight: f32,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if !(0.0..=1.0).contains(&vector_weight) {
            return Err(IndexError::InvalidWeight(vector_weight));
        }
        self.check_dimension(query_embedding)?;
        let conn = self.connection()?;
        let fetch = limit.saturating_mul(2);

        let vector_results = if vector_weight > 0.0 {
            self.backend.search(&conn, query_embedding, fetch)?
        } else {
            Vec::new()
        };
        let keyword_results = if vector_weight < 1.0 {
            search_bm25(&conn, query_text, fetch)
        } else {
            Vec::new()
        };
        Ok(combine_results(vector_results, keyword_results, vector_weight, limit))
    }

    /// Remove every chunk of `file_path`; returns the number of base rows deleted.
    pub(crate) fn delete_by_file(&self, file_path: &str) -> Result<usize, IndexError> {
        let deleted = self.with_transaction(|tx| {
            self.backend.delete_file(tx, file_path)?;
            Ok(tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])?)
        })?;
        tracing::debug!(target: "vector_index", file_path, deleted, "deleted chunks");
        Ok(deleted)
    }

    pub(crate) fn get_indexed_files(&self) -> Result<Vec<String>, IndexError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT DISTINCT file_path FROM chunks ORDER BY file_path")?;
        let files = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub(crate) fn chunk_count(&self) -> Result<usize, IndexError> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub(crate) fn get_stats(&self) -> Result<IndexStats, IndexError> {
        let conn = self.connection()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let files: i64 = conn.query_row("SELECT COUNT(DISTINCT file_path) FROM chunks", [], |row| row.get(0))?;
        Ok(IndexStats {
            total_chunks: total as usize,
            indexed_files: files as usize,
            dimension: self.dimension,
            has_sqlite_vec: self.backend.has_sqlite_vec(),
        })
    }

    pub(crate) fn clear(&self) -> Result<(), IndexError> {
        self.with_transaction(|tx| {
            self.backend.clear(tx)?;
            tx.execute("DELETE FROM chunks", [])?;
            Ok(())
        })?;
        tracing::info!(target: "vector_index", "index cleared");
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection, IndexError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn quote_fts(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn run_bm25(conn: &Connection, match_expr: &str, limit: usize) -> Result<Vec<(SearchResult, f64)>, rusqlite::Error> {
    let mut stmt = conn.prepare(BM25_SQL)?;
    let rows = stmt
        .query_map(params![match_expr, limit as i64], |row| {
            Ok((
                SearchResult {
                    file_path: row.get(0)?,
                    text: row.get(1)?,
                    start_line: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    end_line: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    score: 0.0,
                },
                row.get::<_, f64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Phrase match first, then any quoted word. Failures degrade to no keyword hits.
fn search_bm25(conn: &Connection, query_text: &str, limit: usize) -> Vec<SearchResult> {
    let query_text = query_text.trim();
    if query_text.is_empty() || limit == 0 {
        return Vec::new();
    }
    let phrase = run_bm25(conn, &quote_fts(query_text), limit);
    let rows = match phrase {
        Ok(rows) if !rows.is_empty() => rows,
        other => {
            if let Err(e) = other {
                tracing::debug!(target: "vector_index", error = %e, "phrase query failed");
            }
            let words: Vec<String> = query_text.split_whitespace().map(quote_fts).collect();
            match run_bm25(conn, &words.join(" OR "), limit) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(target: "vector_index", error = %e, "bm25 search failed");
                    return Vec::new();
                }
            }
        }
    };
    normalize_bm25(rows)
}

/// bm25() ranks are lower-is-better; map them to `1 - (rank - min) / range`.
fn normalize_bm25(rows: Vec<(SearchResult, f64)>) -> Vec<SearchResult> {
    if rows.is_empty() {
        return Vec::new();
    }
    let min = rows.iter().map(|(_, r)| *r).fold(f64::INFINITY, f64::min);
    let max = rows.iter().map(|(_, r)| *r).fold(f64::NEG_INFINITY, f64::max);
    let range = if max != min { max - min } else { 1.0 };
    rows.into_iter()
        .map(|(mut result, rank)| {
            result.score = (1.0 - (rank - min) / range) as f32;
            result
        })
        .collect()
}

fn combine_results(
    vector_results: Vec<SearchResult>,
    keyword_results: Vec<SearchResult>,
    vector_weight: f32,
    limit: usize,
) -> Vec<SearchResult> {
    let keyword_weight = 1.0 - vector_weight;
    // Insertion order is preserved so equal scores keep their first-seen order.
    let mut merged: Vec<(SearchResult, f32, f32)> = Vec::new();
    let mut positions: HashMap<(String, i64, i64), usize> = HashMap::new();

    for (result, from_vector) in vector_results
        .into_iter()
        .map(|r| (r, true))
        .chain(keyword_results.into_iter().map(|r| (r, false)))
    {
        let score = result.score;
        let pos = *positions.entry(result.key()).or_insert_with(|| {
            merged.push((result, 0.0, 0.0));
            merged.len() - 1
        });
        let entry = &mut merged[pos];
        if from_vector {
            entry.1 = entry.1.max(score);
        } else {
            entry.2 = entry.2.max(score);
        }
    }

    let mut combined: Vec<SearchResult> = merged
        .into_iter()
        .map(|(mut result, v, b)| {
            result.score = vector_weight * v + keyword_weight * b;
            result
        })
        .collect();
    combined.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    combined.truncate(limit);
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("icron_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("index_{}_{name}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn seeded(name: &str) -> VectorIndex {
        let index = VectorIndex::open(&temp_db_path(name), 3, None).unwrap();
        index
            .add_chunk("MEMORY.md", "the user likes green tea", &[1.0, 0.0, 0.0], Some(1), Some(2))
            .unwrap();
        index
            .add_chunk("memory/2025-01-02.md", "deploy the rust service", &[0.0, 1.0, 0.0], Some(1), Some(4))
            .unwrap();
        index
            .add_chunk("memory/2025-01-03.md", "green tea and rust deploy notes", &[0.7, 0.7, 0.0], Some(3), Some(9))
            .unwrap();
        index
            .add_chunk("memory/2025-01-04.md", "unrelated grocery list", &[0.0, 0.0, 1.0], Some(1), Some(1))
            .unwrap();
        index
    }

    #[test]
    fn test_vector_search_orders_by_cosine() {
        let index = seeded("vector");
        assert_eq!(index.backend_name(), "cosine");
        let results = index.search(&[1.0, 0.1, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].file_path, "MEMORY.md");
        assert_eq!(results[1].file_path, "memory/2025-01-03.md");
        assert!(results[0].score >= results[1].score && results[1].score >= results[2].score);
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        let index = seeded("zero");
        let results = index.search(&[0.0, 0.0, 0.0], 10).unwrap();
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_usable() {
        let index = seeded("dimension");
        let before = index.chunk_count().unwrap();
        let err = index.add_chunk("x.md", "bad", &[1.0, 2.0], None, None).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(matches!(
            index.search(&[1.0; 4], 5),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            index.hybrid_search(&[1.0], "tea", 5, 0.5),
            Err(IndexError::DimensionMismatch { .. })
        ));
        assert_eq!(index.chunk_count().unwrap(), before);
        index.add_chunk("x.md", "good", &[0.1, 0.2, 0.3], None, None).unwrap();
        assert_eq!(index.chunk_count().unwrap(), before + 1);
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let index = seeded("weight");
        for w in [-0.1f32, 1.5, f32::NAN] {
            assert!(matches!(
                index.hybrid_search(&[1.0, 0.0, 0.0], "tea", 5, w),
                Err(IndexError::InvalidWeight(_))
            ));
        }
    }

    #[test]
    fn test_hybrid_weight_extremes() {
        let index = seeded("extremes");
        let query = [0.2, 0.9, 0.1];

        let vector_only = index.hybrid_search(&query, "green tea", 3, 1.0).unwrap();
        let search = index.search(&query, 3).unwrap();
        assert_eq!(vector_only, search);

        let keyword_only = index.hybrid_search(&query, "green tea", 3, 0.0).unwrap();
        let keyword = index.keyword_search("green tea", 6).unwrap();
        let expected: Vec<SearchResult> = keyword.into_iter().take(3).collect();
        assert_eq!(keyword_only, expected);
        assert!(keyword_only.iter().all(|r| r.text.contains("green tea")));
    }

    #[test]
    fn test_hybrid_blends_both_sides() {
        let index = seeded("blend");
        let results = index.hybrid_search(&[0.0, 1.0, 0.0], "green tea", 4, 0.5).unwrap();
        assert!(!results.is_empty());
        let keys: Vec<_> = results.iter().map(|r| r.key()).collect();
        let mut dedup = keys.clone();
        dedup.dedup();
        assert_eq!(keys.len(), dedup.len());
        let files: Vec<&str> = results.iter().map(|r| r.file_path.as_str()).collect();
        assert!(files.contains(&"memory/2025-01-02.md"));
        assert!(files.contains(&"MEMORY.md"));
        let both = results.iter().find(|r| r.file_path == "memory/2025-01-03.md").unwrap();
        assert!(both.score > 0.3);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_keyword_phrase_then_words() {
        let index = seeded("keyword");
        let phrase = index.keyword_search("green tea", 10).unwrap();
        assert_eq!(phrase.len(), 2);
        let words = index.keyword_search("grocery deploy", 10).unwrap();
        let files: Vec<&str> = words.iter().map(|r| r.file_path.as_str()).collect();
        assert!(files.contains(&"memory/2025-01-04.md"));
        assert!(files.contains(&"memory/2025-01-02.md"));
        assert!(words.iter().all(|r| (0.0..=1.0).contains(&r.score)));
        assert!(index.keyword_search("say \"hi\" (", 10).unwrap().is_empty());
        assert!(index.keyword_search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_delete_by_file_and_stats() {
        let index = seeded("delete");
        index.add_chunk("MEMORY.md", "second chunk", &[0.5, 0.5, 0.5], Some(3), Some(5)).unwrap();
        let stats = index.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 5);
        assert_eq!(stats.indexed_files, 4);
        assert_eq!(stats.dimension, 3);
        assert!(!stats.has_sqlite_vec);

        assert_eq!(index.delete_by_file("MEMORY.md").unwrap(), 2);
        assert_eq!(index.delete_by_file("MEMORY.md").unwrap(), 0);
        assert!(index.keyword_search("likes", 10).unwrap().is_empty());
        assert_eq!(
            index.get_indexed_files().unwrap(),
            vec!["memory/2025-01-02.md", "memory/2025-01-03.md", "memory/2025-01-04.md"]
        );

        index.clear().unwrap();
        assert_eq!(index.chunk_count().unwrap(), 0);
        assert!(index.keyword_search("rust", 10).unwrap().is_empty());
    }

    #[test]
    fn test_replace_file_is_atomic() {
        let index = seeded("replace");
        let chunks = vec![
            TextChunk { text: "the user now drinks coffee".into(), start_line: 1, end_line: 1 },
            TextChunk { text: "and still writes rust".into(), start_line: 2, end_line: 3 },
        ];
        let bad = vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]];
        assert!(matches!(
            index.replace_file("MEMORY.md", &chunks, &bad),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(index.keyword_search("likes", 10).unwrap().len(), 1);

        let good = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        assert_eq!(index.replace_file("MEMORY.md", &chunks, &good).unwrap(), 2);
        assert!(index.keyword_search("likes", 10).unwrap().is_empty());
        assert_eq!(index.keyword_search("coffee", 10).unwrap()[0].file_path, "MEMORY.md");
        assert_eq!(index.chunk_count().unwrap(), 5);

        assert_eq!(index.replace_file("MEMORY.md", &[], &[]).unwrap(), 0);
        assert_eq!(index.chunk_count().unwrap(), 3);
    }

    #[test]
    fn test_missing_extension_falls_back() {
        let path = temp_db_path("fallback");
        let index = VectorIndex::open(&path, 3, Some(Path::new("/nonexistent/vec0.so"))).unwrap();
        assert_eq!(index.backend_name(), "cosine");
        index.add_chunk("a.md", "text", &[1.0, 0.0, 0.0], Some(1), Some(1)).unwrap();
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn test_blob_roundtrip_preserves_values() {
        let values = [0.25f32, -1.5, 3.0e-7];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&values)), values);
    }
}
