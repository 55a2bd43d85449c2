//! Embedding providers for semantic memory.

use std::sync::Arc;

use crate::{http_agent, post_json_with_retry, EmbeddingSettings, FileConfig, RetryPolicy};

pub(crate) const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub(crate) const OPENAI_EMBEDDING_DIMENSION: usize = 1536;
pub(crate) const LOCAL_EMBEDDING_DIMENSION: usize = 256;
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub(crate) trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, String>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

// ── OpenAI-compatible HTTP ───────────────────────────────────────────────

pub(crate) struct OpenAiEmbedding {
    api_key: String,
    api_base: String,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
}

impl OpenAiEmbedding {
    pub(crate) fn new(api_key: String, api_base: Option<String>, model: Option<String>, dimension: Option<usize>) -> Self {
        Self {
            api_key,
            api_base: api_base
                .unwrap_or_else(|| OPENAI_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| OPENAI_EMBEDDING_MODEL.to_string()),
            dimension: dimension.unwrap_or(OPENAI_EMBEDDING_DIMENSION),
            agent: http_agent(30),
        }
    }

    fn request(&self, input: serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
        let url = format!("{}/embeddings", self.api_base);
        let auth = format!("Bearer {}", self.api_key);
        let payload = serde_json::json!({"input": input, "model": self.model});
        let policy = RetryPolicy {
            max_retries: 3,
            base_secs: 1.0,
            max_secs: 8.0,
        };
        let body = post_json_with_retry(&self.agent, &url, &[("authorization", &auth)], &payload, policy, "embeddings")
            .map_err(|e| format!("embedding request failed: {e}"))?;
        parse_embedding_response(&body, self.dimension)
    }
}

/// Pull `data[*].embedding` out of an OpenAI-style response, ordered by `index`.
pub(crate) fn parse_embedding_response(body: &serde_json::Value, dimension: usize) -> Result<Vec<Vec<f32>>, String> {
    let data = body
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or("embedding response missing data")?;
    let mut items: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(pos as u64);
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or("embedding item missing vector")?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vector.len() != dimension {
            return Err(format!(
                "embedding dimension {} does not match configured {dimension}",
                vector.len()
            ));
        }
        items.push((index, vector));
    }
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, v)| v).collect())
}

impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        self.request(serde_json::json!(text))?
            .into_iter()
            .next()
            .ok_or_else(|| "embedding response was empty".to_string())
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(serde_json::json!(texts))
    }
}

// ── Local hashed bag-of-words ────────────────────────────────────────────

/// Offline embedding: lowercase word tokens hashed (blake3) into signed buckets,
/// then L2-normalised. Shares vocabulary overlap, not meaning.
pub(crate) struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl EmbeddingProvider for HashEmbedding {
    fn name(&self) -> &str {
        "local"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as usize
                % self.dimension;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────

/// Build the configured embedder. `auto` uses OpenAI when a key is available and the
/// local hash embedding otherwise.
pub(crate) fn build_embedder(config: &FileConfig) -> Result<Arc<dyn EmbeddingProvider>, String> {
    let settings: &EmbeddingSettings = &config.memory.embedding;
    let key = Some(settings.api_key.trim().to_string())
        .filter(|k| !k.is_empty())
        .or_else(|| config.api_key_for("openai"));
    let api_base = settings
        .api_base
        .clone()
        .or_else(|| config.provider("openai").and_then(|p| p.api_base.clone()));

    match settings.provider.as_str() {
        "openai" => {
            let key = key.ok_or("memory.embedding.provider is openai but no OpenAI API key is configured")?;
            Ok(Arc::new(OpenAiEmbedding::new(key, api_base, settings.model.clone(), settings.dimension)))
        }
        "local" | "hash" => Ok(Arc::new(HashEmbedding::new(
            settings.dimension.unwrap_or(LOCAL_EMBEDDING_DIMENSION),
        ))),
        "auto" | "" => match key {
            Some(key) => Ok(Arc::new(OpenAiEmbedding::new(key, api_base, settings.model.clone(), settings.dimension))),
            None => {
                tracing::info!(target: "embeddings", "no embedding API key, using local hashed embeddings");
                Ok(Arc::new(HashEmbedding::new(
                    settings.dimension.unwrap_or(LOCAL_EMBEDDING_DIMENSION),
                )))
            }
        },
        other => Err(format!("unknown embedding provider: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cosine_similarity, ProviderSettings};

    #[test]
    fn test_hash_embedding_is_normalised_and_stable() {
        let embedder = HashEmbedding::new(64);
        let a = embedder.embed("Green tea with honey").unwrap();
        let b = embedder.embed("green TEA with honey").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(embedder.embed("").unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_hash_embedding_prefers_shared_words() {
        let embedder = HashEmbedding::new(256);
        let query = embedder.embed("rust deploy").unwrap();
        let close = embedder.embed("deploy the rust service").unwrap();
        let far = embedder.embed("grocery list bananas").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_parse_embedding_response_orders_by_index() {
        let body = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_embedding_response(&body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_embedding_response(&body, 3).is_err());
        assert!(parse_embedding_response(&serde_json::json!({}), 2).is_err());
    }

    #[test]
    fn test_build_embedder_selection() {
        let mut config = FileConfig::default();
        assert_eq!(build_embedder(&config).unwrap().name(), "local");

        config.memory.embedding.provider = "openai".into();
        assert!(build_embedder(&config).is_err());

        config.providers.insert(
            "openai".into(),
            ProviderSettings {
                api_key: "sk".into(),
                ..Default::default()
            },
        );
        let embedder = build_embedder(&config).unwrap();
        assert_eq!(embedder.name(), "openai");
        assert_eq!(embedder.dimension(), OPENAI_EMBEDDING_DIMENSION);

        config.memory.embedding.provider = "nope".into();
        assert!(build_embedder(&config).is_err());
    }
}
