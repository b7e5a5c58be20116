//! Semantic routing for `auto_router/<name>` models: the last user message is
//! embedded and compared against per-route centroids of example prompts.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::error::ProviderError;

pub const AUTO_ROUTER_PREFIX: &str = "auto_router/";

fn default_threshold() -> f64 {
    0.5
}

#[derive(Clone, Debug, Deserialize)]
pub struct AutoRouterConfig {
    pub name: String,
    pub default_model: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub embedding_model: String,
    #[serde(default)]
    pub routes: Vec<SemanticRoute>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SemanticRoute {
    pub name: String,
    pub model: String,
    #[serde(default, alias = "utterances")]
    pub examples: Vec<String>,
}

/// Embeds texts with a named embedding model. The gateway implements this over
/// its own embedding path.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub fn cosine(u: &[f32], v: &[f32]) -> f64 {
    if u.is_empty() || u.len() != v.len() {
        return 0.0;
    }
    let (mut dot, mut nu, mut nv) = (0.0f64, 0.0f64, 0.0f64);
    for (a, b) in u.iter().zip(v) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        nu += a * a;
        nv += b * b;
    }
    if nu == 0.0 || nv == 0.0 {
        return 0.0;
    }
    dot / (nu.sqrt() * nv.sqrt())
}

/// Index of the most similar centroid, or `None` when nothing clears `threshold`.
pub fn best_route(query: &[f32], centroids: &[Vec<f32>], threshold: f64) -> Option<usize> {
    let (idx, score) = centroids
        .iter()
        .enumerate()
        .map(|(idx, centroid)| (idx, cosine(query, centroid)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    (score > threshold).then_some(idx)
}

fn mean(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let mut sum = vec![0.0f32; dim];
    let mut count = 0usize;
    for vector in vectors.iter().filter(|v| v.len() == dim) {
        for (acc, value) in sum.iter_mut().zip(vector) {
            *acc += value;
        }
        count += 1;
    }
    let count = count.max(1) as f32;
    sum.iter_mut().for_each(|value| *value /= count);
    sum
}

#[derive(Debug)]
pub struct AutoRouter {
    config: AutoRouterConfig,
    centroids: OnceCell<Vec<Vec<f32>>>,
}

impl AutoRouter {
    pub fn new(config: AutoRouterConfig) -> Self {
        Self {
            config,
            centroids: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Route centroids, built once. Concurrent first callers wait on the same build;
    /// a failed build is retried by the next caller.
    async fn centroids(&self, embedder: &dyn Embedder) -> Result<&[Vec<f32>], ProviderError> {
        let centroids = self
            .centroids
            .get_or_try_init(|| async {
                let examples: Vec<String> = self
                    .config
                    .routes
                    .iter()
                    .flat_map(|route| route.examples.iter().cloned())
                    .collect();
                let vectors = if examples.is_empty() {
                    Vec::new()
                } else {
                    embedder.embed(&self.config.embedding_model, &examples).await?
                };
                let mut offset = 0usize;
                let mut out = Vec::with_capacity(self.config.routes.len());
                for route in &self.config.routes {
                    let end = (offset + route.examples.len()).min(vectors.len());
                    out.push(mean(&vectors[offset.min(end)..end]));
                    offset = end;
                }
                tracing::debug!(
                    auto_router = %self.config.name,
                    routes = out.len(),
                    "built semantic route centroids"
                );
                Ok::<_, ProviderError>(out)
            })
            .await?;
        Ok(centroids.as_slice())
    }

    /// Model for `text`. Empty input and sub-threshold matches use the default model.
    pub async fn resolve(
        &self,
        embedder: &dyn Embedder,
        text: Option<&str>,
    ) -> Result<String, ProviderError> {
        let Some(text) = text.map(str::trim).filter(|text| !text.is_empty()) else {
            return Ok(self.config.default_model.clone());
        };
        let centroids = self.centroids(embedder).await?;
        if centroids.is_empty() {
            return Ok(self.config.default_model.clone());
        }
        let query = embedder
            .embed(&self.config.embedding_model, &[text.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        Ok(match best_route(&query, centroids, self.config.threshold) {
            Some(idx) => {
                let route = &self.config.routes[idx];
                tracing::debug!(auto_router = %self.config.name, route = %route.name, "semantic route matched");
                route.model.clone()
            }
            None => self.config.default_model.clone(),
        })
    }
}

/// Auto-routers by name.
#[derive(Debug, Default)]
pub struct AutoRouters {
    routers: BTreeMap<String, Arc<AutoRouter>>,
}

impl AutoRouters {
    pub fn new(configs: impl IntoIterator<Item = AutoRouterConfig>) -> Self {
        Self {
            routers: configs
                .into_iter()
                .map(|config| (config.name.clone(), Arc::new(AutoRouter::new(config))))
                .collect(),
        }
    }

    /// The router for an `auto_router/<name>` model.
    pub fn for_model(&self, model: &str) -> Option<Arc<AutoRouter>> {
        let name = model.strip_prefix(AUTO_ROUTER_PREFIX)?;
        self.routers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bag-of-words over a tiny vocabulary.
    #[derive(Default)]
    struct WordEmbedder {
        calls: AtomicUsize,
    }

    const VOCAB: &[&str] = &["solve", "equation", "write", "python", "function"];

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(
            &self,
            _model: &str,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|text| {
                    let words: Vec<String> =
                        text.split_whitespace().map(str::to_lowercase).collect();
                    VOCAB
                        .iter()
                        .map(|term| if words.iter().any(|w| w == term) { 1.0 } else { 0.0 })
                        .collect()
                })
                .collect())
        }
    }

    fn config() -> AutoRouterConfig {
        serde_json::from_value(serde_json::json!({
            "name": "x",
            "default_model": "gpt-4o-mini",
            "embedding_model": "text-embedding-3-small",
            "routes": [
                {"name": "math", "model": "gpt-4o", "examples": ["solve equation"]},
                {"name": "code", "model": "claude", "examples": ["write python"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn cosine_of_unit_vectors() {
        let u = [0.6f32, 0.8];
        let neg = [-0.6f32, -0.8];
        let orth = [0.8f32, -0.6];
        assert!((cosine(&u, &u) - 1.0).abs() < 1e-6);
        assert!((cosine(&u, &neg) + 1.0).abs() < 1e-6);
        assert!(cosine(&u, &orth).abs() < 1e-6);
    }

    #[test]
    fn no_candidates_or_low_scores_mean_no_route() {
        assert_eq!(best_route(&[1.0, 0.0], &[], 0.5), None);
        assert_eq!(best_route(&[1.0, 0.0], &[vec![0.0, 1.0]], 0.5), None);
        assert_eq!(
            best_route(&[1.0, 0.0], &[vec![0.0, 1.0], vec![1.0, 0.1]], 0.5),
            Some(1)
        );
    }

    #[tokio::test]
    async fn routes_code_prompts_to_the_code_model() {
        let routers = AutoRouters::new([config()]);
        let router = routers.for_model("auto_router/x").unwrap();
        let embedder = WordEmbedder::default();
        let model = router
            .resolve(&embedder, Some("write a python function"))
            .await
            .unwrap();
        assert_eq!(model, "claude");
        let model = router.resolve(&embedder, Some("")).await.unwrap();
        assert_eq!(model, "gpt-4o-mini");
        let model = router.resolve(&embedder, Some("hello there")).await.unwrap();
        assert_eq!(model, "gpt-4o-mini");
        // one centroid build plus two query embeddings
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert!(routers.for_model("auto_router/missing").is_none());
        assert!(routers.for_model("gpt-4o").is_none());
    }
}
