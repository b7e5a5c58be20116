use std::collections::BTreeMap;
use std::sync::Arc;

use super::anthropic::Anthropic;
use super::elevenlabs::ElevenLabs;
use super::gemini::Gemini;
use super::sagemaker::SageMaker;
use super::vertex::Vertex;
use super::watsonx::Watsonx;
use super::{OpenAICompatible, ProviderAdapter, ProviderProfile};

const DEFAULT_PROVIDER: &str = "openai";

const ALIASES: &[(&str, &str)] = &[
    ("google", "gemini"),
    ("vertex", "vertex_ai"),
    ("vertex_ai_beta", "vertex_ai"),
    ("sagemaker_chat", "sagemaker"),
    ("together", "together_ai"),
    ("fireworks", "fireworks_ai"),
    ("vllm", "hosted_vllm"),
    ("ollama", "ollama_chat"),
];

/// Adapters by provider name. Built once at startup and shared read-only.
#[derive(Clone)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Every built-in dialect. `http` is used for token exchanges only.
    pub fn new(http: reqwest::Client) -> Self {
        let mut registry = Self::empty();
        for profile in ProviderProfile::builtins() {
            registry.register_profile(profile);
        }
        registry.register(Arc::new(Anthropic::default()));
        registry.register(Arc::new(Gemini::default()));
        registry.register(Arc::new(Vertex::new(http.clone())));
        registry.register(Arc::new(SageMaker::default()));
        registry.register(Arc::new(Watsonx::new(http)));
        registry.register(Arc::new(ElevenLabs));
        registry
    }

    /// Registers (or replaces) an adapter under its provider name.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider().to_string(), adapter);
    }

    pub fn register_profile(&mut self, profile: ProviderProfile) {
        self.register(Arc::new(OpenAICompatible::new(profile)));
    }

    pub fn with_profiles(mut self, profiles: impl IntoIterator<Item = ProviderProfile>) -> Self {
        for profile in profiles {
            tracing::info!(provider = %profile.name, "registered configurable provider");
            self.register_profile(profile);
        }
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let provider = provider.trim().to_ascii_lowercase();
        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| *alias == provider)
            .map(|(_, name)| *name)
            .unwrap_or(provider.as_str());
        self.adapters.get(canonical).cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.get(provider).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

/// Splits `provider/model`. Without a prefix, or when the prefix is not a known
/// provider, the whole string is the model and the provider is `openai`.
pub fn split_model<'a>(registry: &ProviderRegistry, model: &'a str) -> (String, &'a str) {
    if let Some((provider, rest)) = model.split_once('/') {
        if !rest.is_empty() && registry.contains(provider) {
            return (provider.to_ascii_lowercase(), rest);
        }
    }
    (DEFAULT_PROVIDER.to_string(), model)
}
