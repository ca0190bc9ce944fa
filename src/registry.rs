/*!
 * Typed model registry
 */

use crate::config::ModelConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which executor serves a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The remote AI service behind the retrying client
    #[default]
    Remote,
    /// An in-process executor registered by the embedding application
    Local,
    /// The degraded-response executor
    Fallback,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Remote => write!(f, "remote"),
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub provider: ProviderKind,
    pub max_tokens: Option<u64>,
}

impl ModelSpec {
    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: ProviderKind::Remote,
            max_tokens: None,
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Whether a request estimating `tokens` fits this model
    pub fn admits(&self, tokens: u64) -> bool {
        self.max_tokens.is_none_or(|max| tokens <= max)
    }
}

impl From<&ModelConfig> for ModelSpec {
    fn from(config: &ModelConfig) -> Self {
        Self {
            id: config.id.clone(),
            provider: config.provider,
            max_tokens: config.max_tokens,
        }
    }
}

#[derive(Debug, Default)]
struct Models {
    by_id: BTreeMap<String, ModelSpec>,
    default: Option<String>,
}

/// Concurrent model table
///
/// An empty registry accepts any model id and routes it to the remote
/// provider.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    inner: RwLock<Models>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(models: &[ModelConfig]) -> Self {
        let registry = Self::new();
        for model in models {
            registry.register(ModelSpec::from(model), model.default);
        }
        registry
    }

    /// Add or replace a model; returns the previous spec for the id
    pub fn register(&self, spec: ModelSpec, make_default: bool) -> Option<ModelSpec> {
        let mut inner = self.inner.write();
        if make_default || inner.default.is_none() {
            inner.default = Some(spec.id.clone());
        }
        inner.by_id.insert(spec.id.clone(), spec)
    }

    pub fn remove(&self, id: &str) -> Option<ModelSpec> {
        let mut inner = self.inner.write();
        let removed = inner.by_id.remove(id);
        if inner.default.as_deref() == Some(id) {
            inner.default = inner.by_id.keys().next().cloned();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<ModelSpec> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn default_model(&self) -> Option<ModelSpec> {
        let inner = self.inner.read();
        inner
            .default
            .as_ref()
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Returns false if `id` is not registered
    pub fn set_default(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.by_id.contains_key(id) {
            return false;
        }
        inner.default = Some(id.to_string());
        true
    }

    /// Spec for `requested`, or the default model when `None`
    pub fn resolve(&self, requested: Option<&str>) -> Option<ModelSpec> {
        if self.is_empty() {
            return Some(ModelSpec::remote(requested.unwrap_or("default")));
        }
        match requested {
            Some(id) => self.get(id),
            None => self.default_model(),
        }
    }

    /// Registered specs ordered by id
    pub fn list(&self) -> Vec<ModelSpec> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_routes_everything_remote() {
        let registry = ModelRegistry::new();
        let spec = registry.resolve(Some("anything")).unwrap();
        assert_eq!(spec.id, "anything");
        assert_eq!(spec.provider, ProviderKind::Remote);
        assert_eq!(registry.resolve(None).unwrap().id, "default");
    }

    #[test]
    fn test_first_registered_is_default_until_overridden() {
        let registry = ModelRegistry::new();
        registry.register(ModelSpec::remote("a"), false);
        registry.register(ModelSpec::remote("b"), false);
        assert_eq!(registry.resolve(None).unwrap().id, "a");

        registry.register(ModelSpec::remote("c"), true);
        assert_eq!(registry.resolve(None).unwrap().id, "c");

        assert!(registry.set_default("b"));
        assert!(!registry.set_default("missing"));
        assert_eq!(registry.default_model().unwrap().id, "b");
    }

    #[test]
    fn test_unknown_model_is_not_resolved() {
        let registry = ModelRegistry::new();
        registry.register(ModelSpec::remote("a"), false);
        assert!(registry.resolve(Some("zzz")).is_none());
    }

    #[test]
    fn test_remove_default_picks_another() {
        let registry = ModelRegistry::new();
        registry.register(ModelSpec::remote("a"), true);
        registry.register(ModelSpec::remote("b"), false);
        assert_eq!(registry.remove("a").unwrap().id, "a");
        assert_eq!(registry.default_model().unwrap().id, "b");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_from_config() {
        let models = vec![
            ModelConfig {
                id: "small".into(),
                provider: ProviderKind::Remote,
                default: false,
                max_tokens: Some(100),
            },
            ModelConfig {
                id: "canned".into(),
                provider: ProviderKind::Fallback,
                default: true,
                max_tokens: None,
            },
        ];
        let registry = ModelRegistry::from_config(&models);
        assert_eq!(registry.default_model().unwrap().provider, ProviderKind::Fallback);

        let small = registry.get("small").unwrap();
        assert!(small.admits(100));
        assert!(!small.admits(101));
        assert_eq!(
            registry.list().iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["canned", "small"]
        );
    }
}
