//! Registry of configured annotation providers.
//!
//! A run resolves its provider once, by name, at start; the resolved
//! `Arc<dyn Describer>` is then shared by every worker for the rest of the run.

use std::sync::Arc;

use cf_core::config::ProvidersConfig;
use cf_core::{Error, Result};

use crate::describe::Describer;
use crate::providers::{OllamaDescriber, OpenAiDescriber};

/// Providers in registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Describer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding every enabled provider from configuration.
    ///
    /// A provider that is enabled but cannot be constructed (for example
    /// OpenAI without an API key) is skipped with a warning.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();

        if config.ollama.enabled {
            match OllamaDescriber::new(&config.ollama) {
                Ok(p) => registry.register(Arc::new(p)),
                Err(e) => tracing::warn!("Ollama provider unavailable: {e}"),
            }
        }
        if config.openai.enabled {
            match OpenAiDescriber::new(&config.openai) {
                Ok(p) => registry.register(Arc::new(p)),
                Err(e) => tracing::warn!("OpenAI provider unavailable: {e}"),
            }
        }

        registry
    }

    /// Register a provider. A later provider with the same name replaces the
    /// earlier one.
    pub fn register(&mut self, provider: Arc<dyn Describer>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Describer>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// Look up `name`, failing with [`Error::NotFound`] if it is not
    /// registered.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Describer>> {
        self.get(name).ok_or_else(|| {
            Error::not_found(
                "provider",
                format!("{name} (available: {})", self.names().join(", ")),
            )
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
