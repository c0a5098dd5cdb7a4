use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::FeatureExtractor;
use super::backends::{StubExtractor, ZernikeExtractor, ZernikeSettings};

/// Registry of feature extraction backends, selected by name from config.
///
/// Extractors take `&self`, so they are shared as plain `Arc`s.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn FeatureExtractor>>,
    default_name: Option<String>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
            default_name: None,
        }
    }

    /// Zernike (default) and stub backends.
    pub fn with_builtin(settings: ZernikeSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(ZernikeExtractor::new(settings)?);
        registry.register(StubExtractor::new());
        Ok(registry)
    }

    /// Register an extractor. The first registered extractor becomes the default.
    pub fn register<E: FeatureExtractor + 'static>(&mut self, extractor: E) {
        let name = extractor.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.extractors.insert(name, Arc::new(extractor));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.extractors.contains_key(name) {
            return Err(anyhow!("extractor '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FeatureExtractor>> {
        self.extractors.get(name).cloned()
    }

    pub fn default_extractor(&self) -> Option<Arc<dyn FeatureExtractor>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.extractors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a configured extractor and run its warm-up hook.
    pub fn select(&self, name: &str) -> Result<Arc<dyn FeatureExtractor>> {
        let extractor = self.get(name).ok_or_else(|| {
            anyhow!(
                "unknown extractor '{}' (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        extractor.warm_up()?;
        log::info!("using feature extractor '{}'", extractor.name());
        Ok(extractor)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
