use std::collections::HashMap;

use crate::config::{DetectorKind, DetectorSettings};
use crate::error::StartupError;

use super::backend::DetectorBackend;
use super::backends::{HttpBackend, HttpConfig, StubBackend};

/// Constructed detector backends, keyed by name.
///
/// The composition root builds the registry once, then hands the default
/// backend to the processor. Nothing in the crate initialises a detector
/// implicitly.
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn DetectorBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Builds the backend selected in `settings` and makes it the default.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self, StartupError> {
        let mut registry = Self::new();
        match settings.kind {
            DetectorKind::Stub => {
                registry.register(StubBackend::repeating(
                    settings.target_label.as_str(),
                    settings.stub_detections,
                ));
            }
            DetectorKind::Http => {
                let config = HttpConfig::from_settings(settings)?;
                let backend = HttpBackend::new(config).map_err(|e| StartupError::Detector {
                    backend: "http".to_string(),
                    reason: e.to_string(),
                })?;
                registry.register(backend);
            }
            DetectorKind::Tract => {
                #[cfg(feature = "backend-tract")]
                {
                    let model_path = settings.model_path.as_ref().ok_or_else(|| {
                        StartupError::Config("detector.model_path is required for tract".into())
                    })?;
                    let backend = super::backends::TractBackend::new(
                        model_path,
                        settings.input_size,
                        settings.labels.clone(),
                    )
                    .map_err(|e| StartupError::Detector {
                        backend: "tract".to_string(),
                        reason: format!("{:#}", e),
                    })?
                    .with_threshold(settings.confidence_threshold);
                    registry.register(backend);
                }
                #[cfg(not(feature = "backend-tract"))]
                {
                    return Err(StartupError::Detector {
                        backend: "tract".to_string(),
                        reason: "local weights require the backend-tract feature".to_string(),
                    });
                }
            }
        }
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Box::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<(), StartupError> {
        if !self.backends.contains_key(name) {
            return Err(StartupError::Detector {
                backend: name.to_string(),
                reason: "not registered".to_string(),
            });
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove and return the default backend, warmed up.
    pub fn take_default(mut self) -> Result<Box<dyn DetectorBackend>, StartupError> {
        let name = self
            .default_name
            .clone()
            .ok_or_else(|| StartupError::Config("no detector backend registered".into()))?;
        let mut backend = self
            .backends
            .remove(&name)
            .ok_or_else(|| StartupError::Config(format!("backend '{}' missing", name)))?;
        backend.warm_up().map_err(|e| StartupError::Detector {
            backend: name.clone(),
            reason: e.to_string(),
        })?;
        log::info!("detector backend '{}' ready", name);
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
