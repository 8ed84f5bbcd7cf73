use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use tether_models::Application;

#[derive(Debug, serde::Deserialize)]
struct ApplicationsFile {
    #[serde(default)]
    applications: Vec<ProjectApplication>,
}

#[derive(Debug, serde::Deserialize)]
struct ProjectApplication {
    project: String,
    #[serde(flatten)]
    application: Application,
}

/// Declared applications, keyed by project and application id.
#[derive(Debug, Clone, Default)]
pub struct ApplicationRegistry {
    inner: Arc<RwLock<HashMap<(String, String), Application>>>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let file: ApplicationsFile = toml::from_str(raw).context("parse applications toml")?;
        let registry = Self::new();
        for entry in file.applications {
            registry.insert(&entry.project, entry.application);
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read applications file {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn insert(&self, project: &str, application: Application) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((project.to_string(), application.id.clone()), application);
    }

    pub fn get(&self, project: &str, application: &str) -> Option<Application> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(project.to_string(), application.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
