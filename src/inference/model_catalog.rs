//! Catalog of model files available on this device.
//!
//! Maps model ids to GGUF files and checks that a file is still readable
//! before a session is asked to load it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown model id: {0}")]
    UnknownModel(u64),

    #[error("Model file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A model file known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub file_size: u64,
}

#[derive(Debug, Default)]
pub struct ModelCatalog {
    entries: BTreeMap<u64, ModelEntry>,
    next_id: u64,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Build a catalog from every `*.gguf` file in `dir`, in file-name order.
    pub fn scan(dir: &Path) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        if !dir.exists() {
            warn!(dir = %dir.display(), "Models directory does not exist");
            return Ok(catalog);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "gguf"))
            .collect();
        files.sort();

        for path in files {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("model")
                .to_string();
            catalog.register(name, path)?;
        }

        info!(dir = %dir.display(), models = catalog.len(), "Scanned models directory");
        Ok(catalog)
    }

    /// Add a model file and return its id.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<u64, CatalogError> {
        let path = path.into();
        if !path.is_file() {
            return Err(CatalogError::FileNotFound(path));
        }
        let file_size = std::fs::metadata(&path)?.len();

        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.entries.insert(
            id,
            ModelEntry {
                id,
                name: name.into(),
                path,
                file_size,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&ModelEntry> {
        self.entries.get(&id)
    }

    /// Path of model `id`, provided its file is still there.
    pub fn resolve(&self, id: u64) -> Result<PathBuf, CatalogError> {
        let entry = self.get(id).ok_or(CatalogError::UnknownModel(id))?;
        if !entry.path.is_file() {
            return Err(CatalogError::FileNotFound(entry.path.clone()));
        }
        Ok(entry.path.clone())
    }

    /// Drop entries whose file no longer exists. Returns the removed ids.
    pub fn prune_missing(&mut self) -> Vec<u64> {
        let missing: Vec<u64> = self
            .entries
            .values()
            .filter(|e| !e.path.exists())
            .map(|e| e.id)
            .collect();
        for id in &missing {
            if let Some(entry) = self.entries.remove(id) {
                warn!(id, path = %entry.path.display(), "Pruned missing model");
            }
        }
        missing
    }

    /// Remove model `id`, optionally deleting its file.
    pub fn remove(&mut self, id: u64, delete_file: bool) -> Result<ModelEntry, CatalogError> {
        let entry = self.entries.remove(&id).ok_or(CatalogError::UnknownModel(id))?;
        if delete_file && entry.path.exists() {
            std::fs::remove_file(&entry.path)?;
            info!(id, path = %entry.path.display(), "Deleted model file");
        }
        Ok(entry)
    }

    pub fn list(&self) -> Vec<ModelEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
