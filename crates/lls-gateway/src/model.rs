//! The active model selection

use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A model file chosen for serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSelection {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ModelSelection {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    /// Select a model file on disk, reading its size from metadata.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        Ok(Self::new(path, metadata.len()))
    }

    /// Name reported in the `model` field of responses: the file name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Shared handle to the model currently served. Requests take one
/// [`snapshot`](Self::snapshot) up front, so a concurrent change never
/// affects a request already in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveModel(Arc<RwLock<Option<ModelSelection>>>);

impl ActiveModel {
    pub fn new(selection: Option<ModelSelection>) -> Self {
        Self(Arc::new(RwLock::new(selection)))
    }

    pub fn snapshot(&self) -> Option<ModelSelection> {
        self.0.read().clone()
    }

    pub fn set(&self, selection: ModelSelection) {
        tracing::info!(model = %selection.path.display(), size_bytes = selection.size_bytes, "active model set");
        *self.0.write() = Some(selection);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }
}
