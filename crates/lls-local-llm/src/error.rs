//! Backend error types

use crate::binaries::BackendTag;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures raised while selecting, launching or supervising a backend binary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// No installed binary carries any of the tags the selector tried.
    #[error("no compatible binary installed (tried: {})", join_tags(.tried))]
    NoCompatibleBinary { tried: Vec<BackendTag> },

    /// The binary could not be spawned (missing, not executable, ...).
    #[error("failed to launch '{}': {source}", .binary.display())]
    LaunchFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backend wrote nothing within the liveness window.
    #[error("backend produced no output for {0:?}")]
    Timeout(Duration),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

fn join_tags(tags: &[BackendTag]) -> String {
    tags.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
