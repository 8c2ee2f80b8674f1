//! Registry error types. Business rejections and persistence failures are
//! kept apart so callers can tell "the operation was refused" from "the
//! operation happened but may not survive a restart".

use std::path::PathBuf;

/// Failure to read or write a state/export file.
#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error("I/O error on '{}': {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize registry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse '{}': {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Instance '{instance}' not found in group '{group}'")]
    InstanceNotFound { group: String, instance: String },

    #[error("Instance '{instance}' already exists in group '{group}'")]
    DuplicateInstance { group: String, instance: String },

    #[error("Group '{group}' still has {running} running instance(s)")]
    GroupHasRunningInstances { group: String, running: usize },

    #[error("registry lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Persist(#[from] PersistError),
}
