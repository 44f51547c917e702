//! Error taxonomy for the document store

use crate::prd::validator::Violation;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Data-shape problems found by the validator, repair engine or graph
/// analyzer are returned as structured results, not as errors. Only a
/// document that repair could not fix becomes [`StoreError::Structural`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {} unresolved structural violation(s): {}", .violations.len(), summarize(.violations))]
    Structural {
        path: PathBuf,
        violations: Vec<Violation>,
    },

    #[error("{path} is locked by {holder}")]
    LockContention { path: PathBuf, holder: String },

    #[error("Failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Story {story_id} not found in {path}")]
    StoryNotFound { path: PathBuf, story_id: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::WriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Contention is expected under concurrent engines; callers usually retry later.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::LockContention { .. })
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} ({})", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, StoreError>;
