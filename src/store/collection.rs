//! Directory scan for requirement documents

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::prd::graph::DocumentNode;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A document file that parsed as JSON
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub path: PathBuf,
    pub raw: Value,
}

impl CollectionEntry {
    /// Declared name, falling back to the file name
    pub fn name(&self) -> String {
        self.raw
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }
}

/// A matching file the scan could not use
#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub dir: PathBuf,
    /// Sorted by path
    pub entries: Vec<CollectionEntry>,
    pub skipped: Vec<SkippedDocument>,
}

impl Collection {
    /// Read every file in `dir` whose name matches `config.document_pattern`
    ///
    /// Files that fail to read or parse are recorded in `skipped`; they never
    /// abort the scan.
    pub fn scan(dir: &Path, config: &StoreConfig) -> Result<Self> {
        let pattern = config.document_regex()?;
        let listing = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut paths = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            if is_file && pattern.is_match(&name.to_string_lossy()) {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut collection = Collection {
            dir: dir.to_path_buf(),
            ..Default::default()
        };
        for path in paths {
            match read_json(&path) {
                Ok(raw) => collection.entries.push(CollectionEntry { path, raw }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable document");
                    collection.skipped.push(SkippedDocument {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(
            dir = %dir.display(),
            documents = collection.entries.len(),
            skipped = collection.skipped.len(),
            "Scanned collection"
        );
        Ok(collection)
    }

    /// Graph nodes for the dependency analyzer
    pub fn nodes(&self) -> Vec<DocumentNode> {
        self.entries.iter().map(DocumentNode::from_entry).collect()
    }
}

/// Read and parse one document file
pub(crate) fn read_json(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
