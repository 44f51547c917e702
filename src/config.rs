//! Store configuration
//!
//! Loaded from `prd-store.yaml` next to the documents when present:
//! ```yaml
//! stale_after_secs: 600
//! document_pattern: '^prd(-[A-Za-z0-9_.-]+)?\.json$'
//! verification_gate: Typecheck passes
//! max_backups: 20
//! write_summary: true
//! ```

use crate::error::{Result, StoreError};
use crate::prd::validator::is_verification_gate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// File name looked up by [`StoreConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "prd-store.yaml";

pub const DEFAULT_DOCUMENT_PATTERN: &str = r"^prd(-[A-Za-z0-9_.-]+)?\.json$";
pub const DEFAULT_VERIFICATION_GATE: &str = "Typecheck passes";
pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Age after which a lock is presumed abandoned and may be reclaimed
    pub stale_after_secs: u64,
    /// Regex matched against file names during a collection scan
    pub document_pattern: String,
    /// Criterion appended by repair when a story lacks a verification gate
    pub verification_gate: String,
    /// Backups kept per document after a successful commit (None keeps all)
    pub max_backups: Option<usize>,
    /// Append an entry to the summary artifact when a story completes
    pub write_summary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            document_pattern: DEFAULT_DOCUMENT_PATTERN.to_string(),
            verification_gate: DEFAULT_VERIFICATION_GATE.to_string(),
            max_backups: None,
            write_summary: true,
        }
    }
}

impl StoreConfig {
    /// Load and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let config: StoreConfig = serde_yaml::from_str(&yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `prd-store.yaml` from `dir`, falling back to defaults when absent
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "Loading store config");
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_secs = stale_after.as_secs();
        self
    }

    pub fn with_document_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.document_pattern = pattern.into();
        self
    }

    pub fn with_max_backups(mut self, keep: usize) -> Self {
        self.max_backups = Some(keep);
        self
    }

    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.write_summary = enabled;
        self
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn document_regex(&self) -> Result<Regex> {
        Regex::new(&self.document_pattern).map_err(|e| {
            StoreError::Config(format!(
                "invalid document_pattern '{}': {}",
                self.document_pattern, e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.document_regex()?;

        // Repair appends this text; it has to satisfy the gate check itself
        // or a second repair pass would append it again.
        if !is_verification_gate(&self.verification_gate) {
            return Err(StoreError::Config(format!(
                "verification_gate '{}' is not recognised as a verification gate",
                self.verification_gate
            )));
        }

        if self.max_backups == Some(0) {
            return Err(StoreError::Config(
                "max_backups must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
