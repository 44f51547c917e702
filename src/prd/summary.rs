//! Progress log kept next to each document
//!
//! One markdown entry per completed story. The file is rewritten through the
//! atomic writer, so a crash mid-append leaves the previous log intact.

use super::types::{Phase, Story};
use crate::error::{Result, StoreError};
use crate::store::writer;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub completed_at: DateTime<Utc>,
    pub story_id: String,
    pub title: String,
    /// Phase run (None for a phase-less story) and the executor's message
    pub phases: Vec<(Option<Phase>, String)>,
}

impl SummaryEntry {
    pub fn new(story: &Story, phases: Vec<(Option<Phase>, String)>) -> Self {
        Self {
            completed_at: Utc::now(),
            story_id: story.id.clone(),
            title: story.title.clone(),
            phases,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "## {} - {}",
            self.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.story_id
        );
        if !self.title.is_empty() {
            out.push_str(&format!(": {}", self.title));
        }
        out.push_str("\n\n");

        for (phase, message) in &self.phases {
            let label = match phase {
                Some(phase) => phase.to_string(),
                None => "story".to_string(),
            };
            let message = message.trim();
            if message.is_empty() {
                out.push_str(&format!("- {}\n", label));
            } else {
                out.push_str(&format!("- {}: {}\n", label, message.replace('\n', " ")));
            }
        }
        out.push_str("\n---\n");
        out
    }
}

/// Resolve a document's `summaryPath` against its directory
///
/// None for an absolute path or one that climbs out with `..`.
pub fn resolve(doc_path: &Path, summary_path: &str) -> Option<PathBuf> {
    let summary = Path::new(summary_path);
    let contained = summary.file_name().is_some()
        && summary
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return None;
    }
    Some(
        doc_path
            .parent()
            .map(|dir| dir.join(summary))
            .unwrap_or_else(|| summary.to_path_buf()),
    )
}

/// Append `entry` to the summary file, creating it when missing
///
/// Callers hold the document lock.
pub fn append_entry(path: &Path, entry: &SummaryEntry) -> Result<()> {
    let mut content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(&entry.render());
    writer::replace(path, content.as_bytes())?;
    Ok(())
}
