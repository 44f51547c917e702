//! Story progression
//!
//! Picks the next pending story across a collection of documents and drives
//! it through its phases. The document lock is held from the first read to
//! the final commit, and `passes` is only written after every phase reports
//! success.

use super::executor::{PhaseExecutor, PhaseRequest};
use super::graph;
use super::repair::{repair, Change, RepairOptions};
use super::summary::{self, SummaryEntry};
use super::types::{Document, DocumentSummary, Phase, Story, StoryState};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::store::collection::{read_json, Collection};
use crate::store::lock::{self, LockGuard};
use crate::store::writer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The story `next_story` would run
#[derive(Debug, Clone)]
pub struct Selection {
    pub document_path: PathBuf,
    pub document_name: String,
    pub story: Story,
    /// Cycle, dangling-reference and skipped-document warnings from the scan
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub document_path: PathBuf,
    pub story_id: String,
    pub phases: Vec<Option<Phase>>,
    pub messages: Vec<String>,
    /// Backup of the document as it was before `passes` was set
    pub backup_path: Option<PathBuf>,
    /// Repairs persisted before the story ran
    pub repairs: Vec<Change>,
    pub reclaimed_lock: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub document_path: PathBuf,
    pub story_id: String,
    pub phase: Option<Phase>,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum IterationOutcome {
    /// Nothing left to run
    Idle,
    Completed(CompletionRecord),
    /// The story already had `passes: true` when the lock was taken
    AlreadyCompleted { document_path: PathBuf, story_id: String },
    /// The story stays pending; nothing is retried automatically
    Failed(FailureRecord),
}

impl IterationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, IterationOutcome::Completed(_))
    }
}

/// Drives stories to completion across a collection of documents
pub struct ProgressionEngine {
    config: StoreConfig,
    executor: Arc<dyn PhaseExecutor>,
    /// Stories currently running in this process
    running: Mutex<HashSet<(PathBuf, String)>>,
    failures: Mutex<Vec<FailureRecord>>,
}

/// Clears the in-progress mark however the run ends
struct RunMark<'a> {
    running: &'a Mutex<HashSet<(PathBuf, String)>>,
    key: (PathBuf, String),
}

impl Drop for RunMark<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
    }
}

impl ProgressionEngine {
    pub fn new(config: StoreConfig, executor: Arc<dyn PhaseExecutor>) -> Self {
        Self {
            config,
            executor,
            running: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn repair_options(&self) -> RepairOptions {
        RepairOptions::from_config(&self.config)
    }

    fn is_running(&self, doc_path: &Path, story_id: &str) -> bool {
        self.running
            .lock()
            .contains(&(doc_path.to_path_buf(), story_id.to_string()))
    }

    /// Documents that repair cleanly, ordered by (name, path)
    fn load_documents(&self, collection: &Collection, warnings: &mut Vec<String>) -> Vec<(PathBuf, Document)> {
        let options = self.repair_options().dry_run();
        let mut documents = Vec::new();

        for entry in &collection.entries {
            let report = repair(&entry.raw, &options);
            if !report.success {
                let violations = report
                    .unresolved
                    .iter()
                    .map(|v| v.field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                warn!(path = %entry.path.display(), %violations, "Skipping document with unresolved violations");
                warnings.push(format!(
                    "Skipped {}: unresolved violations at {}",
                    entry.path.display(),
                    violations
                ));
                continue;
            }
            match Document::from_value(report.repaired) {
                Ok(document) => documents.push((entry.path.clone(), document)),
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "Skipping undecodable document");
                    warnings.push(format!("Skipped {}: {}", entry.path.display(), e));
                }
            }
        }

        documents.sort_by(|(pa, a), (pb, b)| a.name.cmp(&b.name).then_with(|| pa.cmp(pb)));
        documents
    }

    /// The story `run_next` would run, without running it
    ///
    /// Takes the first document by (name, path) with a pending story, then
    /// that document's lowest-priority pending story. Stories already running
    /// in this process are passed over.
    pub fn next_story(&self, dir: &Path) -> Result<Option<Selection>> {
        let collection = Collection::scan(dir, &self.config)?;

        let mut warnings: Vec<String> = collection
            .skipped
            .iter()
            .map(|s| format!("Skipped {}: {}", s.path.display(), s.reason))
            .collect();
        warnings.extend(graph::analyze(&collection.nodes()).warnings);

        let documents = self.load_documents(&collection, &mut warnings);

        for (path, document) in documents {
            let next = document
                .user_stories
                .iter()
                .filter(|s| !s.passes && !self.is_running(&path, &s.id))
                .fold(None, |best: Option<&Story>, story| match best {
                    Some(b) if b.priority <= story.priority => Some(b),
                    _ => Some(story),
                });

            if let Some(story) = next {
                debug!(
                    path = %path.display(),
                    story_id = %story.id,
                    priority = story.priority,
                    "Selected next story"
                );
                return Ok(Some(Selection {
                    document_name: document.name.clone(),
                    story: story.clone(),
                    document_path: path,
                    warnings,
                }));
            }
        }

        Ok(None)
    }

    /// Read, repair and persist repairs while holding the lock
    fn load_locked(&self, guard: &LockGuard, doc_path: &Path) -> Result<(Value, Vec<Change>)> {
        let raw = read_json(doc_path)?;
        let report = repair(&raw, &self.repair_options());
        if !report.success {
            return Err(StoreError::Structural {
                path: doc_path.to_path_buf(),
                violations: report.unresolved,
            });
        }

        if report.changed() {
            guard.ensure_held()?;
            let outcome = writer::commit(doc_path, &encode(doc_path, &report.repaired)?)?;
            info!(
                path = %doc_path.display(),
                changes = report.change_log.len(),
                backup = ?outcome.backup_path,
                "Persisted document repairs"
            );
            self.prune(doc_path);
        }
        Ok((report.repaired, report.change_log))
    }

    fn prune(&self, doc_path: &Path) {
        if let Some(keep) = self.config.max_backups {
            if let Err(e) = writer::prune_backups(doc_path, keep) {
                warn!(path = %doc_path.display(), error = %e, "Failed to prune backups");
            }
        }
    }

    fn record_failure(&self, doc_path: &Path, story_id: &str, phase: Option<Phase>, message: String) -> IterationOutcome {
        warn!(
            path = %doc_path.display(),
            story_id,
            phase = ?phase.map(Phase::number),
            %message,
            "Story failed"
        );
        let record = FailureRecord {
            document_path: doc_path.to_path_buf(),
            story_id: story_id.to_string(),
            phase,
            message,
            failed_at: Utc::now(),
        };
        self.failures.lock().push(record.clone());
        IterationOutcome::Failed(record)
    }

    /// Run one story through all of its phases
    ///
    /// Fails with [`StoreError::LockContention`] when another owner holds the
    /// document, and with [`StoreError::Structural`] when repair cannot fix
    /// it. An executor failure is not an error: it comes back as
    /// [`IterationOutcome::Failed`] and the story stays pending.
    pub async fn run_story(&self, doc_path: &Path, story_id: &str, owner: &str) -> Result<IterationOutcome> {
        let guard = LockGuard::acquire(doc_path, owner, self.config.stale_after())?;
        let reclaimed_lock = guard.acquisition().warning().map(str::to_string);

        let key = (doc_path.to_path_buf(), story_id.to_string());
        if !self.running.lock().insert(key.clone()) {
            return Err(StoreError::LockContention {
                path: doc_path.to_path_buf(),
                holder: format!("{} (story {} already running)", owner, story_id),
            });
        }
        let _mark = RunMark {
            running: &self.running,
            key,
        };

        let outcome = self
            .run_locked(&guard, doc_path, story_id, reclaimed_lock)
            .await;

        if let Err(e) = guard.release() {
            warn!(path = %doc_path.display(), error = %e, "Failed to release lock");
        }
        outcome
    }

    async fn run_locked(
        &self,
        guard: &LockGuard,
        doc_path: &Path,
        story_id: &str,
        reclaimed_lock: Option<String>,
    ) -> Result<IterationOutcome> {
        let (raw, repairs) = self.load_locked(guard, doc_path)?;
        let document = Document::from_value(raw).map_err(|e| StoreError::Parse {
            path: doc_path.to_path_buf(),
            source: e,
        })?;
        let story = document
            .story(story_id)
            .cloned()
            .ok_or_else(|| StoreError::StoryNotFound {
                path: doc_path.to_path_buf(),
                story_id: story_id.to_string(),
            })?;

        if story.passes {
            debug!(path = %doc_path.display(), story_id, "Story already completed");
            return Ok(IterationOutcome::AlreadyCompleted {
                document_path: doc_path.to_path_buf(),
                story_id: story_id.to_string(),
            });
        }

        let phases: Vec<Option<Phase>> = if story.phases.is_empty() {
            vec![None]
        } else {
            story.phases.iter().copied().map(Some).collect()
        };

        let mut messages = Vec::with_capacity(phases.len());
        for phase in &phases {
            let request = PhaseRequest {
                document_path: doc_path.to_path_buf(),
                document_name: document.name.clone(),
                capabilities: phase.map(|p| story.capabilities_for(p)).unwrap_or_default(),
                story: story.clone(),
                phase: *phase,
            };

            debug!(path = %doc_path.display(), story_id, phase = ?phase.map(Phase::number), "Running phase");
            match self.executor.run_phase(&request).await {
                Ok(outcome) if outcome.success => messages.push(outcome.message),
                Ok(outcome) => return Ok(self.record_failure(doc_path, story_id, *phase, outcome.message)),
                Err(e) => {
                    return Ok(self.record_failure(doc_path, story_id, *phase, format!("executor error: {:#}", e)))
                }
            }
        }

        // The executor may have edited the document; start from disk again
        let (mut raw, mut later_repairs) = self.load_locked(guard, doc_path)?;
        if !mark_passed(&mut raw, story_id) {
            return Err(StoreError::StoryNotFound {
                path: doc_path.to_path_buf(),
                story_id: story_id.to_string(),
            });
        }
        let bytes = encode(doc_path, &raw)?;
        guard.ensure_held()?;
        let committed = writer::commit(doc_path, &bytes)?;
        self.prune(doc_path);

        info!(path = %doc_path.display(), story_id, phases = phases.len(), "Story completed");

        if self.config.write_summary {
            let entry = SummaryEntry::new(&story, phases.iter().copied().zip(messages.iter().cloned()).collect());
            self.append_summary(guard, doc_path, &document.summary_path, &entry);
        }

        let mut all_repairs = repairs;
        all_repairs.append(&mut later_repairs);
        Ok(IterationOutcome::Completed(CompletionRecord {
            document_path: doc_path.to_path_buf(),
            story_id: story_id.to_string(),
            phases,
            messages,
            backup_path: committed.backup_path,
            repairs: all_repairs,
            reclaimed_lock,
            completed_at: Utc::now(),
        }))
    }

    /// Best effort: the story is already committed as passed
    fn append_summary(&self, guard: &LockGuard, doc_path: &Path, summary_path: &str, entry: &SummaryEntry) {
        let Some(target) = summary::resolve(doc_path, summary_path) else {
            warn!(path = %doc_path.display(), summary_path, "Summary path leaves the document directory; not writing");
            return;
        };
        if target == doc_path || target == lock::lock_path(doc_path) {
            warn!(path = %doc_path.display(), summary_path, "Summary path names the document or its lock; not writing");
            return;
        }
        if let Err(e) = guard.ensure_held().and_then(|_| summary::append_entry(&target, entry)) {
            warn!(path = %target.display(), error = %e, "Failed to append summary entry");
        }
    }

    /// Select and run the next pending story; `Idle` when none is left
    pub async fn run_next(&self, dir: &Path, owner: &str) -> Result<IterationOutcome> {
        match self.next_story(dir)? {
            Some(selection) => {
                self.run_story(&selection.document_path, &selection.story.id, owner)
                    .await
            }
            None => Ok(IterationOutcome::Idle),
        }
    }

    /// Per-document progress, ordered by (name, path)
    pub fn summarize(&self, dir: &Path) -> Result<Vec<DocumentSummary>> {
        let collection = Collection::scan(dir, &self.config)?;
        let mut warnings = Vec::new();
        Ok(self
            .load_documents(&collection, &mut warnings)
            .iter()
            .map(|(path, document)| DocumentSummary::from_document(path, document))
            .collect())
    }

    /// In-process state first, then `passes` on disk
    pub fn story_state(&self, doc_path: &Path, story_id: &str) -> Result<StoryState> {
        if self.is_running(doc_path, story_id) {
            return Ok(StoryState::InProgress);
        }

        let raw = read_json(doc_path)?;
        let report = repair(&raw, &self.repair_options().dry_run());
        let document = Document::from_value(report.repaired).map_err(|e| StoreError::Parse {
            path: doc_path.to_path_buf(),
            source: e,
        })?;
        document
            .story(story_id)
            .map(Story::state)
            .ok_or_else(|| StoreError::StoryNotFound {
                path: doc_path.to_path_buf(),
                story_id: story_id.to_string(),
            })
    }

    /// Failures recorded by this engine, oldest first
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().clone()
    }
}

fn encode(path: &Path, value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Encode {
        path: path.to_path_buf(),
        source: e,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Set `passes` on the story, and bring a `status` text along when present
fn mark_passed(raw: &mut Value, story_id: &str) -> bool {
    let Some(stories) = raw.get_mut("userStories").and_then(Value::as_array_mut) else {
        return false;
    };
    let Some(story) = stories
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|s| s.get("id").and_then(Value::as_str) == Some(story_id))
    else {
        return false;
    };

    story.insert("passes".to_string(), Value::Bool(true));
    if story.contains_key("status") {
        story.insert("status".to_string(), Value::String("completed".to_string()));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::executor::PhaseOutcome;
    use crate::store::writer::list_backups;
    use std::time::Duration;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;

    #[derive(Default)]
    struct MockExecutor {
        calls: Mutex<Vec<(String, Option<Phase>, Vec<String>)>>,
        fail_story: Option<String>,
        error: bool,
    }

    impl MockExecutor {
        fn failing(story_id: &str) -> Self {
            Self {
                fail_story: Some(story_id.to_string()),
                ..Default::default()
            }
        }

        fn broken() -> Self {
            Self {
                error: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(String, Option<Phase>, Vec<String>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PhaseExecutor for MockExecutor {
        async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutcome> {
            self.calls.lock().push((
                request.story.id.clone(),
                request.phase,
                request.capabilities.clone(),
            ));
            if self.error {
                anyhow::bail!("agent crashed");
            }
            if self.fail_story.as_deref() == Some(request.story.id.as_str()) {
                return Ok(PhaseOutcome::failure("tests failed"));
            }
            Ok(PhaseOutcome::success(format!("ran {}", request.story.id)))
        }
    }

    /// Loses the lock to another engine in the middle of a phase
    struct LockStealer {
        rewrite: Option<Value>,
    }

    #[async_trait]
    impl PhaseExecutor for LockStealer {
        async fn run_phase(&self, request: &PhaseRequest) -> anyhow::Result<PhaseOutcome> {
            let doc = &request.document_path;
            fs::remove_file(lock::lock_path(doc))?;
            let taken = lock::acquire(doc, "other-engine", Duration::from_secs(600))?;
            anyhow::ensure!(taken.acquired, "lock was not taken over");
            if let Some(value) = &self.rewrite {
                fs::write(doc, serde_json::to_vec_pretty(value)?)?;
            }
            Ok(PhaseOutcome::success("done"))
        }
    }

    fn story(id: &str, priority: u32, phases: Value) -> Value {
        json!({
            "id": id,
            "title": format!("Story {}", id),
            "description": "",
            "acceptanceCriteria": ["Typecheck passes"],
            "phases": phases,
            "capabilities": {},
            "priority": priority,
            "passes": false,
            "notes": ""
        })
    }

    fn document(name: &str, stories: Vec<Value>) -> Value {
        json!({
            "name": name,
            "relatedDocuments": [],
            "summaryPath": format!("{}.summary.md", name),
            "userStories": stories
        })
    }

    fn write_doc(dir: &Path, file: &str, value: &Value) -> PathBuf {
        let path = dir.join(file);
        fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
        path
    }

    fn read_doc(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    fn engine(executor: Arc<dyn PhaseExecutor>) -> ProgressionEngine {
        ProgressionEngine::new(StoreConfig::default(), executor)
    }

    #[tokio::test]
    async fn test_runs_stories_in_priority_order_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(
            dir.path(),
            "prd.json",
            &document("auth", vec![story("S1", 1, json!([1, 5])), story("S2", 2, json!([6]))]),
        );
        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());

        let selection = engine.next_story(dir.path()).unwrap().unwrap();
        assert_eq!(selection.story.id, "S1");
        assert_eq!(selection.document_name, "auth");

        assert!(engine.run_next(dir.path(), "worker").await.unwrap().is_completed());
        assert_eq!(engine.next_story(dir.path()).unwrap().unwrap().story.id, "S2");
        assert!(engine.run_next(dir.path(), "worker").await.unwrap().is_completed());
        assert!(matches!(
            engine.run_next(dir.path(), "worker").await.unwrap(),
            IterationOutcome::Idle
        ));

        let calls: Vec<_> = executor.calls().into_iter().map(|(id, p, _)| (id, p)).collect();
        assert_eq!(
            calls,
            vec![
                ("S1".to_string(), Some(Phase::Discovery)),
                ("S1".to_string(), Some(Phase::Implementation)),
                ("S2".to_string(), Some(Phase::Testing)),
            ]
        );
        let doc = read_doc(&path);
        assert_eq!(doc["userStories"][0]["passes"], true);
        assert_eq!(doc["userStories"][1]["passes"], true);
    }

    #[tokio::test]
    async fn test_completion_commits_backup_summary_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        let engine = engine(Arc::new(MockExecutor::default()));

        let outcome = engine.run_story(&path, "S1", "worker").await.unwrap();
        let IterationOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };

        let backup = record.backup_path.unwrap();
        assert_eq!(read_doc(&backup)["userStories"][0]["passes"], false);
        assert_eq!(read_doc(&path)["userStories"][0]["passes"], true);
        assert!(record.repairs.is_empty());
        assert_eq!(record.messages, vec!["ran S1".to_string()]);

        let summary = fs::read_to_string(dir.path().join("auth.summary.md")).unwrap();
        assert!(summary.contains("S1: Story S1"));
        assert!(summary.contains("ran S1"));

        assert!(!lock::is_locked(&path, engine.config().stale_after()));
        assert_eq!(engine.story_state(&path, "S1").unwrap(), StoryState::Completed);
    }

    #[tokio::test]
    async fn test_failed_phase_keeps_story_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(
            dir.path(),
            "prd.json",
            &document("auth", vec![story("S1", 1, json!([1, 5]))]),
        );
        let before = fs::read(&path).unwrap();
        let executor = Arc::new(MockExecutor::failing("S1"));
        let engine = engine(executor.clone());

        let outcome = engine.run_next(dir.path(), "worker").await.unwrap();
        let IterationOutcome::Failed(record) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(record.phase, Some(Phase::Discovery));
        assert_eq!(record.message, "tests failed");

        // Stops at the first failing phase and leaves the document alone
        assert_eq!(executor.calls().len(), 1);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(list_backups(&path).unwrap().is_empty());
        assert!(!dir.path().join("auth.summary.md").exists());

        assert_eq!(engine.failures(), vec![record]);
        assert_eq!(engine.story_state(&path, "S1").unwrap(), StoryState::Pending);
        assert!(!lock::is_locked(&path, engine.config().stale_after()));
        assert_eq!(engine.next_story(dir.path()).unwrap().unwrap().story.id, "S1");
    }

    #[tokio::test]
    async fn test_executor_error_is_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([]))]));
        let engine = engine(Arc::new(MockExecutor::broken()));

        let outcome = engine.run_story(&path, "S1", "worker").await.unwrap();
        let IterationOutcome::Failed(record) = outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(record.phase, None);
        assert!(record.message.contains("agent crashed"));
        assert_eq!(read_doc(&path)["userStories"][0]["passes"], false);
    }

    #[tokio::test]
    async fn test_phase_less_story_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([]))]));
        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());

        assert!(engine.run_story(&path, "S1", "worker").await.unwrap().is_completed());
        assert_eq!(executor.calls(), vec![("S1".to_string(), None, vec![])]);
    }

    #[tokio::test]
    async fn test_capabilities_follow_the_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut s1 = story("S1", 1, json!([1, 5]));
        s1["capabilities"] = json!({"5": ["backend-dev"]});
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![s1]));
        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());

        engine.run_story(&path, "S1", "worker").await.unwrap();
        let calls = executor.calls();
        assert!(calls[0].2.is_empty());
        assert_eq!(calls[1].2, vec!["backend-dev".to_string()]);
    }

    #[tokio::test]
    async fn test_locked_document_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        let stale_after = StoreConfig::default().stale_after();
        assert!(lock::acquire(&path, "other-worker", stale_after).unwrap().acquired);

        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());
        let err = engine.run_story(&path, "S1", "worker").await.unwrap_err();
        assert!(err.is_contention());
        assert!(executor.calls().is_empty());
        assert_eq!(lock::inspect(&path).unwrap().unwrap().owner, "other-worker");
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed_during_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        let stale = lock::LockInfo {
            owner: "crashed".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(lock::lock_path(&path), serde_json::to_vec(&stale).unwrap()).unwrap();

        let engine = engine(Arc::new(MockExecutor::default()));
        let outcome = engine.run_story(&path, "S1", "worker").await.unwrap();
        let IterationOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert!(record.reclaimed_lock.unwrap().contains("crashed"));
        assert!(!lock::lock_path(&path).exists());
    }

    #[tokio::test]
    async fn test_lock_taken_over_mid_run_blocks_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        let before = fs::read(&path).unwrap();
        let engine = engine(Arc::new(LockStealer { rewrite: None }));

        let err = engine.run_story(&path, "S1", "worker").await.unwrap_err();
        assert!(err.is_contention(), "{:?}", err);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(list_backups(&path).unwrap().is_empty());
        assert!(!dir.path().join("auth.summary.md").exists());
        assert_eq!(lock::inspect(&path).unwrap().unwrap().owner, "other-engine");
    }

    #[tokio::test]
    async fn test_lock_taken_over_mid_run_blocks_repair_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        // The new owner leaves the document in a shape repair would rewrite
        let rewritten = document("auth", vec![story("S1", 1, json!([1, 15]))]);
        let engine = engine(Arc::new(LockStealer {
            rewrite: Some(rewritten.clone()),
        }));

        let err = engine.run_story(&path, "S1", "worker").await.unwrap_err();
        assert!(err.is_contention(), "{:?}", err);
        assert_eq!(read_doc(&path), rewritten);
        assert!(list_backups(&path).unwrap().is_empty());
        assert_eq!(lock::inspect(&path).unwrap().unwrap().owner, "other-engine");
    }

    #[tokio::test]
    async fn test_summary_path_naming_the_document_is_repaired_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = document("prd", vec![story("S1", 1, json!([1]))]);
        doc["summaryPath"] = json!("prd.json");
        let path = write_doc(dir.path(), "prd.json", &doc);
        let engine = engine(Arc::new(MockExecutor::default()));

        assert!(engine.run_story(&path, "S1", "worker").await.unwrap().is_completed());
        let on_disk = read_doc(&path);
        assert_eq!(on_disk["summaryPath"], "prd.summary.md");
        assert_eq!(on_disk["userStories"][0]["passes"], true);
        let summary = fs::read_to_string(dir.path().join("prd.summary.md")).unwrap();
        assert!(summary.contains("S1: Story S1"));
    }

    #[tokio::test]
    async fn test_summary_is_not_written_over_the_document() {
        let dir = tempfile::tempdir().unwrap();
        // A document stored under its own summary file name
        let path = write_doc(
            dir.path(),
            "auth.summary.md",
            &document("auth", vec![story("S1", 1, json!([1]))]),
        );
        let engine = engine(Arc::new(MockExecutor::default()));

        assert!(engine.run_story(&path, "S1", "worker").await.unwrap().is_completed());
        assert_eq!(read_doc(&path)["userStories"][0]["passes"], true);
        assert!(!lock::lock_path(&path).exists());
    }

    #[tokio::test]
    async fn test_unrepairable_document_is_structural_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = document("", vec![story("S1", 1, json!([1]))]);
        broken.as_object_mut().unwrap().remove("name");
        let broken_path = write_doc(dir.path(), "prd-a.json", &broken);
        write_doc(dir.path(), "prd-b.json", &document("billing", vec![story("B1", 1, json!([1]))]));

        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());
        let err = engine.run_story(&broken_path, "S1", "worker").await.unwrap_err();
        assert!(matches!(err, StoreError::Structural { .. }));
        assert!(!lock::is_locked(&broken_path, engine.config().stale_after()));

        let selection = engine.next_story(dir.path()).unwrap().unwrap();
        assert_eq!(selection.story.id, "B1");
        assert!(selection.warnings.iter().any(|w| w.contains("prd-a.json")));
    }

    #[tokio::test]
    async fn test_repairs_are_persisted_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut s1 = story("S1", 1, json!([1, 15, 3, 1]));
        s1["acceptanceCriteria"] = json!(["Login works"]);
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![s1]));

        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());
        let outcome = engine.run_story(&path, "S1", "worker").await.unwrap();
        let IterationOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(record.repairs.len(), 3);

        let doc = read_doc(&path);
        assert_eq!(doc["userStories"][0]["phases"], json!([1, 3]));
        assert_eq!(
            doc["userStories"][0]["acceptanceCriteria"],
            json!(["Login works", "Typecheck passes"])
        );
        // One backup from the repair commit, one from the completion commit
        assert_eq!(list_backups(&path).unwrap().len(), 2);
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_story_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![story("S1", 1, json!([1]))]));
        let engine = engine(Arc::new(MockExecutor::default()));

        let err = engine.run_story(&path, "S9", "worker").await.unwrap_err();
        assert!(matches!(err, StoreError::StoryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_already_completed_story_is_not_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut s1 = story("S1", 1, json!([1]));
        s1["passes"] = json!(true);
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![s1]));
        let executor = Arc::new(MockExecutor::default());
        let engine = engine(executor.clone());

        let outcome = engine.run_story(&path, "S1", "worker").await.unwrap();
        assert!(matches!(outcome, IterationOutcome::AlreadyCompleted { .. }));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_status_text_follows_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut s1 = story("S1", 1, json!([1]));
        s1["status"] = json!("in progress");
        let path = write_doc(dir.path(), "prd.json", &document("auth", vec![s1, story("S2", 2, json!([1]))]));
        let engine = engine(Arc::new(MockExecutor::default()));

        engine.run_story(&path, "S1", "worker").await.unwrap();
        let doc = read_doc(&path);
        assert_eq!(doc["userStories"][0]["status"], "completed");
        assert!(doc["userStories"][1].get("status").is_none());
    }

    #[tokio::test]
    async fn test_documents_are_taken_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(dir.path(), "prd-1.json", &document("zeta", vec![story("Z1", 1, json!([1]))]));
        write_doc(dir.path(), "prd-2.json", &document("alpha", vec![story("A1", 9, json!([1]))]));

        let engine = engine(Arc::new(MockExecutor::default()));
        assert_eq!(engine.next_story(dir.path()).unwrap().unwrap().story.id, "A1");
    }

    #[tokio::test]
    async fn test_cycle_warnings_are_attached_to_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = document("a", vec![story("A1", 1, json!([1]))]);
        a["relatedDocuments"] = json!(["prd-b.json"]);
        let mut b = document("b", vec![]);
        b["relatedDocuments"] = json!(["prd-a.json"]);
        write_doc(dir.path(), "prd-a.json", &a);
        write_doc(dir.path(), "prd-b.json", &b);

        let engine = engine(Arc::new(MockExecutor::default()));
        let selection = engine.next_story(dir.path()).unwrap().unwrap();
        assert_eq!(selection.story.id, "A1");
        assert!(selection.warnings.iter().any(|w| w.contains("Dependency cycle: a -> b -> a")));
    }

    #[tokio::test]
    async fn test_summarize_counts_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut done = story("S1", 1, json!([1]));
        done["passes"] = json!(true);
        write_doc(dir.path(), "prd.json", &document("auth", vec![done, story("S2", 2, json!([1]))]));
        write_doc(dir.path(), "prd-x.json", &document("billing", vec![]));

        let engine = engine(Arc::new(MockExecutor::default()));
        let summaries = engine.summarize(dir.path()).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "auth");
        assert_eq!(summaries[0].stories_total, 2);
        assert_eq!(summaries[0].stories_completed, 1);
        assert_eq!(summaries[0].next_story_id.as_deref(), Some("S2"));
        assert_eq!(summaries[1].next_story_id, None);
    }

    #[tokio::test]
    async fn test_backups_are_pruned_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(
            dir.path(),
            "prd.json",
            &document("auth", vec![story("S1", 1, json!([1])), story("S2", 2, json!([1])), story("S3", 3, json!([1]))]),
        );
        let engine = ProgressionEngine::new(
            StoreConfig::default().with_max_backups(1).with_summary(false),
            Arc::new(MockExecutor::default()),
        );

        for _ in 0..3 {
            assert!(engine.run_next(dir.path(), "worker").await.unwrap().is_completed());
        }
        assert_eq!(list_backups(&path).unwrap().len(), 1);
        assert!(!dir.path().join("auth.summary.md").exists());
    }

    #[test]
    fn test_mark_passed_targets_one_story() {
        let mut raw = document("auth", vec![story("S1", 1, json!([1])), story("S2", 2, json!([1]))]);
        assert!(mark_passed(&mut raw, "S2"));
        assert_eq!(raw["userStories"][0]["passes"], false);
        assert_eq!(raw["userStories"][1]["passes"], true);
        assert!(!mark_passed(&mut raw, "S3"));
    }
}
