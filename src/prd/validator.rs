//! Structural validation of raw PRD documents
//!
//! Works on `serde_json::Value` rather than the typed [`Document`] so that
//! shapes the typed model cannot represent (a `"true"` string in `passes`,
//! a phase of `15`) are reported instead of failing deserialization.
//!
//! [`Document`]: super::types::Document

use super::types::{summary_path_for, Phase};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Component, Path};

static GATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(type[\s-]?check\w*|build\w*|compil\w*)\b").expect("gate pattern is valid")
});

/// Whether an acceptance criterion confirms a build or type check
pub fn is_verification_gate(criterion: &str) -> bool {
    GATE_PATTERN.is_match(criterion)
}

/// Whether `summary_path` points at the artifact owned by document `name`
///
/// The path must stay inside the document's directory (relative, no `..`)
/// and its file name must be exactly `<name>.summary.md`. Anything looser
/// lets the log overwrite the document or its lock.
pub fn refers_to_self(summary_path: &str, name: &str) -> bool {
    let path = Path::new(summary_path);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return false;
    }
    path.file_name()
        .map(|f| f.to_string_lossy() == summary_path_for(name))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NotAnObject,
    MissingField,
    WrongType,
    EmptyName,
    ForeignSummaryPath,
    DuplicateStoryId,
    InvalidPhase,
    DuplicatePhase,
    OrphanCapability,
    MissingVerificationGate,
    NonBooleanCompletion,
    InvalidPriority,
}

/// One structural problem, addressed by field path (e.g. `userStories[2].phases[1]`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub field: String,
    pub story_id: Option<String>,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(
        field: impl Into<String>,
        story_id: Option<&str>,
        kind: ViolationKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            story_id: story_id.map(str::to_string),
            kind,
            message: message.into(),
        }
    }
}

/// Validation result for a document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<Violation>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<Violation>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn story_field(index: usize, key: &str) -> String {
    format!("userStories[{}].{}", index, key)
}

/// Validate a raw document and return every violation found
pub fn validate(document: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(doc) = document.as_object() else {
        errors.push(Violation::new(
            "$",
            None,
            ViolationKind::NotAnObject,
            format!("document must be an object, found {}", type_name(document)),
        ));
        return ValidationResult::from_parts(errors, warnings);
    };

    // 1. Top-level fields
    check_top_level(doc, &mut errors);

    let stories: Vec<(usize, &Map<String, Value>, Option<&str>)> = match doc.get("userStories") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item.as_object() {
                Some(obj) => Some((i, obj, obj.get("id").and_then(Value::as_str))),
                None => {
                    errors.push(Violation::new(
                        format!("userStories[{}]", i),
                        None,
                        ViolationKind::NotAnObject,
                        format!("story must be an object, found {}", type_name(item)),
                    ));
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    };

    // 2. Unique story identities
    let mut seen_ids = HashSet::new();
    for (i, story, id) in &stories {
        match (story.get("id"), id) {
            (None, _) => errors.push(Violation::new(
                story_field(*i, "id"),
                None,
                ViolationKind::MissingField,
                "story is missing 'id'",
            )),
            (Some(other), None) => errors.push(Violation::new(
                story_field(*i, "id"),
                None,
                ViolationKind::WrongType,
                format!("'id' must be a string, found {}", type_name(other)),
            )),
            (Some(_), Some(id)) => {
                if !seen_ids.insert(*id) {
                    errors.push(Violation::new(
                        story_field(*i, "id"),
                        Some(*id),
                        ViolationKind::DuplicateStoryId,
                        format!("Duplicate story ID: {}", id),
                    ));
                }
            }
        }
    }

    // 3-4. Phases, then capabilities against the valid phase set
    for (i, story, id) in &stories {
        let phase_set = check_phases(*i, story, *id, &mut errors);
        check_capabilities(*i, story, *id, phase_set.as_ref(), &mut errors);
    }

    // 5. Verification gate
    for (i, story, id) in &stories {
        check_acceptance_criteria(*i, story, *id, &mut errors);
    }

    // 6. Completion flag
    for (i, story, id) in &stories {
        match story.get("passes") {
            None | Some(Value::Bool(_)) => {}
            Some(other) => errors.push(Violation::new(
                story_field(*i, "passes"),
                *id,
                ViolationKind::NonBooleanCompletion,
                format!("'passes' must be a boolean, found {} {}", type_name(other), other),
            )),
        }
    }

    // 7. Remaining scalar fields
    for (i, story, id) in &stories {
        for key in ["title", "description", "notes", "status"] {
            if let Some(value) = story.get(key) {
                if !value.is_string() {
                    errors.push(Violation::new(
                        story_field(*i, key),
                        *id,
                        ViolationKind::WrongType,
                        format!("'{}' must be a string, found {}", key, type_name(value)),
                    ));
                }
            }
        }
        if let Some(priority) = story.get("priority") {
            if parse_priority(priority).is_none() || !priority.is_u64() {
                errors.push(Violation::new(
                    story_field(*i, "priority"),
                    *id,
                    ViolationKind::InvalidPriority,
                    format!("'priority' must be a non-negative integer, found {}", priority),
                ));
            }
        }

        if let Some(warning) = status_divergence(story, *id) {
            warnings.push(warning);
        }
    }

    ValidationResult::from_parts(errors, warnings)
}

fn check_top_level(doc: &Map<String, Value>, errors: &mut Vec<Violation>) {
    let name = match doc.get("name") {
        None => {
            errors.push(Violation::new(
                "name",
                None,
                ViolationKind::MissingField,
                "document is missing 'name'",
            ));
            None
        }
        Some(Value::String(name)) if name.trim().is_empty() => {
            errors.push(Violation::new(
                "name",
                None,
                ViolationKind::EmptyName,
                "'name' must not be empty",
            ));
            None
        }
        Some(Value::String(name)) => Some(name.as_str()),
        Some(other) => {
            errors.push(Violation::new(
                "name",
                None,
                ViolationKind::WrongType,
                format!("'name' must be a string, found {}", type_name(other)),
            ));
            None
        }
    };

    if let Some(description) = doc.get("description") {
        if !description.is_string() {
            errors.push(Violation::new(
                "description",
                None,
                ViolationKind::WrongType,
                format!("'description' must be a string, found {}", type_name(description)),
            ));
        }
    }

    match doc.get("relatedDocuments") {
        None => {}
        Some(Value::Array(refs)) => {
            for (i, r) in refs.iter().enumerate() {
                if !r.is_string() {
                    errors.push(Violation::new(
                        format!("relatedDocuments[{}]", i),
                        None,
                        ViolationKind::WrongType,
                        format!("cross-reference must be a path string, found {}", type_name(r)),
                    ));
                }
            }
        }
        Some(other) => errors.push(Violation::new(
            "relatedDocuments",
            None,
            ViolationKind::WrongType,
            format!("'relatedDocuments' must be an array, found {}", type_name(other)),
        )),
    }

    match doc.get("summaryPath") {
        None => errors.push(Violation::new(
            "summaryPath",
            None,
            ViolationKind::MissingField,
            "document is missing 'summaryPath'",
        )),
        Some(Value::String(path)) => {
            if let Some(name) = name {
                if !refers_to_self(path, name) {
                    errors.push(Violation::new(
                        "summaryPath",
                        None,
                        ViolationKind::ForeignSummaryPath,
                        format!("summary path '{}' does not belong to document '{}'", path, name),
                    ));
                }
            }
        }
        Some(other) => errors.push(Violation::new(
            "summaryPath",
            None,
            ViolationKind::WrongType,
            format!("'summaryPath' must be a string, found {}", type_name(other)),
        )),
    }

    match doc.get("userStories") {
        None => errors.push(Violation::new(
            "userStories",
            None,
            ViolationKind::MissingField,
            "document is missing 'userStories'",
        )),
        Some(Value::Array(_)) => {}
        Some(other) => errors.push(Violation::new(
            "userStories",
            None,
            ViolationKind::WrongType,
            format!("'userStories' must be an array, found {}", type_name(other)),
        )),
    }
}

/// Returns the set of valid phases, or None when `phases` is not an array
fn check_phases(
    index: usize,
    story: &Map<String, Value>,
    id: Option<&str>,
    errors: &mut Vec<Violation>,
) -> Option<HashSet<Phase>> {
    let items = match story.get("phases") {
        None => return Some(HashSet::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            errors.push(Violation::new(
                story_field(index, "phases"),
                id,
                ViolationKind::WrongType,
                format!("'phases' must be an array, found {}", type_name(other)),
            ));
            return None;
        }
    };

    let mut seen = HashSet::new();
    for (j, value) in items.iter().enumerate() {
        let field = format!("{}[{}]", story_field(index, "phases"), j);
        match value.as_u64().and_then(Phase::from_number) {
            None => errors.push(Violation::new(
                field,
                id,
                ViolationKind::InvalidPhase,
                format!(
                    "phase {} is not in {}..={}",
                    value,
                    Phase::MIN,
                    Phase::MAX
                ),
            )),
            Some(phase) => {
                if !seen.insert(phase) {
                    errors.push(Violation::new(
                        field,
                        id,
                        ViolationKind::DuplicatePhase,
                        format!("phase {} is listed more than once", phase.number()),
                    ));
                }
            }
        }
    }
    Some(seen)
}

/// Phase named by a capability key; only the canonical decimal form counts
pub(crate) fn capability_phase(key: &str) -> Option<Phase> {
    let n: u8 = key.parse().ok()?;
    let phase = Phase::try_from(n).ok()?;
    (phase.number().to_string() == key).then_some(phase)
}

fn check_capabilities(
    index: usize,
    story: &Map<String, Value>,
    id: Option<&str>,
    phase_set: Option<&HashSet<Phase>>,
    errors: &mut Vec<Violation>,
) {
    let map = match story.get("capabilities") {
        None => return,
        Some(Value::Object(map)) => map,
        Some(other) => {
            errors.push(Violation::new(
                story_field(index, "capabilities"),
                id,
                ViolationKind::WrongType,
                format!("'capabilities' must be an object, found {}", type_name(other)),
            ));
            return;
        }
    };

    for (key, value) in map {
        let field = format!("{}.{}", story_field(index, "capabilities"), key);
        if let Some(phase_set) = phase_set {
            let known = capability_phase(key).is_some_and(|p| phase_set.contains(&p));
            if !known {
                errors.push(Violation::new(
                    field.clone(),
                    id,
                    ViolationKind::OrphanCapability,
                    format!("capabilities reference phase '{}' which the story does not require", key),
                ));
            }
        }
        let well_typed = value
            .as_array()
            .is_some_and(|caps| caps.iter().all(Value::is_string));
        if !well_typed {
            errors.push(Violation::new(
                field,
                id,
                ViolationKind::WrongType,
                "capability list must be an array of strings",
            ));
        }
    }
}

fn check_acceptance_criteria(
    index: usize,
    story: &Map<String, Value>,
    id: Option<&str>,
    errors: &mut Vec<Violation>,
) {
    let field = story_field(index, "acceptanceCriteria");
    let items = match story.get("acceptanceCriteria") {
        None => {
            errors.push(Violation::new(
                field,
                id,
                ViolationKind::MissingVerificationGate,
                "story has no acceptance criteria and so no verification gate",
            ));
            return;
        }
        Some(Value::Array(items)) => items,
        Some(other) => {
            errors.push(Violation::new(
                field,
                id,
                ViolationKind::WrongType,
                format!("'acceptanceCriteria' must be an array, found {}", type_name(other)),
            ));
            return;
        }
    };

    for (j, item) in items.iter().enumerate() {
        if !item.is_string() {
            errors.push(Violation::new(
                format!("{}[{}]", field, j),
                id,
                ViolationKind::WrongType,
                format!("criterion must be a string, found {}", type_name(item)),
            ));
        }
    }

    let has_gate = items
        .iter()
        .filter_map(Value::as_str)
        .any(is_verification_gate);
    if !has_gate {
        errors.push(Violation::new(
            field,
            id,
            ViolationKind::MissingVerificationGate,
            "no acceptance criterion confirms a build or type check",
        ));
    }
}

/// Parses a priority from a number or a plain integer string
pub(crate) fn parse_priority(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// What an informational status text claims about completion, if anything
fn status_claims_done(status: &str) -> Option<bool> {
    match status.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
        "done" | "complete" | "completed" | "passed" | "passing" => Some(true),
        "pending" | "todo" | "not_started" | "in_progress" | "blocked" | "failed" | "failing" => {
            Some(false)
        }
        _ => None,
    }
}

fn status_divergence(story: &Map<String, Value>, id: Option<&str>) -> Option<String> {
    let status = story.get("status")?.as_str()?;
    let passes = story.get("passes").and_then(Value::as_bool).unwrap_or(false);
    let claims = status_claims_done(status)?;
    (claims != passes).then(|| {
        format!(
            "Story '{}' status text '{}' disagrees with passes={}; passes is authoritative",
            id.unwrap_or("?"),
            status,
            passes
        )
    })
}
