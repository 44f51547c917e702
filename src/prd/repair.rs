//! Deterministic repair of raw PRD documents
//!
//! Every fix is recorded in the change log. Problems that have no single
//! correct fix (a missing name, duplicate story ids, a `passes` of `"maybe"`)
//! are returned as unresolved violations instead of being guessed at.
//!
//! Repair is a fixed point: repairing an already repaired document produces
//! no further changes.

use super::types::{summary_path_for, Phase};
use super::validator::{
    capability_phase, is_verification_gate, parse_priority, refers_to_self, story_field,
    type_name, Violation, ViolationKind,
};
use crate::config::{StoreConfig, DEFAULT_VERIFICATION_GATE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Caller will not persist the result; only the change log matters
    pub dry_run: bool,
    /// Criterion appended to stories lacking a verification gate
    pub verification_gate: String,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verification_gate: DEFAULT_VERIFICATION_GATE.to_string(),
        }
    }
}

impl RepairOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            dry_run: false,
            verification_gate: config.verification_gate.clone(),
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// A single repair action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// No unresolved violations remain
    pub success: bool,
    pub dry_run: bool,
    pub repaired: Value,
    pub change_log: Vec<Change>,
    pub unresolved: Vec<Violation>,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        !self.change_log.is_empty()
    }
}

struct Repairer<'a> {
    options: &'a RepairOptions,
    changes: Vec<Change>,
    unresolved: Vec<Violation>,
}

impl Repairer<'_> {
    fn change(
        &mut self,
        field: impl Into<String>,
        old_value: Option<Value>,
        new_value: Option<Value>,
        reason: impl Into<String>,
    ) {
        self.changes.push(Change {
            field: field.into(),
            old_value,
            new_value,
            reason: reason.into(),
        });
    }

    fn unresolved(
        &mut self,
        field: impl Into<String>,
        story_id: Option<&str>,
        kind: ViolationKind,
        message: impl Into<String>,
    ) {
        self.unresolved
            .push(Violation::new(field, story_id, kind, message));
    }

    /// Insert `default` when `key` is absent; report a wrong type otherwise
    fn ensure(
        &mut self,
        obj: &mut Map<String, Value>,
        field: String,
        story_id: Option<&str>,
        key: &str,
        default: Value,
        well_typed: fn(&Value) -> bool,
        expected: &str,
    ) -> bool {
        match obj.get(key) {
            None => {
                self.change(
                    field,
                    None,
                    Some(default.clone()),
                    format!("missing '{}'; populated with default", key),
                );
                obj.insert(key.to_string(), default);
                true
            }
            Some(value) if well_typed(value) => true,
            Some(value) => {
                let message = format!("'{}' must be {}, found {}", key, expected, type_name(value));
                self.unresolved(field, story_id, ViolationKind::WrongType, message);
                false
            }
        }
    }

    fn repair_document(&mut self, doc: &mut Map<String, Value>) {
        let name = match doc.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => Some(name.clone()),
            Some(Value::String(_)) => {
                self.unresolved("name", None, ViolationKind::EmptyName, "'name' must not be empty");
                None
            }
            Some(other) => {
                let message = format!("'name' must be a string, found {}", type_name(other));
                self.unresolved("name", None, ViolationKind::WrongType, message);
                None
            }
            None => {
                self.unresolved(
                    "name",
                    None,
                    ViolationKind::MissingField,
                    "document is missing 'name' and it cannot be inferred",
                );
                None
            }
        };

        if let Some(description) = doc.get("description") {
            if !description.is_string() {
                let message = format!("'description' must be a string, found {}", type_name(description));
                self.unresolved("description", None, ViolationKind::WrongType, message);
            }
        }

        if self.ensure(
            doc,
            "relatedDocuments".to_string(),
            None,
            "relatedDocuments",
            Value::Array(vec![]),
            Value::is_array,
            "an array",
        ) {
            if let Some(Value::Array(refs)) = doc.get("relatedDocuments") {
                let bad: Vec<(usize, &'static str)> = refs
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.is_string())
                    .map(|(i, r)| (i, type_name(r)))
                    .collect();
                for (i, found) in bad {
                    self.unresolved(
                        format!("relatedDocuments[{}]", i),
                        None,
                        ViolationKind::WrongType,
                        format!("cross-reference must be a path string, found {}", found),
                    );
                }
            }
        }

        self.repair_summary_path(doc, name.as_deref());

        if !self.ensure(
            doc,
            "userStories".to_string(),
            None,
            "userStories",
            Value::Array(vec![]),
            Value::is_array,
            "an array",
        ) {
            return;
        }

        let Some(Value::Array(stories)) = doc.get_mut("userStories") else {
            return;
        };

        let mut seen_ids = HashSet::new();
        for (index, story) in stories.iter_mut().enumerate() {
            if !story.is_object() {
                let message = format!("story must be an object, found {}", type_name(story));
                self.unresolved(
                    format!("userStories[{}]", index),
                    None,
                    ViolationKind::NotAnObject,
                    message,
                );
                continue;
            }
            let Some(story) = story.as_object_mut() else {
                continue;
            };

            let id = match story.get("id") {
                Some(Value::String(id)) => {
                    if !seen_ids.insert(id.clone()) {
                        self.unresolved(
                            story_field(index, "id"),
                            Some(id.as_str()),
                            ViolationKind::DuplicateStoryId,
                            format!("Duplicate story ID: {}", id),
                        );
                    }
                    Some(id.clone())
                }
                Some(other) => {
                    let message = format!("'id' must be a string, found {}", type_name(other));
                    self.unresolved(story_field(index, "id"), None, ViolationKind::WrongType, message);
                    None
                }
                None => {
                    self.unresolved(
                        story_field(index, "id"),
                        None,
                        ViolationKind::MissingField,
                        "story is missing 'id'",
                    );
                    None
                }
            };

            self.repair_story(index, story, id.as_deref());
        }
    }

    fn repair_summary_path(&mut self, doc: &mut Map<String, Value>, name: Option<&str>) {
        let current = doc.get("summaryPath");
        let reason = match current {
            Some(Value::String(path)) => match name {
                Some(name) if refers_to_self(path, name) => return,
                Some(_) => "summary path belonged to another document",
                None => return,
            },
            Some(_) => "summary path was not a string",
            None => "missing 'summaryPath'; populated with default",
        };

        let Some(name) = name else {
            self.unresolved(
                "summaryPath",
                None,
                ViolationKind::MissingField,
                "summary path cannot be derived without a document name",
            );
            return;
        };

        let new_value = Value::String(summary_path_for(name));
        self.change("summaryPath", current.cloned(), Some(new_value.clone()), reason);
        doc.insert("summaryPath".to_string(), new_value);
    }

    fn repair_story(&mut self, index: usize, story: &mut Map<String, Value>, id: Option<&str>) {
        for key in ["title", "description", "notes"] {
            self.ensure(
                story,
                story_field(index, key),
                id,
                key,
                Value::String(String::new()),
                Value::is_string,
                "a string",
            );
        }
        if let Some(status) = story.get("status") {
            if !status.is_string() {
                let message = format!("'status' must be a string, found {}", type_name(status));
                self.unresolved(story_field(index, "status"), id, ViolationKind::WrongType, message);
            }
        }

        self.repair_priority(index, story, id);
        let phase_set = self.repair_phases(index, story, id);
        self.repair_capabilities(index, story, id, phase_set.as_ref());
        self.repair_criteria(index, story, id);
        self.repair_passes(index, story, id);
    }

    fn repair_priority(&mut self, index: usize, story: &mut Map<String, Value>, id: Option<&str>) {
        let field = story_field(index, "priority");
        match story.get("priority") {
            None => {
                // Declaration order is the default rank
                let default = Value::from(index as u64 + 1);
                self.change(
                    field,
                    None,
                    Some(default.clone()),
                    "missing 'priority'; defaulted to declaration position",
                );
                story.insert("priority".to_string(), default);
            }
            Some(value) if value.is_u64() && parse_priority(value).is_some() => {}
            Some(value @ Value::String(_)) if parse_priority(value).is_some() => {
                let parsed = parse_priority(value).map(Value::from);
                self.change(
                    field,
                    Some(value.clone()),
                    parsed.clone(),
                    "priority given as text; parsed as integer",
                );
                if let Some(parsed) = parsed {
                    story.insert("priority".to_string(), parsed);
                }
            }
            Some(value) => {
                let message = format!("'priority' must be a non-negative integer, found {}", value);
                self.unresolved(field, id, ViolationKind::InvalidPriority, message);
            }
        }
    }

    /// Drops invalid and duplicate phases; returns the surviving set
    fn repair_phases(
        &mut self,
        index: usize,
        story: &mut Map<String, Value>,
        id: Option<&str>,
    ) -> Option<HashSet<Phase>> {
        let field = story_field(index, "phases");
        if !self.ensure(
            story,
            field.clone(),
            id,
            "phases",
            Value::Array(vec![]),
            Value::is_array,
            "an array",
        ) {
            return None;
        }
        let Some(Value::Array(items)) = story.get_mut("phases") else {
            return None;
        };

        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(items.len());
        let mut dropped = Vec::new();
        for (j, value) in items.iter().enumerate() {
            match value.as_u64().and_then(Phase::from_number) {
                None => dropped.push((
                    j,
                    value.clone(),
                    format!("phase {} is not in {}..={}; dropped", value, Phase::MIN, Phase::MAX),
                )),
                Some(phase) if !seen.insert(phase) => dropped.push((
                    j,
                    value.clone(),
                    format!("duplicate phase {}; kept first occurrence", phase.number()),
                )),
                Some(phase) => kept.push(Value::from(phase.number())),
            }
        }

        if !dropped.is_empty() {
            *items = kept;
            for (j, value, reason) in dropped {
                self.change(format!("{}[{}]", field, j), Some(value), None, reason);
            }
        }
        Some(seen)
    }

    fn repair_capabilities(
        &mut self,
        index: usize,
        story: &mut Map<String, Value>,
        id: Option<&str>,
        phase_set: Option<&HashSet<Phase>>,
    ) {
        let field = story_field(index, "capabilities");
        if !self.ensure(
            story,
            field.clone(),
            id,
            "capabilities",
            Value::Object(Map::new()),
            Value::is_object,
            "an object",
        ) {
            return;
        }
        let Some(Value::Object(map)) = story.get_mut("capabilities") else {
            return;
        };

        // Without a readable phase set there is nothing to prune against
        if let Some(phase_set) = phase_set {
            let orphans: Vec<String> = map
                .keys()
                .filter(|key| !capability_phase(key).is_some_and(|p| phase_set.contains(&p)))
                .cloned()
                .collect();
            for key in orphans {
                let old = map.remove(&key);
                self.change(
                    format!("{}.{}", field, key),
                    old,
                    None,
                    format!("phase '{}' is not required by the story; capability entry dropped", key),
                );
            }
        }

        let malformed: Vec<String> = map
            .iter()
            .filter(|(_, caps)| !caps.as_array().is_some_and(|c| c.iter().all(Value::is_string)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in malformed {
            self.unresolved(
                format!("{}.{}", field, key),
                id,
                ViolationKind::WrongType,
                "capability list must be an array of strings",
            );
        }
    }

    fn repair_criteria(&mut self, index: usize, story: &mut Map<String, Value>, id: Option<&str>) {
        let field = story_field(index, "acceptanceCriteria");
        let gate = Value::String(self.options.verification_gate.clone());

        match story.get_mut("acceptanceCriteria") {
            None => {
                let new_value = Value::Array(vec![gate]);
                self.change(
                    field,
                    None,
                    Some(new_value.clone()),
                    "missing acceptance criteria; added verification gate",
                );
                story.insert("acceptanceCriteria".to_string(), new_value);
            }
            Some(Value::Array(items)) => {
                let non_strings: Vec<(usize, &'static str)> = items
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.is_string())
                    .map(|(j, c)| (j, type_name(c)))
                    .collect();
                if !non_strings.is_empty() {
                    for (j, found) in non_strings {
                        self.unresolved(
                            format!("{}[{}]", field, j),
                            id,
                            ViolationKind::WrongType,
                            format!("criterion must be a string, found {}", found),
                        );
                    }
                    return;
                }

                let has_gate = items.iter().filter_map(Value::as_str).any(is_verification_gate);
                if !has_gate {
                    self.change(
                        format!("{}[{}]", field, items.len()),
                        None,
                        Some(gate.clone()),
                        "no verification gate; appended",
                    );
                    items.push(gate);
                }
            }
            Some(other) => {
                let message = format!("'acceptanceCriteria' must be an array, found {}", type_name(other));
                self.unresolved(field, id, ViolationKind::WrongType, message);
            }
        }
    }

    fn repair_passes(&mut self, index: usize, story: &mut Map<String, Value>, id: Option<&str>) {
        let field = story_field(index, "passes");
        let current = story.get("passes").cloned();
        let coerced = match &current {
            Some(Value::Bool(_)) => return,
            None => {
                self.change(
                    field,
                    None,
                    Some(Value::Bool(false)),
                    "missing 'passes'; defaulted to incomplete",
                );
                story.insert("passes".to_string(), Value::Bool(false));
                return;
            }
            Some(Value::String(text)) => match text.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Some(_) => None,
        };

        match coerced {
            Some(flag) => {
                self.change(
                    field,
                    current,
                    Some(Value::Bool(flag)),
                    "completion flag given as text; coerced to boolean",
                );
                story.insert("passes".to_string(), Value::Bool(flag));
            }
            None => {
                let shown = current
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_default();
                self.change(
                    field.clone(),
                    current,
                    Some(Value::Bool(false)),
                    "ambiguous completion flag; story left incomplete",
                );
                story.insert("passes".to_string(), Value::Bool(false));
                self.unresolved(
                    field,
                    id,
                    ViolationKind::NonBooleanCompletion,
                    format!("'passes' value {} is not a boolean and cannot be coerced", shown),
                );
            }
        }
    }
}

/// Repair a raw document
///
/// The input is never mutated. In dry-run mode the report still carries the
/// would-be document; callers must not persist it.
pub fn repair(document: &Value, options: &RepairOptions) -> RepairReport {
    let mut repaired = document.clone();
    let mut repairer = Repairer {
        options,
        changes: Vec::new(),
        unresolved: Vec::new(),
    };

    match repaired.as_object_mut() {
        Some(doc) => repairer.repair_document(doc),
        None => repairer.unresolved(
            "$",
            None,
            ViolationKind::NotAnObject,
            format!("document must be an object, found {}", type_name(document)),
        ),
    }

    RepairReport {
        success: repairer.unresolved.is_empty(),
        dry_run: options.dry_run,
        repaired,
        change_log: repairer.changes,
        unresolved: repairer.unresolved,
    }
}
