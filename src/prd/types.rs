use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Processing phase a story may require
///
/// Serialized as its number (1-11). Anything outside that range is rejected
/// by the validator and dropped by repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Phase {
    Discovery = 1,
    Requirements = 2,
    Architecture = 3,
    Design = 4,
    Implementation = 5,
    Testing = 6,
    Review = 7,
    Security = 8,
    Documentation = 9,
    Integration = 10,
    Release = 11,
}

impl Phase {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 11;

    pub const ALL: [Phase; 11] = [
        Phase::Discovery,
        Phase::Requirements,
        Phase::Architecture,
        Phase::Design,
        Phase::Implementation,
        Phase::Testing,
        Phase::Review,
        Phase::Security,
        Phase::Documentation,
        Phase::Integration,
        Phase::Release,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u64) -> Option<Phase> {
        u8::try_from(n).ok().and_then(|n| Phase::try_from(n).ok())
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Requirements => "requirements",
            Phase::Architecture => "architecture",
            Phase::Design => "design",
            Phase::Implementation => "implementation",
            Phase::Testing => "testing",
            Phase::Review => "review",
            Phase::Security => "security",
            Phase::Documentation => "documentation",
            Phase::Integration => "integration",
            Phase::Release => "release",
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        if (Phase::MIN..=Phase::MAX).contains(&n) {
            Ok(Phase::ALL[(n - Phase::MIN) as usize])
        } else {
            Err(format!(
                "phase {} is outside {}..={}",
                n,
                Phase::MIN,
                Phase::MAX
            ))
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase.number()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.label())
    }
}

/// A story in a requirement document
///
/// `passes` is the only completion signal the store trusts. `status` is
/// informational text kept for humans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// External capability identifiers required per phase, keyed by phase number
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Fields this version does not know about, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Story {
    pub fn state(&self) -> StoryState {
        if self.passes {
            StoryState::Completed
        } else {
            StoryState::Pending
        }
    }

    pub fn capabilities_for(&self, phase: Phase) -> Vec<String> {
        self.capabilities
            .get(&phase.number().to_string())
            .cloned()
            .unwrap_or_default()
    }
}

/// Requirement document: one feature and its ordered stories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Cross-references to other documents, relative to this document's directory
    #[serde(default)]
    pub related_documents: Vec<String>,
    pub summary_path: String,
    #[serde(default)]
    pub user_stories: Vec<Story>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn story(&self, story_id: &str) -> Option<&Story> {
        self.user_stories.iter().find(|s| s.id == story_id)
    }

    /// Lowest priority pending story; declaration order breaks ties
    pub fn next_pending(&self) -> Option<&Story> {
        self.user_stories
            .iter()
            .filter(|s| !s.passes)
            .fold(None, |best: Option<&Story>, story| match best {
                Some(b) if b.priority <= story.priority => Some(b),
                _ => Some(story),
            })
    }

    pub fn completed_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.passes).count()
    }
}

/// File-name-safe form of a document name
pub fn artifact_stem(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}

/// Summary artifact path a document named `name` owns
pub fn summary_path_for(name: &str) -> String {
    format!("{}.summary.md", artifact_stem(name))
}

/// Story execution state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoryState {
    Pending,
    InProgress,
    Completed,
}

/// Per-document progress for listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub name: String,
    pub path: String,
    pub stories_total: usize,
    pub stories_completed: usize,
    pub next_story_id: Option<String>,
}

impl DocumentSummary {
    pub fn from_document(path: &std::path::Path, document: &Document) -> Self {
        Self {
            name: document.name.clone(),
            path: path.display().to_string(),
            stories_total: document.user_stories.len(),
            stories_completed: document.completed_count(),
            next_story_id: document.next_pending().map(|s| s.id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn story(id: &str, priority: u32, passes: bool) -> Story {
        Story {
            id: id.to_string(),
            title: String::new(),
            description: String::new(),
            acceptance_criteria: vec!["Typecheck passes".to_string()],
            phases: vec![],
            capabilities: BTreeMap::new(),
            priority,
            passes,
            notes: String::new(),
            status: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn test_phase_range() {
        assert_eq!(Phase::try_from(1).unwrap(), Phase::Discovery);
        assert_eq!(Phase::try_from(11).unwrap(), Phase::Release);
        assert!(Phase::try_from(0).is_err());
        assert!(Phase::try_from(12).is_err());
        assert_eq!(Phase::from_number(300), None);
    }

    #[test]
    fn test_document_round_trip_keeps_unknown_fields() {
        let raw = json!({
            "name": "auth",
            "relatedDocuments": ["prd-billing.json"],
            "summaryPath": "auth.summary.md",
            "branchName": "feature/auth",
            "userStories": [{
                "id": "US-001",
                "title": "Login",
                "acceptanceCriteria": ["Typecheck passes"],
                "phases": [1, 5],
                "capabilities": {"5": ["backend-dev"]},
                "priority": 1,
                "passes": false,
                "estimate": 3
            }]
        });

        let doc = Document::from_value(raw).unwrap();
        assert_eq!(doc.user_stories[0].phases, vec![Phase::Discovery, Phase::Implementation]);
        assert_eq!(
            doc.user_stories[0].capabilities_for(Phase::Implementation),
            vec!["backend-dev".to_string()]
        );

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["branchName"], "feature/auth");
        assert_eq!(back["userStories"][0]["estimate"], 3);
        assert_eq!(back["userStories"][0]["capabilities"]["5"][0], "backend-dev");
    }

    #[test]
    fn test_next_pending_breaks_ties_by_declaration() {
        let doc = Document {
            name: "d".to_string(),
            description: None,
            related_documents: vec![],
            summary_path: summary_path_for("d"),
            user_stories: vec![
                story("done", 0, true),
                story("b", 2, false),
                story("c", 1, false),
                story("d", 1, false),
            ],
            extra: Map::new(),
        };

        assert_eq!(doc.next_pending().unwrap().id, "c");
        assert_eq!(doc.completed_count(), 1);
    }
}
