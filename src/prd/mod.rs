//! PRD (Product Requirements Document) store
//!
//! Documents are JSON files holding one feature and its user stories:
//! - Validation and repair work on raw JSON so unknown fields survive
//! - Cross-document references are checked for cycles
//! - Stories progress through executor-run phases until `passes` is set

pub mod executor;
pub mod graph;
pub mod manager;
pub mod repair;
pub mod summary;
pub mod types;
pub mod validator;

pub use executor::{PhaseExecutor, PhaseOutcome, PhaseRequest, ShellExecutor};
pub use graph::{analyze, CycleReport, DocumentNode};
pub use manager::{CompletionRecord, FailureRecord, IterationOutcome, ProgressionEngine, Selection};
pub use repair::{repair, Change, RepairOptions, RepairReport};
pub use types::{Document, DocumentSummary, Phase, Story, StoryState};
pub use validator::{validate, ValidationResult, Violation, ViolationKind};
