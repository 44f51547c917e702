//! Cross-document dependency analysis
//!
//! Documents reference each other through `relatedDocuments`. A cycle in
//! those references is reported, never rejected: the engine keeps working
//! and the caller decides what to do with the warning.

use crate::store::collection::CollectionEntry;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// One document as seen by the analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentNode {
    pub path: PathBuf,
    pub name: String,
    /// Resolved against the document's directory
    pub references: Vec<PathBuf>,
}

impl DocumentNode {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, references: &[&str]) -> Self {
        let path = normalize(&path.into());
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            references: references.iter().map(|r| normalize(&base.join(r))).collect(),
            path,
            name: name.into(),
        }
    }

    /// Non-string reference entries are ignored here; the validator reports them
    pub fn from_entry(entry: &CollectionEntry) -> Self {
        let refs: Vec<&str> = entry
            .raw
            .get("relatedDocuments")
            .and_then(Value::as_array)
            .map(|refs| refs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        Self::new(entry.path.clone(), entry.name(), &refs)
    }
}

/// Cycles and reference problems found in a collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Each cycle as document names in traversal order, first node not repeated
    pub cycles: Vec<Vec<String>>,
    pub warnings: Vec<String>,
}

impl CycleReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Find reference cycles, dangling references and duplicate names
pub fn analyze(nodes: &[DocumentNode]) -> CycleReport {
    let mut report = CycleReport::default();

    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|a, b| nodes[*a].path.cmp(&nodes[*b].path));

    let index: HashMap<&Path, usize> = order
        .iter()
        .map(|&i| (nodes[i].path.as_path(), i))
        .collect();

    let mut seen_names: HashMap<&str, &Path> = HashMap::new();
    for &i in &order {
        let node = &nodes[i];
        if let Some(first) = seen_names.insert(node.name.as_str(), node.path.as_path()) {
            report.warnings.push(format!(
                "Duplicate document name '{}' in {} and {}",
                node.name,
                first.display(),
                node.path.display()
            ));
        }
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &i in &order {
        let node = &nodes[i];
        for reference in &node.references {
            match index.get(reference.as_path()) {
                Some(&target) => {
                    if !edges[i].contains(&target) {
                        edges[i].push(target);
                    }
                }
                None => report.warnings.push(format!(
                    "Document '{}' references {} which is not in the collection",
                    node.name,
                    reference.display()
                )),
            }
        }
    }

    // Each cycle is enumerated from its lowest-ranked node, walking only
    // through nodes ranked after it
    let mut rank = vec![0; nodes.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    let mut found = Vec::new();
    for &start in &order {
        let mut path = vec![start];
        elementary_cycles(start, start, &edges, &rank, &mut path, &mut found);
    }

    let mut canonical = HashSet::new();
    for cycle in found {
        if canonical.insert(rotate_to_min(&cycle)) {
            let names: Vec<String> = cycle.iter().map(|&i| nodes[i].name.clone()).collect();
            report.warnings.push(format!(
                "Dependency cycle: {} -> {}",
                names.join(" -> "),
                names[0]
            ));
            report.cycles.push(names);
        }
    }

    if report.has_cycles() {
        tracing::warn!(cycles = report.cycles.len(), "Document dependency cycles detected");
    }
    report
}

/// Every elementary cycle through `start` that continues `path`
///
/// Paths are kept per branch rather than marking nodes globally visited, so
/// cycles sharing nodes (a -> b -> d -> a and a -> c -> d -> a) are all found.
fn elementary_cycles(
    start: usize,
    node: usize,
    edges: &[Vec<usize>],
    rank: &[usize],
    path: &mut Vec<usize>,
    found: &mut Vec<Vec<usize>>,
) {
    for &next in &edges[node] {
        if next == start {
            found.push(path.clone());
        } else if rank[next] > rank[start] && !path.contains(&next) {
            path.push(next);
            elementary_cycles(start, next, edges, rank, path, found);
            path.pop();
        }
    }
}

fn rotate_to_min(cycle: &[usize]) -> Vec<usize> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, n)| **n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..].iter().chain(&cycle[..start]).copied().collect()
}
