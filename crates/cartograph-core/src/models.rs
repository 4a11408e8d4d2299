//! Shared typed models used across namespace assignment, resolution and
//! clustering.

use std::collections::BTreeSet;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// Separator between a namespace and a local id, and between id segments.
pub const ID_SEPARATOR: char = '.';

/// Mint the canonical identifier for a local id inside a namespace.
pub fn make_id(namespace: &str, local_id: &str) -> String {
    format!("{namespace}{ID_SEPARATOR}{local_id}")
}

/// Final dot-segment of an identifier or reference (`"a.b.Login"` -> `"Login"`).
pub fn final_segment(value: &str) -> &str {
    value.rsplit(ID_SEPARATOR).next().unwrap_or(value)
}

/// Split an identifier on the id separator.
pub fn segments(value: &str) -> Vec<&str> {
    value.split(ID_SEPARATOR).collect()
}

// ---------------------------------------------------------------------------
// 1. RawComponentRecord
// ---------------------------------------------------------------------------

/// A component as emitted by the source analyzer for one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawComponentRecord {
    pub local_id: String,
    pub name: String,
    pub kind: String,
    pub file_path: String,
    #[serde(default)]
    pub relative_path: Option<String>,
    #[serde(default)]
    pub source_text: String,
    #[serde(default)]
    pub raw_references: Vec<String>,
}

impl RawComponentRecord {
    pub fn new(local_id: &str, name: &str, kind: &str, file_path: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            file_path: file_path.to_string(),
            relative_path: None,
            source_text: String::new(),
            raw_references: Vec::new(),
        }
    }

    pub fn with_source(mut self, source_text: &str) -> Self {
        self.source_text = source_text.to_string();
        self
    }

    pub fn with_references(mut self, references: &[&str]) -> Self {
        self.raw_references = references.iter().map(|r| r.to_string()).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// 2. SourceRoot
// ---------------------------------------------------------------------------

/// One analyzed source root. Root order matters: index 0 is the primary root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRoot {
    pub path: PathBuf,
    pub records: Vec<RawComponentRecord>,
}

impl SourceRoot {
    pub fn new(path: impl Into<PathBuf>, records: Vec<RawComponentRecord>) -> Self {
        Self {
            path: path.into(),
            records,
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Namespace
// ---------------------------------------------------------------------------

/// A namespace registered for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub roots: Vec<PathBuf>,
    pub is_external: bool,
    pub component_count: usize,
}

// ---------------------------------------------------------------------------
// 4. Component
// ---------------------------------------------------------------------------

/// Why a raw reference could not be turned into a canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    NoMatch,
    Ambiguous { candidates: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub reference: String,
    #[serde(flatten)]
    pub reason: UnresolvedReason,
}

/// The table-resident, namespaced representation of one parsed symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub is_external: bool,
    pub file_path: String,
    pub relative_path: String,
    #[serde(default)]
    pub source_text: String,
    #[serde(default)]
    pub raw_references: Vec<String>,
    #[serde(default)]
    pub resolved_dependencies: BTreeSet<String>,
    #[serde(default)]
    pub unresolved_references: Vec<UnresolvedReference>,
}

impl Component {
    pub(crate) fn from_record(namespace: &str, is_external: bool, record: RawComponentRecord) -> Self {
        let local_id = record.local_id.trim().to_string();
        let relative_path = record
            .relative_path
            .unwrap_or_else(|| record.file_path.clone());
        Self {
            id: make_id(namespace, &local_id),
            short_id: local_id,
            name: record.name,
            namespace: namespace.to_string(),
            kind: record.kind,
            is_external,
            file_path: record.file_path,
            relative_path,
            source_text: record.source_text,
            raw_references: record.raw_references,
            resolved_dependencies: BTreeSet::new(),
            unresolved_references: Vec::new(),
        }
    }

    /// Bare display name; falls back to the last id segment when the analyzer
    /// left `name` empty.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            final_segment(&self.short_id)
        } else {
            &self.name
        }
    }
}

// ---------------------------------------------------------------------------
// 5. ComponentTable
// ---------------------------------------------------------------------------

/// `id -> Component`, built once by the indexer and read-only afterwards.
///
/// Iteration follows insertion order (root order, then record order), which is
/// the first-seen order every deterministic tie-break relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTable {
    namespaces: Vec<Namespace>,
    components: IndexMap<String, Component>,
}

impl ComponentTable {
    pub(crate) fn from_parts(
        namespaces: Vec<Namespace>,
        components: IndexMap<String, Component>,
    ) -> Self {
        Self {
            namespaces,
            components,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (Vec<Namespace>, IndexMap<String, Component>) {
        (self.namespaces, self.components)
    }

    pub fn get(&self, id: &str) -> Option<&Component> {
        self.components.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn is_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.name == name)
    }

    pub(crate) fn components(&self) -> &IndexMap<String, Component> {
        &self.components
    }
}
