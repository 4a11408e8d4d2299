//! Cross-namespace reference resolution.
//!
//! Raw references are plain strings written by the source analyzer
//! (`"Login"`, `"svc.Login"`, `"libs.svc.Login"`). Each one is resolved
//! against the immutable key index with three cascading strategies and the
//! first strategy that produces exactly one id wins. Nothing is guessed: zero
//! or several by-name matches leave the reference unresolved, with the reason.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::guards::{bounded, MAX_DIAGNOSTIC_CANDIDATES};
use crate::indexer::namespace::TableBuilder;
use crate::models::{
    final_segment, make_id, Component, ComponentTable, UnresolvedReason, UnresolvedReference,
};

/// Which strategy turned a reference into an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    IntraNamespace,
    Qualified,
    CrossNamespace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub components: usize,
    pub references: usize,
    pub intra_namespace: usize,
    pub qualified: usize,
    pub cross_namespace: usize,
    pub unresolved_no_match: usize,
    pub unresolved_ambiguous: usize,
    pub self_references: usize,
    pub blank_references: usize,
}

impl ResolutionReport {
    pub fn resolved(&self) -> usize {
        self.intra_namespace + self.qualified + self.cross_namespace
    }

    pub fn unresolved(&self) -> usize {
        self.unresolved_no_match + self.unresolved_ambiguous
    }

    fn merge(&mut self, other: &ResolutionReport) {
        self.references += other.references;
        self.intra_namespace += other.intra_namespace;
        self.qualified += other.qualified;
        self.cross_namespace += other.cross_namespace;
        self.unresolved_no_match += other.unresolved_no_match;
        self.unresolved_ambiguous += other.unresolved_ambiguous;
        self.self_references += other.self_references;
        self.blank_references += other.blank_references;
    }
}

// ---------------------------------------------------------------------------
// Key index
// ---------------------------------------------------------------------------

/// Read-only lookup structure shared by every resolver worker.
struct KeyIndex<'a> {
    components: &'a IndexMap<String, Component>,
    /// final segment -> ids in first-seen order
    by_name: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> KeyIndex<'a> {
    fn build(components: &'a IndexMap<String, Component>) -> Self {
        let mut by_name: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for id in components.keys() {
            by_name
                .entry(final_segment(id))
                .or_default()
                .push(id.as_str());
        }
        Self {
            components,
            by_name,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }
}

/// Result of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedReference {
    Resolved {
        id: String,
        strategy: ResolutionStrategy,
    },
    SelfReference,
    Unresolved(UnresolvedReason),
}

fn resolve_one(index: &KeyIndex<'_>, owner: &Component, reference: &str) -> ResolvedReference {
    // Strategy 1: relative to the owning namespace
    let local = make_id(&owner.namespace, reference);
    if index.contains(&local) {
        if local == owner.id {
            return ResolvedReference::SelfReference;
        }
        return ResolvedReference::Resolved {
            id: local,
            strategy: ResolutionStrategy::IntraNamespace,
        };
    }

    // Strategy 2: reference is already a canonical id
    if index.contains(reference) {
        if reference == owner.id {
            return ResolvedReference::SelfReference;
        }
        return ResolvedReference::Resolved {
            id: reference.to_string(),
            strategy: ResolutionStrategy::Qualified,
        };
    }

    // Strategy 3: unique bare-name match anywhere in the table
    let bare = final_segment(reference);
    let matches: Vec<&str> = index
        .by_name
        .get(bare)
        .map(|ids| {
            ids.iter()
                .copied()
                .filter(|id| *id != owner.id)
                .collect()
        })
        .unwrap_or_default();

    match matches.as_slice() {
        [] => ResolvedReference::Unresolved(UnresolvedReason::NoMatch),
        [only] => ResolvedReference::Resolved {
            id: (*only).to_string(),
            strategy: ResolutionStrategy::CrossNamespace,
        },
        many => ResolvedReference::Unresolved(UnresolvedReason::Ambiguous {
            candidates: bounded(
                &many.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                MAX_DIAGNOSTIC_CANDIDATES,
            ),
        }),
    }
}

struct ComponentResolution {
    resolved: BTreeSet<String>,
    unresolved: Vec<UnresolvedReference>,
    report: ResolutionReport,
}

fn resolve_component(index: &KeyIndex<'_>, component: &Component) -> ComponentResolution {
    let mut out = ComponentResolution {
        resolved: BTreeSet::new(),
        unresolved: Vec::new(),
        report: ResolutionReport::default(),
    };

    for raw in &component.raw_references {
        let reference = raw.trim();
        if reference.is_empty() {
            out.report.blank_references += 1;
            continue;
        }
        out.report.references += 1;

        match resolve_one(index, component, reference) {
            ResolvedReference::Resolved { id, strategy } => {
                match strategy {
                    ResolutionStrategy::IntraNamespace => out.report.intra_namespace += 1,
                    ResolutionStrategy::Qualified => out.report.qualified += 1,
                    ResolutionStrategy::CrossNamespace => out.report.cross_namespace += 1,
                }
                out.resolved.insert(id);
            }
            ResolvedReference::SelfReference => out.report.self_references += 1,
            ResolvedReference::Unresolved(reason) => {
                match &reason {
                    UnresolvedReason::NoMatch => out.report.unresolved_no_match += 1,
                    UnresolvedReason::Ambiguous { candidates } => {
                        out.report.unresolved_ambiguous += 1;
                        debug!(
                            component = %component.id,
                            reference,
                            candidates = ?candidates,
                            "ambiguous cross-namespace reference left unresolved"
                        );
                    }
                }
                out.unresolved.push(UnresolvedReference {
                    reference: raw.clone(),
                    reason,
                });
            }
        }
    }
    out
}

/// Resolve a single reference as if it appeared on `owner`.
///
/// Exposed for callers that need to resolve references that did not come from
/// the analyzer (for example user queries) with the same rules.
pub fn resolve_reference(
    table: &ComponentTable,
    owner_id: &str,
    reference: &str,
) -> Option<ResolvedReference> {
    let owner = table.get(owner_id)?;
    let index = KeyIndex::build(table.components());
    Some(resolve_one(&index, owner, reference.trim()))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Resolve every raw reference in the builder and freeze the table.
pub fn resolve_references(builder: TableBuilder) -> (ComponentTable, ResolutionReport) {
    let TableBuilder {
        namespaces,
        mut components,
        ..
    } = builder;

    let results: Vec<ComponentResolution> = {
        let index = KeyIndex::build(&components);
        let work: Vec<&Component> = components.values().collect();
        work.par_iter()
            .map(|component| resolve_component(&index, component))
            .collect()
    };

    let mut report = ResolutionReport {
        components: components.len(),
        ..ResolutionReport::default()
    };
    for (component, result) in components.values_mut().zip(results) {
        report.merge(&result.report);
        component.resolved_dependencies = result.resolved;
        component.unresolved_references = result.unresolved;
    }

    info!(
        components = report.components,
        references = report.references,
        resolved = report.resolved(),
        cross_namespace = report.cross_namespace,
        unresolved_no_match = report.unresolved_no_match,
        unresolved_ambiguous = report.unresolved_ambiguous,
        "reference resolution complete"
    );
    (ComponentTable::from_parts(namespaces, components), report)
}
