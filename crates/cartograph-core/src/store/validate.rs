//! Integrity checks over a finished component table.
//!
//! Every check logs what it found and returns a report. With `strict` set, a
//! failed check becomes [`CartographError::Validation`] instead.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::{CartographError, CartographResult};
use crate::guards::{bounded, MAX_LOGGED_ITEMS};
use crate::models::ComponentTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletenessReport {
    pub components: usize,
    pub edges: usize,
    /// `(from, to)` pairs whose target is not a table key.
    pub dangling_edges: Vec<(String, String)>,
    /// Keys whose component carries a different id.
    pub key_mismatches: Vec<String>,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.dangling_edges.is_empty() && self.key_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateReport {
    pub requested: usize,
    pub found: usize,
    pub missing: Vec<String>,
}

/// Check that every dependency edge lands on a table key and every key
/// matches its component's id.
pub fn graph_completeness(table: &ComponentTable, strict: bool) -> CartographResult<CompletenessReport> {
    let mut report = CompletenessReport {
        components: table.len(),
        ..CompletenessReport::default()
    };

    for (key, component) in table.components() {
        if key != &component.id {
            report.key_mismatches.push(key.clone());
        }
        for dependency in &component.resolved_dependencies {
            report.edges += 1;
            if !table.contains(dependency) {
                report.dangling_edges.push((component.id.clone(), dependency.clone()));
            }
        }
    }

    if report.is_complete() {
        info!(
            components = report.components,
            edges = report.edges,
            "component graph is complete"
        );
        return Ok(report);
    }

    warn!(
        dangling_edges = report.dangling_edges.len(),
        key_mismatches = report.key_mismatches.len(),
        sample = ?bounded(&report.dangling_edges, MAX_LOGGED_ITEMS),
        "component graph is incomplete"
    );
    if strict {
        return Err(CartographError::Validation(format!(
            "{} dangling edges, {} key mismatches",
            report.dangling_edges.len(),
            report.key_mismatches.len()
        )));
    }
    Ok(report)
}

/// Check a candidate list against the table before clustering.
pub fn candidates_exist(
    table: &ComponentTable,
    candidates: &[String],
    strict: bool,
) -> CartographResult<CandidateReport> {
    let missing: Vec<String> = candidates
        .iter()
        .filter(|id| !table.contains(id))
        .cloned()
        .collect();
    let report = CandidateReport {
        requested: candidates.len(),
        found: candidates.len() - missing.len(),
        missing,
    };

    if report.missing.is_empty() {
        return Ok(report);
    }
    warn!(
        missing = report.missing.len(),
        requested = report.requested,
        sample = ?bounded(&report.missing, MAX_LOGGED_ITEMS),
        "clustering candidates missing from the component table"
    );
    if strict {
        return Err(CartographError::Validation(format!(
            "{} of {} candidates are not in the component table",
            report.missing.len(),
            report.requested
        )));
    }
    Ok(report)
}

/// SHA-256 over the sorted `id -> sorted dependencies` structure.
///
/// Two runs over the same input must produce the same fingerprint.
pub fn fingerprint(table: &ComponentTable) -> String {
    let graph: BTreeMap<&str, Vec<&str>> = table
        .iter()
        .map(|c| {
            (
                c.id.as_str(),
                c.resolved_dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    // BTreeMap keys and BTreeSet-backed values serialize in sorted order
    let encoded = serde_json::to_string(&graph).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    format!("{:x}", hasher.finalize())
}
