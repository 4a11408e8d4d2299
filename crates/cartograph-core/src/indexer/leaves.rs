//! Leaf selection: which components are eligible clustering candidates.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::models::{Component, ComponentTable, ID_SEPARATOR};

/// Kind added when a table has none of the configured kinds.
pub const FALLBACK_KIND: &str = "function";

static WELL_FORMED_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s\p{Cc}]+$").unwrap());

/// Whether a local id is fit to be a clustering candidate.
///
/// Rejects empty ids, whitespace or control characters, empty dot-segments
/// (`a..b`, `.a`) and any segment that equals an error marker.
pub fn is_well_formed_local_id(local_id: &str, error_markers: &[String]) -> bool {
    if local_id.is_empty() {
        return false;
    }
    local_id.split(ID_SEPARATOR).all(|segment| {
        WELL_FORMED_SEGMENT_RE.is_match(segment)
            && !error_markers
                .iter()
                .any(|marker| segment.eq_ignore_ascii_case(marker))
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeafReport {
    pub considered: usize,
    pub selected: usize,
    pub ineligible_kind: usize,
    pub unknown_id: usize,
    pub malformed_id: usize,
    pub kinds_used: Vec<String>,
    pub function_fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeafSelection {
    pub leaves: Vec<String>,
    pub report: LeafReport,
}

#[derive(Debug, Clone)]
pub struct LeafFilter {
    eligible_kinds: Vec<String>,
    error_markers: Vec<String>,
}

impl LeafFilter {
    pub fn new(eligible_kinds: Vec<String>, error_markers: Vec<String>) -> Self {
        Self {
            eligible_kinds: eligible_kinds.iter().map(|k| k.to_lowercase()).collect(),
            error_markers: error_markers.iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.eligible_kinds.clone(), config.error_markers.clone())
    }

    fn effective_kinds(&self, table: &ComponentTable) -> (HashSet<String>, bool) {
        let mut kinds: HashSet<String> = self.eligible_kinds.iter().cloned().collect();
        let any_present = table
            .iter()
            .any(|c| kinds.contains(&c.kind.to_lowercase()));
        if !any_present && !kinds.contains(FALLBACK_KIND) {
            kinds.insert(FALLBACK_KIND.to_string());
            return (kinds, true);
        }
        (kinds, false)
    }

    fn admits(&self, kinds: &HashSet<String>, component: &Component, report: &mut LeafReport) -> bool {
        if !kinds.contains(&component.kind.to_lowercase()) {
            report.ineligible_kind += 1;
            return false;
        }
        if !is_well_formed_local_id(&component.short_id, &self.error_markers) {
            report.malformed_id += 1;
            warn!(id = %component.id, "malformed local id excluded from leaves");
            return false;
        }
        true
    }

    /// Select leaves from the whole table, in table order.
    pub fn select(&self, table: &ComponentTable) -> LeafSelection {
        let (kinds, function_fallback) = self.effective_kinds(table);
        let mut report = LeafReport {
            function_fallback,
            ..LeafReport::default()
        };
        let mut leaves = Vec::new();
        for component in table.iter() {
            report.considered += 1;
            if self.admits(&kinds, component, &mut report) {
                leaves.push(component.id.clone());
            }
        }
        self.finish(kinds, leaves, report)
    }

    /// Filter an explicit candidate list, keeping caller order.
    pub fn select_from(&self, table: &ComponentTable, candidates: &[String]) -> LeafSelection {
        let (kinds, function_fallback) = self.effective_kinds(table);
        let mut report = LeafReport {
            function_fallback,
            ..LeafReport::default()
        };
        let mut seen: HashSet<&str> = HashSet::new();
        let mut leaves = Vec::new();
        for id in candidates {
            report.considered += 1;
            let Some(component) = table.get(id) else {
                report.unknown_id += 1;
                warn!(id = %id, "candidate is not a table key; excluded");
                continue;
            };
            if !seen.insert(id.as_str()) {
                continue;
            }
            if self.admits(&kinds, component, &mut report) {
                leaves.push(id.clone());
            }
        }
        self.finish(kinds, leaves, report)
    }

    fn finish(
        &self,
        kinds: HashSet<String>,
        leaves: Vec<String>,
        mut report: LeafReport,
    ) -> LeafSelection {
        report.selected = leaves.len();
        let mut kinds_used: Vec<String> = kinds.into_iter().collect();
        kinds_used.sort();
        report.kinds_used = kinds_used;
        if report.function_fallback {
            info!("no class-like components found; functions admitted as leaves");
        }
        info!(
            considered = report.considered,
            selected = report.selected,
            ineligible_kind = report.ineligible_kind,
            unknown_id = report.unknown_id,
            malformed_id = report.malformed_id,
            "leaf selection complete"
        );
        LeafSelection { leaves, report }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceCollisionPolicy;
    use crate::indexer::namespace::TableBuilder;
    use crate::models::{RawComponentRecord, SourceRoot};

    fn markers() -> Vec<String> {
        EngineConfig::default().error_markers
    }

    fn table(records: Vec<RawComponentRecord>) -> ComponentTable {
        TableBuilder::assign(
            vec![SourceRoot::new("/w/main", records)],
            NamespaceCollisionPolicy::Disambiguate,
        )
        .unwrap()
        .into_unresolved_table()
    }

    #[test]
    fn test_well_formed_local_ids() {
        let markers = markers();
        assert!(is_well_formed_local_id("svc.Login", &markers));
        assert!(is_well_formed_local_id("ErrorHandler", &markers));
        assert!(!is_well_formed_local_id("", &markers));
        assert!(!is_well_formed_local_id("svc..Login", &markers));
        assert!(!is_well_formed_local_id("svc.Lo gin", &markers));
        assert!(!is_well_formed_local_id("svc.\u{7}", &markers));
        assert!(!is_well_formed_local_id("parse.ERROR", &markers));
    }

    #[test]
    fn test_select_filters_by_kind_in_table_order() {
        let table = table(vec![
            RawComponentRecord::new("B", "B", "class", "b.py"),
            RawComponentRecord::new("helper", "helper", "function", "b.py"),
            RawComponentRecord::new("A", "A", "Interface", "a.py"),
        ]);
        let selection = LeafFilter::from_config(&EngineConfig::default()).select(&table);
        assert_eq!(selection.leaves, vec!["main.B", "main.A"]);
        assert_eq!(selection.report.ineligible_kind, 1);
        assert!(!selection.report.function_fallback);
    }

    #[test]
    fn test_function_fallback_when_no_class_like_kinds() {
        let table = table(vec![
            RawComponentRecord::new("parse", "parse", "function", "p.c"),
            RawComponentRecord::new("MAX", "MAX", "macro", "p.h"),
        ]);
        let selection = LeafFilter::from_config(&EngineConfig::default()).select(&table);
        assert_eq!(selection.leaves, vec!["main.parse"]);
        assert!(selection.report.function_fallback);
        assert!(selection.report.kinds_used.contains(&"function".to_string()));
    }

    #[test]
    fn test_select_from_counts_unknown_and_malformed() {
        let table = table(vec![
            RawComponentRecord::new("A", "A", "class", "a.py"),
            RawComponentRecord::new("x.invalid", "invalid", "class", "a.py"),
        ]);
        let candidates = vec![
            "main.A".to_string(),
            "main.Ghost".to_string(),
            "main.x.invalid".to_string(),
        ];
        let selection =
            LeafFilter::from_config(&EngineConfig::default()).select_from(&table, &candidates);
        assert_eq!(selection.leaves, vec!["main.A"]);
        assert_eq!(selection.report.unknown_id, 1);
        assert_eq!(selection.report.malformed_id, 1);
        assert_eq!(selection.report.considered, 3);
    }
}
