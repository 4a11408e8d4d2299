//! Namespace assignment: merges per-root analyzer output into one
//! identifier-keyed component set.
//!
//! Every root contributes one namespace derived from its final path segment,
//! and every record becomes `namespace.local_id`. Root 0 is the primary root;
//! all others are external. The result is a [`TableBuilder`]; dependency sets
//! are filled in by [`crate::indexer::resolver::resolve_references`], which
//! turns the builder into the read-only [`ComponentTable`].

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NamespaceCollisionPolicy;
use crate::errors::{CartographError, CartographResult};
use crate::models::{make_id, Component, ComponentTable, Namespace, SourceRoot, ID_SEPARATOR};

/// Namespace used when a root path has no usable final segment (`/`, `.`).
pub const FALLBACK_NAMESPACE: &str = "root";

// ---------------------------------------------------------------------------
// Namespace derivation
// ---------------------------------------------------------------------------

/// Derive the namespace token for a source root.
///
/// The id separator may not appear inside a namespace, so `.` is replaced
/// with `_` (`my.lib` -> `my_lib`).
pub fn namespace_for_root(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    let sanitized: String = base
        .chars()
        .map(|c| if c == ID_SEPARATOR { '_' } else { c })
        .collect();
    if sanitized.is_empty() {
        FALLBACK_NAMESPACE.to_string()
    } else {
        sanitized
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentReport {
    pub roots: usize,
    pub empty_roots: usize,
    pub components: usize,
    pub skipped_empty_ids: usize,
    pub duplicate_local_ids: usize,
    pub namespace_collisions: usize,
    pub overwritten_ids: usize,
}

// ---------------------------------------------------------------------------
// TableBuilder
// ---------------------------------------------------------------------------

/// Components with canonical ids but no resolved dependencies yet.
#[derive(Debug, Clone, Default)]
pub struct TableBuilder {
    pub(crate) namespaces: Vec<Namespace>,
    pub(crate) components: IndexMap<String, Component>,
    pub(crate) report: AssignmentReport,
}

impl TableBuilder {
    /// Assign namespaces to an ordered list of roots and mint canonical ids.
    pub fn assign(
        roots: Vec<SourceRoot>,
        policy: NamespaceCollisionPolicy,
    ) -> CartographResult<Self> {
        let mut builder = Self::default();
        builder.report.roots = roots.len();
        info!(roots = roots.len(), ?policy, "assigning namespaces");

        for (index, root) in roots.into_iter().enumerate() {
            let is_external = index > 0;
            let namespace = builder.register_namespace(&root.path, is_external, policy)?;
            builder.ingest_root(&namespace, is_external, root);
        }

        info!(
            components = builder.components.len(),
            namespaces = builder.namespaces.len(),
            empty_roots = builder.report.empty_roots,
            collisions = builder.report.namespace_collisions,
            "namespace assignment complete"
        );
        builder.report.components = builder.components.len();
        Ok(builder)
    }

    pub fn report(&self) -> &AssignmentReport {
        &self.report
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    /// Finish without running reference resolution.
    ///
    /// Every raw reference is recorded as unresolved; mostly useful for tests
    /// and for callers that do their own dependency analysis.
    pub fn into_unresolved_table(self) -> ComponentTable {
        ComponentTable::from_parts(self.namespaces, self.components)
    }

    fn register_namespace(
        &mut self,
        root_path: &Path,
        is_external: bool,
        policy: NamespaceCollisionPolicy,
    ) -> CartographResult<String> {
        let base = namespace_for_root(root_path);
        let existing = self.namespaces.iter().position(|ns| ns.name == base);

        let Some(existing) = existing else {
            self.namespaces.push(Namespace {
                name: base.clone(),
                roots: vec![root_path.to_path_buf()],
                is_external,
                component_count: 0,
            });
            return Ok(base);
        };

        self.report.namespace_collisions += 1;
        match policy {
            NamespaceCollisionPolicy::Reject => Err(CartographError::NamespaceCollision {
                namespace: base,
                first: self.namespaces[existing]
                    .roots
                    .first()
                    .cloned()
                    .unwrap_or_default(),
                second: root_path.to_path_buf(),
            }),
            NamespaceCollisionPolicy::LastWriteWins => {
                warn!(
                    namespace = %base,
                    root = %root_path.display(),
                    "namespace collision: roots share a namespace, later ids overwrite earlier ones"
                );
                self.namespaces[existing].roots.push(root_path.to_path_buf());
                Ok(base)
            }
            NamespaceCollisionPolicy::Disambiguate => {
                let taken: HashSet<&str> =
                    self.namespaces.iter().map(|ns| ns.name.as_str()).collect();
                let mut suffix = 2usize;
                let mut candidate = format!("{base}_{suffix}");
                while taken.contains(candidate.as_str()) {
                    suffix += 1;
                    candidate = format!("{base}_{suffix}");
                }
                warn!(
                    namespace = %base,
                    assigned = %candidate,
                    root = %root_path.display(),
                    "namespace collision: disambiguated"
                );
                self.namespaces.push(Namespace {
                    name: candidate.clone(),
                    roots: vec![root_path.to_path_buf()],
                    is_external,
                    component_count: 0,
                });
                Ok(candidate)
            }
        }
    }

    fn ingest_root(&mut self, namespace: &str, is_external: bool, root: SourceRoot) {
        if root.records.is_empty() {
            self.report.empty_roots += 1;
            warn!(
                namespace,
                root = %root.path.display(),
                "source root produced no components; namespace registered anyway"
            );
            return;
        }

        let mut seen_local: HashSet<String> = HashSet::new();
        let mut added = 0usize;

        for record in root.records {
            let local_id = record.local_id.trim();
            if local_id.is_empty() {
                self.report.skipped_empty_ids += 1;
                debug!(namespace, name = %record.name, "skipping record with empty local id");
                continue;
            }
            if !seen_local.insert(local_id.to_string()) {
                self.report.duplicate_local_ids += 1;
                debug!(namespace, local_id, "duplicate local id within root; keeping first");
                continue;
            }

            let id = make_id(namespace, local_id);
            let component = Component::from_record(namespace, is_external, record);
            if self.components.insert(id.clone(), component).is_some() {
                self.report.overwritten_ids += 1;
                warn!(id = %id, "id minted by an earlier root was overwritten");
            } else {
                added += 1;
            }
        }

        if let Some(ns) = self.namespaces.iter_mut().find(|ns| ns.name == namespace) {
            ns.component_count += added;
        }
        info!(namespace, components = added, external = is_external, "root ingested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawComponentRecord;

    fn record(local_id: &str) -> RawComponentRecord {
        let name = local_id.rsplit('.').next().unwrap_or(local_id);
        RawComponentRecord::new(local_id, name, "class", "src/file.py")
    }

    #[test]
    fn test_namespace_for_root_uses_basename() {
        assert_eq!(namespace_for_root(Path::new("/work/main")), "main");
        assert_eq!(namespace_for_root(Path::new("/work/libs/")), "libs");
        assert_eq!(namespace_for_root(Path::new("/work/my.lib")), "my_lib");
        assert_eq!(namespace_for_root(Path::new("/")), FALLBACK_NAMESPACE);
    }

    #[test]
    fn test_same_local_id_in_two_roots_does_not_collide() {
        let roots = vec![
            SourceRoot::new("/work/main", vec![record("svc.Login")]),
            SourceRoot::new("/work/libs", vec![record("svc.Login")]),
        ];
        let builder = TableBuilder::assign(roots, NamespaceCollisionPolicy::Disambiguate).unwrap();
        assert_eq!(builder.len(), 2);
        assert!(builder.contains("main.svc.Login"));
        assert!(builder.contains("libs.svc.Login"));

        let table = builder.into_unresolved_table();
        assert!(!table.get("main.svc.Login").unwrap().is_external);
        assert!(table.get("libs.svc.Login").unwrap().is_external);
        assert_eq!(table.get("libs.svc.Login").unwrap().short_id, "svc.Login");
    }

    #[test]
    fn test_keys_unique_across_many_roots() {
        let roots: Vec<SourceRoot> = (0..6)
            .map(|i| {
                SourceRoot::new(
                    format!("/repos/r{i}"),
                    vec![record("a.A"), record("a.B"), record("A")],
                )
            })
            .collect();
        let table = TableBuilder::assign(roots, NamespaceCollisionPolicy::Disambiguate)
            .unwrap()
            .into_unresolved_table();
        let ids: HashSet<&str> = table.ids().collect();
        assert_eq!(ids.len(), 18);
        assert_eq!(table.len(), 18);
    }

    #[test]
    fn test_empty_root_still_registers_namespace() {
        let roots = vec![
            SourceRoot::new("/work/main", vec![record("A")]),
            SourceRoot::new("/work/empty", vec![]),
        ];
        let builder = TableBuilder::assign(roots, NamespaceCollisionPolicy::Disambiguate).unwrap();
        assert_eq!(builder.report().empty_roots, 1);
        let names: Vec<&str> = builder.namespaces().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["main", "empty"]);
        assert_eq!(builder.namespaces()[1].component_count, 0);
    }

    #[test]
    fn test_collision_disambiguates_by_default() {
        let roots = vec![
            SourceRoot::new("/a/shared", vec![record("X")]),
            SourceRoot::new("/b/shared", vec![record("X")]),
            SourceRoot::new("/c/shared", vec![record("X")]),
        ];
        let builder = TableBuilder::assign(roots, NamespaceCollisionPolicy::Disambiguate).unwrap();
        assert!(builder.contains("shared.X"));
        assert!(builder.contains("shared_2.X"));
        assert!(builder.contains("shared_3.X"));
        assert_eq!(builder.report().namespace_collisions, 2);
    }

    #[test]
    fn test_collision_last_write_wins() {
        let first = record("X").with_source("first");
        let second = record("X").with_source("second");
        let roots = vec![
            SourceRoot::new("/a/shared", vec![first]),
            SourceRoot::new("/b/shared", vec![second]),
        ];
        let builder = TableBuilder::assign(roots, NamespaceCollisionPolicy::LastWriteWins).unwrap();
        assert_eq!(builder.len(), 1);
        assert_eq!(builder.report().overwritten_ids, 1);
        assert_eq!(builder.namespaces().len(), 1);
        assert_eq!(builder.namespaces()[0].roots.len(), 2);
        let table = builder.into_unresolved_table();
        assert_eq!(table.get("shared.X").unwrap().source_text, "second");
    }

    #[test]
    fn test_collision_reject() {
        let roots = vec![
            SourceRoot::new("/a/shared", vec![record("X")]),
            SourceRoot::new("/b/shared", vec![record("Y")]),
        ];
        let err = TableBuilder::assign(roots, NamespaceCollisionPolicy::Reject).unwrap_err();
        assert!(matches!(err, CartographError::NamespaceCollision { .. }));
    }

    #[test]
    fn test_empty_and_duplicate_local_ids_are_counted() {
        let roots = vec![SourceRoot::new(
            "/work/main",
            vec![record("A"), record("  "), record("A")],
        )];
        let builder = TableBuilder::assign(roots, NamespaceCollisionPolicy::Disambiguate).unwrap();
        assert_eq!(builder.len(), 1);
        assert_eq!(builder.report().skipped_empty_ids, 1);
        assert_eq!(builder.report().duplicate_local_ids, 1);
    }
}
