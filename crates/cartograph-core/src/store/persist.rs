//! JSON persistence for component tables and module trees.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clustering::tree::ModuleTree;
use crate::errors::{CartographError, CartographResult};
use crate::models::{Component, ComponentTable, Namespace};

pub const TABLE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct TableDocumentRef<'a> {
    version: u32,
    namespaces: &'a [Namespace],
    components: &'a IndexMap<String, Component>,
}

#[derive(Deserialize)]
struct TableDocument {
    version: u32,
    #[serde(default)]
    namespaces: Vec<Namespace>,
    components: IndexMap<String, Component>,
}

pub fn to_json_string(table: &ComponentTable) -> CartographResult<String> {
    let document = TableDocumentRef {
        version: TABLE_FORMAT_VERSION,
        namespaces: table.namespaces(),
        components: table.components(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

pub fn from_json_str(raw: &str) -> CartographResult<ComponentTable> {
    let document: TableDocument = serde_json::from_str(raw)?;
    if document.version != TABLE_FORMAT_VERSION {
        return Err(CartographError::Validation(format!(
            "unsupported table format version {} (expected {TABLE_FORMAT_VERSION})",
            document.version
        )));
    }
    if let Some((key, component)) = document
        .components
        .iter()
        .find(|(key, component)| **key != component.id)
    {
        return Err(CartographError::Validation(format!(
            "table key '{key}' does not match component id '{}'",
            component.id
        )));
    }
    Ok(ComponentTable::from_parts(
        document.namespaces,
        document.components,
    ))
}

pub fn save_table(table: &ComponentTable, path: &Path) -> CartographResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, to_json_string(table)?)?;
    info!(path = %path.display(), components = table.len(), "component table saved");
    Ok(())
}

pub fn load_table(path: &Path) -> CartographResult<ComponentTable> {
    let raw = fs::read_to_string(path)?;
    let table = from_json_str(&raw)?;
    info!(path = %path.display(), components = table.len(), "component table loaded");
    Ok(table)
}

/// Write the nested `{name: {path, components, children}}` rendering.
pub fn save_module_tree(tree: &ModuleTree, path: &Path) -> CartographResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&tree.to_json())?)?;
    info!(path = %path.display(), nodes = tree.stats.nodes, "module tree saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceCollisionPolicy;
    use crate::indexer::namespace::TableBuilder;
    use crate::indexer::resolver::{resolve_reference, resolve_references, ResolvedReference};
    use crate::models::{RawComponentRecord, SourceRoot};
    use crate::store::validate::fingerprint;

    fn table() -> ComponentTable {
        let builder = TableBuilder::assign(
            vec![
                SourceRoot::new(
                    "/w/main",
                    vec![
                        RawComponentRecord::new("app.Handler", "Handler", "class", "app.py")
                            .with_source("class Handler: ...")
                            .with_references(&["Login", "Session", "Missing"]),
                        RawComponentRecord::new("Session", "Session", "class", "session.py"),
                    ],
                ),
                SourceRoot::new(
                    "/w/libs",
                    vec![RawComponentRecord::new("svc.Login", "Login", "class", "svc.py")],
                ),
            ],
            NamespaceCollisionPolicy::Disambiguate,
        )
        .unwrap();
        resolve_references(builder).0
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("table.json");
        let original = table();
        save_table(&original, &path).unwrap();
        let loaded = load_table(&path).unwrap();

        assert_eq!(loaded, original);
        assert_eq!(fingerprint(&loaded), fingerprint(&original));
        let ids: Vec<&str> = loaded.ids().collect();
        assert_eq!(ids, vec!["main.app.Handler", "main.Session", "libs.svc.Login"]);
        assert_eq!(
            resolve_reference(&loaded, "main.app.Handler", "Login"),
            resolve_reference(&original, "main.app.Handler", "Login")
        );
        assert!(matches!(
            resolve_reference(&loaded, "main.app.Handler", "Login"),
            Some(ResolvedReference::Resolved { .. })
        ));
    }

    #[test]
    fn test_persisted_dependencies_are_sorted() {
        let raw = to_json_string(&table()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let deps = value["components"]["main.app.Handler"]["resolved_dependencies"]
            .as_array()
            .unwrap();
        assert_eq!(deps[0], "libs.svc.Login");
        assert_eq!(deps[1], "main.Session");
        assert_eq!(value["version"], TABLE_FORMAT_VERSION);
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let raw = to_json_string(&table())
            .unwrap()
            .replacen("\"main.Session\": {", "\"main.Other\": {", 1);
        assert!(matches!(
            from_json_str(&raw),
            Err(CartographError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let raw = r#"{"version": 99, "components": {}}"#;
        assert!(matches!(
            from_json_str(raw),
            Err(CartographError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_table(&dir.path().join("absent.json")),
            Err(CartographError::Io(_))
        ));
    }

    #[test]
    fn test_save_module_tree() {
        use crate::clustering::tree::{ModuleNode, NodeOutcome};

        let tree = ModuleTree::new(ModuleNode {
            name: "root".to_string(),
            path: "root".to_string(),
            oracle_path: None,
            depth: 0,
            estimated_tokens: 3,
            members: vec!["main.Session".to_string()],
            outcome: NodeOutcome::UnderBudget,
            children: Vec::new(),
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module_tree.json");
        save_module_tree(&tree, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["root"]["components"][0], "main.Session");
    }
}
