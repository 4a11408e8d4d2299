//! The module tree produced by a clustering run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::ContractViolation;
use crate::models::ComponentTable;

/// Separator between module names in a module path (`root/auth/session`).
pub const PATH_SEPARATOR: char = '/';

pub const ROOT_NAME: &str = "root";

/// Why a node ended up where it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    UnderBudget,
    BelowMinSize,
    MaxDepth,
    NoUsefulSplit,
    ContractViolation { violation: ContractViolation },
    Cancelled,
    Split,
}

impl NodeOutcome {
    pub fn is_split(&self) -> bool {
        matches!(self, Self::Split)
    }

    /// Terminal for a reason other than fitting the budget.
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::Split | Self::UnderBudget)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub name: String,
    /// Slash-joined names from the root, e.g. `root/auth`.
    pub path: String,
    /// Source path the oracle suggested for this module, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_path: Option<String>,
    pub depth: usize,
    pub estimated_tokens: usize,
    /// Ids held directly by this node; a split node keeps only retained
    /// orphans here.
    pub members: Vec<String>,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
    #[serde(default)]
    pub children: Vec<ModuleNode>,
}

impl ModuleNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn to_json_entry(&self) -> Value {
        let mut children = Map::new();
        for child in &self.children {
            children.insert(child.name.clone(), child.to_json_entry());
        }
        json!({
            "path": self.oracle_path.clone().unwrap_or_default(),
            "components": self.members,
            "children": Value::Object(children),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    pub split: usize,
    pub forced_terminal: usize,
    pub members: usize,
    pub max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTree {
    pub root: ModuleNode,
    pub stats: TreeStats,
}

/// What a downstream narrative generator needs for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDigest {
    pub path: String,
    pub name: String,
    pub depth: usize,
    pub members: Vec<String>,
    pub source_text: String,
}

/// Depth-first, pre-order iterator over a module tree.
pub struct Iter<'a> {
    stack: Vec<&'a ModuleNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ModuleNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

impl ModuleTree {
    pub fn new(root: ModuleNode) -> Self {
        let mut tree = Self {
            root,
            stats: TreeStats::default(),
        };
        tree.stats = tree.compute_stats();
        tree
    }

    fn compute_stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        for node in self.iter() {
            stats.nodes += 1;
            stats.members += node.members.len();
            stats.max_depth = stats.max_depth.max(node.depth);
            if node.is_leaf() {
                stats.leaves += 1;
            }
            if node.outcome.is_split() {
                stats.split += 1;
            } else if node.outcome.is_forced() {
                stats.forced_terminal += 1;
            }
        }
        stats
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: vec![&self.root],
        }
    }

    /// Look a node up by its slash-joined path.
    pub fn find(&self, path: &str) -> Option<&ModuleNode> {
        let mut parts = path.split(PATH_SEPARATOR).filter(|p| !p.is_empty());
        if parts.next()? != self.root.name {
            return None;
        }
        let mut node = &self.root;
        for part in parts {
            node = node.children.iter().find(|c| c.name == part)?;
        }
        Some(node)
    }

    /// Every member id in the tree, depth-first.
    pub fn all_member_ids(&self) -> Vec<String> {
        self.iter()
            .flat_map(|node| node.members.iter().cloned())
            .collect()
    }

    /// Nodes that hold members, with only ids the table knows and the
    /// concatenated source text of those ids.
    pub fn documentable_modules(&self, table: &ComponentTable) -> Vec<ModuleDigest> {
        let mut seen: HashSet<&str> = HashSet::new();
        self.iter()
            .filter_map(|node| {
                let members: Vec<String> = node
                    .members
                    .iter()
                    .filter(|id| table.contains(id) && seen.insert(id.as_str()))
                    .cloned()
                    .collect();
                if members.is_empty() {
                    return None;
                }
                let source_text = members
                    .iter()
                    .filter_map(|id| table.get(id))
                    .map(|c| c.source_text.as_str())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Some(ModuleDigest {
                    path: node.path.clone(),
                    name: node.name.clone(),
                    depth: node.depth,
                    members,
                    source_text,
                })
            })
            .collect()
    }

    /// Nested `{name: {path, components, children}}` rendering.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert(self.root.name.clone(), self.root.to_json_entry());
        Value::Object(out)
    }
}
