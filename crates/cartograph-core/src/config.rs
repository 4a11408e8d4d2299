//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document is a valid config.
//! [`EngineConfig::normalized`] applies the limits in [`crate::guards`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{CartographError, CartographResult};
use crate::guards::{
    clamp_budget, clamp_concurrency, clamp_depth, clamp_timeout_ms, MAX_ORACLE_RETRIES,
    MIN_SPLITTABLE_MEMBERS,
};

pub const DEFAULT_MAX_TOKENS_PER_MODULE: usize = 36_369;
pub const DEFAULT_MAX_DEPTH: usize = 2;
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 120_000;

/// How the grouping oracle refers to candidate components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    /// Members are integers into a dense candidate index.
    Index,
    /// Members are free-form names reconciled against canonical ids.
    #[default]
    Name,
}

/// What happens to members of a split node that no child group claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    #[default]
    RetainAtParent,
    Drop,
}

/// What happens when two source roots derive the same namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceCollisionPolicy {
    /// Both roots share the namespace; later ids overwrite earlier ones.
    LastWriteWins,
    /// Later roots get `name_2`, `name_3`, ...
    #[default]
    Disambiguate,
    /// Refuse to build the table.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_tokens_per_module: usize,
    pub max_depth: usize,
    pub min_splittable_members: usize,
    pub min_child_groups: usize,
    pub mode: OracleMode,
    pub orphan_policy: OrphanPolicy,
    pub collision_policy: NamespaceCollisionPolicy,
    pub eligible_kinds: Vec<String>,
    pub error_markers: Vec<String>,
    pub strip_prefixes: Vec<String>,
    pub oracle_timeout_ms: u64,
    pub max_retries: usize,
    pub max_concurrency: usize,
    pub include_source_in_request: bool,
    pub strict_validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_module: DEFAULT_MAX_TOKENS_PER_MODULE,
            max_depth: DEFAULT_MAX_DEPTH,
            min_splittable_members: MIN_SPLITTABLE_MEMBERS,
            min_child_groups: 2,
            mode: OracleMode::default(),
            orphan_policy: OrphanPolicy::default(),
            collision_policy: NamespaceCollisionPolicy::default(),
            eligible_kinds: ["class", "interface", "struct"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            error_markers: ["error", "exception", "failed", "invalid"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            strip_prefixes: vec!["deps.".to_string()],
            oracle_timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            max_retries: 1,
            max_concurrency: 4,
            include_source_in_request: true,
            strict_validation: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> CartographResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| CartographError::Config(format!("invalid engine config: {e}")))?;
        Ok(config.normalized())
    }

    pub fn from_json_file(path: &Path) -> CartographResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Return a copy with every field inside its guardrail.
    pub fn normalized(mut self) -> Self {
        let budget = clamp_budget(self.max_tokens_per_module);
        if budget != self.max_tokens_per_module {
            warn!(
                requested = self.max_tokens_per_module,
                applied = budget,
                "max_tokens_per_module clamped"
            );
            self.max_tokens_per_module = budget;
        }

        let depth = clamp_depth(self.max_depth);
        if depth != self.max_depth {
            warn!(requested = self.max_depth, applied = depth, "max_depth clamped");
            self.max_depth = depth;
        }

        if self.min_splittable_members < MIN_SPLITTABLE_MEMBERS {
            warn!(
                requested = self.min_splittable_members,
                applied = MIN_SPLITTABLE_MEMBERS,
                "min_splittable_members raised"
            );
            self.min_splittable_members = MIN_SPLITTABLE_MEMBERS;
        }

        self.min_child_groups = self.min_child_groups.max(1);

        let timeout = clamp_timeout_ms(self.oracle_timeout_ms);
        if timeout != self.oracle_timeout_ms {
            warn!(
                requested = self.oracle_timeout_ms,
                applied = timeout,
                "oracle_timeout_ms clamped"
            );
            self.oracle_timeout_ms = timeout;
        }

        if self.max_retries > MAX_ORACLE_RETRIES {
            warn!(
                requested = self.max_retries,
                applied = MAX_ORACLE_RETRIES,
                "max_retries clamped"
            );
            self.max_retries = MAX_ORACLE_RETRIES;
        }

        self.max_concurrency = clamp_concurrency(self.max_concurrency);

        self.eligible_kinds = self
            .eligible_kinds
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self.error_markers = self
            .error_markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        self.strip_prefixes.retain(|p| !p.is_empty());
        self
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}
