//! Identity reconciliation: mapping oracle tokens back to canonical ids.
//!
//! Index mode is all-or-nothing: one mistyped or out-of-range token rejects
//! the whole response. Name mode resolves token by token through a cascade of
//! match tiers; a token that no tier can place is reported, never guessed.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::clustering::oracle::{GroupingResponse, MemberToken};
use crate::errors::ContractViolation;
use crate::guards::{bounded, MAX_DIAGNOSTIC_CANDIDATES, MAX_LOGGED_ITEMS};
use crate::models::{final_segment, ComponentTable, ID_SEPARATOR};

/// Which tier placed a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Index,
    Exact,
    ShortName,
    StrippedExact,
    StrippedShortName,
    Suffix,
    ContextDisambiguated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMember {
    pub token: String,
    pub id: String,
    pub tier: MatchTier,
}

/// A token no tier could place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedToken {
    pub token: String,
    pub module_path: String,
    pub candidate_count: usize,
    pub near_misses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledGroup {
    pub name: String,
    pub path: Option<String>,
    pub members: Vec<ResolvedMember>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciledResponse {
    pub groups: Vec<ReconciledGroup>,
    pub unresolved: Vec<UnresolvedToken>,
}

impl ReconciledResponse {
    pub fn resolved_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    pub fn tier_counts(&self) -> HashMap<MatchTier, usize> {
        let mut counts = HashMap::new();
        for member in self.groups.iter().flat_map(|g| &g.members) {
            *counts.entry(member.tier).or_insert(0) += 1;
        }
        counts
    }
}

/// Where in the tree a response is being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub module_path: &'a str,
    /// Name of the module being split; `None` at the root.
    pub module_name: Option<&'a str>,
    pub candidate_count: usize,
}

// ---------------------------------------------------------------------------
// Index mode
// ---------------------------------------------------------------------------

/// Map integer tokens onto the node's dense candidate index.
pub fn reconcile_indices(
    response: &GroupingResponse,
    members: &[String],
    ctx: ReconcileContext<'_>,
) -> Result<ReconciledResponse, ContractViolation> {
    let max_index = members.len().saturating_sub(1);

    let mistyped: Vec<String> = response
        .groups
        .iter()
        .flat_map(|g| &g.members)
        .filter(|t| !matches!(t, MemberToken::Index(_)))
        .map(describe_token)
        .collect();
    if !mistyped.is_empty() {
        return Err(ContractViolation::NonIntegerIndex {
            module_path: ctx.module_path.to_string(),
            candidate_count: members.len(),
            max_index,
            tokens: mistyped,
        });
    }

    let out_of_range: Vec<String> = response
        .groups
        .iter()
        .flat_map(|g| &g.members)
        .filter_map(|t| match t {
            MemberToken::Index(i) if *i < 0 || *i as u64 >= members.len() as u64 => {
                Some(i.to_string())
            }
            _ => None,
        })
        .collect();
    if !out_of_range.is_empty() {
        return Err(ContractViolation::IndexOutOfRange {
            module_path: ctx.module_path.to_string(),
            candidate_count: members.len(),
            max_index,
            indices: out_of_range,
        });
    }

    let groups = response
        .groups
        .iter()
        .map(|group| ReconciledGroup {
            name: group.name.clone(),
            path: group.path.clone(),
            members: group
                .members
                .iter()
                .filter_map(|t| match t {
                    MemberToken::Index(i) => members.get(*i as usize).map(|id| ResolvedMember {
                        token: i.to_string(),
                        id: id.clone(),
                        tier: MatchTier::Index,
                    }),
                    _ => None,
                })
                .collect(),
        })
        .collect();
    let reconciled = ReconciledResponse {
        groups,
        unresolved: Vec::new(),
    };
    ensure_something_resolved(reconciled, response.token_count(), ctx)
}

/// Quote strings so `"0"` and `0` read differently in diagnostics.
fn describe_token(token: &MemberToken) -> String {
    match token {
        MemberToken::Name(s) => format!("{s:?}"),
        other => other.as_text(),
    }
}

fn ensure_something_resolved(
    reconciled: ReconciledResponse,
    token_count: usize,
    ctx: ReconcileContext<'_>,
) -> Result<ReconciledResponse, ContractViolation> {
    if token_count > 0 && reconciled.resolved_count() == 0 {
        return Err(ContractViolation::NothingResolved {
            module_path: ctx.module_path.to_string(),
            candidate_count: ctx.candidate_count,
            token_count,
        });
    }
    Ok(reconciled)
}

// ---------------------------------------------------------------------------
// Name mode
// ---------------------------------------------------------------------------

/// Name-mode resolver over one node's candidate set.
///
/// Lookups never leave that set, so a short name shared with a component in
/// another branch still resolves to the node's own member.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    universe: Vec<String>,
    universe_set: HashSet<String>,
    /// short id -> first-seen id
    short_names: HashMap<String, String>,
    short_name_collisions: usize,
    strip_prefixes: Vec<String>,
}

impl Reconciler {
    pub fn new(table: &ComponentTable, candidates: &[String], strip_prefixes: &[String]) -> Self {
        let mut reconciler = Self::default();

        for id in candidates {
            let Some(component) = table.get(id) else {
                continue;
            };
            if !reconciler.universe_set.insert(id.clone()) {
                continue;
            }
            reconciler.universe.push(id.clone());
            match reconciler.short_names.get(&component.short_id) {
                Some(existing) => {
                    reconciler.short_name_collisions += 1;
                    debug!(
                        short_id = %component.short_id,
                        kept = %existing,
                        ignored = %id,
                        "short name collision; first-seen id kept"
                    );
                }
                None => {
                    reconciler
                        .short_names
                        .insert(component.short_id.clone(), id.clone());
                }
            }
        }
        if reconciler.short_name_collisions > 0 {
            warn!(
                collisions = reconciler.short_name_collisions,
                "short names shared by several candidates; first-seen ids win"
            );
        }

        reconciler.strip_prefixes = strip_prefixes
            .iter()
            .filter(|prefix| {
                let bare = prefix.trim_end_matches(ID_SEPARATOR);
                let shadowed = table.is_namespace(bare);
                if shadowed {
                    debug!(prefix = %prefix, "prefix is a real namespace; never stripped");
                }
                !shadowed && !prefix.is_empty()
            })
            .cloned()
            .collect();
        reconciler
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub fn short_name_collisions(&self) -> usize {
        self.short_name_collisions
    }

    /// Resolve every token of a decoded response.
    pub fn reconcile(
        &self,
        response: &GroupingResponse,
        ctx: ReconcileContext<'_>,
    ) -> Result<ReconciledResponse, ContractViolation> {
        let mut reconciled = ReconciledResponse::default();
        for group in &response.groups {
            let mut members = Vec::with_capacity(group.members.len());
            for token in &group.members {
                let text = match token {
                    MemberToken::Garbage(raw) => {
                        reconciled.unresolved.push(UnresolvedToken {
                            token: raw.clone(),
                            module_path: ctx.module_path.to_string(),
                            candidate_count: ctx.candidate_count,
                            near_misses: Vec::new(),
                        });
                        continue;
                    }
                    other => other.as_text(),
                };
                match self.resolve_token(&text, ctx) {
                    Ok(member) => members.push(member),
                    Err(unresolved) => reconciled.unresolved.push(unresolved),
                }
            }
            reconciled.groups.push(ReconciledGroup {
                name: group.name.clone(),
                path: group.path.clone(),
                members,
            });
        }

        if !reconciled.unresolved.is_empty() {
            let sample: Vec<&str> = reconciled
                .unresolved
                .iter()
                .take(MAX_LOGGED_ITEMS)
                .map(|u| u.token.as_str())
                .collect();
            warn!(
                module = ctx.module_path,
                unresolved = reconciled.unresolved.len(),
                candidates = ctx.candidate_count,
                tokens = ?sample,
                "oracle tokens could not be reconciled; dropped"
            );
        }
        ensure_something_resolved(reconciled, response.token_count(), ctx)
    }

    /// Resolve one name token.
    pub fn resolve_token(
        &self,
        token: &str,
        ctx: ReconcileContext<'_>,
    ) -> Result<ResolvedMember, UnresolvedToken> {
        let token = token.trim();
        let resolved = |id: &str, tier: MatchTier| ResolvedMember {
            token: token.to_string(),
            id: id.to_string(),
            tier,
        };

        if self.universe_set.contains(token) {
            return Ok(resolved(token, MatchTier::Exact));
        }
        if let Some(id) = self.short_names.get(token) {
            return Ok(resolved(id.as_str(), MatchTier::ShortName));
        }

        let stripped = self
            .strip_prefixes
            .iter()
            .find_map(|prefix| token.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty());
        if let Some(rest) = stripped {
            if self.universe_set.contains(rest) {
                return Ok(resolved(rest, MatchTier::StrippedExact));
            }
            if let Some(id) = self.short_names.get(rest) {
                return Ok(resolved(id.as_str(), MatchTier::StrippedShortName));
            }
        }

        let probe = stripped.unwrap_or(token);
        let matches = self.suffix_matches(probe);
        match matches.as_slice() {
            [] => Err(self.unresolved(token, ctx, self.near_misses(probe))),
            [only] => Ok(resolved(*only, MatchTier::Suffix)),
            many => match ctx.module_name.and_then(|m| pick_by_context(probe, many, m)) {
                Some(winner) => {
                    debug!(
                        token,
                        module = ctx.module_path,
                        winner,
                        "ambiguous token settled by module context"
                    );
                    Ok(resolved(winner, MatchTier::ContextDisambiguated))
                }
                None => Err(self.unresolved(
                    token,
                    ctx,
                    many.iter().map(|id| id.to_string()).collect(),
                )),
            },
        }
    }

    fn suffix_matches(&self, probe: &str) -> Vec<&str> {
        let wanted: Vec<&str> = probe.split(ID_SEPARATOR).collect();
        if wanted.iter().any(|segment| segment.is_empty()) {
            return Vec::new();
        }
        self.universe
            .iter()
            .filter(|id| {
                let segments: Vec<&str> = id.split(ID_SEPARATOR).collect();
                segments.ends_with(&wanted)
            })
            .map(String::as_str)
            .collect()
    }

    fn near_misses(&self, probe: &str) -> Vec<String> {
        let wanted = final_segment(probe).to_lowercase();
        if wanted.is_empty() {
            return Vec::new();
        }
        self.universe
            .iter()
            .filter(|id| final_segment(id).to_lowercase().contains(&wanted))
            .take(MAX_DIAGNOSTIC_CANDIDATES)
            .cloned()
            .collect()
    }

    fn unresolved(
        &self,
        token: &str,
        ctx: ReconcileContext<'_>,
        near_misses: Vec<String>,
    ) -> UnresolvedToken {
        UnresolvedToken {
            token: token.to_string(),
            module_path: ctx.module_path.to_string(),
            candidate_count: ctx.candidate_count,
            near_misses: bounded(&near_misses, MAX_DIAGNOSTIC_CANDIDATES),
        }
    }
}

// ---------------------------------------------------------------------------
// Module-context scoring
// ---------------------------------------------------------------------------

const CONTIGUOUS_BONUS_PER_SEGMENT: f64 = 3.0;
const PARTIAL_BONUS_PER_SEGMENT: f64 = 1.5;
const EXTRA_SEGMENT_PENALTY: f64 = 0.3;
const EXTRA_SEGMENT_ALLOWANCE: usize = 10;

fn module_segments(module_name: &str) -> Vec<String> {
    module_name
        .replace('_', "-")
        .split('-')
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn candidate_parts(id: &str) -> Vec<String> {
    id.to_lowercase()
        .split(|c: char| c == '.' || c == '-' || c == '_')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Positional agreement between the token's segments and the id's segments.
fn path_score(probe: &str, id: &str) -> f64 {
    let id_segments: Vec<&str> = id.split(ID_SEPARATOR).collect();
    probe
        .split(ID_SEPARATOR)
        .enumerate()
        .filter_map(|(i, segment)| {
            id_segments
                .iter()
                .position(|s| *s == segment)
                .map(|j| 1.0 + 1.0 / (1.0 + i.abs_diff(j) as f64))
        })
        .sum()
}

fn module_bonus(module: &[String], id: &str) -> f64 {
    if module.is_empty() {
        return 0.0;
    }
    let parts = candidate_parts(id);
    if parts.windows(module.len()).any(|window| window == module) {
        return CONTIGUOUS_BONUS_PER_SEGMENT * module.len() as f64;
    }

    let matched = module.iter().filter(|seg| parts.contains(*seg)).count();
    if matched == 0 {
        return 0.0;
    }
    let extra = parts.iter().filter(|p| !module.contains(*p)).count();
    let penalty = if extra > EXTRA_SEGMENT_ALLOWANCE {
        EXTRA_SEGMENT_PENALTY * extra as f64
    } else {
        0.0
    };
    PARTIAL_BONUS_PER_SEGMENT * matched as f64 - penalty
}

/// Score each candidate against the module being split; `None` unless there
/// is a single strict winner.
pub fn pick_by_context<'a>(probe: &str, candidates: &[&'a str], module_name: &str) -> Option<&'a str> {
    let module = module_segments(module_name);
    let mut scored: Vec<(&'a str, f64)> = candidates
        .iter()
        .map(|id| (*id, path_score(probe, id) + module_bonus(&module, id)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    match scored.as_slice() {
        [(best, top), (_, runner_up), ..] if top > runner_up => Some(*best),
        _ => None,
    }
}
