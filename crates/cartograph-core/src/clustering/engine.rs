//! Top-down module clustering.
//!
//! The engine walks the tree one level at a time. Every pending node of a
//! level is processed concurrently (bounded by `max_concurrency`, results kept
//! in submission order) and children are only queued once their parent's
//! response has been decoded and reconciled. Each node either stays terminal
//! or splits into children holding disjoint subsets of its members, so the
//! candidate sets shrink level by level and depth is capped by `max_depth`.
//!
//! Oracle trouble never fails a run. A malformed, mistyped or unavailable
//! answer makes the node terminal with the violation recorded on it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clustering::oracle::{
    decode_response, CandidateEntry, DecodedResponse, GroupingOracle, GroupingRequest,
};
use crate::clustering::reconcile::{
    reconcile_indices, MatchTier, ReconcileContext, ReconciledResponse, Reconciler,
    UnresolvedToken,
};
use crate::clustering::tree::{ModuleNode, ModuleTree, NodeOutcome, PATH_SEPARATOR, ROOT_NAME};
use crate::config::{EngineConfig, OracleMode, OrphanPolicy};
use crate::errors::{CartographResult, ContractViolation, OracleError};
use crate::guards::{bounded, MAX_LOGGED_ITEMS};
use crate::models::ComponentTable;
use crate::store::validate::candidates_exist;
use crate::tokenizer::{HeuristicEstimator, TokenEstimator};

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunDiagnostics {
    pub candidates: usize,
    pub unknown_candidates: usize,
    pub duplicate_candidates: usize,
    pub levels: usize,
    pub nodes_processed: usize,
    pub oracle_calls: usize,
    pub oracle_failures: usize,
    pub fallback_calls: usize,
    pub violations: Vec<ContractViolation>,
    pub unresolved_tokens: Vec<UnresolvedToken>,
    pub tier_counts: BTreeMap<MatchTier, usize>,
    pub duplicate_claims: usize,
    pub outside_candidate_set: usize,
    pub orphans_retained: usize,
    pub orphans_dropped: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunDiagnostics {
    fn merge(&mut self, other: RunDiagnostics) {
        self.nodes_processed += other.nodes_processed;
        self.oracle_calls += other.oracle_calls;
        self.oracle_failures += other.oracle_failures;
        self.fallback_calls += other.fallback_calls;
        self.violations.extend(other.violations);
        self.unresolved_tokens.extend(other.unresolved_tokens);
        for (tier, count) in other.tier_counts {
            *self.tier_counts.entry(tier).or_insert(0) += count;
        }
        self.duplicate_claims += other.duplicate_claims;
        self.outside_candidate_set += other.outside_candidate_set;
        self.orphans_retained += other.orphans_retained;
        self.orphans_dropped += other.orphans_dropped;
        self.cancelled |= other.cancelled;
    }
}

#[derive(Debug, Clone)]
pub struct ClusteringRun {
    pub tree: ModuleTree,
    pub diagnostics: RunDiagnostics,
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Arena slot for a node while the tree is being built.
#[derive(Debug)]
struct NodeSlot {
    name: String,
    path: String,
    oracle_path: Option<String>,
    depth: usize,
    members: Vec<String>,
    estimated_tokens: usize,
    outcome: NodeOutcome,
    children: Vec<usize>,
}

/// Owned snapshot of a slot handed to a node task.
struct NodeJob {
    index: usize,
    name: String,
    path: String,
    depth: usize,
    members: Vec<String>,
}

struct ChildPlan {
    name: String,
    oracle_path: Option<String>,
    members: Vec<String>,
}

struct NodeResult {
    index: usize,
    outcome: NodeOutcome,
    estimated_tokens: usize,
    /// Members the node keeps after a split.
    retained: Option<Vec<String>>,
    children: Vec<ChildPlan>,
    diagnostics: RunDiagnostics,
}

impl NodeResult {
    fn terminal(index: usize, outcome: NodeOutcome, estimated_tokens: usize, diagnostics: RunDiagnostics) -> Self {
        Self {
            index,
            outcome,
            estimated_tokens,
            retained: None,
            children: Vec::new(),
            diagnostics,
        }
    }
}

async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                // sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

// ---------------------------------------------------------------------------
// ClusterEngine
// ---------------------------------------------------------------------------

pub struct ClusterEngine<'t> {
    table: &'t ComponentTable,
    config: EngineConfig,
    estimator: Arc<dyn TokenEstimator>,
    primary: Arc<dyn GroupingOracle>,
    fallback: Option<Arc<dyn GroupingOracle>>,
}

impl<'t> ClusterEngine<'t> {
    pub fn new(
        table: &'t ComponentTable,
        config: EngineConfig,
        oracle: Arc<dyn GroupingOracle>,
    ) -> Self {
        Self {
            table,
            config: config.normalized(),
            estimator: Arc::new(HeuristicEstimator::default()),
            primary: oracle,
            fallback: None,
        }
    }

    /// Oracle used for retries after the primary fails.
    pub fn with_fallback(mut self, oracle: Arc<dyn GroupingOracle>) -> Self {
        self.fallback = Some(oracle);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cluster a candidate set into a module tree.
    pub async fn cluster(&self, candidates: &[String]) -> CartographResult<ClusteringRun> {
        self.run(candidates, None).await
    }

    /// Like [`cluster`](Self::cluster), abandoning work once `cancel` reads
    /// `true`. Nodes still pending at that point become terminal with
    /// [`NodeOutcome::Cancelled`].
    pub async fn cluster_with_cancel(
        &self,
        candidates: &[String],
        cancel: watch::Receiver<bool>,
    ) -> CartographResult<ClusteringRun> {
        self.run(candidates, Some(cancel)).await
    }

    async fn run(
        &self,
        candidates: &[String],
        cancel: Option<watch::Receiver<bool>>,
    ) -> CartographResult<ClusteringRun> {
        let started = Instant::now();
        let mut diagnostics = RunDiagnostics {
            candidates: candidates.len(),
            ..RunDiagnostics::default()
        };

        candidates_exist(self.table, candidates, self.config.strict_validation)?;
        let root_members = self.admit_candidates(candidates, &mut diagnostics);

        info!(
            candidates = root_members.len(),
            budget = self.config.max_tokens_per_module,
            max_depth = self.config.max_depth,
            mode = ?self.config.mode,
            oracle = self.primary.name(),
            "clustering started"
        );

        let mut arena = vec![NodeSlot {
            name: ROOT_NAME.to_string(),
            path: ROOT_NAME.to_string(),
            oracle_path: None,
            depth: 0,
            members: root_members,
            estimated_tokens: 0,
            outcome: NodeOutcome::UnderBudget,
            children: Vec::new(),
        }];
        let mut frontier = vec![0usize];

        while !frontier.is_empty() {
            if is_cancelled(&cancel) {
                for &index in &frontier {
                    arena[index].outcome = NodeOutcome::Cancelled;
                }
                diagnostics.cancelled = true;
                warn!(pending = frontier.len(), "clustering cancelled; pending nodes left terminal");
                break;
            }

            diagnostics.levels += 1;
            let jobs: Vec<NodeJob> = frontier
                .iter()
                .map(|&index| {
                    let slot = &arena[index];
                    NodeJob {
                        index,
                        name: slot.name.clone(),
                        path: slot.path.clone(),
                        depth: slot.depth,
                        members: slot.members.clone(),
                    }
                })
                .collect();
            debug!(level = diagnostics.levels, nodes = jobs.len(), "processing level");

            let results: Vec<NodeResult> = stream::iter(jobs)
                .map(|job| self.process_node(job, cancel.clone()))
                .buffered(self.config.max_concurrency)
                .collect()
                .await;

            let mut next = Vec::new();
            for result in results {
                diagnostics.merge(result.diagnostics);
                let parent = result.index;
                arena[parent].outcome = result.outcome;
                arena[parent].estimated_tokens = result.estimated_tokens;
                if let Some(retained) = result.retained {
                    arena[parent].members = retained;
                }
                let depth = arena[parent].depth + 1;
                for child in result.children {
                    let child_index = arena.len();
                    arena.push(NodeSlot {
                        path: format!("{}{PATH_SEPARATOR}{}", arena[parent].path, child.name),
                        name: child.name,
                        oracle_path: child.oracle_path,
                        depth,
                        members: child.members,
                        estimated_tokens: 0,
                        outcome: NodeOutcome::UnderBudget,
                        children: Vec::new(),
                    });
                    arena[parent].children.push(child_index);
                    next.push(child_index);
                }
            }
            frontier = next;
        }

        let tree = ModuleTree::new(build_node(&mut arena, 0));
        diagnostics.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            nodes = tree.stats.nodes,
            leaves = tree.stats.leaves,
            forced_terminal = tree.stats.forced_terminal,
            oracle_calls = diagnostics.oracle_calls,
            violations = diagnostics.violations.len(),
            unresolved_tokens = diagnostics.unresolved_tokens.len(),
            elapsed_ms = diagnostics.elapsed_ms,
            "clustering complete"
        );
        Ok(ClusteringRun { tree, diagnostics })
    }

    /// Drop unknown and repeated candidates, keeping first-seen order.
    fn admit_candidates(&self, candidates: &[String], diagnostics: &mut RunDiagnostics) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut admitted = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !self.table.contains(id) {
                diagnostics.unknown_candidates += 1;
                continue;
            }
            if !seen.insert(id.as_str()) {
                diagnostics.duplicate_candidates += 1;
                continue;
            }
            admitted.push(id.clone());
        }
        if diagnostics.unknown_candidates > 0 {
            warn!(
                unknown = diagnostics.unknown_candidates,
                "candidates missing from the component table were skipped"
            );
        }
        admitted
    }

    fn estimate_cost(&self, members: &[String]) -> usize {
        let text = members
            .iter()
            .filter_map(|id| self.table.get(id))
            .map(|c| c.source_text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.estimator.estimate(&text)
    }

    async fn process_node(
        &self,
        job: NodeJob,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> NodeResult {
        let mut diagnostics = RunDiagnostics {
            nodes_processed: 1,
            ..RunDiagnostics::default()
        };

        if is_cancelled(&cancel) {
            diagnostics.cancelled = true;
            return NodeResult::terminal(job.index, NodeOutcome::Cancelled, 0, diagnostics);
        }

        let cost = self.estimate_cost(&job.members);
        let stop = if cost <= self.config.max_tokens_per_module {
            Some(NodeOutcome::UnderBudget)
        } else if job.members.len() < self.config.min_splittable_members {
            Some(NodeOutcome::BelowMinSize)
        } else if job.depth >= self.config.max_depth {
            Some(NodeOutcome::MaxDepth)
        } else {
            None
        };
        if let Some(outcome) = stop {
            if outcome.is_forced() {
                warn!(
                    module = %job.path,
                    tokens = cost,
                    budget = self.config.max_tokens_per_module,
                    outcome = ?outcome,
                    "node over budget left terminal"
                );
            }
            return NodeResult::terminal(job.index, outcome, cost, diagnostics);
        }

        let request = self.build_request(&job);
        let raw = match self.call_oracle(&request, &mut cancel, &mut diagnostics).await {
            Ok(raw) => raw,
            Err(outcome) => return NodeResult::terminal(job.index, outcome, cost, diagnostics),
        };

        let response = match decode_response(&raw) {
            DecodedResponse::Valid(response) => response,
            DecodedResponse::Malformed(reason) => {
                let violation = ContractViolation::Malformed {
                    module_path: job.path.clone(),
                    candidate_count: job.members.len(),
                    reason,
                };
                return self.violation(job.index, violation, cost, diagnostics);
            }
        };

        let ctx = ReconcileContext {
            module_path: &job.path,
            module_name: (job.depth > 0).then_some(job.name.as_str()),
            candidate_count: job.members.len(),
        };
        let reconciled = match self.config.mode {
            OracleMode::Index => reconcile_indices(&response, &job.members, ctx),
            OracleMode::Name => {
                Reconciler::new(self.table, &job.members, &self.config.strip_prefixes)
                    .reconcile(&response, ctx)
            }
        };
        let reconciled = match reconciled {
            Ok(reconciled) => reconciled,
            Err(violation) => return self.violation(job.index, violation, cost, diagnostics),
        };

        for (tier, count) in reconciled.tier_counts() {
            *diagnostics.tier_counts.entry(tier).or_insert(0) += count;
        }
        diagnostics
            .unresolved_tokens
            .extend(reconciled.unresolved.iter().cloned());

        self.plan_split(&job, reconciled, cost, diagnostics)
    }

    fn violation(
        &self,
        index: usize,
        violation: ContractViolation,
        cost: usize,
        mut diagnostics: RunDiagnostics,
    ) -> NodeResult {
        warn!(
            module = violation.module_path(),
            candidates = violation.candidate_count(),
            "{violation}; node left terminal"
        );
        diagnostics.violations.push(violation.clone());
        NodeResult::terminal(
            index,
            NodeOutcome::ContractViolation { violation },
            cost,
            diagnostics,
        )
    }

    fn build_request(&self, job: &NodeJob) -> GroupingRequest {
        let candidates = job
            .members
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                let component = self.table.get(id)?;
                let token = match self.config.mode {
                    OracleMode::Index => position.to_string(),
                    OracleMode::Name => id.clone(),
                };
                Some(CandidateEntry {
                    token,
                    id: id.clone(),
                    display: component.display_name().to_string(),
                    file: component.relative_path.clone(),
                    source_text: if self.config.include_source_in_request {
                        component.source_text.clone()
                    } else {
                        String::new()
                    },
                })
            })
            .collect();
        GroupingRequest {
            mode: self.config.mode,
            module_path: job.path.clone(),
            module_name: (job.depth > 0).then(|| job.name.clone()),
            candidates,
            include_source: self.config.include_source_in_request,
        }
    }

    /// One call with timeout, retried against the fallback oracle when set.
    async fn call_oracle(
        &self,
        request: &GroupingRequest,
        cancel: &mut Option<watch::Receiver<bool>>,
        diagnostics: &mut RunDiagnostics,
    ) -> Result<String, NodeOutcome> {
        let attempts = self.config.max_retries + 1;
        let timeout = self.config.oracle_timeout();
        let mut last_error = None;

        for attempt in 0..attempts {
            let oracle = match (&self.fallback, attempt) {
                (Some(fallback), 1..) => {
                    diagnostics.fallback_calls += 1;
                    fallback
                }
                _ => &self.primary,
            };
            diagnostics.oracle_calls += 1;

            let result = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => Err(OracleError::Cancelled),
                answer = tokio::time::timeout(timeout, oracle.propose(request)) => match answer {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Timeout {
                        oracle: oracle.name().to_string(),
                        after_ms: self.config.oracle_timeout_ms,
                    }),
                },
            };

            match result {
                Ok(raw) => return Ok(raw),
                Err(OracleError::Cancelled) => {
                    diagnostics.cancelled = true;
                    debug!(module = %request.module_path, "oracle call abandoned");
                    return Err(NodeOutcome::Cancelled);
                }
                Err(e) => {
                    diagnostics.oracle_failures += 1;
                    warn!(
                        module = %request.module_path,
                        attempt = attempt + 1,
                        of = attempts,
                        "oracle call failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
        }

        let violation = ContractViolation::Unavailable {
            module_path: request.module_path.clone(),
            candidate_count: request.candidate_count(),
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        };
        warn!("{violation}; node left terminal");
        diagnostics.violations.push(violation.clone());
        Err(NodeOutcome::ContractViolation { violation })
    }

    fn plan_split(
        &self,
        job: &NodeJob,
        reconciled: ReconciledResponse,
        cost: usize,
        mut diagnostics: RunDiagnostics,
    ) -> NodeResult {
        let member_set: HashSet<&str> = job.members.iter().map(String::as_str).collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut names = ChildNames::default();
        let mut children = Vec::new();

        for group in reconciled.groups {
            let mut kept = Vec::with_capacity(group.members.len());
            for member in group.members {
                if !member_set.contains(member.id.as_str()) {
                    diagnostics.outside_candidate_set += 1;
                    debug!(module = %job.path, id = %member.id, "id outside this node's candidates dropped");
                    continue;
                }
                if !claimed.insert(member.id.clone()) {
                    diagnostics.duplicate_claims += 1;
                    debug!(module = %job.path, id = %member.id, "id already claimed by an earlier group");
                    continue;
                }
                kept.push(member.id);
            }
            if kept.is_empty() {
                continue;
            }
            children.push(ChildPlan {
                name: names.assign(&group.name),
                oracle_path: group.path,
                members: kept,
            });
        }

        if children.len() < self.config.min_child_groups {
            info!(
                module = %job.path,
                groups = children.len(),
                required = self.config.min_child_groups,
                "response did not split the node; left terminal"
            );
            return NodeResult::terminal(job.index, NodeOutcome::NoUsefulSplit, cost, diagnostics);
        }

        let orphans: Vec<String> = job
            .members
            .iter()
            .filter(|id| !claimed.contains(id.as_str()))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            warn!(
                module = %job.path,
                orphans = orphans.len(),
                policy = ?self.config.orphan_policy,
                ids = ?bounded(&orphans, MAX_LOGGED_ITEMS),
                "members not claimed by any group"
            );
        }
        let retained = match self.config.orphan_policy {
            OrphanPolicy::RetainAtParent => {
                diagnostics.orphans_retained += orphans.len();
                orphans
            }
            OrphanPolicy::Drop => {
                diagnostics.orphans_dropped += orphans.len();
                Vec::new()
            }
        };

        info!(
            module = %job.path,
            children = children.len(),
            tokens = cost,
            "node split"
        );
        NodeResult {
            index: job.index,
            outcome: NodeOutcome::Split,
            estimated_tokens: cost,
            retained: Some(retained),
            children,
            diagnostics,
        }
    }
}

/// Sibling name allocator: blanks become `module_N`, repeats get `_2`, `_3`.
#[derive(Default)]
struct ChildNames {
    used: HashSet<String>,
    assigned: usize,
}

impl ChildNames {
    fn assign(&mut self, proposed: &str) -> String {
        self.assigned += 1;
        let cleaned = proposed.trim().replace(PATH_SEPARATOR, "-");
        let base = if cleaned.is_empty() {
            format!("module_{}", self.assigned)
        } else {
            cleaned
        };
        let mut name = base.clone();
        let mut suffix = 1usize;
        while self.used.contains(&name) {
            suffix += 1;
            name = format!("{base}_{suffix}");
        }
        self.used.insert(name.clone());
        name
    }
}

fn build_node(arena: &mut [NodeSlot], index: usize) -> ModuleNode {
    let child_indices = std::mem::take(&mut arena[index].children);
    let children = child_indices
        .into_iter()
        .map(|child| build_node(arena, child))
        .collect();
    let slot = &mut arena[index];
    ModuleNode {
        name: std::mem::take(&mut slot.name),
        path: std::mem::take(&mut slot.path),
        oracle_path: slot.oracle_path.take(),
        depth: slot.depth,
        estimated_tokens: slot.estimated_tokens,
        members: std::mem::take(&mut slot.members),
        outcome: std::mem::replace(&mut slot.outcome, NodeOutcome::UnderBudget),
        children,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;

    use super::*;
    use crate::config::NamespaceCollisionPolicy;
    use crate::indexer::namespace::TableBuilder;
    use crate::models::{RawComponentRecord, SourceRoot};

    /// Oracle that answers by module path and records every request.
    struct ScriptedOracle {
        name: String,
        answers: HashMap<String, String>,
        default_answer: Option<String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        requests: Mutex<Vec<GroupingRequest>>,
    }

    impl ScriptedOracle {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                answers: HashMap::new(),
                default_answer: None,
                delay: None,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn answer(mut self, path: &str, raw: &str) -> Self {
            self.answers.insert(path.to_string(), raw.to_string());
            self
        }

        fn otherwise(mut self, raw: &str) -> Self {
            self.default_answer = Some(raw.to_string());
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GroupingOracle for ScriptedOracle {
        fn name(&self) -> &str {
            &self.name
        }

        fn propose<'a>(
            &'a self,
            request: &'a GroupingRequest,
        ) -> BoxFuture<'a, Result<String, OracleError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requests.lock().unwrap().push(request.clone());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.answers
                    .get(&request.module_path)
                    .or(self.default_answer.as_ref())
                    .cloned()
                    .ok_or_else(|| OracleError::Transport {
                        oracle: self.name.clone(),
                        message: "no scripted answer".to_string(),
                    })
            })
        }
    }

    /// Ten components of ~100 tokens each.
    fn table() -> ComponentTable {
        let body = "x".repeat(350);
        let records = (0..10)
            .map(|i| {
                RawComponentRecord::new(&format!("svc.C{i}"), &format!("C{i}"), "class", &format!("svc/c{i}.py"))
                    .with_source(&body)
            })
            .collect();
        TableBuilder::assign(
            vec![SourceRoot::new("/w/main", records)],
            NamespaceCollisionPolicy::Disambiguate,
        )
        .unwrap()
        .into_unresolved_table()
    }

    fn ids(table: &ComponentTable) -> Vec<String> {
        table.ids().map(str::to_string).collect()
    }

    fn config(mode: OracleMode) -> EngineConfig {
        EngineConfig {
            max_tokens_per_module: 450,
            max_depth: 3,
            mode,
            oracle_timeout_ms: 200,
            ..EngineConfig::default()
        }
    }

    fn tagged(body: &str) -> String {
        format!("<GROUPED_COMPONENTS>{body}</GROUPED_COMPONENTS>")
    }

    fn assert_no_duplication(run: &ClusteringRun, expected: usize) {
        let all = run.tree.all_member_ids();
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(all.len(), expected);
    }

    #[tokio::test]
    async fn test_under_budget_root_skips_oracle() {
        let table = table();
        let oracle = Arc::new(ScriptedOracle::new("primary").otherwise("{}"));
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_tokens_per_module: 10_000,
                ..config(OracleMode::Name)
            },
            oracle.clone(),
        );
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert_eq!(oracle.calls(), 0);
        assert_eq!(run.tree.root.outcome, NodeOutcome::UnderBudget);
        assert_eq!(run.tree.root.members.len(), 10);
    }

    #[tokio::test]
    async fn test_index_mode_split_respects_budget() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .answer("root", &tagged(r#"{"alpha": {"components": [0,1,2,3,4]}, "beta": {"components": [5,6,7,8,9]}}"#))
                .answer("root/alpha", &tagged(r#"{"a1": {"components": [0,1]}, "a2": {"components": [2,3,4]}}"#))
                .answer("root/beta", &tagged(r#"{"b1": {"components": [0,1,2]}, "b2": {"components": [3,4]}}"#)),
        );
        let engine = ClusterEngine::new(&table, config(OracleMode::Index), oracle.clone());
        let run = engine.cluster(&ids(&table)).await.unwrap();

        assert_no_duplication(&run, 10);
        for node in run.tree.iter().filter(|n| n.is_leaf()) {
            assert!(
                node.estimated_tokens <= 450 || node.outcome.is_forced(),
                "{} is over budget without a recorded reason",
                node.path
            );
        }
        let beta2 = run.tree.find("root/beta/b2").unwrap();
        assert_eq!(beta2.members, vec!["main.svc.C8", "main.svc.C9"]);
        assert_eq!(beta2.depth, 2);
        assert_eq!(run.diagnostics.levels, 3);
        assert_eq!(run.diagnostics.tier_counts[&MatchTier::Index], 20);

        let requests = oracle.requests.lock().unwrap();
        let alpha = requests.iter().find(|r| r.module_path == "root/alpha").unwrap();
        assert_eq!(alpha.candidates[0].token, "0");
        assert_eq!(alpha.candidates[0].id, "main.svc.C0");
        assert_eq!(alpha.module_name.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_quoted_indices_force_terminal() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .otherwise(&tagged(r#"{"a": {"components": ["0", "1"]}, "b": {"components": [2]}}"#)),
        );
        let engine = ClusterEngine::new(&table, config(OracleMode::Index), oracle);
        let run = engine.cluster(&ids(&table)).await.unwrap();

        assert!(run.tree.root.is_leaf());
        assert_eq!(run.tree.root.members.len(), 10);
        assert!(matches!(
            &run.tree.root.outcome,
            NodeOutcome::ContractViolation {
                violation: ContractViolation::NonIntegerIndex { .. }
            }
        ));
        assert_eq!(run.diagnostics.violations.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_index_forces_terminal() {
        let table = table();
        let five: Vec<String> = ids(&table).into_iter().take(5).collect();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .otherwise(&tagged(r#"{"a": {"components": [0, 1]}, "b": {"components": [999]}}"#)),
        );
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_tokens_per_module: 100,
                ..config(OracleMode::Index)
            },
            oracle,
        );
        let run = engine.cluster(&five).await.unwrap();
        let NodeOutcome::ContractViolation { violation } = &run.tree.root.outcome else {
            panic!("expected a contract violation");
        };
        let message = violation.to_string();
        assert!(message.contains("999"));
        assert!(message.contains("0-4"));
        assert_eq!(violation.candidate_count(), 5);
        assert_eq!(run.tree.root.members, five);
    }

    #[tokio::test]
    async fn test_name_mode_dedup_orphans_and_outside_ids() {
        let table = table();
        let candidates: Vec<String> = ids(&table).into_iter().take(6).collect();
        let oracle = Arc::new(ScriptedOracle::new("primary").answer(
            "root",
            &tagged(
                r#"{"first": {"components": ["main.svc.C0", "svc.C1", "C2"]},
                    "second": {"components": ["main.svc.C1", "main.svc.C3", "main.svc.C9", "Ghost"]}}"#,
            ),
        ));
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_tokens_per_module: 100,
                max_depth: 1,
                ..config(OracleMode::Name)
            },
            oracle,
        );
        let run = engine.cluster(&candidates).await.unwrap();

        let first = run.tree.find("root/first").unwrap();
        assert_eq!(first.members, vec!["main.svc.C0", "main.svc.C1", "main.svc.C2"]);
        assert_eq!(first.outcome, NodeOutcome::MaxDepth);
        let second = run.tree.find("root/second").unwrap();
        assert_eq!(second.members, vec!["main.svc.C3"]);
        assert_eq!(second.outcome, NodeOutcome::UnderBudget);
        // C4 and C5 were never claimed
        assert_eq!(run.tree.root.members, vec!["main.svc.C4", "main.svc.C5"]);
        assert_eq!(run.diagnostics.duplicate_claims, 1);
        assert_eq!(run.diagnostics.outside_candidate_set, 0);
        assert_eq!(run.diagnostics.orphans_retained, 2);
        assert_eq!(run.diagnostics.unresolved_tokens.len(), 2);
        assert_no_duplication(&run, 6);
    }

    #[tokio::test]
    async fn test_child_violation_keeps_parent_split() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .answer("root", &tagged(r#"{"left": {"components": [0,1,2,3,4]}, "right": {"components": [5,6,7,8,9]}}"#))
                .otherwise(&tagged(
                    r#"{"x": {"components": ["main.svc.C0", "main.svc.C9"]}, "y": {"components": ["main.svc.C1", "main.svc.C2"]}}"#,
                )),
        );
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_depth: 2,
                ..config(OracleMode::Index)
            },
            oracle,
        );
        // children answer with names, which index mode rejects
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert!(matches!(
            run.tree.find("root/left").unwrap().outcome,
            NodeOutcome::ContractViolation { .. }
        ));
        assert_no_duplication(&run, 10);
    }

    #[tokio::test]
    async fn test_names_from_other_branches_do_not_resolve() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .answer(
                    "root",
                    &tagged(r#"{"left": {"components": ["C0","C1","C2","C3","C4"]}, "right": {"components": ["C5","C6","C7","C8","C9"]}}"#),
                )
                .otherwise(&tagged(
                    r#"{"x": {"components": ["C0", "C9", "C1"]}, "y": {"components": ["C2", "C3", "C4"]}}"#,
                )),
        );
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_depth: 2,
                ..config(OracleMode::Name)
            },
            oracle,
        );
        let run = engine.cluster(&ids(&table)).await.unwrap();
        let x = run.tree.find("root/left/x").unwrap();
        assert_eq!(x.members, vec!["main.svc.C0", "main.svc.C1"]);
        assert_eq!(run.diagnostics.outside_candidate_set, 0);
        assert!(run
            .diagnostics
            .unresolved_tokens
            .iter()
            .any(|u| u.token == "C9" && u.module_path == "root/left"));
        assert_eq!(
            run.tree.find("root/right").unwrap().outcome,
            NodeOutcome::NoUsefulSplit
        );
        assert_no_duplication(&run, 10);
    }

    #[tokio::test]
    async fn test_shared_short_name_resolves_inside_its_branch() {
        let body = "x".repeat(350);
        let root = |path: &str, local_ids: &[&str]| {
            SourceRoot::new(
                path,
                local_ids
                    .iter()
                    .map(|id| {
                        RawComponentRecord::new(id, id.rsplit('.').next().unwrap(), "class", "src/x.py")
                            .with_source(&body)
                    })
                    .collect(),
            )
        };
        let table = TableBuilder::assign(
            vec![
                root("/w/main", &["svc.Login", "A", "B"]),
                root("/w/libs", &["svc.Login", "C", "D"]),
            ],
            NamespaceCollisionPolicy::Disambiguate,
        )
        .unwrap()
        .into_unresolved_table();

        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .answer(
                    "root",
                    &tagged(
                        r#"{"left": {"components": ["main.svc.Login", "main.A", "main.B"]},
                            "right": {"components": ["libs.svc.Login", "libs.C", "libs.D"]}}"#,
                    ),
                )
                .answer(
                    "root/left",
                    &tagged(r#"{"l1": {"components": ["svc.Login"]}, "l2": {"components": ["A", "B"]}}"#),
                )
                .answer(
                    "root/right",
                    &tagged(r#"{"r1": {"components": ["svc.Login", "C"]}, "r2": {"components": ["D"]}}"#),
                ),
        );
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_tokens_per_module: 250,
                max_depth: 2,
                ..config(OracleMode::Name)
            },
            oracle,
        );
        let run = engine.cluster(&ids(&table)).await.unwrap();

        let r1 = run.tree.find("root/right/r1").unwrap();
        assert_eq!(r1.members, vec!["libs.svc.Login", "libs.C"]);
        assert!(run.tree.find("root/right").unwrap().members.is_empty());
        let l1 = run.tree.find("root/left/l1").unwrap();
        assert_eq!(l1.members, vec!["main.svc.Login"]);
        assert_eq!(run.diagnostics.outside_candidate_set, 0);
        assert!(run.diagnostics.unresolved_tokens.is_empty());
        assert_no_duplication(&run, 6);
    }

    #[tokio::test]
    async fn test_single_group_is_no_useful_split() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .otherwise(&tagged(r#"{"everything": {"components": [0,1,2,3,4,5,6,7,8,9]}}"#)),
        );
        let engine = ClusterEngine::new(&table, config(OracleMode::Index), oracle);
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert_eq!(run.tree.root.outcome, NodeOutcome::NoUsefulSplit);
        assert_eq!(run.tree.root.members.len(), 10);
    }

    #[tokio::test]
    async fn test_orphans_dropped_by_policy() {
        let table = table();
        let oracle = Arc::new(ScriptedOracle::new("primary").answer(
            "root",
            &tagged(r#"{"a": {"components": [0,1]}, "b": {"components": [2,3]}}"#),
        ));
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                orphan_policy: OrphanPolicy::Drop,
                ..config(OracleMode::Index)
            },
            oracle,
        );
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert!(run.tree.root.members.is_empty());
        assert_eq!(run.diagnostics.orphans_dropped, 6);
        assert_no_duplication(&run, 4);
    }

    #[tokio::test]
    async fn test_malformed_response_is_terminal() {
        let table = table();
        let oracle = Arc::new(ScriptedOracle::new("primary").otherwise("I could not decide."));
        let engine = ClusterEngine::new(&table, config(OracleMode::Name), oracle);
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert!(matches!(
            &run.tree.root.outcome,
            NodeOutcome::ContractViolation {
                violation: ContractViolation::Malformed { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_second_oracle() {
        let table = table();
        let primary = Arc::new(
            ScriptedOracle::new("primary")
                .otherwise("{}")
                .slow(Duration::from_secs(5)),
        );
        let fallback = Arc::new(ScriptedOracle::new("fallback").answer(
            "root",
            &tagged(r#"{"a": {"components": [0,1,2]}, "b": {"components": [3,4,5,6,7,8,9]}}"#),
        ));
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_depth: 1,
                oracle_timeout_ms: 50,
                ..config(OracleMode::Index)
            },
            primary.clone(),
        )
        .with_fallback(fallback.clone());
        let run = engine.cluster(&ids(&table)).await.unwrap();

        assert_eq!(run.tree.root.outcome, NodeOutcome::Split);
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
        assert_eq!(run.diagnostics.oracle_failures, 1);
        assert_eq!(run.diagnostics.fallback_calls, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_unavailable() {
        let table = table();
        let primary = Arc::new(ScriptedOracle::new("primary"));
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                max_retries: 2,
                ..config(OracleMode::Index)
            },
            primary.clone(),
        );
        let run = engine.cluster(&ids(&table)).await.unwrap();
        assert_eq!(primary.calls(), 3);
        assert!(matches!(
            &run.tree.root.outcome,
            NodeOutcome::ContractViolation {
                violation: ContractViolation::Unavailable { attempts: 3, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_leaves_nodes_terminal() {
        let table = table();
        let oracle = Arc::new(
            ScriptedOracle::new("primary")
                .otherwise("{}")
                .slow(Duration::from_secs(5)),
        );
        let engine = ClusterEngine::new(
            &table,
            EngineConfig {
                oracle_timeout_ms: 10_000,
                ..config(OracleMode::Index)
            },
            oracle,
        );
        let (tx, rx) = watch::channel(false);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let candidates = ids(&table);
        let (run, ()) = tokio::join!(engine.cluster_with_cancel(&candidates, rx), canceller);
        let run = run.unwrap();
        assert_eq!(run.tree.root.outcome, NodeOutcome::Cancelled);
        assert!(run.diagnostics.cancelled);
        assert_eq!(run.tree.root.members.len(), 10);
    }

    #[tokio::test]
    async fn test_already_cancelled_run_never_calls_oracle() {
        let table = table();
        let oracle = Arc::new(ScriptedOracle::new("primary").otherwise("{}"));
        let engine = ClusterEngine::new(&table, config(OracleMode::Index), oracle.clone());
        let (_tx, rx) = watch::channel(true);
        let run = engine.cluster_with_cancel(&ids(&table), rx).await.unwrap();
        assert_eq!(oracle.calls(), 0);
        assert_eq!(run.tree.root.outcome, NodeOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_candidates_are_skipped_or_rejected() {
        let table = table();
        let mut candidates = ids(&table);
        candidates.push("main.svc.Ghost".to_string());
        candidates.push("main.svc.C0".to_string());

        let oracle = Arc::new(ScriptedOracle::new("primary").otherwise("{}"));
        let engine = ClusterEngine::new(&table, config(OracleMode::Index), oracle.clone());
        let run = engine.cluster(&candidates).await.unwrap();
        assert_eq!(run.diagnostics.unknown_candidates, 1);
        assert_eq!(run.diagnostics.duplicate_candidates, 1);
        assert_eq!(run.tree.root.members.len(), 10);

        let strict = ClusterEngine::new(
            &table,
            EngineConfig {
                strict_validation: true,
                ..config(OracleMode::Index)
            },
            oracle,
        );
        assert!(strict.cluster(&candidates).await.is_err());
    }

    #[test]
    fn test_child_names_are_unique() {
        let mut names = ChildNames::default();
        assert_eq!(names.assign("auth"), "auth");
        assert_eq!(names.assign("auth"), "auth_2");
        assert_eq!(names.assign("  "), "module_3");
        assert_eq!(names.assign("a/b"), "a-b");
    }
}
