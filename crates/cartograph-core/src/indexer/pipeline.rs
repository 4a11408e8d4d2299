//! Table preparation pipeline: namespace assignment, reference resolution and
//! leaf selection in one pass.

use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::errors::CartographResult;
use crate::indexer::leaves::{LeafFilter, LeafSelection};
use crate::indexer::namespace::{AssignmentReport, TableBuilder};
use crate::indexer::resolver::{resolve_references, ResolutionReport};
use crate::models::{ComponentTable, SourceRoot};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepareStats {
    pub assignment: AssignmentReport,
    pub resolution: ResolutionReport,
    pub elapsed_ms: u64,
}

/// Everything the clustering engine needs to start.
#[derive(Debug, Clone)]
pub struct PreparedTable {
    pub table: ComponentTable,
    pub leaves: LeafSelection,
    pub stats: PrepareStats,
}

/// Build the frozen component table for an ordered list of roots and select
/// its clustering candidates.
pub fn prepare_table(
    roots: Vec<SourceRoot>,
    config: &EngineConfig,
) -> CartographResult<PreparedTable> {
    let started = Instant::now();

    let builder = TableBuilder::assign(roots, config.collision_policy)?;
    let assignment = builder.report().clone();
    let (table, resolution) = resolve_references(builder);
    let leaves = LeafFilter::from_config(config).select(&table);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        components = table.len(),
        leaves = leaves.leaves.len(),
        elapsed_ms,
        "component table prepared"
    );

    Ok(PreparedTable {
        table,
        leaves,
        stats: PrepareStats {
            assignment,
            resolution,
            elapsed_ms,
        },
    })
}
