//! Cartograph core library: component identity and module clustering for
//! multi-root code documentation.
//!
//! The indexer turns analyzer output from several source roots into one
//! frozen [`models::ComponentTable`] keyed by namespaced ids, resolves raw
//! references across namespaces, and selects the leaf components worth
//! documenting. The clustering engine then asks a [`GroupingOracle`] to
//! partition those leaves into a budgeted module tree and reconciles
//! whatever the oracle answers back onto canonical ids.

pub mod clustering;
pub mod config;
pub mod errors;
pub mod guards;
pub mod indexer;
pub mod models;
pub mod store;
pub mod tokenizer;

pub use clustering::engine::{ClusterEngine, ClusteringRun, RunDiagnostics};
pub use clustering::oracle::{GroupingOracle, GroupingRequest, ReplayOracle};
pub use clustering::tree::{ModuleNode, ModuleTree, NodeOutcome};
pub use config::EngineConfig;
pub use errors::{CartographError, CartographResult, ContractViolation, OracleError};
pub use indexer::pipeline::{prepare_table, PreparedTable};
pub use models::{Component, ComponentTable, RawComponentRecord, SourceRoot};
