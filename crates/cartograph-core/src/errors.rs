//! Error types for the cartograph core library.
//!
//! Only conditions that make a run meaningless surface as [`CartographError`].
//! Everything the clustering engine can degrade around (oracle failures,
//! malformed responses, unresolvable tokens) is recorded as a
//! [`ContractViolation`] or [`OracleError`] on the affected node instead.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error enum for the cartograph core library.
#[derive(Debug, thiserror::Error)]
pub enum CartographError {
    #[error("Namespace collision: '{namespace}' is derived from both {first} and {second}")]
    NamespaceCollision {
        namespace: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CartographResult<T> = Result<T, CartographError>;

/// Failure of a single call to a grouping oracle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("oracle '{oracle}' did not answer within {after_ms} ms")]
    Timeout { oracle: String, after_ms: u64 },

    #[error("oracle '{oracle}' transport failure: {message}")]
    Transport { oracle: String, message: String },

    #[error("oracle call cancelled")]
    Cancelled,
}

/// An oracle answer that broke the grouping contract.
///
/// Every variant carries the module path and the size of the candidate set the
/// oracle was asked about, so a warning can be diagnosed without the rest of
/// the run's logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractViolation {
    #[error("malformed grouping response for '{module_path}' ({candidate_count} candidates): {reason}")]
    Malformed {
        module_path: String,
        candidate_count: usize,
        reason: String,
    },

    #[error(
        "non-integer member tokens {tokens:?} for '{module_path}'; \
         index mode expects integers in 0-{max_index}"
    )]
    NonIntegerIndex {
        module_path: String,
        candidate_count: usize,
        max_index: usize,
        tokens: Vec<String>,
    },

    #[error(
        "out-of-range member indices {indices:?} for '{module_path}'; \
         valid range is 0-{max_index}"
    )]
    IndexOutOfRange {
        module_path: String,
        candidate_count: usize,
        max_index: usize,
        indices: Vec<String>,
    },

    #[error("none of the {token_count} member tokens for '{module_path}' resolved ({candidate_count} candidates)")]
    NothingResolved {
        module_path: String,
        candidate_count: usize,
        token_count: usize,
    },

    #[error("grouping oracle unavailable for '{module_path}' ({candidate_count} candidates) after {attempts} attempt(s): {last_error}")]
    Unavailable {
        module_path: String,
        candidate_count: usize,
        attempts: usize,
        last_error: String,
    },
}

impl ContractViolation {
    pub fn module_path(&self) -> &str {
        match self {
            Self::Malformed { module_path, .. }
            | Self::NonIntegerIndex { module_path, .. }
            | Self::IndexOutOfRange { module_path, .. }
            | Self::NothingResolved { module_path, .. }
            | Self::Unavailable { module_path, .. } => module_path,
        }
    }

    pub fn candidate_count(&self) -> usize {
        match self {
            Self::Malformed {
                candidate_count, ..
            }
            | Self::NonIntegerIndex {
                candidate_count, ..
            }
            | Self::IndexOutOfRange {
                candidate_count, ..
            }
            | Self::NothingResolved {
                candidate_count, ..
            }
            | Self::Unavailable {
                candidate_count, ..
            } => *candidate_count,
        }
    }
}
