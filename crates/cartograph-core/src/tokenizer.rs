//! Token estimation helpers.
//!
//! The clustering engine only needs a cost that grows with the amount of
//! source text, so estimators are pluggable behind [`TokenEstimator`].

/// Estimates the token cost of a piece of text.
///
/// Implementations must be monotonic: appending text never lowers the
/// estimate.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Bytes-per-token heuristic.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicEstimator {
    pub bytes_per_token: f64,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self {
            bytes_per_token: 3.5,
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let ratio = if self.bytes_per_token > 0.0 {
            self.bytes_per_token
        } else {
            1.0
        };
        (text.len() as f64 / ratio).max(1.0) as usize
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    HeuristicEstimator::default().estimate(text)
}
