//! Shared guardrails for clustering budgets, traversal limits and diagnostics.

// Clustering guards
pub const MIN_TOKEN_BUDGET: usize = 16;
pub const MAX_TOKEN_BUDGET: usize = 1_000_000;
pub const MAX_CLUSTER_DEPTH: usize = 8;
pub const MIN_SPLITTABLE_MEMBERS: usize = 2;
pub const MAX_CLUSTER_CONCURRENCY: usize = 32;

// Oracle guards
pub const MAX_ORACLE_TIMEOUT_MS: u64 = 600_000;
pub const MAX_ORACLE_RETRIES: usize = 5;

// Diagnostics guards
pub const MAX_DIAGNOSTIC_CANDIDATES: usize = 5;
pub const MAX_LOGGED_ITEMS: usize = 20;

pub fn clamp_usize(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: usize) -> usize {
    clamp_usize(value, 1, MAX_CLUSTER_DEPTH)
}

pub fn clamp_budget(value: usize) -> usize {
    clamp_usize(value, MIN_TOKEN_BUDGET, MAX_TOKEN_BUDGET)
}

pub fn clamp_timeout_ms(value: u64) -> u64 {
    value.clamp(1, MAX_ORACLE_TIMEOUT_MS)
}

pub fn clamp_concurrency(value: usize) -> usize {
    clamp_usize(value, 1, MAX_CLUSTER_CONCURRENCY)
}

/// Keep at most `limit` items of a diagnostic list.
pub fn bounded<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    items.iter().take(limit).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_budget_bounds() {
        assert_eq!(clamp_budget(0), MIN_TOKEN_BUDGET);
        assert_eq!(clamp_budget(36_369), 36_369);
        assert_eq!(clamp_budget(usize::MAX), MAX_TOKEN_BUDGET);
    }

    #[test]
    fn test_clamp_depth_never_zero() {
        assert_eq!(clamp_depth(0), 1);
        assert_eq!(clamp_depth(100), MAX_CLUSTER_DEPTH);
    }

    #[test]
    fn test_bounded_truncates() {
        let items = vec![1, 2, 3, 4, 5, 6, 7];
        assert_eq!(bounded(&items, MAX_DIAGNOSTIC_CANDIDATES), vec![1, 2, 3, 4, 5]);
        assert_eq!(bounded(&items[..2], 5), vec![1, 2]);
    }
}
