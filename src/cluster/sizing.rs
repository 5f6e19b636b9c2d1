//! Per-node capacity targets

/// Split `total` across `nodes` nodes; the remainder goes one each to the
/// lowest-indexed nodes
pub fn compute_targets(total: usize, nodes: usize) -> Vec<usize> {
    if nodes == 0 {
        return Vec::new();
    }
    let base = total / nodes;
    let remainder = total % nodes;
    (0..nodes).map(|i| base + usize::from(i < remainder)).collect()
}

/// Target for the node at `index` among `nodes` nodes
pub fn local_target(total: usize, nodes: usize, index: usize) -> usize {
    compute_targets(total, nodes).get(index).copied().unwrap_or(0)
}
