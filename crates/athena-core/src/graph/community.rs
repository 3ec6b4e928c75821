//! Community Detection
//!
//! Greedy modularity maximization over an undirected, weighted view of the
//! relation graph. Starting from singleton communities, the pair whose
//! merge yields the largest positive modularity gain is merged until no
//! gain remains. The `resolution` parameter plays the usual gamma role:
//! higher values favour more, smaller communities.
//!
//! Deterministic: pairs are scanned in index order and ties keep the
//! earliest pair, so identical graphs always partition identically.

use std::collections::HashMap;

use crate::types::MemoryId;

/// An undirected weighted edge between node indexes
#[derive(Debug, Clone, Copy)]
pub struct CommunityEdge {
    /// First endpoint (index into the node list)
    pub a: usize,
    /// Second endpoint
    pub b: usize,
    /// Edge weight
    pub weight: f64,
}

/// Detect communities; returns node-id groups, each sorted, the list
/// ordered by its smallest member.
pub fn detect(nodes: &[MemoryId], edges: &[CommunityEdge], resolution: f64) -> Vec<Vec<MemoryId>> {
    let n = nodes.len();
    if n == 0 {
        return Vec::new();
    }

    // Total weight and per-node weighted degree. Self-loops are ignored.
    let mut degree = vec![0.0f64; n];
    let mut total = 0.0f64;
    for e in edges {
        if e.a >= n || e.b >= n || e.a == e.b || e.weight <= 0.0 {
            continue;
        }
        degree[e.a] += e.weight;
        degree[e.b] += e.weight;
        total += e.weight;
    }
    if total <= 0.0 {
        // No usable edges: every node is its own community.
        return nodes.iter().map(|id| vec![*id]).collect();
    }

    // community id per node; communities tracked as (total degree, members)
    let mut community: Vec<usize> = (0..n).collect();
    let mut comm_degree: Vec<f64> = degree.clone();
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    // Inter-community edge weights.
    let mut between: HashMap<(usize, usize), f64> = HashMap::new();
    for e in edges {
        if e.a >= n || e.b >= n || e.a == e.b || e.weight <= 0.0 {
            continue;
        }
        let key = (e.a.min(e.b), e.a.max(e.b));
        *between.entry(key).or_default() += e.weight;
    }

    let gamma = resolution.max(0.01);
    loop {
        // Find the merge with the best positive modularity gain.
        let mut best: Option<((usize, usize), f64)> = None;
        let mut pairs: Vec<(&(usize, usize), &f64)> = between.iter().collect();
        pairs.sort_by_key(|(key, _)| **key);
        for (key, weight) in pairs {
            let (c, d) = *key;
            if members[c].is_empty() || members[d].is_empty() {
                continue;
            }
            let gain = weight / total
                - gamma * (comm_degree[c] * comm_degree[d]) / (2.0 * total * total);
            let better = match best {
                None => gain > 1e-12,
                Some((_, best_gain)) => gain > best_gain + 1e-12,
            };
            if better {
                best = Some(((c, d), gain));
            }
        }

        let Some(((c, d), _)) = best else { break };

        // Merge d into c.
        let moved = std::mem::take(&mut members[d]);
        for node in &moved {
            community[*node] = c;
        }
        members[c].extend(moved);
        comm_degree[c] += comm_degree[d];
        comm_degree[d] = 0.0;

        // Re-route d's edges to c.
        let keys: Vec<(usize, usize)> = between.keys().copied().collect();
        for key in keys {
            if key.0 != d && key.1 != d {
                continue;
            }
            let weight = between.remove(&key).unwrap_or(0.0);
            let other = if key.0 == d { key.1 } else { key.0 };
            if other == c {
                continue; // now internal
            }
            let new_key = (c.min(other), c.max(other));
            *between.entry(new_key).or_default() += weight;
        }
    }

    // Collect non-empty communities as sorted id groups.
    let mut groups: Vec<Vec<MemoryId>> = members
        .into_iter()
        .filter(|m| !m.is_empty())
        .map(|m| {
            let mut ids: Vec<MemoryId> = m.into_iter().map(|i| nodes[i]).collect();
            ids.sort_unstable();
            ids
        })
        .collect();
    groups.sort_by_key(|g| g[0]);
    groups
}

// ============================================================================
// TESTS
// ============================================================================
