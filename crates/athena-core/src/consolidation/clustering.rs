//! Density Clustering
//!
//! DBSCAN over event vectors with cosine distance. Points that fail the
//! density test are noise, which is what keeps random chatter out of the
//! semantic layer: noise never becomes a fact. Each surviving cluster
//! reports a centroid member, exemplars, and an uncertainty score driven
//! by intra-cluster cosine variance.

use crate::embedding::cosine_similarity;

/// Clustering parameters (per consolidation profile)
#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    /// Cosine-distance neighborhood radius
    pub eps: f32,
    /// Neighbors required to seed a cluster
    pub min_samples: usize,
    /// Smallest cluster that may emit anything
    pub min_cluster_size: usize,
}

/// A cluster of input indexes
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Member indexes into the input slice
    pub members: Vec<usize>,
    /// Member closest to the vector centroid
    pub centroid_member: usize,
    /// Up to three members closest to the centroid
    pub exemplars: Vec<usize>,
    /// Uncertainty in [0,1] from intra-cluster cosine variance
    pub uncertainty: f64,
}

/// Cosine distance (1 - similarity), clamped to [0,2]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
}

/// DBSCAN labels: -1 = noise, >= 0 = cluster id
pub fn dbscan(params: &ClusterParams, vectors: &[Vec<f32>]) -> Vec<isize> {
    const UNVISITED: isize = -2;
    let n = vectors.len();
    let mut labels = vec![UNVISITED; n];
    let mut cluster_id: isize = 0;

    for i in 0..n {
        if labels[i] != UNVISITED {
            continue;
        }
        let neighbors = region_query(params, i, vectors);
        if neighbors.len() < params.min_samples {
            labels[i] = -1;
            continue;
        }

        labels[i] = cluster_id;
        let mut queue = neighbors;
        while let Some(p) = queue.pop() {
            if labels[p] == -1 {
                labels[p] = cluster_id; // border point adopted by the cluster
            }
            if labels[p] != UNVISITED {
                continue;
            }
            labels[p] = cluster_id;
            let p_neighbors = region_query(params, p, vectors);
            if p_neighbors.len() >= params.min_samples {
                for q in p_neighbors {
                    if labels[q] == UNVISITED || labels[q] == -1 {
                        queue.push(q);
                    }
                }
            }
        }
        cluster_id += 1;
    }

    labels
}

/// Indexes within `eps` cosine distance of point `i` (excluding `i`)
fn region_query(params: &ClusterParams, i: usize, vectors: &[Vec<f32>]) -> Vec<usize> {
    let mut neighbors = Vec::new();
    for (j, v) in vectors.iter().enumerate() {
        if i != j && cosine_distance(&vectors[i], v) <= params.eps {
            neighbors.push(j);
        }
    }
    neighbors
}

/// Group labels into clusters of at least `min_cluster_size`, computing
/// centroid member, exemplars, and uncertainty. Output is deterministic:
/// clusters ordered by their smallest member index.
pub fn build_clusters(params: &ClusterParams, vectors: &[Vec<f32>], labels: &[isize]) -> Vec<Cluster> {
    use std::collections::BTreeMap;

    let mut grouped: BTreeMap<isize, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        if *label >= 0 {
            grouped.entry(*label).or_default().push(i);
        }
    }

    let mut clusters: Vec<Cluster> = grouped
        .into_values()
        .filter(|members| members.len() >= params.min_cluster_size)
        .map(|members| summarize(&members, vectors))
        .collect();
    clusters.sort_by_key(|c| c.members[0]);
    clusters
}

fn summarize(members: &[usize], vectors: &[Vec<f32>]) -> Cluster {
    let dim = vectors[members[0]].len();
    let mut centroid = vec![0.0f32; dim];
    for &m in members {
        for (d, v) in vectors[m].iter().enumerate() {
            centroid[d] += v;
        }
    }
    for v in &mut centroid {
        *v /= members.len() as f32;
    }

    // Cosine of each member to the centroid drives both the
    // representative choice and the uncertainty.
    let mut cosines: Vec<(usize, f64)> = members
        .iter()
        .map(|&m| (m, f64::from(cosine_similarity(&vectors[m], &centroid))))
        .collect();
    cosines.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let mean = cosines.iter().map(|(_, c)| c).sum::<f64>() / cosines.len() as f64;
    let variance = cosines
        .iter()
        .map(|(_, c)| (c - mean).powi(2))
        .sum::<f64>()
        / cosines.len() as f64;
    let uncertainty = (2.0 * variance.sqrt()).clamp(0.0, 1.0);

    let mut sorted_members = members.to_vec();
    sorted_members.sort_unstable();

    Cluster {
        members: sorted_members,
        centroid_member: cosines[0].0,
        exemplars: cosines.iter().take(3).map(|(m, _)| *m).collect(),
        uncertainty,
    }
}

/// Normalized tag entropy in [0,1]: the lexical-mode uncertainty signal
/// when no member carries an embedding.
pub fn tag_entropy(tag_sets: &[Vec<String>]) -> f64 {
    use std::collections::HashMap;

    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut total = 0usize;
    for tags in tag_sets {
        for tag in tags {
            *counts.entry(tag.as_str()).or_default() += 1;
            total += 1;
        }
    }
    if total == 0 || counts.len() <= 1 {
        return 0.0;
    }
    let entropy: f64 = counts
        .values()
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.log2()
        })
        .sum();
    entropy / (counts.len() as f64).log2()
}

// ============================================================================
// TESTS
// ============================================================================
