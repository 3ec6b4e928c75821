//! Hypothetical-Answer Query Expansion
//!
//! Local-first HyDE: instead of asking a generator for a hypothetical
//! answer, expand the query into several answer-shaped variants by
//! template, embed them all, and search with the centroid. Callers that do
//! have a generated hypothetical pass it directly and skip the templates.
//!
//! The same query analysis feeds the `adaptive` strategy selector: word
//! count, pronoun density, and temporal cues.

/// Query cues the adaptive selector keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCues {
    /// Whitespace-separated word count
    pub word_count: usize,
    /// Number of third-person pronouns
    pub pronoun_count: usize,
    /// Whether the query contains before/after/when/while-style cues
    pub temporal: bool,
}

/// Analyze a query for the adaptive decision rule
pub fn analyze(query: &str) -> QueryCues {
    const PRONOUNS: &[&str] = &["it", "they", "them", "he", "she", "this", "that", "these", "those"];
    const TEMPORAL: &[&str] = &["before", "after", "when", "while", "since", "until", "during"];

    let lower = query.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let pronoun_count = words
        .iter()
        .filter(|w| PRONOUNS.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())))
        .count();
    let temporal = words
        .iter()
        .any(|w| TEMPORAL.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())));

    QueryCues {
        word_count: words.len(),
        pronoun_count,
        temporal,
    }
}

/// Generate answer-shaped variants of a query.
///
/// The raw query is always the first variant; the rest phrase it as the
/// opening of an answer so the centroid lands in answer space.
pub fn expand_query(query: &str) -> Vec<String> {
    let clean = query.trim().trim_end_matches('?').trim_end_matches('.');
    let mut variants = vec![query.to_string()];
    if clean.is_empty() {
        return variants;
    }

    let lower = clean.to_lowercase();
    if lower.starts_with("how") || lower.contains("steps") {
        variants.push(format!("The steps for {clean} are as follows"));
        variants.push(format!("To handle {clean}, the procedure is"));
    } else if lower.starts_with("why") {
        variants.push(format!("The reason for {clean} is"));
        variants.push(format!("{clean} happened because"));
    } else if lower.starts_with("when") || lower.contains("timeline") {
        variants.push(format!("{clean} occurred at"));
        variants.push(format!("The sequence of events around {clean} was"));
    } else {
        variants.push(format!("Information recorded about {clean} includes"));
        variants.push(format!("{clean} is known to involve"));
    }

    variants
}

/// Average embeddings into an L2-normalized centroid.
pub fn centroid_embedding(embeddings: &[Vec<f32>]) -> Vec<f32> {
    if embeddings.is_empty() {
        return vec![];
    }

    let dim = embeddings[0].len();
    let count = embeddings.len() as f32;
    let mut centroid = vec![0.0f32; dim];

    for emb in embeddings {
        for (i, val) in emb.iter().enumerate() {
            if i < dim {
                centroid[i] += val;
            }
        }
    }
    for val in &mut centroid {
        *val /= count;
    }
    crate::embedding::l2_normalize(&mut centroid);
    centroid
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_counts_pronouns() {
        let cues = analyze("what did they say about it?");
        assert_eq!(cues.pronoun_count, 2);
        assert!(!cues.temporal);
    }

    #[test]
    fn test_analyze_detects_temporal() {
        assert!(analyze("what happened before the rollback").temporal);
        assert!(analyze("status while deploying").temporal);
        assert!(!analyze("database sizing guidance").temporal);
    }

    #[test]
    fn test_expand_always_keeps_original_first() {
        let variants = expand_query("how to rotate credentials?");
        assert!(variants.len() >= 3);
        assert_eq!(variants[0], "how to rotate credentials?");
    }

    #[test]
    fn test_expand_empty_query() {
        let variants = expand_query("  ");
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn test_centroid_is_normalized() {
        let centroid = centroid_embedding(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let norm: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_centroid_empty() {
        assert!(centroid_embedding(&[]).is_empty());
    }
}
