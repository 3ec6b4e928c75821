//! Token Compaction
//!
//! The pipeline's structured payload is authoritative and score-ordered;
//! when it exceeds the caller's token budget, items are dropped from the
//! tail, never the top. Token counts use the standard ~4 characters per
//! token estimate, which overcounts slightly for prose and keeps the
//! payload safely under the budget.

use super::RankedMemory;

/// Estimated tokens for a text (~4 chars/token, rounded up)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Render one payload line for an item
fn render_line(item: &RankedMemory) -> String {
    format!(
        "[{}] ({:.3}) {}\n",
        item.memory_ref, item.score, item.snippet
    )
}

/// Fit score-ordered items into a token budget by trimming the tail.
/// Returns the surviving items and the rendered context string.
pub fn compact(items: Vec<RankedMemory>, token_budget: Option<usize>) -> (Vec<RankedMemory>, String) {
    let mut kept = Vec::with_capacity(items.len());
    let mut context = String::new();
    let mut used = 0usize;

    for item in items {
        let line = render_line(&item);
        let cost = estimate_tokens(&line);
        if let Some(budget) = token_budget {
            if used + cost > budget {
                break; // everything after this is lower-scored: drop the tail
            }
        }
        used += cost;
        context.push_str(&line);
        kept.push(item);
    }

    (kept, context)
}

// ============================================================================
// TESTS
// ============================================================================
