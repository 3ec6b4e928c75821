//! Shared Types
//!
//! Cross-layer identifiers. Each layer owns its row types; what lives here
//! is only what two or more layers need to name each other.

use serde::{Deserialize, Serialize};

/// Row identifier within a layer (SQLite `INTEGER PRIMARY KEY`)
pub type MemoryId = i64;

/// The typed memory layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Append-only timestamped events
    Episodic,
    /// Facts with hybrid search
    Semantic,
    /// Reusable named workflows
    Procedural,
    /// Tasks, goals, triggers
    Prospective,
    /// Entities and relations
    Graph,
}

impl Layer {
    /// Stable string name used in `meta_quality.layer`
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Episodic => "episodic",
            Layer::Semantic => "semantic",
            Layer::Procedural => "procedural",
            Layer::Prospective => "prospective",
            Layer::Graph => "graph",
        }
    }

    /// Parse from the stable string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(Layer::Episodic),
            "semantic" => Some(Layer::Semantic),
            "procedural" => Some(Layer::Procedural),
            "prospective" => Some(Layer::Prospective),
            "graph" => Some(Layer::Graph),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A cross-layer reference to one memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRef {
    /// Which layer the memory lives in
    pub layer: Layer,
    /// Row id within that layer
    pub id: MemoryId,
}

impl MemoryRef {
    /// Reference an episodic event
    pub fn event(id: MemoryId) -> Self {
        Self {
            layer: Layer::Episodic,
            id,
        }
    }

    /// Reference a semantic fact
    pub fn fact(id: MemoryId) -> Self {
        Self {
            layer: Layer::Semantic,
            id,
        }
    }

    /// Reference a procedure
    pub fn procedure(id: MemoryId) -> Self {
        Self {
            layer: Layer::Procedural,
            id,
        }
    }
}

impl std::fmt::Display for MemoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.layer, self.id)
    }
}

/// Normalize a tag or topic set: trim, lowercase, dedupe, sorted.
///
/// Sorting keeps the serialized form canonical so equality checks and the
/// FTS index see one spelling per set.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_roundtrip() {
        for layer in [
            Layer::Episodic,
            Layer::Semantic,
            Layer::Procedural,
            Layer::Prospective,
            Layer::Graph,
        ] {
            assert_eq!(Layer::parse_name(layer.as_str()), Some(layer));
        }
        assert_eq!(Layer::parse_name("holographic"), None);
    }

    #[test]
    fn test_memory_ref_display() {
        assert_eq!(MemoryRef::fact(42).to_string(), "semantic:42");
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(["  Deploy ", "deploy", "A", "", "rollback"]);
        assert_eq!(tags, vec!["a", "deploy", "rollback"]);
    }
}
