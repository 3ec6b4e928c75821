//! Deterministic Mocks

mod fixtures;

pub use fixtures::{clustered_corpus, noise_corpus, ScriptedEmbedder};
