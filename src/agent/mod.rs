//! Decision functions backed by external models.

pub mod ollama;

pub use ollama::OllamaDecision;
