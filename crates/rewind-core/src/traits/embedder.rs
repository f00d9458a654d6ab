//! Embedder trait consumed by text similarity queries.

use async_trait::async_trait;

use crate::error::RewindResult;

/// Turns text into vectors. Supplied by the application; rewind never
/// computes embeddings itself.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text.
    async fn embed(&self, text: &str) -> RewindResult<Vec<f32>>;
}
