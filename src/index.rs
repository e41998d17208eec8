//! Vector index selection.

use anyhow::{bail, Result};
use kb_harness_core::store::memory::InMemoryIndex;
use kb_harness_core::store::VectorIndex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::pinecone::PineconeIndex;

/// Build the index backend named by `[index].backend`.
pub fn create_index(config: &Config) -> Result<Arc<dyn VectorIndex>> {
    match config.index.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryIndex::new())),
        "pinecone" => {
            let index = PineconeIndex::from_env(
                config.index.host.clone(),
                config.index.score_convention()?,
                Duration::from_secs(config.embedding.timeout_secs),
            )?;
            Ok(Arc::new(index))
        }
        other => bail!("Unknown index backend: {}", other),
    }
}
