//! Checkpoint module: make sure the model weights are in the local cache.
//!
//! Provides:
//! - `resolve`: use the cached checkpoint or fetch it once
//! - `CheckpointFetcher`: the fetch collaborator seam
//! - `SourceFetcher`: download (`url`) or copy (`dir`) from the source catalogue

mod fetch;
mod resolver;

pub use fetch::*;
pub use resolver::*;
