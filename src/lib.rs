//! maskflow - batch mask generation over image manifests.
//!
//! ## Architecture
//!
//! A run is a small task graph:
//! - **Checkpoint resolver**: uses the cached model checkpoint or fetches it once
//! - **Record pairing**: joins every manifest line with its output name
//! - **Dispatcher**: hands the whole batch to the backend registered for the model
//! - **Reporter**: logs the terminal outcome
//!
//! Resolution and pairing run concurrently; dispatch waits for both.
//!
//! ## Layout
//!
//! ```text
//! <cache_root>/<model>/checkpoints/<model>_<variant>.<ext>
//! <cache_root>/<model>/<variant>_masks/<stem>_masks_<model>-<variant>_all.npy
//! ```

pub mod backend;
pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod pool;

// Re-exports for convenience
pub use backend::{Backend, BackendRegistry, CommandBackend};
pub use checkpoint::{CheckpointFetcher, SourceFetcher, resolve};
pub use client::DownloadClient;
pub use models::{
    Batch, CheckpointHandle, Config, ConfigError, MaskflowError, ModelSpec, PairedRecord, Result,
    RunOverrides, RunResult, RunStats, Stage,
};
pub use pipeline::{CompletionReporter, PathLayout, Pipeline, Reporter, pair};
pub use pool::WorkerPool;
