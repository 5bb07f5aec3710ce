//! Backend module: the per-model mask generation workflows.
//!
//! Provides:
//! - `Backend`: the collaborator seam a dispatched batch is handed to
//! - `BackendRegistry`: exact model name -> backend, and dispatch
//! - `CommandBackend`: runs an external command once per record

mod command;
mod registry;

pub use command::*;
pub use registry::*;

use crate::models::{Batch, Result, RunResult};
use async_trait::async_trait;

/// A model workflow that turns a batch into masks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name the backend is registered under.
    fn name(&self) -> &str;

    /// Process the whole batch. Creating `batch.output_dir` is the backend's job.
    async fn run(&self, batch: &Batch) -> Result<RunResult>;
}
