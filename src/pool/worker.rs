//! Worker pool for per-record fan-out.
//!
//! One task is spawned per record; a semaphore bounds how many run at once.
//! Every record is submitted exactly once and outcomes come back in input
//! order, whatever order the tasks finish in.

use crate::models::{MaskflowError, PairedRecord, Result, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Outcome of one record.
#[derive(Debug)]
pub struct RecordOutcome {
    pub identifier: String,
    pub result: Result<()>,
}

/// Worker pool for parallel record processing.
pub struct WorkerPool {
    /// Pool size (max concurrent tasks)
    pool_size: usize,
    /// Semaphore for concurrency control
    semaphore: Arc<Semaphore>,
    /// Draw a progress bar while running
    show_progress: bool,
}

impl WorkerPool {
    /// Create a new worker pool. A size of zero is treated as one.
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            pool_size,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            show_progress: true,
        }
    }

    /// Disable the progress bar (tests, non-interactive use).
    pub fn without_progress(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn size(&self) -> usize {
        self.pool_size
    }

    /// Run `task` once for every record.
    ///
    /// Returns one outcome per record, in the order of `records`.
    pub async fn submit_all<F, Fut>(&self, records: &[PairedRecord], task: F) -> Vec<RecordOutcome>
    where
        F: Fn(PairedRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = Arc::new(task);
        let pb = self.progress(records.len());
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let semaphore = Arc::clone(&self.semaphore);
            let task = Arc::clone(&task);
            let pb = pb.clone();
            let identifier = record.identifier.clone();
            let record = record.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MaskflowError::internal(Stage::Backend, "Semaphore closed"))?;
                let result = task(record).await;
                pb.inc(1);
                result
            });
            handles.push((identifier, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (identifier, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "Task panicked");
                    Err(MaskflowError::internal(
                        Stage::Backend,
                        format!("task for {identifier} panicked: {e}"),
                    ))
                }
            };
            outcomes.push(RecordOutcome { identifier, result });
        }

        pb.finish_and_clear();
        outcomes
    }

    fn progress(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb
    }
}
