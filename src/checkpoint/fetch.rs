//! Checkpoint fetch collaborators.
//!
//! The resolver only knows the `CheckpointFetcher` trait. `SourceFetcher` is the
//! default implementation: it looks the model variant up in the checkpoint
//! source catalogue and either downloads it or copies it from a directory.

use crate::client::{DownloadClient, part_path};
use crate::models::{
    CheckpointHandle, CheckpointSource, Config, MaskflowError, ModelSpec, Result, Stage,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

/// Produces a checkpoint file when the cache does not have one.
///
/// Implementations are the only writers of the checkpoint file. Retries, if
/// any, are their responsibility.
#[async_trait]
pub trait CheckpointFetcher: Send + Sync {
    /// Fetch the checkpoint for `model` into `destination`.
    async fn fetch(&self, model: &ModelSpec, destination: &Path) -> Result<CheckpointHandle>;
}

/// Default fetcher backed by the configured checkpoint sources.
pub struct SourceFetcher {
    config: Arc<Config>,
    downloader: DownloadClient,
}

impl SourceFetcher {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let downloader = DownloadClient::new(
            Some(config.fetch.timeout_secs),
            Some(config.fetch.max_retries),
        )?;
        Ok(Self { config, downloader })
    }
}

#[async_trait]
impl CheckpointFetcher for SourceFetcher {
    async fn fetch(&self, model: &ModelSpec, destination: &Path) -> Result<CheckpointHandle> {
        let source = self
            .config
            .checkpoint_source(&model.name, &model.variant)
            .ok_or_else(|| MaskflowError::CheckpointUnavailable {
                model: model.name.clone(),
                variant: model.variant.clone(),
                reason: "no checkpoint source configured".to_string(),
            })?;

        match &source {
            CheckpointSource::Url { .. } => {
                self.downloader
                    .download(&source.location(), destination)
                    .await?;
            }
            CheckpointSource::Dir { .. } => {
                copy_checkpoint(Path::new(&source.location()), destination).await?;
            }
        }

        Ok(CheckpointHandle::located(destination))
    }
}

/// Copy a checkpoint from a reachable path into the cache.
pub async fn copy_checkpoint(source: &Path, destination: &Path) -> Result<u64> {
    let location = source.display().to_string();

    let is_file = fs::metadata(source)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(MaskflowError::fetch_failed(
            location,
            "model checkpoint not found",
        ));
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MaskflowError::io(Stage::Checkpoint, "creating checkpoint dir", e))?;
    }

    info!(from = %location, to = %destination.display(), "Copying checkpoint");

    let part = part_path(destination);
    let bytes = match fs::copy(source, &part).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            return Err(MaskflowError::fetch_failed(location, e));
        }
    };
    fs::rename(&part, destination)
        .await
        .map_err(|e| MaskflowError::io(Stage::Checkpoint, "renaming copied checkpoint", e))?;

    Ok(bytes)
}
