//! Checkpoint resolution.
//!
//! A checkpoint already in the cache is used as-is; otherwise the fetch
//! collaborator is asked for one and its handle is adopted. The resolver never
//! invents a fallback checkpoint.

use crate::checkpoint::CheckpointFetcher;
use crate::models::{CheckpointHandle, MaskflowError, ModelSpec, Result};
use crate::pipeline::PathLayout;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Expected checkpoint location: `<model_dir>/checkpoints/<file_name>`.
pub fn checkpoint_path(model_dir: &Path, file_name: &str) -> PathBuf {
    PathLayout::checkpoint_dir(model_dir).join(file_name)
}

/// Resolve the checkpoint for `model`, fetching it only if it is not cached.
pub async fn resolve(
    model_dir: &Path,
    file_name: &str,
    model: &ModelSpec,
    fetcher: &dyn CheckpointFetcher,
) -> Result<CheckpointHandle> {
    let path = checkpoint_path(model_dir, file_name);

    if is_file(&path).await {
        info!(path = %path.display(), "Using cached checkpoint");
        return Ok(CheckpointHandle::located(path));
    }

    debug!(path = %path.display(), "Checkpoint not cached, fetching");
    let handle = fetcher.fetch(model, &path).await?;

    if !handle.present || !is_file(&handle.path).await {
        return Err(MaskflowError::CheckpointUnavailable {
            model: model.name.clone(),
            variant: model.variant.clone(),
            reason: format!("fetch produced no file at {}", handle.path.display()),
        });
    }

    info!(path = %handle.path.display(), "Checkpoint fetched");
    Ok(handle)
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
