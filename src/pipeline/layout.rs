//! Derived filesystem layout.
//!
//! Pure path composition, no I/O. Downstream tooling relies on these paths
//! being reproducible from the same inputs:
//!
//! ```text
//! <cache_root>/<model>/checkpoints/<model>_<variant>.<ext>
//! <cache_root>/<model>/<variant>_masks/<artifact>_all.npy
//! <cache_root>/all_img_paths.txt
//! ```

use crate::models::ModelSpec;
use std::path::{Path, PathBuf};

/// File name of the manifest written for directory inputs.
pub const MANIFEST_FILE_NAME: &str = "all_img_paths.txt";

/// Suffix of the file a backend writes once all slices of an image are done.
pub const FINAL_ARTIFACT_SUFFIX: &str = "_all.npy";

/// Path layout rooted at the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    cache_root: PathBuf,
}

impl PathLayout {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// `<cache_root>/<model>`
    pub fn model_dir(&self, model: &ModelSpec) -> PathBuf {
        self.cache_root.join(&model.name)
    }

    /// `<model_dir>/checkpoints`
    pub fn checkpoint_dir(model_dir: &Path) -> PathBuf {
        model_dir.join("checkpoints")
    }

    /// `<model_dir>/checkpoints/<model>_<variant>.<ext>`
    pub fn checkpoint_path(&self, model: &ModelSpec, extension: &str) -> PathBuf {
        Self::checkpoint_dir(&self.model_dir(model)).join(model.checkpoint_file_name(extension))
    }

    /// `<model_dir>/<variant>_masks`
    pub fn mask_dir(&self, model: &ModelSpec) -> PathBuf {
        self.model_dir(model)
            .join(format!("{}_masks", model.variant_slug()))
    }

    /// `<cache_root>/all_img_paths.txt`
    pub fn manifest_path(&self) -> PathBuf {
        self.cache_root.join(MANIFEST_FILE_NAME)
    }

    /// Final mask file for one artifact inside `mask_dir`.
    pub fn final_artifact_path(mask_dir: &Path, artifact_name: &str) -> PathBuf {
        mask_dir.join(format!("{artifact_name}{FINAL_ARTIFACT_SUFFIX}"))
    }
}
