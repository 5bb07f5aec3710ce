//! Manifest preparation.
//!
//! A file input is already a manifest. A directory input is listed (regular,
//! non-hidden files directly inside it, sorted) into `all_img_paths.txt` under
//! the cache root. Names that are not valid UTF-8 cannot be written to a
//! text manifest and are skipped with a warning.

use crate::models::{MaskflowError, Result, Stage};
use crate::pipeline::PathLayout;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Return the manifest to pair: `input` itself, or a listing of it.
pub fn prepare_manifest(input: &Path, layout: &PathLayout) -> Result<PathBuf> {
    if input.is_file() {
        return Ok(input.to_path_buf());
    }
    if !input.is_dir() {
        return Err(MaskflowError::InvalidInput(format!(
            "input {} does not exist",
            input.display()
        )));
    }

    let files = list_images(input)?;
    if files.is_empty() {
        return Err(MaskflowError::InvalidInput(format!(
            "input directory {} contains no files",
            input.display()
        )));
    }

    let manifest = layout.manifest_path();
    write_manifest(&manifest, &files)?;
    info!(
        input = %input.display(),
        manifest = %manifest.display(),
        files = files.len(),
        "Wrote manifest"
    );
    Ok(manifest)
}

/// Regular, non-hidden files directly inside `dir`, sorted, as manifest lines.
pub fn list_images(dir: &Path) -> Result<Vec<String>> {
    let dir_str = dir.to_str().ok_or_else(|| {
        MaskflowError::InvalidInput(format!("input directory {} is not valid UTF-8", dir.display()))
    })?;
    let pattern = format!(
        "{}{}*",
        glob::Pattern::escape(dir_str),
        std::path::MAIN_SEPARATOR
    );
    let options = glob::MatchOptions {
        require_literal_leading_dot: true,
        ..Default::default()
    };
    let entries = glob::glob_with(&pattern, options).map_err(|e| {
        MaskflowError::InvalidInput(format!("bad input path {}: {e}", dir.display()))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| {
            MaskflowError::io(Stage::Pairing, format!("listing {}", dir.display()), e.into_error())
        })?;
        if !path.is_file() {
            continue;
        }
        match path.into_os_string().into_string() {
            Ok(path) => files.push(path),
            Err(path) => warn!(path = ?path, "Skipping file name that is not valid UTF-8"),
        }
    }
    files.sort();
    Ok(files)
}

fn write_manifest(manifest: &Path, files: &[String]) -> Result<()> {
    if let Some(parent) = manifest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| MaskflowError::io(Stage::Pairing, format!("creating {}", parent.display()), e))?;
    }
    let file = fs::File::create(manifest)
        .map_err(|e| MaskflowError::io(Stage::Pairing, format!("creating {}", manifest.display()), e))?;
    let mut writer = BufWriter::new(file);
    for path in files {
        writeln!(writer, "{path}")
            .map_err(|e| MaskflowError::io(Stage::Pairing, "writing manifest", e))?;
    }
    writer
        .flush()
        .map_err(|e| MaskflowError::io(Stage::Pairing, "flushing manifest", e))
}
