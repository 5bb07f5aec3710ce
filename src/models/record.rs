//! Record and handle types for maskflow.
//!
//! These types represent the data flowing from the manifest and the checkpoint
//! cache into a dispatched batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Marker between the image stem and the model suffix in artifact names.
pub const MASK_MARKER: &str = "_masks_";

/// Which checkpoint and which backend to use. Immutable for the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model name, also the backend key
    pub name: String,
    /// Model variant as selected by the user
    pub variant: String,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: variant.into(),
        }
    }

    /// Variant name made safe for file names (spaces become dashes).
    pub fn variant_slug(&self) -> String {
        sanitise_name(&self.variant)
    }

    /// Checkpoint file name: `<name>_<variant>.<ext>`.
    pub fn checkpoint_file_name(&self, extension: &str) -> String {
        format!("{}_{}.{}", self.name, self.variant_slug(), extension)
    }

    /// Suffix appended to every artifact: `_masks_<name>-<variant>`.
    pub fn artifact_suffix(&self) -> String {
        format!("{}{}-{}", MASK_MARKER, self.name, self.variant_slug())
    }
}

/// Replace spaces so model and variant names can be used in file names.
pub fn sanitise_name(name: &str) -> String {
    name.replace(' ', "-")
}

/// A model checkpoint file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHandle {
    /// Location of the checkpoint file
    pub path: PathBuf,
    /// Whether the file was present when the handle was created
    pub present: bool,
}

impl CheckpointHandle {
    /// Handle to a file known to exist.
    pub fn located(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            present: true,
        }
    }

    /// Handle to a file that could not be produced.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            present: false,
        }
    }

    /// Present flag set and the file still on disk.
    pub fn is_usable(&self) -> bool {
        self.present && self.path.is_file()
    }
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    /// File stem of `source_path`
    pub identifier: String,
    /// Trimmed manifest line
    pub source_path: String,
}

impl InputRecord {
    /// Build a record from a manifest path.
    ///
    /// Returns `None` when the path has no file name to derive a stem from.
    pub fn from_path(source_path: &str) -> Option<Self> {
        let source_path = source_path.trim();
        let identifier = derive_identifier(source_path)?;
        Some(Self {
            identifier,
            source_path: source_path.to_string(),
        })
    }
}

/// Stem of a path: file name without directories and without the final
/// extension (`/data/image.v2.tif` -> `image.v2`).
pub fn derive_identifier(source_path: &str) -> Option<String> {
    if source_path.is_empty() || source_path.ends_with('/') || source_path.ends_with('\\') {
        return None;
    }
    Path::new(source_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
}

/// Output name derived for one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Join key, equal to the identifier of the input it belongs to
    pub identifier: String,
    /// `<stem>_masks_<model>-<variant>`
    pub artifact_name: String,
}

impl OutputSpec {
    pub fn for_record(record: &InputRecord, model: &ModelSpec) -> Self {
        Self {
            identifier: record.identifier.clone(),
            artifact_name: format!("{}{}", record.identifier, model.artifact_suffix()),
        }
    }
}

/// Recover the identifier from an artifact name produced for `model`.
pub fn artifact_identifier<'a>(artifact_name: &'a str, model: &ModelSpec) -> Option<&'a str> {
    artifact_name.strip_suffix(&model.artifact_suffix())
}

/// An input joined with its output name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedRecord {
    pub identifier: String,
    pub source_path: String,
    pub artifact_name: String,
}

impl PairedRecord {
    /// Join an input and its output on the identifier.
    ///
    /// Returns `None` if the join keys differ.
    pub fn join(input: InputRecord, output: OutputSpec) -> Option<Self> {
        if input.identifier != output.identifier {
            return None;
        }
        Some(Self {
            identifier: input.identifier,
            source_path: input.source_path,
            artifact_name: output.artifact_name,
        })
    }
}

/// Everything a backend needs for one run. Built once, passed immutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Paired records in manifest order
    pub records: Vec<PairedRecord>,
    /// Directory the backend writes masks into
    pub output_dir: PathBuf,
    /// Model parameter config handed to the backend
    pub model_config: Option<PathBuf>,
    /// Resolved checkpoint
    pub checkpoint: CheckpointHandle,
    /// Model variant (as selected, not sanitised)
    pub variant: String,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of a dispatched batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique identifier for this run
    pub run_id: String,
    /// Backend that executed the batch
    pub backend: String,
    /// True iff no record failed
    pub success: bool,
    /// Identifiers completed by the backend
    pub completed: Vec<String>,
    /// Identifiers that failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Identifiers not submitted because their masks already existed
    #[serde(default)]
    pub skipped: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Number of records the backend was asked to process.
    pub fn submitted(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

/// Statistics from a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Records paired from the manifest
    pub total_records: usize,

    /// Records skipped because their masks already existed
    pub total_skipped: usize,

    /// Records submitted to the backend
    pub total_submitted: usize,

    /// Records the backend completed
    pub total_succeeded: usize,

    /// Records the backend failed
    pub total_failed: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Records per hour throughput
    pub throughput_per_hour: f64,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.total_succeeded as f64 / self.runtime_secs * 3600.0;
        }
    }
}
