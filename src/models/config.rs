//! Configuration models for maskflow.
//!
//! One immutable `Config` is built at startup (TOML file, then CLI overrides)
//! and shared behind an `Arc` by every pipeline component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Top-level configuration for maskflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Parameters of the current run (model, variant, input, ...)
    #[serde(default)]
    pub run: RunConfig,

    /// Cache layout (checkpoints and masks live under the cache root)
    #[serde(default)]
    pub cache: CacheConfig,

    /// Checkpoint download settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Backend fan-out settings
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Checkpoint source catalogue: model -> variant -> source.
    /// Entries here are merged over the built-in catalogue.
    #[serde(default)]
    pub checkpoints: BTreeMap<String, BTreeMap<String, CheckpointSource>>,

    /// Backend commands keyed by model name.
    /// Entries here are merged over the built-in `sam` and `unet` backends.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Startup parameters of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model name, also the backend key (exact, case-sensitive)
    #[serde(default)]
    pub model: String,

    /// Model variant (e.g. "vit_b")
    #[serde(default)]
    pub variant: String,

    /// Task identifier (e.g. "mito", "everything")
    #[serde(default)]
    pub task: Option<String>,

    /// Model parameter config handed to the backend
    #[serde(default)]
    pub model_config: Option<PathBuf>,

    /// Manifest file or image directory
    #[serde(default)]
    pub input: Option<PathBuf>,

    /// Executor selection, forwarded to backends as MASKFLOW_EXECUTOR
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Re-run records whose masks already exist
    #[serde(default)]
    pub overwrite: bool,
}

fn default_executor() -> String {
    "local".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            variant: String::new(),
            task: None,
            model_config: None,
            input: None,
            executor: default_executor(),
            overwrite: false,
        }
    }
}

/// Cache layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache root; supports ${VAR} expansion
    #[serde(default = "default_cache_root")]
    pub root: String,
}

fn default_cache_root() -> String {
    "${HOME}/.maskflow/cache".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
        }
    }
}

/// Checkpoint download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum attempts per download
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Backend fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum records processed concurrently
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

fn default_pool_size() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

/// Checkpoint extension when neither the config nor the source names one.
pub const DEFAULT_CHECKPOINT_EXTENSION: &str = "pth";

/// Where a checkpoint comes from when it is not in the cache yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointSource {
    /// Download over HTTP(S)
    Url {
        url: String,
        #[serde(default)]
        extension: Option<String>,
    },
    /// Copy from a locally reachable directory
    Dir {
        dir: String,
        filename: String,
        #[serde(default)]
        extension: Option<String>,
    },
}

impl CheckpointSource {
    /// Human-readable location, with ${VAR} expanded.
    pub fn location(&self) -> String {
        match self {
            Self::Url { url, .. } => expand_env_vars(url),
            Self::Dir { dir, filename, .. } => Path::new(&expand_env_vars(dir))
                .join(filename)
                .display()
                .to_string(),
        }
    }

    /// File extension of the cached checkpoint.
    ///
    /// Explicit `extension` wins, then the extension of the source file name,
    /// then `DEFAULT_CHECKPOINT_EXTENSION`.
    pub fn extension(&self) -> String {
        let (explicit, name) = match self {
            Self::Url { url, extension } => (extension, url.rsplit('/').next().unwrap_or("")),
            Self::Dir {
                filename,
                extension,
                ..
            } => (extension, filename.as_str()),
        };

        if let Some(ext) = explicit {
            return ext.trim_start_matches('.').to_string();
        }

        let name = name.split(['?', '#']).next().unwrap_or(name);
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_CHECKPOINT_EXTENSION)
            .to_string()
    }
}

/// External command implementing a model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable to launch once per record
    pub program: String,

    /// Leading arguments (typically the script path)
    #[serde(default)]
    pub args: Vec<String>,

    /// Whether the backend takes `--model-type <variant>`
    #[serde(default)]
    pub pass_variant: bool,

    /// Extra environment variables; values support ${VAR} expansion
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Built-in backends: SAM takes the variant, UNet does not.
fn builtin_backends() -> BTreeMap<String, BackendConfig> {
    let mut backends = BTreeMap::new();
    backends.insert(
        "sam".to_string(),
        BackendConfig {
            program: "python".to_string(),
            args: vec!["run_sam.py".to_string()],
            pass_variant: true,
            env: BTreeMap::new(),
        },
    );
    backends.insert(
        "unet".to_string(),
        BackendConfig {
            program: "python".to_string(),
            args: vec!["run_unet.py".to_string()],
            pass_variant: false,
            env: BTreeMap::new(),
        },
    );
    backends
}

/// Built-in checkpoint catalogue for the public Segment Anything weights.
fn builtin_checkpoints() -> BTreeMap<String, BTreeMap<String, CheckpointSource>> {
    let sam = [
        (
            "default",
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_h_4b8939.pth",
        ),
        (
            "vit_h",
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_h_4b8939.pth",
        ),
        (
            "vit_l",
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_l_0b3195.pth",
        ),
        (
            "vit_b",
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_b_01ec64.pth",
        ),
        (
            "MedSAM",
            "https://syncandshare.desy.de/index.php/s/yLfdFbpfEGSHJWY/download/medsam_20230423_vit_b_0.0.1.pth",
        ),
    ]
    .into_iter()
    .map(|(variant, url)| {
        (
            variant.to_string(),
            CheckpointSource::Url {
                url: url.to_string(),
                extension: None,
            },
        )
    })
    .collect();

    let mut catalogue = BTreeMap::new();
    catalogue.insert("sam".to_string(), sam);
    catalogue
}

/// Values overriding `[run]` from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub model: Option<String>,
    pub variant: Option<String>,
    pub task: Option<String>,
    pub model_config: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub executor: Option<String>,
    pub overwrite: bool,
    pub workers: Option<usize>,
    pub cache_root: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load configuration from a TOML file, or fall back to defaults if the
    /// file does not exist.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply command line overrides. Called once, before the config is frozen.
    pub fn apply_overrides(&mut self, overrides: RunOverrides) {
        if let Some(model) = overrides.model {
            self.run.model = model;
        }
        if let Some(variant) = overrides.variant {
            self.run.variant = variant;
        }
        if overrides.task.is_some() {
            self.run.task = overrides.task;
        }
        if overrides.model_config.is_some() {
            self.run.model_config = overrides.model_config;
        }
        if overrides.input.is_some() {
            self.run.input = overrides.input;
        }
        if let Some(executor) = overrides.executor {
            self.run.executor = executor;
        }
        if overrides.overwrite {
            self.run.overwrite = true;
        }
        if let Some(size) = overrides.workers {
            self.workers.size = size;
        }
        if let Some(root) = overrides.cache_root {
            self.cache.root = root.display().to_string();
        }
    }

    /// Check that the run parameters are complete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.model.trim().is_empty() {
            return Err(ConfigError::Missing("run.model"));
        }
        if self.run.variant.trim().is_empty() {
            return Err(ConfigError::Missing("run.variant"));
        }
        if self.run.input.is_none() {
            return Err(ConfigError::Missing("run.input"));
        }
        if self.workers.size == 0 {
            return Err(ConfigError::Invalid(
                "workers.size must be at least 1".to_string(),
            ));
        }
        for (name, backend) in &self.backends {
            if backend.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backends.{name}.program is empty"
                )));
            }
        }
        Ok(())
    }

    /// Cache root with ${VAR} expanded.
    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.cache.root))
    }

    /// Backend commands: built-ins overlaid with configured entries.
    pub fn backend_configs(&self) -> BTreeMap<String, BackendConfig> {
        let mut backends = builtin_backends();
        for (name, backend) in &self.backends {
            backends.insert(name.clone(), backend.clone());
        }
        backends
    }

    /// Look up the checkpoint source for a model variant.
    ///
    /// Configured entries take precedence over the built-in catalogue.
    pub fn checkpoint_source(&self, model: &str, variant: &str) -> Option<CheckpointSource> {
        self.checkpoints
            .get(model)
            .and_then(|variants| variants.get(variant))
            .cloned()
            .or_else(|| {
                builtin_checkpoints()
                    .get(model)
                    .and_then(|variants| variants.get(variant))
                    .cloned()
            })
    }

    /// Extension of the cached checkpoint for a model variant, whether or not
    /// it has a source.
    pub fn checkpoint_extension(&self, model: &str, variant: &str) -> String {
        self.checkpoint_source(model, variant)
            .map(|source| source.extension())
            .unwrap_or_else(|| DEFAULT_CHECKPOINT_EXTENSION.to_string())
    }
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing required parameter '{0}' (set it in the config file or on the command line)")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
