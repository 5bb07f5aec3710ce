//! maskflow CLI - batch mask generation over image manifests.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use maskflow::{
    CompletionReporter, Config, ConfigError, MaskflowError, ModelSpec, Pipeline, RunOverrides,
    SourceFetcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "maskflow")]
#[command(version)]
#[command(about = "Batch mask generation: resolve checkpoint, pair manifest, dispatch to a model backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults are used if it does not exist)
    #[arg(short, long, global = true, default_value = "maskflow.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: resolve checkpoint, pair, dispatch, report
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Print run statistics as JSON instead of the summary block
        #[arg(long)]
        json: bool,
    },

    /// Pair the manifest and print the records without running anything
    Pair {
        #[command(flatten)]
        args: RunArgs,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Make sure the checkpoint for the selected model is cached
    Fetch(RunArgs),

    /// Validate configuration file and run parameters
    Validate(RunArgs),

    /// Show example configuration
    Example,
}

/// Run parameters; each overrides the matching `[run]` value.
#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Model name (selects the backend)
    #[arg(short, long)]
    model: Option<String>,

    /// Model variant (selects the checkpoint)
    #[arg(long)]
    variant: Option<String>,

    /// Task label, recorded in the logs
    #[arg(long)]
    task: Option<String>,

    /// Model parameter config passed to the backend
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Manifest file or directory of images
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Executor selection, forwarded to the backend as MASKFLOW_EXECUTOR
    #[arg(short, long)]
    executor: Option<String>,

    /// Regenerate masks that already exist
    #[arg(long)]
    overwrite: bool,

    /// Number of concurrent backend processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Cache root (checkpoints, masks, manifest)
    #[arg(long)]
    cache_root: Option<PathBuf>,
}

impl From<RunArgs> for RunOverrides {
    fn from(args: RunArgs) -> Self {
        Self {
            model: args.model,
            variant: args.variant,
            task: args.task,
            model_config: args.model_config,
            input: args.input,
            executor: args.executor,
            overwrite: args.overwrite,
            workers: args.workers,
            cache_root: args.cache_root,
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# maskflow configuration file

[run]
model = "sam"
variant = "vit_b"
# task = "segmentation"
# model_config = "configs/sam.yaml"
input = "data/images"          # directory of images, or a manifest file
executor = "local"
overwrite = false

[cache]
root = "${HOME}/.maskflow/cache"

[fetch]
timeout_secs = 600
max_retries = 3

[workers]
size = 4

# Checkpoint sources override the built-in SAM catalogue.
[checkpoints.sam]
vit_b = { url = "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_b_01ec64.pth" }

[checkpoints.unet]
"Attention U-Net" = { dir = "${MODELS_DIR}/unet", filename = "attention_unet.pt" }

# Backends override the built-in sam/unet commands.
[backends.sam]
program = "python"
args = ["scripts/run_sam.py"]
pass_variant = true

[backends.unet]
program = "python"
args = ["scripts/run_unet.py"]
env = { CUDA_VISIBLE_DEVICES = "0" }
"#;
    println!("{example}");
}

fn load_config(path: &Path, args: RunArgs) -> Result<Config> {
    let mut config = Config::from_file_or_default(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;
    config.apply_overrides(args.into());
    Ok(config)
}

fn require_model(config: &Config) -> Result<(), ConfigError> {
    if config.run.model.trim().is_empty() {
        return Err(ConfigError::Missing("run.model"));
    }
    if config.run.variant.trim().is_empty() {
        return Err(ConfigError::Missing("run.variant"));
    }
    Ok(())
}

/// Attach the failing stage to a pipeline error.
fn stage_failed(err: MaskflowError) -> anyhow::Error {
    let stage = err.stage();
    anyhow::Error::new(err).context(format!("{stage} stage failed"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate(args) => {
            let config = load_config(&cli.config, args)?;
            config.validate().context("Invalid run parameters")?;

            let backends = config.backend_configs();
            if !backends.contains_key(&config.run.model) {
                return Err(stage_failed(MaskflowError::UnsupportedModel {
                    model: config.run.model.clone(),
                    available: backends.keys().cloned().collect(),
                }));
            }
            let source = config
                .checkpoint_source(&config.run.model, &config.run.variant)
                .map(|s| s.location());

            info!("Configuration is valid");
            info!("  Model: {} ({})", config.run.model, config.run.variant);
            info!("  Backends: {}", backends.keys().cloned().collect::<Vec<_>>().join(", "));
            info!("  Checkpoint source: {}", source.as_deref().unwrap_or("cache only"));
            info!("  Cache: {}", config.cache_root().display());
            info!("  Workers: {}", config.workers.size);
            return Ok(());
        }

        Commands::Pair { args, json } => {
            let config = load_config(&cli.config, args)?;
            config.validate().context("Invalid run parameters")?;
            let pipeline = Pipeline::from_config(Arc::new(config))?;

            let records = pipeline.pair_records().await.map_err(stage_failed)?;
            for record in &records {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!("{}\t{}", record.source_path, record.artifact_name);
                }
            }
            info!(records = records.len(), "Pairing complete");
        }

        Commands::Fetch(args) => {
            let config = load_config(&cli.config, args)?;
            require_model(&config).context("Invalid run parameters")?;
            let config = Arc::new(config);
            let pipeline = Pipeline::new(
                Arc::clone(&config),
                Arc::new(SourceFetcher::new(Arc::clone(&config))?),
                Default::default(),
            );

            let handle = pipeline.resolve_checkpoint().await.map_err(stage_failed)?;
            println!("{}", handle.path.display());
        }

        Commands::Run { args, json } => {
            let config = load_config(&cli.config, args)?;
            config.validate().context("Invalid run parameters")?;
            let model = ModelSpec::new(&config.run.model, &config.run.variant);

            let pipeline = Pipeline::from_config(Arc::new(config))?;
            let stats = pipeline.run().await.map_err(stage_failed)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", CompletionReporter::new().summary(&model, &stats));
                println!("Masks:       {:?}", pipeline.layout().mask_dir(&model));
            }
        }
    }

    Ok(())
}
