//! Command-line backend.
//!
//! Launches the configured program once per record:
//!
//! ```text
//! <program> <args..> --img-path <src> --mask-fname <artifact> --output-dir <dir>
//!     --model-chkpt <checkpoint> [--model-type <variant>] [--model-config <cfg>]
//! ```
//!
//! Records fan out through a `WorkerPool`. A record fails when its command
//! cannot be spawned or exits non-zero.

use crate::backend::Backend;
use crate::models::{
    BackendConfig, Batch, MaskflowError, PairedRecord, Result, RunResult, Stage, expand_env_vars,
};
use crate::pool::WorkerPool;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable carrying the executor selection to the command.
pub const EXECUTOR_ENV: &str = "MASKFLOW_EXECUTOR";

/// Backend that shells out to an external program.
pub struct CommandBackend {
    name: String,
    config: BackendConfig,
    pool: WorkerPool,
    executor: String,
}

impl CommandBackend {
    pub fn new(
        name: impl Into<String>,
        config: BackendConfig,
        pool: WorkerPool,
        executor: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            pool,
            executor: executor.into(),
        }
    }

    /// Invocation shared by every record of one batch.
    fn invocation(&self, batch: &Batch) -> Invocation {
        let mut env: BTreeMap<String, String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_vars(v)))
            .collect();
        env.insert(EXECUTOR_ENV.to_string(), self.executor.clone());

        Invocation {
            backend: self.name.clone(),
            program: self.config.program.clone(),
            args: self.config.args.clone(),
            env,
            output_dir: batch.output_dir.clone(),
            checkpoint: batch.checkpoint.path.clone(),
            variant: self.config.pass_variant.then(|| batch.variant.clone()),
            model_config: batch.model_config.clone(),
        }
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, batch: &Batch) -> Result<RunResult> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();

        fs::create_dir_all(&batch.output_dir).await.map_err(|e| {
            MaskflowError::io(
                Stage::Backend,
                format!("creating output directory {}", batch.output_dir.display()),
                e,
            )
        })?;

        info!(
            run_id = %run_id,
            backend = %self.name,
            program = %self.config.program,
            records = batch.len(),
            workers = self.pool.size(),
            "Starting backend run"
        );

        let invocation = Arc::new(self.invocation(batch));
        let outcomes = self
            .pool
            .submit_all(&batch.records, move |record| {
                let invocation = Arc::clone(&invocation);
                async move { invocation.run_record(&record).await }
            })
            .await;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => completed.push(outcome.identifier),
                Err(e) => {
                    warn!(identifier = %outcome.identifier, error = %e, "Record failed");
                    failed.push((outcome.identifier, e.to_string()));
                }
            }
        }

        Ok(RunResult {
            run_id,
            backend: self.name.clone(),
            success: failed.is_empty(),
            completed,
            failed,
            skipped: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Everything needed to build one record's command line.
struct Invocation {
    backend: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    output_dir: PathBuf,
    checkpoint: PathBuf,
    variant: Option<String>,
    model_config: Option<PathBuf>,
}

impl Invocation {
    fn command(&self, record: &PairedRecord) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--img-path")
            .arg(&record.source_path)
            .arg("--mask-fname")
            .arg(&record.artifact_name)
            .arg("--output-dir")
            .arg(&self.output_dir)
            .arg("--model-chkpt")
            .arg(&self.checkpoint);
        if let Some(variant) = &self.variant {
            cmd.arg("--model-type").arg(variant);
        }
        if let Some(model_config) = &self.model_config {
            cmd.arg("--model-config").arg(model_config);
        }
        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run_record(&self, record: &PairedRecord) -> Result<()> {
        debug!(
            backend = %self.backend,
            identifier = %record.identifier,
            source = %record.source_path,
            "Launching"
        );

        let status = self.command(record).status().await.map_err(|e| {
            MaskflowError::io(
                Stage::Backend,
                format!("spawning '{}' for {}", self.program, record.identifier),
                e,
            )
        })?;

        if !status.success() {
            return Err(MaskflowError::internal(
                Stage::Backend,
                format!("'{}' {status} for {}", self.program, record.source_path),
            ));
        }
        Ok(())
    }
}
