//! Mask generation pipeline.
//!
//! Pipeline flow:
//! (Checkpoint resolve || Manifest -> Pairing) -> Skip existing -> Dispatch -> Report
//!
//! The model name is checked against the registry before any work starts.
//! Resolution and pairing then run concurrently; if either fails nothing is
//! dispatched. The reporter hears the outcome of every run, failed or not.

use crate::backend::BackendRegistry;
use crate::checkpoint::{CheckpointFetcher, SourceFetcher, resolve};
use crate::models::{
    Batch, CheckpointHandle, Config, ConfigError, MaskflowError, ModelSpec, PairedRecord, Result,
    RunStats, Stage,
};
use crate::pipeline::{CompletionReporter, PathLayout, Reporter, pair, prepare_manifest};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// One configured mask generation run.
pub struct Pipeline {
    config: Arc<Config>,
    fetcher: Arc<dyn CheckpointFetcher>,
    registry: BackendRegistry,
    reporter: Arc<dyn Reporter>,
}

impl Pipeline {
    /// Create a pipeline with explicit collaborators.
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<dyn CheckpointFetcher>,
        registry: BackendRegistry,
    ) -> Self {
        Self {
            config,
            fetcher,
            registry,
            reporter: Arc::new(CompletionReporter::new()),
        }
    }

    /// Replace the completion reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Create a pipeline with the configured fetcher and backends.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let fetcher = Arc::new(SourceFetcher::new(Arc::clone(&config))?);
        let registry = BackendRegistry::from_config(&config);
        Ok(Self::new(config, fetcher, registry))
    }

    pub fn model(&self) -> ModelSpec {
        ModelSpec::new(&self.config.run.model, &self.config.run.variant)
    }

    pub fn layout(&self) -> PathLayout {
        PathLayout::new(self.config.cache_root())
    }

    /// Make sure the checkpoint for the selected model is cached.
    pub async fn resolve_checkpoint(&self) -> Result<CheckpointHandle> {
        let model = self.model();
        let extension = self.config.checkpoint_extension(&model.name, &model.variant);

        let model_dir = self.layout().model_dir(&model);
        resolve(
            &model_dir,
            &model.checkpoint_file_name(&extension),
            &model,
            self.fetcher.as_ref(),
        )
        .await
    }

    /// Prepare the manifest and pair its records, off the async runtime.
    pub async fn pair_records(&self) -> Result<Vec<PairedRecord>> {
        let input = self
            .config
            .run
            .input
            .clone()
            .ok_or(ConfigError::Missing("run.input"))?;
        let layout = self.layout();
        let model = self.model();

        tokio::task::spawn_blocking(move || {
            let manifest = prepare_manifest(&input, &layout)?;
            pair(&manifest, &model)
        })
        .await
        .map_err(|e| MaskflowError::internal(Stage::Pairing, format!("pairing task failed: {e}")))?
    }

    /// Split off records whose final artifact already exists.
    fn partition_existing(&self, records: Vec<PairedRecord>) -> (Vec<PairedRecord>, Vec<String>) {
        if self.config.run.overwrite {
            return (records, Vec::new());
        }
        let mask_dir = self.layout().mask_dir(&self.model());
        let (existing, pending): (Vec<_>, Vec<_>) = records.into_iter().partition(|record| {
            PathLayout::final_artifact_path(&mask_dir, &record.artifact_name).is_file()
        });
        (pending, existing.into_iter().map(|r| r.identifier).collect())
    }

    /// Run the pipeline end to end.
    ///
    /// `on_complete` is called exactly once, with `false` for any error.
    pub async fn run(&self) -> Result<RunStats> {
        let result = self.execute().await;
        self.reporter.on_complete(result.is_ok());
        result
    }

    async fn execute(&self) -> Result<RunStats> {
        let start = Instant::now();
        let model = self.model();
        let layout = self.layout();

        info!(
            model = %model.name,
            variant = %model.variant,
            task = self.config.run.task.as_deref().unwrap_or("-"),
            executor = %self.config.run.executor,
            cache = %layout.cache_root().display(),
            "Starting mask pipeline"
        );

        self.registry.require(&model)?;
        let (checkpoint, records) = tokio::try_join!(self.resolve_checkpoint(), self.pair_records())?;

        let mut stats = RunStats {
            total_records: records.len(),
            ..Default::default()
        };

        let (pending, skipped) = self.partition_existing(records);
        stats.total_skipped = skipped.len();

        if pending.is_empty() {
            if skipped.is_empty() {
                info!("Manifest has no records, nothing to do");
            } else {
                info!(skipped = skipped.len(), "Masks already exist, nothing to do");
            }
            stats.runtime_secs = start.elapsed().as_secs_f64();
            return Ok(stats);
        }

        if !skipped.is_empty() {
            info!(
                skipped = skipped.len(),
                pending = pending.len(),
                "Skipping records with existing masks"
            );
        }

        let batch = Batch {
            records: pending,
            output_dir: layout.mask_dir(&model),
            model_config: self.config.run.model_config.clone(),
            checkpoint,
            variant: model.variant.clone(),
        };
        stats.total_submitted = batch.len();

        let mut result = self.registry.dispatch(&model, &batch).await?;
        result.skipped = skipped;

        stats.total_succeeded = result.completed.len();
        stats.total_failed = result.failed.len();
        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        info!(
            run_id = %result.run_id,
            succeeded = stats.total_succeeded,
            failed = stats.total_failed,
            skipped = stats.total_skipped,
            throughput = format!("{:.0}/hr", stats.throughput_per_hour),
            "Backend run complete"
        );

        if !result.success {
            return Err(MaskflowError::BackendFailure {
                backend: result.backend,
                failed: stats.total_failed,
                total: stats.total_submitted,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::models::RunResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl CheckpointFetcher for FakeFetcher {
        async fn fetch(&self, _model: &ModelSpec, destination: &Path) -> Result<CheckpointHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MaskflowError::fetch_failed("https://example.org/sam.pth", "404"));
            }
            std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
            std::fs::write(destination, b"weights").unwrap();
            Ok(CheckpointHandle::located(destination))
        }
    }

    /// Backend that records batches and fails the listed identifiers.
    struct FakeBackend {
        batches: Mutex<Vec<Batch>>,
        fail: Vec<String>,
    }

    impl FakeBackend {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn calls(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn name(&self) -> &str {
            "sam"
        }

        async fn run(&self, batch: &Batch) -> Result<RunResult> {
            self.batches.lock().unwrap().push(batch.clone());
            let (failed, completed): (Vec<_>, Vec<_>) = batch
                .records
                .iter()
                .map(|r| r.identifier.clone())
                .partition(|id| self.fail.contains(id));
            let now = Utc::now();
            Ok(RunResult {
                run_id: "test".to_string(),
                backend: "sam".to_string(),
                success: failed.is_empty(),
                completed,
                failed: failed.into_iter().map(|id| (id, "exit 1".to_string())).collect(),
                skipped: Vec::new(),
                started_at: now,
                finished_at: now,
            })
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        outcomes: Mutex<Vec<bool>>,
    }

    impl RecordingReporter {
        fn new() -> Arc<Self> {
            Arc::default()
        }
    }

    impl Reporter for RecordingReporter {
        fn on_complete(&self, success: bool) {
            self.outcomes.lock().unwrap().push(success);
        }
    }

    struct Fixture {
        dir: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new(manifest: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let manifest_path = dir.path().join("manifest.txt");
            std::fs::write(&manifest_path, manifest).unwrap();

            let mut config = Config::default();
            config.run.model = "sam".to_string();
            config.run.variant = "vit_b".to_string();
            config.run.input = Some(manifest_path);
            config.cache.root = dir.path().join("cache").display().to_string();
            Self { dir, config }
        }

        fn cache(&self) -> std::path::PathBuf {
            self.dir.path().join("cache")
        }

        fn pipeline(&self, fetcher: Arc<FakeFetcher>, backend: Arc<FakeBackend>) -> Pipeline {
            let mut registry = BackendRegistry::new();
            registry.register("sam", backend);
            Pipeline::new(Arc::new(self.config.clone()), fetcher, registry)
        }
    }

    #[tokio::test]
    async fn test_run_dispatches_paired_batch() {
        let fx = Fixture::new("/data/a.png\n/data/b.png\n");
        let fetcher = FakeFetcher::new(false);
        let backend = FakeBackend::new(&[]);

        let stats = fx.pipeline(fetcher.clone(), backend.clone()).run().await.unwrap();

        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.total_succeeded, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let batches = backend.batches.lock().unwrap();
        let batch = &batches[0];
        assert_eq!(batch.output_dir, fx.cache().join("sam").join("vit_b_masks"));
        assert_eq!(
            batch.checkpoint.path,
            fx.cache().join("sam/checkpoints/sam_vit_b.pth")
        );
        assert_eq!(batch.variant, "vit_b");
        let names: Vec<_> = batch.records.iter().map(|r| r.artifact_name.as_str()).collect();
        assert_eq!(names, vec!["a_masks_sam-vit_b", "b_masks_sam-vit_b"]);
    }

    #[tokio::test]
    async fn test_cached_checkpoint_is_not_fetched() {
        let fx = Fixture::new("/data/a.png\n");
        let ckpt = fx.cache().join("sam/checkpoints/sam_vit_b.pth");
        std::fs::create_dir_all(ckpt.parent().unwrap()).unwrap();
        std::fs::write(&ckpt, b"weights").unwrap();

        let fetcher = FakeFetcher::new(true);
        let backend = FakeBackend::new(&[]);
        fx.pipeline(fetcher.clone(), backend.clone()).run().await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_prevents_dispatch() {
        let fx = Fixture::new("/data/a.png\n");
        let backend = FakeBackend::new(&[]);

        let err = fx
            .pipeline(FakeFetcher::new(true), backend.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::FetchFailed { .. }));
        assert_eq!(err.stage().to_string(), "checkpoint");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_prevents_dispatch() {
        let fx = Fixture::new("/x/a.png\n/y/a.png\n");
        let backend = FakeBackend::new(&[]);

        let err = fx
            .pipeline(FakeFetcher::new(false), backend.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::DuplicateIdentifier { .. }));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_is_unsupported() {
        let mut fx = Fixture::new("/data/a.png\n");
        fx.config.run.model = "unknown-model".to_string();
        let fetcher = FakeFetcher::new(false);
        let backend = FakeBackend::new(&[]);

        let err = fx
            .pipeline(fetcher.clone(), backend.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, MaskflowError::UnsupportedModel { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_touches_nothing_with_configured_backends() {
        let mut fx = Fixture::new("/data/a.png\n");
        fx.config.run.model = "unknown-model".to_string();
        let config = Arc::new(fx.config.clone());
        let fetcher = FakeFetcher::new(false);

        let pipeline = Pipeline::new(
            Arc::clone(&config),
            fetcher.clone(),
            BackendRegistry::from_config(&config),
        );
        let err = pipeline.run().await.unwrap_err();

        match err {
            MaskflowError::UnsupportedModel { model, available } => {
                assert_eq!(model, "unknown-model");
                assert_eq!(available, vec!["sam".to_string(), "unet".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(!fx.cache().exists());

        let err = Pipeline::from_config(config).unwrap().run().await.unwrap_err();
        assert!(matches!(err, MaskflowError::UnsupportedModel { .. }));
        assert_eq!(err.stage(), Stage::Dispatch);
        assert!(!fx.cache().exists());
    }

    #[tokio::test]
    async fn test_reporter_hears_every_outcome() {
        let fx = Fixture::new("/data/a.png\n");

        let reporter = RecordingReporter::new();
        fx.pipeline(FakeFetcher::new(false), FakeBackend::new(&[]))
            .with_reporter(reporter.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(*reporter.outcomes.lock().unwrap(), vec![true]);

        let reporter = RecordingReporter::new();
        fx.pipeline(FakeFetcher::new(true), FakeBackend::new(&[]))
            .with_reporter(reporter.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(*reporter.outcomes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_reporter_hears_pairing_and_backend_failures() {
        let fx = Fixture::new("/x/a.png\n/y/a.png\n");
        let reporter = RecordingReporter::new();
        fx.pipeline(FakeFetcher::new(false), FakeBackend::new(&[]))
            .with_reporter(reporter.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(*reporter.outcomes.lock().unwrap(), vec![false]);

        let fx = Fixture::new("/data/a.png\n/data/b.png\n");
        let reporter = RecordingReporter::new();
        fx.pipeline(FakeFetcher::new(false), FakeBackend::new(&["a"]))
            .with_reporter(reporter.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(*reporter.outcomes.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_existing_masks_are_skipped() {
        let fx = Fixture::new("/data/a.png\n/data/b.png\n");
        let mask_dir = fx.cache().join("sam/vit_b_masks");
        std::fs::create_dir_all(&mask_dir).unwrap();
        std::fs::write(mask_dir.join("a_masks_sam-vit_b_all.npy"), b"npy").unwrap();

        let backend = FakeBackend::new(&[]);
        let stats = fx
            .pipeline(FakeFetcher::new(false), backend.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(stats.total_skipped, 1);
        assert_eq!(stats.total_submitted, 1);
        let batches = backend.batches.lock().unwrap();
        assert_eq!(batches[0].records.len(), 1);
        assert_eq!(batches[0].records[0].identifier, "b");
    }

    #[tokio::test]
    async fn test_all_existing_masks_skip_backend() {
        let mut fx = Fixture::new("/data/a.png\n");
        let mask_dir = fx.cache().join("sam/vit_b_masks");
        std::fs::create_dir_all(&mask_dir).unwrap();
        std::fs::write(mask_dir.join("a_masks_sam-vit_b_all.npy"), b"npy").unwrap();

        let backend = FakeBackend::new(&[]);
        let stats = fx
            .pipeline(FakeFetcher::new(false), backend.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(stats.total_skipped, 1);
        assert_eq!(backend.calls(), 0);

        fx.config.run.overwrite = true;
        fx.pipeline(FakeFetcher::new(false), backend.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_records_fail_the_run() {
        let fx = Fixture::new("/data/a.png\n/data/b.png\n");
        let backend = FakeBackend::new(&["b"]);

        let err = fx
            .pipeline(FakeFetcher::new(false), backend)
            .run()
            .await
            .unwrap_err();

        match err {
            MaskflowError::BackendFailure {
                backend,
                failed,
                total,
            } => {
                assert_eq!(backend, "sam");
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_input_is_config_error() {
        let mut fx = Fixture::new("");
        fx.config.run.input = None;
        let err = fx
            .pipeline(FakeFetcher::new(false), FakeBackend::new(&[]))
            .pair_records()
            .await
            .unwrap_err();
        assert!(matches!(err, MaskflowError::Config(ConfigError::Missing("run.input"))));
    }
}
