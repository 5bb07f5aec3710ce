//! Completion reporting.

use crate::models::{ModelSpec, RunStats};
use std::fmt::Write;
use tracing::{error, info};

/// Receives the terminal outcome of a run, exactly once per run.
pub trait Reporter: Send + Sync {
    fn on_complete(&self, success: bool);
}

/// Logs the terminal outcome of a run. Holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionReporter;

impl Reporter for CompletionReporter {
    fn on_complete(&self, success: bool) {
        if success {
            info!("Pipeline finished");
        } else {
            error!("Pipeline failed");
        }
    }
}

impl CompletionReporter {
    pub fn new() -> Self {
        Self
    }

    /// Human-readable summary block for the terminal.
    pub fn summary(&self, model: &ModelSpec, stats: &RunStats) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\n=== Mask Generation Complete ===");
        let _ = writeln!(out, "Model:       {} ({})", model.name, model.variant);
        let _ = writeln!(out, "Records:     {}", stats.total_records);
        let _ = writeln!(out, "Skipped:     {}", stats.total_skipped);
        let _ = writeln!(out, "Submitted:   {}", stats.total_submitted);
        let _ = writeln!(out, "Succeeded:   {}", stats.total_succeeded);
        let _ = writeln!(out, "Failed:      {}", stats.total_failed);
        let _ = writeln!(out, "Throughput:  {:.0}/hr", stats.throughput_per_hour);
        let _ = write!(out, "Runtime:     {:.1}s", stats.runtime_secs);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_reporter_is_a_reporter() {
        let reporter: &dyn Reporter = &CompletionReporter::new();
        reporter.on_complete(true);
        reporter.on_complete(false);
    }

    #[test]
    fn test_summary_lists_counts() {
        let stats = RunStats {
            total_records: 4,
            total_skipped: 1,
            total_submitted: 3,
            total_succeeded: 3,
            ..Default::default()
        };
        let text = CompletionReporter::new().summary(&ModelSpec::new("sam", "vit_b"), &stats);
        assert!(text.contains("Model:       sam (vit_b)"));
        assert!(text.contains("Skipped:     1"));
        assert!(text.contains("Succeeded:   3"));
    }
}
