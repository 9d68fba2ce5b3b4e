use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

use simcheck_core::storage::models::{RunStage, RunStatus};
use simcheck_core::ProgressReporter;

/// CLI progress reporter using indicatif progress bars.
///
/// Each stage gets one bar: a counted bar when the item total is known up
/// front, a spinner for zero-item stages.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_stage_start(&self, stage: RunStage, total_items: usize) {
        let pb = if total_items == 0 {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .unwrap()
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            pb
        } else {
            let pb = ProgressBar::new(total_items as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "  {spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos}/{len} ({eta} remaining)",
                )
                .unwrap()
                .progress_chars("━╸─")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            pb
        };
        pb.set_message(stage.as_str());
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_stage_progress(&self, _stage: RunStage, completed: usize, _total: usize) {
        let guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.as_ref() {
            pb.set_position(completed as u64);
        }
    }

    fn on_stage_complete(&self, stage: RunStage, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m {} complete in {:.2}s",
            stage.as_str(),
            duration_secs
        );
    }

    fn on_item_skipped(&self, stage: RunStage, subject: &str, reason: &str) {
        let guard = self.bar.lock().unwrap();
        let line = format!(
            "  \x1b[33m!\x1b[0m {} skipped {}: {}",
            stage.as_str(),
            subject,
            reason
        );
        match guard.as_ref() {
            Some(pb) => pb.println(line),
            None => eprintln!("{line}"),
        }
    }

    fn on_run_complete(&self, _run_id: i64, _status: RunStatus) {
        self.finish_bar();
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}
