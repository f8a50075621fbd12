//! Run aggregation and completion observers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::model::{CaseStatus, CaseSummary, Counts, ExecutionMode, RunSummary};

/// Merge per-case summaries into the run summary.
///
/// Case and step counters are summed and `success` holds only when every
/// case succeeded. Concurrent cases overlap, so the run lasts as long as
/// the slowest one; sequential cases add up. Details keep the order they
/// were submitted in.
pub fn merge(
    run_id: &str,
    summaries: Vec<CaseSummary>,
    mode: ExecutionMode,
) -> RunSummary {
    let mut counts = Counts::default();
    let mut step_counts = Counts::default();

    for summary in &summaries {
        match summary.status {
            CaseStatus::Skipped => counts.skip(),
            _ => counts.record(summary.success),
        }
        step_counts.add(&summary.counts);
    }

    let durations = summaries.iter().map(|s| s.duration_ms);
    let duration_ms = match mode {
        ExecutionMode::Concurrent => durations.max().unwrap_or(0),
        ExecutionMode::Sequential => durations.sum(),
    };
    let start_time = summaries
        .iter()
        .map(|s| s.start_time)
        .min()
        .unwrap_or_else(Utc::now);

    RunSummary {
        run_id: run_id.to_string(),
        mode,
        success: summaries.iter().all(|s| s.success),
        counts,
        step_counts,
        start_time,
        duration_ms,
        details: summaries,
    }
}

/// Completion callback, invoked once per run with the merged summary.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn on_complete(
        &self,
        run_id: &str,
        summary: &RunSummary,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Yaml,
    Text,
}

/// Writes one report file per run into a directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
    format: ReportFormat,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `summary` and return the file path.
    pub fn write(&self, summary: &RunSummary) -> Result<PathBuf> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).context(format!(
                "Failed to create report directory: {}",
                self.dir.display()
            ))?;
        }

        let timestamp = Utc::now().timestamp();
        let sanitized = summary.run_id.replace([' ', '/'], "_");

        let (filename, content) = match self.format {
            ReportFormat::Json => (
                format!("{sanitized}-{timestamp}.json"),
                serde_json::to_string_pretty(summary)?,
            ),
            ReportFormat::Yaml => (
                format!("{sanitized}-{timestamp}.yaml"),
                serde_yaml::to_string(summary)?,
            ),
            ReportFormat::Text => (
                format!("{sanitized}-{timestamp}.txt"),
                render_text(summary),
            ),
        };

        let path = self.dir.join(filename);
        fs::write(&path, content)
            .context(format!("Failed to write report: {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl RunObserver for ReportWriter {
    async fn on_complete(
        &self,
        run_id: &str,
        summary: &RunSummary,
    ) -> Result<()> {
        let path = self.write(summary)?;
        info!(run_id, "Report saved: {}", path.display());
        Ok(())
    }
}

fn pass_fail(success: bool) -> &'static str {
    if success {
        "PASS"
    } else {
        "FAIL"
    }
}

/// Plain-text rendering of a run.
pub fn render_text(summary: &RunSummary) -> String {
    let mut content = String::new();
    content.push_str(&format!("Run: {}\n", summary.run_id));
    content.push_str(&format!("Status: {}\n", pass_fail(summary.success)));
    content.push_str(&format!("Mode: {:?}\n", summary.mode));
    content.push_str(&format!(
        "Started: {}\n",
        summary.start_time.to_rfc3339()
    ));
    content.push_str(&format!("Duration: {} ms\n", summary.duration_ms));
    content.push_str(&format!(
        "Cases: {} total, {} passed, {} failed, {} skipped\n",
        summary.counts.total,
        summary.counts.pass,
        summary.counts.fail,
        summary.counts.skipped
    ));
    content.push_str(&format!(
        "Steps: {} total, {} passed, {} failed, {} skipped\n\n",
        summary.step_counts.total,
        summary.step_counts.pass,
        summary.step_counts.fail,
        summary.step_counts.skipped
    ));

    for case in &summary.details {
        content.push_str(&format!(
            "Case {} {} ({:?}, {} ms)\n",
            case.case_id, case.name, case.status, case.duration_ms
        ));
        if let Some(error) = &case.error {
            content.push_str(&format!("  Error: {error}\n"));
        }
        for (i, step) in case.steps.iter().enumerate() {
            content.push_str(&format!(
                "  {}. {} ({})\n",
                i + 1,
                step.name,
                pass_fail(step.success)
            ));
            if let Some(error) = &step.error {
                content.push_str(&format!("     Error: {error}\n"));
            }
            content.push_str(&format!(
                "     Duration: {} ms\n",
                step.duration_ms
            ));
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn case(
        case_id: u64,
        success: bool,
        duration_ms: u64,
        offset_ms: i64,
    ) -> CaseSummary {
        let mut counts = Counts::default();
        counts.record(success);
        counts.record(true);
        CaseSummary {
            case_id,
            name: format!("case {case_id}"),
            status: if success {
                CaseStatus::Passed
            } else {
                CaseStatus::Failed
            },
            success,
            error: (!success).then(|| "some steps failed".to_string()),
            counts,
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + Duration::milliseconds(offset_ms),
            duration_ms,
            steps: vec![],
        }
    }

    #[test]
    fn one_failing_case_fails_the_run() {
        let summary = merge(
            "r1",
            vec![
                case(1, true, 10, 0),
                case(2, false, 20, 0),
                case(3, false, 30, 0),
            ],
            ExecutionMode::Concurrent,
        );
        assert!(!summary.success);
        assert_eq!(summary.counts.total, 3);
        assert_eq!(summary.counts.pass, 1);
        assert_eq!(summary.counts.fail, 2);
        assert_eq!(summary.step_counts.total, 6);
        assert_eq!(summary.step_counts.fail, 2);
    }

    #[test]
    fn duration_is_max_when_concurrent_and_sum_when_sequential() {
        let cases = || vec![case(1, true, 10, 0), case(2, true, 25, 0)];
        let duration = |mode| merge("r", cases(), mode).duration_ms;
        assert_eq!(duration(ExecutionMode::Concurrent), 25);
        assert_eq!(duration(ExecutionMode::Sequential), 35);
    }

    #[test]
    fn details_keep_submission_order_and_earliest_start() {
        let summary = merge(
            "r",
            vec![
                case(3, true, 1, 50),
                case(1, true, 1, 0),
                case(2, true, 1, 20),
            ],
            ExecutionMode::Concurrent,
        );
        let ids: Vec<u64> = summary.details.iter().map(|d| d.case_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(summary.start_time, summary.details[1].start_time);
        assert!(summary.success);
    }

    #[test]
    fn excluded_counts_as_failed_and_skipped_is_separate() {
        let mut excluded = case(1, false, 0, 0);
        excluded.status = CaseStatus::Excluded;
        let mut skipped = case(2, true, 0, 0);
        skipped.status = CaseStatus::Skipped;
        let summary =
            merge("r", vec![excluded, skipped], ExecutionMode::Sequential);
        assert_eq!(summary.counts.fail, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.counts.total, 1);
    }

    #[test]
    fn empty_run_succeeds() {
        let summary = merge("r", vec![], ExecutionMode::Concurrent);
        assert!(summary.success);
        assert_eq!(summary.duration_ms, 0);
        assert_eq!(summary.mode, ExecutionMode::Concurrent);
    }

    #[test]
    fn writer_produces_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let summary = merge(
            "nightly run",
            vec![case(1, true, 5, 0), case(2, false, 5, 0)],
            ExecutionMode::Sequential,
        );

        let json_path = ReportWriter::new(dir.path(), ReportFormat::Json)
            .write(&summary)
            .unwrap();
        assert!(json_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("nightly_run-"));
        let written = std::fs::read_to_string(&json_path).unwrap();
        let parsed: RunSummary = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.counts, summary.counts);

        let yaml_path = ReportWriter::new(dir.path(), ReportFormat::Yaml)
            .write(&summary)
            .unwrap();
        assert_eq!(yaml_path.extension().unwrap(), "yaml");

        let nested = dir.path().join("nested");
        let text_path = ReportWriter::new(nested, ReportFormat::Text)
            .write(&summary)
            .unwrap();
        let text = std::fs::read_to_string(text_path).unwrap();
        assert!(text.contains("Status: FAIL"));
        assert!(text.contains("Case 2 case 2 (Failed"));
    }

    #[tokio::test]
    async fn writer_is_an_observer() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), ReportFormat::Json);
        let summary = merge("obs", vec![], ExecutionMode::Sequential);
        writer.on_complete("obs", &summary).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
