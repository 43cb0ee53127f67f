//! Writes finished latency sessions to CSV files.

use std::fs;
use std::path::PathBuf;

use teleop_runtime::{ExportSink, LatencyReport, export_file_name, render_csv};
use teleop_types::TeleopError;
use tracing::info;

pub struct CsvFileSink {
    dir: PathBuf,
}

impl CsvFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where a report started at `report.session_started_at` lands.
    pub fn path_for(&self, report: &LatencyReport) -> PathBuf {
        self.dir.join(export_file_name(report.session_started_at))
    }
}

impl ExportSink for CsvFileSink {
    fn export(&self, report: &LatencyReport) -> Result<(), TeleopError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| TeleopError::Io(format!("{}: {e}", self.dir.display())))?;
        let path = self.path_for(report);
        fs::write(&path, render_csv(&report.results))
            .map_err(|e| TeleopError::Io(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), rows = report.results.len(), "latency results exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use teleop_runtime::{LatencyResult, MatchReason};

    fn report() -> LatencyReport {
        LatencyReport {
            session_started_at: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
            results: vec![LatencyResult {
                timestamp_ms: 2_000.0,
                latency_ms: 12.5,
                id: 1,
                manual: false,
                reason: MatchReason::TargetColor,
            }],
        }
    }

    #[test]
    fn writes_named_csv_into_export_dir() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let sink = CsvFileSink::new(dir.path().join("latency"));
        sink.export(&report()).expect("export");

        let path = dir
            .path()
            .join("latency")
            .join("latency_test_results_2025-01-02_03-04-05Z.csv");
        let body = std::fs::read_to_string(path).expect("csv written");
        assert_eq!(body, "timestamp,latency_ms\n2,12.5");
    }

    #[test]
    fn unwritable_dir_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let sink = CsvFileSink::new(blocker.join("nested"));
        assert!(matches!(sink.export(&report()), Err(TeleopError::Io(_))));
    }
}
