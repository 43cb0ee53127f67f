//! Latency result table formatting.
//!
//! The table has two columns: `timestamp` in fractional Unix seconds and
//! `latency_ms`.  Files are named after the session start, in UTC.

use chrono::{DateTime, Utc};

use crate::latency::LatencyResult;

pub const CSV_HEADER: &str = "timestamp,latency_ms";

/// Render `results` as CSV, header first, newline separated, no trailing
/// newline.
pub fn render_csv(results: &[LatencyResult]) -> String {
    let mut out = String::from(CSV_HEADER);
    for r in results {
        out.push('\n');
        out.push_str(&format!("{},{}", r.timestamp_ms / 1000.0, r.latency_ms));
    }
    out
}

/// `latency_test_results_YYYY-MM-DD_HH-MM-SSZ.csv`.
pub fn export_file_name(session_start: Option<DateTime<Utc>>) -> String {
    let stamp = session_start
        .map(|t| t.format("%Y-%m-%d_%H-%M-%SZ").to_string())
        .unwrap_or_else(|| "unknown_datetime".to_string());
    format!("latency_test_results_{stamp}.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::MatchReason;
    use chrono::TimeZone;

    fn result(timestamp_ms: f64, latency_ms: f64) -> LatencyResult {
        LatencyResult {
            timestamp_ms,
            latency_ms,
            id: 1,
            manual: false,
            reason: MatchReason::TargetColor,
        }
    }

    #[test]
    fn csv_has_header_and_seconds() {
        let csv = render_csv(&[result(1_700_000_000_250.0, 42.5), result(1_700_000_001_000.0, 40.0)]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,latency_ms");
        assert_eq!(lines[1], "1700000000.25,42.5");
        assert_eq!(lines[2], "1700000001,40");
        assert!(!csv.ends_with('\n'));
    }

    #[test]
    fn empty_results_render_header_only() {
        assert_eq!(render_csv(&[]), CSV_HEADER);
    }

    #[test]
    fn file_name_uses_utc_session_start() {
        let start = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(
            export_file_name(Some(start)),
            "latency_test_results_2024-03-07_09-05-02Z.csv"
        );
        assert_eq!(
            export_file_name(None),
            "latency_test_results_unknown_datetime.csv"
        );
    }
}
