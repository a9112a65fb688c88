use std::io;
use std::path::Path;

use crate::engine::result::TestResult;

/// Generate CSV output from a test result: a per-action summary section
/// followed by the snapshot time series.
pub fn generate_csv(result: &TestResult) -> String {
    let mut out = String::from(
        "action,total_requests,success,failure,avg_ms,p50_ms,p95_ms,p99_ms,max_ms,rps\n",
    );

    for summary in &result.action_summaries {
        out.push_str(&format!(
            "{},{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3}\n",
            summary.action_name,
            summary.total_requests,
            summary.success_count,
            summary.failure_count,
            summary.average_response_time_ms,
            summary.p50_response_time_ms,
            summary.p95_response_time_ms,
            summary.p99_response_time_ms,
            summary.max_response_time_ms,
            summary.requests_per_second,
        ));
    }

    out.push('\n');
    out.push_str("timestamp,action,active,completed,failed,avg_ms,p99_ms,rps\n");
    for snapshot in &result.time_series_snapshots {
        out.push_str(&format!(
            "{},{},{},{},{},{:.3},{:.3},{:.3}\n",
            snapshot.timestamp.to_rfc3339(),
            snapshot.action_name,
            snapshot.active_count,
            snapshot.completed_count,
            snapshot.failed_count,
            snapshot.average_response_time_ms,
            snapshot.p99_response_time_ms,
            snapshot.requests_per_second,
        ));
    }

    out
}

/// Write the CSV report to a file.
pub fn write_csv_report(result: &TestResult, path: &Path) -> io::Result<()> {
    std::fs::write(path, generate_csv(result))
}
