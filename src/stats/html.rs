use std::io;
use std::path::Path;

use crate::engine::result::TestResult;

/// Generate a small self-contained HTML page summarizing a test result.
pub fn generate_html(result: &TestResult) -> String {
    if result.action_summaries.is_empty() {
        return "<html><body><h1>Load Test Report</h1><p>No requests made</p></body></html>"
            .to_string();
    }

    let mut html = String::new();
    html.push_str("<html><head><title>Load Test Report</title></head><body>");
    html.push_str("<h1>Load Test Report</h1>");
    html.push_str(&format!(
        "<p>Start: {} &mdash; End: {} ({:?})</p>",
        result.start_time.to_rfc3339(),
        result.end_time.to_rfc3339(),
        result.total_duration,
    ));
    html.push_str(&format!(
        "<p>Configured Users: {}</p>",
        result.configured_users
    ));

    html.push_str("<table border=\"1\" cellpadding=\"4\">");
    html.push_str(
        "<tr><th>Action</th><th>Total</th><th>Success</th><th>Failure</th>\
         <th>Avg (ms)</th><th>P99 (ms)</th><th>RPS</th></tr>",
    );
    for summary in &result.action_summaries {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{:.2}</td><td>{:.2}</td><td>{:.2}</td></tr>",
            summary.action_name,
            summary.total_requests,
            summary.success_count,
            summary.failure_count,
            summary.average_response_time_ms,
            summary.p99_response_time_ms,
            summary.requests_per_second,
        ));
    }
    html.push_str("</table>");
    html.push_str(&format!(
        "<p>{} snapshots collected</p>",
        result.time_series_snapshots.len()
    ));
    html.push_str("</body></html>");
    html
}

/// Write the HTML report to a file.
pub fn write_html_report(result: &TestResult, path: &Path) -> io::Result<()> {
    std::fs::write(path, generate_html(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::build_result;
    use crate::stats::PoolMetricsSnapshot;
    use chrono::Utc;

    #[test]
    fn test_empty_result_renders_placeholder() {
        let now = Utc::now();
        let result = build_result(now, now, 1, Vec::new());
        let html = generate_html(&result);
        assert!(html.contains("No requests made"));
    }

    #[test]
    fn test_summary_table_renders_actions() {
        let now = Utc::now();
        let result = build_result(
            now,
            now,
            3,
            vec![PoolMetricsSnapshot {
                action_name: "checkout".into(),
                active_count: 1,
                max_size: 0,
                waiting_count: 0,
                completed_count: 42,
                failed_count: 3,
                average_response_time_ms: 120.25,
                p99_response_time_ms: 480.0,
                requests_per_second: 4.2,
                timestamp: now,
            }],
        );
        let html = generate_html(&result);
        assert!(html.contains("<td>checkout</td>"));
        assert!(html.contains("<td>45</td>"));
        assert!(html.contains("120.25"));
        assert!(html.contains("1 snapshots collected"));
    }
}
