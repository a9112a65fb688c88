use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::PoolMetricsSnapshot;

/// Summary statistics for one action over the whole run.
///
/// Derived from the latest snapshot observed for the action, not an
/// aggregate across the time series; p50/p95/max are not carried by
/// snapshots and are emitted as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub action_name: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub requests_per_second: f64,
}

/// Complete result of a load-test run: per-action summaries plus the full
/// snapshot time series for charting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration: Duration,
    pub configured_users: usize,
    pub action_summaries: Vec<ActionSummary>,
    pub time_series_snapshots: Vec<PoolMetricsSnapshot>,
}

/// Fold the accumulated snapshots into a [`TestResult`]. Later snapshots for
/// the same action overwrite earlier ones, so each summary reflects the last
/// observation of that action.
pub fn build_result(
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    configured_users: usize,
    snapshots: Vec<PoolMetricsSnapshot>,
) -> TestResult {
    let mut summaries: BTreeMap<String, ActionSummary> = BTreeMap::new();
    for snapshot in &snapshots {
        summaries.insert(
            snapshot.action_name.clone(),
            ActionSummary {
                action_name: snapshot.action_name.clone(),
                total_requests: snapshot.completed_count + snapshot.failed_count,
                success_count: snapshot.completed_count,
                failure_count: snapshot.failed_count,
                average_response_time_ms: snapshot.average_response_time_ms,
                p50_response_time_ms: 0.0,
                p95_response_time_ms: 0.0,
                p99_response_time_ms: snapshot.p99_response_time_ms,
                max_response_time_ms: 0.0,
                requests_per_second: snapshot.requests_per_second,
            },
        );
    }

    TestResult {
        start_time,
        end_time,
        total_duration: (end_time - start_time).to_std().unwrap_or(Duration::ZERO),
        configured_users,
        action_summaries: summaries.into_values().collect(),
        time_series_snapshots: snapshots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, completed: u64, failed: u64, avg: f64) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            action_name: name.to_string(),
            active_count: 0,
            max_size: 0,
            waiting_count: 0,
            completed_count: completed,
            failed_count: failed,
            average_response_time_ms: avg,
            p99_response_time_ms: avg * 2.0,
            requests_per_second: 5.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_latest_snapshot_wins_per_action() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(30);
        let result = build_result(
            start,
            end,
            10,
            vec![
                snapshot("login", 5, 0, 10.0),
                snapshot("browse", 8, 1, 20.0),
                snapshot("login", 50, 2, 12.0),
            ],
        );

        assert_eq!(result.action_summaries.len(), 2);
        let login = result
            .action_summaries
            .iter()
            .find(|s| s.action_name == "login")
            .unwrap();
        assert_eq!(login.total_requests, 52);
        assert_eq!(login.success_count, 50);
        assert_eq!(login.failure_count, 2);
        assert!((login.average_response_time_ms - 12.0).abs() < f64::EPSILON);
        assert_eq!(login.p50_response_time_ms, 0.0);
        assert_eq!(login.max_response_time_ms, 0.0);
        // The full time series is preserved.
        assert_eq!(result.time_series_snapshots.len(), 3);
        assert_eq!(result.total_duration, Duration::from_secs(30));
        assert_eq!(result.configured_users, 10);
    }

    #[test]
    fn test_empty_snapshots_yield_empty_summaries() {
        let now = Utc::now();
        let result = build_result(now, now, 3, Vec::new());
        assert!(result.action_summaries.is_empty());
        assert!(result.time_series_snapshots.is_empty());
        assert_eq!(result.total_duration, Duration::ZERO);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let now = Utc::now();
        let result = build_result(now, now, 1, vec![snapshot("a", 1, 0, 1.0)]);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("actionSummaries").is_some());
        assert!(json.get("timeSeriesSnapshots").is_some());
        assert!(json["actionSummaries"][0].get("requestsPerSecond").is_some());
    }
}
