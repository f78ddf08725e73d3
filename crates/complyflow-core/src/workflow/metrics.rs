//! Aggregate counters over execution records.

use complyflow_types::execution::{ExecutionRecord, ExecutionStatus, WorkflowMetricsSnapshot};

/// Count records per status and average the duration of terminal records.
///
/// Records without a `stopTime` are excluded from the average; the average
/// is `0` when no record qualifies.
pub fn summarize(records: &[ExecutionRecord]) -> WorkflowMetricsSnapshot {
    let mut snapshot = WorkflowMetricsSnapshot::default();
    let mut total_ms: u64 = 0;
    let mut timed: u64 = 0;

    for record in records {
        snapshot.total_executions += 1;
        match record.status {
            ExecutionStatus::Running => snapshot.running += 1,
            ExecutionStatus::Succeeded => snapshot.succeeded += 1,
            ExecutionStatus::Failed => snapshot.failed += 1,
            ExecutionStatus::TimedOut => snapshot.timed_out += 1,
            ExecutionStatus::Aborted => snapshot.aborted += 1,
        }
        if record.status.is_terminal() {
            if let Some(ms) = record.duration_ms() {
                total_ms = total_ms.saturating_add(ms.max(0) as u64);
                timed += 1;
            }
        }
    }

    if timed > 0 {
        snapshot.average_execution_time_millis = total_ms / timed;
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn record(status: ExecutionStatus, duration_ms: Option<i64>) -> ExecutionRecord {
        let start = Utc::now();
        ExecutionRecord {
            execution_id: Uuid::now_v7(),
            workflow_type: "compliance-scan".into(),
            tenant_id: "t".into(),
            correlation_id: "c".into(),
            status,
            start_time: start,
            stop_time: duration_ms.map(|ms| start + Duration::milliseconds(ms)),
            input: json!({}),
            output: None,
            error: None,
            cause: None,
            current_state: None,
            started_by: None,
            metadata: None,
        }
    }

    #[test]
    fn test_empty_is_all_zero() {
        assert_eq!(summarize(&[]), WorkflowMetricsSnapshot::default());
    }

    #[test]
    fn test_counts_and_average() {
        let records = vec![
            record(ExecutionStatus::Succeeded, Some(1_000)),
            record(ExecutionStatus::Failed, Some(3_000)),
            record(ExecutionStatus::Running, None),
            record(ExecutionStatus::Aborted, Some(2_000)),
            record(ExecutionStatus::TimedOut, Some(6_000)),
        ];
        let snapshot = summarize(&records);
        assert_eq!(snapshot.total_executions, 5);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.aborted, 1);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.average_execution_time_millis, 3_000);
    }

    #[test]
    fn test_only_running_has_zero_average() {
        let snapshot = summarize(&[record(ExecutionStatus::Running, None)]);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.average_execution_time_millis, 0);
    }
}
