use chrono::{DateTime, Utc};
use graph_tunnel_summary_model::{Run, StoreVariant};
use serde::{Serialize, Serializer};
use std::time::{Duration, Instant};

/// Query name prefix for the row that covers a whole sequential run.
pub const AGGREGATE_PREFIX: &str = "sequential-run-";

/// Wall clock timestamps are written at second precision, in UTC.
pub fn format_utc_seconds(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn serialize_utc_seconds<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_utc_seconds(ts))
}

/// Start of a timed operation.
///
/// The wall clock reading is what gets reported; the monotonic reading is what gets measured.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    operation_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// A finished [OperationRecord].
#[derive(Debug, Clone, PartialEq)]
pub struct TimedOperation {
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    /// Never earlier than `started_at`, even if the wall clock stepped backwards.
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl OperationRecord {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(self) -> TimedOperation {
        let elapsed = self.started.elapsed();
        TimedOperation {
            operation_id: self.operation_id,
            started_at: self.started_at,
            finished_at: Utc::now().max(self.started_at),
            elapsed,
        }
    }
}

/// One latency row in the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    pub run_id: String,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub start_ts: DateTime<Utc>,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub end_ts: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub cluster_count: usize,
    pub node_count: usize,
    pub pod_count: usize,
    pub query_name: String,
    pub description: String,
    pub hop_count: u32,
    pub store_variant: StoreVariant,
    /// Name of the catalog query, without the iteration suffix.
    #[serde(skip)]
    pub query: String,
    /// `None` for the aggregate row.
    #[serde(skip)]
    pub iteration: Option<u32>,
}

impl LatencySample {
    /// Row for a single iteration of a sequential run. Iterations are 1-based.
    pub fn iteration(
        run: &Run,
        query: &str,
        hop_count: u32,
        iteration: u32,
        timed: &TimedOperation,
    ) -> Self {
        Self::build(
            run,
            query,
            format!("{query}-{iteration}"),
            hop_count,
            Some(iteration),
            timed,
        )
    }

    /// Row spanning every iteration of a sequential run, pauses included.
    pub fn aggregate(run: &Run, query: &str, hop_count: u32, timed: &TimedOperation) -> Self {
        Self::build(
            run,
            query,
            format!("{AGGREGATE_PREFIX}{query}"),
            hop_count,
            None,
            timed,
        )
    }

    fn build(
        run: &Run,
        query: &str,
        query_name: String,
        hop_count: u32,
        iteration: Option<u32>,
        timed: &TimedOperation,
    ) -> Self {
        Self {
            run_id: run.id.clone(),
            start_ts: timed.started_at,
            end_ts: timed.finished_at,
            duration: timed.elapsed.as_secs_f64(),
            cluster_count: run.topology.clusters,
            node_count: run.topology.nodes,
            pod_count: run.topology.pods,
            query_name,
            description: run.description.clone(),
            hop_count,
            store_variant: run.variant,
            query: query.to_string(),
            iteration,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.iteration.is_none()
    }
}

/// One throughput row in the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputSample {
    pub run_id: String,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub timestamp: DateTime<Utc>,
    pub cluster_count: usize,
    pub node_count: usize,
    pub pod_count: usize,
    /// Seconds actually spent in the window, at least the configured window length.
    pub elapsed: f64,
    pub total_executions: u64,
    /// Executions per second.
    pub throughput: f64,
    pub query_name: String,
    pub description: String,
    pub hop_count: u32,
    pub store_variant: StoreVariant,
}

impl ThroughputSample {
    pub fn new(
        run: &Run,
        query: &str,
        hop_count: u32,
        total_executions: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        Self {
            run_id: run.id.clone(),
            timestamp: Utc::now(),
            cluster_count: run.topology.clusters,
            node_count: run.topology.nodes,
            pod_count: run.topology.pods,
            elapsed: secs,
            total_executions,
            throughput: if secs > 0.0 {
                total_executions as f64 / secs
            } else {
                0.0
            },
            query_name: query.to_string(),
            description: run.description.clone(),
            hop_count,
            store_variant: run.variant,
        }
    }
}

/// One store process reading taken by the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub run_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Share of the whole host, 0 to 100.
    pub cpu_percent: f64,
    /// Resident set as a share of total memory, 0 to 100.
    pub mem_percent: f64,
    pub core_count: usize,
}

/// Wall time spent in one pipeline stage, such as pushing to the queue or building the graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSample {
    pub run_id: String,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub start_ts: DateTime<Utc>,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub end_ts: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub stage: String,
    /// How the stage ended, empty when there is nothing to say.
    pub outcome: String,
    pub store_variant: StoreVariant,
}

impl StageSample {
    pub fn new(run: &Run, stage: &str, outcome: &str, timed: &TimedOperation) -> Self {
        Self {
            run_id: run.id.clone(),
            start_ts: timed.started_at,
            end_ts: timed.finished_at,
            duration: timed.elapsed.as_secs_f64(),
            stage: stage.to_string(),
            outcome: outcome.to_string(),
            store_variant: run.variant,
        }
    }

    /// Take `d` off the end of the stage, used when a trailing wait is not part of the work.
    pub fn without_trailing(mut self, d: Duration) -> Self {
        self.duration = (self.duration - d.as_secs_f64()).max(0.0);
        let trailing = chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
        self.end_ts = (self.end_ts - trailing).max(self.start_ts);
        self
    }
}
