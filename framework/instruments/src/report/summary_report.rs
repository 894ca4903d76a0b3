mod query_table;

use crate::report::summary_report::query_table::QueryRow;
use crate::report::ReportCollector;
use crate::{LatencySample, ResourceSample, StageSample, ThroughputSample};
use graph_tunnel_summary_model::StoreVariant;
use std::collections::BTreeMap;
use tabled::settings::Style;
use tabled::Table;

#[derive(Default)]
struct QueryStats {
    durations: Vec<f64>,
    throughput: Option<f64>,
}

/// Prints a per-query table for each store variant once the sweep is finalized.
///
/// Only individual iterations count towards the latency columns, the aggregate row is skipped.
#[derive(Default)]
pub struct SummaryReportCollector {
    queries: BTreeMap<(StoreVariant, String), QueryStats>,
    peak_cpu: Option<f64>,
}

impl SummaryReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Vec<QueryRow> {
        self.queries
            .iter()
            .filter(|(_, stats)| !stats.durations.is_empty() || stats.throughput.is_some())
            .map(|((variant, query), stats)| {
                let mut sorted = stats.durations.clone();
                sorted.sort_by(f64::total_cmp);
                let ms = |secs: f64| secs * 1000.0;

                QueryRow {
                    store_variant: variant.to_string(),
                    query: query.clone(),
                    iterations: sorted.len(),
                    mean_ms: if sorted.is_empty() {
                        0.0
                    } else {
                        ms(sorted.iter().sum::<f64>() / sorted.len() as f64)
                    },
                    p50_ms: ms(percentile(&sorted, 50.0)),
                    p95_ms: ms(percentile(&sorted, 95.0)),
                    min_ms: ms(sorted.first().copied().unwrap_or_default()),
                    max_ms: ms(sorted.last().copied().unwrap_or_default()),
                    throughput: stats.throughput.unwrap_or_default(),
                }
            })
            .collect()
    }

    fn print_summary_of_queries(&self) {
        let rows = self.rows();
        if rows.is_empty() {
            return;
        }

        println!("\nSummary of queries");
        let mut table = Table::new(&rows);
        table.with(Style::modern());
        println!("{table}");

        if let Some(peak) = self.peak_cpu {
            println!("Peak store CPU: {peak:.2}%");
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl ReportCollector for SummaryReportCollector {
    fn add_latency(&mut self, sample: &LatencySample) {
        if sample.is_aggregate() {
            return;
        }
        self.queries
            .entry((sample.store_variant, sample.query.clone()))
            .or_default()
            .durations
            .push(sample.duration);
    }

    fn add_throughput(&mut self, sample: &ThroughputSample) {
        self.queries
            .entry((sample.store_variant, sample.query_name.clone()))
            .or_default()
            .throughput = Some(sample.throughput);
    }

    fn add_resources(&mut self, samples: &[ResourceSample]) {
        for sample in samples {
            self.peak_cpu = Some(self.peak_cpu.map_or(sample.cpu_percent, |peak| {
                peak.max(sample.cpu_percent)
            }));
        }
    }

    fn add_stage(&mut self, _sample: &StageSample) {}

    fn finalize(&self) {
        self.print_summary_of_queries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimedOperation;
    use chrono::Utc;
    use graph_tunnel_summary_model::{Run, Topology};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn timed(ms: u64) -> TimedOperation {
        let now = Utc::now();
        TimedOperation {
            operation_id: "q".to_string(),
            started_at: now,
            finished_at: now,
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();

        assert_eq!(percentile(&sorted, 50.0), 50.0);
        assert_eq!(percentile(&sorted, 95.0), 95.0);
        assert_eq!(percentile(&[3.0], 95.0), 3.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn aggregate_rows_do_not_skew_latency_stats() {
        let run = Run::new("summary", Topology::new(1, 1, 1), StoreVariant::Neo4j);
        let mut collector = SummaryReportCollector::new();

        collector.add_latency(&LatencySample::iteration(&run, "q", 1, 1, &timed(10)));
        collector.add_latency(&LatencySample::iteration(&run, "q", 1, 2, &timed(30)));
        collector.add_latency(&LatencySample::aggregate(&run, "q", 1, &timed(5000)));
        collector.add_throughput(&ThroughputSample::new(
            &run,
            "q",
            1,
            30,
            Duration::from_secs(60),
        ));

        let rows = collector.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].iterations, 2);
        assert!((rows[0].max_ms - 30.0).abs() < 1e-6);
        assert!((rows[0].mean_ms - 20.0).abs() < 1e-6);
        assert_eq!(rows[0].throughput, 0.5);
    }
}
