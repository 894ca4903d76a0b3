mod csv_file_reporter;
mod in_memory_reporter;
mod summary_report;

use crate::{LatencySample, ResourceSample, StageSample, ThroughputSample};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

pub use csv_file_reporter::CsvFileReportCollector;
pub use in_memory_reporter::{InMemoryRecords, InMemoryReportCollector, RecordedSamples};
pub use summary_report::SummaryReportCollector;

/// A sink for the samples produced by a sweep.
pub trait ReportCollector: Send {
    fn add_latency(&mut self, sample: &LatencySample);

    fn add_throughput(&mut self, sample: &ThroughputSample);

    /// Resource samples arrive in batches as the monitor flushes them.
    fn add_resources(&mut self, samples: &[ResourceSample]);

    fn add_stage(&mut self, sample: &StageSample);

    fn finalize(&self);
}

/// Fan-out over every configured [ReportCollector].
///
/// Cheap to clone. All collectors sit behind one lock, so concurrent writers (the benchmark on
/// the orchestrator thread, the resource monitor on its own) never interleave within a row.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Mutex<Vec<Box<dyn ReportCollector>>>>,
}

impl Reporter {
    pub fn add_latency(&self, sample: &LatencySample) {
        for collector in self.inner.lock().iter_mut() {
            collector.add_latency(sample);
        }
    }

    pub fn add_throughput(&self, sample: &ThroughputSample) {
        for collector in self.inner.lock().iter_mut() {
            collector.add_throughput(sample);
        }
    }

    pub fn add_resources(&self, samples: &[ResourceSample]) {
        if samples.is_empty() {
            return;
        }
        for collector in self.inner.lock().iter_mut() {
            collector.add_resources(samples);
        }
    }

    pub fn add_stage(&self, sample: &StageSample) {
        for collector in self.inner.lock().iter_mut() {
            collector.add_stage(sample);
        }
    }

    pub fn finalize(&self) {
        for collector in self.inner.lock().iter() {
            collector.finalize();
        }
    }
}

#[derive(Default)]
pub struct ReportConfig {
    csv_dir: Option<PathBuf>,
    enable_summary: bool,
    extra: Vec<Box<dyn ReportCollector>>,
}

impl ReportConfig {
    /// Write each sample kind to its own CSV file under `dir`.
    pub fn enable_csv(mut self, dir: impl Into<PathBuf>) -> Self {
        self.csv_dir = Some(dir.into());
        self
    }

    /// Print a per-query table when the sweep is finalized.
    pub fn enable_summary(mut self) -> Self {
        self.enable_summary = true;
        self
    }

    pub fn with_collector(mut self, collector: impl ReportCollector + 'static) -> Self {
        self.extra.push(Box::new(collector));
        self
    }

    pub fn init(self) -> anyhow::Result<Reporter> {
        let mut collectors: Vec<Box<dyn ReportCollector>> = Vec::new();

        if let Some(dir) = self.csv_dir {
            collectors.push(Box::new(CsvFileReportCollector::new(dir)?));
        }

        if self.enable_summary {
            collectors.push(Box::new(SummaryReportCollector::new()));
        }

        collectors.extend(self.extra);

        Ok(Reporter {
            inner: Arc::new(Mutex::new(collectors)),
        })
    }
}
