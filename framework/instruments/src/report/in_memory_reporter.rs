use crate::report::ReportCollector;
use crate::{LatencySample, ResourceSample, StageSample, ThroughputSample};
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything an [InMemoryReportCollector] has seen so far.
#[derive(Debug, Clone, Default)]
pub struct RecordedSamples {
    pub latency: Vec<LatencySample>,
    pub throughput: Vec<ThroughputSample>,
    pub resources: Vec<ResourceSample>,
    pub stages: Vec<StageSample>,
}

/// Read handle onto the samples of an [InMemoryReportCollector], usable after the collector has
/// been moved into a [crate::Reporter].
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecords {
    inner: Arc<Mutex<RecordedSamples>>,
}

impl InMemoryRecords {
    pub fn snapshot(&self) -> RecordedSamples {
        self.inner.lock().clone()
    }
}

/// Keeps every sample in memory. Useful while developing and in tests.
#[derive(Default)]
pub struct InMemoryReportCollector {
    records: InMemoryRecords,
}

impl InMemoryReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> InMemoryRecords {
        self.records.clone()
    }
}

impl ReportCollector for InMemoryReportCollector {
    fn add_latency(&mut self, sample: &LatencySample) {
        self.records.inner.lock().latency.push(sample.clone());
    }

    fn add_throughput(&mut self, sample: &ThroughputSample) {
        self.records.inner.lock().throughput.push(sample.clone());
    }

    fn add_resources(&mut self, samples: &[ResourceSample]) {
        self.records
            .inner
            .lock()
            .resources
            .extend_from_slice(samples);
    }

    fn add_stage(&mut self, sample: &StageSample) {
        self.records.inner.lock().stages.push(sample.clone());
    }

    fn finalize(&self) {}
}
