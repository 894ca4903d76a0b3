mod records;
mod report;

pub use records::{
    format_utc_seconds, LatencySample, OperationRecord, ResourceSample, StageSample,
    ThroughputSample, TimedOperation, AGGREGATE_PREFIX,
};
pub use report::{
    CsvFileReportCollector, InMemoryRecords, InMemoryReportCollector, RecordedSamples,
    ReportCollector, ReportConfig, Reporter, SummaryReportCollector,
};
