use crate::report::ReportCollector;
use crate::{LatencySample, ResourceSample, StageSample, ThroughputSample};
use anyhow::Context;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LATENCY_FILE: &str = "latency.csv";
pub const THROUGHPUT_FILE: &str = "throughput.csv";
pub const RESOURCE_FILE: &str = "resource_samples.csv";
pub const STAGE_FILE: &str = "stages.csv";

/// Appends samples to CSV files that survive across sweeps.
///
/// The header row is only written when a file is created or found empty. Every write is flushed
/// so a crashed sweep keeps the rows it already produced.
pub struct CsvFileReportCollector {
    dir: PathBuf,
    latency: csv::Writer<File>,
    throughput: csv::Writer<File>,
    resources: csv::Writer<File>,
    stages: csv::Writer<File>,
}

impl CsvFileReportCollector {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Could not create metrics directory {dir:?}"))?;

        Ok(Self {
            latency: open_append(&dir.join(LATENCY_FILE))?,
            throughput: open_append(&dir.join(THROUGHPUT_FILE))?,
            resources: open_append(&dir.join(RESOURCE_FILE))?,
            stages: open_append(&dir.join(STAGE_FILE))?,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn open_append(path: &Path) -> anyhow::Result<csv::Writer<File>> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Could not open metrics file {path:?}"))?;
    let has_header = file.metadata()?.len() > 0;

    Ok(csv::WriterBuilder::new()
        .has_headers(!has_header)
        .from_writer(file))
}

fn write_rows<'a, T: Serialize + 'a>(
    writer: &mut csv::Writer<File>,
    what: &str,
    rows: impl IntoIterator<Item = &'a T>,
) {
    let result = rows
        .into_iter()
        .try_for_each(|row| writer.serialize(row))
        .map_err(anyhow::Error::from)
        .and_then(|_| writer.flush().map_err(anyhow::Error::from));

    if let Err(e) = result {
        log::error!("Failed to write {what} sample: {e:?}");
    }
}

impl ReportCollector for CsvFileReportCollector {
    fn add_latency(&mut self, sample: &LatencySample) {
        write_rows(&mut self.latency, "latency", [sample]);
    }

    fn add_throughput(&mut self, sample: &ThroughputSample) {
        write_rows(&mut self.throughput, "throughput", [sample]);
    }

    fn add_resources(&mut self, samples: &[ResourceSample]) {
        write_rows(&mut self.resources, "resource", samples);
    }

    fn add_stage(&mut self, sample: &StageSample) {
        write_rows(&mut self.stages, "stage", [sample]);
    }

    fn finalize(&self) {
        log::info!("Metrics written to {:?}", self.dir);
    }
}
