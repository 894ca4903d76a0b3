use crate::config::BenchmarkConfig;
use crate::progress::{ProgressEvent, ProgressSender};
use graph_store_client::prelude::{diagram_for, BoundQuery, GraphStore};
use graph_tunnel_core::prelude::{CancelListener, CancelledError};
use graph_tunnel_instruments::{LatencySample, OperationRecord, Reporter, ThroughputSample};
use graph_tunnel_summary_model::Run;
use std::time::Instant;

/// How many catalog queries completed both modes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkTally {
    pub ok: usize,
    pub failed: usize,
}

/// Drives the query catalog against a connected store and records latency and throughput.
pub struct BenchmarkRunner<'a> {
    store: &'a dyn GraphStore,
    reporter: &'a Reporter,
    progress: &'a ProgressSender,
    settings: &'a BenchmarkConfig,
    cancel: &'a CancelListener,
}

impl<'a> BenchmarkRunner<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        reporter: &'a Reporter,
        progress: &'a ProgressSender,
        settings: &'a BenchmarkConfig,
        cancel: &'a CancelListener,
    ) -> Self {
        Self {
            store,
            reporter,
            progress,
            settings,
            cancel,
        }
    }

    /// Benchmark every query in order. A failing query is reported and skipped, only
    /// cancellation stops the catalog early.
    pub fn run_catalog(&self, run: &Run, queries: &[BoundQuery]) -> anyhow::Result<BenchmarkTally> {
        log::info!(
            "Benchmarking {} queries for run {} against {}",
            queries.len(),
            run.id,
            run.variant
        );
        self.progress.send(ProgressEvent::toggle_div("diagramData"));
        self.cancel.pause(self.settings.stage_pause())?;

        let mut tally = BenchmarkTally::default();
        for query in queries {
            self.progress.send(ProgressEvent::Diagram {
                query: query.name.to_string(),
                diagram: diagram_for(query.template),
            });
            self.progress
                .text(format!("Loading next query: {}...", query.name));
            self.cancel.pause(self.settings.stage_pause())?;

            self.progress
                .text(format!("Executing sequential benchmark for {}...", query.name));
            let sequential = self.sequential(run, query);
            let sequential_ok = self.absorb(query, "sequential benchmark", sequential)?;

            self.progress.text(format!(
                "Waiting {} seconds for throughput benchmarking...",
                self.settings.stage_pause_secs
            ));
            self.cancel.pause(self.settings.stage_pause())?;

            self.progress
                .text(format!("Executing throughput for {}...", query.name));
            let throughput = self.throughput(run, query);
            let throughput_ok = self.absorb(query, "throughput benchmark", throughput)?;

            if sequential_ok && throughput_ok {
                tally.ok += 1;
            } else {
                tally.failed += 1;
            }
        }

        log::info!(
            "Benchmark finished for run {}: {} ok, {} failed",
            run.id,
            tally.ok,
            tally.failed
        );
        Ok(tally)
    }

    /// Log a failed mode and carry on. Cancellation is passed through.
    fn absorb<T>(&self, query: &BoundQuery, mode: &str, result: anyhow::Result<T>) -> anyhow::Result<bool> {
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is::<CancelledError>() => Err(e),
            Err(e) => {
                log::error!("Unexpected error in {mode} for {}: {e:?}", query.name);
                self.progress
                    .text(format!("Error in {mode} for {}: {e:#}", query.name));
                Ok(false)
            }
        }
    }

    /// Time up to `repetitions` calls after one untimed warm-up, pausing between calls.
    ///
    /// A first call slower than the threshold cuts the run short to `shrunk_repetitions` calls.
    /// Returns the number of timed calls made.
    pub fn sequential(&self, run: &Run, query: &BoundQuery) -> anyhow::Result<u32> {
        log::info!("Starting sequential benchmark for {}", query.name);
        self.store.run_read(&query.query)?;

        let total = OperationRecord::new(format!("sequential-{}", query.name));
        let mut planned = self.settings.repetitions.max(1);
        let mut completed = 0;
        for i in 1..=self.settings.repetitions.max(1) {
            let record = OperationRecord::new(format!("{}-{i}", query.name));
            self.store.run_read(&query.query)?;
            let timed = record.finish();

            if i == 1 && timed.elapsed > self.settings.slow_threshold() {
                planned = self.settings.shrunk_repetitions.max(1);
                let message = format!(
                    "Query duration of {:.2} seconds exceeds {} seconds. Reducing total repetitions to {planned}.",
                    timed.elapsed.as_secs_f64(),
                    self.settings.slow_threshold_secs
                );
                log::warn!("{message}");
                self.progress.text(message);
            }

            self.reporter.add_latency(&LatencySample::iteration(
                run,
                query.name,
                query.hop_count,
                i,
                &timed,
            ));
            completed = i;

            self.cancel.pause(self.settings.iteration_pause())?;
            if i >= planned {
                break;
            }
        }

        let total = total.finish();
        self.reporter.add_latency(&LatencySample::aggregate(
            run,
            query.name,
            query.hop_count,
            &total,
        ));
        log::info!(
            "Total time for {}: {completed} repetitions, {:.2} seconds",
            query.name,
            total.elapsed.as_secs_f64()
        );
        Ok(completed)
    }

    /// Count calls completed back to back within the window, after one untimed warm-up.
    pub fn throughput(&self, run: &Run, query: &BoundQuery) -> anyhow::Result<ThroughputSample> {
        let window = self.settings.throughput_window();
        log::info!("Running throughput benchmark for {} for {window:?}", query.name);
        self.store.run_read(&query.query)?;

        let mut executions: u64 = 0;
        let started = Instant::now();
        while started.elapsed() < window {
            if self.cancel.is_cancelled() {
                return Err(CancelledError::default().into());
            }
            self.store.run_read(&query.query)?;
            executions += 1;
        }
        let elapsed = started.elapsed();

        let sample = ThroughputSample::new(run, query.name, query.hop_count, executions, elapsed);
        log::info!(
            "Query {} executed {executions} times in {:.2} seconds ({:.2}/s)",
            query.name,
            sample.elapsed,
            sample.throughput
        );
        self.reporter.add_throughput(&sample);
        Ok(sample)
    }
}
