use std::sync::Arc;

use anyhow::Context;
use graph_store_client::prelude::{EntityPool, GraphStore, QueryCatalog, StoreQuery, CLEAR_ALL};
use graph_tunnel_core::prelude::{CancelListener, CancelledError, StageError};
use graph_tunnel_instruments::{ReportConfig, Reporter, StageSample};
use graph_tunnel_summary_model::{
    append_run_summary, IngestionOutcome, Run, RunSummary, StoreVariant, Topology,
};
use itertools::iproduct;

use crate::benchmark::BenchmarkRunner;
use crate::bootstrap::{BoltConnector, Bootstrapper, ContainerRuntime, DockerCli, StoreConnector};
use crate::cli::SweepCli;
use crate::config::SweepConfig;
use crate::executor::Executor;
use crate::monitor::{MonitorTarget, ResourceMonitor};
use crate::progress::{progress_channel, start_console_progress, ProgressSender};
use crate::provision::{ClusterTool, KwokTool, Provisioner};
use crate::self_monitor::start_self_monitor;
use crate::shutdown::start_cancel_listener;
use crate::watcher::{IngestionDriver, IngestionWatcher, ProcessIngestion};

/// The external systems a sweep drives.
pub struct SweepCollaborators {
    pub cluster_tool: Box<dyn ClusterTool>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub connector: Box<dyn StoreConnector>,
    pub ingestion: Box<dyn IngestionDriver>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// One entry per attempted run, in sweep order.
    pub runs: Vec<RunSummary>,
    /// Variant tags that were not run because they are not supported.
    pub skipped: Vec<String>,
}

impl SweepReport {
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| !r.succeeded()).count()
    }
}

/// Runs every (topology, store variant) combination of the configuration in turn.
pub struct Sweep {
    config: SweepConfig,
    provisioner: Provisioner,
    bootstrapper: Bootstrapper,
    watcher: IngestionWatcher,
    catalog: QueryCatalog,
    reporter: Reporter,
    progress: ProgressSender,
    cancel: CancelListener,
}

impl Sweep {
    pub fn new(
        config: SweepConfig,
        collaborators: SweepCollaborators,
        reporter: Reporter,
        progress: ProgressSender,
        cancel: CancelListener,
    ) -> Self {
        let provisioner = Provisioner::new(
            collaborators.cluster_tool,
            &config.paths.manifests_dir,
            config.provisioning.clone(),
            progress.clone(),
            cancel.clone(),
        );
        let bootstrapper = Bootstrapper::new(
            collaborators.containers,
            collaborators.connector,
            &config.paths.broker_compose_dir,
            config.pipeline.clone(),
            config.variants.clone(),
            progress.clone(),
            cancel.clone(),
        );
        let watcher = IngestionWatcher::new(
            collaborators.ingestion,
            config.ingestion.clone(),
            progress.clone(),
            cancel.clone(),
        );
        let catalog = QueryCatalog::standard().filter(&config.experiments.queries);

        Self {
            config,
            provisioner,
            bootstrapper,
            watcher,
            catalog,
            reporter,
            progress,
            cancel,
        }
    }

    /// Every topology to run, clusters varying slowest and pods fastest.
    pub fn plan(&self) -> Vec<Topology> {
        let experiments = &self.config.experiments;
        iproduct!(&experiments.clusters, &experiments.nodes, &experiments.pods)
            .map(|(&clusters, &nodes, &pods)| Topology::new(clusters, nodes, pods))
            .collect()
    }

    fn describe(&self, topology: &Topology) -> String {
        match &self.config.experiments.description {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}-{}", topology.describe()),
            _ => topology.describe(),
        }
    }

    /// Run the whole sweep.
    ///
    /// A stage failure ends its combination. The sweep then moves on, or stops with that error
    /// when `continue_on_failure` is off. Cancellation stops it at the next stage boundary.
    pub fn run(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();
        let variants = &self.config.experiments.variants;
        let plan = self.plan();
        log::info!(
            "Sweeping {} topologies over {} variant(s) with {} queries",
            plan.len(),
            variants.len(),
            self.catalog.len()
        );

        let last_supported = variants
            .iter()
            .rposition(|tag| self.supported_variant(tag).is_some());

        for topology in plan {
            self.check_cancelled()?;
            self.progress
                .text(format!("Starting experiments for {topology}"));
            if let Err(e) = self.provisioner.provision(&topology) {
                self.absorb_failure(e, &format!("Provisioning {topology}"))?;
                continue;
            }

            for (index, tag) in variants.iter().enumerate() {
                self.check_cancelled()?;
                let Some(variant) = self.supported_variant(tag) else {
                    let err = StageError::UnsupportedVariant {
                        variant: tag.clone(),
                    };
                    log::error!("{err}, skipping it");
                    self.progress.text(format!("{err}, skipping it"));
                    report.skipped.push(tag.clone());
                    continue;
                };

                let run = Run::new(self.describe(&topology), topology, variant);
                let mut summary = RunSummary::start(&run, chrono::Utc::now().timestamp());
                let outcome = self.run_one(&run, &mut summary);
                summary.finished_at = chrono::Utc::now().timestamp();
                if let Err(e) = &outcome {
                    summary.error = Some(format!("{e:#}"));
                }
                if let Err(e) = append_run_summary(&summary, &self.config.run_summary_path()) {
                    log::error!("Failed to record summary of run {}: {e:?}", run.id);
                }
                report.runs.push(summary);

                if let Err(e) = outcome {
                    self.absorb_failure(e, &format!("Run {} ({variant}, {topology})", run.id))?;
                }

                if Some(index) != last_supported && !self.provisioner.check_ready() {
                    self.progress
                        .text("Deployments are not ready, re-provisioning the topology...");
                    if let Err(e) = self.provisioner.provision(&topology) {
                        self.absorb_failure(e, &format!("Re-provisioning {topology}"))?;
                        break;
                    }
                }
            }
        }

        self.progress.text(format!(
            "Sweep complete: {} run(s), {} failed, {} skipped",
            report.runs.len(),
            report.failed(),
            report.skipped.len()
        ));
        Ok(report)
    }

    fn supported_variant(&self, tag: &str) -> Option<StoreVariant> {
        StoreVariant::parse(tag).filter(|variant| self.config.variant(variant.as_str()).is_some())
    }

    fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CancelledError::default().into());
        }
        Ok(())
    }

    /// Report a failed combination. Returns the error when the sweep should stop.
    fn absorb_failure(&self, err: anyhow::Error, what: &str) -> anyhow::Result<()> {
        if err.is::<CancelledError>() {
            return Err(err);
        }
        log::error!("{what} failed: {err:?}");
        self.progress.text(format!("{what} failed: {err:#}"));
        if self.config.experiments.continue_on_failure {
            Ok(())
        } else {
            Err(err.context(format!("{what} failed")))
        }
    }

    /// One pass of the pipeline against a provisioned topology.
    fn run_one(&self, run: &Run, summary: &mut RunSummary) -> anyhow::Result<()> {
        self.progress.text(format!(
            "Running {} against {} (run {})",
            run.description, run.variant, run.id
        ));

        self.bootstrapper.restart_broker()?;
        let variant = self.bootstrapper.restart_store(run.variant.as_str())?;
        let store = self.bootstrapper.connect(variant)?;
        let variant_config = self
            .bootstrapper
            .variant_config(variant)
            .cloned()
            .ok_or_else(|| StageError::UnsupportedVariant {
                variant: variant.to_string(),
            })?;

        let monitor = ResourceMonitor::start(
            &self.config.monitor,
            self.bootstrapper.containers(),
            MonitorTarget::for_variant(&variant_config),
            run.id.clone(),
            self.reporter.clone(),
            self.progress.clone(),
        );

        self.progress.text("Waiting....");
        self.cancel.pause(self.config.pipeline.pipeline_settle())?;

        let pushed = self.watcher.push_to_queue(run)?;
        self.reporter
            .add_stage(&StageSample::new(run, "Push to queue", "", &pushed));

        let (outcome, built) = self.watcher.create_graph(run, &variant_config)?;
        summary.ingestion = Some(outcome);
        let mut stage = StageSample::new(run, "Create graph", &outcome.to_string(), &built);
        if outcome == IngestionOutcome::Silent {
            stage = stage.without_trailing(self.watcher.silence_timeout());
        }
        self.reporter.add_stage(&stage);

        let mut rng = rand::thread_rng();
        let pool = EntityPool::discover(store.as_ref(), &mut rng)?;
        let queries = self.catalog.bind(&pool.pick(&mut rng));
        let tally = BenchmarkRunner::new(
            store.as_ref(),
            &self.reporter,
            &self.progress,
            &self.config.benchmark,
            &self.cancel,
        )
        .run_catalog(run, &queries)?;
        summary.queries_ok = tally.ok;
        summary.queries_failed = tally.failed;

        if self.config.experiments.clear_store_after_run {
            self.cancel.pause(self.config.benchmark.clear_pause())?;
            clear_store(store.as_ref())?;
        }

        monitor.stop_and_join();
        log::info!("Run {} finished", run.id);
        Ok(())
    }
}

fn clear_store(store: &dyn GraphStore) -> anyhow::Result<()> {
    store
        .run_write(&StoreQuery::new(CLEAR_ALL))
        .context("Failed to clear the graph store")?;
    log::info!("Graph store cleared");
    Ok(())
}

/// Run a sweep with the real tools: kwok, docker and the configured pipeline processes.
pub fn run(cli: SweepCli) -> anyhow::Result<()> {
    let mut config = SweepConfig::load(cli.config.as_deref())?;
    config.apply_cli(&cli);

    log::info!(
        "Running sweep over clusters {:?}, nodes {:?}, pods {:?} for variants {:?}",
        config.experiments.clusters,
        config.experiments.nodes,
        config.experiments.pods,
        config.experiments.variants
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let cancel_handle = start_cancel_listener(&runtime);
    let executor = Arc::new(Executor::new(runtime, cancel_handle.clone()));
    let reporter = ReportConfig::default()
        .enable_csv(&config.paths.output_dir)
        .enable_summary()
        .init()?;

    let (progress, receiver) = progress_channel();
    let transport = start_console_progress(receiver, !cli.no_progress);

    // Started before any load so a busy harness shows up in the logs next to the numbers it skews.
    start_self_monitor(cancel_handle.new_listener());

    let collaborators = SweepCollaborators {
        cluster_tool: Box::new(KwokTool::locate()?),
        containers: Arc::new(DockerCli::locate()?),
        connector: Box::new(BoltConnector::new(executor.handle())),
        ingestion: Box::new(ProcessIngestion::new(
            executor.clone(),
            &config.paths.producer_dir,
            &config.paths.grapher_dir,
            config.ingestion.clone(),
        )),
    };

    let sweep = Sweep::new(
        config,
        collaborators,
        reporter.clone(),
        progress,
        cancel_handle.new_listener(),
    );
    let outcome = sweep.run();

    // The sweep holds the last progress sender, dropping it ends the transport.
    drop(sweep);
    if transport.join().is_err() {
        log::error!("Progress thread panicked");
    }
    reporter.finalize();
    cancel_handle.cancel();

    match outcome {
        Ok(report) => {
            log::info!(
                "Sweep finished with {} run(s), {} failed and {} skipped",
                report.runs.len(),
                report.failed(),
                report.skipped.len()
            );
            Ok(())
        }
        Err(e) if e.is::<CancelledError>() => {
            log::warn!("Sweep cancelled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
