use crate::config::{CommandConfig, IngestionConfig, VariantConfig};
use crate::executor::Executor;
use crate::progress::{ProgressEvent, ProgressSender};
use anyhow::Context;
use graph_tunnel_core::prelude::{CancelListener, CancelledError, RetryPolicy, StageError};
use graph_tunnel_instruments::{OperationRecord, TimedOperation};
use graph_tunnel_summary_model::{IngestionOutcome, Run};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

/// Recognises the grapher's periodic status report settling down.
///
/// A block starts at a line beginning with the sentinel and ends at the next blank line. Lines
/// are compared with surrounding whitespace removed. Output outside a block is ignored.
#[derive(Debug, Clone)]
pub struct StableBlockDetector {
    sentinel: String,
    required: u32,
    current: Option<Vec<String>>,
    previous: Option<String>,
    repetitions: u32,
}

impl StableBlockDetector {
    pub fn new(sentinel: impl Into<String>, required: u32) -> Self {
        Self {
            sentinel: sentinel.into(),
            required: required.max(1),
            current: None,
            previous: None,
            repetitions: 0,
        }
    }

    /// Feed one line of output. Returns true once the same block has been seen `required` times
    /// in a row.
    pub fn push(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.starts_with(&self.sentinel) {
            self.current = Some(vec![line.to_string()]);
            return false;
        }

        let Some(block) = self.current.as_mut() else {
            return false;
        };
        if !line.is_empty() {
            block.push(line.to_string());
            return false;
        }

        let finished = block.join("\n");
        self.current = None;
        if self.previous.as_deref() == Some(finished.as_str()) {
            self.repetitions += 1;
            log::debug!("Status block repeated {} time(s) in a row", self.repetitions);
        } else {
            log::debug!("New status block received:\n{finished}");
            self.previous = Some(finished);
            self.repetitions = 1;
        }
        self.repetitions >= self.required
    }

    /// Consecutive sightings of the last finished block.
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }
}

/// How to start one pipeline process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Log target the process output is re-logged under.
    pub log_target: String,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>, log_target: &str) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: cwd.into(),
            log_target: log_target.to_string(),
        }
    }

    pub fn from_command(command: &CommandConfig, cwd: &Path, log_target: &str) -> Self {
        let mut spec = Self::new(&command.program, cwd, log_target);
        spec.args = command.args.clone();
        spec.env = command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        spec
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Relative programs with a directory part are taken relative to the working directory.
    fn resolved_program(&self) -> PathBuf {
        if self.program.is_relative() && self.program.components().count() > 1 {
            self.cwd.join(&self.program)
        } else {
            self.program.clone()
        }
    }

    /// Start the process with stdout and stderr merged into one line stream.
    ///
    /// Must be called from within a tokio runtime. The process is killed when the returned
    /// [Child] is dropped.
    fn spawn(&self) -> anyhow::Result<(Child, UnboundedReceiver<String>)> {
        let program = self.resolved_program();
        let mut child = Command::new(&program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start {} in {}",
                    program.display(),
                    self.cwd.display()
                )
            })?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to get stdout for the pipeline process")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to get stderr for the pipeline process")?;

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, sender.clone()));
        tokio::spawn(forward_lines(stderr, sender));
        Ok((child, receiver))
    }
}

async fn forward_lines(stream: impl AsyncRead + Unpin, sender: UnboundedSender<String>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sender.send(line).is_err() {
            break;
        }
    }
}

/// Launch a process and watch its output until its status block is stable, it goes quiet for
/// `silence`, or it exits. The process is not left running in any case.
pub async fn watch_for_stable_block(
    spec: &LaunchSpec,
    mut detector: StableBlockDetector,
    silence: Duration,
) -> anyhow::Result<IngestionOutcome> {
    let (mut child, mut lines) = spec.spawn()?;
    log::info!("Waiting for {} to report a stable status", spec.log_target);

    let outcome = loop {
        match timeout(silence, lines.recv()).await {
            Err(_) => {
                log::warn!(
                    "No output from {} for {silence:?}, stopping it",
                    spec.log_target
                );
                break IngestionOutcome::Silent;
            }
            Ok(None) => {
                log::warn!(
                    "{} closed its output before a stable status block was found",
                    spec.log_target
                );
                break IngestionOutcome::Exited;
            }
            Ok(Some(line)) => {
                log::info!(target: &spec.log_target, "{line}");
                if detector.push(&line) {
                    log::info!(
                        "Status block repeated {} times, ingestion is complete",
                        detector.repetitions()
                    );
                    break IngestionOutcome::Stable;
                }
            }
        }
    };

    match outcome {
        IngestionOutcome::Exited => match child.wait().await {
            Ok(status) => log::info!("{} exited with {status}", spec.log_target),
            Err(e) => log::warn!("Failed to collect the exit status of {}: {e}", spec.log_target),
        },
        _ => {
            if let Err(e) = child.kill().await {
                log::warn!("Failed to stop {}: {e}", spec.log_target);
            }
        }
    }
    Ok(outcome)
}

/// A pipeline process left running for the caller to stop.
pub trait RunningProcess: Send {
    /// Stop the process. Safe to call more than once.
    fn terminate(&mut self);
}

/// The event producer, once it has started publishing.
#[derive(Debug)]
pub struct ProducerProcess {
    child: Child,
    name: String,
}

impl RunningProcess for ProducerProcess {
    fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => log::debug!("{} already exited with {status}", self.name),
            _ => {
                if let Err(e) = self.child.start_kill() {
                    log::warn!("Failed to stop {}: {e}", self.name);
                } else {
                    log::info!("Stopped {}", self.name);
                }
            }
        }
    }
}

/// Launch a process and wait until a line contains `marker`, then give it `grace` before
/// handing it back.
///
/// There is no deadline. A process that closes its output before the marker is handed back
/// with a warning, the ingestion stage decides whether anything was published.
pub async fn wait_for_marker(
    spec: &LaunchSpec,
    marker: &str,
    grace: Duration,
) -> anyhow::Result<ProducerProcess> {
    let (child, mut lines) = spec.spawn()?;
    log::info!("Waiting for {} to output: {marker}", spec.log_target);

    loop {
        match lines.recv().await {
            Some(line) => {
                log::info!(target: &spec.log_target, "{line}");
                if line.contains(marker) {
                    log::info!("{} is publishing", spec.log_target);
                    break;
                }
            }
            None => {
                log::warn!(
                    "{} closed its output before printing '{marker}'",
                    spec.log_target
                );
                break;
            }
        }
    }

    let log_target = spec.log_target.clone();
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if log::log_enabled!(target: &log_target, log::Level::Info) {
                log::info!(target: &log_target, "{line}");
            }
        }
    });

    tokio::time::sleep(grace).await;
    Ok(ProducerProcess {
        child,
        name: spec.log_target.clone(),
    })
}

/// Starts the two pipeline processes for a run.
pub trait IngestionDriver: Send {
    /// Start the event producer and return once it is publishing.
    fn start_producer(&self, run: &Run) -> anyhow::Result<Box<dyn RunningProcess>>;

    /// One attempt at launching the graph ingestion and watching it finish.
    fn build_graph(&self, run: &Run, variant: &VariantConfig) -> anyhow::Result<IngestionOutcome>;
}

/// [IngestionDriver] running the configured producer and grapher commands as child processes.
pub struct ProcessIngestion {
    executor: Arc<Executor>,
    producer_dir: PathBuf,
    grapher_dir: PathBuf,
    settings: IngestionConfig,
}

impl ProcessIngestion {
    pub fn new(
        executor: Arc<Executor>,
        producer_dir: impl Into<PathBuf>,
        grapher_dir: impl Into<PathBuf>,
        settings: IngestionConfig,
    ) -> Self {
        Self {
            executor,
            producer_dir: producer_dir.into(),
            grapher_dir: grapher_dir.into(),
            settings,
        }
    }
}

impl IngestionDriver for ProcessIngestion {
    fn start_producer(&self, run: &Run) -> anyhow::Result<Box<dyn RunningProcess>> {
        let spec = LaunchSpec::from_command(
            &self.settings.producer,
            &self.producer_dir,
            "ingestion::producer",
        )
        .env("KAFKA_TOPIC", &run.topic);

        let producer = self.executor.execute_in_place(wait_for_marker(
            &spec,
            &self.settings.target_text,
            self.settings.producer_grace(),
        ))?;
        Ok(Box::new(producer))
    }

    fn build_graph(&self, run: &Run, variant: &VariantConfig) -> anyhow::Result<IngestionOutcome> {
        let spec = LaunchSpec::from_command(
            &self.settings.grapher,
            &self.grapher_dir,
            "ingestion::grapher",
        )
        .env("AUTH", &variant.auth)
        .env("DB_NAME", run.variant.as_str())
        .env("KAFKA_TOPIC", &run.topic);

        self.executor.execute_in_place(watch_for_stable_block(
            &spec,
            StableBlockDetector::new(&self.settings.sentinel, self.settings.stable_repetitions),
            self.settings.silence_timeout(),
        ))
    }
}

/// Runs the ingestion stages of a run: pushing cluster events to the queue, then building the
/// graph from them.
pub struct IngestionWatcher {
    driver: Box<dyn IngestionDriver>,
    settings: IngestionConfig,
    progress: ProgressSender,
    cancel: CancelListener,
}

impl IngestionWatcher {
    pub fn new(
        driver: Box<dyn IngestionDriver>,
        settings: IngestionConfig,
        progress: ProgressSender,
        cancel: CancelListener,
    ) -> Self {
        Self {
            driver,
            settings,
            progress,
            cancel,
        }
    }

    /// Run the producer until it publishes, then stop it.
    pub fn push_to_queue(&self, run: &Run) -> anyhow::Result<TimedOperation> {
        self.progress.text("Pushing to queue...");
        let record = OperationRecord::new("Push to queue");
        let mut producer = self.driver.start_producer(run).map_err(|e| {
            if e.is::<CancelledError>() {
                return e;
            }
            StageError::Ingestion {
                attempts: 1,
                last_error: format!("producer: {e:#}"),
            }
            .into()
        })?;
        producer.terminate();
        Ok(record.finish())
    }

    /// Build the graph, retrying the launch and watch.
    ///
    /// Returns the outcome of the successful attempt and its timing. Every outcome is accepted,
    /// a silent or exited grapher is logged and surfaced so the caller can tell them apart.
    pub fn create_graph(
        &self,
        run: &Run,
        variant: &VariantConfig,
    ) -> anyhow::Result<(IngestionOutcome, TimedOperation)> {
        self.progress.send(ProgressEvent::toggle_div("dash"));
        let policy = RetryPolicy::new(self.settings.attempts, self.settings.retry_backoff());

        let (outcome, timed) = policy
            .run("Creating graph", &self.cancel, |attempt| {
                self.progress.text("Creating graph...");
                log::info!("Starting graph ingestion attempt {attempt}");
                let record = OperationRecord::new("Create graph");
                let outcome = self.driver.build_graph(run, variant)?;
                Ok((outcome, record.finish()))
            })
            .map_err(|exhausted| {
                if exhausted.last_error.is::<CancelledError>() {
                    return exhausted.last_error;
                }
                self.progress.text(format!(
                    "Graph creation failed after {} attempts",
                    exhausted.attempts
                ));
                StageError::Ingestion {
                    attempts: exhausted.attempts,
                    last_error: format!("{:#}", exhausted.last_error),
                }
                .into()
            })?;

        match outcome {
            IngestionOutcome::Stable => {}
            IngestionOutcome::Silent => self.progress.text(format!(
                "No ingestion output for {:?}, continuing",
                self.settings.silence_timeout()
            )),
            IngestionOutcome::Exited => {
                log::warn!("Grapher exited before its status settled, continuing");
                self.progress
                    .text("Ingestion process exited before its status settled, continuing");
            }
        }
        self.progress.text("Sequence complete.");
        Ok((outcome, timed))
    }

    pub fn silence_timeout(&self) -> Duration {
        self.settings.silence_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::progress::progress_channel;
    use graph_tunnel_core::prelude::CancelHandle;
    use graph_tunnel_summary_model::{StoreVariant, Topology};
    use parking_lot::Mutex;
    use serial_test::serial;
    use std::time::Instant;

    fn block(clusters: u32, pods: u32) -> Vec<String> {
        vec![
            format!("Clusters: {clusters}"),
            "Nodes: 10".to_string(),
            format!("  Pods: {pods}  "),
            String::new(),
        ]
    }

    fn feed(detector: &mut StableBlockDetector, lines: &[String]) -> bool {
        let mut stable = false;
        for line in lines {
            stable = detector.push(line);
        }
        stable
    }

    #[test]
    fn five_identical_blocks_are_stable() {
        let mut detector = StableBlockDetector::new("Clusters:", 5);

        for _ in 0..4 {
            assert!(!feed(&mut detector, &block(1, 100)));
        }
        assert!(feed(&mut detector, &block(1, 100)));
        assert_eq!(detector.repetitions(), 5);
    }

    #[test]
    fn a_changed_block_resets_the_count() {
        let mut detector = StableBlockDetector::new("Clusters:", 5);

        for _ in 0..4 {
            feed(&mut detector, &block(1, 90));
        }
        assert!(!feed(&mut detector, &block(1, 100)));
        assert_eq!(detector.repetitions(), 1);
    }

    #[test]
    fn output_outside_blocks_is_ignored() {
        let mut detector = StableBlockDetector::new("Clusters:", 2);

        assert!(!detector.push("Consumed event NodeMetrics"));
        assert!(!detector.push(""));
        feed(&mut detector, &block(1, 100));
        assert!(!detector.push("Consumed event NodeMetrics"));
        assert!(!detector.push(""));
        assert!(feed(&mut detector, &block(1, 100)));
    }

    #[test]
    fn surrounding_whitespace_does_not_change_a_block() {
        let mut detector = StableBlockDetector::new("Clusters:", 2);

        feed(&mut detector, &block(1, 100));
        assert!(feed(
            &mut detector,
            &[
                "  Clusters: 1".to_string(),
                "Nodes: 10 ".to_string(),
                "Pods: 100".to_string(),
                "   ".to_string(),
            ]
        ));
    }

    #[test]
    fn relative_programs_with_a_directory_resolve_against_cwd() {
        let spec = LaunchSpec::new("venv/bin/python", "/opt/grapher", "ingestion::grapher");
        assert_eq!(
            spec.resolved_program(),
            PathBuf::from("/opt/grapher/venv/bin/python")
        );

        let spec = LaunchSpec::new("go", "/opt/producer", "ingestion::producer");
        assert_eq!(spec.resolved_program(), PathBuf::from("go"));
    }

    #[cfg(unix)]
    fn script(body: &str) -> LaunchSpec {
        LaunchSpec::new("sh", std::env::temp_dir(), "test::process")
            .arg("-c")
            .arg(body)
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn stable_status_stops_the_watch_early() {
        let spec = script(
            "for i in 1 2 3 4 5; do printf 'Clusters: 1\\nNodes: 10\\nPods: 100\\n\\n'; done; sleep 30",
        );
        let started = Instant::now();

        let outcome = watch_for_stable_block(
            &spec,
            StableBlockDetector::new("Clusters:", 5),
            Duration::from_secs(20),
        )
        .await
        .unwrap();

        assert_eq!(outcome, IngestionOutcome::Stable);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn stderr_is_watched_too() {
        let spec = script(
            "for i in 1 2 3; do printf 'Clusters: 2\\nPods: 7\\n\\n' >&2; done; sleep 30",
        );

        let outcome = watch_for_stable_block(
            &spec,
            StableBlockDetector::new("Clusters:", 3),
            Duration::from_secs(20),
        )
        .await
        .unwrap();

        assert_eq!(outcome, IngestionOutcome::Stable);
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn silence_ends_the_watch_and_the_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("still-running");
        let spec = script(&format!(
            "echo starting; sleep 1; touch '{}'; sleep 30",
            marker.display()
        ));
        let started = Instant::now();

        let outcome = watch_for_stable_block(
            &spec,
            StableBlockDetector::new("Clusters:", 5),
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        assert_eq!(outcome, IngestionOutcome::Silent);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Past the point where a surviving process would have written the marker.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists(), "process outlived the silence timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn early_exit_is_reported_as_exited() {
        let spec = script("printf 'Clusters: 1\\n\\n'");

        let outcome = watch_for_stable_block(
            &spec,
            StableBlockDetector::new("Clusters:", 5),
            Duration::from_secs(20),
        )
        .await
        .unwrap();

        assert_eq!(outcome, IngestionOutcome::Exited);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let spec = LaunchSpec::new(
            "/definitely/not/a/grapher",
            std::env::temp_dir(),
            "test::process",
        );

        let result = watch_for_stable_block(
            &spec,
            StableBlockDetector::new("Clusters:", 5),
            Duration::from_secs(1),
        )
        .await;

        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn producer_is_handed_back_after_its_marker() {
        let spec = script("echo compiling; echo 'INFO Sending Event: Update NodeMetrics'; sleep 30");
        let started = Instant::now();

        let mut producer = wait_for_marker(
            &spec,
            "Sending Event: Update NodeMetrics",
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(producer.child.try_wait().unwrap().is_none());
        producer.terminate();
        producer.terminate();
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn producer_exiting_without_marker_is_still_handed_back() {
        let spec = script("echo 'build failed'");

        let producer = wait_for_marker(&spec, "Sending Event", Duration::ZERO).await;

        assert!(producer.is_ok());
    }

    struct ScriptedDriver {
        outcomes: Mutex<Vec<anyhow::Result<IngestionOutcome>>>,
        builds: Mutex<u32>,
        terminated: Arc<Mutex<u32>>,
    }

    struct CountingProcess(Arc<Mutex<u32>>);

    impl RunningProcess for CountingProcess {
        fn terminate(&mut self) {
            *self.0.lock() += 1;
        }
    }

    impl ScriptedDriver {
        fn new(outcomes: Vec<anyhow::Result<IngestionOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                builds: Mutex::new(0),
                terminated: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl IngestionDriver for Arc<ScriptedDriver> {
        fn start_producer(&self, _run: &Run) -> anyhow::Result<Box<dyn RunningProcess>> {
            Ok(Box::new(CountingProcess(self.terminated.clone())))
        }

        fn build_graph(
            &self,
            _run: &Run,
            _variant: &VariantConfig,
        ) -> anyhow::Result<IngestionOutcome> {
            *self.builds.lock() += 1;
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                anyhow::bail!("no scripted outcome left");
            }
            outcomes.remove(0)
        }
    }

    fn watcher(driver: Arc<ScriptedDriver>) -> (IngestionWatcher, CancelHandle) {
        let mut settings = IngestionConfig::default();
        settings.retry_backoff_secs = 0.0;
        let (progress, _receiver) = progress_channel();
        let cancel = CancelHandle::new();
        let watcher =
            IngestionWatcher::new(Box::new(driver), settings, progress, cancel.new_listener());
        (watcher, cancel)
    }

    fn run() -> Run {
        Run::new("test", Topology::new(1, 10, 100), StoreVariant::Neo4j)
    }

    fn variant() -> VariantConfig {
        SweepConfig::default().variants["neo4j"].clone()
    }

    #[test]
    fn producer_is_stopped_once_it_has_published() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let (watcher, _cancel) = watcher(driver.clone());

        let timed = watcher.push_to_queue(&run()).unwrap();

        assert_eq!(timed.operation_id, "Push to queue");
        assert_eq!(*driver.terminated.lock(), 1);
    }

    #[test]
    fn failed_attempts_are_retried() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Err(anyhow::anyhow!("venv missing")),
            Ok(IngestionOutcome::Silent),
        ]));
        let (watcher, _cancel) = watcher(driver.clone());

        let (outcome, timed) = watcher.create_graph(&run(), &variant()).unwrap();

        assert_eq!(outcome, IngestionOutcome::Silent);
        assert_eq!(timed.operation_id, "Create graph");
        assert_eq!(*driver.builds.lock(), 2);
    }

    #[test]
    fn exhausted_attempts_are_an_ingestion_error() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Err(anyhow::anyhow!("one")),
            Err(anyhow::anyhow!("two")),
            Err(anyhow::anyhow!("three")),
            Ok(IngestionOutcome::Stable),
        ]));
        let (watcher, _cancel) = watcher(driver.clone());

        let err = watcher.create_graph(&run(), &variant()).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::Ingestion { attempts: 3, last_error }) if last_error == "three"
        ));
        assert_eq!(*driver.builds.lock(), 3);
    }
}
