use crate::bootstrap::ContainerRuntime;
use crate::config::{MonitorConfig, VariantConfig};
use crate::progress::ProgressSender;
use anyhow::Context;
use graph_tunnel_core::prelude::CancelHandle;
use graph_tunnel_instruments::{ResourceSample, Reporter};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// The store process the monitor samples, inside its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub container: String,
    pub process_name: String,
    /// `ps -o` columns the fallback scan greps for `process_name`.
    pub process_columns: String,
    /// Used when neither lookup finds the process.
    pub default_pid: u32,
}

impl MonitorTarget {
    pub fn for_variant(variant: &VariantConfig) -> Self {
        Self {
            container: variant.container_name.clone(),
            process_name: variant.process_name.clone(),
            process_columns: variant.process_columns.clone(),
            default_pid: variant.default_pid,
        }
    }
}

/// CPU used by one process as a share of the whole host, from two consecutive tick readings.
pub fn normalized_cpu(process_ticks: f64, total_ticks: f64, cores: usize) -> f64 {
    if total_ticks <= 0.0 {
        return 0.0;
    }
    (process_ticks / total_ticks * cores as f64 * 100.0).clamp(0.0, 100.0)
}

/// `utime + stime` from `/proc/<pid>/stat`.
///
/// The command name may itself contain spaces and parentheses, so fields are counted from the
/// last `)`. The first field after it is the process state.
fn parse_process_ticks(stat: &str) -> anyhow::Result<f64> {
    let end = stat
        .rfind(')')
        .with_context(|| format!("No command name in process stat: {stat:?}"))?;
    let fields: Vec<&str> = stat[end + 1..].split_whitespace().collect();
    let tick = |index: usize| -> anyhow::Result<f64> {
        fields
            .get(index)
            .with_context(|| format!("Process stat has only {} fields", fields.len()))?
            .parse::<f64>()
            .with_context(|| format!("Malformed process stat field {index}"))
    };
    Ok(tick(11)? + tick(12)?)
}

/// Sum of the aggregate `cpu` line of `/proc/stat`.
fn parse_total_ticks(stat: &str) -> anyhow::Result<f64> {
    let line = stat.lines().next().context("Empty /proc/stat")?;
    let mut parts = line.split_whitespace();
    if parts.next() != Some("cpu") {
        anyhow::bail!("First line of /proc/stat is not the cpu total: {line:?}");
    }
    parts.try_fold(0.0, |sum, part| {
        part.parse::<f64>()
            .map(|ticks| sum + ticks)
            .with_context(|| format!("Malformed /proc/stat value {part:?}"))
    })
}

/// Resident pages from `/proc/<pid>/statm`.
fn parse_resident_pages(statm: &str) -> anyhow::Result<u64> {
    statm
        .split_whitespace()
        .nth(1)
        .context("No resident field in statm")?
        .parse()
        .context("Malformed resident field in statm")
}

/// `MemTotal` from `/proc/meminfo`, in KiB.
fn parse_mem_total_kib(meminfo: &str) -> anyhow::Result<u64> {
    let line = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .context("No MemTotal in /proc/meminfo")?;
    line.split_whitespace()
        .nth(1)
        .context("MemTotal has no value")?
        .parse()
        .context("Malformed MemTotal value")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn first_pid(output: &str) -> Option<u32> {
    output.split_whitespace().next()?.parse().ok()
}

/// Find the store process id, trying `pidof`, then a `ps` scan, then the configured default.
pub(crate) fn resolve_pid(runtime: &dyn ContainerRuntime, target: &MonitorTarget) -> u32 {
    match runtime.exec(&target.container, &["pidof", &target.process_name]) {
        Ok(output) => match first_pid(&output) {
            Some(pid) => return pid,
            None if !output.trim().is_empty() => {
                log::warn!("Could not parse a pid from pidof output {output:?}")
            }
            None => {}
        },
        Err(e) => log::debug!("pidof {} failed: {e:#}", target.process_name),
    }

    let scan = format!(
        "ps -eo {} | grep {} | grep -v grep | awk '{{print $1}}'",
        shell_quote(&target.process_columns),
        shell_quote(&target.process_name)
    );
    match runtime.exec(&target.container, &["bash", "-c", &scan]) {
        Ok(output) => {
            if let Some(pid) = first_pid(&output) {
                return pid;
            }
        }
        Err(e) => log::warn!("Fallback pid lookup `{scan}` failed: {e:#}"),
    }

    log::info!(
        "Using default pid {} for {} in {}",
        target.default_pid,
        target.process_name,
        target.container
    );
    target.default_pid
}

fn core_count(runtime: &dyn ContainerRuntime, container: &str) -> usize {
    runtime
        .exec(container, &["nproc"])
        .ok()
        .and_then(|out| out.trim().parse().ok())
        .filter(|&cores| cores > 0)
        .unwrap_or(1)
}

/// Reads the counters of one process and turns consecutive readings into samples.
struct ProcSampler {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    pid: u32,
    cores: usize,
    page_size_kib: u64,
    /// Process and total ticks of the last good reading.
    previous: Option<(f64, f64)>,
}

impl ProcSampler {
    fn read(&self, path: &str) -> anyhow::Result<String> {
        self.runtime
            .exec(&self.container, &["cat", path])
            .with_context(|| format!("Failed to read {path} in {}", self.container))
    }

    fn sample(&mut self, run_id: &str) -> anyhow::Result<ResourceSample> {
        let process_ticks = parse_process_ticks(&self.read(&format!("/proc/{}/stat", self.pid))?)?;
        let total_ticks = parse_total_ticks(&self.read("/proc/stat")?)?;

        let cpu_percent = match self.previous {
            Some((prev_process, prev_total)) => normalized_cpu(
                process_ticks - prev_process,
                total_ticks - prev_total,
                self.cores,
            ),
            None => 0.0,
        };
        self.previous = Some((process_ticks, total_ticks));

        let resident = parse_resident_pages(&self.read(&format!("/proc/{}/statm", self.pid))?)?;
        let total_kib = parse_mem_total_kib(&self.read("/proc/meminfo")?)?;
        let mem_percent = if total_kib > 0 {
            (resident * self.page_size_kib) as f64 / total_kib as f64 * 100.0
        } else {
            0.0
        };

        Ok(ResourceSample {
            run_id: run_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            cpu_percent,
            mem_percent,
            core_count: self.cores,
        })
    }
}

/// Background sampler of the store process's CPU and memory for the span of one run.
///
/// Stopped cooperatively: the loop finishes its current sample, flushes what it holds and exits.
/// Dropping the monitor stops it too.
pub struct ResourceMonitor {
    stop: CancelHandle,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn start(
        settings: &MonitorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        target: MonitorTarget,
        run_id: impl Into<String>,
        reporter: Reporter,
        progress: ProgressSender,
    ) -> Self {
        let stop = CancelHandle::new();
        let listener = stop.new_listener();
        let interval = settings.interval();
        let batch_size = settings.batch_size.max(1);
        let page_size_kib = settings.page_size_kib;
        let run_id = run_id.into();

        let handle = std::thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || {
                let pid = resolve_pid(runtime.as_ref(), &target);
                let cores = core_count(runtime.as_ref(), &target.container);
                log::info!(
                    "Monitoring pid {pid} of {} in {} with {cores} core(s)",
                    target.process_name,
                    target.container
                );
                let mut sampler = ProcSampler {
                    runtime,
                    container: target.container,
                    pid,
                    cores,
                    page_size_kib,
                    previous: None,
                };

                let mut batch = Vec::with_capacity(batch_size);
                let mut next = Instant::now();
                while !listener.is_cancelled() {
                    next += interval;

                    match sampler.sample(&run_id) {
                        Ok(sample) => {
                            batch.push(sample);
                            if batch.len() >= batch_size {
                                reporter.add_resources(&batch);
                                batch.clear();
                            }
                        }
                        Err(e) => {
                            log::warn!("Skipping resource sample: {e:#}");
                            progress.text(format!(
                                "Error sampling resources for run {run_id}: {e:#}"
                            ));
                        }
                    }

                    let now = Instant::now();
                    if next > now && listener.pause(next - now).is_err() {
                        break;
                    }
                }

                reporter.add_resources(&batch);
                log::debug!("Resource monitor for run {run_id} stopped");
            })
            .expect("Failed to start resource monitor thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the sampling loop and wait for it to flush and exit.
    pub fn stop_and_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Resource monitor thread panicked");
            }
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ContainerSpec;
    use crate::progress::{progress_channel, ProgressEvent};
    use graph_tunnel_instruments::{
        InMemoryReportCollector, LatencySample, ReportCollector, ReportConfig, StageSample,
        ThroughputSample,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const STAT: &str = "42 (memgraph) S 1 42 42 0 -1 4194560 1000 0 0 0 700 300 0 0 20 0 12 0 100 0 0";

    #[test]
    fn cpu_is_normalized_to_the_host_and_clamped() {
        assert_eq!(normalized_cpu(50.0, 200.0, 4), 100.0);
        assert_eq!(normalized_cpu(10.0, 200.0, 4), 20.0);
        assert_eq!(normalized_cpu(-5.0, 200.0, 4), 0.0);
        assert_eq!(normalized_cpu(10.0, 0.0, 4), 0.0);
    }

    #[test]
    fn process_ticks_sum_user_and_system_time() {
        assert_eq!(parse_process_ticks(STAT).unwrap(), 1000.0);

        let odd_name = "7 (my (odd) name) R 1 7 7 0 -1 0 0 0 0 0 5 6 0 0 20 0 1 0 1 0 0";
        assert_eq!(parse_process_ticks(odd_name).unwrap(), 11.0);

        assert!(parse_process_ticks("7 (short) R 1").is_err());
    }

    #[test]
    fn proc_files_parse() {
        assert_eq!(
            parse_total_ticks("cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3\n").unwrap(),
            1000.0
        );
        assert!(parse_total_ticks("intr 1 2 3").is_err());
        assert_eq!(parse_resident_pages("5000 2048 300 10 0 400 0").unwrap(), 2048);
        assert_eq!(
            parse_mem_total_kib("MemTotal:       16384000 kB\nMemFree: 1 kB\n").unwrap(),
            16_384_000
        );
    }

    /// Answers the container commands the monitor issues. Process ticks grow by 50 and total
    /// ticks by 200 per reading; every `cat` takes a little longer than the one before, up to a
    /// few milliseconds.
    #[derive(Default)]
    struct FakeContainer {
        pidof: Option<String>,
        ps: Option<String>,
        /// When set, the scan only finds the process if it asks for these columns.
        ps_columns: Option<&'static str>,
        /// Every `cat` fails.
        unreadable: bool,
        readings: AtomicU64,
        reads: AtomicU64,
        calls: Mutex<Vec<String>>,
    }

    impl ContainerRuntime for FakeContainer {
        fn compose_down(&self, _dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        fn compose_up(&self, _dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        fn remove_container(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn run_container(&self, _spec: &ContainerSpec) -> anyhow::Result<()> {
            Ok(())
        }

        fn exec(&self, _container: &str, argv: &[&str]) -> anyhow::Result<String> {
            self.calls.lock().push(argv.join(" "));
            match argv {
                ["pidof", _] => self.pidof.clone().context("pidof: no such process"),
                ["bash", "-c", script] => match self.ps_columns {
                    Some(columns) if !script.contains(columns) => Ok(String::new()),
                    _ => Ok(self.ps.clone().unwrap_or_default()),
                },
                ["nproc"] => Ok("4\n".to_string()),
                ["cat", path] if self.unreadable => {
                    anyhow::bail!("cat: {path}: No such file or directory")
                }
                ["cat", path] => {
                    let read = self.reads.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(read % 4));
                    if path.ends_with("/stat") && *path != "/proc/stat" {
                        let n = self.readings.fetch_add(1, Ordering::SeqCst);
                        Ok(format!(
                            "42 (memgraph) S 1 42 42 0 -1 0 0 0 0 0 {} 0 0 0 20 0 1 0 1 0 0",
                            1000 + n * 50
                        ))
                    } else if *path == "/proc/stat" {
                        let n = self.readings.load(Ordering::SeqCst);
                        Ok(format!("cpu  {} 0 0 0\n", n * 200))
                    } else if path.ends_with("/statm") {
                        Ok("9000 1024 0 0 0 0 0".to_string())
                    } else {
                        Ok("MemTotal:  16384 kB\n".to_string())
                    }
                }
                _ => anyhow::bail!("unexpected command {argv:?}"),
            }
        }
    }

    fn target() -> MonitorTarget {
        MonitorTarget {
            container: "kubegrapher-memgraph-1".to_string(),
            process_name: "memgraph".to_string(),
            process_columns: "pid,comm".to_string(),
            default_pid: 1,
        }
    }

    #[test]
    fn pid_lookup_falls_back_to_ps_then_the_default() {
        let by_pidof = FakeContainer {
            pidof: Some("42 43\n".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_pid(&by_pidof, &target()), 42);

        let by_ps = FakeContainer {
            ps: Some("77\n".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_pid(&by_ps, &target()), 77);
        assert_eq!(
            by_ps.calls.lock()[1],
            "bash -c ps -eo 'pid,comm' | grep 'memgraph' | grep -v grep | awk '{print $1}'"
        );

        let neither = FakeContainer::default();
        assert_eq!(resolve_pid(&neither, &target()), 1);
    }

    #[test]
    fn jvm_store_is_found_by_its_user_column() {
        let config = crate::config::SweepConfig::default();
        let neo4j = MonitorTarget::for_variant(&config.variants["neo4j"]);
        // pidof finds nothing and the process shows up as `java`, owned by `neo4j`.
        let container = FakeContainer {
            ps: Some("7\n".to_string()),
            ps_columns: Some("pid,user,comm"),
            ..Default::default()
        };

        assert_eq!(resolve_pid(&container, &neo4j), 7);

        let scanned_by_command = FakeContainer {
            ps: Some("7\n".to_string()),
            ps_columns: Some("pid,user,comm"),
            ..Default::default()
        };
        assert_eq!(resolve_pid(&scanned_by_command, &target()), 1);
    }

    #[test]
    fn scan_arguments_are_quoted() {
        assert_eq!(shell_quote("memgraph"), "'memgraph'");
        assert_eq!(shell_quote("a'b; ls"), r"'a'\''b; ls'");
    }

    #[test]
    fn failed_samples_are_reported_as_progress() {
        let reporter = ReportConfig::default().init().unwrap();
        let (progress, mut receiver) = progress_channel();
        let settings = MonitorConfig {
            interval_secs: 0.02,
            batch_size: 5,
            page_size_kib: 4,
        };

        let monitor = ResourceMonitor::start(
            &settings,
            Arc::new(FakeContainer {
                unreadable: true,
                ..Default::default()
            }),
            target(),
            "run-1",
            reporter,
            progress,
        );
        std::thread::sleep(Duration::from_millis(100));
        monitor.stop_and_join();

        let mut texts = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let ProgressEvent::Text(text) = event {
                texts.push(text);
            }
        }
        let expected = "Error sampling resources for run run-1: Failed to read /proc/1/stat";
        assert!(!texts.is_empty());
        assert!(texts[0].starts_with(expected), "frames: {texts:?}");
    }

    #[test]
    fn first_sample_has_no_cpu_and_later_ones_use_deltas() {
        let mut sampler = ProcSampler {
            runtime: Arc::new(FakeContainer::default()),
            container: "c".to_string(),
            pid: 42,
            cores: 4,
            page_size_kib: 4,
            previous: None,
        };

        let first = sampler.sample("run-1").unwrap();
        let second = sampler.sample("run-1").unwrap();

        assert_eq!(first.cpu_percent, 0.0);
        // 50 process ticks out of 200 on 4 cores.
        assert_eq!(second.cpu_percent, 100.0);
        // 1024 pages of 4 KiB out of 16384 KiB.
        assert_eq!(second.mem_percent, 25.0);
        assert_eq!(second.core_count, 4);
        assert!(second.timestamp_ms >= first.timestamp_ms);
    }

    #[derive(Clone, Default)]
    struct BatchSizes(Arc<Mutex<Vec<usize>>>);

    impl ReportCollector for BatchSizes {
        fn add_latency(&mut self, _sample: &LatencySample) {}

        fn add_throughput(&mut self, _sample: &ThroughputSample) {}

        fn add_resources(&mut self, samples: &[ResourceSample]) {
            self.0.lock().push(samples.len());
        }

        fn add_stage(&mut self, _sample: &StageSample) {}

        fn finalize(&self) {}
    }

    #[test]
    fn samples_are_flushed_in_batches_and_the_rest_on_stop() {
        let sizes = BatchSizes::default();
        let reporter = ReportConfig::default()
            .with_collector(sizes.clone())
            .init()
            .unwrap();
        let settings = MonitorConfig {
            interval_secs: 0.02,
            batch_size: 5,
            page_size_kib: 4,
        };

        let monitor = ResourceMonitor::start(
            &settings,
            Arc::new(FakeContainer::default()),
            target(),
            "run-1",
            reporter,
            progress_channel().0,
        );
        std::thread::sleep(Duration::from_millis(250));
        monitor.stop_and_join();

        let sizes = sizes.0.lock().clone();
        let (last, full) = sizes.split_last().unwrap();
        assert!(!full.is_empty(), "batches: {sizes:?}");
        assert!(full.iter().all(|&n| n == 5), "batches: {sizes:?}");
        assert!(*last >= 1 && *last <= 5, "batches: {sizes:?}");
    }

    #[test]
    fn sampling_keeps_to_the_schedule() {
        let collector = InMemoryReportCollector::new();
        let records = collector.records();
        let reporter = ReportConfig::default()
            .with_collector(collector)
            .init()
            .unwrap();
        let settings = MonitorConfig {
            interval_secs: 0.05,
            batch_size: 5,
            page_size_kib: 4,
        };

        let monitor = ResourceMonitor::start(
            &settings,
            Arc::new(FakeContainer::default()),
            target(),
            "run-1",
            reporter,
            progress_channel().0,
        );
        std::thread::sleep(Duration::from_millis(2_500));
        monitor.stop_and_join();

        let samples = records.snapshot().resources;
        assert!(samples.len() >= 40, "only {} samples", samples.len());
        assert!(samples
            .windows(2)
            .all(|w| w[1].timestamp_ms >= w[0].timestamp_ms));
        let span = (samples[samples.len() - 1].timestamp_ms - samples[0].timestamp_ms) as f64;
        let mean_gap = span / (samples.len() - 1) as f64;
        assert!((mean_gap - 50.0).abs() <= 5.0, "mean gap {mean_gap}ms");
        assert!(samples.iter().all(|s| s.run_id == "run-1"));
    }

    #[test]
    fn dropping_the_monitor_stops_it() {
        let collector = InMemoryReportCollector::new();
        let records = collector.records();
        let reporter = ReportConfig::default()
            .with_collector(collector)
            .init()
            .unwrap();

        drop(ResourceMonitor::start(
            &MonitorConfig::default(),
            Arc::new(FakeContainer::default()),
            target(),
            "run-1",
            reporter,
            progress_channel().0,
        ));
        let count = records.snapshot().resources.len();
        std::thread::sleep(Duration::from_millis(400));

        assert_eq!(records.snapshot().resources.len(), count);
    }
}
