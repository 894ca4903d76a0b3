use crate::cli::SweepCli;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a sweep needs to know, read from TOML. Every field has a default so an empty file
/// is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub experiments: ExperimentsConfig,
    pub paths: PathsConfig,
    pub provisioning: ProvisioningConfig,
    pub pipeline: PipelineConfig,
    pub ingestion: IngestionConfig,
    pub benchmark: BenchmarkConfig,
    pub monitor: MonitorConfig,
    /// Keyed by store variant tag. Built-in variants that are not listed keep their defaults.
    pub variants: BTreeMap<String, VariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentsConfig {
    pub clusters: Vec<usize>,
    pub nodes: Vec<usize>,
    /// Pods per node.
    pub pods: Vec<usize>,
    /// Query allow-list. Empty means the whole catalog.
    pub queries: Vec<String>,
    pub variants: Vec<String>,
    /// Prefixed to each run's topology description.
    pub description: Option<String>,
    /// Move on to the next combination after a stage failure instead of stopping the sweep.
    pub continue_on_failure: bool,
    pub clear_store_after_run: bool,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            clusters: vec![1],
            nodes: vec![10],
            pods: vec![100],
            queries: Vec::new(),
            variants: vec!["neo4j".to_string(), "memgraph".to_string()],
            description: None,
            continue_on_failure: true,
            clear_store_after_run: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Holds the kwok configuration files and the node and deployment templates.
    pub manifests_dir: PathBuf,
    /// Working directory of the event producer.
    pub producer_dir: PathBuf,
    /// Working directory of the graph ingestion process.
    pub grapher_dir: PathBuf,
    /// Directory holding the message broker's compose file.
    pub broker_compose_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifests_dir: PathBuf::from("k8s"),
            producer_dir: PathBuf::from("kubeinsights"),
            grapher_dir: PathBuf::from("kubegrapher"),
            broker_compose_dir: PathBuf::from("kubeinsights"),
            output_dir: PathBuf::from("metrics"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    pub readiness_poll_secs: f64,
    /// Wait for readiness after this many deployments have been applied.
    pub readiness_every: usize,
    /// Consecutive unparseable status reads before the readiness wait gives up.
    pub max_status_failures: u32,
    /// Pause after the last cluster is scaled.
    pub cluster_settle_secs: f64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            readiness_poll_secs: 1.0,
            readiness_every: 50,
            max_status_failures: 30,
            cluster_settle_secs: 5.0,
        }
    }
}

impl ProvisioningConfig {
    pub fn readiness_poll(&self) -> Duration {
        secs(self.readiness_poll_secs)
    }

    pub fn cluster_settle(&self) -> Duration {
        secs(self.cluster_settle_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Fixed wait after the store container starts. There is no health probe.
    pub store_settle_secs: f64,
    /// Wait between restarting the services and starting the producer.
    pub pipeline_settle_secs: f64,
    pub connect_attempts: u32,
    pub connect_backoff_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_settle_secs: 10.0,
            pipeline_settle_secs: 60.0,
            connect_attempts: 5,
            connect_backoff_secs: 60.0,
        }
    }
}

impl PipelineConfig {
    pub fn store_settle(&self) -> Duration {
        secs(self.store_settle_secs)
    }

    pub fn pipeline_settle(&self) -> Duration {
        secs(self.pipeline_settle_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        secs(self.connect_backoff_secs)
    }
}

/// An external program and how to launch it. Relative programs resolve against the working
/// directory the caller picks.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestionConfig {
    pub producer: CommandConfig,
    pub grapher: CommandConfig,
    /// The producer is publishing once a line contains this.
    pub target_text: String,
    /// First line of the grapher's status block.
    pub sentinel: String,
    pub stable_repetitions: u32,
    pub silence_timeout_secs: f64,
    pub producer_grace_secs: f64,
    pub attempts: u32,
    pub retry_backoff_secs: f64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            producer: CommandConfig {
                program: "go".to_string(),
                args: vec!["run".to_string(), "./cmd/main/main.go".to_string()],
                env: BTreeMap::new(),
            },
            grapher: CommandConfig {
                program: "venv/bin/python".to_string(),
                args: vec![
                    "-u".to_string(),
                    "-m".to_string(),
                    "kubegrapher.run".to_string(),
                ],
                env: BTreeMap::new(),
            },
            target_text: "Sending Event: Update NodeMetrics".to_string(),
            sentinel: "Clusters:".to_string(),
            stable_repetitions: 5,
            silence_timeout_secs: 60.0,
            producer_grace_secs: 5.0,
            attempts: 3,
            retry_backoff_secs: 2.0,
        }
    }
}

impl IngestionConfig {
    pub fn silence_timeout(&self) -> Duration {
        secs(self.silence_timeout_secs)
    }

    pub fn producer_grace(&self) -> Duration {
        secs(self.producer_grace_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        secs(self.retry_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchmarkConfig {
    pub repetitions: u32,
    /// A first iteration slower than this shrinks the sequential run.
    pub slow_threshold_secs: f64,
    pub shrunk_repetitions: u32,
    pub iteration_pause_secs: f64,
    pub throughput_window_secs: f64,
    /// Pause between a query's announcement and each of its two modes.
    pub stage_pause_secs: f64,
    /// Wait after the last query before the store is cleared.
    pub clear_pause_secs: f64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            repetitions: 100,
            slow_threshold_secs: 180.0,
            shrunk_repetitions: 5,
            iteration_pause_secs: 0.1,
            throughput_window_secs: 60.0,
            stage_pause_secs: 2.0,
            clear_pause_secs: 10.0,
        }
    }
}

impl BenchmarkConfig {
    pub fn slow_threshold(&self) -> Duration {
        secs(self.slow_threshold_secs)
    }

    pub fn iteration_pause(&self) -> Duration {
        secs(self.iteration_pause_secs)
    }

    pub fn throughput_window(&self) -> Duration {
        secs(self.throughput_window_secs)
    }

    pub fn stage_pause(&self) -> Duration {
        secs(self.stage_pause_secs)
    }

    pub fn clear_pause(&self) -> Duration {
        secs(self.clear_pause_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub interval_secs: f64,
    pub batch_size: usize,
    /// Size of a memory page inside the store container.
    pub page_size_kib: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0.3,
            batch_size: 5,
            page_size_kib: 4,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }
}

/// How to run and reach one store variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantConfig {
    pub container_name: String,
    pub image: String,
    /// `host:container` port mappings.
    pub ports: Vec<String>,
    /// Host side data directory, created if missing.
    pub volume_dir: PathBuf,
    pub mount: String,
    /// Name of the store process inside the container. Also matched against the `ps` scan, so
    /// only letters, digits, `.`, `_` and `-` are accepted.
    pub process_name: String,
    /// `ps -o` columns the fallback pid scan matches `process_name` against. A JVM store shows up
    /// as `java`, so it is found by its user instead.
    #[serde(default = "default_process_columns")]
    pub process_columns: String,
    /// Used when the process id cannot be looked up.
    #[serde(default = "default_pid")]
    pub default_pid: u32,
    pub uri: String,
    /// `user/password`, also handed to the grapher as `AUTH`.
    #[serde(default)]
    pub auth: String,
}

fn default_pid() -> u32 {
    1
}

fn default_process_columns() -> String {
    "pid,comm".to_string()
}

fn is_plain_word(value: &str, extra: &[char]) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || extra.contains(&c))
}

impl VariantConfig {
    /// Both values end up in a shell command inside the container.
    fn validate(&self, tag: &str) -> anyhow::Result<()> {
        if !is_plain_word(&self.process_name, &['.', '_', '-']) {
            anyhow::bail!(
                "variants.{tag}.process_name {:?} may only contain letters, digits, '.', '_' and '-'",
                self.process_name
            );
        }
        if !is_plain_word(&self.process_columns, &[',']) {
            anyhow::bail!(
                "variants.{tag}.process_columns {:?} must be a comma separated list of ps columns",
                self.process_columns
            );
        }
        Ok(())
    }

    pub fn credentials(&self) -> (String, String) {
        match self.auth.split_once('/') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => (self.auth.clone(), String::new()),
        }
    }

    fn builtin() -> BTreeMap<String, VariantConfig> {
        let ports = vec!["7474:7474".to_string(), "7687:7687".to_string()];
        BTreeMap::from([
            (
                "neo4j".to_string(),
                VariantConfig {
                    container_name: "kubegrapher-neo4j-1".to_string(),
                    image: "neo4j:5.26.0".to_string(),
                    ports: ports.clone(),
                    volume_dir: PathBuf::from("neo4j"),
                    mount: "/data".to_string(),
                    process_name: "neo4j".to_string(),
                    process_columns: "pid,user,comm".to_string(),
                    default_pid: 1,
                    uri: "bolt://localhost:7687".to_string(),
                    auth: "neo4j/password".to_string(),
                },
            ),
            (
                "memgraph".to_string(),
                VariantConfig {
                    container_name: "kubegrapher-memgraph-1".to_string(),
                    image: "memgraph/memgraph:latest".to_string(),
                    ports,
                    volume_dir: PathBuf::from("memgraph"),
                    mount: "/var/lib/memgraph".to_string(),
                    process_name: "memgraph".to_string(),
                    process_columns: default_process_columns(),
                    default_pid: 1,
                    uri: "bolt://localhost:7687".to_string(),
                    auth: String::new(),
                },
            ),
        ])
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            experiments: ExperimentsConfig::default(),
            paths: PathsConfig::default(),
            provisioning: ProvisioningConfig::default(),
            pipeline: PipelineConfig::default(),
            ingestion: IngestionConfig::default(),
            benchmark: BenchmarkConfig::default(),
            monitor: MonitorConfig::default(),
            variants: VariantConfig::builtin(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl SweepConfig {
    /// Read the config file, or use the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: SweepConfig = toml::from_str(content)?;
        config.fill_builtin_variants();
        for (tag, variant) in &config.variants {
            variant.validate(tag)?;
        }
        Ok(config)
    }

    fn fill_builtin_variants(&mut self) {
        for (tag, variant) in VariantConfig::builtin() {
            self.variants.entry(tag).or_insert(variant);
        }
    }

    /// Command line flags win over the file.
    pub fn apply_cli(&mut self, cli: &SweepCli) {
        if !cli.queries.is_empty() {
            self.experiments.queries = cli.queries.clone();
        }
        if !cli.variants.is_empty() {
            self.experiments.variants = cli.variants.clone();
        }
        if let Some(output_dir) = &cli.output_dir {
            self.paths.output_dir = output_dir.clone();
        }
    }

    /// Variant settings for a tag, if the tag is configured.
    pub fn variant(&self, tag: &str) -> Option<&VariantConfig> {
        self.variants.get(tag.trim())
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.paths.output_dir.join("run_summary.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_reproduces_the_harness_constants() {
        let config = SweepConfig::parse("").unwrap();

        assert_eq!(config.experiments.clusters, vec![1]);
        assert_eq!(config.experiments.nodes, vec![10]);
        assert_eq!(config.experiments.pods, vec![100]);
        assert_eq!(config.experiments.variants, vec!["neo4j", "memgraph"]);
        assert_eq!(config.benchmark.repetitions, 100);
        assert_eq!(config.benchmark.slow_threshold(), Duration::from_secs(180));
        assert_eq!(config.benchmark.shrunk_repetitions, 5);
        assert_eq!(config.benchmark.iteration_pause(), Duration::from_millis(100));
        assert_eq!(config.benchmark.throughput_window(), Duration::from_secs(60));
        assert_eq!(config.ingestion.silence_timeout(), Duration::from_secs(60));
        assert_eq!(config.ingestion.stable_repetitions, 5);
        assert_eq!(config.ingestion.attempts, 3);
        assert_eq!(config.pipeline.connect_attempts, 5);
        assert_eq!(config.pipeline.connect_backoff(), Duration::from_secs(60));
        assert_eq!(config.provisioning.readiness_every, 50);
        assert_eq!(config.monitor.interval(), Duration::from_millis(300));
        assert_eq!(config.monitor.batch_size, 5);
        assert_eq!(config.benchmark.clear_pause(), Duration::from_secs(10));
        assert_eq!(config.variants.len(), 2);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = SweepConfig::parse(
            r#"
            [experiments]
            nodes = [10, 50]
            queries = ["test_get_all_pods"]

            [benchmark]
            repetitions = 20

            [variants.memgraph]
            container_name = "mg"
            image = "memgraph/memgraph:2.18"
            ports = ["7687:7687"]
            volume_dir = "/tmp/mg"
            mount = "/var/lib/memgraph"
            process_name = "memgraph"
            uri = "bolt://127.0.0.1:7687"
            "#,
        )
        .unwrap();

        assert_eq!(config.experiments.nodes, vec![10, 50]);
        assert_eq!(config.experiments.pods, vec![100]);
        assert_eq!(config.benchmark.repetitions, 20);
        assert_eq!(config.benchmark.shrunk_repetitions, 5);
        assert_eq!(config.variant("memgraph").unwrap().container_name, "mg");
        assert_eq!(config.variant("memgraph").unwrap().default_pid, 1);
        assert_eq!(
            config.variant("neo4j").unwrap().container_name,
            "kubegrapher-neo4j-1"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SweepConfig::parse("[benchmark]\nrepetitons = 5\n").is_err());
    }

    #[test]
    fn neo4j_is_scanned_by_user_and_memgraph_by_command() {
        let config = SweepConfig::default();

        assert_eq!(config.variants["neo4j"].process_columns, "pid,user,comm");
        assert_eq!(config.variants["memgraph"].process_columns, "pid,comm");
    }

    #[test]
    fn shell_unsafe_process_settings_are_rejected() {
        let variant = |process_name: &str, extra: &str| {
            format!(
                r#"
                [variants.memgraph]
                container_name = "mg"
                image = "memgraph/memgraph:2.18"
                ports = ["7687:7687"]
                volume_dir = "/tmp/mg"
                mount = "/var/lib/memgraph"
                process_name = "{process_name}"
                uri = "bolt://127.0.0.1:7687"
                {extra}
                "#
            )
        };

        assert!(SweepConfig::parse(&variant("memgraph", "")).is_ok());
        assert!(SweepConfig::parse(&variant("memgraph-server.1", "")).is_ok());
        let err = SweepConfig::parse(&variant("mg; rm -rf /", "")).unwrap_err();
        assert!(format!("{err:#}").contains("variants.memgraph.process_name"));
        assert!(SweepConfig::parse(&variant("$(reboot)", "")).is_err());
        assert!(SweepConfig::parse(&variant("", "")).is_err());
        assert!(
            SweepConfig::parse(&variant("memgraph", "process_columns = \"pid,comm | sh\"")).is_err()
        );
    }

    #[test]
    fn credentials_split_on_the_first_slash() {
        let neo4j = VariantConfig::builtin().remove("neo4j").unwrap();
        assert_eq!(
            neo4j.credentials(),
            ("neo4j".to_string(), "password".to_string())
        );

        let memgraph = VariantConfig::builtin().remove("memgraph").unwrap();
        assert_eq!(memgraph.credentials(), (String::new(), String::new()));
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = SweepConfig::default();
        let cli = SweepCli {
            variants: vec!["memgraph".to_string()],
            output_dir: Some(PathBuf::from("/tmp/out")),
            ..Default::default()
        };

        config.apply_cli(&cli);

        assert_eq!(config.experiments.variants, vec!["memgraph"]);
        assert_eq!(config.run_summary_path(), PathBuf::from("/tmp/out/run_summary.jsonl"));
        assert!(config.experiments.queries.is_empty());
    }
}
