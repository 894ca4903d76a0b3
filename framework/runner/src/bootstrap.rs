use crate::config::{PipelineConfig, VariantConfig};
use crate::progress::ProgressSender;
use crate::shell::run_checked;
use crate::tool_path::tool_path;
use anyhow::Context;
use graph_store_client::prelude::{BoltGraphStore, GraphStore};
use graph_tunnel_core::prelude::{CancelListener, CancelledError, RetryPolicy, StageError};
use graph_tunnel_summary_model::StoreVariant;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio::runtime::Handle;

/// A container to start detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `host:container` port mappings.
    pub ports: Vec<String>,
    /// Absolute host directory and the path it is mounted at.
    pub volume: Option<(PathBuf, String)>,
}

/// The container management the pipeline needs.
pub trait ContainerRuntime: Send + Sync {
    /// Stop the compose project defined in `dir`.
    fn compose_down(&self, dir: &Path) -> anyhow::Result<()>;

    /// Start the compose project defined in `dir`, detached.
    fn compose_up(&self, dir: &Path) -> anyhow::Result<()>;

    /// Force-remove a container. Removing a container that does not exist is an error.
    fn remove_container(&self, name: &str) -> anyhow::Result<()>;

    fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<()>;

    /// Run a command inside a running container and return its stdout.
    fn exec(&self, container: &str, argv: &[&str]) -> anyhow::Result<String>;
}

/// [ContainerRuntime] backed by the `docker` and `docker-compose` command line tools.
pub struct DockerCli {
    docker: PathBuf,
    compose: PathBuf,
}

impl DockerCli {
    pub fn new(docker: impl Into<PathBuf>, compose: impl Into<PathBuf>) -> Self {
        Self {
            docker: docker.into(),
            compose: compose.into(),
        }
    }

    pub fn locate() -> anyhow::Result<Self> {
        Ok(Self::new(tool_path("docker")?, tool_path("docker-compose")?))
    }
}

impl ContainerRuntime for DockerCli {
    fn compose_down(&self, dir: &Path) -> anyhow::Result<()> {
        run_checked(Command::new(&self.compose).arg("down").current_dir(dir))?;
        Ok(())
    }

    fn compose_up(&self, dir: &Path) -> anyhow::Result<()> {
        run_checked(Command::new(&self.compose).args(["up", "-d"]).current_dir(dir))?;
        Ok(())
    }

    fn remove_container(&self, name: &str) -> anyhow::Result<()> {
        run_checked(Command::new(&self.docker).args(["rm", "-f", name]))?;
        Ok(())
    }

    fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<()> {
        let mut command = Command::new(&self.docker);
        command.args(["run", "-d", "--name", &spec.name]);
        for port in &spec.ports {
            command.args(["-p", port]);
        }
        if let Some((host, mount)) = &spec.volume {
            command
                .arg("-v")
                .arg(format!("{}:{mount}", host.display()));
        }
        command.arg(&spec.image);
        run_checked(&mut command)?;
        Ok(())
    }

    fn exec(&self, container: &str, argv: &[&str]) -> anyhow::Result<String> {
        run_checked(Command::new(&self.docker).arg("exec").arg(container).args(argv))
    }
}

/// Opens a client connection to a running store.
pub trait StoreConnector: Send {
    fn connect(
        &self,
        variant: StoreVariant,
        config: &VariantConfig,
    ) -> anyhow::Result<Box<dyn GraphStore>>;
}

/// Connects over Bolt, driving the client on the sweep's runtime.
pub struct BoltConnector {
    runtime: Handle,
}

impl BoltConnector {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl StoreConnector for BoltConnector {
    fn connect(
        &self,
        variant: StoreVariant,
        config: &VariantConfig,
    ) -> anyhow::Result<Box<dyn GraphStore>> {
        let (user, password) = config.credentials();
        log::debug!("Connecting to {variant} at {}", config.uri);
        let store = BoltGraphStore::connect(self.runtime.clone(), &config.uri, &user, &password)?;
        Ok(Box::new(store))
    }
}

/// Restarts the message broker and the graph store, then connects to the store.
pub struct Bootstrapper {
    containers: Arc<dyn ContainerRuntime>,
    connector: Box<dyn StoreConnector>,
    broker_compose_dir: PathBuf,
    settings: PipelineConfig,
    variants: BTreeMap<String, VariantConfig>,
    progress: ProgressSender,
    cancel: CancelListener,
}

impl Bootstrapper {
    pub fn new(
        containers: Arc<dyn ContainerRuntime>,
        connector: Box<dyn StoreConnector>,
        broker_compose_dir: impl Into<PathBuf>,
        settings: PipelineConfig,
        variants: BTreeMap<String, VariantConfig>,
        progress: ProgressSender,
        cancel: CancelListener,
    ) -> Self {
        Self {
            containers,
            connector,
            broker_compose_dir: broker_compose_dir.into(),
            settings,
            variants,
            progress,
            cancel,
        }
    }

    pub fn restart_broker(&self) -> anyhow::Result<()> {
        self.progress.text("Restarting message broker...");
        let dir = &self.broker_compose_dir;
        self.containers
            .compose_down(dir)
            .with_context(|| format!("Failed to stop the broker defined in {}", dir.display()))?;
        self.containers
            .compose_up(dir)
            .with_context(|| format!("Failed to start the broker defined in {}", dir.display()))?;
        log::info!("Message broker restarted");
        Ok(())
    }

    /// Replace the store container with a fresh one running `tag`.
    ///
    /// Every configured variant's container is removed first, since they share ports. There is
    /// no health probe, only the configured settle delay.
    pub fn restart_store(&self, tag: &str) -> anyhow::Result<StoreVariant> {
        for config in self.variants.values() {
            if let Err(e) = self.containers.remove_container(&config.container_name) {
                log::debug!("Nothing to remove for {}: {e:#}", config.container_name);
            }
        }

        let (variant, config) = self.variant(tag)?;

        std::fs::create_dir_all(&config.volume_dir).with_context(|| {
            format!("Failed to create data directory {}", config.volume_dir.display())
        })?;
        let host_dir = std::fs::canonicalize(&config.volume_dir)?;

        self.progress.text(format!("Starting {variant} store..."));
        self.containers
            .run_container(&ContainerSpec {
                name: config.container_name.clone(),
                image: config.image.clone(),
                ports: config.ports.clone(),
                volume: Some((host_dir, config.mount.clone())),
            })
            .with_context(|| format!("Failed to start the {variant} container"))?;
        log::info!(
            "Started {} from {}, settling for {:?}",
            config.container_name,
            config.image,
            self.settings.store_settle()
        );

        self.cancel.pause(self.settings.store_settle())?;
        Ok(variant)
    }

    /// Connect to the store, retrying with a fixed backoff.
    pub fn connect(&self, variant: StoreVariant) -> anyhow::Result<Box<dyn GraphStore>> {
        let (_, config) = self.variant(variant.as_str())?;
        let policy = RetryPolicy::new(
            self.settings.connect_attempts,
            self.settings.connect_backoff(),
        );

        policy
            .run(&format!("Connecting to {variant}"), &self.cancel, |attempt| {
                if attempt > 1 {
                    self.progress
                        .text(format!("Retrying connection to {variant} (attempt {attempt})..."));
                }
                self.connector.connect(variant, config)
            })
            .map_err(|exhausted| {
                if exhausted.last_error.is::<CancelledError>() {
                    return exhausted.last_error;
                }
                StageError::Connection {
                    variant: variant.to_string(),
                    attempts: exhausted.attempts,
                    last_error: format!("{:#}", exhausted.last_error),
                }
                .into()
            })
    }

    fn variant(&self, tag: &str) -> anyhow::Result<(StoreVariant, &VariantConfig)> {
        StoreVariant::parse(tag)
            .and_then(|variant| {
                self.variants
                    .get(variant.as_str())
                    .map(|config| (variant, config))
            })
            .ok_or_else(|| {
                StageError::UnsupportedVariant {
                    variant: tag.to_string(),
                }
                .into()
            })
    }

    /// Shared with the resource monitor, which reads the store's counters through it.
    pub fn containers(&self) -> Arc<dyn ContainerRuntime> {
        self.containers.clone()
    }

    pub fn variant_config(&self, variant: StoreVariant) -> Option<&VariantConfig> {
        self.variants.get(variant.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::progress::progress_channel;
    use graph_store_client::prelude::RecordingStore;
    use graph_tunnel_core::prelude::CancelHandle;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeDocker {
        calls: Mutex<Vec<String>>,
        fail_compose: bool,
    }

    impl ContainerRuntime for FakeDocker {
        fn compose_down(&self, _dir: &Path) -> anyhow::Result<()> {
            self.calls.lock().push("compose down".to_string());
            Ok(())
        }

        fn compose_up(&self, _dir: &Path) -> anyhow::Result<()> {
            self.calls.lock().push("compose up".to_string());
            if self.fail_compose {
                anyhow::bail!("no compose file");
            }
            Ok(())
        }

        fn remove_container(&self, name: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("rm {name}"));
            anyhow::bail!("No such container: {name}")
        }

        fn run_container(&self, spec: &ContainerSpec) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push(format!("run {} {}", spec.name, spec.image));
            Ok(())
        }

        fn exec(&self, _container: &str, _argv: &[&str]) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    struct FlakyConnector {
        failures: u32,
        attempts: AtomicU32,
    }

    impl StoreConnector for FlakyConnector {
        fn connect(
            &self,
            _variant: StoreVariant,
            _config: &VariantConfig,
        ) -> anyhow::Result<Box<dyn GraphStore>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(RecordingStore::new()))
        }
    }

    fn bootstrapper(
        docker: Arc<FakeDocker>,
        failures: u32,
        data_dir: &Path,
    ) -> (Bootstrapper, CancelHandle) {
        let mut config = SweepConfig::default();
        for variant in config.variants.values_mut() {
            variant.volume_dir = data_dir.join(&variant.volume_dir);
        }
        config.pipeline.store_settle_secs = 0.0;
        config.pipeline.connect_backoff_secs = 0.0;
        let (progress, _receiver) = progress_channel();
        let cancel = CancelHandle::new();
        let bootstrapper = Bootstrapper::new(
            docker,
            Box::new(FlakyConnector {
                failures,
                attempts: AtomicU32::new(0),
            }),
            data_dir,
            config.pipeline,
            config.variants,
            progress,
            cancel.new_listener(),
        );
        (bootstrapper, cancel)
    }

    #[test]
    fn store_restart_removes_every_store_container_first() {
        let docker = Arc::new(FakeDocker::default());
        let dir = TempDir::new().unwrap();
        let (bootstrapper, _cancel) = bootstrapper(docker.clone(), 0, dir.path());

        let variant = bootstrapper.restart_store("memgraph").unwrap();

        assert_eq!(variant, StoreVariant::Memgraph);
        assert_eq!(
            *docker.calls.lock(),
            vec![
                "rm kubegrapher-memgraph-1",
                "rm kubegrapher-neo4j-1",
                "run kubegrapher-memgraph-1 memgraph/memgraph:latest",
            ]
        );
        assert!(dir.path().join("memgraph").is_dir());
    }

    #[test]
    fn unknown_variant_is_rejected_before_starting_anything() {
        let docker = Arc::new(FakeDocker::default());
        let dir = TempDir::new().unwrap();
        let (bootstrapper, _cancel) = bootstrapper(docker.clone(), 0, dir.path());

        let err = bootstrapper.restart_store("janusgraph").unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::UnsupportedVariant { variant }) if variant == "janusgraph"
        ));
        assert!(!docker.calls.lock().iter().any(|c| c.starts_with("run")));
    }

    #[test]
    fn broker_restart_failure_is_reported() {
        let docker = Arc::new(FakeDocker {
            fail_compose: true,
            ..Default::default()
        });
        let dir = TempDir::new().unwrap();
        let (bootstrapper, _cancel) = bootstrapper(docker, 0, dir.path());

        let err = bootstrapper.restart_broker().unwrap_err();

        assert!(format!("{err:#}").contains("no compose file"));
    }

    #[test]
    fn connection_is_retried_within_budget() {
        let docker = Arc::new(FakeDocker::default());
        let dir = TempDir::new().unwrap();
        let (bootstrapper, _cancel) = bootstrapper(docker, 4, dir.path());

        assert!(bootstrapper.connect(StoreVariant::Neo4j).is_ok());
    }

    #[test]
    fn exhausted_connection_budget_is_a_connection_error() {
        let docker = Arc::new(FakeDocker::default());
        let dir = TempDir::new().unwrap();
        let (bootstrapper, _cancel) = bootstrapper(docker, 5, dir.path());

        let err = bootstrapper.connect(StoreVariant::Neo4j).err().unwrap();

        assert!(matches!(
            err.downcast_ref::<StageError>(),
            Some(StageError::Connection { attempts: 5, last_error, .. }) if last_error == "connection refused"
        ));
    }
}
