use crate::config::ProvisioningConfig;
use crate::progress::{ProgressEvent, ProgressSender, ScaleProgress};
use crate::shell::{run_checked, run_with_stdin};
use crate::tool_path::tool_path;
use anyhow::Context;
use graph_tunnel_core::prelude::{CancelListener, CancelledError, StageError};
use graph_tunnel_summary_model::Topology;
use itertools::Itertools;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Passed to cluster creation, in this order.
const CREATE_CONFIGS: [&str; 3] = [
    "workflow-fast.yaml",
    "metrics-usage.yaml",
    "metrics-resource.yaml",
];
/// Must exist before any cluster is created.
const REQUIRED_CONFIGS: [&str; 4] = [
    "metrics-usage.yaml",
    "usage-from-annotation.yaml",
    "metrics-resource.yaml",
    "workflow-fast.yaml",
];
const NODE_TEMPLATE: &str = "node.yaml";
const DEPLOYMENT_TEMPLATE: &str = "deployment.yaml";
const METRICS_PATH_ANNOTATION: &str = "metrics.k8s.io/resource-metrics-path";
const PROGRESS_DIV: &str = "deployment-progress";

/// The cluster management tools the provisioner shells out to.
pub trait ClusterTool: Send {
    /// Remove every simulated cluster on this machine.
    fn delete_all_clusters(&self) -> anyhow::Result<()>;

    fn create_cluster(&self, name: &str, config_files: &[PathBuf]) -> anyhow::Result<()>;

    /// Apply a (possibly multi-document) manifest to the current cluster.
    fn apply(&self, manifest: &str) -> anyhow::Result<()>;

    /// Deployment listing without headers, one deployment per line with `ready/desired` in the
    /// second column.
    fn deployment_status(&self) -> anyhow::Result<String>;
}

/// [ClusterTool] backed by `kwokctl` and `kubectl`.
pub struct KwokTool {
    kwokctl: PathBuf,
    kubectl: PathBuf,
}

impl KwokTool {
    pub fn new(kwokctl: impl Into<PathBuf>, kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kwokctl: kwokctl.into(),
            kubectl: kubectl.into(),
        }
    }

    /// Find both tools on `PATH` or through their override variables.
    pub fn locate() -> anyhow::Result<Self> {
        Ok(Self::new(tool_path("kwokctl")?, tool_path("kubectl")?))
    }
}

impl ClusterTool for KwokTool {
    fn delete_all_clusters(&self) -> anyhow::Result<()> {
        run_checked(Command::new(&self.kwokctl).args(["delete", "cluster", "--all"]))?;
        Ok(())
    }

    fn create_cluster(&self, name: &str, config_files: &[PathBuf]) -> anyhow::Result<()> {
        let mut command = Command::new(&self.kwokctl);
        command.args(["create", "cluster", "--name", name, "--enable-metrics-server"]);
        for file in config_files {
            command.arg("-c").arg(file);
        }
        run_checked(&mut command)?;
        Ok(())
    }

    fn apply(&self, manifest: &str) -> anyhow::Result<()> {
        run_with_stdin(
            Command::new(&self.kubectl).args(["apply", "-f", "-"]),
            manifest,
        )?;
        Ok(())
    }

    fn deployment_status(&self) -> anyhow::Result<String> {
        run_checked(Command::new(&self.kubectl).args(["get", "deployments", "--no-headers"]))
    }
}

/// One reading of the deployment listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    NoDeployments,
    Ready { deployments: usize },
    /// `name ready/desired` for every deployment still scaling.
    NotReady { pending: Vec<String> },
    /// Lines whose replica column could not be read.
    Unparseable { lines: Vec<String> },
}

pub(crate) fn parse_deployment_status(output: &str) -> Readiness {
    let mut deployments = 0;
    let mut pending = Vec::new();
    let mut malformed = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        deployments += 1;
        let mut columns = line.split_whitespace();
        let (Some(name), Some(replicas)) = (columns.next(), columns.next()) else {
            malformed.push(line.to_string());
            continue;
        };
        match replicas.split_once('/') {
            Some((ready, desired)) if ready == desired => {}
            Some(_) => pending.push(format!("{name} {replicas}")),
            None => malformed.push(line.to_string()),
        }
    }

    if deployments == 0 {
        Readiness::NoDeployments
    } else if !malformed.is_empty() {
        Readiness::Unparseable { lines: malformed }
    } else if !pending.is_empty() {
        Readiness::NotReady { pending }
    } else {
        Readiness::Ready { deployments }
    }
}

pub(crate) fn node_name(cluster: &str, index: usize) -> String {
    format!("{cluster}-node-{index}")
}

fn metrics_path(node: &str) -> Value {
    Value::from(format!("/metrics/nodes/{node}/metrics/resource"))
}

/// Set `path` in a YAML document, creating intermediate mappings where they are missing or null.
fn set_path(doc: &mut Value, path: &[&str], value: Value) -> anyhow::Result<()> {
    let Some((last, parents)) = path.split_last() else {
        anyhow::bail!("Empty path");
    };
    let mut current = doc;
    for key in parents {
        let Value::Mapping(map) = current else {
            anyhow::bail!("Expected a mapping above '{key}' in {}", path.join("."));
        };
        if map.get(*key).map_or(true, Value::is_null) {
            map.insert(Value::from(*key), Value::Mapping(Mapping::new()));
        }
        current = map
            .get_mut(*key)
            .with_context(|| format!("Missing '{key}' in {}", path.join(".")))?;
    }
    let Value::Mapping(map) = current else {
        anyhow::bail!("Expected a mapping above '{last}' in {}", path.join("."));
    };
    map.insert(Value::from(*last), value);
    Ok(())
}

pub(crate) fn render_node(template: &Value, node: &str) -> anyhow::Result<Value> {
    let mut doc = template.clone();
    set_path(&mut doc, &["metadata", "name"], Value::from(node))?;
    set_path(
        &mut doc,
        &["metadata", "annotations", METRICS_PATH_ANNOTATION],
        metrics_path(node),
    )?;
    Ok(doc)
}

pub(crate) fn render_deployment(
    template: &Value,
    node: &str,
    replicas: usize,
) -> anyhow::Result<Value> {
    let mut doc = template.clone();
    let app = Value::from(format!("{node}-pods"));
    set_path(
        &mut doc,
        &["metadata", "name"],
        Value::from(format!("deployment-for-{node}")),
    )?;
    set_path(&mut doc, &["metadata", "labels", "app"], app.clone())?;
    set_path(&mut doc, &["spec", "selector", "matchLabels", "app"], app.clone())?;
    set_path(&mut doc, &["spec", "template", "metadata", "labels", "app"], app)?;
    set_path(&mut doc, &["spec", "replicas"], Value::from(replicas as u64))?;
    set_path(&mut doc, &["spec", "template", "spec", "nodeName"], Value::from(node))?;
    set_path(
        &mut doc,
        &["spec", "template", "metadata", "annotations", METRICS_PATH_ANNOTATION],
        metrics_path(node),
    )?;
    Ok(doc)
}

/// Keep cancellation and typed stage failures as they are, anything else becomes a
/// [StageError::Provisioning].
fn provisioning_failure(err: anyhow::Error) -> anyhow::Error {
    if err.is::<CancelledError>() || err.is::<StageError>() {
        return err;
    }
    StageError::Provisioning {
        reason: format!("{err:#}"),
    }
    .into()
}

/// Builds simulated cluster topologies and waits for them to settle.
pub struct Provisioner {
    tool: Box<dyn ClusterTool>,
    manifests_dir: PathBuf,
    settings: ProvisioningConfig,
    progress: ProgressSender,
    cancel: CancelListener,
}

impl Provisioner {
    pub fn new(
        tool: Box<dyn ClusterTool>,
        manifests_dir: impl Into<PathBuf>,
        settings: ProvisioningConfig,
        progress: ProgressSender,
        cancel: CancelListener,
    ) -> Self {
        Self {
            tool,
            manifests_dir: manifests_dir.into(),
            settings,
            progress,
            cancel,
        }
    }

    /// Replace whatever is running with `topology`: clusters `kwok-1` to `kwok-<n>`, each scaled
    /// to the requested nodes and pods.
    pub fn provision(&self, topology: &Topology) -> anyhow::Result<()> {
        self.progress.text("Deleting previous KWOK clusters...");
        self.reset_all().map_err(provisioning_failure)?;

        for i in 1..=topology.clusters {
            let name = format!("kwok-{i}");
            self.progress.text(format!(
                "Generating new KWOK cluster {name} with Metrics Server..."
            ));
            self.create_cluster(&name).map_err(provisioning_failure)?;

            self.progress
                .text(format!("Scaling nodes and pods for cluster {name}..."));
            self.progress.send(ProgressEvent::toggle_div(PROGRESS_DIV));
            self.scale(&name, topology.nodes, topology.pods)
                .map_err(provisioning_failure)?;

            self.progress.text("Cluster creation complete");
            self.cancel.pause(self.settings.cluster_settle())?;
            self.progress.send(ProgressEvent::toggle_div(PROGRESS_DIV));
        }
        Ok(())
    }

    pub fn reset_all(&self) -> anyhow::Result<()> {
        log::info!("Deleting all KWOK clusters");
        self.tool
            .delete_all_clusters()
            .context("Failed to delete existing clusters")
    }

    pub fn create_cluster(&self, name: &str) -> anyhow::Result<()> {
        for file in REQUIRED_CONFIGS {
            let path = self.manifests_dir.join(file);
            if !path.is_file() {
                return Err(StageError::Provisioning {
                    reason: format!("Missing configuration file {}", path.display()),
                }
                .into());
            }
        }

        log::info!("Creating KWOK cluster {name}");
        let configs = CREATE_CONFIGS
            .iter()
            .map(|file| self.manifests_dir.join(file))
            .collect::<Vec<_>>();
        self.tool
            .create_cluster(name, &configs)
            .with_context(|| format!("Failed to create cluster {name}"))
    }

    /// Create `nodes` nodes in one batch, then one deployment of `pods` replicas per node.
    pub fn scale(&self, cluster: &str, nodes: usize, pods: usize) -> anyhow::Result<()> {
        let node_template = self.load_template(NODE_TEMPLATE)?;
        let deployment_template = self.load_template(DEPLOYMENT_TEMPLATE)?;
        let names = (1..=nodes).map(|i| node_name(cluster, i)).collect::<Vec<_>>();

        let node_docs = names
            .iter()
            .map(|node| {
                render_node(&node_template, node)
                    .and_then(|doc| Ok(serde_yaml::to_string(&doc)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if !node_docs.is_empty() {
            self.tool
                .apply(&node_docs.iter().join("---\n"))
                .with_context(|| format!("Failed to apply nodes for cluster {cluster}"))?;
        }

        for (i, node) in names.iter().enumerate() {
            let current = i + 1;
            let deployment = render_deployment(&deployment_template, node, pods)?;
            self.tool
                .apply(&serde_yaml::to_string(&deployment)?)
                .with_context(|| format!("Failed to apply deployment for {node}"))?;
            self.progress.send(ProgressEvent::ScaleDeployments(ScaleProgress::new(
                node.as_str(),
                current,
                nodes,
                pods,
            )));

            if self.settings.readiness_every > 0 && current % self.settings.readiness_every == 0 {
                self.wait_until_ready()?;
            }
            if self.cancel.is_cancelled() {
                return Err(CancelledError::default().into());
            }
        }

        log::info!(
            "Applied {nodes} nodes and deployments with {pods} pods per node for cluster {cluster}"
        );
        Ok(())
    }

    /// Poll until every deployment has all its replicas.
    ///
    /// There is no deadline. The wait only gives up when the listing cannot be read
    /// `max_status_failures` times in a row.
    pub fn wait_until_ready(&self) -> anyhow::Result<()> {
        let mut failures = 0;
        loop {
            let readiness = match self.tool.deployment_status() {
                Ok(output) => parse_deployment_status(&output),
                Err(e) => Readiness::Unparseable {
                    lines: vec![format!("{e:#}")],
                },
            };

            match readiness {
                Readiness::NoDeployments => {
                    log::info!("No deployments found");
                    return Ok(());
                }
                Readiness::Ready { deployments } => {
                    log::info!("All {deployments} deployments are fully ready");
                    return Ok(());
                }
                Readiness::NotReady { pending } => {
                    failures = 0;
                    log::debug!(
                        "Waiting for {} deployment(s) to become ready: {}",
                        pending.len(),
                        pending.iter().take(5).join(", ")
                    );
                }
                Readiness::Unparseable { lines } => {
                    failures += 1;
                    log::warn!(
                        "Could not read deployment status ({failures}/{}): {}",
                        self.settings.max_status_failures,
                        lines.join(" | ")
                    );
                    self.progress.text(format!(
                        "Error reading deployment status: {}",
                        lines.join(" | ")
                    ));
                    if failures >= self.settings.max_status_failures {
                        return Err(StageError::Provisioning {
                            reason: format!(
                                "Deployment status unreadable {failures} times in a row"
                            ),
                        }
                        .into());
                    }
                }
            }

            self.cancel.pause(self.settings.readiness_poll())?;
        }
    }

    /// One status read. An empty cluster is not ready.
    pub fn check_ready(&self) -> bool {
        match self.tool.deployment_status() {
            Ok(output) => match parse_deployment_status(&output) {
                Readiness::Ready { .. } => true,
                Readiness::NoDeployments => {
                    log::info!("No deployments found");
                    false
                }
                other => {
                    log::info!("Some deployments are not ready: {other:?}");
                    false
                }
            },
            Err(e) => {
                log::warn!("Failed to read deployment status: {e:?}");
                false
            }
        }
    }

    fn load_template(&self, file: &str) -> anyhow::Result<Value> {
        let path = self.manifests_dir.join(file);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML in template {}", path.display()))
    }

    pub fn manifests_dir(&self) -> &Path {
        &self.manifests_dir
    }
}
