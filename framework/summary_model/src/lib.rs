use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::{BufRead, Write};
use std::path::Path;

/// Characters used for run identifiers.
const RUN_ID_ALPHABET: [char; 62] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L',
    'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

/// The simulated scale requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub clusters: usize,
    pub nodes: usize,
    /// Replicas per node, not the cluster-wide total.
    pub pods: usize,
}

impl Topology {
    pub fn new(clusters: usize, nodes: usize, pods: usize) -> Self {
        Self {
            clusters,
            nodes,
            pods,
        }
    }

    /// Human readable label used as the default run description, e.g. `10-nodes-with-100-pods`.
    pub fn describe(&self) -> String {
        format!("{}-nodes-with-{}-pods", self.nodes, self.pods)
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cluster(s) x {} node(s) x {} pod(s)",
            self.clusters, self.nodes, self.pods
        )
    }
}

/// The graph database backends a run can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreVariant {
    Neo4j,
    Memgraph,
}

impl StoreVariant {
    pub const ALL: [StoreVariant; 2] = [StoreVariant::Neo4j, StoreVariant::Memgraph];

    /// Match a configured variant tag. Returns `None` for anything outside the supported set.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str().eq_ignore_ascii_case(tag.trim()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreVariant::Neo4j => "neo4j",
            StoreVariant::Memgraph => "memgraph",
        }
    }
}

impl Display for StoreVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of the pipeline against one topology and store variant.
///
/// Created by the orchestrator and never modified afterwards. Every record a run produces
/// carries its [Run::id].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Short random token, unique per sweep iteration.
    pub id: String,
    pub description: String,
    pub topology: Topology,
    pub variant: StoreVariant,
    /// Message queue topic the producer and the grapher share for this run.
    pub topic: String,
}

impl Run {
    pub fn new(description: impl Into<String>, topology: Topology, variant: StoreVariant) -> Self {
        Self {
            id: new_run_id(),
            description: description.into(),
            topology,
            variant,
            topic: new_topic(),
        }
    }
}

/// A 5 character alphanumeric token.
pub fn new_run_id() -> String {
    nanoid::nanoid!(5, &RUN_ID_ALPHABET)
}

/// A fresh message queue topic of the form `cluster<5 digits>`.
pub fn new_topic() -> String {
    format!("cluster{:05}", rand::thread_rng().gen_range(0..100_000))
}

/// How the graph ingestion process was judged finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionOutcome {
    /// The status block repeated unchanged enough times in a row.
    Stable,
    /// The process went quiet for longer than the silence timeout and was killed.
    Silent,
    /// The process closed its output before either of the above happened.
    Exited,
}

impl Display for IngestionOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IngestionOutcome::Stable => "stable",
            IngestionOutcome::Silent => "silent",
            IngestionOutcome::Exited => "exited",
        })
    }
}

/// Ledger entry written once per run, whether it completed or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub description: String,
    pub topology: Topology,
    pub variant: StoreVariant,
    /// Unix timestamp in seconds.
    pub started_at: i64,
    /// Unix timestamp in seconds.
    pub finished_at: i64,
    /// Not set if the run failed before ingestion finished.
    pub ingestion: Option<IngestionOutcome>,
    pub queries_ok: usize,
    pub queries_failed: usize,
    /// Set when a stage failure aborted the run.
    pub error: Option<String>,
}

impl RunSummary {
    pub fn start(run: &Run, started_at: i64) -> Self {
        Self {
            run_id: run.id.clone(),
            description: run.description.clone(),
            topology: run.topology,
            variant: run.variant,
            started_at,
            finished_at: started_at,
            ingestion: None,
            queries_ok: 0,
            queries_failed: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Append the run summary as a single JSON line.
pub fn append_run_summary(run_summary: &RunSummary, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    serde_json::to_writer(&mut file, run_summary)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Load every run summary from a file produced by [append_run_summary].
pub fn load_run_summaries(path: &Path) -> anyhow::Result<Vec<RunSummary>> {
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        runs.push(serde_json::from_str(&line)?);
    }
    Ok(runs)
}
