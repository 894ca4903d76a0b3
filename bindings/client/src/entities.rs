use crate::catalog::Anchor;
use crate::store::{GraphStore, StoreQuery};
use graph_tunnel_core::prelude::StageError;
use rand::seq::SliceRandom;
use rand::Rng;

/// Node the simulated control plane registers. It never carries workloads, so it is never picked.
pub const CONTROL_PLANE_NODE: &str = "kwok-kwok-control-plane";

const CLUSTER_IDS: &str = "MATCH (C:Cluster) RETURN C.id AS id";
const NODE_IDS: &str = "MATCH (N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                        WHERE C.id = $cluster_id AND N.name <> $excluded\n\
                        RETURN N.id AS id";
const POD_IDS: &str = "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)\n\
                       WHERE N.id = $node_id\n\
                       RETURN P.id AS id";
const REPLICASET_IDS: &str = "MATCH (R:ReplicaSet) RETURN R.id AS id";

/// Entity ids read back from the store after ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPool {
    pub cluster_id: String,
    pub node_ids: Vec<String>,
    /// Pods of a single, randomly chosen node.
    pub pod_ids: Vec<String>,
    pub replicaset_ids: Vec<String>,
}

/// One id per anchor kind, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBindings {
    pub cluster_id: String,
    pub node_id: String,
    pub pod_id: String,
    pub replicaset_id: String,
}

impl EntityBindings {
    pub fn id_for(&self, anchor: Anchor) -> &str {
        match anchor {
            Anchor::Cluster => &self.cluster_id,
            Anchor::Node => &self.node_id,
            Anchor::Pod => &self.pod_id,
            Anchor::ReplicaSet => &self.replicaset_id,
        }
    }
}

fn empty_graph(reason: &str) -> anyhow::Error {
    StageError::EmptyGraph {
        reason: reason.to_string(),
    }
    .into()
}

impl EntityPool {
    /// Read the ids the benchmark will anchor its queries on.
    ///
    /// One cluster is picked at random when the store holds several. Any empty id set means the
    /// ingestion did not populate the graph and is reported as [StageError::EmptyGraph].
    pub fn discover(store: &dyn GraphStore, rng: &mut impl Rng) -> anyhow::Result<Self> {
        let cluster_ids = store.read_column(&StoreQuery::new(CLUSTER_IDS), "id")?;
        let cluster_id = cluster_ids
            .choose(rng)
            .cloned()
            .ok_or_else(|| empty_graph("No clusters found in graph"))?;

        let node_ids = store.read_column(
            &StoreQuery::new(NODE_IDS)
                .param("cluster_id", cluster_id.as_str())
                .param("excluded", CONTROL_PLANE_NODE),
            "id",
        )?;
        let pod_node = node_ids
            .choose(rng)
            .ok_or_else(|| empty_graph("No nodes found in graph"))?;

        let pod_ids = store.read_column(
            &StoreQuery::new(POD_IDS).param("node_id", pod_node.as_str()),
            "id",
        )?;
        if pod_ids.is_empty() {
            return Err(empty_graph("No pods found in graph"));
        }

        let replicaset_ids = store.read_column(&StoreQuery::new(REPLICASET_IDS), "id")?;
        if replicaset_ids.is_empty() {
            return Err(empty_graph("No replicasets found in graph"));
        }

        log::info!(
            "Discovered cluster {cluster_id} with {} node(s), {} pod(s) on node {pod_node} and {} replicaset(s)",
            node_ids.len(),
            pod_ids.len(),
            replicaset_ids.len()
        );

        Ok(Self {
            cluster_id,
            node_ids,
            pod_ids,
            replicaset_ids,
        })
    }

    /// Pick the ids every query of this run is bound to.
    pub fn pick(&self, rng: &mut impl Rng) -> EntityBindings {
        EntityBindings {
            cluster_id: self.cluster_id.clone(),
            node_id: choose_one(&self.node_ids, rng),
            pod_id: choose_one(&self.pod_ids, rng),
            replicaset_id: choose_one(&self.replicaset_ids, rng),
        }
    }
}

// `discover` never builds a pool with an empty id set.
fn choose_one(ids: &[String], rng: &mut impl Rng) -> String {
    ids.choose(rng).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordingStore;
    use pretty_assertions::assert_eq;

    fn populated() -> RecordingStore {
        RecordingStore::new()
            .with_column("(C:Cluster) RETURN", &["cluster-a"])
            .with_column("N.name <> $excluded", &["node-1", "node-2"])
            .with_column("(P:Pod)", &["pod-1", "pod-2", "pod-3"])
            .with_column("(R:ReplicaSet)", &["rs-1"])
    }

    fn stage_error(err: anyhow::Error) -> StageError {
        err.downcast::<StageError>().unwrap()
    }

    #[test]
    fn discovery_excludes_the_control_plane_node() {
        let store = populated();

        let pool = EntityPool::discover(&store, &mut rand::thread_rng()).unwrap();

        assert_eq!(pool.cluster_id, "cluster-a");
        assert_eq!(pool.node_ids.len(), 2);
        let node_query = store
            .executed()
            .into_iter()
            .find(|q| q.text.contains("K8sNode)-[:BELONGS_TO]"))
            .unwrap();
        assert!(node_query
            .params
            .contains(&("excluded".to_string(), CONTROL_PLANE_NODE.to_string())));
    }

    #[test]
    fn empty_node_set_is_an_empty_graph() {
        let store = RecordingStore::new().with_column("(C:Cluster) RETURN", &["cluster-a"]);

        let err = EntityPool::discover(&store, &mut rand::thread_rng()).unwrap_err();

        assert!(matches!(
            stage_error(err),
            StageError::EmptyGraph { reason } if reason == "No nodes found in graph"
        ));
    }

    #[test]
    fn empty_pod_set_is_an_empty_graph() {
        let store = RecordingStore::new()
            .with_column("(C:Cluster) RETURN", &["cluster-a"])
            .with_column("N.name <> $excluded", &["node-1"]);

        let err = EntityPool::discover(&store, &mut rand::thread_rng()).unwrap_err();

        assert!(matches!(
            stage_error(err),
            StageError::EmptyGraph { reason } if reason == "No pods found in graph"
        ));
    }

    #[test]
    fn picked_bindings_come_from_the_pool() {
        let pool = EntityPool::discover(&populated(), &mut rand::thread_rng()).unwrap();

        let bindings = pool.pick(&mut rand::thread_rng());

        assert_eq!(bindings.cluster_id, "cluster-a");
        assert!(pool.node_ids.contains(&bindings.node_id));
        assert!(pool.pod_ids.contains(&bindings.pod_id));
        assert_eq!(bindings.replicaset_id, "rs-1");
        assert_eq!(bindings.id_for(Anchor::Pod), bindings.pod_id);
    }
}
