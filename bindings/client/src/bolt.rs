use crate::store::{GraphStore, StoreQuery};
use anyhow::Context;
use neo4rs::{query, Graph, Query};
use tokio::runtime::Handle;

/// A [GraphStore] speaking the Bolt protocol, which both supported store variants accept.
///
/// The async driver is driven to completion on the given runtime, so the blocking calls must be
/// made from outside that runtime's worker threads.
pub struct BoltGraphStore {
    graph: Graph,
    runtime: Handle,
}

impl BoltGraphStore {
    /// Open a connection pool and prove the store answers a trivial query.
    pub fn connect(runtime: Handle, uri: &str, user: &str, password: &str) -> anyhow::Result<Self> {
        let graph = runtime
            .block_on(Graph::new(uri, user, password))
            .with_context(|| format!("Failed to open a Bolt connection to {uri}"))?;

        let store = Self { graph, runtime };
        store
            .run_read(&StoreQuery::new("RETURN 1 AS ok"))
            .with_context(|| format!("Store at {uri} did not answer"))?;

        log::debug!("Connected to graph store at {uri}");
        Ok(store)
    }
}

fn to_driver_query(store_query: &StoreQuery) -> Query {
    store_query
        .params
        .iter()
        .fold(query(&store_query.text), |q, (key, value)| {
            q.param(key, value.clone())
        })
}

impl GraphStore for BoltGraphStore {
    fn run_read(&self, store_query: &StoreQuery) -> anyhow::Result<usize> {
        self.runtime.block_on(async {
            let mut rows = self.graph.execute(to_driver_query(store_query)).await?;
            let mut count = 0;
            while rows.next().await?.is_some() {
                count += 1;
            }
            Ok::<_, anyhow::Error>(count)
        })
    }

    fn read_column(&self, store_query: &StoreQuery, column: &str) -> anyhow::Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut rows = self.graph.execute(to_driver_query(store_query)).await?;
            let mut values = Vec::new();
            while let Some(row) = rows.next().await? {
                match row.get::<String>(column) {
                    Ok(value) => values.push(value),
                    Err(e) => log::warn!("Skipping row without a string '{column}': {e}"),
                }
            }
            Ok::<_, anyhow::Error>(values)
        })
    }

    fn run_write(&self, store_query: &StoreQuery) -> anyhow::Result<()> {
        self.runtime
            .block_on(self.graph.run(to_driver_query(store_query)))
            .with_context(|| format!("Write failed: {}", store_query.text))
    }
}
