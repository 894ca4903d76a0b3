use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Removes every node and relationship from the store.
pub const CLEAR_ALL: &str = "MATCH (n) DETACH DELETE n";

/// A Cypher statement with its string parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery {
    pub text: String,
    pub params: Vec<(String, String)>,
}

impl StoreQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// The operations the harness needs from a graph store.
///
/// Calls block the current thread until the store answers.
pub trait GraphStore: Send + Sync {
    /// Run a read query and consume every row, returning how many there were.
    fn run_read(&self, query: &StoreQuery) -> anyhow::Result<usize>;

    /// Run a read query and collect one string column from every row.
    fn read_column(&self, query: &StoreQuery, column: &str) -> anyhow::Result<Vec<String>>;

    fn run_write(&self, query: &StoreQuery) -> anyhow::Result<()>;
}

#[derive(Default)]
struct RecordingInner {
    columns: Mutex<Vec<(String, Vec<String>)>>,
    failing: Mutex<Vec<String>>,
    read_delay: Mutex<Duration>,
    executed: Mutex<Vec<StoreQuery>>,
}

/// A scripted in-memory [GraphStore].
///
/// Responses are matched by substring against the query text, first match wins. Every query
/// that reaches the store is recorded. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: Arc<RecordingInner>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer [GraphStore::read_column] with `values` for queries containing `pattern`.
    pub fn with_column(self, pattern: &str, values: &[&str]) -> Self {
        self.inner.columns.lock().push((
            pattern.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    /// Fail every read whose text contains `pattern`.
    pub fn failing_when(self, pattern: &str) -> Self {
        self.inner.failing.lock().push(pattern.to_string());
        self
    }

    /// Make every [GraphStore::run_read] take at least `delay`.
    pub fn with_read_delay(self, delay: Duration) -> Self {
        *self.inner.read_delay.lock() = delay;
        self
    }

    pub fn executed(&self) -> Vec<StoreQuery> {
        self.inner.executed.lock().clone()
    }
}

impl GraphStore for RecordingStore {
    fn run_read(&self, query: &StoreQuery) -> anyhow::Result<usize> {
        self.inner.executed.lock().push(query.clone());
        if let Some(pattern) = self
            .inner
            .failing
            .lock()
            .iter()
            .find(|p| query.text.contains(p.as_str()))
        {
            anyhow::bail!("Scripted failure for query matching '{pattern}'");
        }
        let delay = *self.inner.read_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(1)
    }

    fn read_column(&self, query: &StoreQuery, _column: &str) -> anyhow::Result<Vec<String>> {
        self.inner.executed.lock().push(query.clone());
        Ok(self
            .inner
            .columns
            .lock()
            .iter()
            .find(|(pattern, _)| query.text.contains(pattern.as_str()))
            .map(|(_, values)| values.clone())
            .unwrap_or_default())
    }

    fn run_write(&self, query: &StoreQuery) -> anyhow::Result<()> {
        self.inner.executed.lock().push(query.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scripted_columns_match_by_substring() {
        let store = RecordingStore::new()
            .with_column("Cluster", &["c-1", "c-2"])
            .with_column("K8sNode", &["n-1"]);

        let clusters = store
            .read_column(&StoreQuery::new("MATCH (C:Cluster) RETURN C.id AS id"), "id")
            .unwrap();
        let unknown = store
            .read_column(&StoreQuery::new("MATCH (P:Pod) RETURN P.id AS id"), "id")
            .unwrap();

        assert_eq!(clusters, vec!["c-1".to_string(), "c-2".to_string()]);
        assert!(unknown.is_empty());
        assert_eq!(store.executed().len(), 2);
    }

    #[test]
    fn scripted_failures_only_hit_matching_reads() {
        let store = RecordingStore::new().failing_when("Taint");

        assert!(store
            .run_read(&StoreQuery::new("MATCH (T:Taint) RETURN T"))
            .is_err());
        assert_eq!(
            store
                .run_read(&StoreQuery::new("MATCH (L:Label) RETURN L"))
                .unwrap(),
            1
        );
    }

    #[test]
    fn params_keep_their_order() {
        let query = StoreQuery::new("RETURN $a, $b")
            .param("a", "1")
            .param("b", "2");

        assert_eq!(
            query.params,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }
}
