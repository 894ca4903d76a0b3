use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*([A-Za-z0-9_]+)\s*:\s*([A-Za-z0-9_]+)\s*\)").expect("valid node pattern")
});

// Group 3 wraps the right hand node so scanning can resume there; chained patterns share nodes.
static LEFT_EDGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\(\s*([A-Za-z0-9_]+)?(?:\s*:\s*[A-Za-z0-9_]+)?\s*\)\s*<-\s*\[\s*:\s*([A-Za-z0-9_]+)\s*\]\s*-\s*(\(\s*([A-Za-z0-9_]+)?(?:\s*:\s*[A-Za-z0-9_]+)?\s*\))",
    )
    .expect("valid left edge pattern")
});

static RIGHT_EDGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\(\s*([A-Za-z0-9_]+)?(?:\s*:\s*[A-Za-z0-9_]+)?\s*\)\s*-\s*\[\s*:\s*([A-Za-z0-9_]+)\s*\]\s*->\s*(\(\s*([A-Za-z0-9_]+)?(?:\s*:\s*[A-Za-z0-9_]+)?\s*\))",
    )
    .expect("valid right edge pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagramNode {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagramEdge {
    pub source: String,
    pub target: String,
    pub label: String,
}

/// Node and edge structure of a query's MATCH patterns, for display next to its results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagram {
    pub nodes: Vec<DiagramNode>,
    pub edges: Vec<DiagramEdge>,
}

/// Extract the diagram of a Cypher template.
///
/// Node ids are the lowercased pattern variables. A variable bound twice keeps its first position
/// and its last label. `(a)<-[:R]-(b)` yields the edge `b -> a`.
pub fn diagram_for(template: &str) -> Diagram {
    let mut nodes: Vec<DiagramNode> = Vec::new();
    for caps in NODE.captures_iter(template) {
        let id = caps[1].to_lowercase();
        let label = caps[2].to_string();
        match nodes.iter_mut().find(|n| n.id == id) {
            Some(existing) => existing.label = label,
            None => nodes.push(DiagramNode { id, label }),
        }
    }

    let mut edges = Vec::new();
    scan_edges(&LEFT_EDGE, template, "unknown_left", "unknown_right", |left, right, rel| {
        edges.push(DiagramEdge {
            source: right,
            target: left,
            label: rel,
        })
    });
    scan_edges(&RIGHT_EDGE, template, "unknown_source", "unknown_target", |left, right, rel| {
        edges.push(DiagramEdge {
            source: left,
            target: right,
            label: rel,
        })
    });

    Diagram { nodes, edges }
}

fn scan_edges(
    pattern: &Regex,
    text: &str,
    left_default: &str,
    right_default: &str,
    mut on_edge: impl FnMut(String, String, String),
) {
    let mut at = 0;
    while let Some(caps) = pattern.captures_at(text, at) {
        on_edge(
            variable(caps.get(1), left_default),
            variable(caps.get(4), right_default),
            caps[2].to_string(),
        );
        at = match caps.get(3) {
            Some(right_node) => right_node.start(),
            None => break,
        };
    }
}

fn variable(m: Option<regex::Match<'_>>, default: &str) -> String {
    m.map(|m| m.as_str().to_lowercase())
        .unwrap_or_else(|| default.to_string())
}
