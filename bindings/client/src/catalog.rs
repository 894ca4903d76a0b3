use crate::entities::EntityBindings;
use crate::store::StoreQuery;
use std::collections::HashSet;

/// The entity a catalog query starts its traversal from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    Cluster,
    Node,
    Pod,
    ReplicaSet,
}

impl Anchor {
    /// The query parameter the anchor id is bound to.
    pub fn param_name(&self) -> &'static str {
        match self {
            Anchor::Cluster => "cluster_id",
            Anchor::Node => "node_id",
            Anchor::Pod => "pod_id",
            Anchor::ReplicaSet => "replicaset_id",
        }
    }
}

/// A named traversal with a fixed hop count. Hop counts are only used for grouping results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub name: &'static str,
    pub hop_count: u32,
    pub anchor: Anchor,
    pub template: &'static str,
}

/// A catalog entry with its anchor id filled in, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    pub name: &'static str,
    pub hop_count: u32,
    pub template: &'static str,
    pub query: StoreQuery,
}

/// An ordered set of queries to benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCatalog {
    queries: Vec<QueryDescriptor>,
}

impl QueryCatalog {
    /// Every query the harness knows about, in execution order.
    pub fn standard() -> Self {
        Self {
            queries: STANDARD_QUERIES.to_vec(),
        }
    }

    pub fn from_descriptors(queries: Vec<QueryDescriptor>) -> Self {
        Self { queries }
    }

    /// Keep only the named queries, in catalog order. An empty allow-list keeps everything.
    pub fn filter(self, allow_list: &[String]) -> Self {
        if allow_list.is_empty() {
            return self;
        }

        let wanted: HashSet<&str> = allow_list.iter().map(String::as_str).collect();
        let known: HashSet<&str> = self.queries.iter().map(|q| q.name).collect();
        for unknown in wanted.difference(&known) {
            log::warn!("Ignoring unknown query '{unknown}'");
        }

        Self {
            queries: self
                .queries
                .into_iter()
                .filter(|q| wanted.contains(q.name))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&QueryDescriptor> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.queries.iter()
    }

    /// Bind every query to the entity ids picked for this run.
    pub fn bind(&self, bindings: &EntityBindings) -> Vec<BoundQuery> {
        self.queries
            .iter()
            .map(|descriptor| BoundQuery {
                name: descriptor.name,
                hop_count: descriptor.hop_count,
                template: descriptor.template,
                query: StoreQuery::new(descriptor.template).param(
                    descriptor.anchor.param_name(),
                    bindings.id_for(descriptor.anchor),
                ),
            })
            .collect()
    }
}

const STANDARD_QUERIES: &[QueryDescriptor] = &[
    QueryDescriptor {
        name: "test_get_all_nodes",
        hop_count: 1,
        anchor: Anchor::Cluster,
        template: "MATCH (C:Cluster)<-[:BELONGS_TO]-(N:K8sNode)\n\
                   WHERE C.id = $cluster_id\n\
                   RETURN C, N",
    },
    QueryDescriptor {
        name: "test_get_all_node_annotations",
        hop_count: 1,
        anchor: Anchor::Cluster,
        template: "MATCH (C:Cluster)<-[:BELONGS_TO]-(N:K8sNode)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (N)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN C, N, A",
    },
    QueryDescriptor {
        name: "test_get_all_node_labels",
        hop_count: 1,
        anchor: Anchor::Cluster,
        template: "MATCH (C:Cluster)<-[:BELONGS_TO]-(N:K8sNode)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (N)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN C, N, L",
    },
    QueryDescriptor {
        name: "test_get_all_node_taint",
        hop_count: 1,
        anchor: Anchor::Cluster,
        template: "MATCH (C:Cluster)<-[:BELONGS_TO]-(N:K8sNode)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (N)-[:HAS_TAINT]->(T:Taint)\n\
                   RETURN C, N, T",
    },
    QueryDescriptor {
        name: "test_get_all_node_images",
        hop_count: 1,
        anchor: Anchor::Cluster,
        template: "MATCH (C:Cluster)<-[:BELONGS_TO]-(N:K8sNode)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (N)-[:STORES]->(I:Image)\n\
                   RETURN C, N, I",
    },
    QueryDescriptor {
        name: "test_get_all_nodes_pods",
        hop_count: 2,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   RETURN C, N, P",
    },
    QueryDescriptor {
        name: "test_get_all_pods_labels",
        hop_count: 3,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN C, N, P, L",
    },
    QueryDescriptor {
        name: "test_get_all_pods_annotations",
        hop_count: 3,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN C, N, P, A",
    },
    QueryDescriptor {
        name: "test_get_all_pods_containers",
        hop_count: 3,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)\n\
                   RETURN C, N, P, Cont",
    },
    QueryDescriptor {
        name: "test_get_all_pods_replicasets",
        hop_count: 3,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)\n\
                   RETURN C, N, P, R",
    },
    QueryDescriptor {
        name: "test_get_all_pods_replicasets_labels",
        hop_count: 4,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN C, N, P, R, L",
    },
    QueryDescriptor {
        name: "test_get_all_pods_replicasets_annotations",
        hop_count: 4,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN C, N, P, R, A",
    },
    QueryDescriptor {
        name: "test_get_all_pods_deployments",
        hop_count: 4,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)\n\
                   RETURN C, N, P, R, D",
    },
    QueryDescriptor {
        name: "test_get_all_pods_images",
        hop_count: 4,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:INSTANTIATES]->(I:Image)\n\
                   RETURN C, N, P, Cont, I",
    },
    QueryDescriptor {
        name: "test_get_all_container_configmaps",
        hop_count: 4,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:CONFIGMAP_REF]->(Conf:ConfigMap)\n\
                   RETURN C, N, P, Cont, Conf",
    },
    QueryDescriptor {
        name: "test_get_all_pods_deployments_annotations",
        hop_count: 5,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN C, N, P, R, D, A",
    },
    QueryDescriptor {
        name: "test_get_all_pods_deployments_labels",
        hop_count: 5,
        anchor: Anchor::Cluster,
        template: "MATCH (P:Pod)-[:SCHEDULED_ON]->(N:K8sNode)-[:BELONGS_TO]->(C:Cluster)\n\
                   WHERE C.id = $cluster_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN C, N, P, R, D, L",
    },
    QueryDescriptor {
        name: "test_get_pods_for_specific_node",
        hop_count: 1,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   RETURN N, P",
    },
    QueryDescriptor {
        name: "get_labels_for_specific_node",
        hop_count: 1,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN N, L",
    },
    QueryDescriptor {
        name: "get_taint_for_specific_node",
        hop_count: 1,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)-[:HAS_TAINT]->(T:Taint)\n\
                   RETURN N, T",
    },
    QueryDescriptor {
        name: "get_annotation_for_specific_node",
        hop_count: 1,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN N, A",
    },
    QueryDescriptor {
        name: "get_pod_labels_for_specific_node",
        hop_count: 2,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN N, P, L",
    },
    QueryDescriptor {
        name: "get_pod_annotations_for_specific_node",
        hop_count: 2,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN N, P, A",
    },
    QueryDescriptor {
        name: "get_pod_container_for_specific_node",
        hop_count: 2,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)\n\
                   RETURN N, P, Cont",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_for_specific_node",
        hop_count: 2,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)\n\
                   RETURN N, P, R",
    },
    QueryDescriptor {
        name: "get_pod_configmap_for_specific_node",
        hop_count: 3,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:CONFIGMAP_REF]->(Conf:ConfigMap)\n\
                   RETURN N, P, Cont, Conf",
    },
    QueryDescriptor {
        name: "get_pod_image_for_specific_node",
        hop_count: 3,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:INSTANTIATES]->(I:Image)\n\
                   RETURN N, P, Cont, I",
    },
    QueryDescriptor {
        name: "get_pod_deployment_for_specific_node",
        hop_count: 3,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)\n\
                   RETURN N, P, R, D",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_label_for_specific_node",
        hop_count: 3,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN N, P, R, L",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_annotation_for_specific_node",
        hop_count: 3,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN N, P, R, A",
    },
    QueryDescriptor {
        name: "get_pod_deployment_label_for_specific_node",
        hop_count: 4,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN N, P, R, D, L",
    },
    QueryDescriptor {
        name: "get_pod_deployment_annotation_for_specific_node",
        hop_count: 4,
        anchor: Anchor::Node,
        template: "MATCH (N:K8sNode)\n\
                   WHERE N.id = $node_id\n\
                   MATCH (N)<-[:SCHEDULED_ON]-(P:Pod)\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN N, P, R, D, A",
    },
    QueryDescriptor {
        name: "get_pod_labels_for_specific_pod",
        hop_count: 1,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN P, L",
    },
    QueryDescriptor {
        name: "get_pod_annotations_for_specific_pod",
        hop_count: 1,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN P, A",
    },
    QueryDescriptor {
        name: "get_pod_container_for_specific_pod",
        hop_count: 1,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)\n\
                   RETURN P, Cont",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_for_specific_pod",
        hop_count: 1,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)\n\
                   RETURN P, R",
    },
    QueryDescriptor {
        name: "get_pod_deployment_for_specific_pod",
        hop_count: 2,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)\n\
                   RETURN P, R, D",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_label_for_specific_pod",
        hop_count: 2,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN P, R, L",
    },
    QueryDescriptor {
        name: "get_pod_replicaset_annotation_for_specific_pod",
        hop_count: 2,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN P, R, A",
    },
    QueryDescriptor {
        name: "get_pod_configmap_for_specific_pod",
        hop_count: 2,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:CONFIGMAP_REF]->(Conf:ConfigMap)\n\
                   RETURN P, Cont, Conf",
    },
    QueryDescriptor {
        name: "get_pod_image_for_specific_pod",
        hop_count: 2,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)-[:INSTANTIATES]->(I:Image)\n\
                   RETURN P, Cont, I",
    },
    QueryDescriptor {
        name: "get_pod_deployment_label_for_specific_pod",
        hop_count: 3,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN P, R, D, L",
    },
    QueryDescriptor {
        name: "get_pod_deployment_annotation_for_specific_pod",
        hop_count: 3,
        anchor: Anchor::Pod,
        template: "MATCH (P:Pod)\n\
                   WHERE P.id = $pod_id\n\
                   MATCH (P)-[:MANAGED_BY]->(R:ReplicaSet)-[:MANAGED_BY]->(D:Deployment)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN P, R, D, A",
    },
    QueryDescriptor {
        name: "get_pods_for_replicaset",
        hop_count: 1,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (P:Pod)-[:MANAGED_BY]->(R)\n\
                   RETURN R, P",
    },
    QueryDescriptor {
        name: "get_deployment_for_replicaset",
        hop_count: 1,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (R)-[:MANAGED_BY]->(D:Deployment)\n\
                   RETURN R, D",
    },
    QueryDescriptor {
        name: "get_pod_labels_for_replicaset",
        hop_count: 2,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (P:Pod)-[:MANAGED_BY]->(R)\n\
                   MATCH (P)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN R, P, L",
    },
    QueryDescriptor {
        name: "get_pod_annotations_for_replicaset",
        hop_count: 2,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (P:Pod)-[:MANAGED_BY]->(R)\n\
                   MATCH (P)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN R, P, A",
    },
    QueryDescriptor {
        name: "get_pod_container_for_replicaset",
        hop_count: 2,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (P:Pod)-[:MANAGED_BY]->(R)\n\
                   MATCH (P)-[:RUNS_CONTAINER]->(Cont:Container)\n\
                   RETURN R, P, Cont",
    },
    QueryDescriptor {
        name: "get_deployment_label_for_replicaset",
        hop_count: 3,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (R)-[:MANAGED_BY]->(D:Deployment)\n\
                   MATCH (D)-[:HAS_LABEL]->(L:Label)\n\
                   RETURN R, D, L",
    },
    QueryDescriptor {
        name: "get_deployment_annotation_for_replicaset",
        hop_count: 3,
        anchor: Anchor::ReplicaSet,
        template: "MATCH (R:ReplicaSet)\n\
                   WHERE R.id = $replicaset_id\n\
                   MATCH (R)-[:MANAGED_BY]->(D:Deployment)\n\
                   MATCH (D)-[:HAS_ANNOTATION]->(A:Annotation)\n\
                   RETURN R, D, A",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bindings() -> EntityBindings {
        EntityBindings {
            cluster_id: "cluster-uid".to_string(),
            node_id: "node-uid".to_string(),
            pod_id: "pod-uid".to_string(),
            replicaset_id: "rs-uid".to_string(),
        }
    }

    #[test]
    fn standard_catalog_names_are_unique() {
        let catalog = QueryCatalog::standard();
        let names: HashSet<_> = catalog.iter().map(|q| q.name).collect();

        assert_eq!(catalog.len(), 50);
        assert_eq!(names.len(), catalog.len());
    }

    #[test]
    fn every_template_uses_its_anchor_parameter() {
        for descriptor in QueryCatalog::standard().iter() {
            let param = format!("${}", descriptor.anchor.param_name());
            assert!(
                descriptor.template.contains(&param),
                "{} does not reference {param}",
                descriptor.name
            );
            assert!((1..=5).contains(&descriptor.hop_count));
        }
    }

    #[test]
    fn hop_counts_are_static_properties() {
        let catalog = QueryCatalog::standard();

        assert_eq!(catalog.get("test_get_all_node_images").unwrap().hop_count, 1);
        assert_eq!(catalog.get("test_get_all_nodes_pods").unwrap().hop_count, 2);
        assert_eq!(
            catalog
                .get("test_get_all_pods_deployments_labels")
                .unwrap()
                .hop_count,
            5
        );
        assert_eq!(
            catalog
                .get("get_deployment_annotation_for_replicaset")
                .unwrap()
                .hop_count,
            3
        );
    }

    #[test]
    fn filter_keeps_catalog_order_and_drops_unknown_names() {
        let catalog = QueryCatalog::standard().filter(&[
            "get_pods_for_replicaset".to_string(),
            "test_get_all_nodes".to_string(),
            "not_a_query".to_string(),
        ]);

        let names: Vec<_> = catalog.iter().map(|q| q.name).collect();
        assert_eq!(names, vec!["test_get_all_nodes", "get_pods_for_replicaset"]);
    }

    #[test]
    fn empty_filter_keeps_everything() {
        assert_eq!(QueryCatalog::standard().filter(&[]).len(), 50);
    }

    #[test]
    fn binding_fills_the_anchor_id() {
        let catalog = QueryCatalog::standard().filter(&[
            "test_get_all_nodes".to_string(),
            "get_pod_labels_for_specific_pod".to_string(),
        ]);

        let bound = catalog.bind(&bindings());

        assert_eq!(
            bound[0].query.params,
            vec![("cluster_id".to_string(), "cluster-uid".to_string())]
        );
        assert_eq!(
            bound[1].query.params,
            vec![("pod_id".to_string(), "pod-uid".to_string())]
        );
        assert_eq!(bound[1].query.text, bound[1].template);
    }
}
