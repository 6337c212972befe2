//! Cluster topology loader and the per-cluster proxy stub pool.
//!
//! The XML parse is a pure, synchronous step producing an immutable
//! [`Topology`]; building the live [`ProxyPool`] from it is a separate
//! async step run once at process start.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::adapters::ProxyHttpClient;
use crate::domain::model::{Cluster, ClusterId, Node, NodeId};
use crate::domain::ports::ProxyClient;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(rename = "clusters")]
struct ClustersXml {
    #[serde(rename = "cluster", default)]
    cluster: Vec<ClusterXml>,
}

#[derive(Debug, Deserialize)]
struct ClusterXml {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@proxy")]
    proxy: String,
    nodes: NodesXml,
}

#[derive(Debug, Deserialize)]
struct NodesXml {
    #[serde(rename = "node", default)]
    node: Vec<NodeXml>,
}

#[derive(Debug, Deserialize)]
struct NodeXml {
    #[serde(rename = "@uri")]
    uri: String,
}

/// One cluster as read from the topology file, before node ids are
/// assigned.
#[derive(Debug, Clone)]
pub struct TopologyCluster {
    pub cluster_id: ClusterId,
    pub proxy_endpoint: String,
    pub node_endpoints: Vec<String>,
}

/// The static topology: clusters in file order, each with its member node
/// endpoints in file order.
#[derive(Debug, Clone)]
pub struct Topology {
    pub clusters: Vec<TopologyCluster>,
}

impl Topology {
    /// Parse a topology XML file.
    #[instrument]
    pub fn load(path: &str) -> Result<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let parsed: ClustersXml = quick_xml::de::from_str(xml)?;
        let mut seen = std::collections::HashSet::new();
        let mut clusters = Vec::with_capacity(parsed.cluster.len());
        for c in parsed.cluster {
            if !seen.insert(c.id) {
                return Err(Error::DuplicateTopologyId {
                    kind: "cluster",
                    id: c.id.to_string(),
                });
            }
            clusters.push(TopologyCluster {
                cluster_id: c.id,
                proxy_endpoint: c.proxy,
                node_endpoints: c.nodes.node.into_iter().map(|n| n.uri).collect(),
            });
        }
        Ok(Topology { clusters })
    }

    /// Build the empty cluster/node metadata tables implied by this
    /// topology: dense global node ids assigned in encounter order.
    pub fn into_tables(&self) -> (HashMap<ClusterId, Cluster>, HashMap<NodeId, Node>) {
        let mut clusters = HashMap::with_capacity(self.clusters.len());
        let mut nodes = HashMap::new();
        let mut next_node_id: NodeId = 0;

        for c in &self.clusters {
            let mut node_ids = Vec::with_capacity(c.node_endpoints.len());
            for endpoint in &c.node_endpoints {
                let node_id = next_node_id;
                next_node_id += 1;
                nodes.insert(
                    node_id,
                    Node {
                        node_id,
                        endpoint: endpoint.clone(),
                        cluster_id: c.cluster_id,
                        stripe_block_counts: HashMap::new(),
                    },
                );
                node_ids.push(node_id);
            }
            clusters.insert(
                c.cluster_id,
                Cluster {
                    cluster_id: c.cluster_id,
                    proxy_endpoint: c.proxy_endpoint.clone(),
                    node_ids,
                    blocks: Vec::new(),
                    stripes: Default::default(),
                },
            );
        }

        (clusters, nodes)
    }
}

/// One durable proxy stub per cluster.
pub struct ProxyPool {
    stubs: DashMap<ClusterId, Arc<dyn ProxyClient>>,
}

impl ProxyPool {
    /// Build the pool directly from already-constructed stubs (tests and
    /// any caller that wants a non-HTTP transport).
    pub fn from_stubs(stubs: HashMap<ClusterId, Arc<dyn ProxyClient>>) -> Self {
        let map = DashMap::new();
        for (id, stub) in stubs {
            map.insert(id, stub);
        }
        Self { stubs: map }
    }

    /// Open one `reqwest`-backed stub per cluster and probe it with
    /// `checkalive`. A failing probe is logged but does not abort
    /// startup: the cluster stays registered and later RPCs against it
    /// will simply fail.
    pub async fn connect_http(topology: &Topology) -> Self {
        let stubs = DashMap::new();
        for c in &topology.clusters {
            let stub: Arc<dyn ProxyClient> = Arc::new(ProxyHttpClient::new(&c.proxy_endpoint));
            stubs.insert(c.cluster_id, stub);
        }
        let pool = Self { stubs };
        pool.probe_all().await;
        pool
    }

    async fn probe_all(&self) {
        for entry in self.stubs.iter() {
            let cluster_id = *entry.key();
            match entry.value().checkalive("topology-probe").await {
                Ok(_) => info!(cluster_id, "proxy checkalive succeeded"),
                Err(e) => warn!(cluster_id, error = %e, "proxy checkalive failed at startup"),
            }
        }
    }

    pub fn get(&self, cluster_id: ClusterId) -> Result<Arc<dyn ProxyClient>> {
        self.stubs
            .get(&cluster_id)
            .map(|e| e.value().clone())
            .ok_or(Error::UnknownCluster(cluster_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <clusters>
            <cluster id="0" proxy="10.0.0.1:9000">
                <nodes>
                    <node uri="10.0.0.1:9100"/>
                    <node uri="10.0.0.1:9101"/>
                </nodes>
            </cluster>
            <cluster id="1" proxy="10.0.0.2:9000">
                <nodes>
                    <node uri="10.0.0.2:9100"/>
                </nodes>
            </cluster>
        </clusters>
    "#;

    #[test]
    fn parses_clusters_and_nodes() {
        let topo = Topology::parse(SAMPLE).unwrap();
        assert_eq!(topo.clusters.len(), 2);
        assert_eq!(topo.clusters[0].cluster_id, 0);
        assert_eq!(topo.clusters[0].node_endpoints.len(), 2);
        assert_eq!(topo.clusters[1].node_endpoints.len(), 1);
    }

    #[test]
    fn assigns_dense_global_node_ids_in_encounter_order() {
        let topo = Topology::parse(SAMPLE).unwrap();
        let (clusters, nodes) = topo.into_tables();
        assert_eq!(clusters.len(), 2);
        assert_eq!(nodes.len(), 3);
        let cluster0 = &clusters[&0];
        assert_eq!(cluster0.node_ids, vec![0, 1]);
        let cluster1 = &clusters[&1];
        assert_eq!(cluster1.node_ids, vec![2]);
    }

    #[test]
    fn rejects_duplicate_cluster_ids() {
        let xml = r#"
            <clusters>
                <cluster id="0" proxy="a"><nodes><node uri="a1"/></nodes></cluster>
                <cluster id="0" proxy="b"><nodes><node uri="b1"/></nodes></cluster>
            </clusters>
        "#;
        assert!(Topology::parse(xml).is_err());
    }
}
