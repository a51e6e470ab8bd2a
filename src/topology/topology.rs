use std::sync::Arc;

use serde::Deserialize;

use crate::core::Result;
use crate::topology::ServerNode;

/// How reads are routed across the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBehavior {
    LeaderOnly,
    LeaderWithFailover,
    /// Fail over away from the leader once its response-time EWMA
    /// surpasses the configured SLA.
    LeaderWithFailoverWhenRequestTimeSlaThresholdIsReached,
    RoundRobin,
    RoundRobinWhenRequestTimeSlaThresholdIsReached,
    FastestNode,
}

/// How writes are routed. A strict subset of the read behaviors:
/// writes never round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBehavior {
    LeaderOnly,
    LeaderWithFailover,
}

/// Versioned, ordered list of cluster nodes plus routing policy.
///
/// Replaced wholesale on every accepted topology fetch; the etag only
/// moves forward, stale responses are discarded by the selector.
#[derive(Debug, Clone)]
pub struct Topology {
    etag: i64,
    nodes: Vec<Arc<ServerNode>>,
    read_behavior: ReadBehavior,
    write_behavior: WriteBehavior,
}

#[derive(Deserialize)]
struct TopologyDto {
    #[serde(rename = "Etag")]
    etag: i64,
    #[serde(rename = "Nodes", default)]
    nodes: Vec<ServerNodeDto>,
}

#[derive(Deserialize)]
struct ServerNodeDto {
    #[serde(rename = "Url")]
    url: String,
    #[serde(rename = "Database", default)]
    database: String,
    #[serde(rename = "ClusterTag", default)]
    cluster_tag: String,
}

impl Topology {
    pub fn new(etag: i64, nodes: Vec<Arc<ServerNode>>) -> Self {
        Self {
            etag,
            nodes,
            read_behavior: ReadBehavior::LeaderOnly,
            write_behavior: WriteBehavior::LeaderOnly,
        }
    }

    pub fn with_behaviors(mut self, read: ReadBehavior, write: WriteBehavior) -> Self {
        self.read_behavior = read;
        self.write_behavior = write;
        self
    }

    /// Parse the topology document the server returns:
    /// `{"Etag": n, "Nodes": [{"Url", "Database", "ClusterTag"}]}`.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let dto: TopologyDto = serde_json::from_slice(body)?;
        let nodes = dto
            .nodes
            .into_iter()
            .map(|node| {
                Arc::new(
                    ServerNode::new(node.url, node.database).with_cluster_tag(node.cluster_tag),
                )
            })
            .collect();
        Ok(Self::new(dto.etag, nodes))
    }

    pub fn etag(&self) -> i64 {
        self.etag
    }

    pub fn nodes(&self) -> &[Arc<ServerNode>] {
        &self.nodes
    }

    pub fn read_behavior(&self) -> ReadBehavior {
        self.read_behavior
    }

    pub fn write_behavior(&self) -> WriteBehavior {
        self.write_behavior
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One-line description of the node set, used in terminal errors.
    pub fn describe_nodes(&self) -> String {
        self.nodes
            .iter()
            .map(|node| format!("(url: {}, clusterTag: {})", node.url(), node.cluster_tag()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
