use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::{ClientError, Result};
use crate::topology::{ServerNode, Topology};

/// Chooses the current node from a topology snapshot.
///
/// The whole state (topology + per-node failure counters) is replaced
/// atomically whenever a newer topology is accepted, so readers always
/// observe a consistent snapshot.
pub struct NodeSelector {
    state: RwLock<Arc<SelectorState>>,
}

struct SelectorState {
    topology: Arc<Topology>,
    failures: Vec<AtomicU32>,
}

impl SelectorState {
    fn new(topology: Topology) -> Arc<Self> {
        let failures = (0..topology.nodes().len())
            .map(|_| AtomicU32::new(0))
            .collect();
        Arc::new(Self {
            topology: Arc::new(topology),
            failures,
        })
    }
}

impl NodeSelector {
    pub fn new(topology: Topology) -> Self {
        Self {
            state: RwLock::new(SelectorState::new(topology)),
        }
    }

    fn snapshot(&self) -> Arc<SelectorState> {
        self.state.read().unwrap().clone()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.snapshot().topology.clone()
    }

    /// Accept a newer topology. Returns false (and changes nothing) when
    /// the incoming etag is not strictly newer than the current one,
    /// unless `force_update` is set.
    pub fn on_update_topology(&self, topology: Topology, force_update: bool) -> bool {
        let mut state = self.state.write().unwrap();
        if topology.etag() <= state.topology.etag() && !force_update {
            return false;
        }
        *state = SelectorState::new(topology);
        true
    }

    /// Bump the failure counter of the node at `index`. Out-of-range
    /// indexes are ignored: the topology probably changed underneath.
    pub fn on_failed_request(&self, index: usize) {
        let state = self.snapshot();
        if let Some(counter) = state.failures.get(index) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Clear the failure counter so a recovered node regains its
    /// original priority in the preference order.
    pub fn restore_node_index(&self, index: usize) {
        let state = self.snapshot();
        if let Some(counter) = state.failures.get(index) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// First node in topology order without recorded failures.
    ///
    /// When every node has failed, falls back to the first node so the
    /// caller surfaces an error (or the node recovered in the meantime).
    pub fn preferred_node(&self) -> Result<(usize, Arc<ServerNode>)> {
        let state = self.snapshot();
        Self::preferred_in(&state, |_| true)
    }

    /// Like `preferred_node`, additionally skipping nodes whose recent
    /// response times surpass the SLA threshold.
    pub fn preferred_node_within_sla(
        &self,
        sla_threshold: Duration,
    ) -> Result<(usize, Arc<ServerNode>)> {
        let state = self.snapshot();
        Self::preferred_in(&state, |node| !node.is_rate_surpassed(sla_threshold))
    }

    fn preferred_in(
        state: &SelectorState,
        acceptable: impl Fn(&ServerNode) -> bool,
    ) -> Result<(usize, Arc<ServerNode>)> {
        let nodes = state.topology.nodes();
        if nodes.is_empty() {
            return Err(ClientError::NoTopology(
                "there are no nodes in the topology".to_string(),
            ));
        }

        for (index, node) in nodes.iter().enumerate() {
            if state.failures[index].load(Ordering::SeqCst) == 0
                && !node.url().is_empty()
                && acceptable(node)
            {
                return Ok((index, node.clone()));
            }
        }

        Ok((0, nodes[0].clone()))
    }

    /// Round-robin selection keyed by a caller-supplied session id,
    /// skipping failed nodes.
    pub fn node_by_session_id(&self, session_id: usize) -> Result<(usize, Arc<ServerNode>)> {
        let state = self.snapshot();
        let nodes = state.topology.nodes();
        if nodes.is_empty() {
            return Err(ClientError::NoTopology(
                "there are no nodes in the topology".to_string(),
            ));
        }

        let start = session_id % nodes.len();
        for offset in 0..nodes.len() {
            let index = (start + offset) % nodes.len();
            if state.failures[index].load(Ordering::SeqCst) == 0 {
                return Ok((index, nodes[index].clone()));
            }
        }

        Self::preferred_in(&state, |_| true)
    }

    /// Node with the lowest response-time EWMA among non-failed nodes.
    /// Nodes without samples yet, and a fully failed topology, fall back
    /// to the preference order.
    pub fn fastest_node(&self) -> Result<(usize, Arc<ServerNode>)> {
        let state = self.snapshot();
        let nodes = state.topology.nodes();

        let fastest = nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| state.failures[*index].load(Ordering::SeqCst) == 0)
            .filter_map(|(index, node)| {
                node.average_response_time()
                    .map(|average| (index, node, average))
            })
            .min_by_key(|(_, _, average)| *average);

        match fastest {
            Some((index, node, _)) => Ok((index, node.clone())),
            None => Self::preferred_in(&state, |_| true),
        }
    }
}
