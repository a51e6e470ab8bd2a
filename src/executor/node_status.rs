use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

use crate::executor::RequestExecutor;
use crate::topology::ServerNode;

/// Health monitor for one failed node.
///
/// Armed when the node first fails; its probe task re-checks the node on
/// a growing interval until the node answers a probe, the topology moves
/// on, or the executor closes.
pub(crate) struct NodeStatus {
    node: Arc<ServerNode>,
    node_index: usize,
    stopped: AtomicBool,
}

/// Result of a single health probe.
pub(crate) enum ProbeOutcome {
    /// Node answered; it is back in rotation at its original position.
    Recovered,
    /// Node is still down; the probe loop re-arms with a longer delay.
    StillDown,
    /// Topology changed underneath the monitor; nothing left to check.
    Obsolete,
}

impl NodeStatus {
    pub(crate) fn new(node_index: usize, node: Arc<ServerNode>) -> Self {
        Self {
            node,
            node_index,
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn node(&self) -> &Arc<ServerNode> {
        &self.node
    }

    pub(crate) fn node_index(&self) -> usize {
        self.node_index
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Next re-check delay: doubles, saturating at the cap.
pub(crate) fn next_probe_delay(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

/// Drive the probe loop for one failed node until it recovers, becomes
/// irrelevant, or the executor goes away. Probe failures only grow the
/// delay; they are never surfaced to callers.
pub(crate) fn spawn_probe_loop(
    executor: Weak<RequestExecutor>,
    status: Arc<NodeStatus>,
    initial_delay: Duration,
    delay_cap: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = initial_delay;
        loop {
            tokio::time::sleep(delay).await;

            if status.is_stopped() {
                return;
            }
            let Some(executor) = executor.upgrade() else {
                return;
            };
            if executor.is_closed() {
                return;
            }

            match executor.check_node_health(&status).await {
                ProbeOutcome::Recovered | ProbeOutcome::Obsolete => return,
                ProbeOutcome::StillDown => {
                    delay = next_probe_delay(delay, delay_cap);
                    debug!(
                        "node {} still down, next probe in {:?}",
                        status.node().url(),
                        delay
                    );
                }
            }
        }
    })
}
