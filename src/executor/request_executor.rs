use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::core::{ClientError, ErrorResponse, Result};
use crate::executor::command::{Command, GetStatisticsCommand, GetTopologyCommand};
use crate::executor::node_status::{self, NodeStatus, ProbeOutcome};
use crate::topology::{NodeSelector, ReadBehavior, ServerNode, Topology};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const HEADER_CLIENT_VERSION: &str = "Client-Version";
const HEADER_TOPOLOGY_ETAG: &str = "Topology-Etag";
const HEADER_REFRESH_TOPOLOGY: &str = "Refresh-Topology";
const HEADER_DATABASE_MISSING: &str = "Database-Missing";
const HEADER_API_KEY: &str = "Api-Key";

/// Executes commands against the cluster.
///
/// Owns the node selector, performs initial and periodic topology
/// discovery, retries failed commands across the topology, and arms a
/// health monitor for every node observed down.
pub struct RequestExecutor {
    database: String,
    config: ClientConfig,
    http: reqwest::Client,

    selector: RwLock<Option<Arc<NodeSelector>>>,
    topology_etag: AtomicI64,
    topology_source: Mutex<Option<Arc<ServerNode>>>,
    last_known_urls: Mutex<Vec<String>>,

    request_count: AtomicU64,
    last_response_at: Mutex<Instant>,

    // initialization and topology updates are serialized independently
    // so a slow first discovery cannot block a server-hinted refresh
    init_lock: tokio::sync::Mutex<()>,
    update_lock: tokio::sync::Mutex<()>,

    failed_nodes: Mutex<HashMap<String, Arc<NodeStatus>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    refresh_armed: AtomicBool,

    disable_topology_updates: bool,
    closed: AtomicBool,
}

impl RequestExecutor {
    fn new_inner(
        database: &str,
        config: ClientConfig,
        disable_topology_updates: bool,
    ) -> Result<Self> {
        config.validate().map_err(ClientError::Config)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        Ok(Self {
            database: database.to_string(),
            config,
            http,
            selector: RwLock::new(None),
            topology_etag: AtomicI64::new(0),
            topology_source: Mutex::new(None),
            last_known_urls: Mutex::new(Vec::new()),
            request_count: AtomicU64::new(0),
            last_response_at: Mutex::new(Instant::now()),
            init_lock: tokio::sync::Mutex::new(()),
            update_lock: tokio::sync::Mutex::new(()),
            failed_nodes: Mutex::new(HashMap::new()),
            refresh_task: Mutex::new(None),
            refresh_armed: AtomicBool::new(false),
            disable_topology_updates,
            closed: AtomicBool::new(false),
        })
    }

    /// Create an executor for a database from a list of seed URLs.
    ///
    /// Discovery tries each seed in order and the first success becomes
    /// the baseline topology. When every seed fails the executor is
    /// still returned: it retains the seed list and the next `execute`
    /// retries initialization.
    pub async fn create(
        urls: &[impl AsRef<str>],
        database: &str,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        if urls.is_empty() {
            return Err(ClientError::Config("no seed URLs provided".to_string()));
        }

        let executor = Arc::new(Self::new_inner(database, config, false)?);
        *executor.last_known_urls.lock().unwrap() = urls
            .iter()
            .map(|url| url.as_ref().trim_end_matches('/').to_string())
            .collect();

        if let Err(err) = executor.first_topology_update().await {
            warn!(
                "initial topology discovery for '{}' failed, will retry on first request: {}",
                database, err
            );
        }
        Ok(executor)
    }

    /// Create an executor pinned to exactly one node for its whole
    /// lifetime: no topology updates, no refresh task, no health
    /// monitors.
    pub fn create_for_single_node(
        url: &str,
        database: &str,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        let executor = Self::new_inner(database, config, true)?;

        let node = Arc::new(ServerNode::new(
            url.trim_end_matches('/').to_string(),
            database.to_string(),
        ));
        let topology = Topology::new(-1, vec![node]).with_behaviors(
            executor.config.read_behavior,
            executor.config.write_behavior,
        );
        *executor.selector.write().unwrap() = Some(Arc::new(NodeSelector::new(topology)));
        executor.topology_etag.store(-2, Ordering::SeqCst);

        Ok(Arc::new(executor))
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Last accepted topology etag (-2 in single-node mode).
    pub fn topology_etag(&self) -> i64 {
        self.topology_etag.load(Ordering::SeqCst)
    }

    /// Total requests sent to the cluster, probes included.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Current topology snapshot, if one has been acquired.
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.selector().map(|selector| selector.topology())
    }

    /// Copy of the current topology's node list.
    pub fn topology_nodes(&self) -> Vec<Arc<ServerNode>> {
        self.topology()
            .map(|topology| topology.nodes().to_vec())
            .unwrap_or_default()
    }

    /// Number of nodes currently under health monitoring.
    pub fn failed_node_count(&self) -> usize {
        self.failed_nodes.lock().unwrap().len()
    }

    pub fn preferred_node(&self) -> Result<(usize, Arc<ServerNode>)> {
        self.selector()
            .ok_or_else(|| ClientError::NoTopology("executor is not initialized".to_string()))?
            .preferred_node()
    }

    fn selector(&self) -> Option<Arc<NodeSelector>> {
        self.selector.read().unwrap().clone()
    }

    fn last_response_age(&self) -> Duration {
        self.last_response_at.lock().unwrap().elapsed()
    }

    /// Execute a command against the routed current node, failing over
    /// through the topology on transport and node-level failures.
    pub async fn execute(self: &Arc<Self>, command: &dyn Command) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.ensure_initialized().await?;

        let (index, node) = self.choose_node(command)?;
        self.execute_against(node, Some(index), command, true).await
    }

    /// Pick the starting node for a command according to the configured
    /// routing behaviors. Writes never round-robin.
    fn choose_node(&self, command: &dyn Command) -> Result<(usize, Arc<ServerNode>)> {
        let selector = self
            .selector()
            .ok_or_else(|| ClientError::NoTopology("executor is not initialized".to_string()))?;

        if !command.is_read_request() {
            return selector.preferred_node();
        }

        // the policy in force is the one carried by the current topology
        match selector.topology().read_behavior() {
            ReadBehavior::LeaderOnly | ReadBehavior::LeaderWithFailover => {
                selector.preferred_node()
            }
            ReadBehavior::LeaderWithFailoverWhenRequestTimeSlaThresholdIsReached => {
                selector.preferred_node_within_sla(self.config.sla_threshold)
            }
            ReadBehavior::RoundRobin => {
                selector.node_by_session_id(self.request_count.load(Ordering::SeqCst) as usize)
            }
            ReadBehavior::RoundRobinWhenRequestTimeSlaThresholdIsReached => {
                let preferred = selector.preferred_node()?;
                if preferred.1.is_rate_surpassed(self.config.sla_threshold) {
                    selector.node_by_session_id(self.request_count.load(Ordering::SeqCst) as usize)
                } else {
                    Ok(preferred)
                }
            }
            ReadBehavior::FastestNode => selector.fastest_node(),
        }
    }

    /// One retry loop iteration per topology node at most: each failed
    /// node is recorded on the command, and failover stops as soon as
    /// the selector's choice has already failed this command.
    pub(crate) async fn execute_against(
        self: &Arc<Self>,
        node: Arc<ServerNode>,
        node_index: Option<usize>,
        command: &dyn Command,
        should_retry: bool,
    ) -> Result<()> {
        let mut node = node;
        let mut node_index = node_index;

        loop {
            if self.is_closed() {
                return Err(ClientError::Closed);
            }

            let url = command.url(&node);
            let mut request = self
                .http
                .request(command.method(), &url)
                .header(HEADER_CLIENT_VERSION, CLIENT_VERSION);
            if let Some(credential) = &self.config.credential {
                request = request.header(HEADER_API_KEY, credential.as_str());
            }
            if !self.disable_topology_updates {
                request = request.header(HEADER_TOPOLOGY_ETAG, self.topology_etag());
            }
            if let Some(payload) = command.payload() {
                request = request.json(&payload);
            }

            self.request_count.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!("request to {} failed: {}", url, err);
                    command.state().record_failed_node(node.url(), err.to_string());
                    if !should_retry {
                        return Err(err.into());
                    }
                    match self.handle_server_down(&node, node_index, command) {
                        Some((next_index, next_node)) => {
                            node = next_node;
                            node_index = Some(next_index);
                            continue;
                        }
                        None => return Err(self.all_nodes_down_error(&url, command)),
                    }
                }
            };

            let status = response.status().as_u16();
            match status {
                // a valid result, decoded with no body
                404 => return command.set_response(&[]),

                408 | 502 | 503 | 504 => {
                    let cluster_tag = node.cluster_tag().to_string();
                    let failed_url = node.url().to_string();
                    let body = response.bytes().await.unwrap_or_default();
                    let server_error = ErrorResponse::from_body(&body);
                    command
                        .state()
                        .record_failed_node(node.url(), format!("HTTP {}: {}", status, server_error));

                    let unsuccessful = ClientError::UnsuccessfulRequest {
                        url: failed_url,
                        cluster_tag,
                        status,
                    };
                    if !should_retry {
                        return Err(unsuccessful);
                    }
                    match self.handle_server_down(&node, node_index, command) {
                        Some((next_index, next_node)) => {
                            node = next_node;
                            node_index = Some(next_index);
                            continue;
                        }
                        // more than one node failed means the whole
                        // topology was walked; a lone failed node keeps
                        // its own error
                        None if command.state().failed_count() > 1 => {
                            return Err(self.all_nodes_down_error(&url, command));
                        }
                        None => return Err(unsuccessful),
                    }
                }

                // conflicts are not transient; the caller decides
                409 => {
                    let body = response.bytes().await.unwrap_or_default();
                    return Err(ClientError::Conflict(ErrorResponse::from_body(&body)));
                }

                _ if status >= 400 => {
                    if let Some(missing) = response.headers().get(HEADER_DATABASE_MISSING) {
                        let name = missing
                            .to_str()
                            .unwrap_or(self.database.as_str())
                            .to_string();
                        return Err(ClientError::DatabaseDoesNotExist(name));
                    }
                    let body = response.bytes().await.unwrap_or_default();
                    return Err(ClientError::Server {
                        status,
                        response: ErrorResponse::from_body(&body),
                    });
                }

                _ => {
                    node.record_response_time(started.elapsed());
                    *self.last_response_at.lock().unwrap() = Instant::now();

                    let refresh_requested = response
                        .headers()
                        .get(HEADER_REFRESH_TOPOLOGY)
                        .and_then(|value| value.to_str().ok())
                        .map(|value| value.eq_ignore_ascii_case("true"))
                        .unwrap_or(false);
                    if refresh_requested {
                        self.spawn_topology_refresh(node.clone());
                    }

                    let body = response.bytes().await?;
                    return command.set_response(&body);
                }
            }
        }
    }

    /// Failover bookkeeping after a node-level failure. Returns the next
    /// node to try, or `None` when this command has exhausted the
    /// topology (or there is nothing to fail over to).
    fn handle_server_down(
        self: &Arc<Self>,
        node: &Arc<ServerNode>,
        node_index: Option<usize>,
        command: &dyn Command,
    ) -> Option<(usize, Arc<ServerNode>)> {
        // executed against a node outside the topology: no failover
        let index = node_index?;

        self.spawn_health_check(node.clone(), index);

        let selector = self.selector()?;
        selector.on_failed_request(index);

        let (next_index, next_node) = selector.preferred_node().ok()?;
        if command.state().has_failed_with(next_node.url()) {
            // we tried all the nodes, nothing left to do
            return None;
        }
        Some((next_index, next_node))
    }

    fn all_nodes_down_error(&self, url: &str, command: &dyn Command) -> ClientError {
        let topology = self.topology().map(|topology| (*topology).clone());
        let mut message = format!(
            "Tried to send a request via {} to all configured nodes in the topology, \
             all of them seem to be down or not responding",
            url
        );

        let mut failures = command.state().failed_nodes();
        failures.sort();
        if !failures.is_empty() {
            message.push_str("; failures: ");
            let described: Vec<_> = failures
                .iter()
                .map(|(node_url, error)| format!("{} -> {}", node_url, error))
                .collect();
            message.push_str(&described.join(", "));
        }

        if let Some(topology) = &topology {
            message.push_str("; attempted nodes: ");
            message.push_str(&topology.describe_nodes());
        }
        if let Some(source) = self.topology_source.lock().unwrap().as_ref() {
            message.push_str(&format!(" (topology fetched from {})", source.url()));
        }
        ClientError::AllNodesDown { message, topology }
    }

    /// Run the first topology update when no topology exists yet.
    /// Serialized so concurrent first callers trigger a single scan.
    async fn ensure_initialized(self: &Arc<Self>) -> Result<()> {
        if self.disable_topology_updates || self.selector().is_some() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.selector().is_some() {
            return Ok(());
        }
        self.first_topology_update().await
    }

    /// Try each seed URL in order; the first success becomes the
    /// baseline topology and arms the periodic refresh.
    async fn first_topology_update(self: &Arc<Self>) -> Result<()> {
        let urls = self.last_known_urls.lock().unwrap().clone();
        let mut attempts = Vec::new();

        for url in &urls {
            let node = Arc::new(ServerNode::new(url.clone(), self.database.clone()));
            match self.update_topology(node.clone(), false).await {
                Ok(_) => {
                    info!("topology for '{}' discovered via {}", self.database, url);
                    *self.topology_source.lock().unwrap() = Some(node);
                    self.arm_topology_refresh();
                    return Ok(());
                }
                // missing database fails on every node in the cluster
                Err(err @ ClientError::DatabaseDoesNotExist(_)) => return Err(err),
                Err(err) => attempts.push((url.clone(), err.to_string())),
            }
        }

        Err(ClientError::TopologyUpdate { attempts })
    }

    /// Fetch the topology from one node and hand it to the selector.
    /// Returns whether the new topology was accepted (strictly newer
    /// etag, or first topology, or forced).
    pub async fn update_topology(
        self: &Arc<Self>,
        node: Arc<ServerNode>,
        force_update: bool,
    ) -> Result<bool> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let _guard = self.update_lock.lock().await;

        let command = GetTopologyCommand::new();
        self.execute_against(node, None, &command, false).await?;
        let topology = command
            .take_result()
            .ok_or_else(|| ClientError::Decode("topology response had no body".to_string()))?
            .with_behaviors(self.config.read_behavior, self.config.write_behavior);
        let etag = topology.etag();

        let accepted = {
            let mut selector = self.selector.write().unwrap();
            match selector.as_ref() {
                None => {
                    *selector = Some(Arc::new(NodeSelector::new(topology)));
                    true
                }
                Some(existing) => existing.on_update_topology(topology, force_update),
            }
        };

        if accepted {
            self.topology_etag.store(etag, Ordering::SeqCst);
            // previously failed nodes got a fresh failure slate
            self.dispose_failed_node_statuses();
            debug!("topology for '{}' updated to etag {}", self.database, etag);
        }
        Ok(accepted)
    }

    /// Arm the periodic refresh task. A tick is skipped whenever a real
    /// response has been observed more recently than the interval.
    fn arm_topology_refresh(self: &Arc<Self>) {
        if self.disable_topology_updates {
            return;
        }
        if self.refresh_armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.topology_refresh_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(executor) = weak.upgrade() else {
                    return;
                };
                if executor.is_closed() {
                    return;
                }
                if executor.last_response_age() < interval {
                    continue;
                }
                let Ok((_, node)) = executor.preferred_node() else {
                    continue;
                };
                if let Err(err) = executor.update_topology(node, false).await {
                    warn!("periodic topology refresh failed: {}", err);
                }
            }
        });
        *self.refresh_task.lock().unwrap() = Some(handle);
    }

    /// Refresh triggered by the server's Refresh-Topology hint; runs
    /// asynchronously so the current response returns immediately.
    fn spawn_topology_refresh(self: &Arc<Self>, node: Arc<ServerNode>) {
        if self.disable_topology_updates {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(executor) = weak.upgrade() {
                if let Err(err) = executor.update_topology(node, false).await {
                    warn!("topology refresh after server hint failed: {}", err);
                }
            }
        });
    }

    /// Arm a health monitor for a node observed down, exactly once per
    /// node (checked under the failed-node lock).
    fn spawn_health_check(self: &Arc<Self>, node: Arc<ServerNode>, index: usize) {
        if self.disable_topology_updates {
            // pinned single-node mode never monitors
            return;
        }

        let mut failed = self.failed_nodes.lock().unwrap();
        if failed.contains_key(node.url()) {
            return;
        }

        info!("node {} marked as failed, arming health monitor", node.url());
        let status = Arc::new(NodeStatus::new(index, node.clone()));
        failed.insert(node.url().to_string(), status.clone());
        node_status::spawn_probe_loop(
            Arc::downgrade(self),
            status,
            self.config.health_probe_initial,
            self.config.health_probe_cap,
        );
    }

    /// One probe against a monitored node. Recovery clears it from the
    /// failed set and restores its original selection priority.
    pub(crate) async fn check_node_health(self: &Arc<Self>, status: &NodeStatus) -> ProbeOutcome {
        let Some(selector) = self.selector() else {
            return ProbeOutcome::Obsolete;
        };

        // only probe while the node still sits at its recorded position
        let topology = selector.topology();
        match topology.nodes().get(status.node_index()) {
            Some(current) if current.url() == status.node().url() => {}
            _ => {
                self.remove_failed_node(status.node().url());
                return ProbeOutcome::Obsolete;
            }
        }

        let command = GetStatisticsCommand::with_debug_tag("failure=check");
        match self
            .execute_against(status.node().clone(), Some(status.node_index()), &command, false)
            .await
        {
            Ok(()) => {
                info!("node {} recovered", status.node().url());
                self.remove_failed_node(status.node().url());
                selector.restore_node_index(status.node_index());
                ProbeOutcome::Recovered
            }
            Err(err) => {
                debug!("health probe for {} failed: {}", status.node().url(), err);
                ProbeOutcome::StillDown
            }
        }
    }

    fn remove_failed_node(&self, url: &str) {
        if let Some(status) = self.failed_nodes.lock().unwrap().remove(url) {
            status.stop();
        }
    }

    fn dispose_failed_node_statuses(&self) {
        let mut failed = self.failed_nodes.lock().unwrap();
        for status in failed.values() {
            status.stop();
        }
        failed.clear();
    }

    /// Stop the refresh task and every health monitor. In-flight command
    /// executions are allowed to complete; new ones are rejected.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
        self.dispose_failed_node_statuses();
        debug!("request executor for '{}' closed", self.database);
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.close();
    }
}
