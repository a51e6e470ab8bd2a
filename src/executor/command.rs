use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reqwest::Method;

use crate::core::Result;
use crate::hilo::NextHiLoResult;
use crate::topology::{ServerNode, Topology};

/// Failed-node bookkeeping shared by every command.
///
/// The executor records each node a command failed against so the retry
/// loop never revisits a node gratuitously and can detect exhaustion.
#[derive(Debug, Default)]
pub struct CommandState {
    failed_nodes: Mutex<HashMap<String, String>>,
}

impl CommandState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failed_node(&self, url: &str, error: impl Into<String>) {
        let mut failed = self.failed_nodes.lock().unwrap();
        failed.insert(url.to_string(), error.into());
    }

    pub fn has_failed_with(&self, url: &str) -> bool {
        self.failed_nodes.lock().unwrap().contains_key(url)
    }

    pub fn failed_count(&self) -> usize {
        self.failed_nodes.lock().unwrap().len()
    }

    pub fn failed_nodes(&self) -> Vec<(String, String)> {
        let failed = self.failed_nodes.lock().unwrap();
        failed
            .iter()
            .map(|(url, error)| (url.clone(), error.clone()))
            .collect()
    }
}

/// Capability set the executor needs from any request object.
///
/// Implementations describe how to build the request against a node and
/// how to decode the raw response body; the executor drives everything
/// else (routing, retry, failover, headers).
pub trait Command: Send + Sync {
    fn method(&self) -> Method {
        Method::GET
    }

    /// Full request URL against the given node.
    fn url(&self, node: &ServerNode) -> String;

    /// JSON payload, if the command carries a body.
    fn payload(&self) -> Option<serde_json::Value> {
        None
    }

    /// Read requests may be routed by the read behavior; writes always
    /// go through the write behavior.
    fn is_read_request(&self) -> bool {
        true
    }

    fn state(&self) -> &CommandState;

    /// Decode the raw response body. Called with an empty slice for a
    /// valid "not found" (404) result.
    fn set_response(&self, body: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Commands the core issues on its own behalf
// ---------------------------------------------------------------------------

/// Fetches the database topology document from one node.
pub struct GetTopologyCommand {
    state: CommandState,
    result: Mutex<Option<Topology>>,
}

impl GetTopologyCommand {
    pub fn new() -> Self {
        Self {
            state: CommandState::new(),
            result: Mutex::new(None),
        }
    }

    pub fn take_result(&self) -> Option<Topology> {
        self.result.lock().unwrap().take()
    }
}

impl Default for GetTopologyCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for GetTopologyCommand {
    fn url(&self, node: &ServerNode) -> String {
        format!("{}/databases/{}/topology", node.url(), node.database())
    }

    fn state(&self) -> &CommandState {
        &self.state
    }

    fn set_response(&self, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let topology = Topology::from_json(body)?;
        *self.result.lock().unwrap() = Some(topology);
        Ok(())
    }
}

/// Lightweight statistics fetch, also used as the health probe.
pub struct GetStatisticsCommand {
    debug_tag: Option<String>,
    state: CommandState,
    result: Mutex<Option<serde_json::Value>>,
}

impl GetStatisticsCommand {
    pub fn new() -> Self {
        Self {
            debug_tag: None,
            state: CommandState::new(),
            result: Mutex::new(None),
        }
    }

    /// Tag the request so probe traffic is identifiable server-side.
    pub fn with_debug_tag(tag: impl Into<String>) -> Self {
        Self {
            debug_tag: Some(tag.into()),
            ..Self::new()
        }
    }

    pub fn take_result(&self) -> Option<serde_json::Value> {
        self.result.lock().unwrap().take()
    }
}

impl Default for GetStatisticsCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl Command for GetStatisticsCommand {
    fn url(&self, node: &ServerNode) -> String {
        let mut url = format!("{}/databases/{}/stats", node.url(), node.database());
        if let Some(tag) = &self.debug_tag {
            url.push('?');
            url.push_str(tag);
        }
        url
    }

    fn state(&self) -> &CommandState {
        &self.state
    }

    fn set_response(&self, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let stats = serde_json::from_slice(body)?;
        *self.result.lock().unwrap() = Some(stats);
        Ok(())
    }
}

/// Timestamp format the server expects in the `lastRangeAt` parameter.
const HILO_REQUEST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Requests the next Hi-Lo range for a tag. The previous range's size,
/// ceiling, and timestamp let the server size the new range adaptively.
pub struct NextHiLoCommand {
    tag: String,
    last_batch_size: i64,
    last_range_at: DateTime<Utc>,
    identity_parts_separator: char,
    last_range_max: i64,
    state: CommandState,
    result: Mutex<Option<NextHiLoResult>>,
}

impl NextHiLoCommand {
    pub fn new(
        tag: impl Into<String>,
        last_batch_size: i64,
        last_range_at: DateTime<Utc>,
        identity_parts_separator: char,
        last_range_max: i64,
    ) -> Self {
        Self {
            tag: tag.into(),
            last_batch_size,
            last_range_at,
            identity_parts_separator,
            last_range_max,
            state: CommandState::new(),
            result: Mutex::new(None),
        }
    }

    pub fn take_result(&self) -> Option<NextHiLoResult> {
        self.result.lock().unwrap().take()
    }
}

impl Command for NextHiLoCommand {
    fn url(&self, node: &ServerNode) -> String {
        let last_range_at = self
            .last_range_at
            .format(HILO_REQUEST_TIME_FORMAT)
            .to_string();
        format!(
            "{}/databases/{}/hilo/next?tag={}&lastBatchSize={}&lastRangeAt={}&identityPartsSeparator={}&lastMax={}",
            node.url(),
            node.database(),
            self.tag,
            self.last_batch_size,
            urlencode(&last_range_at),
            urlencode(&self.identity_parts_separator.to_string()),
            self.last_range_max,
        )
    }

    fn state(&self) -> &CommandState {
        &self.state
    }

    fn set_response(&self, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let result: NextHiLoResult = serde_json::from_slice(body)?;
        *self.result.lock().unwrap() = Some(result);
        Ok(())
    }
}

/// Hands the unused tail of a range back to the server on shutdown.
pub struct HiLoReturnCommand {
    tag: String,
    last: i64,
    end: i64,
    state: CommandState,
}

impl HiLoReturnCommand {
    pub fn new(tag: impl Into<String>, last: i64, end: i64) -> Self {
        Self {
            tag: tag.into(),
            last,
            end,
            state: CommandState::new(),
        }
    }
}

impl Command for HiLoReturnCommand {
    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, node: &ServerNode) -> String {
        format!(
            "{}/databases/{}/hilo/return?tag={}&end={}&last={}",
            node.url(),
            node.database(),
            self.tag,
            self.end,
            self.last,
        )
    }

    fn is_read_request(&self) -> bool {
        false
    }

    fn state(&self) -> &CommandState {
        &self.state
    }

    fn set_response(&self, _body: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Minimal percent-encoding for query parameter values built by the
/// commands above (spaces, '/', '%', '&', '+').
fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => encoded.push_str("%20"),
            '%' => encoded.push_str("%25"),
            '&' => encoded.push_str("%26"),
            '+' => encoded.push_str("%2B"),
            '/' => encoded.push_str("%2F"),
            _ => encoded.push(ch),
        }
    }
    encoded
}
