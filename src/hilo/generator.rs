use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::core::{ClientError, Result};
use crate::executor::{HiLoReturnCommand, NextHiLoCommand, RequestExecutor};
use crate::hilo::IdRange;

/// Timestamp format the server uses in `LastRangeAt`,
/// e.g. `2018-05-08T05:20:31.5233900Z`.
const HILO_RESPONSE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Server response to a "next range" request.
#[derive(Debug, Clone, Deserialize)]
pub struct NextHiLoResult {
    #[serde(rename = "Prefix")]
    pub prefix: String,

    #[serde(rename = "ServerTag", default)]
    pub server_tag: String,

    #[serde(rename = "Low")]
    pub low: i64,

    #[serde(rename = "High")]
    pub high: i64,

    #[serde(rename = "LastSize", default)]
    pub last_size: i64,

    #[serde(rename = "LastRangeAt", default)]
    pub last_range_at: String,
}

impl NextHiLoResult {
    /// Parse the server timestamp; malformed values fall back to the
    /// epoch placeholder so the next request simply carries no history.
    pub fn last_range_at_parsed(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&self.last_range_at, HILO_RESPONSE_TIME_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or_else(|_| beginning_of_time())
    }
}

/// Placeholder timestamp meaning "no previous range".
fn beginning_of_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
}

/// Conflicting refills are retried under the lock; a server that keeps
/// answering 409 past this cap gets its conflict surfaced.
const MAX_RANGE_CONFLICT_RETRIES: usize = 8;

/// Hi-Lo identifier allocator for one (database, tag) pair.
///
/// Allocates locally from the current range and refills through the
/// request executor when exhausted; the previous batch size and range
/// timestamp let the server size new ranges adaptively.
pub struct HiLoIdGenerator {
    tag: String,
    database: String,
    executor: Arc<RequestExecutor>,
    identity_parts_separator: char,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    prefix: String,
    server_tag: String,
    last_batch_size: i64,
    last_range_at: DateTime<Utc>,
    range: IdRange,
}

impl HiLoIdGenerator {
    pub fn new(
        tag: impl Into<String>,
        database: impl Into<String>,
        executor: Arc<RequestExecutor>,
        identity_parts_separator: char,
    ) -> Self {
        Self {
            tag: tag.into(),
            database: database.into(),
            executor,
            identity_parts_separator,
            state: Mutex::new(GeneratorState {
                prefix: String::new(),
                server_tag: String::new(),
                last_batch_size: 0,
                last_range_at: beginning_of_time(),
                range: IdRange::empty(),
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Allocate the next identifier, formatted
    /// `prefix + id + "-" + serverTag`.
    pub async fn generate_document_id(&self) -> Result<String> {
        let mut conflicts = 0;

        loop {
            let mut state = self.state.lock().await;

            // fast path: the current range still has values
            if let Some(id) = state.range.try_next() {
                return Ok(format_id(&state.prefix, id, &state.server_tag));
            }

            match self.fetch_next_range(&mut state).await {
                Ok(()) => continue,
                Err(ClientError::Conflict(response)) => {
                    // another client raced our range request; drop the
                    // lock, re-read the (possibly replaced) range, retry
                    conflicts += 1;
                    if conflicts >= MAX_RANGE_CONFLICT_RETRIES {
                        return Err(ClientError::Conflict(response));
                    }
                    debug!(
                        "hilo range request for tag '{}' conflicted, retrying ({}/{})",
                        self.tag, conflicts, MAX_RANGE_CONFLICT_RETRIES
                    );
                    drop(state);
                    continue;
                }
                Err(ClientError::Server { status: 500, .. }) => {
                    return Err(ClientError::DatabaseDoesNotExist(self.database.clone()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_next_range(&self, state: &mut GeneratorState) -> Result<()> {
        let command = NextHiLoCommand::new(
            &self.tag,
            state.last_batch_size,
            state.last_range_at,
            self.identity_parts_separator,
            state.range.max(),
        );
        self.executor.execute(&command).await?;

        let result = command.take_result().ok_or_else(|| {
            ClientError::Decode("hilo next-range response had no body".to_string())
        })?;

        debug!(
            "hilo tag '{}' received range [{}, {}]",
            self.tag, result.low, result.high
        );

        state.last_range_at = result.last_range_at_parsed();
        state.last_batch_size = result.last_size;
        state.server_tag = result.server_tag;
        state.prefix = result.prefix;
        state.range = IdRange::new(result.low, result.high);
        Ok(())
    }

    /// Hand the unused tail of the current range back to the server so
    /// other clients can reuse it. Best effort: failures are logged and
    /// never fail the shutdown path.
    pub async fn return_unused_range(&self) {
        let state = self.state.lock().await;
        // nothing was ever allocated from this range
        if state.range.current() < state.range.min() {
            return;
        }
        let command = HiLoReturnCommand::new(&self.tag, state.range.current(), state.range.max());
        if let Err(err) = self.executor.execute(&command).await {
            warn!(
                "failed to return unused hilo range for tag '{}': {}",
                self.tag, err
            );
        }
    }
}

fn format_id(prefix: &str, id: i64, server_tag: &str) -> String {
    format!("{}{}-{}", prefix, id, server_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_id() {
        assert_eq!(format_id("products/", 42, "A"), "products/42-A");
        assert_eq!(format_id("users|", 7, "B"), "users|7-B");
    }

    #[test]
    fn test_last_range_at_parses_server_format() {
        let result = NextHiLoResult {
            prefix: "products/".to_string(),
            server_tag: "A".to_string(),
            low: 1,
            high: 32,
            last_size: 32,
            last_range_at: "2024-05-08T05:20:31.5233900Z".to_string(),
        };
        let parsed = result.last_range_at_parsed();
        assert_eq!(parsed.timestamp(), 1715145631);
    }

    #[test]
    fn test_malformed_last_range_at_falls_back() {
        let result = NextHiLoResult {
            prefix: String::new(),
            server_tag: String::new(),
            low: 1,
            high: 32,
            last_size: 0,
            last_range_at: "garbage".to_string(),
        };
        assert_eq!(result.last_range_at_parsed(), beginning_of_time());
    }
}
