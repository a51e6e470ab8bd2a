// ============================================================================
// ClusterDoc Client Library
// ============================================================================

pub mod config;
pub mod core;
pub mod executor;
pub mod hilo;
pub mod topology;

// Re-export main types for convenience
pub use config::ClientConfig;
pub use core::{ClientError, ErrorResponse, Result};
pub use executor::RequestExecutor;
pub use topology::{ReadBehavior, ServerNode, Topology, WriteBehavior};

// Re-export identifier allocation API
pub use hilo::{HiLoIdGenerator, MultiDatabaseHiLoIdGenerator, MultiTypeHiLoIdGenerator};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// High-level Client API
// ============================================================================

/// Entry point for talking to a document database cluster.
///
/// Holds one request executor per database (created lazily) and the
/// cluster-wide identifier allocator. Cheap to share behind an `Arc`;
/// create one store per cluster and keep it for the process lifetime.
///
/// # Examples
///
/// ```no_run
/// use clusterdoc::{ClientConfig, DocumentStore};
///
/// # #[tokio::main]
/// # async fn main() -> clusterdoc::Result<()> {
/// let store = DocumentStore::new(
///     &["http://node-a:8080", "http://node-b:8080"],
///     "northwind",
///     ClientConfig::new(),
/// );
///
/// let id = store.generate_id("products").await?;
/// println!("allocated {}", id);
///
/// store.close().await;
/// # Ok(())
/// # }
/// ```
pub struct DocumentStore {
    urls: Vec<String>,
    database: String,
    config: ClientConfig,
    executors: RwLock<HashMap<String, Arc<RequestExecutor>>>,
    hilo: MultiDatabaseHiLoIdGenerator,
    closed: std::sync::atomic::AtomicBool,
}

impl DocumentStore {
    /// Create a store for a cluster and its default database.
    ///
    /// No network traffic happens here; discovery runs when the first
    /// executor is requested.
    pub fn new(urls: &[impl AsRef<str>], database: impl Into<String>, config: ClientConfig) -> Self {
        let hilo = MultiDatabaseHiLoIdGenerator::new(config.identity_parts_separator);
        Self {
            urls: urls.iter().map(|url| url.as_ref().to_string()).collect(),
            database: database.into(),
            config,
            executors: RwLock::new(HashMap::new()),
            hilo,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Default database of this store.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Executor for the default database.
    pub async fn request_executor(&self) -> Result<Arc<RequestExecutor>> {
        let database = self.database.clone();
        self.request_executor_for(&database).await
    }

    /// Executor for a specific database, created on first use.
    pub async fn request_executor_for(&self, database: &str) -> Result<Arc<RequestExecutor>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        {
            let executors = self.executors.read().unwrap();
            if let Some(executor) = executors.get(database) {
                return Ok(executor.clone());
            }
        }

        let executor = RequestExecutor::create(&self.urls, database, self.config.clone()).await?;

        let mut executors = self.executors.write().unwrap();
        // a racing creator may have won; keep the first one and let the
        // loser drop out of scope
        Ok(executors
            .entry(database.to_string())
            .or_insert(executor)
            .clone())
    }

    /// Allocate a cluster-wide unique identifier for an entity tag in
    /// the default database, e.g. `products/42-A` for tag `products`.
    pub async fn generate_id(&self, tag: &str) -> Result<String> {
        let database = self.database.clone();
        self.generate_id_for(&database, tag).await
    }

    /// Allocate an identifier for an entity tag in a specific database.
    pub async fn generate_id_for(&self, database: &str, tag: &str) -> Result<String> {
        let executor = self.request_executor_for(database).await?;
        self.hilo.generate_document_id(database, &executor, tag).await
    }

    /// Return unused identifier ranges and shut down every executor.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        self.hilo.return_unused_ranges().await;

        let executors: Vec<_> = {
            let map = self.executors.read().unwrap();
            map.values().cloned().collect()
        };
        for executor in executors {
            executor.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_store_rejects_executor_requests() {
        let store = DocumentStore::new(&["http://localhost:1"], "db", ClientConfig::new());
        store.close().await;
        assert!(store.is_closed());

        let result = store.request_executor().await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = DocumentStore::new(&["http://localhost:1"], "db", ClientConfig::new());
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
    }
}
