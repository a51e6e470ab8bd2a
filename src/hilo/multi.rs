use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::Result;
use crate::executor::RequestExecutor;
use crate::hilo::HiLoIdGenerator;

/// Routes allocation requests to the per-tag generator of one database.
///
/// Readers take no lock beyond a short read guard on the common case of
/// an existing generator; only first creation for a tag takes the write
/// lock, double-checked against a racing creator.
pub struct MultiTypeHiLoIdGenerator {
    database: String,
    executor: Arc<RequestExecutor>,
    identity_parts_separator: char,
    generators: RwLock<HashMap<String, Arc<HiLoIdGenerator>>>,
}

impl MultiTypeHiLoIdGenerator {
    pub fn new(
        database: impl Into<String>,
        executor: Arc<RequestExecutor>,
        identity_parts_separator: char,
    ) -> Self {
        Self {
            database: database.into(),
            executor,
            identity_parts_separator,
            generators: RwLock::new(HashMap::new()),
        }
    }

    /// Get or lazily create the generator for a tag.
    pub fn generator_for(&self, tag: &str) -> Arc<HiLoIdGenerator> {
        {
            let generators = self.generators.read().unwrap();
            if let Some(generator) = generators.get(tag) {
                return generator.clone();
            }
        }

        let mut generators = self.generators.write().unwrap();
        generators
            .entry(tag.to_string())
            .or_insert_with(|| {
                Arc::new(HiLoIdGenerator::new(
                    tag,
                    self.database.clone(),
                    self.executor.clone(),
                    self.identity_parts_separator,
                ))
            })
            .clone()
    }

    /// Allocate an identifier for the given entity tag.
    pub async fn generate_document_id(&self, tag: &str) -> Result<String> {
        self.generator_for(tag).generate_document_id().await
    }

    /// Return every generator's unused range to the server. Best effort.
    pub async fn return_unused_ranges(&self) {
        let generators: Vec<_> = {
            let map = self.generators.read().unwrap();
            map.values().cloned().collect()
        };
        for generator in generators {
            generator.return_unused_range().await;
        }
    }
}

/// Top-level registry routing allocation requests to the correct
/// per-database `MultiTypeHiLoIdGenerator`.
pub struct MultiDatabaseHiLoIdGenerator {
    identity_parts_separator: char,
    generators: RwLock<HashMap<String, Arc<MultiTypeHiLoIdGenerator>>>,
}

impl MultiDatabaseHiLoIdGenerator {
    pub fn new(identity_parts_separator: char) -> Self {
        Self {
            identity_parts_separator,
            generators: RwLock::new(HashMap::new()),
        }
    }

    /// Get or lazily create the per-database registry. The executor is
    /// only used when this call creates the registry.
    pub fn for_database(
        &self,
        database: &str,
        executor: &Arc<RequestExecutor>,
    ) -> Arc<MultiTypeHiLoIdGenerator> {
        {
            let generators = self.generators.read().unwrap();
            if let Some(generator) = generators.get(database) {
                return generator.clone();
            }
        }

        let mut generators = self.generators.write().unwrap();
        generators
            .entry(database.to_string())
            .or_insert_with(|| {
                Arc::new(MultiTypeHiLoIdGenerator::new(
                    database,
                    executor.clone(),
                    self.identity_parts_separator,
                ))
            })
            .clone()
    }

    pub async fn generate_document_id(
        &self,
        database: &str,
        executor: &Arc<RequestExecutor>,
        tag: &str,
    ) -> Result<String> {
        self.for_database(database, executor)
            .generate_document_id(tag)
            .await
    }

    /// Return unused ranges across every database. Best effort.
    pub async fn return_unused_ranges(&self) {
        let registries: Vec<_> = {
            let map = self.generators.read().unwrap();
            map.values().cloned().collect()
        };
        for registry in registries {
            registry.return_unused_ranges().await;
        }
    }
}
