//! Process-wide table registry keyed by `(name, version)`.
//!
//! The registry is built once at startup and handed to the components that need
//! tables. Loaded tables are immutable and shared through `Arc`; a reload adds new
//! versions and atomically switches the active version map, so readers never
//! take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{LookupError, LookupResult};
use crate::source::TableSource;
use crate::table::LookupTable;

type TableKey = (String, u32);

pub struct TableRegistry {
    tables: DashMap<TableKey, Arc<LookupTable>>,
    active: ArcSwap<HashMap<String, u32>>,
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry")
            .field("active", &**self.active.load())
            .finish_non_exhaustive()
    }
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            active: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Create a new registry wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a table. An existing `(name, version)` is kept as is.
    ///
    /// The first version registered under a name becomes active.
    pub fn insert(&self, table: LookupTable) -> Arc<LookupTable> {
        let key = (table.name().to_string(), table.version());
        let name = key.0.clone();
        let version = key.1;
        let stored = self
            .tables
            .entry(key)
            .or_insert_with(|| Arc::new(table))
            .clone();

        if !self.active.load().contains_key(&name) {
            self.set_active(&name, version);
        }
        stored
    }

    fn set_active(&self, name: &str, version: u32) {
        self.active.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.to_string(), version);
            next
        });
    }

    /// Make `version` the one returned by [`TableRegistry::get`].
    ///
    /// # Errors
    ///
    /// Returns `LookupError::TableNotFound` if that version was never registered.
    pub fn activate(&self, name: &str, version: u32) -> LookupResult<()> {
        if !self.tables.contains_key(&(name.to_string(), version)) {
            return Err(LookupError::table_not_found(name, Some(version)));
        }
        self.set_active(name, version);
        info!(table = name, version, "Activated lookup table version");
        Ok(())
    }

    /// The active version of `name`.
    pub fn get(&self, name: &str) -> Option<Arc<LookupTable>> {
        let version = *self.active.load().get(name)?;
        self.get_version(name, version)
    }

    /// The active version of `name`, or a configuration error.
    pub fn require(&self, name: &str) -> LookupResult<Arc<LookupTable>> {
        self.get(name)
            .ok_or_else(|| LookupError::table_not_found(name, None))
    }

    pub fn get_version(&self, name: &str, version: u32) -> Option<Arc<LookupTable>> {
        self.tables
            .get(&(name.to_string(), version))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn active_version(&self, name: &str) -> Option<u32> {
        self.active.load().get(name).copied()
    }

    /// Names of all tables with an active version, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Pull every version `source` lists that is not registered yet, then
    /// activate the highest version of each table. Returns the number loaded.
    pub async fn reload(&self, source: &dyn TableSource) -> LookupResult<usize> {
        let listed = source.list().await?;
        let mut loaded = 0;
        let mut latest: HashMap<String, u32> = HashMap::new();

        for descriptor in listed {
            let key = (descriptor.name.clone(), descriptor.version);
            if !self.tables.contains_key(&key) {
                let table = source.fetch(&descriptor.name, descriptor.version).await?;
                debug!(
                    table = %descriptor.name,
                    version = descriptor.version,
                    rows = table.row_count(),
                    "Loaded lookup table"
                );
                self.tables.insert(key, Arc::new(table));
                loaded += 1;
            }
            let top = latest.entry(descriptor.name).or_insert(descriptor.version);
            *top = (*top).max(descriptor.version);
        }

        self.active.rcu(|current| {
            let mut next = HashMap::clone(current);
            for (name, version) in &latest {
                next.insert(name.clone(), *version);
            }
            next
        });

        info!(loaded, tables = latest.len(), "Lookup tables reloaded");
        Ok(loaded)
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}
