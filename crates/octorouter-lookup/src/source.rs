//! Where lookup tables come from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{LookupError, LookupResult};
use crate::table::LookupTable;

/// Name and version of a table a source can provide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableDescriptor {
    pub name: String,
    pub version: u32,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// A provider of versioned lookup tables.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// All tables and versions currently available.
    async fn list(&self) -> LookupResult<Vec<TableDescriptor>>;

    /// Load one table version.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::TableNotFound` if the source does not have it.
    async fn fetch(&self, name: &str, version: u32) -> LookupResult<LookupTable>;
}

/// A directory of `<name>.csv` files, all served as version 1.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl TableSource for DirectorySource {
    async fn list(&self) -> LookupResult<Vec<TableDescriptor>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| LookupError::io(&self.dir, e))?;

        let mut tables = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LookupError::io(&self.dir, e))?
        {
            let path = entry.path();
            let is_csv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if let (true, Some(stem)) = (is_csv, path.file_stem().and_then(|s| s.to_str())) {
                tables.push(TableDescriptor::new(stem, 1));
            }
        }
        tables.sort();
        Ok(tables)
    }

    async fn fetch(&self, name: &str, version: u32) -> LookupResult<LookupTable> {
        if version != 1 {
            return Err(LookupError::table_not_found(name, Some(version)));
        }
        let path = self.dir.join(format!("{name}.csv"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LookupError::table_not_found(name, Some(version)));
            }
            Err(e) => return Err(LookupError::io(path, e)),
        };
        LookupTable::from_csv_reader(name, version, bytes.as_slice())
    }
}

/// Tables held in memory. Useful for bundled tables and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    tables: Vec<LookupTable>,
}

impl StaticSource {
    pub fn new(tables: Vec<LookupTable>) -> Self {
        Self { tables }
    }

    pub fn with_table(mut self, table: LookupTable) -> Self {
        self.tables.push(table);
        self
    }
}

#[async_trait]
impl TableSource for StaticSource {
    async fn list(&self) -> LookupResult<Vec<TableDescriptor>> {
        Ok(self
            .tables
            .iter()
            .map(|t| TableDescriptor::new(t.name(), t.version()))
            .collect())
    }

    async fn fetch(&self, name: &str, version: u32) -> LookupResult<LookupTable> {
        self.tables
            .iter()
            .find(|t| t.name() == name && t.version() == version)
            .cloned()
            .ok_or_else(|| LookupError::table_not_found(name, Some(version)))
    }
}
