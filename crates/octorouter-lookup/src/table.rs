//! Immutable, column-oriented reference tables.
//!
//! A [`LookupTable`] is loaded once per `(name, version)` and never changes.
//! Column names are matched case-sensitively; value predicates live in
//! [`crate::filter`] and compare case-insensitively.

use std::io::Read;
use std::path::Path;

use indexmap::IndexMap;

use crate::error::{LookupError, LookupResult};
use crate::filter::FilterBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTable {
    name: String,
    version: u32,
    columns: IndexMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl LookupTable {
    /// Build a table from a header and data rows.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::EmptyTable` when `columns` is empty,
    /// `LookupError::DuplicateColumn` when a name repeats, and
    /// `LookupError::RowWidth` when a row does not match the header width.
    pub fn new(
        name: impl Into<String>,
        version: u32,
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> LookupResult<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(LookupError::EmptyTable { table: name });
        }

        let mut index = IndexMap::with_capacity(columns.len());
        for (position, column) in columns.into_iter().enumerate() {
            if index.contains_key(&column) {
                return Err(LookupError::DuplicateColumn {
                    table: name,
                    column,
                });
            }
            index.insert(column, position);
        }

        if let Some((row, values)) = rows
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != index.len())
        {
            return Err(LookupError::RowWidth {
                table: name,
                row: row + 1,
                expected: index.len(),
                actual: values.len(),
            });
        }

        Ok(Self {
            name,
            version,
            columns: index,
            rows,
        })
    }

    /// Read a table from CSV with a header row.
    pub fn from_csv_reader<R: Read>(
        name: impl Into<String>,
        version: u32,
        reader: R,
    ) -> LookupResult<Self> {
        let name = name.into();
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let columns: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        if columns.iter().all(String::is_empty) {
            return Err(LookupError::EmptyTable { table: name });
        }

        let rows = csv_reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<Result<Vec<Vec<String>>, _>>()?;

        Self::new(name, version, columns, rows)
    }

    /// Read a table from a CSV file.
    pub fn from_csv_path(
        name: impl Into<String>,
        version: u32,
        path: impl AsRef<Path>,
    ) -> LookupResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| LookupError::io(path, e))?;
        Self::from_csv_reader(name, version, file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Position of `column` in every row.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::UnknownColumn` if the table has no such column.
    pub fn column_index(&self, column: &str) -> LookupResult<usize> {
        self.columns
            .get(column)
            .copied()
            .ok_or_else(|| LookupError::unknown_column(&self.name, column))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Distinct values of `column` in first-seen order.
    pub fn distinct_values(&self, column: &str) -> LookupResult<Vec<String>> {
        let index = self.column_index(column)?;
        Ok(distinct(self.rows.iter().map(|row| row[index].as_str())))
    }

    /// Start a conjunctive filter over this table.
    pub fn filter_builder(&self) -> FilterBuilder<'_> {
        FilterBuilder::new(self)
    }

    /// A table with the same header and only the given rows.
    pub(crate) fn with_rows(&self, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version,
            columns: self.columns.clone(),
            rows,
        }
    }
}

pub(crate) fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = indexmap::IndexSet::new();
    for value in values {
        seen.insert(value);
    }
    seen.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv() -> &'static str {
        "Code,Condition Code,Condition Name\n\
         94558-4,840539006,COVID-19\n\
         94500-6,840539006,COVID-19\n\
         80382-5,6142004,Influenza\n"
    }

    #[test]
    fn test_from_csv_reader() {
        let table = LookupTable::from_csv_reader("observation-mapping", 1, sample_csv().as_bytes())
            .unwrap();
        assert_eq!(table.name(), "observation-mapping");
        assert_eq!(table.version(), 1);
        assert_eq!(table.row_count(), 3);
        assert_eq!(
            table.columns().collect::<Vec<_>>(),
            vec!["Code", "Condition Code", "Condition Name"]
        );
    }

    #[test]
    fn test_column_names_are_case_sensitive() {
        let table = LookupTable::from_csv_reader("t", 1, sample_csv().as_bytes()).unwrap();
        assert!(table.has_column("Code"));
        assert!(!table.has_column("code"));
        assert!(matches!(
            table.column_index("code"),
            Err(LookupError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_distinct_values_keep_first_seen_order() {
        let table = LookupTable::from_csv_reader("t", 1, sample_csv().as_bytes()).unwrap();
        assert_eq!(
            table.distinct_values("Condition Name").unwrap(),
            vec!["COVID-19", "Influenza"]
        );
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = LookupTable::from_csv_reader("t", 1, "a,a\n1,2\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LookupError::DuplicateColumn { column, .. } if column == "a"));
    }

    #[test]
    fn test_ragged_csv_rejected() {
        let err = LookupTable::from_csv_reader("t", 1, "a,b\n1,2\n3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LookupError::Csv(_)));
    }

    #[test]
    fn test_new_validates_row_width() {
        let err = LookupTable::new(
            "t",
            1,
            vec!["a".into(), "b".into()],
            vec![vec!["1".into(), "2".into()], vec!["3".into()]],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LookupError::RowWidth {
                row: 2,
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_header_rejected() {
        assert!(matches!(
            LookupTable::new("t", 1, vec![], vec![]),
            Err(LookupError::EmptyTable { .. })
        ));
    }

    #[test]
    fn test_from_csv_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observation-mapping.csv");
        std::fs::write(&path, sample_csv()).unwrap();

        let table = LookupTable::from_csv_path("observation-mapping", 1, &path).unwrap();
        assert_eq!(table.row_count(), 3);

        let missing = LookupTable::from_csv_path("x", 1, dir.path().join("missing.csv"));
        assert!(matches!(missing, Err(LookupError::Io { .. })));
    }
}
