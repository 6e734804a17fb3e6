//! Conjunctive row predicates over a [`LookupTable`].
//!
//! A [`FilterBuilder`] is a value: each predicate method consumes the builder and
//! returns an extended one, so a shared base filter is reused by cloning it.
//!
//! ```
//! use octorouter_lookup::LookupTable;
//!
//! let table = LookupTable::new(
//!     "livd",
//!     1,
//!     vec!["Model".into(), "Manufacturer".into()],
//!     vec![vec!["BinaxNOW".into(), "Abbott".into()]],
//! )
//! .unwrap();
//!
//! let base = table.filter_builder().equals_ignore_case("Manufacturer", "abbott");
//! let model = base.clone().find_single_result("Model").unwrap();
//! assert_eq!(model.as_deref(), Some("BinaxNOW"));
//! ```

use crate::error::LookupResult;
use crate::table::{LookupTable, distinct};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PredicateOp {
    Equals,
    StartsWith,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Predicate {
    column: String,
    /// Case-folded comparison value
    value: String,
    op: PredicateOp,
}

impl Predicate {
    fn matches(&self, cell: &str) -> bool {
        let cell = fold(cell);
        match self.op {
            PredicateOp::Equals => cell == self.value,
            PredicateOp::StartsWith => cell.starts_with(&self.value),
            PredicateOp::NotEquals => cell != self.value,
        }
    }
}

fn fold(value: &str) -> String {
    value.to_lowercase()
}

/// Builder of AND-combined, case-insensitive predicates.
#[derive(Debug, Clone)]
pub struct FilterBuilder<'a> {
    table: &'a LookupTable,
    predicates: Vec<Predicate>,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(table: &'a LookupTable) -> Self {
        Self {
            table,
            predicates: Vec::new(),
        }
    }

    fn with(mut self, column: &str, value: &str, op: PredicateOp) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            value: fold(value),
            op,
        });
        self
    }

    /// Keep rows whose `column` equals `value`, ignoring case.
    pub fn equals_ignore_case(self, column: &str, value: &str) -> Self {
        self.with(column, value, PredicateOp::Equals)
    }

    /// Keep rows whose `column` starts with `prefix`, ignoring case.
    pub fn starts_with_ignore_case(self, column: &str, prefix: &str) -> Self {
        self.with(column, prefix, PredicateOp::StartsWith)
    }

    /// Keep rows whose `column` differs from `value`, ignoring case.
    pub fn not_equals_ignore_case(self, column: &str, value: &str) -> Self {
        self.with(column, value, PredicateOp::NotEquals)
    }

    pub fn table(&self) -> &'a LookupTable {
        self.table
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Rows that pass every predicate.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::UnknownColumn` if any predicate names a missing column.
    pub fn matching_rows(&self) -> LookupResult<Vec<&'a [String]>> {
        let resolved = self
            .predicates
            .iter()
            .map(|p| self.table.column_index(&p.column).map(|idx| (idx, p)))
            .collect::<LookupResult<Vec<_>>>()?;

        Ok(self
            .table
            .rows()
            .iter()
            .filter(|row| resolved.iter().all(|(idx, p)| p.matches(&row[*idx])))
            .map(Vec::as_slice)
            .collect())
    }

    /// Distinct values of `select_column` across matching rows, in first-seen order.
    pub fn find_all_unique_values(&self, select_column: &str) -> LookupResult<Vec<String>> {
        let select = self.table.column_index(select_column)?;
        let rows = self.matching_rows()?;
        Ok(distinct(rows.iter().map(|row| row[select].as_str())))
    }

    /// The value of `select_column` only if exactly one distinct value matches.
    ///
    /// Zero matches and ambiguous matches both yield `Ok(None)`.
    pub fn find_single_result(&self, select_column: &str) -> LookupResult<Option<String>> {
        let mut values = self.find_all_unique_values(select_column)?;
        if values.len() == 1 {
            Ok(values.pop())
        } else {
            Ok(None)
        }
    }

    /// Returns `true` if at least one row matches.
    pub fn has_rows(&self) -> LookupResult<bool> {
        Ok(!self.matching_rows()?.is_empty())
    }

    /// A new table with the same header containing only matching rows.
    pub fn filter(&self) -> LookupResult<LookupTable> {
        let rows = self
            .matching_rows()?
            .into_iter()
            .map(<[String]>::to_vec)
            .collect();
        Ok(self.table.with_rows(rows))
    }
}
