//! Heuristic best-match search.
//!
//! The query and each candidate cell are tokenized into words. Query words are
//! split into *common* (low-signal, supplied by the caller) and *uncommon* ones.
//! A row scores
//!
//! ```text
//! (uncommon_matches * weight + common_matches) / (uncommon_total * weight + common_total)
//! where weight = uncommon_total + 1
//! ```
//!
//! and a row without any uncommon match scores zero, so common words can only
//! break ties. The highest positive score wins; ties keep the earlier row.

use std::collections::HashSet;

use crate::error::LookupResult;
use crate::table::LookupTable;

/// Lowercases and turns punctuation into word breaks.
pub fn default_canonicalize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
}

/// Canonicalize, trim, collapse whitespace and split into words.
pub fn tokenize(value: &str, canonicalize: fn(&str) -> String) -> Vec<String> {
    canonicalize(value)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Parameters of a best-match search.
#[derive(Debug, Clone)]
pub struct BestMatchQuery {
    search_column: String,
    lookup_column: String,
    /// Kept raw; tokenized with the final canonicalizer at query time.
    common_words: Vec<String>,
    canonicalize: fn(&str) -> String,
    filter: Option<(String, String)>,
}

impl BestMatchQuery {
    pub fn new(search_column: impl Into<String>, lookup_column: impl Into<String>) -> Self {
        Self {
            search_column: search_column.into(),
            lookup_column: lookup_column.into(),
            common_words: Vec::new(),
            canonicalize: default_canonicalize,
            filter: None,
        }
    }

    /// Words that only count as tie-breakers. They are canonicalized like the query.
    pub fn with_common_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.common_words = words.into_iter().map(|w| w.as_ref().to_string()).collect();
        self
    }

    pub fn with_canonicalize(mut self, canonicalize: fn(&str) -> String) -> Self {
        self.canonicalize = canonicalize;
        self
    }

    /// Only consider rows whose `column` equals `value`, ignoring case.
    pub fn with_filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some((column.into(), value.into()));
        self
    }

    /// Score a candidate cell against the query words.
    pub fn score(&self, uncommon: &[String], common: &[String], candidate: &str) -> f64 {
        if uncommon.is_empty() {
            return 0.0;
        }
        let words: HashSet<String> = tokenize(candidate, self.canonicalize).into_iter().collect();
        let uncommon_hits = uncommon.iter().filter(|w| words.contains(*w)).count();
        if uncommon_hits == 0 {
            return 0.0;
        }
        let common_hits = common.iter().filter(|w| words.contains(*w)).count();

        let weight = (uncommon.len() + 1) as f64;
        let numerator = uncommon_hits as f64 * weight + common_hits as f64;
        let denominator = uncommon.len() as f64 * weight + common.len() as f64;
        numerator / denominator
    }

    /// Split the query into (uncommon, common) words.
    fn partition(&self, search_value: &str) -> (Vec<String>, Vec<String>) {
        let common: HashSet<String> = self
            .common_words
            .iter()
            .flat_map(|w| tokenize(w, self.canonicalize))
            .collect();
        tokenize(search_value, self.canonicalize)
            .into_iter()
            .partition(|word| !common.contains(word))
    }

    /// Run the search, returning the lookup-column value of the best row.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::UnknownColumn` if any configured column is missing.
    pub fn find(&self, table: &LookupTable, search_value: &str) -> LookupResult<Option<String>> {
        let search_idx = table.column_index(&self.search_column)?;
        let lookup_idx = table.column_index(&self.lookup_column)?;

        let mut builder = table.filter_builder();
        if let Some((column, value)) = &self.filter {
            builder = builder.equals_ignore_case(column, value);
        }
        let rows = builder.matching_rows()?;

        let (uncommon, common) = self.partition(search_value);
        if uncommon.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(f64, &str)> = None;
        for row in rows {
            let score = self.score(&uncommon, &common, &row[search_idx]);
            if score <= 0.0 {
                continue;
            }
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, row[lookup_idx].as_str()));
            }
        }

        Ok(best.map(|(_, value)| value.to_string()))
    }
}

impl LookupTable {
    /// Heuristic best-match lookup. See [`BestMatchQuery`].
    pub fn best_match(
        &self,
        query: &BestMatchQuery,
        search_value: &str,
    ) -> LookupResult<Option<String>> {
        query.find(self, search_value)
    }
}
