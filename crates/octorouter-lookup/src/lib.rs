//! # octorouter-lookup
//!
//! Reference-table engine for the OctoRouter pipeline.
//!
//! ## Overview
//!
//! - [`LookupTable`]: an immutable, named, versioned table of strings.
//! - [`FilterBuilder`]: conjunctive case-insensitive predicates with
//!   exact lookups that refuse to guess on ambiguity.
//! - [`BestMatchQuery`]: heuristic word-overlap search where common words only
//!   break ties.
//! - [`DeviceLookup`]: ordered fallback chain over a device catalog.
//! - [`TableRegistry`]: injectable `(name, version)` cache fed by a
//!   [`TableSource`].
//!
//! ## Example
//!
//! ```ignore
//! use octorouter_lookup::{DirectorySource, TableRegistry};
//!
//! let registry = TableRegistry::new_shared();
//! registry.reload(&DirectorySource::new("metadata/tables")).await?;
//! let mapping = registry.require("observation-mapping")?;
//! let condition = mapping
//!     .filter_builder()
//!     .equals_ignore_case("Code", "94558-4")
//!     .find_single_result("Condition Code")?;
//! ```

pub mod best_match;
pub mod device;
mod error;
pub mod filter;
pub mod registry;
pub mod source;
pub mod table;

pub use best_match::{BestMatchQuery, default_canonicalize, tokenize};
pub use device::{DeviceLookup, DeviceQuery, DeviceStrategy};
pub use error::{LookupError, LookupResult};
pub use filter::FilterBuilder;
pub use registry::TableRegistry;
pub use source::{DirectorySource, StaticSource, TableDescriptor, TableSource};
pub use table::LookupTable;
