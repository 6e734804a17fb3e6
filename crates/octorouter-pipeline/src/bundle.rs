//! Helpers over canonical bundles held as `serde_json::Value`.
//!
//! Transformations take a bundle by value or reference and hand back a new
//! one; nothing here edits a bundle that is shared elsewhere.

use std::collections::HashSet;

use octorouter_lookup::{LookupResult, LookupTable};
use serde_json::{Value, json};

use crate::error::{PipelineError, PipelineResult};

/// Extension placed on a coding once it has been mapped to a condition.
pub const CONDITION_CODE_EXTENSION_URL: &str =
    "https://reportstream.cdc.gov/fhir/StructureDefinition/condition-code";

/// Condition code for "ask at order entry" answers, which are not a condition.
pub const AOE_CODE: &str = "AOE";

/// Columns of the observation mapping table.
pub mod mapping_columns {
    pub const CODE: &str = "Code";
    pub const CONDITION_CODE: &str = "Condition Code";
    pub const CONDITION_CODE_SYSTEM: &str = "Condition Code System";
    pub const CONDITION_NAME: &str = "Condition Name";
}

/// Splits NDJSON into `(index, line)` pairs. Blank lines are skipped but keep
/// their place in the numbering.
pub fn split_ndjson(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

/// The resources of every entry, in order.
pub fn resources(bundle: &Value) -> impl Iterator<Item = &Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("resource"))
}

fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(Value::as_str)
}

/// Observation resources in entry order.
pub fn observations(bundle: &Value) -> impl Iterator<Item = &Value> {
    resources(bundle).filter(|r| resource_type(r) == Some("Observation"))
}

/// `Bundle.identifier.value`, used to correlate items across hops.
pub fn tracking_id(bundle: &Value) -> Option<String> {
    bundle
        .get("identifier")
        .and_then(|id| id.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Checks that `bundle` is a bundle with at least one entry.
///
/// # Errors
///
/// Returns `PipelineError::Validation` otherwise.
pub fn validate_bundle(bundle: &Value) -> PipelineResult<()> {
    match resource_type(bundle) {
        Some("Bundle") => {}
        Some(other) => {
            return Err(PipelineError::validation(format!(
                "expected a Bundle, found {other}"
            )));
        }
        None => return Err(PipelineError::validation("missing resourceType")),
    }
    let has_entries = bundle
        .get("entry")
        .and_then(Value::as_array)
        .is_some_and(|entries| !entries.is_empty());
    if !has_entries {
        return Err(PipelineError::validation("bundle has no entries"));
    }
    Ok(())
}

/// Codings an observation can be classified by: its code and, when coded,
/// its value.
fn coding_sources(observation: &Value) -> impl Iterator<Item = &Value> {
    ["code", "valueCodeableConcept"]
        .into_iter()
        .filter_map(|field| observation.get(field))
        .filter_map(|concept| concept.get("coding").and_then(Value::as_array))
        .flatten()
}

fn coding_sources_mut(observation: &mut Value) -> Vec<&mut Value> {
    let Value::Object(map) = observation else {
        return Vec::new();
    };
    map.iter_mut()
        .filter(|(field, _)| *field == "code" || *field == "valueCodeableConcept")
        .filter_map(|(_, concept)| concept.get_mut("coding").and_then(Value::as_array_mut))
        .flat_map(|codings| codings.iter_mut())
        .collect()
}

/// An observation none of whose codes map to a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmappedObservation {
    /// Position of the observation among the bundle's observations.
    pub observation_index: usize,
    pub codes: Vec<String>,
}

impl UnmappedObservation {
    pub fn message(&self) -> String {
        if self.codes.is_empty() {
            "Observation has no codes to map to a condition".to_string()
        } else {
            format!(
                "Missing mapping for code(s): {}",
                self.codes.join(", ")
            )
        }
    }
}

/// Stamped bundle plus the observations that could not be classified.
#[derive(Debug, Clone)]
pub struct StampedBundle {
    pub bundle: Value,
    pub unmapped: Vec<UnmappedObservation>,
}

/// Adds a condition-code extension to every observation coding found in the
/// mapping table.
///
/// # Errors
///
/// Returns `LookupError::UnknownColumn` if the table lacks a mapping column.
pub fn stamp_conditions(mut bundle: Value, table: &LookupTable) -> LookupResult<StampedBundle> {
    let code_col = table.column_index(mapping_columns::CODE)?;
    let condition_col = table.column_index(mapping_columns::CONDITION_CODE)?;
    let system_col = table.column_index(mapping_columns::CONDITION_CODE_SYSTEM)?;
    let name_col = table.column_index(mapping_columns::CONDITION_NAME)?;

    let mut unmapped = Vec::new();
    let entries = bundle
        .get_mut("entry")
        .and_then(Value::as_array_mut)
        .map(|entries| entries.iter_mut())
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get_mut("resource"))
        .filter(|r| resource_type(r) == Some("Observation"));

    for (observation_index, observation) in entries.enumerate() {
        let mut missing = Vec::new();
        let mut mapped_any = false;
        for coding in coding_sources_mut(observation) {
            let Some(code) = coding.get("code").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let row = table
                .rows()
                .iter()
                .find(|row| row[code_col].eq_ignore_ascii_case(&code));
            let Some(row) = row else {
                missing.push(code);
                continue;
            };
            let extension = json!({
                "url": CONDITION_CODE_EXTENSION_URL,
                "valueCoding": {
                    "system": row[system_col],
                    "code": row[condition_col],
                    "display": row[name_col],
                }
            });
            if let Value::Object(map) = coding {
                let extensions = map
                    .entry("extension")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = extensions {
                    if !list.contains(&extension) {
                        list.push(extension);
                    }
                }
            }
            mapped_any = true;
        }
        if !mapped_any {
            unmapped.push(UnmappedObservation {
                observation_index,
                codes: missing,
            });
        }
    }

    Ok(StampedBundle { bundle, unmapped })
}

/// Condition codes stamped on an observation's codings.
pub fn mapped_conditions(observation: &Value) -> Vec<String> {
    coding_sources(observation)
        .filter_map(|coding| coding.get("extension").and_then(Value::as_array))
        .flatten()
        .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(CONDITION_CODE_EXTENSION_URL))
        .filter_map(|ext| ext.pointer("/valueCoding/code").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// `true` if the observation maps to conditions and all of them are AOE.
pub fn is_aoe_only(observation: &Value) -> bool {
    let conditions = mapped_conditions(observation);
    !conditions.is_empty() && conditions.iter().all(|c| c == AOE_CODE)
}

/// Reference strings under which other resources may point at `entry`.
fn reference_keys(entry: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(full_url) = entry.get("fullUrl").and_then(Value::as_str) {
        keys.push(full_url.to_string());
    }
    if let Some(resource) = entry.get("resource") {
        if let (Some(kind), Some(id)) = (
            resource_type(resource),
            resource.get("id").and_then(Value::as_str),
        ) {
            keys.push(format!("{kind}/{id}"));
        }
    }
    keys
}

/// A copy of `bundle` that keeps only the observations at the given positions
/// (counted among observations). Dropped observations are unlinked from
/// `DiagnosticReport.result`, and reports left without results are dropped.
pub fn filter_observations(bundle: &Value, keep: &HashSet<usize>) -> Value {
    let mut out = bundle.clone();
    let Some(entries) = out.get_mut("entry").and_then(Value::as_array_mut) else {
        return out;
    };

    let mut removed = HashSet::new();
    let mut observation_index = 0;
    entries.retain(|entry| {
        let is_observation =
            entry.get("resource").and_then(resource_type) == Some("Observation");
        if !is_observation {
            return true;
        }
        let kept = keep.contains(&observation_index);
        observation_index += 1;
        if !kept {
            removed.extend(reference_keys(entry));
        }
        kept
    });

    if removed.is_empty() {
        return out;
    }

    entries.retain_mut(|entry| {
        let Some(resource) = entry.get_mut("resource") else {
            return true;
        };
        if resource_type(resource) != Some("DiagnosticReport") {
            return true;
        }
        let Some(results) = resource.get_mut("result").and_then(Value::as_array_mut) else {
            return true;
        };
        results.retain(|r| {
            r.get("reference")
                .and_then(Value::as_str)
                .is_none_or(|reference| !removed.contains(reference))
        });
        !results.is_empty()
    });
    out
}
