//! Cascading device catalog lookup.
//!
//! Device identification in lab reports is loose: a sender may supply a device
//! identifier in one of several 99ELR sub-formats, an equipment UID, a test kit
//! id, or only a model name. [`DeviceLookup`] tries an ordered list of
//! strategies and returns the first non-blank single result. Each strategy
//! starts from a fresh copy of the base filter.

use crate::error::LookupResult;
use crate::filter::FilterBuilder;
use crate::table::LookupTable;

/// Column names of the device (LIVD) catalog.
pub mod columns {
    pub const TEST_PERFORMED_CODE: &str = "Test Performed LOINC Code";
    pub const PROCESSING_MODE_CODE: &str = "processing_mode_code";
    pub const EQUIPMENT_UID: &str = "Equipment UID";
    pub const TESTKIT_NAME_ID: &str = "Testkit Name ID";
    pub const MODEL: &str = "Model";
    pub const MANUFACTURER: &str = "Manufacturer";
}

/// Processing mode code of test (non-production) data.
pub const TEST_PROCESSING_MODE: &str = "T";

/// Known 99ELR device id suffixes, e.g. `10811877011269_DII`.
const ELR_SUFFIXES: [&str; 7] = ["EUA", "DII", "DIT", "DIM", "MNT", "MNI", "MNM"];

/// Everything a report tells us about the device that ran a test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceQuery {
    pub device_id: Option<String>,
    pub equipment_model_id: Option<String>,
    pub test_kit_name_id: Option<String>,
    pub equipment_model_name: Option<String>,
    pub test_performed_code: Option<String>,
    pub processing_mode_code: Option<String>,
}

/// A single lookup strategy.
pub type DeviceStrategy = fn(&LookupTable, &DeviceQuery, &str) -> LookupResult<Option<String>>;

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Filters shared by every strategy.
///
/// Narrow by the performed test code when known, and ignore test devices
/// unless the report itself is test data.
pub fn base_filter<'a>(table: &'a LookupTable, query: &DeviceQuery) -> FilterBuilder<'a> {
    let mut filter = table.filter_builder();
    if let Some(code) = present(&query.test_performed_code) {
        filter = filter.equals_ignore_case(columns::TEST_PERFORMED_CODE, code);
    }
    let is_test_data = present(&query.processing_mode_code)
        .is_some_and(|mode| mode.eq_ignore_ascii_case(TEST_PROCESSING_MODE));
    if !is_test_data {
        filter = filter.not_equals_ignore_case(columns::PROCESSING_MODE_CODE, TEST_PROCESSING_MODE);
    }
    filter
}

fn lookup_equals(
    table: &LookupTable,
    query: &DeviceQuery,
    on_column: &str,
    value: &str,
    select: &str,
) -> LookupResult<Option<String>> {
    base_filter(table, query)
        .equals_ignore_case(on_column, value)
        .find_single_result(select)
        .map(non_blank)
}

fn lookup_prefix(
    table: &LookupTable,
    query: &DeviceQuery,
    on_column: &str,
    prefix: &str,
    select: &str,
) -> LookupResult<Option<String>> {
    base_filter(table, query)
        .starts_with_ignore_case(on_column, prefix)
        .find_single_result(select)
        .map(non_blank)
}

/// Resolve a device id in one of its sub-formats.
///
/// - `<id>_<suffix>` with a known 99ELR suffix: strip it, then test kit id, then equipment UID.
/// - `<id>#` (truncated): prefix match on test kit id, then equipment UID.
/// - anything else: test kit id, then equipment UID.
pub fn by_device_id(
    table: &LookupTable,
    query: &DeviceQuery,
    select: &str,
) -> LookupResult<Option<String>> {
    let Some(device_id) = present(&query.device_id) else {
        return Ok(None);
    };

    if let Some((value, suffix)) = device_id.rsplit_once('_')
        && ELR_SUFFIXES.contains(&suffix)
    {
        if value.trim().is_empty() {
            return Ok(None);
        }
        return match lookup_equals(table, query, columns::TESTKIT_NAME_ID, value, select)? {
            Some(found) => Ok(Some(found)),
            None => lookup_equals(table, query, columns::EQUIPMENT_UID, value, select),
        };
    }

    if let Some(value) = device_id.strip_suffix('#') {
        if value.trim().is_empty() {
            return Ok(None);
        }
        return match lookup_prefix(table, query, columns::TESTKIT_NAME_ID, value, select)? {
            Some(found) => Ok(Some(found)),
            None => lookup_prefix(table, query, columns::EQUIPMENT_UID, value, select),
        };
    }

    match lookup_equals(table, query, columns::TESTKIT_NAME_ID, device_id, select)? {
        Some(found) => Ok(Some(found)),
        None => lookup_equals(table, query, columns::EQUIPMENT_UID, device_id, select),
    }
}

pub fn by_equipment_uid(
    table: &LookupTable,
    query: &DeviceQuery,
    select: &str,
) -> LookupResult<Option<String>> {
    match present(&query.equipment_model_id) {
        Some(uid) => lookup_equals(table, query, columns::EQUIPMENT_UID, uid, select),
        None => Ok(None),
    }
}

pub fn by_test_kit_id(
    table: &LookupTable,
    query: &DeviceQuery,
    select: &str,
) -> LookupResult<Option<String>> {
    match present(&query.test_kit_name_id) {
        Some(id) => lookup_equals(table, query, columns::TESTKIT_NAME_ID, id, select),
        None => Ok(None),
    }
}

/// Model names in the catalog sometimes carry a trailing `*` marker.
pub fn clean_model_name(name: &str) -> &str {
    let trimmed = name.trim();
    trimmed.strip_suffix('*').unwrap_or(trimmed)
}

pub fn by_model_name(
    table: &LookupTable,
    query: &DeviceQuery,
    select: &str,
) -> LookupResult<Option<String>> {
    match present(&query.equipment_model_name) {
        Some(name) => lookup_equals(table, query, columns::MODEL, clean_model_name(name), select),
        None => Ok(None),
    }
}

/// Ordered fallback chain of device strategies.
#[derive(Debug, Clone)]
pub struct DeviceLookup {
    strategies: Vec<(&'static str, DeviceStrategy)>,
}

impl Default for DeviceLookup {
    fn default() -> Self {
        Self {
            strategies: vec![
                ("device_id", by_device_id as DeviceStrategy),
                ("equipment_uid", by_equipment_uid as DeviceStrategy),
                ("test_kit_id", by_test_kit_id as DeviceStrategy),
                ("model_name", by_model_name as DeviceStrategy),
            ],
        }
    }
}

impl DeviceLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strategy names in evaluation order.
    pub fn strategy_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.strategies.iter().map(|(name, _)| *name)
    }

    /// Value of `select` from the first strategy that yields a non-blank single result.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::UnknownColumn` if the table lacks a catalog column.
    pub fn lookup(
        &self,
        table: &LookupTable,
        query: &DeviceQuery,
        select: &str,
    ) -> LookupResult<Option<String>> {
        for (name, strategy) in &self.strategies {
            if let Some(found) = strategy(table, query, select)? {
                tracing::trace!(strategy = *name, table = table.name(), "Device lookup hit");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [&str; 6] = [
        columns::MANUFACTURER,
        columns::MODEL,
        columns::TESTKIT_NAME_ID,
        columns::EQUIPMENT_UID,
        columns::TEST_PERFORMED_CODE,
        columns::PROCESSING_MODE_CODE,
    ];

    fn livd() -> LookupTable {
        let rows = [
            [
                "Abbott",
                "BinaxNOW COVID-19 Ag Card",
                "10811877011269",
                "BinaxNOW-Reader",
                "94558-4",
                "",
            ],
            [
                "Quidel",
                "Sofia 2 Flu + SARS Antigen FIA*",
                "10758750002467",
                "Sofia 2",
                "94558-4",
                "",
            ],
            [
                "Quidel",
                "Sofia 2 Flu + SARS Antigen FIA*",
                "10758750002467",
                "Sofia 2",
                "80382-5",
                "",
            ],
            ["Acme", "Acme Test Device", "99999999", "ACME-UID", "94558-4", "T"],
        ];
        LookupTable::new(
            "LIVD-SARS-CoV-2",
            1,
            HEADER.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
        .unwrap()
    }

    fn query() -> DeviceQuery {
        DeviceQuery::default()
    }

    #[test]
    fn test_device_id_with_elr_suffix() {
        let q = DeviceQuery {
            device_id: Some("10811877011269_DII".into()),
            ..query()
        };
        assert_eq!(
            by_device_id(&livd(), &q, columns::MODEL).unwrap().as_deref(),
            Some("BinaxNOW COVID-19 Ag Card")
        );
    }

    #[test]
    fn test_device_id_falls_back_to_equipment_uid() {
        let q = DeviceQuery {
            device_id: Some("BinaxNOW-Reader_EUA".into()),
            ..query()
        };
        assert_eq!(
            by_device_id(&livd(), &q, columns::MANUFACTURER).unwrap().as_deref(),
            Some("Abbott")
        );
    }

    #[test]
    fn test_truncated_device_id_uses_prefix() {
        let q = DeviceQuery {
            device_id: Some("108118770#".into()),
            ..query()
        };
        assert_eq!(
            by_device_id(&livd(), &q, columns::MANUFACTURER).unwrap().as_deref(),
            Some("Abbott")
        );
    }

    #[test]
    fn test_device_id_without_value_matches_nothing() {
        // blank test kit ids in the catalog must not satisfy a bare suffix
        let table = LookupTable::new(
            "LIVD-SARS-CoV-2",
            1,
            HEADER.iter().map(|c| c.to_string()).collect(),
            vec![vec![
                "Nameless".into(),
                "Unlabelled Device".into(),
                "".into(),
                "".into(),
                "94558-4".into(),
                "".into(),
            ]],
        )
        .unwrap();
        for id in ["_DII", " _EUA", "#"] {
            let q = DeviceQuery {
                device_id: Some(id.into()),
                ..query()
            };
            assert_eq!(by_device_id(&table, &q, columns::MODEL).unwrap(), None, "{id}");
        }
    }

    #[test]
    fn test_unknown_suffix_is_part_of_the_id() {
        let q = DeviceQuery {
            device_id: Some("10811877011269_XYZ".into()),
            ..query()
        };
        assert_eq!(by_device_id(&livd(), &q, columns::MODEL).unwrap(), None);
    }

    #[test]
    fn test_ambiguous_rows_resolved_by_test_code() {
        let table = livd();
        let ambiguous = DeviceQuery {
            test_kit_name_id: Some("10758750002467".into()),
            ..query()
        };
        // two rows, but the same model value
        assert_eq!(
            by_test_kit_id(&table, &ambiguous, columns::MODEL).unwrap().as_deref(),
            Some("Sofia 2 Flu + SARS Antigen FIA*")
        );
        // two rows with different codes
        assert_eq!(
            by_test_kit_id(&table, &ambiguous, columns::TEST_PERFORMED_CODE).unwrap(),
            None
        );

        let narrowed = DeviceQuery {
            test_performed_code: Some("80382-5".into()),
            ..ambiguous
        };
        assert_eq!(
            by_test_kit_id(&table, &narrowed, columns::TEST_PERFORMED_CODE)
                .unwrap()
                .as_deref(),
            Some("80382-5")
        );
    }

    #[test]
    fn test_model_name_strips_trailing_star() {
        assert_eq!(
            clean_model_name("Sofia 2 Flu + SARS Antigen FIA*"),
            "Sofia 2 Flu + SARS Antigen FIA"
        );
        assert_eq!(clean_model_name(" BinaxNOW "), "BinaxNOW");

        let q = DeviceQuery {
            equipment_model_name: Some("BinaxNOW COVID-19 Ag Card*".into()),
            ..query()
        };
        assert_eq!(
            by_model_name(&livd(), &q, columns::MANUFACTURER).unwrap().as_deref(),
            Some("Abbott")
        );
    }

    #[test]
    fn test_test_devices_hidden_unless_test_data() {
        let table = livd();
        let production = DeviceQuery {
            equipment_model_id: Some("ACME-UID".into()),
            ..query()
        };
        assert_eq!(by_equipment_uid(&table, &production, columns::MODEL).unwrap(), None);

        let test_data = DeviceQuery {
            processing_mode_code: Some("t".into()),
            ..production
        };
        assert_eq!(
            by_equipment_uid(&table, &test_data, columns::MODEL).unwrap().as_deref(),
            Some("Acme Test Device")
        );
    }

    #[test]
    fn test_cascade_falls_through_to_later_strategies() {
        let q = DeviceQuery {
            device_id: Some("does-not-exist".into()),
            equipment_model_id: Some("   ".into()),
            test_kit_name_id: Some("10811877011269".into()),
            ..query()
        };
        assert_eq!(
            DeviceLookup::new()
                .lookup(&livd(), &q, columns::MANUFACTURER)
                .unwrap()
                .as_deref(),
            Some("Abbott")
        );
    }

    #[test]
    fn test_cascade_order() {
        let lookup = DeviceLookup::new();
        assert_eq!(
            lookup.strategy_names().collect::<Vec<_>>(),
            vec!["device_id", "equipment_uid", "test_kit_id", "model_name"]
        );
    }

    #[test]
    fn test_blank_result_is_skipped() {
        let q = DeviceQuery {
            test_kit_name_id: Some("10811877011269".into()),
            ..query()
        };
        // the selected cell is blank for every row
        assert_eq!(
            DeviceLookup::new()
                .lookup(&livd(), &q, columns::PROCESSING_MODE_CODE)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_nothing_supplied() {
        assert_eq!(
            DeviceLookup::new().lookup(&livd(), &query(), columns::MODEL).unwrap(),
            None
        );
    }
}
