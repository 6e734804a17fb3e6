//! Filter-expression engine.
//!
//! A FHIRPath subset sufficient for routing predicates, evaluated over
//! `serde_json::Value` bundles. Expressions are parsed once per engine and
//! cached; `%name` variables that are not built in resolve through a shorthand
//! table of `variable -> expression` pairs.
//!
//! `livdTableLookup('<column>')` resolves the device that produced an
//! observation against the device catalog held in the attached
//! [`TableRegistry`].
//!
//! ```ignore
//! let engine = ExpressionEngine::new().with_shorthands([(
//!     "patientState".to_string(),
//!     "Bundle.entry.resource.ofType(Patient).address.state".to_string(),
//! )]);
//! assert!(engine.evaluate_condition("%patientState = 'IG'", &bundle)?);
//! ```

mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use octorouter_lookup::{DeviceLookup, LookupResult, LookupTable, TableRegistry};
use regex::Regex;
use serde_json::Value;

pub use parser::{BinaryOp, Expr, Literal, parse_expression};

/// Column holding the variable name in the shorthand table.
pub const SHORTHAND_VARIABLE_COLUMN: &str = "variable";
/// Column holding the expression in the shorthand table.
pub const SHORTHAND_EXPRESSION_COLUMN: &str = "fhirPath";
/// Device catalog consulted by `livdTableLookup()`.
pub const DEFAULT_DEVICE_TABLE: &str = "LIVD-SARS-CoV-2";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpressionError {
    #[error("Syntax error in expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("Unknown variable '%{0}'")]
    UnknownVariable(String),

    #[error("Unknown function '{0}()'")]
    UnknownFunction(String),

    #[error("Function '{name}' expects {expected}")]
    Arguments { name: String, expected: String },

    #[error("Expression '{expression}' did not evaluate to a boolean: {found}")]
    NotBoolean { expression: String, found: String },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Shorthand '%{0}' nests too deeply")]
    RecursionLimit(String),

    #[error("Lookup table '{0}' is not loaded")]
    MissingTable(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),
}

impl ExpressionError {
    pub(crate) fn syntax(expression: &str, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: expression.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn arguments(name: &str, expected: impl Into<String>) -> Self {
        Self::Arguments {
            name: name.to_string(),
            expected: expected.into(),
        }
    }
}

/// Parses and evaluates filter expressions, caching parsed forms.
#[derive(Debug)]
pub struct ExpressionEngine {
    shorthands: HashMap<String, String>,
    cache: DashMap<String, Arc<Expr>>,
    regexes: DashMap<String, Regex>,
    tables: Option<Arc<TableRegistry>>,
    device_table: String,
    devices: DeviceLookup,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self {
            shorthands: HashMap::new(),
            cache: DashMap::new(),
            regexes: DashMap::new(),
            tables: None,
            device_table: DEFAULT_DEVICE_TABLE.to_string(),
            devices: DeviceLookup::new(),
        }
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that backs table functions such as `livdTableLookup()`.
    pub fn with_tables(mut self, tables: Arc<TableRegistry>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_device_table(mut self, name: impl Into<String>) -> Self {
        self.device_table = name.into();
        self
    }

    pub(crate) fn device_lookup(
        &self,
    ) -> Result<(Arc<LookupTable>, &DeviceLookup), ExpressionError> {
        self.tables
            .as_ref()
            .and_then(|tables| tables.get(&self.device_table))
            .map(|table| (table, &self.devices))
            .ok_or_else(|| ExpressionError::MissingTable(self.device_table.clone()))
    }

    pub fn with_shorthands(
        mut self,
        shorthands: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.shorthands.extend(shorthands);
        self
    }

    /// Builds an engine whose shorthands come from a `variable,fhirPath` table.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::UnknownColumn` if either column is missing.
    pub fn from_shorthand_table(table: &LookupTable) -> LookupResult<Self> {
        let variable = table.column_index(SHORTHAND_VARIABLE_COLUMN)?;
        let expression = table.column_index(SHORTHAND_EXPRESSION_COLUMN)?;
        let shorthands = table
            .rows()
            .iter()
            .filter(|row| !row[variable].trim().is_empty())
            .map(|row| (row[variable].trim().to_string(), row[expression].trim().to_string()));
        Ok(Self::new().with_shorthands(shorthands))
    }

    pub fn shorthands(&self) -> &HashMap<String, String> {
        &self.shorthands
    }

    /// Parses `text`, reusing an earlier parse of the same text.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Syntax` for malformed input.
    pub fn parse(&self, text: &str) -> Result<Arc<Expr>, ExpressionError> {
        if let Some(expr) = self.cache.get(text) {
            return Ok(Arc::clone(expr.value()));
        }
        let expr = Arc::new(parse_expression(text)?);
        self.cache.insert(text.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    pub(crate) fn regex(&self, pattern: &str) -> Result<Regex, ExpressionError> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.value().clone());
        }
        // whole-string match
        let re = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            ExpressionError::InvalidRegex {
                pattern: pattern.to_string(),
                message: e.to_string(),
            }
        })?;
        self.regexes.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Evaluates `text` with `focus` as `%resource` and `$this`, and `root` as
    /// `%bundle`.
    ///
    /// # Errors
    ///
    /// Returns an `ExpressionError` for syntax errors, unknown variables or
    /// functions, and type errors.
    pub fn evaluate(
        &self,
        text: &str,
        focus: &Value,
        root: &Value,
    ) -> Result<Vec<Value>, ExpressionError> {
        let expr = self.parse(text)?;
        eval::Evaluator::new(self, focus, root).evaluate(&expr, std::slice::from_ref(focus))
    }

    /// Evaluates a predicate against the bundle itself.
    ///
    /// An empty result is `false`; a single boolean is its value.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::NotBoolean` for any other result, plus any
    /// evaluation error.
    pub fn evaluate_condition(&self, text: &str, root: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_condition_on(text, root, root)
    }

    /// Evaluates a predicate with `focus` (e.g. one observation) as the
    /// starting point and `root` as the enclosing bundle.
    pub fn evaluate_condition_on(
        &self,
        text: &str,
        focus: &Value,
        root: &Value,
    ) -> Result<bool, ExpressionError> {
        let result = self.evaluate(text, focus, root)?;
        let value = match result.as_slice() {
            [] => false,
            [Value::Bool(b)] => *b,
            [other] => {
                return Err(ExpressionError::NotBoolean {
                    expression: text.to_string(),
                    found: other.to_string(),
                });
            }
            many => {
                return Err(ExpressionError::NotBoolean {
                    expression: text.to_string(),
                    found: format!("{} items", many.len()),
                });
            }
        };
        tracing::trace!(expression = text, result = value, "Evaluated condition");
        Ok(value)
    }
}

/// One-off predicate evaluation without a long-lived engine.
pub fn evaluate_condition(
    text: &str,
    root: &Value,
    shorthands: &HashMap<String, String>,
) -> Result<bool, ExpressionError> {
    ExpressionEngine::new()
        .with_shorthands(shorthands.iter().map(|(k, v)| (k.clone(), v.clone())))
        .evaluate_condition(text, root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle() -> Value {
        json!({
            "resourceType": "Bundle",
            "identifier": {"value": "MT_1"},
            "entry": [
                {"resource": {
                    "resourceType": "MessageHeader",
                    "meta": {"extension": [{
                        "url": "https://reportstream.cdc.gov/fhir/StructureDefinition/source-processing-id",
                        "valueCodeableConcept": {"coding": [{"code": "P"}]}
                    }]}
                }},
                {"resource": {
                    "resourceType": "Patient",
                    "address": [{"state": "IG"}]
                }},
                {"resource": {
                    "resourceType": "Observation",
                    "id": "obs-1",
                    "status": "final",
                    "code": {"coding": [{"system": "http://loinc.org", "code": "94558-4"}]},
                    "valueCodeableConcept": {"coding": [{"code": "260373001"}]}
                }},
                {"resource": {
                    "resourceType": "Observation",
                    "id": "obs-2",
                    "status": "preliminary",
                    "valueString": "positive"
                }}
            ]
        })
    }

    fn engine() -> ExpressionEngine {
        ExpressionEngine::new().with_shorthands([
            (
                "patientState".to_string(),
                "Bundle.entry.resource.ofType(Patient).address.state".to_string(),
            ),
            (
                "processingId".to_string(),
                "Bundle.entry.resource.ofType(MessageHeader).meta.extension('https://reportstream.cdc.gov/fhir/StructureDefinition/source-processing-id').value.coding.code".to_string(),
            ),
        ])
    }

    #[test]
    fn test_shorthand_conditions() {
        let engine = engine();
        let bundle = bundle();
        assert!(engine.evaluate_condition("%patientState = 'IG'", &bundle).unwrap());
        assert!(!engine.evaluate_condition("%patientState = 'CA'", &bundle).unwrap());
        assert!(engine
            .evaluate_condition("%processingId.exists() and %processingId = 'P'", &bundle)
            .unwrap());
    }

    #[test]
    fn test_empty_result_is_false() {
        let engine = engine();
        assert!(!engine
            .evaluate_condition(
                "Bundle.entry.resource.ofType(Specimen).exists() and true",
                &bundle(),
            )
            .unwrap());
        assert!(!engine.evaluate_condition("Bundle.nothing = 'x'", &bundle()).unwrap());
        assert!(!engine.evaluate_condition("{}", &bundle()).unwrap());
    }

    #[test]
    fn test_non_boolean_is_error() {
        let engine = engine();
        let err = engine
            .evaluate_condition("Bundle.identifier.value", &bundle())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::NotBoolean { .. }));

        let err = engine
            .evaluate_condition("Bundle.entry.resource.ofType(Observation).status", &bundle())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::NotBoolean { .. }));
    }

    #[test]
    fn test_unknown_variable_is_error() {
        let err = engine()
            .evaluate_condition("%nope.exists()", &bundle())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownVariable(name) if name == "nope"));
    }

    #[test]
    fn test_focus_on_observation() {
        let engine = engine();
        let bundle = bundle();
        let observation = &bundle["entry"][2]["resource"];
        assert!(engine
            .evaluate_condition_on("%resource.code.coding.code = '94558-4'", observation, &bundle)
            .unwrap());
        assert!(engine
            .evaluate_condition_on(
                "code.coding.where(system = 'http://loinc.org').exists()",
                observation,
                &bundle,
            )
            .unwrap());
        // %bundle stays reachable from an observation focus
        assert!(engine
            .evaluate_condition_on("%bundle.identifier.value = 'MT_1'", observation, &bundle)
            .unwrap());
    }

    #[test]
    fn test_parse_cache() {
        let engine = ExpressionEngine::new();
        let a = engine.parse("Bundle.entry.exists()").unwrap();
        let b = engine.parse("Bundle.entry.exists()").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_from_shorthand_table() {
        let table = LookupTable::new(
            "fhirpath_filter_shorthand",
            1,
            vec!["variable".into(), "fhirPath".into()],
            vec![vec![
                "patientState".into(),
                "Bundle.entry.resource.ofType(Patient).address.state".into(),
            ]],
        )
        .unwrap();
        let engine = ExpressionEngine::from_shorthand_table(&table).unwrap();
        assert!(engine.evaluate_condition("%patientState = 'IG'", &bundle()).unwrap());
    }

    #[test]
    fn test_free_function() {
        let shorthands = HashMap::from([(
            "state".to_string(),
            "Bundle.entry.resource.ofType(Patient).address.state".to_string(),
        )]);
        assert!(evaluate_condition("%state = 'IG'", &bundle(), &shorthands).unwrap());
    }
}
