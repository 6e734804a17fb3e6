//! Collection-based evaluation over JSON resources.
//!
//! Every expression yields an ordered collection. Missing members yield the
//! empty collection rather than an error, so `Bundle.nope = 'x'` is empty and
//! reads as `false` in a condition.

use octorouter_lookup::DeviceQuery;
use serde_json::{Number, Value};

use super::parser::{BinaryOp, Expr, Literal};
use super::{ExpressionEngine, ExpressionError};

/// Shorthands may refer to other shorthands, up to this depth.
const MAX_SHORTHAND_DEPTH: usize = 8;

type Collection = Vec<Value>;
type EvalResult = Result<Collection, ExpressionError>;

pub(crate) struct Evaluator<'a> {
    engine: &'a ExpressionEngine,
    focus: &'a Value,
    root: &'a Value,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(engine: &'a ExpressionEngine, focus: &'a Value, root: &'a Value) -> Self {
        Self {
            engine,
            focus,
            root,
            depth: 0,
        }
    }

    pub(crate) fn evaluate(&self, expr: &Expr, input: &[Value]) -> EvalResult {
        match expr {
            Expr::Empty => Ok(Vec::new()),
            Expr::Literal(literal) => Ok(vec![literal_value(literal)]),
            Expr::This => Ok(input.to_vec()),
            Expr::Variable(name) => self.variable(name),
            Expr::Member { base, name } => {
                let input = self.base(base.as_deref(), input)?;
                Ok(navigate(&input, name, base.is_none()))
            }
            Expr::Function { base, name, args } => {
                let input = self.base(base.as_deref(), input)?;
                self.function(name, args, &input)
            }
            Expr::Index { base, index } => {
                let items = self.evaluate(base, input)?;
                let position = match self.evaluate(index, input)?.as_slice() {
                    [Value::Number(n)] => n.as_u64(),
                    [] => return Ok(Vec::new()),
                    _ => return Err(ExpressionError::Type("index must be an integer".into())),
                };
                Ok(position
                    .and_then(|p| usize::try_from(p).ok())
                    .and_then(|p| items.get(p).cloned())
                    .into_iter()
                    .collect())
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right, input),
        }
    }

    fn base(&self, base: Option<&Expr>, input: &[Value]) -> EvalResult {
        match base {
            Some(base) => self.evaluate(base, input),
            None => Ok(input.to_vec()),
        }
    }

    fn variable(&self, name: &str) -> EvalResult {
        match name {
            "resource" | "context" => Ok(vec![self.focus.clone()]),
            "bundle" | "rootResource" => Ok(vec![self.root.clone()]),
            _ => {
                let Some(text) = self.engine.shorthands.get(name) else {
                    return Err(ExpressionError::UnknownVariable(name.to_string()));
                };
                if self.depth >= MAX_SHORTHAND_DEPTH {
                    return Err(ExpressionError::RecursionLimit(name.to_string()));
                }
                let expr = self.engine.parse(text)?;
                let nested = Evaluator {
                    depth: self.depth + 1,
                    ..*self
                };
                nested.evaluate(&expr, std::slice::from_ref(self.focus))
            }
        }
    }

    fn function(&self, name: &str, args: &[Expr], input: &[Value]) -> EvalResult {
        match (name, args) {
            ("exists", []) => Ok(vec![Value::Bool(!input.is_empty())]),
            ("exists", [criteria]) => {
                let matched = self.filter(input, criteria)?;
                Ok(vec![Value::Bool(!matched.is_empty())])
            }
            ("empty", []) => Ok(vec![Value::Bool(input.is_empty())]),
            ("count", []) => Ok(vec![Value::from(input.len())]),
            ("first", []) => Ok(input.first().cloned().into_iter().collect()),
            ("last", []) => Ok(input.last().cloned().into_iter().collect()),
            ("tail", []) => Ok(input.iter().skip(1).cloned().collect()),
            ("distinct", []) => Ok(dedup(input.to_vec())),
            ("where", [criteria]) => self.filter(input, criteria),
            ("select", [projection]) => {
                let mut out = Vec::new();
                for item in input {
                    out.extend(self.evaluate(projection, std::slice::from_ref(item))?);
                }
                Ok(out)
            }
            ("all", [criteria]) => {
                for item in input {
                    let result = self.evaluate(criteria, std::slice::from_ref(item))?;
                    if as_bool(&result)? != Some(true) {
                        return Ok(vec![Value::Bool(false)]);
                    }
                }
                Ok(vec![Value::Bool(true)])
            }
            ("not", []) => Ok(as_bool(input)?
                .map(|b| Value::Bool(!b))
                .into_iter()
                .collect()),
            ("ofType", [type_name]) => {
                let type_name = type_specifier(type_name)
                    .ok_or_else(|| ExpressionError::arguments(name, "a type name"))?;
                Ok(input
                    .iter()
                    .filter(|item| is_type(item, type_name))
                    .cloned()
                    .collect())
            }
            ("extension", [url]) => {
                let url = self.string_arg(name, url, input)?;
                Ok(navigate(input, "extension", false)
                    .into_iter()
                    .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(url.as_str()))
                    .collect())
            }
            ("matches", [pattern]) => {
                let pattern = self.string_arg(name, pattern, input)?;
                let re = self.engine.regex(&pattern)?;
                string_fn(name, input, |s| Value::Bool(re.is_match(s)))
            }
            ("startsWith", [prefix]) => {
                let prefix = self.string_arg(name, prefix, input)?;
                string_fn(name, input, |s| Value::Bool(s.starts_with(prefix.as_str())))
            }
            ("endsWith", [suffix]) => {
                let suffix = self.string_arg(name, suffix, input)?;
                string_fn(name, input, |s| Value::Bool(s.ends_with(suffix.as_str())))
            }
            ("contains", [needle]) => {
                let needle = self.string_arg(name, needle, input)?;
                string_fn(name, input, |s| Value::Bool(s.contains(needle.as_str())))
            }
            ("lower", []) => string_fn(name, input, |s| Value::String(s.to_lowercase())),
            ("upper", []) => string_fn(name, input, |s| Value::String(s.to_uppercase())),
            ("length", []) => string_fn(name, input, |s| Value::from(s.chars().count())),
            ("toString", []) => Ok(singleton(name, input)?
                .and_then(scalar_string)
                .map(Value::String)
                .into_iter()
                .collect()),
            ("livdTableLookup", [column]) => self.livd_table_lookup(name, column, input),
            (
                "exists" | "empty" | "count" | "first" | "last" | "tail" | "distinct" | "where"
                | "select" | "all" | "not" | "ofType" | "extension" | "matches" | "startsWith"
                | "endsWith" | "contains" | "lower" | "upper" | "length" | "toString"
                | "livdTableLookup",
                _,
            ) => Err(ExpressionError::arguments(
                name,
                format!("a different number of arguments than {}", args.len()),
            )),
            _ => Err(ExpressionError::UnknownFunction(name.to_string())),
        }
    }

    /// Value of `column` in the device catalog row for the observation's device.
    fn livd_table_lookup(&self, name: &str, column: &Expr, input: &[Value]) -> EvalResult {
        let column = self.string_arg(name, column, input)?;
        let observation = match input {
            [item] if is_type(item, "Observation") => item,
            _ => {
                return Err(ExpressionError::Type(format!(
                    "{name}() must be called on a single Observation"
                )));
            }
        };
        let (table, devices) = self.engine.device_lookup()?;
        let query = device_query(observation, self.root);
        let found = devices
            .lookup(&table, &query, &column)
            .map_err(|e| ExpressionError::Lookup(e.to_string()))?;
        Ok(found.map(Value::String).into_iter().collect())
    }

    fn filter(&self, input: &[Value], criteria: &Expr) -> EvalResult {
        let mut out = Vec::new();
        for item in input {
            let result = self.evaluate(criteria, std::slice::from_ref(item))?;
            if as_bool(&result)? == Some(true) {
                out.push(item.clone());
            }
        }
        Ok(out)
    }

    fn string_arg(
        &self,
        function: &str,
        arg: &Expr,
        input: &[Value],
    ) -> Result<String, ExpressionError> {
        match self.evaluate(arg, input)?.as_slice() {
            [Value::String(s)] => Ok(s.clone()),
            _ => Err(ExpressionError::arguments(function, "a single string argument")),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr, input: &[Value]) -> EvalResult {
        let lhs = self.evaluate(left, input)?;
        match op {
            BinaryOp::And => {
                let l = as_bool(&lhs)?;
                if l == Some(false) {
                    return Ok(vec![Value::Bool(false)]);
                }
                let r = as_bool(&self.evaluate(right, input)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => vec![Value::Bool(false)],
                    (Some(true), Some(true)) => vec![Value::Bool(true)],
                    _ => Vec::new(),
                })
            }
            BinaryOp::Or => {
                let l = as_bool(&lhs)?;
                if l == Some(true) {
                    return Ok(vec![Value::Bool(true)]);
                }
                let r = as_bool(&self.evaluate(right, input)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => vec![Value::Bool(true)],
                    (Some(false), Some(false)) => vec![Value::Bool(false)],
                    _ => Vec::new(),
                })
            }
            BinaryOp::Xor => {
                let l = as_bool(&lhs)?;
                let r = as_bool(&self.evaluate(right, input)?)?;
                Ok(match (l, r) {
                    (Some(a), Some(b)) => vec![Value::Bool(a != b)],
                    _ => Vec::new(),
                })
            }
            BinaryOp::Implies => {
                let l = as_bool(&lhs)?;
                if l == Some(false) {
                    return Ok(vec![Value::Bool(true)]);
                }
                let r = as_bool(&self.evaluate(right, input)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => vec![Value::Bool(true)],
                    (Some(true), Some(false)) => vec![Value::Bool(false)],
                    _ => Vec::new(),
                })
            }
            _ => {
                let rhs = self.evaluate(right, input)?;
                compare(op, lhs, rhs)
            }
        }
    }
}

fn compare(op: BinaryOp, lhs: Collection, rhs: Collection) -> EvalResult {
    match op {
        BinaryOp::Union => {
            let mut all = lhs;
            all.extend(rhs);
            Ok(dedup(all))
        }
        BinaryOp::Eq | BinaryOp::NotEq => {
            if lhs.is_empty() || rhs.is_empty() {
                return Ok(Vec::new());
            }
            let equal = lhs.len() == rhs.len()
                && lhs.iter().zip(&rhs).all(|(a, b)| values_equal(a, b));
            Ok(vec![Value::Bool(equal == (op == BinaryOp::Eq))])
        }
        BinaryOp::In | BinaryOp::Contains => {
            let (element, collection) = if op == BinaryOp::In {
                (lhs, rhs)
            } else {
                (rhs, lhs)
            };
            match element.as_slice() {
                [] => Ok(Vec::new()),
                [item] => Ok(vec![Value::Bool(
                    collection.iter().any(|c| values_equal(item, c)),
                )]),
                _ => Err(ExpressionError::Type(
                    "membership test needs a single element".into(),
                )),
            }
        }
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let (a, b) = match (lhs.as_slice(), rhs.as_slice()) {
                ([], _) | (_, []) => return Ok(Vec::new()),
                ([a], [b]) => (a, b),
                _ => {
                    return Err(ExpressionError::Type(
                        "comparison needs single elements".into(),
                    ));
                }
            };
            let ordering = match (a, b) {
                (Value::Number(x), Value::Number(y)) => x
                    .as_f64()
                    .zip(y.as_f64())
                    .and_then(|(x, y)| x.partial_cmp(&y)),
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            }
            .ok_or_else(|| ExpressionError::Type(format!("cannot compare {a} with {b}")))?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Le => ordering.is_le(),
                _ => ordering.is_ge(),
            };
            Ok(vec![Value::Bool(result)])
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Implies => {
            Err(ExpressionError::Type(format!("{op:?} is not a comparison")))
        }
    }
}

/// Member navigation. A leading identifier that names the item's resource
/// type selects the item itself, so `Bundle.entry` works on a bundle.
fn navigate(input: &[Value], name: &str, leading: bool) -> Collection {
    let mut out = Vec::new();
    for item in input {
        let Value::Object(map) = item else {
            continue;
        };
        if leading && map.get("resourceType").and_then(Value::as_str) == Some(name) {
            out.push(item.clone());
            continue;
        }
        let found = map.get(name).or_else(|| choice_value(map, name));
        match found {
            Some(Value::Array(values)) => {
                out.extend(values.iter().filter(|v| !v.is_null()).cloned());
            }
            Some(Value::Null) | None => {}
            Some(value) => out.push(value.clone()),
        }
    }
    out
}

/// `value` resolves `valueString`, `valueCodeableConcept` and friends.
fn choice_value<'m>(map: &'m serde_json::Map<String, Value>, name: &str) -> Option<&'m Value> {
    map.iter()
        .find(|(key, _)| {
            key.strip_prefix(name)
                .and_then(|rest| rest.chars().next())
                .is_some_and(char::is_uppercase)
        })
        .map(|(_, value)| value)
}

fn text_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolves `Device/<id>` or a `fullUrl` against the entries of `bundle`.
fn resolve_reference<'b>(bundle: &'b Value, reference: &str) -> Option<&'b Value> {
    bundle
        .get("entry")?
        .as_array()?
        .iter()
        .find(|entry| {
            entry.get("fullUrl").and_then(Value::as_str) == Some(reference)
                || entry.get("resource").is_some_and(|resource| {
                    match (
                        resource.get("resourceType").and_then(Value::as_str),
                        resource.get("id").and_then(Value::as_str),
                    ) {
                        (Some(kind), Some(id)) => {
                            reference
                                .strip_prefix(kind)
                                .and_then(|r| r.strip_prefix('/'))
                                == Some(id)
                        }
                        _ => false,
                    }
                })
        })
        .and_then(|entry| entry.get("resource"))
}

/// What the observation and its referenced device say about the test device.
fn device_query(observation: &Value, bundle: &Value) -> DeviceQuery {
    let device = observation
        .pointer("/device/reference")
        .and_then(Value::as_str)
        .and_then(|reference| resolve_reference(bundle, reference));
    DeviceQuery {
        device_id: text_at(observation, "/method/coding/0/code"),
        equipment_model_id: device.and_then(|d| {
            text_at(d, "/identifier/0/value").or_else(|| text_at(d, "/identifier/0/id"))
        }),
        equipment_model_name: device.and_then(|d| text_at(d, "/deviceName/0/name")),
        test_performed_code: text_at(observation, "/code/coding/0/code"),
        ..DeviceQuery::default()
    }
}

fn type_specifier(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Member { name, .. } => Some(name.as_str()),
        Expr::Literal(Literal::Str(name)) => Some(name.as_str()),
        _ => None,
    }
}

fn is_type(item: &Value, type_name: &str) -> bool {
    match (item, type_name) {
        (Value::String(_), "string" | "String" | "code" | "uri") => true,
        (Value::Bool(_), "boolean" | "Boolean") => true,
        (Value::Number(n), "integer" | "Integer") => n.is_i64() || n.is_u64(),
        (Value::Number(_), "decimal" | "Decimal") => true,
        (Value::Object(map), _) => {
            map.get("resourceType").and_then(Value::as_str) == Some(type_name)
        }
        _ => false,
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Str(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Number(n) => number_value(*n),
    }
}

/// Integral literals become JSON integers so they compare equal to resource
/// values like `"sequence": 2`.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn dedup(values: Collection) -> Collection {
    let mut out: Collection = Vec::with_capacity(values.len());
    for value in values {
        if !out.iter().any(|seen| values_equal(seen, &value)) {
            out.push(value);
        }
    }
    out
}

/// Boolean view of a collection: empty is unknown, a single boolean is its
/// value, and any other single item counts as `true`.
fn as_bool(values: &[Value]) -> Result<Option<bool>, ExpressionError> {
    match values {
        [] => Ok(None),
        [Value::Bool(b)] => Ok(Some(*b)),
        [_] => Ok(Some(true)),
        _ => Err(ExpressionError::Type(format!(
            "expected a single boolean, found {} items",
            values.len()
        ))),
    }
}

fn singleton<'v>(function: &str, input: &'v [Value]) -> Result<Option<&'v Value>, ExpressionError> {
    match input {
        [] => Ok(None),
        [item] => Ok(Some(item)),
        _ => Err(ExpressionError::Type(format!(
            "{function}() needs a single input item, found {}",
            input.len()
        ))),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_fn(function: &str, input: &[Value], f: impl Fn(&str) -> Value) -> EvalResult {
    match singleton(function, input)? {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![f(s)]),
        Some(other) => Err(ExpressionError::Type(format!(
            "{function}() needs a string, found {other}"
        ))),
    }
}
