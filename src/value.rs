/// Scalar values and rows.
///
/// A `ColumnValue` is one cell; a `Row` is an ordered mapping from column key
/// to value. Rows keep the key order they were built with, which is also the
/// order used when they are serialized back to JSON.
///
/// # Ordering
///
/// `ColumnValue::compare` is the pairwise ordering used by filters:
/// numbers compare numerically (Int and Float mix freely), strings compare
/// case-insensitively with a code-point tie-break, booleans order
/// `false < true`, timestamps by milliseconds. Values of different kinds fall
/// back to comparing their string rendering. Null handling is left to callers
/// (`compare_nulls_last`).

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// JSON object key marking a timestamp: `{"$date": 1700000000000}`.
pub const DATE_TAG: &str = "$date";

static NULL_VALUE: ColumnValue = ColumnValue::Null;

/// Column value enum to support multiple types
#[derive(Debug, Clone, Default)]
pub enum ColumnValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
}

/// Coarse kind of a value, used to decide whether a column is homogeneous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Timestamp,
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ColumnValue::Null => ValueKind::Null,
            ColumnValue::Bool(_) => ValueKind::Bool,
            ColumnValue::Int(_) | ColumnValue::Float(_) => ValueKind::Number,
            ColumnValue::String(_) => ValueKind::String,
            ColumnValue::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Numeric view of the value. Only Int and Float are numeric; strings
    /// that look like numbers are not coerced.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Int(v) => Some(*v as f64),
            ColumnValue::Float(v) if !v.is_nan() => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ColumnValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String rendering used for text operators, labels and mixed-type
    /// comparison. Null renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            ColumnValue::Null => String::new(),
            ColumnValue::Bool(v) => v.to_string(),
            ColumnValue::Int(v) => v.to_string(),
            ColumnValue::Float(v) => format_float(*v),
            ColumnValue::String(v) => v.clone(),
            ColumnValue::Timestamp(v) => v.to_string(),
        }
    }

    /// Type-appropriate comparison of two non-null values.
    pub fn compare(&self, other: &ColumnValue) -> Ordering {
        match (self, other) {
            (ColumnValue::Int(a), ColumnValue::Int(b)) => a.cmp(b),
            (ColumnValue::Int(_) | ColumnValue::Float(_), ColumnValue::Int(_) | ColumnValue::Float(_)) => {
                compare_f64(self.as_f64_raw(), other.as_f64_raw())
            }
            (ColumnValue::String(a), ColumnValue::String(b)) => collate(a, b),
            (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a.cmp(b),
            (ColumnValue::Timestamp(a), ColumnValue::Timestamp(b)) => a.cmp(b),
            (ColumnValue::Null, ColumnValue::Null) => Ordering::Equal,
            (a, b) => collate(&a.render(), &b.render()),
        }
    }

    /// Comparison with nulls ordered after every non-null value.
    pub fn compare_nulls_last(&self, other: &ColumnValue) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.compare(other),
        }
    }

    fn as_f64_raw(&self) -> f64 {
        match self {
            ColumnValue::Int(v) => *v as f64,
            ColumnValue::Float(v) => *v,
            _ => f64::NAN,
        }
    }

    /// Convert a JSON value. Integral numbers become `Int`, other numbers
    /// `Float`, `{"$date": ms}` becomes `Timestamp`. Arrays and other objects
    /// are kept as their JSON text.
    pub fn from_json(value: &JsonValue) -> ColumnValue {
        match value {
            JsonValue::Null => ColumnValue::Null,
            JsonValue::Bool(b) => ColumnValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ColumnValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    ColumnValue::Float(f)
                } else {
                    ColumnValue::Null
                }
            }
            JsonValue::String(s) => ColumnValue::String(s.clone()),
            JsonValue::Object(map) => match (map.len(), map.get(DATE_TAG)) {
                (1, Some(JsonValue::Number(ms))) => ms
                    .as_i64()
                    .or_else(|| ms.as_f64().map(|f| f as i64))
                    .map(ColumnValue::Timestamp)
                    .unwrap_or(ColumnValue::Null),
                _ => ColumnValue::String(value.to_string()),
            },
            JsonValue::Array(_) => ColumnValue::String(value.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ColumnValue::Null => JsonValue::Null,
            ColumnValue::Bool(v) => JsonValue::Bool(*v),
            ColumnValue::Int(v) => JsonValue::Number((*v).into()),
            ColumnValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ColumnValue::String(v) => JsonValue::String(v.clone()),
            ColumnValue::Timestamp(v) => {
                let mut map = serde_json::Map::new();
                map.insert(DATE_TAG.to_string(), JsonValue::Number((*v).into()));
                JsonValue::Object(map)
            }
        }
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

/// Case-insensitive string ordering with a code-point tie-break, so distinct
/// strings never compare equal.
pub fn collate(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| a.cmp(b))
}

/// True when the non-null values span more than one kind. Such a set is
/// ordered by rendering so the order stays total.
pub fn is_mixed<'a>(values: impl IntoIterator<Item = &'a ColumnValue>) -> bool {
    let mut first: Option<ValueKind> = None;
    for value in values {
        if value.is_null() {
            continue;
        }
        match first {
            None => first = Some(value.kind()),
            Some(kind) if kind != value.kind() => return true,
            Some(_) => {}
        }
    }
    false
}

/// Ordering of two values from the same set: nulls last regardless of
/// direction, `mixed` sets compared by collated rendering.
pub fn compare_in_set(a: &ColumnValue, b: &ColumnValue, mixed: bool, descending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = if mixed {
                collate(&a.render(), &b.render())
            } else {
                a.compare(b)
            };
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

/// Sort a set of values, nulls last.
pub fn sort_values(values: &mut [ColumnValue], descending: bool) {
    let mixed = is_mixed(values.iter());
    values.sort_by(|a, b| compare_in_set(a, b, mixed, descending));
}

impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ColumnValue::Null, ColumnValue::Null) => true,
            (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a == b,
            (ColumnValue::Int(a), ColumnValue::Int(b)) => a == b,
            (ColumnValue::Int(_) | ColumnValue::Float(_), ColumnValue::Int(_) | ColumnValue::Float(_)) => {
                canonical_bits(self.as_f64_raw()) == canonical_bits(other.as_f64_raw())
            }
            (ColumnValue::String(a), ColumnValue::String(b)) => a == b,
            (ColumnValue::Timestamp(a), ColumnValue::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ColumnValue {}

impl Hash for ColumnValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        match self {
            ColumnValue::Null => {}
            ColumnValue::Bool(v) => v.hash(state),
            ColumnValue::Int(_) | ColumnValue::Float(_) => canonical_bits(self.as_f64_raw()).hash(state),
            ColumnValue::String(v) => v.hash(state),
            ColumnValue::Timestamp(v) => v.hash(state),
        }
    }
}

/// Bit pattern with -0.0 folded into 0.0 and every NaN folded into one.
fn canonical_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::String(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::String(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Int(v as i64)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_unit(),
            ColumnValue::Bool(v) => serializer.serialize_bool(*v),
            ColumnValue::Int(v) => serializer.serialize_i64(*v),
            ColumnValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            ColumnValue::Float(_) => serializer.serialize_unit(),
            ColumnValue::String(v) => serializer.serialize_str(v),
            ColumnValue::Timestamp(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(DATE_TAG, v)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ColumnValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(ColumnValue::from_json(&json))
    }
}

/// One row: column key to value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(String, ColumnValue)>,
}

impl Row {
    pub fn new() -> Self {
        Row { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Row {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Sets `key` to `value`, replacing an existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: ColumnValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ColumnValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Value for `key`, reading absent keys as null.
    pub fn value(&self, key: &str) -> &ColumnValue {
        self.get(key).unwrap_or(&NULL_VALUE)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ColumnValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, ColumnValue)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON object mapping column keys to scalar values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
        let mut row = Row::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, ColumnValue>()? {
            row.insert(key, value);
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

/// Convert a JSON row object. Non-object values are rejected.
pub fn row_from_json(value: &JsonValue) -> Result<Row, String> {
    match value {
        JsonValue::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), ColumnValue::from_json(v)))
            .collect()),
        other => Err(format!("row must be an object, got {}", other)),
    }
}
